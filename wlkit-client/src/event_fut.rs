//! One-shot futures over protocol events and connection termination.
//!
//! The connection only holds weak references to pending futures, so a
//! dropped future costs nothing and cancellation never extends lifetimes.

use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::connection::{DetachReason, TerminateReason};

pub(crate) enum FutState<T> {
    Pending(Option<Waker>),
    Ready(T),
    Cancelled(DetachReason),
    Taken,
}

pub(crate) struct Shared<T> {
    state: Mutex<FutState<T>>,
}

impl<T> Shared<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FutState::Pending(None)),
        })
    }

    /// Resolve the future if it is still pending.
    pub fn resolve(&self, value: T) {
        let mut state = self.state.lock().unwrap();
        if let FutState::Pending(waker) = &mut *state {
            let waker = waker.take();
            *state = FutState::Ready(value);
            drop(state);
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

/// Type-erased cancellation, so the object table can hold futures of any
/// event type.
pub(crate) trait Cancellable {
    fn cancel_with(&self, reason: &DetachReason);
}

impl<T> Cancellable for Shared<T> {
    fn cancel_with(&self, reason: &DetachReason) {
        let mut state = self.state.lock().unwrap();
        if let FutState::Pending(waker) = &mut *state {
            let waker = waker.take();
            *state = FutState::Cancelled(reason.clone());
            drop(state);
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

/// The awaited proxy was detached or the connection terminated before the
/// event arrived.
#[derive(Debug, Clone)]
pub struct Cancelled(pub DetachReason);

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event future cancelled: {}", self.0)
    }
}

impl std::error::Error for Cancelled {}

/// Resolves with the next matching event, created by
/// [`Connection::event_future`](crate::Connection::event_future).
///
/// The future only completes while the connection is being driven
/// (`recv_events` + `dispatch_events`, or their async variants).
pub struct EventFut<T> {
    pub(crate) shared: Arc<Shared<T>>,
}

impl<T> EventFut<T> {
    /// Non-blocking check: the result if the future already completed.
    pub fn try_take(&self) -> Option<Result<T, Cancelled>> {
        let mut state = self.shared.state.lock().unwrap();
        match &*state {
            FutState::Pending(_) => None,
            FutState::Cancelled(reason) => Some(Err(Cancelled(reason.clone()))),
            FutState::Ready(_) => {
                let FutState::Ready(value) = mem::replace(&mut *state, FutState::Taken) else {
                    unreachable!()
                };
                Some(Ok(value))
            }
            FutState::Taken => panic!("event future already consumed"),
        }
    }
}

impl<T> Future for EventFut<T> {
    type Output = Result<T, Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock().unwrap();
        match &mut *state {
            FutState::Pending(waker) => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
            FutState::Cancelled(reason) => Poll::Ready(Err(Cancelled(reason.clone()))),
            FutState::Ready(_) => {
                let FutState::Ready(value) = mem::replace(&mut *state, FutState::Taken) else {
                    unreachable!()
                };
                Poll::Ready(Ok(value))
            }
            FutState::Taken => panic!("event future polled after completion"),
        }
    }
}

/// Resolves with the termination reason once
/// [`Connection::terminate_with`](crate::Connection::terminate_with) (or a
/// fatal error) has run. Created by
/// [`Connection::on_terminated`](crate::Connection::on_terminated).
pub struct Terminated {
    pub(crate) shared: Arc<Shared<TerminateReason>>,
}

impl Future for Terminated {
    type Output = TerminateReason;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock().unwrap();
        match &mut *state {
            FutState::Pending(waker) => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
            FutState::Ready(_) => {
                let FutState::Ready(reason) = mem::replace(&mut *state, FutState::Taken) else {
                    unreachable!()
                };
                Poll::Ready(reason)
            }
            // Termination futures are resolved, never cancelled.
            FutState::Cancelled(_) | FutState::Taken => {
                panic!("termination future polled after completion")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Wake;

    struct Flag(std::sync::atomic::AtomicBool);

    impl Wake for Flag {
        fn wake(self: Arc<Self>) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn poll_once<F: Future + Unpin>(fut: &mut F) -> (Poll<F::Output>, Arc<Flag>) {
        let flag = Arc::new(Flag(std::sync::atomic::AtomicBool::new(false)));
        let waker = Waker::from(Arc::clone(&flag));
        let mut cx = Context::from_waker(&waker);
        (Pin::new(fut).poll(&mut cx), flag)
    }

    #[test]
    fn resolve_wakes_and_completes() {
        let shared = Shared::new();
        let mut fut = EventFut {
            shared: Arc::clone(&shared),
        };

        let (poll, flag) = poll_once(&mut fut);
        assert!(poll.is_pending());

        shared.resolve(7u32);
        assert!(flag.0.load(std::sync::atomic::Ordering::SeqCst));

        let (poll, _) = poll_once(&mut fut);
        assert!(matches!(poll, Poll::Ready(Ok(7))));
    }

    #[test]
    fn cancel_yields_the_reason() {
        let shared = Shared::<u32>::new();
        let fut = EventFut {
            shared: Arc::clone(&shared),
        };

        shared.cancel_with(&DetachReason::Deleted);
        // Resolving after cancellation is a no-op.
        shared.resolve(1);

        match fut.try_take() {
            Some(Err(Cancelled(DetachReason::Deleted))) => (),
            other => panic!("unexpected state: {:?}", other.map(|r| r.map(|_| ()))),
        }
    }

    #[test]
    fn try_take_consumes_once() {
        let shared = Shared::new();
        let fut = EventFut {
            shared: Arc::clone(&shared),
        };
        assert!(fut.try_take().is_none());
        shared.resolve("done");
        assert!(matches!(fut.try_take(), Some(Ok("done"))));
    }
}
