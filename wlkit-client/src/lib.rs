//! A from-scratch Wayland client library.
//!
//! [`Connection`] owns the socket and every protocol object created over
//! it. Requests are typed methods on generated proxies, events are
//! delivered through per-event handler slots or one-shot [`EventFut`]
//! futures, and the registry's globals are tracked automatically.
//!
//! Set `WAYLAND_DEBUG=1` to trace every request and event on stderr.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod connection;
pub mod global;
pub mod object;

mod event_fut;
mod scoped;

/// Bindings for the core Wayland protocol.
pub mod protocol {
    crate::generate!("protocols/wayland.xml");
}

pub use wlkit_core as core;
pub use wlkit_scanner::generate;

pub use connection::{
    CallError, ConnectError, Connection, DetachReason, HandlerResult, RawHandler,
    TerminateReason, UsageError,
};
pub use event_fut::{Cancelled, EventFut, Terminated};
pub use global::{BindError, Global};
pub use scoped::{Destroy, Scoped};
pub use wlkit_core::IoMode;

/// Context handed to typed event handlers: the connection, the caller's
/// state, and the proxy the event arrived on.
pub struct EventCtx<'a, D, P> {
    pub conn: &'a mut Connection<D>,
    pub state: &'a mut D,
    pub proxy: P,
}
