//! The Wayland connection engine.
//!
//! [`Connection`] is the single owner of the socket, the object table and
//! both message queues. Inbound events are queued by [`recv_events`] and
//! delivered by [`dispatch_events`]; outbound requests are queued by the
//! generated proxy methods and transmitted by [`flush`].
//!
//! [`recv_events`]: Connection::recv_events
//! [`dispatch_events`]: Connection::dispatch_events
//! [`flush`]: Connection::flush

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::env;
use std::ffi::{CStr, CString};
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::num::NonZeroU32;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use wlkit_core::transport::{
    BufferedSocket, RecvMessageError, SendError, SendMessageError,
};
use wlkit_core::{
    ArgType, ArgValue, Interface, IoMode, Message, MessageBuffersPool, MessageDesc, ObjectId,
};

use crate::event_fut::{Cancellable, EventFut, Shared, Terminated};
use crate::global::Global;
use crate::object::{Object, ObjectManager, Proxy};
use crate::protocol::*;
use crate::EventCtx;

#[cfg(feature = "tokio")]
use tokio::io::unix::AsyncFd;

/// Failed to establish a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// `$XDG_RUNTIME_DIR` must be set unless `$WAYLAND_DISPLAY` is an
    /// absolute path.
    #[error("$XDG_RUNTIME_DIR is not set")]
    NoRuntimeDir,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// API misuse, reported to the caller. The connection stays usable.
#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("connection has been terminated")]
    Terminated,
    #[error("object {0} does not exist")]
    NoSuchObject(ObjectId),
    #[error("{0:?} has not been attached yet")]
    NotAttached(Object),
    #[error("{0:?} has already been attached")]
    AlreadyAttached(Object),
    #[error("{0:?} has been detached")]
    Detached(Object),
    #[error("{0:?} has already been destroyed")]
    Destroyed(Object),
    #[error("{0:?} implements the wrong interface, expected {1:?}")]
    InterfaceMismatch(Object, &'static CStr),
    #[error("{0:?} has no request named `{1}`")]
    UnknownRequest(Object, String),
    #[error("{0:?} has no event named `{1}`")]
    UnknownEvent(Object, String),
    #[error("wl_registry events are tracked by the connection and cannot take handlers")]
    RegistryHandler,
}

/// Failure of the dynamic, descriptor-driven call path.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error("`{request}` takes {expected} arguments ({given} given)")]
    WrongArgumentCount {
        request: String,
        expected: usize,
        given: usize,
    },
    #[error("argument {index} of `{request}`: expected {expected}")]
    BadArgument {
        request: String,
        index: usize,
        expected: &'static str,
    },
}

/// Why a connection was shut down.
#[derive(Debug, Clone)]
pub enum TerminateReason {
    /// The compositor reported a fatal protocol error (`wl_display.error`).
    PeerError {
        object_id: ObjectId,
        code: u32,
        message: CString,
    },
    /// An I/O failure on the socket.
    Transport(io::ErrorKind),
    /// The peer closed the connection.
    ConnectionClosed,
    /// The connection value was dropped.
    Dropped,
    /// An explicit [`Connection::terminate`] call.
    Requested(Cow<'static, str>),
}

impl fmt::Display for TerminateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerError {
                object_id,
                code,
                message,
            } => write!(
                f,
                "compositor error on object {object_id} (code {code}): {}",
                message.to_string_lossy()
            ),
            Self::Transport(kind) => write!(f, "transport error: {kind}"),
            Self::ConnectionClosed => f.write_str("connection closed by peer"),
            Self::Dropped => f.write_str("connection dropped"),
            Self::Requested(msg) => f.write_str(msg),
        }
    }
}

/// Why a proxy was detached.
#[derive(Debug, Clone)]
pub enum DetachReason {
    Terminated(TerminateReason),
    /// Deletion was acknowledged by the compositor (`delete_id`).
    Deleted,
    /// The bound global disappeared (`wl_registry.global_remove`).
    GlobalRemoved,
}

impl fmt::Display for DetachReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminated(reason) => write!(f, "connection terminated: {reason}"),
            Self::Deleted => f.write_str("object deleted by the compositor"),
            Self::GlobalRemoved => f.write_str("global removed"),
        }
    }
}

/// Outcome of an event handler: `Ok(true)` keeps the handler installed,
/// `Ok(false)` removes it, `Err` removes it and logs the error.
pub type HandlerResult = Result<bool, Box<dyn std::error::Error + Send + Sync>>;

/// An untyped event handler occupying one opcode slot of one object.
pub type RawHandler<D> =
    Box<dyn FnMut(&mut Connection<D>, &mut D, Object, Message) -> HandlerResult + Send>;

pub(crate) enum QueuedEvent {
    DeleteId(ObjectId),
    Message(Message),
}

/// Wayland connection state: socket, object table, queues, globals.
///
/// `D` is the caller's state type, passed to every event handler.
pub struct Connection<D> {
    #[cfg(feature = "tokio")]
    async_fd: Option<AsyncFd<RawFd>>,

    socket: BufferedSocket<UnixStream>,
    pub(crate) msg_pool: MessageBuffersPool,

    pub(crate) object_mgr: ObjectManager<D>,

    event_queue: VecDeque<QueuedEvent>,
    requests_queue: VecDeque<Message>,

    registry: WlRegistry,
    pub(crate) globals: Vec<Global>,
    pub(crate) shm_formats: Vec<u32>,

    /// interface name → descriptor, for materializing proxies from inbound
    /// interface-less `new_id`s.
    interfaces: HashMap<&'static CStr, &'static Interface>,

    terminated: Option<TerminateReason>,
    terminate_futs: Vec<Weak<Shared<TerminateReason>>>,

    debug: bool,
}

impl<D> AsRawFd for Connection<D> {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl<D> Connection<D> {
    /// Connect to the compositor socket named by the environment and wait
    /// for the initial burst of registry globals.
    ///
    /// The socket path is `$XDG_RUNTIME_DIR/$WAYLAND_DISPLAY` with
    /// `wayland-0` as the display default; an absolute `$WAYLAND_DISPLAY`
    /// is used verbatim.
    pub fn connect() -> Result<Self, ConnectError> {
        Self::from_stream(UnixStream::connect(Self::socket_path()?)?)
    }

    /// Run a connection over an already-connected stream. Performs the
    /// same initial roundtrip as [`connect`](Self::connect).
    pub fn from_stream(stream: UnixStream) -> Result<Self, ConnectError> {
        let mut this = Self::new(stream);
        this.blocking_roundtrip()?;
        Ok(this)
    }

    /// Async version of [`connect`](Self::connect).
    #[cfg(feature = "tokio")]
    #[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
    pub async fn async_connect() -> Result<Self, ConnectError> {
        let mut this = Self::new(UnixStream::connect(Self::socket_path()?)?);
        this.async_roundtrip().await?;
        Ok(this)
    }

    fn socket_path() -> Result<PathBuf, ConnectError> {
        let display = env::var_os("WAYLAND_DISPLAY").unwrap_or_else(|| "wayland-0".into());
        let display = PathBuf::from(display);
        if display.is_absolute() {
            return Ok(display);
        }

        let runtime_dir = env::var_os("XDG_RUNTIME_DIR").ok_or(ConnectError::NoRuntimeDir)?;
        let mut path = PathBuf::from(runtime_dir);
        path.push(display);
        Ok(path)
    }

    fn new(stream: UnixStream) -> Self {
        let mut this = Self {
            #[cfg(feature = "tokio")]
            async_fd: None,

            socket: BufferedSocket::from(stream),
            msg_pool: MessageBuffersPool::default(),

            object_mgr: ObjectManager::new(),

            event_queue: VecDeque::with_capacity(32),
            requests_queue: VecDeque::with_capacity(32),

            // Placeholder until get_registry below.
            registry: WlRegistry::new(ObjectId::MAX_CLIENT, 1),
            globals: Vec::new(),
            shm_formats: Vec::new(),

            interfaces: HashMap::new(),

            terminated: None,
            terminate_futs: Vec::new(),

            debug: env::var_os("WAYLAND_DEBUG").is_some(),
        };

        this.register_interfaces(crate::protocol::INTERFACES);
        this.registry = WlDisplay::INSTANCE
            .get_registry(&mut this)
            .expect("fresh connection");
        this
    }

    /// The singleton registry. Its events cannot take handlers; the
    /// connection tracks them in [`globals`](Self::globals).
    pub fn registry(&self) -> WlRegistry {
        self.registry
    }

    /// Every global currently advertised by the compositor, including ones
    /// received but not yet dispatched.
    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    /// Pixel formats advertised by a bound `wl_shm` global, in raw
    /// `wl_shm.format` values.
    pub fn shm_formats(&self) -> &[u32] {
        &self.shm_formats
    }

    /// Make interface descriptors known to this connection so that
    /// server-created objects of these types can be materialized. The core
    /// protocol is pre-registered.
    pub fn register_interfaces(&mut self, interfaces: &[&'static Interface]) {
        for &iface in interfaces {
            self.interfaces.insert(iface.name, iface);
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_some()
    }

    pub fn terminate_reason(&self) -> Option<&TerminateReason> {
        self.terminated.as_ref()
    }

    /// Shut the connection down with a caller-provided reason.
    /// See [`terminate_with`](Self::terminate_with).
    pub fn terminate(&mut self, reason: impl Into<Cow<'static, str>>) {
        self.terminate_with(TerminateReason::Requested(reason.into()));
    }

    /// Shut the connection down: close the socket, drop any unconsumed
    /// inbound descriptors, detach every proxy (cancelling its pending
    /// futures with the reason) and resolve termination futures.
    ///
    /// Idempotent; only the first reason is kept. Every subsequent request
    /// fails with [`UsageError::Terminated`].
    pub fn terminate_with(&mut self, reason: TerminateReason) {
        if self.terminated.is_some() {
            return;
        }
        self.terminated = Some(reason.clone());

        let _ = self.socket.transport().shutdown(Shutdown::Both);
        self.socket.discard_pending();
        self.requests_queue.clear();
        self.event_queue.clear();

        self.object_mgr
            .detach_all(&DetachReason::Terminated(reason.clone()));

        for waiter in self.terminate_futs.drain(..) {
            if let Some(shared) = waiter.upgrade() {
                shared.resolve(reason.clone());
            }
        }
    }

    /// A future resolving with the reason once the connection terminates.
    /// Resolves immediately if it already has.
    pub fn on_terminated(&mut self) -> Terminated {
        let shared = Shared::new();
        match &self.terminated {
            Some(reason) => shared.resolve(reason.clone()),
            None => self.terminate_futs.push(Arc::downgrade(&shared)),
        }
        Terminated { shared }
    }

    /// Allocate a proxy of an arbitrary runtime interface, for use with
    /// the dynamic [`call_by_name`](Self::call_by_name) path.
    pub fn create_object(&mut self, interface: &'static Interface, version: u32) -> Object {
        self.object_mgr.alloc_client_object(interface, version).object
    }

    #[doc(hidden)]
    pub fn allocate_new_object<P: Proxy>(&mut self, version: u32) -> P {
        let state = self.object_mgr.alloc_client_object(P::INTERFACE, version);
        P::new(state.object.id, version)
    }

    /// Roll back an allocation whose request failed to submit. The peer
    /// never saw the id, so it is immediately reusable.
    #[doc(hidden)]
    pub fn cancel_new_object(&mut self, id: ObjectId) {
        self.object_mgr.discard_unsent(id);
    }

    #[doc(hidden)]
    pub fn alloc_msg_args(&mut self) -> Vec<ArgValue> {
        self.msg_pool.get_args()
    }

    /// Validate and queue an outbound request.
    ///
    /// The target must be attached and neither destroyed nor detached.
    /// Every `new_id` argument attaches its (so far unattached) object;
    /// object arguments must be live. A destructor request marks the
    /// target destroyed, but its id is only recycled on `delete_id`.
    #[doc(hidden)]
    pub fn send_request(
        &mut self,
        iface: &'static Interface,
        request: Message,
    ) -> Result<(), UsageError> {
        if self.terminated.is_some() {
            return Err(UsageError::Terminated);
        }

        let target_id = request.header.object_id;
        let target = self
            .object_mgr
            .get_object(target_id)
            .ok_or(UsageError::NoSuchObject(target_id))?;
        let object = target.object;
        if target.is_detached {
            return Err(UsageError::Detached(object));
        }
        if target.is_destroyed {
            return Err(UsageError::Destroyed(object));
        }
        if !target.is_attached {
            return Err(UsageError::NotAttached(object));
        }

        let desc = &iface.requests[request.header.opcode as usize];

        // Validate arguments without mutating anything, so a failed call
        // leaves no trace.
        for (arg, arg_type) in request.args.iter().zip(desc.signature) {
            match arg {
                ArgValue::NewId(id) | ArgValue::AnyNewId(_, _, id) => {
                    let state = self
                        .object_mgr
                        .get_object(*id)
                        .ok_or(UsageError::NoSuchObject(*id))?;
                    if state.is_attached {
                        return Err(UsageError::AlreadyAttached(state.object));
                    }
                    if let ArgType::NewId(expected) = arg_type {
                        if state.object.interface != *expected {
                            return Err(UsageError::InterfaceMismatch(
                                state.object,
                                expected.name,
                            ));
                        }
                    }
                }
                ArgValue::Object(id) | ArgValue::OptObject(Some(id)) => {
                    let state = self
                        .object_mgr
                        .get_object(*id)
                        .ok_or(UsageError::NoSuchObject(*id))?;
                    if state.is_detached {
                        return Err(UsageError::Detached(state.object));
                    }
                    if state.is_destroyed {
                        return Err(UsageError::Destroyed(state.object));
                    }
                }
                _ => (),
            }
        }

        // Encoding a new_id is the attach point, exactly once per object.
        for arg in &request.args {
            if let ArgValue::NewId(id) | ArgValue::AnyNewId(_, _, id) = arg {
                self.object_mgr.get_object_mut(*id).unwrap().is_attached = true;
            }
        }

        if self.debug {
            eprintln!("[wlkit]  -> {}", DisplayMessage::new(&request, object, desc));
        }

        if desc.is_destructor {
            self.object_mgr
                .get_object_mut(target_id)
                .unwrap()
                .is_destroyed = true;
        }

        self.requests_queue.push_back(request);
        Ok(())
    }

    /// Submit a request by name, with arguments checked against the
    /// interface descriptor at runtime. The typed proxy methods are the
    /// usual way to send requests; this is the descriptor-driven fallback
    /// for code that only has an [`Object`].
    pub fn call_by_name(
        &mut self,
        object: Object,
        request: &str,
        args: Vec<ArgValue>,
    ) -> Result<(), CallError> {
        let (opcode, desc) = object
            .interface
            .request_by_name(request)
            .ok_or_else(|| UsageError::UnknownRequest(object, request.to_owned()))?;

        if args.len() != desc.signature.len() {
            return Err(CallError::WrongArgumentCount {
                request: request.to_owned(),
                expected: desc.signature.len(),
                given: args.len(),
            });
        }
        for (index, (arg, arg_type)) in args.iter().zip(desc.signature).enumerate() {
            if !arg_matches(arg, arg_type) {
                return Err(CallError::BadArgument {
                    request: request.to_owned(),
                    index,
                    expected: arg_type_name(arg_type),
                });
            }
        }

        self.send_request(
            object.interface,
            Message {
                header: wlkit_core::MessageHeader {
                    object_id: object.id,
                    size: 0,
                    opcode,
                },
                args,
            },
        )?;
        Ok(())
    }

    /// Install an untyped handler for `event` by name, returning the
    /// previous occupant of the slot (handler or pending future resolver).
    pub fn on_raw(
        &mut self,
        object: Object,
        event: &str,
        handler: RawHandler<D>,
    ) -> Result<Option<RawHandler<D>>, UsageError> {
        let (opcode, _) = object
            .interface
            .event_by_name(event)
            .ok_or_else(|| UsageError::UnknownEvent(object, event.to_owned()))?;
        self.set_raw_handler(object, opcode, handler)
    }

    #[doc(hidden)]
    pub fn set_raw_handler(
        &mut self,
        object: Object,
        opcode: u16,
        handler: RawHandler<D>,
    ) -> Result<Option<RawHandler<D>>, UsageError> {
        if object.interface == WlRegistry::INTERFACE {
            return Err(UsageError::RegistryHandler);
        }

        let state = self
            .object_mgr
            .get_object_mut(object.id)
            .ok_or(UsageError::NoSuchObject(object.id))?;
        if state.is_detached {
            return Err(UsageError::Detached(state.object));
        }

        let slot = state
            .handlers
            .get_mut(opcode as usize)
            .ok_or_else(|| UsageError::UnknownEvent(object, format!("opcode {opcode}")))?;
        Ok(std::mem::replace(slot, Some(handler)))
    }

    /// Wrap a typed per-event callback into a raw slot handler. Used by
    /// the generated `on_<event>` installers.
    #[doc(hidden)]
    pub fn install_handler<P, T, X, F>(
        &mut self,
        proxy: P,
        opcode: u16,
        extract: X,
        mut cb: F,
    ) -> Result<Option<RawHandler<D>>, UsageError>
    where
        P: Proxy,
        T: 'static,
        X: Fn(P::Event) -> Option<T> + Send + 'static,
        F: FnMut(EventCtx<'_, D, P>, T) -> HandlerResult + Send + 'static,
    {
        let raw: RawHandler<D> = Box::new(move |conn, state, object, event| {
            let proxy =
                P::try_from(object).map_err(|_| "event for object of unexpected interface")?;
            let event = P::parse_event(event, object.version, &mut conn.msg_pool)
                .map_err(|_| "malformed event payload")?;
            let Some(payload) = extract(event) else {
                return Err("handler installed on mismatched opcode".into());
            };
            cb(
                EventCtx {
                    conn,
                    state,
                    proxy,
                },
                payload,
            )
        });
        self.set_raw_handler(proxy.into(), opcode, raw)
    }

    /// A future resolving with the next `event` delivered to `proxy`.
    ///
    /// The resolver occupies the event's handler slot until the event
    /// arrives; the future is cancelled with the reason if the proxy is
    /// detached or the connection terminates first.
    pub fn event_future<P: Proxy>(
        &mut self,
        proxy: P,
        event: &str,
    ) -> Result<EventFut<P::Event>, UsageError>
    where
        P::Event: Send + 'static,
    {
        let object: Object = proxy.into();
        let (opcode, _) = object
            .interface
            .event_by_name(event)
            .ok_or_else(|| UsageError::UnknownEvent(object, event.to_owned()))?;

        let shared = Shared::new();
        let resolver = Arc::clone(&shared);
        let raw: RawHandler<D> = Box::new(move |conn, _state, object, event| {
            match P::parse_event(event, object.version, &mut conn.msg_pool) {
                Ok(parsed) => {
                    resolver.resolve(parsed);
                    Ok(false)
                }
                Err(_) => Err("malformed event payload".into()),
            }
        });
        self.set_raw_handler(object, opcode, raw)?;

        let state = self
            .object_mgr
            .get_object_mut(object.id)
            .expect("validated by set_raw_handler");
        state.futures.retain(|fut| fut.strong_count() > 0);
        state
            .futures
            .push(Arc::downgrade(&shared) as Weak<dyn Cancellable + Send + Sync>);

        Ok(EventFut { shared })
    }

    /// Receive events from the socket into the dispatch queue.
    ///
    /// In [`Blocking`](IoMode::Blocking) mode this waits for at least one
    /// event; in [`NonBlocking`](IoMode::NonBlocking) mode it reads until
    /// the socket would block, failing with
    /// [`WouldBlock`](io::ErrorKind::WouldBlock) if nothing arrived.
    pub fn recv_events(&mut self, mut mode: IoMode) -> io::Result<()> {
        let mut at_least_one = false;

        loop {
            let event = match self.recv_event_or_terminate(mode) {
                Ok(event) => event,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && at_least_one => return Ok(()),
                Err(e) => return Err(e),
            };

            at_least_one = true;
            mode = IoMode::NonBlocking;
            self.event_queue.push_back(event);
        }
    }

    /// Async version of [`recv_events`](Self::recv_events).
    #[cfg(feature = "tokio")]
    #[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
    pub async fn async_recv_events(&mut self) -> io::Result<()> {
        let event = self.async_recv_event().await?;
        self.event_queue.push_back(event);

        loop {
            match self.recv_event_or_terminate(IoMode::NonBlocking) {
                Ok(event) => self.event_queue.push_back(event),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    #[cfg(feature = "tokio")]
    async fn async_recv_event(&mut self) -> io::Result<QueuedEvent> {
        let mut async_fd = match self.async_fd.take() {
            Some(fd) => fd,
            None => AsyncFd::new(self.as_raw_fd())?,
        };

        loop {
            let mut guard = async_fd.readable_mut().await?;
            match self.recv_event_or_terminate(IoMode::NonBlocking) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => guard.clear_ready(),
                result => {
                    self.async_fd = Some(async_fd);
                    return result;
                }
            }
        }
    }

    /// I/O failure and decode errors terminate the connection; flow
    /// control (`WouldBlock`) passes through untouched.
    fn recv_event_or_terminate(&mut self, mode: IoMode) -> io::Result<QueuedEvent> {
        match self.recv_event(mode) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(e),
            Err(e) => {
                let reason = if e.kind() == io::ErrorKind::UnexpectedEof {
                    TerminateReason::ConnectionClosed
                } else {
                    TerminateReason::Transport(e.kind())
                };
                self.terminate_with(reason);
                Err(e)
            }
            ok => ok,
        }
    }

    fn recv_event(&mut self, mode: IoMode) -> io::Result<QueuedEvent> {
        loop {
            if self.terminated.is_some() {
                return Err(not_connected());
            }

            let header = self.socket.peek_message_header(mode).map_err(map_recv_err)?;

            let Some(state) = self.object_mgr.get_object(header.object_id) else {
                return Err(invalid_data(format!(
                    "event for unknown object {}",
                    header.object_id
                )));
            };
            let object = state.object;
            let desc = *object
                .interface
                .events
                .get(header.opcode as usize)
                .ok_or_else(|| {
                    invalid_data(format!("unknown opcode {} on {object:?}", header.opcode))
                })?;

            let event = self
                .socket
                .recv_message(header, desc.signature, &mut self.msg_pool, mode)
                .map_err(map_recv_err)?;

            if self.debug {
                eprintln!("[wlkit] {}", DisplayMessage::new(&event, object, &desc));
            }

            if event.header.object_id == ObjectId::DISPLAY {
                return self.handle_display_event(event);
            }

            if event.header.object_id == self.registry.id() {
                self.handle_registry_event(event)?;
                continue;
            }

            // Objects created by the server come into existence attached.
            for (arg, arg_type) in event.args.iter().zip(desc.signature) {
                match (arg, arg_type) {
                    (ArgValue::NewId(id), ArgType::NewId(interface)) => {
                        self.object_mgr
                            .register_server_object(Object {
                                id: *id,
                                interface: *interface,
                                version: object.version,
                            })
                            .map_err(|_| invalid_data(format!("id {id} already in use")))?;
                    }
                    (ArgValue::AnyNewId(name, version, id), ArgType::AnyNewId) => {
                        let interface =
                            self.interfaces.get(name.as_ref()).copied().ok_or_else(|| {
                                invalid_data(format!(
                                    "server created object of unknown interface {:?}",
                                    name
                                ))
                            })?;
                        self.object_mgr
                            .register_server_object(Object {
                                id: *id,
                                interface,
                                version: *version,
                            })
                            .map_err(|_| invalid_data(format!("id {id} already in use")))?;
                    }
                    _ => (),
                }
            }

            return Ok(QueuedEvent::Message(event));
        }
    }

    fn handle_display_event(&mut self, event: Message) -> io::Result<QueuedEvent> {
        match WlDisplay::parse_event(event, 1, &mut self.msg_pool) {
            Ok(wl_display::Event::Error(err)) => {
                log::error!(
                    "fatal compositor error on object {} (code {}): {}",
                    err.object_id,
                    err.code,
                    err.message.to_string_lossy()
                );
                let reason = TerminateReason::PeerError {
                    object_id: err.object_id,
                    code: err.code,
                    message: err.message,
                };
                self.terminate_with(reason.clone());
                Err(io::Error::other(reason.to_string()))
            }
            Ok(wl_display::Event::DeleteId(id)) => {
                let id = NonZeroU32::new(id)
                    .ok_or_else(|| invalid_data("delete_id with null id".to_owned()))?;
                Ok(QueuedEvent::DeleteId(ObjectId(id)))
            }
            Err(_) => Err(invalid_data("malformed wl_display event".to_owned())),
        }
    }

    /// Registry events feed the globals list directly; they are not
    /// dispatched to handler slots.
    fn handle_registry_event(&mut self, event: Message) -> io::Result<()> {
        match WlRegistry::parse_event(event, 1, &mut self.msg_pool) {
            Ok(wl_registry::Event::Global(global)) => {
                self.globals.push(Global {
                    name: global.name,
                    interface: global.interface,
                    version: global.version,
                    bound: None,
                });
                Ok(())
            }
            Ok(wl_registry::Event::GlobalRemove(name)) => {
                if let Some(index) = self.globals.iter().position(|g| g.name == name) {
                    let global = self.globals.swap_remove(index);
                    if let Some(bound) = global.bound {
                        // The peer never acknowledges these ids, so the
                        // proxy is detached without recycling.
                        self.object_mgr
                            .detach_object(bound, &DetachReason::GlobalRemoved);
                    }
                }
                Ok(())
            }
            Err(_) => Err(invalid_data("malformed wl_registry event".to_owned())),
        }
    }

    /// Transmit the queue of pending requests.
    ///
    /// `WouldBlock` is flow control: the residual stays buffered for the
    /// next call. Any other I/O failure terminates the connection.
    pub fn flush(&mut self, mode: IoMode) -> io::Result<()> {
        if self.terminated.is_some() {
            return Err(not_connected());
        }

        while let Some(msg) = self.requests_queue.pop_front() {
            match self.socket.write_message(msg, &mut self.msg_pool, mode) {
                Ok(()) => (),
                Err(SendMessageError {
                    msg,
                    err: SendError::Io(e),
                }) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.requests_queue.push_front(msg);
                    return Err(e);
                }
                Err(SendMessageError {
                    err: SendError::Io(e),
                    ..
                }) => {
                    self.terminate_with(TerminateReason::Transport(e.kind()));
                    return Err(e);
                }
                Err(SendMessageError {
                    msg,
                    err: SendError::Wire(wire),
                }) => {
                    // An unencodable message aborts only itself.
                    log::error!(
                        "dropping unencodable message for object {}: {wire}",
                        msg.header.object_id
                    );
                    return Err(io::Error::new(io::ErrorKind::InvalidInput, wire));
                }
            }
        }

        match self.socket.flush(mode) {
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => {
                self.terminate_with(TerminateReason::Transport(e.kind()));
                Err(e)
            }
            other => other,
        }
    }

    /// Async version of [`flush`](Self::flush).
    #[cfg(feature = "tokio")]
    #[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
    pub async fn async_flush(&mut self) -> io::Result<()> {
        // Flushing rarely blocks; try before touching the async fd.
        match self.flush(IoMode::NonBlocking) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => (),
            result => return result,
        }

        let mut async_fd = match self.async_fd.take() {
            Some(fd) => fd,
            None => AsyncFd::new(self.as_raw_fd())?,
        };

        loop {
            let mut guard = async_fd.writable_mut().await?;
            match self.flush(IoMode::NonBlocking) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => guard.clear_ready(),
                result => {
                    self.async_fd = Some(async_fd);
                    return result;
                }
            }
        }
    }

    /// The sync barrier: flush everything submitted so far and block until
    /// the compositor has processed it and all resulting events have been
    /// received (they are queued, not yet dispatched).
    pub fn blocking_roundtrip(&mut self) -> io::Result<()> {
        let sync_cb = WlDisplay::INSTANCE.sync(self).map_err(io_usage)?;
        self.flush(IoMode::Blocking)?;

        loop {
            match self.recv_event_or_terminate(IoMode::Blocking)? {
                QueuedEvent::Message(m) if m.header.object_id == sync_cb.id() => break,
                other => self.event_queue.push_back(other),
            }
        }

        Ok(())
    }

    /// Async version of [`blocking_roundtrip`](Self::blocking_roundtrip).
    #[cfg(feature = "tokio")]
    #[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
    pub async fn async_roundtrip(&mut self) -> io::Result<()> {
        let sync_cb = WlDisplay::INSTANCE.sync(self).map_err(io_usage)?;
        self.async_flush().await?;

        loop {
            match self.async_recv_event().await? {
                QueuedEvent::Message(m) if m.header.object_id == sync_cb.id() => break,
                other => self.event_queue.push_back(other),
            }
        }

        Ok(())
    }

    /// Drain the queue of received events, dispatching each to its
    /// object's handler slot in receive order.
    pub fn dispatch_events(&mut self, state: &mut D) {
        while let Some(queued) = self.event_queue.pop_front() {
            let event = match queued {
                QueuedEvent::DeleteId(id) => {
                    self.object_mgr.delete_object(id, &DetachReason::Deleted);
                    continue;
                }
                QueuedEvent::Message(event) => event,
            };

            let id = event.header.object_id;
            let opcode = event.header.opcode as usize;

            let (object, desc, mut handler) = match self.object_mgr.get_object_mut(id) {
                Some(obj) if !obj.is_detached && !obj.is_destroyed => {
                    let object = obj.object;
                    let desc = object.interface.events[opcode];
                    (object, desc, obj.handlers[opcode].take())
                }
                // In-flight events for dead objects are dropped; their
                // descriptors close with the message.
                _ => continue,
            };

            let outcome = match &mut handler {
                Some(cb) => cb(self, state, object, event),
                None => {
                    log::debug!("unhandled event: {}", DisplayMessage::new(&event, object, &desc));
                    Ok(false)
                }
            };

            if let Some(obj) = self.object_mgr.get_object_mut(id) {
                if desc.is_destructor {
                    obj.is_destroyed = true;
                }
                match outcome {
                    // Keep the handler unless it re-registered a new one.
                    Ok(true) => {
                        if !obj.is_detached && obj.handlers[opcode].is_none() {
                            obj.handlers[opcode] = handler;
                        }
                    }
                    Ok(false) => (),
                    Err(err) => {
                        log::error!("{object:?}.{} handler failed: {err}", desc.name);
                    }
                }
            }
        }
    }
}

impl<D> Drop for Connection<D> {
    fn drop(&mut self) {
        self.terminate_with(TerminateReason::Dropped);
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection has been terminated")
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn io_usage(err: UsageError) -> io::Error {
    io::Error::other(err)
}

fn map_recv_err(err: RecvMessageError) -> io::Error {
    match err {
        RecvMessageError::Io(e) => e,
        RecvMessageError::Wire(wire) => io::Error::new(io::ErrorKind::InvalidData, wire),
    }
}

fn arg_matches(arg: &ArgValue, arg_type: &ArgType) -> bool {
    matches!(
        (arg, arg_type),
        (ArgValue::Int(_), ArgType::Int)
            | (ArgValue::Uint(_), ArgType::Uint)
            | (ArgValue::Fixed(_), ArgType::Fixed)
            | (ArgValue::Object(_), ArgType::Object)
            | (ArgValue::OptObject(_), ArgType::OptObject)
            | (ArgValue::NewId(_), ArgType::NewId(_))
            | (ArgValue::AnyNewId(..), ArgType::AnyNewId)
            | (ArgValue::String(_), ArgType::String)
            | (ArgValue::OptString(_), ArgType::OptString)
            | (ArgValue::Array(_), ArgType::Array)
            | (ArgValue::Fd(_), ArgType::Fd)
    )
}

fn arg_type_name(arg_type: &ArgType) -> &'static str {
    match arg_type {
        ArgType::Int => "int",
        ArgType::Uint => "uint",
        ArgType::Fixed => "fixed",
        ArgType::Object => "object",
        ArgType::OptObject => "nullable object",
        ArgType::NewId(_) => "new id",
        ArgType::AnyNewId => "interface, version and new id",
        ArgType::String => "string",
        ArgType::OptString => "nullable string",
        ArgType::Array => "array",
        ArgType::Fd => "file descriptor",
    }
}

/// `WAYLAND_DEBUG` trace line: `wl_surface@3v6.attach(null, 0, 0)`.
struct DisplayMessage<'a> {
    message: &'a Message,
    object: Object,
    desc: &'a MessageDesc,
}

impl<'a> DisplayMessage<'a> {
    fn new(message: &'a Message, object: Object, desc: &'a MessageDesc) -> Self {
        Self {
            message,
            object,
            desc,
        }
    }
}

impl fmt::Display for DisplayMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}.{}(", self.object, self.desc.name)?;

        for (i, arg) in self.message.args.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            match arg {
                ArgValue::Int(x) => write!(f, "{x}")?,
                ArgValue::Uint(x) => write!(f, "{x}")?,
                ArgValue::Fixed(x) => write!(f, "{}", x.as_f64())?,
                ArgValue::Object(id) | ArgValue::OptObject(Some(id)) => write!(f, "{id}")?,
                ArgValue::OptObject(None) | ArgValue::OptString(None) => write!(f, "null")?,
                ArgValue::NewId(id) => {
                    match self.desc.signature.get(i) {
                        Some(ArgType::NewId(iface)) => {
                            write!(f, "new id {}@{id}", iface.name.to_string_lossy())?
                        }
                        _ => write!(f, "new id {id}")?,
                    }
                }
                ArgValue::AnyNewId(iface, version, id) => {
                    write!(f, "new id {}@{id}v{version}", iface.to_string_lossy())?
                }
                ArgValue::String(s) | ArgValue::OptString(Some(s)) => write!(f, "{s:?}")?,
                ArgValue::Array(a) => write!(f, "<array of {} bytes>", a.len())?,
                ArgValue::Fd(fd) => write!(f, "fd {}", fd.as_raw_fd())?,
            }
        }

        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}

    #[test]
    fn connection_is_send() {
        assert_send::<Connection<()>>();
    }
}
