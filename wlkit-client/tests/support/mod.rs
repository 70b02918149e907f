//! In-process compositor double.
//!
//! Speaks the wire protocol over one end of a `UnixStream::pair`, parsing
//! client requests with the same static descriptors the client uses and
//! answering with hand-built events.

#![allow(dead_code)]

use std::collections::HashMap;
use std::ffi::CString;
use std::num::NonZeroU32;
use std::os::unix::net::UnixStream;

use wlkit_client::core::transport::BufferedSocket;
use wlkit_client::core::{
    ArgType, ArgValue, Interface, IoMode, Message, MessageBuffersPool, MessageHeader, ObjectId,
};
use wlkit_client::protocol;

pub const DISPLAY: u32 = 1;

/// The display descriptor; its proxy type is private to the library, but
/// the descriptor is published through the protocol's `INTERFACES` slice.
fn display_interface() -> &'static Interface {
    protocol::INTERFACES
        .iter()
        .copied()
        .find(|iface| iface.name.as_ref() == c"wl_display")
        .unwrap()
}

/// A request received from the client under test.
pub struct Request {
    pub sender: u32,
    pub interface: &'static str,
    pub name: &'static str,
    pub args: Vec<ArgValue>,
}

pub struct TestCompositor {
    sock: BufferedSocket<UnixStream>,
    pool: MessageBuffersPool,
    /// id → interface of every object the client has announced.
    objects: HashMap<u32, &'static Interface>,
    /// Interfaces resolvable from `wl_registry.bind`.
    known: Vec<&'static Interface>,
    pub registry: u32,
}

impl TestCompositor {
    pub fn new(stream: UnixStream) -> Self {
        let mut objects = HashMap::new();
        objects.insert(DISPLAY, display_interface());

        Self {
            sock: BufferedSocket::from(stream),
            pool: MessageBuffersPool::default(),
            objects,
            known: protocol::INTERFACES.to_vec(),
            registry: 0,
        }
    }

    /// Make extension interfaces resolvable from `bind` requests.
    pub fn register_interfaces(&mut self, interfaces: &[&'static Interface]) {
        self.known.extend_from_slice(interfaces);
    }

    /// Blockingly read the next request, tracking any objects it creates.
    pub fn recv_request(&mut self) -> Request {
        let header = self.sock.peek_message_header(IoMode::Blocking).unwrap();
        let iface = self.objects[&header.object_id.as_u32()];
        let desc = &iface.requests[header.opcode as usize];

        let msg = self
            .sock
            .recv_message(header, desc.signature, &mut self.pool, IoMode::Blocking)
            .unwrap();

        for (arg, arg_type) in msg.args.iter().zip(desc.signature) {
            match (arg, arg_type) {
                (ArgValue::NewId(id), ArgType::NewId(created)) => {
                    self.objects.insert(id.as_u32(), *created);
                }
                (ArgValue::AnyNewId(name, _version, id), ArgType::AnyNewId) => {
                    let created = self
                        .known
                        .iter()
                        .copied()
                        .find(|known| known.name.as_ref() == name.as_ref())
                        .unwrap_or_else(|| panic!("bind of unknown interface {name:?}"));
                    self.objects.insert(id.as_u32(), created);
                }
                _ => (),
            }
        }

        Request {
            sender: header.object_id.as_u32(),
            interface: iface.name.to_str().unwrap(),
            name: desc.name,
            args: msg.args,
        }
    }

    /// Read the next request and assert on its origin and name.
    pub fn expect(&mut self, interface: &str, request: &str) -> Request {
        let req = self.recv_request();
        assert_eq!(
            (req.interface, req.name),
            (interface, request),
            "unexpected request from object {}",
            req.sender
        );
        req
    }

    /// Send one event and flush it out.
    pub fn send_event(&mut self, object_id: u32, opcode: u16, args: Vec<ArgValue>) {
        let msg = Message {
            header: MessageHeader {
                object_id: ObjectId(NonZeroU32::new(object_id).unwrap()),
                size: 0,
                opcode,
            },
            args,
        };
        self.sock
            .write_message(msg, &mut self.pool, IoMode::Blocking)
            .unwrap_or_else(|e| panic!("{}", e.err));
        self.sock.flush(IoMode::Blocking).unwrap();
    }

    /// Advertise a global on the registry.
    pub fn announce_global(&mut self, name: u32, interface: &str, version: u32) {
        let interface = CString::new(interface).unwrap();
        self.send_event(
            self.registry,
            0,
            vec![
                ArgValue::Uint(name),
                ArgValue::String(interface),
                ArgValue::Uint(version),
            ],
        );
    }

    pub fn withdraw_global(&mut self, name: u32) {
        self.send_event(self.registry, 1, vec![ArgValue::Uint(name)]);
    }

    /// Answer a `wl_display.sync` request: fire the callback's `done` and
    /// acknowledge the callback's deletion.
    pub fn answer_sync(&mut self, sync: Request) {
        let ArgValue::NewId(cb) = &sync.args[0] else {
            panic!("sync without a callback id");
        };
        self.send_event(cb.as_u32(), 0, vec![ArgValue::Uint(0)]);
        self.delete_object(cb.as_u32());
    }

    /// Acknowledge an object deletion (`wl_display.delete_id`).
    pub fn delete_object(&mut self, id: u32) {
        self.objects.remove(&id);
        self.send_event(DISPLAY, 1, vec![ArgValue::Uint(id)]);
    }

    /// Serve the connection bootstrap: `get_registry` followed by a sync
    /// barrier, advertising `globals` in between.
    pub fn bootstrap(&mut self, globals: &[(u32, &str, u32)]) {
        let req = self.expect("wl_display", "get_registry");
        let ArgValue::NewId(registry) = &req.args[0] else {
            panic!("get_registry without an id");
        };
        self.registry = registry.as_u32();

        let sync = self.expect("wl_display", "sync");
        for &(name, interface, version) in globals {
            self.announce_global(name, interface, version);
        }
        self.answer_sync(sync);
    }

    /// Serve a plain roundtrip with no other traffic in between.
    pub fn serve_roundtrip(&mut self) {
        let sync = self.expect("wl_display", "sync");
        self.answer_sync(sync);
    }
}

/// Helpers for pulling typed values out of received arguments.
pub fn arg_uint(arg: &ArgValue) -> u32 {
    match arg {
        ArgValue::Uint(x) => *x,
        other => panic!("expected uint, got {other:?}"),
    }
}

pub fn arg_int(arg: &ArgValue) -> i32 {
    match arg {
        ArgValue::Int(x) => *x,
        other => panic!("expected int, got {other:?}"),
    }
}

pub fn arg_new_id(arg: &ArgValue) -> u32 {
    match arg {
        ArgValue::NewId(id) => id.as_u32(),
        other => panic!("expected new id, got {other:?}"),
    }
}
