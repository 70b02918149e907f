//! Generated xdg-shell bindings against a minimal compositor double:
//! typed binding of an extension global, the automatic ping/pong, enum
//! arguments and the destructor guard.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::os::unix::net::UnixStream;
use std::thread;

use wlkit_client::core::transport::BufferedSocket;
use wlkit_client::core::{
    ArgType, ArgValue, Interface, IoMode, Message, MessageBuffersPool, MessageHeader, ObjectId,
};
use wlkit_client::object::Proxy;
use wlkit_client::protocol;
use wlkit_client::{Connection, Scoped};
use wlkit_protocols::xdg_shell::{self, XdgWmBase};

/// Just enough compositor to serve one client.
struct Server {
    sock: BufferedSocket<UnixStream>,
    pool: MessageBuffersPool,
    objects: HashMap<u32, &'static Interface>,
    known: Vec<&'static Interface>,
    registry: u32,
}

impl Server {
    fn new(stream: UnixStream) -> Self {
        let display = protocol::INTERFACES
            .iter()
            .copied()
            .find(|iface| iface.name.as_ref() == c"wl_display")
            .unwrap();
        let mut objects = HashMap::new();
        objects.insert(1, display);
        let mut known = protocol::INTERFACES.to_vec();
        known.extend_from_slice(xdg_shell::INTERFACES);
        Self {
            sock: BufferedSocket::from(stream),
            pool: MessageBuffersPool::default(),
            objects,
            known,
            registry: 0,
        }
    }

    fn recv(&mut self) -> (&'static str, &'static str, Vec<ArgValue>) {
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
                (ArgValue::AnyNewId(name, _, id), ArgType::AnyNewId) => {
                    let created = self
                        .known
                        .iter()
                        .copied()
                        .find(|known| known.name.as_ref() == name.as_ref())
                        .expect("bind of unknown interface");
                    self.objects.insert(id.as_u32(), created);
                }
                _ => (),
            }
        }

        (iface.name.to_str().unwrap(), desc.name, msg.args)
    }

    fn expect(&mut self, interface: &str, request: &str) -> Vec<ArgValue> {
        let (got_iface, got_name, args) = self.recv();
        assert_eq!((got_iface, got_name), (interface, request));
        args
    }

    fn send(&mut self, object_id: u32, opcode: u16, args: Vec<ArgValue>) {
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

    fn bootstrap(&mut self) {
        let args = self.expect("wl_display", "get_registry");
        let ArgValue::NewId(registry) = &args[0] else {
            panic!()
        };
        self.registry = registry.as_u32();

        let sync = self.expect("wl_display", "sync");
        self.send(
            self.registry,
            0,
            vec![
                ArgValue::Uint(1),
                ArgValue::String(c"xdg_wm_base".into()),
                ArgValue::Uint(6),
            ],
        );
        let ArgValue::NewId(cb) = &sync[0] else { panic!() };
        let cb = cb.as_u32();
        self.send(cb, 0, vec![ArgValue::Uint(0)]);
        self.send(1, 1, vec![ArgValue::Uint(cb)]);
    }
}

#[test]
fn bind_ping_pong_and_positioner() {
    let (client_end, server_end) = UnixStream::pair().unwrap();

    let server = thread::spawn(move || {
        let mut server = Server::new(server_end);
        server.bootstrap();

        let bind = server.expect("wl_registry", "bind");
        let ArgValue::AnyNewId(_, _, wm_base) = &bind[1] else {
            panic!()
        };
        let wm_base = wm_base.as_u32();

        // Ping as soon as the client is bound; the library answers on its
        // own during dispatch.
        server.send(wm_base, 0, vec![ArgValue::Uint(555)]);

        let pong = server.expect("xdg_wm_base", "pong");
        assert!(matches!(pong[0], ArgValue::Uint(555)));

        server.expect("xdg_wm_base", "create_positioner");
        let set_anchor = server.expect("xdg_positioner", "set_anchor");
        assert!(matches!(set_anchor[0], ArgValue::Uint(1))); // top

        server.expect("xdg_positioner", "destroy");
        server
    });

    let mut conn = Connection::<()>::from_stream(client_end).unwrap();
    conn.register_interfaces(xdg_shell::INTERFACES);

    let wm_base: XdgWmBase = conn.get_global().unwrap();
    assert_eq!(wm_base.version(), 6);
    conn.flush(IoMode::Blocking).unwrap();

    // Receive the ping; dispatch triggers the automatic pong.
    conn.recv_events(IoMode::Blocking).unwrap();
    conn.dispatch_events(&mut ());
    conn.flush(IoMode::Blocking).unwrap();

    // Typed enum argument plus the scope-exit destructor.
    let positioner = wm_base.create_positioner(&mut conn).unwrap();
    {
        let mut positioner = Scoped::new(&mut conn, positioner);
        let p = *positioner;
        p.set_anchor(positioner.conn(), xdg_shell::xdg_positioner::Anchor::Top)
            .unwrap();
        // dropping the guard queues xdg_positioner.destroy
    }
    conn.flush(IoMode::Blocking).unwrap();

    server.join().unwrap();
}
