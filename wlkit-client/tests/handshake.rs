//! Connection bootstrap against the in-process compositor: display id 1,
//! registry id 2, sync callback id 3, globals recorded before `connect`
//! returns.

mod support;

use std::os::unix::net::UnixStream;
use std::thread;

use support::*;
use wlkit_client::core::ArgValue;
use wlkit_client::object::Proxy;
use wlkit_client::protocol::*;
use wlkit_client::{Connection, IoMode};

#[test]
fn bootstrap_populates_globals() {
    let (client_end, server_end) = UnixStream::pair().unwrap();

    let server = thread::spawn(move || {
        let mut comp = TestCompositor::new(server_end);

        let req = comp.expect("wl_display", "get_registry");
        let registry = arg_new_id(&req.args[0]);
        assert_eq!(registry, 2);
        comp.registry = registry;

        let sync = comp.expect("wl_display", "sync");
        assert_eq!(arg_new_id(&sync.args[0]), 3);

        comp.announce_global(1, "wl_compositor", 6);
        comp.announce_global(2, "wl_shm", 2);
        comp.answer_sync(sync);
        comp
    });

    let mut conn = Connection::<()>::from_stream(client_end).unwrap();

    assert_eq!(conn.registry().id().as_u32(), 2);

    let globals = conn.globals();
    assert_eq!(globals.len(), 2);
    let compositor = globals
        .iter()
        .find(|g| g.interface.to_bytes() == b"wl_compositor")
        .expect("wl_compositor was advertised");
    assert_eq!((compositor.name, compositor.version), (1, 6));
    assert!(globals.iter().any(|g| g.interface.to_bytes() == b"wl_shm"));

    // The delete_id for the sync callback trails the done event; once it
    // is received and dispatched, id 3 is recycled and the next
    // allocation picks it up.
    conn.recv_events(IoMode::Blocking).unwrap();
    conn.dispatch_events(&mut ());
    let compositor: WlCompositor = conn.get_global().unwrap();
    assert_eq!(compositor.id().as_u32(), 3);

    conn.flush(IoMode::Blocking).unwrap();
    let mut comp = server.join().unwrap();

    let bind = comp.expect("wl_registry", "bind");
    assert_eq!(arg_uint(&bind.args[0]), 1);
    let ArgValue::AnyNewId(iface, version, id) = &bind.args[1] else {
        panic!("bind without a new id");
    };
    assert_eq!(iface.as_ref(), c"wl_compositor");
    // min(supported, advertised)
    assert_eq!(*version, 6);
    assert_eq!(id.as_u32(), 3);
}

#[test]
fn get_global_is_cached_and_singleton_checked() {
    let (client_end, server_end) = UnixStream::pair().unwrap();

    let server = thread::spawn(move || {
        let mut comp = TestCompositor::new(server_end);
        comp.bootstrap(&[(1, "wl_output", 4), (2, "wl_output", 4), (3, "wl_shm", 1)]);
        comp
    });

    let mut conn = Connection::<()>::from_stream(client_end).unwrap();
    let _comp = server.join().unwrap();

    // Two wl_output globals: the singleton accessor refuses, the plural
    // one binds both.
    match conn.get_global::<WlOutput>() {
        Err(wlkit_client::BindError::NotSingleton { count: 2, .. }) => (),
        other => panic!("expected NotSingleton, got {other:?}"),
    }
    let outputs = conn.get_globals::<WlOutput>().unwrap();
    assert_eq!(outputs.len(), 2);

    // Binding is cached: the same proxy comes back.
    let again = conn.get_globals::<WlOutput>().unwrap();
    assert_eq!(outputs, again);

    // The advertised version caps the bind version.
    let shm: WlShm = conn.get_global().unwrap();
    assert_eq!(shm.version(), 1);

    match conn.get_global::<WlSeat>() {
        Err(wlkit_client::BindError::GlobalNotFound(name)) => {
            assert_eq!(name, c"wl_seat");
        }
        other => panic!("expected GlobalNotFound, got {other:?}"),
    }
}
