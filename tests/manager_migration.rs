use std::{
    cell::RefCell,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    rc::Rc,
    time::Duration,
};

use sockcm::{ClientParams, Manager, ManagerConfig, Status};

fn poll_until<F: FnMut() -> bool>(managers: &[&Manager], mut done: F) {
    for _ in 0..4000 {
        for m in managers {
            m.poll(Some(Duration::from_millis(1))).unwrap();
        }
        if done() {
            return;
        }
    }
    panic!("timed out waiting for handshake to complete");
}

/// A listener's `conn_request_cb` is free to accept the connection onto an
/// entirely different [`Manager`] than the one that owns the listener —
/// `Manager::accept` always re-registers the endpoint under `self`, so this
/// works the same as accepting on the listener's own manager.
#[test]
fn accept_can_migrate_connection_to_a_different_manager() {
    let bind_addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0));
    let bound_on = {
        let probe = std::net::TcpListener::bind(bind_addr).unwrap();
        probe.local_addr().unwrap()
    };

    let listener_mgr = Manager::new(ManagerConfig::default()).unwrap();
    let worker_mgr = Manager::new(ManagerConfig::default()).unwrap();
    let server_notified = Rc::new(RefCell::new(false));

    {
        let worker_mgr = worker_mgr.clone();
        let server_notified = server_notified.clone();
        listener_mgr
            .listen_at(
                bound_on,
                Box::new(move |req| {
                    let server_notified = server_notified.clone();
                    // Hand the connection off to `worker_mgr` — not the
                    // manager that owns this listener.
                    worker_mgr
                        .accept(
                            req.pending,
                            b"migrated-hello",
                            Box::new(move |ev| {
                                assert_eq!(ev.status, Status::Ok);
                                *server_notified.borrow_mut() = true;
                            }),
                            Box::new(|_ev| panic!("unexpected disconnect")),
                        )
                        .unwrap();
                }),
            )
            .unwrap();
    }

    let client = Manager::new(ManagerConfig::default()).unwrap();
    let client_connected: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let client_for_notify = client.clone();

    {
        let client_connected = client_connected.clone();
        client
            .connect(
                bound_on,
                ClientParams {
                    resolve_cb: None,
                    priv_pack_cb: Some(Box::new(|args| args.buf.extend_from_slice(b"client-hi"))),
                    connect_cb: Box::new(move |ev| {
                        assert_eq!(ev.status, Status::Ok);
                        *client_connected.borrow_mut() = Some(ev.remote_data.to_vec());
                        client_for_notify.conn_notify().unwrap();
                    }),
                    disconnect_cb: Box::new(|_ev| panic!("unexpected disconnect")),
                },
            )
            .unwrap();
    }

    // The accepted connection now lives under `worker_mgr`'s reactor, not
    // `listener_mgr`'s — all three managers must be driven for the
    // handshake (listener accept, worker-side reply, client-side notify) to
    // complete.
    poll_until(&[&listener_mgr, &worker_mgr, &client], || {
        *server_notified.borrow() && client_connected.borrow().is_some()
    });

    assert_eq!(client_connected.borrow_mut().take().unwrap(), b"migrated-hello");
    assert!(*server_notified.borrow());
}
