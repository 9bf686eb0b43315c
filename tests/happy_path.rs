use std::{
    cell::RefCell,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    rc::Rc,
    time::Duration,
};

use sockcm::{ClientParams, Manager, ManagerConfig, Status};

/// Drives both managers on the same thread (a [`Manager`] is single-threaded
/// by design — see its docs) until `done` reports the handshake finished, or
/// panics after a generous bound so a regression fails fast instead of
/// hanging CI.
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

/// Full client/server handshake: the client packs private data, the server
/// accepts and replies with its own, and both sides observe the other's
/// payload.
#[test]
fn client_server_handshake_exchanges_private_data() {
    let bind_addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0));
    let bound_on = {
        let probe = std::net::TcpListener::bind(bind_addr).unwrap();
        probe.local_addr().unwrap()
    };

    let server = Manager::new(ManagerConfig::default()).unwrap();
    let server_notified = Rc::new(RefCell::new(false));
    let accepted_client_data: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));

    {
        let accepted_client_data = accepted_client_data.clone();
        let server_notified = server_notified.clone();
        let server_for_accept = server.clone();
        server
            .listen_at(
                bound_on,
                Box::new(move |req| {
                    *accepted_client_data.borrow_mut() = Some(req.remote_data.clone());
                    let server_notified = server_notified.clone();
                    server_for_accept
                        .accept(
                            req.pending,
                            b"server-hello",
                            Box::new(move |ev| {
                                assert_eq!(ev.status, Status::Ok);
                                *server_notified.borrow_mut() = true;
                            }),
                            Box::new(|_ev| panic!("server should not see a disconnect here")),
                        )
                        .unwrap();
                }),
            )
            .unwrap();
    }

    let client = Manager::new(ManagerConfig::default()).unwrap();
    let client_connected: Rc<RefCell<Option<(Status, Vec<u8>)>>> = Rc::new(RefCell::new(None));
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
                        *client_connected.borrow_mut() = Some((ev.status, ev.remote_data.to_vec()));
                        client_for_notify.conn_notify().unwrap();
                    }),
                    disconnect_cb: Box::new(|_ev| panic!("client should not see a disconnect here")),
                },
            )
            .unwrap();
    }

    poll_until(&[&server, &client], || {
        *server_notified.borrow() && client_connected.borrow().is_some()
    });

    let (status, payload) = client_connected.borrow_mut().take().unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(payload, b"server-hello");
    assert_eq!(accepted_client_data.borrow_mut().take().unwrap(), b"client-hi");
    assert!(*server_notified.borrow());
}
