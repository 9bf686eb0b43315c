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
    panic!("timed out");
}

/// Once a handshake has fully completed, the server tearing down its side
/// (without the client ever calling `disconnect`) must surface through the
/// client's `disconnect_cb`, not `connect_cb` again and not a hang.
#[test]
fn server_teardown_after_handshake_reaches_client_disconnect_cb() {
    let bind_addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0));
    let bound_on = {
        let probe = std::net::TcpListener::bind(bind_addr).unwrap();
        probe.local_addr().unwrap()
    };

    let server = Manager::new(ManagerConfig::default()).unwrap();
    let server_endpoint = Rc::new(RefCell::new(None));

    {
        let server_endpoint = server_endpoint.clone();
        let server_for_accept = server.clone();
        server
            .listen_at(
                bound_on,
                Box::new(move |req| {
                    let accepted = server_for_accept
                        .accept(
                            req.pending,
                            b"server-hello",
                            Box::new(|_ev| {}),
                            Box::new(|_ev| panic!("server should not see its own disconnect_cb")),
                        )
                        .unwrap();
                    *server_endpoint.borrow_mut() = Some(accepted);
                }),
            )
            .unwrap();
    }

    let client = Manager::new(ManagerConfig::default()).unwrap();
    let client_connected = Rc::new(RefCell::new(false));
    let client_disconnected: Rc<RefCell<Option<Status>>> = Rc::new(RefCell::new(None));
    let client_for_notify = client.clone();

    {
        let client_connected = client_connected.clone();
        let client_disconnected = client_disconnected.clone();
        let client_for_destroy = client.clone();
        client
            .connect(
                bound_on,
                ClientParams {
                    resolve_cb: None,
                    priv_pack_cb: Some(Box::new(|args| args.buf.extend_from_slice(b"client-hi"))),
                    connect_cb: Box::new(move |ev| {
                        assert_eq!(ev.status, Status::Ok);
                        *client_connected.borrow_mut() = true;
                        client_for_notify.conn_notify().unwrap();
                    }),
                    disconnect_cb: Box::new(move |ev| {
                        let endpoint = ev.endpoint;
                        *client_disconnected.borrow_mut() = Some(ev.status);
                        client_for_destroy.destroy(endpoint);
                    }),
                },
            )
            .unwrap();
    }

    poll_until(&[&server, &client], || {
        *client_connected.borrow() && server_endpoint.borrow().is_some()
    });

    // Drop the server's side of the connection out from under the client —
    // closes the fd without a clean `Manager::disconnect` handshake.
    let server_ep = server_endpoint.borrow_mut().take().unwrap();
    server.destroy(server_ep);

    poll_until(&[&server, &client], || client_disconnected.borrow().is_some());

    let status = client_disconnected.borrow_mut().take().unwrap();
    assert_ne!(status, Status::Ok);
}
