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
    panic!("timed out waiting for connect_cb to fire");
}

/// Connecting to a port nobody is listening on must still deliver a terminal
/// status to `connect_cb` — not hang forever waiting for a reply that will
/// never come. This is the scenario a `priv_pack_cb`-only client hits before
/// any data has actually gone over the wire.
#[test]
fn connect_to_closed_port_reports_error_without_hanging() {
    let bind_addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0));
    let closed_port = {
        let probe = std::net::TcpListener::bind(bind_addr).unwrap();
        probe.local_addr().unwrap()
        // `probe` drops here, so the port is bound-then-closed: connecting
        // to it should draw an immediate RST rather than a timeout.
    };

    let client = Manager::new(ManagerConfig::default()).unwrap();
    let outcome: Rc<RefCell<Option<Status>>> = Rc::new(RefCell::new(None));

    {
        let outcome = outcome.clone();
        let client_for_destroy = client.clone();
        client
            .connect(
                closed_port,
                ClientParams {
                    resolve_cb: None,
                    priv_pack_cb: Some(Box::new(|args| args.buf.extend_from_slice(b"hello"))),
                    connect_cb: Box::new(move |ev| {
                        *outcome.borrow_mut() = Some(ev.status);
                        client_for_destroy.destroy(ev.endpoint);
                    }),
                    disconnect_cb: Box::new(|_ev| {
                        panic!("a connect that never succeeded should not reach disconnect_cb")
                    }),
                },
            )
            .unwrap();
    }

    poll_until(&[&client], || outcome.borrow().is_some());

    let status = outcome.borrow_mut().take().unwrap();
    assert_ne!(status, Status::Ok);
}
