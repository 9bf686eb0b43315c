//! The reactor and public API surface: [`Manager`] owns the `mio::Poll`
//! instance, every live [`Cep`], and every listener, and drives them from a
//! single [`Manager::poll`] call.
//!
//! Internally this is `Rc<RefCell<ManagerInner>>` — single-threaded shared
//! mutable state, matching ordinary Rust practice for an object callers hand
//! clones of to closures that need to call back into it. The tricky part is
//! reentrancy: a user callback invoked from inside `poll` is allowed to call
//! `Manager::accept`/`disconnect`/`destroy` on the very manager that is
//! calling it. Every dispatch path below follows the same rule: finish all
//! work that needs `inner.borrow_mut()`, copy out anything the callback
//! needs, drop the borrow, then invoke the callback.

use std::{collections::HashMap, net::SocketAddr, rc::Rc, time::Duration};

use mio::{Events, Interest, Poll, Token, net::TcpListener};
use tracing::{debug, error, warn};

use crate::{
    callbacks::{
        ClientConnectCb, ClientConnectEvent, ConnRequest, ConnRequestArgs, ConnRequestCb,
        DisconnectCb, DisconnectEvent, EndpointId, PrivPackCb, ResolveCb, ServerNotifyCb,
        ServerNotifyEvent,
    },
    cep::{Cep, CepOutcome},
    config::ManagerConfig,
    error::{Result, SockCmError},
    socket,
    status::Status,
};

/// Parameters for initiating an outbound (client) connection.
///
/// Exactly one of `resolve_cb`/`priv_pack_cb` must be set: `resolve_cb` lets
/// the caller inspect the resolved local address before separately calling
/// [`Manager::pack_priv_data`]; `priv_pack_cb` packs the private-data frame
/// immediately, in one step.
pub struct ClientParams {
    pub resolve_cb: Option<ResolveCb>,
    pub priv_pack_cb: Option<PrivPackCb>,
    pub connect_cb: ClientConnectCb,
    pub disconnect_cb: DisconnectCb,
}

struct ListenerState {
    listener: TcpListener,
    conn_request_cb: Option<ConnRequestCb>,
}

struct ManagerInner {
    poll: Poll,
    events: Events,
    config: ManagerConfig,
    next_token: usize,
    ceps: HashMap<Token, Cep>,
    listeners: HashMap<Token, ListenerState>,
}

impl ManagerInner {
    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }
}

/// Handle to a connection manager. Cheap to clone (bumps an `Rc`); every
/// clone refers to the same reactor and endpoint set.
#[derive(Clone)]
pub struct Manager(Rc<std::cell::RefCell<ManagerInner>>);

impl Manager {
    pub fn new(config: ManagerConfig) -> Result<Self> {
        let poll = Poll::new().map_err(SockCmError::Io)?;
        let inner = ManagerInner {
            poll,
            events: Events::with_capacity(128),
            config,
            next_token: 0,
            ceps: HashMap::new(),
            listeners: HashMap::new(),
        };
        Ok(Self(Rc::new(std::cell::RefCell::new(inner))))
    }

    /// Starts listening at `addr`; `conn_request_cb` fires once per accepted
    /// connection for as long as the listener lives.
    pub fn listen_at(
        &self,
        addr: SocketAddr,
        conn_request_cb: ConnRequestCb,
    ) -> Result<EndpointId> {
        let mut inner = self.0.borrow_mut();
        let mut listener = TcpListener::bind(addr).map_err(SockCmError::Io)?;
        let token = inner.alloc_token();
        inner
            .poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)
            .map_err(SockCmError::Io)?;
        inner.listeners.insert(token, ListenerState { listener, conn_request_cb: Some(conn_request_cb) });
        Ok(EndpointId::new(token))
    }

    /// Initiates a non-blocking outbound connection to `addr`.
    pub fn connect(&self, addr: SocketAddr, params: ClientParams) -> Result<EndpointId> {
        let mut inner = self.0.borrow_mut();

        let mut stream = mio::net::TcpStream::connect(addr).map_err(SockCmError::Io)?;
        if let (Some(sndbuf), Some(rcvbuf)) =
            (inner.config.sockopt_sndbuf, inner.config.sockopt_rcvbuf)
        {
            if let Err(err) = socket::set_socket_buf_size(&stream, sndbuf, rcvbuf) {
                warn!(%err, "sockcm: failed to set socket buffer size");
            }
        }
        if let Some(syn_cnt) = inner.config.syn_cnt {
            if let Err(err) = socket::set_syn_cnt(&stream, syn_cnt) {
                warn!(%err, "sockcm: failed to set TCP_SYNCNT");
            }
        }

        let token = inner.alloc_token();
        inner
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
            .map_err(SockCmError::Io)?;

        let priv_data_cap = inner.config.priv_data_len();
        let cep = Cep::new_client(
            stream,
            token,
            addr,
            priv_data_cap,
            params.resolve_cb,
            params.priv_pack_cb,
            params.connect_cb,
        );
        let mut cep = cep;
        cep.set_disconnect_cb(params.disconnect_cb);
        inner.ceps.insert(token, cep);

        Ok(EndpointId::new(token))
    }

    /// Packs `payload` as this client CEP's private-data frame. Used either
    /// in place of `priv_pack_cb`, or after a `resolve_cb` has inspected the
    /// resolved local address.
    pub fn pack_priv_data(&self, id: EndpointId, payload: &[u8]) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        let cep = inner.ceps.get_mut(&id.token()).ok_or(SockCmError::NotConnected)?;
        cep.pack_priv_data(payload)
    }

    /// Sends the client's post-connect notify-ack frame to the server.
    pub fn conn_notify(&self, id: EndpointId) -> Result<()> {
        let outcome = {
            let mut inner = self.0.borrow_mut();
            let cep = inner.ceps.get_mut(&id.token()).ok_or(SockCmError::NotConnected)?;
            cep.conn_notify()?
        };
        self.dispatch_outcome(id, outcome);
        Ok(())
    }

    /// Accepts a pending connection request, optionally replying with
    /// `payload`, and migrates it under `self`'s reactor (which may be a
    /// different manager than the one that originally accepted the TCP
    /// connection).
    pub fn accept(
        &self,
        req: ConnRequest,
        payload: &[u8],
        notify_cb: ServerNotifyCb,
        disconnect_cb: DisconnectCb,
    ) -> Result<EndpointId> {
        let mut cep = req.cep;
        cep.assert_not_pending_conn_req();
        cep.server_reply(payload)?;
        cep.set_server_notify_cb(notify_cb);
        cep.set_disconnect_cb(disconnect_cb);

        let mut inner = self.0.borrow_mut();
        let token = inner.alloc_token();
        inner
            .poll
            .registry()
            .register(cep.stream_mut(), token, Interest::READABLE | Interest::WRITABLE)
            .map_err(SockCmError::Io)?;
        cep.token = token;
        let id = cep.id();
        inner.ceps.insert(token, cep);
        Ok(id)
    }

    /// Rejects a pending connection request: sends the reject frame and
    /// drops the connection once it's flushed.
    pub fn reject(&self, req: ConnRequest) -> Result<()> {
        let mut cep = req.cep;
        cep.assert_not_pending_conn_req();
        cep.server_reject()?;

        let mut inner = self.0.borrow_mut();
        let token = inner.alloc_token();
        inner
            .poll
            .registry()
            .register(cep.stream_mut(), token, Interest::READABLE | Interest::WRITABLE)
            .map_err(SockCmError::Io)?;
        cep.token = token;
        inner.ceps.insert(token, cep);
        Ok(())
    }

    /// Half-closes a connected endpoint's write side. `disconnect_cb` fires
    /// once the peer's own teardown is observed.
    pub fn disconnect(&self, id: EndpointId) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        let cep = inner.ceps.get_mut(&id.token()).ok_or(SockCmError::NotConnected)?;
        cep.disconnect()
    }

    /// Removes and closes an endpoint. Call after its terminal callback
    /// (`client_connect_cb` with an error, `server_notify_cb`, or
    /// `disconnect_cb`) has run.
    pub fn destroy(&self, id: EndpointId) {
        let mut inner = self.0.borrow_mut();
        if let Some(mut cep) = inner.ceps.remove(&id.token()) {
            let _ = inner.poll.registry().deregister(cep.stream_mut());
        }
    }

    /// Stops listening; in-flight connection requests already handed to
    /// `conn_request_cb` are unaffected.
    pub fn stop_listening(&self, id: EndpointId) {
        let mut inner = self.0.borrow_mut();
        if let Some(mut l) = inner.listeners.remove(&id.token()) {
            let _ = inner.poll.registry().deregister(&mut l.listener);
        }
    }

    /// Drives the reactor once: polls for readiness, dispatches every
    /// notable event, then returns. `timeout` of `None` blocks until at
    /// least one event is ready; `Some(Duration::ZERO)` never blocks.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<()> {
        let ready: Vec<(Token, bool, bool, bool)> = {
            let mut inner = self.0.borrow_mut();
            let ManagerInner { poll, events, .. } = &mut *inner;
            poll.poll(events, timeout).map_err(SockCmError::Io)?;
            events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable(), e.is_read_closed() || e.is_write_closed() || e.is_error()))
                .collect()
        };

        for (token, readable, writable, errored) in ready {
            self.dispatch_event(token, readable, writable, errored);
        }
        Ok(())
    }

    fn dispatch_event(&self, token: Token, readable: bool, writable: bool, errored: bool) {
        let is_listener = self.0.borrow().listeners.contains_key(&token);
        if is_listener {
            self.dispatch_listener(token);
            return;
        }

        if errored {
            // A socket can report error together with readable/writable in
            // the same poll (e.g. a failed non-blocking connect); once it's
            // errored there's nothing left to read or send, and handling
            // more than one of these per event would dispatch the CEP's
            // terminal outcome twice.
            let outcome = {
                let mut inner = self.0.borrow_mut();
                let Some(cep) = inner.ceps.get_mut(&token) else { return };
                cep.handle_event_error(Status::IoError, "reactor reported error")
            };
            self.dispatch_outcome(EndpointId::new(token), outcome);
            self.rearm(token);
            return;
        }

        if readable && !self.is_terminal_or_gone(token) {
            let outcome = {
                let mut inner = self.0.borrow_mut();
                let Some(cep) = inner.ceps.get_mut(&token) else { return };
                cep.on_readable()
            };
            self.dispatch_outcome(EndpointId::new(token), outcome);
        }

        if writable && !self.is_terminal_or_gone(token) {
            let outcome = {
                let mut inner = self.0.borrow_mut();
                let Some(cep) = inner.ceps.get_mut(&token) else { return };
                cep.on_writable()
            };
            self.dispatch_outcome(EndpointId::new(token), outcome);
        }

        self.rearm(token);
    }

    /// True if the CEP no longer exists (already reaped this round) or has
    /// reached `Failed`/`Disconnected` — either way, no further event
    /// dispatch belongs to it this round.
    fn is_terminal_or_gone(&self, token: Token) -> bool {
        self.0.borrow().ceps.get(&token).is_none_or(|cep| cep.is_terminal())
    }

    fn dispatch_listener(&self, token: Token) {
        loop {
            let accepted = {
                let mut inner = self.0.borrow_mut();
                let Some(listener_state) = inner.listeners.get_mut(&token) else { return };
                match listener_state.listener.accept() {
                    Ok((stream, peer_addr)) => Some((stream, peer_addr)),
                    Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => None,
                    Err(err) => {
                        error!(%err, "sockcm: accept failed");
                        None
                    }
                }
            };
            let Some((mut stream, peer_addr)) = accepted else { break };

            let mut inner = self.0.borrow_mut();
            if let (Some(sndbuf), Some(rcvbuf)) =
                (inner.config.sockopt_sndbuf, inner.config.sockopt_rcvbuf)
            {
                let _ = socket::set_socket_buf_size(&stream, sndbuf, rcvbuf);
            }
            let cep_token = inner.alloc_token();
            if let Err(err) = inner.poll.registry().register(&mut stream, cep_token, Interest::READABLE) {
                warn!(%err, "sockcm: failed to register accepted stream");
                continue;
            }
            let priv_data_cap = inner.config.priv_data_len();
            let cep = Cep::new_server(stream, cep_token, peer_addr, priv_data_cap, token);
            debug!(peer = %cep.peer_addr_string(), "sockcm: accepted connection");
            inner.ceps.insert(cep_token, cep);
        }
    }

    /// After every event, reconciles reactor interest with what the CEP
    /// actually still needs. A CEP that has reached `Failed`/`Disconnected`
    /// is deregistered instead — spec.md §8's invariant requires the fd be
    /// either registered with exactly one reactor or the CEP be terminal,
    /// never both. The CEP itself stays in `ceps` until the user calls
    /// `destroy`; only its reactor registration is torn down here.
    fn rearm(&self, token: Token) {
        let mut inner = self.0.borrow_mut();
        let Some(cep) = inner.ceps.get_mut(&token) else { return };

        if cep.is_terminal() {
            let _ = inner.poll.registry().deregister(cep.stream_mut());
            return;
        }

        let interest = if cep.wants_writable() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let ManagerInner { poll, ceps, .. } = &mut *inner;
        if let Some(cep) = ceps.get_mut(&token) {
            let _ = poll.registry().reregister(cep.stream_mut(), token, interest);
        }
    }

    /// Executes the terminal action named by a [`CepOutcome`] after the
    /// internal borrow that produced it has been dropped by the caller.
    fn dispatch_outcome(&self, id: EndpointId, outcome: CepOutcome) {
        match outcome {
            CepOutcome::Pending => {}
            CepOutcome::Reap => self.destroy(id),
            CepOutcome::ClientConnect { cb, status, remote_data } => {
                cb(ClientConnectEvent { endpoint: id, status, remote_data: &remote_data });
            }
            CepOutcome::ServerNotify { cb, status } => {
                cb(ServerNotifyEvent { endpoint: id, status });
            }
            CepOutcome::Disconnect { cb, status } => {
                cb(DisconnectEvent { endpoint: id, status });
            }
            CepOutcome::ServerConnRequest { remote_data } => {
                self.dispatch_conn_request(id, remote_data);
            }
        }
    }

    fn dispatch_conn_request(&self, id: EndpointId, remote_data: Vec<u8>) {
        let (listener_token, peer_addr, pending_cep) = {
            let mut inner = self.0.borrow_mut();
            let Some(cep) = inner.ceps.remove(&id.token()) else { return };
            let listener_token = cep.listener_token.expect("server CEP always has a listener");
            let peer_addr = cep.peer_addr();
            (listener_token, peer_addr, cep)
        };

        let mut inner = self.0.borrow_mut();
        let Some(listener_state) = inner.listeners.get_mut(&listener_token) else {
            // Listener gone; nobody to hand this connection to. Drop it.
            return;
        };
        let Some(mut cb) = listener_state.conn_request_cb.take() else { return };
        drop(inner);

        cb(ConnRequestArgs {
            listener: EndpointId::new(listener_token),
            peer_addr,
            remote_data,
            pending: ConnRequest { cep: pending_cep },
        });

        let mut inner = self.0.borrow_mut();
        if let Some(listener_state) = inner.listeners.get_mut(&listener_token) {
            listener_state.conn_request_cb = Some(cb);
        }
    }
}
