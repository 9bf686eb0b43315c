//! The connection endpoint (CEP) state machine: one non-blocking TCP socket
//! carrying exactly one private-data frame in each direction.
//!
//! Every method that might need to hand control back to the owner returns a
//! [`CepOutcome`] instead of invoking a callback directly. The owning
//! [`crate::Manager`] is responsible for dropping its borrow of the shared
//! state *before* acting on a terminal outcome, then re-borrowing afterward —
//! this is what makes it safe for a callback to call back into the manager
//! (disconnect, destroy, accept another connection, ...) without reentering
//! a live `RefCell` borrow.

use std::net::SocketAddr;

use mio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::{
    callbacks::{
        ClientConnectCb, ClientConnectEvent, DisconnectCb, DisconnectEvent, EndpointId, PackArgs,
        PrivPackCb, ResolveCb, ResolveEvent, ServerNotifyCb, ServerNotifyEvent,
    },
    frame::{self, HDR_SIZE},
    socket::{self, IoOutcome},
    state::{CepFlags, Role},
    status::{Status, WireStatus},
};

/// Buffer and read/write cursors for the single in-flight frame (outbound or
/// inbound) this CEP is working on at any given time.
struct CommCtx {
    buf: Vec<u8>,
    offset: usize,
    length: usize,
}

impl CommCtx {
    fn new(priv_data_cap: usize) -> Self {
        Self { buf: vec![0u8; HDR_SIZE + priv_data_cap], offset: 0, length: 0 }
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.length = 0;
    }

    fn is_tx_rx_done(&self) -> bool {
        self.offset == self.length
    }
}

/// What the caller of a [`Cep`] dispatch method must do next. Carries owned
/// data (never a borrow into `Cep`) so the manager can drop its borrow of
/// the endpoint before invoking the callback.
pub(crate) enum CepOutcome {
    /// Nothing externally visible happened; keep driving the reactor.
    Pending,
    ClientConnect { cb: ClientConnectCb, status: Status, remote_data: Vec<u8> },
    ServerNotify { cb: ServerNotifyCb, status: Status },
    Disconnect { cb: DisconnectCb, status: Status },
    /// The listener's `conn_request_cb` should fire for this CEP's
    /// `listener_token`; the manager performs the ownership transfer.
    ServerConnRequest { remote_data: Vec<u8> },
    /// The CEP should be dropped from the manager's map (e.g. a reject frame
    /// finished sending, or an errored server CEP nobody ever claimed).
    Reap,
}

pub struct Cep {
    stream: TcpStream,
    pub(crate) token: mio::Token,
    role: Role,
    flags: CepFlags,
    comm: CommCtx,
    priv_data_cap: usize,
    peer_addr: SocketAddr,
    pub(crate) listener_token: Option<mio::Token>,

    resolve_cb: Option<ResolveCb>,
    priv_pack_cb: Option<PrivPackCb>,
    client_connect_cb: Option<ClientConnectCb>,
    server_notify_cb: Option<ServerNotifyCb>,
    disconnect_cb: Option<DisconnectCb>,
}

impl Cep {
    pub(crate) fn new_client(
        stream: TcpStream,
        token: mio::Token,
        peer_addr: SocketAddr,
        priv_data_cap: usize,
        resolve_cb: Option<ResolveCb>,
        priv_pack_cb: Option<PrivPackCb>,
        client_connect_cb: ClientConnectCb,
    ) -> Self {
        assert!(
            resolve_cb.is_some() != priv_pack_cb.is_some(),
            "exactly one of resolve_cb/priv_pack_cb must be set"
        );
        Self {
            stream,
            token,
            role: Role::Client,
            flags: CepFlags::ON_CLIENT,
            comm: CommCtx::new(priv_data_cap),
            priv_data_cap,
            peer_addr,
            listener_token: None,
            resolve_cb,
            priv_pack_cb,
            client_connect_cb: Some(client_connect_cb),
            server_notify_cb: None,
            disconnect_cb: None,
        }
    }

    pub(crate) fn new_server(
        stream: TcpStream,
        token: mio::Token,
        peer_addr: SocketAddr,
        priv_data_cap: usize,
        listener_token: mio::Token,
    ) -> Self {
        Self {
            stream,
            token,
            role: Role::Server,
            flags: CepFlags::ON_SERVER,
            comm: CommCtx::new(priv_data_cap),
            priv_data_cap,
            peer_addr,
            listener_token: Some(listener_token),
            resolve_cb: None,
            priv_pack_cb: None,
            client_connect_cb: None,
            server_notify_cb: None,
            disconnect_cb: None,
        }
    }

    pub(crate) fn id(&self) -> EndpointId {
        EndpointId::new(self.token)
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Formats the peer address for log lines, matching the original's
    /// `uct_tcp_sockcm_cm_ep_peer_addr_str` diagnostic helper — used only to
    /// enrich `tracing` fields, never part of any invariant or callback.
    pub(crate) fn peer_addr_string(&self) -> String {
        self.peer_addr.to_string()
    }

    pub(crate) fn flags(&self) -> CepFlags {
        self.flags
    }

    /// Whether this CEP still has writable interest to offer: either bytes
    /// left in the current outbound frame, or (client only) private data
    /// not yet packed — the first writable event is what kicks off
    /// `resolve`/pack. Used to decide whether to keep `WRITABLE` armed with
    /// the reactor; re-arming unconditionally would busy-spin once a frame
    /// finishes, since the socket send buffer is almost always writable.
    pub(crate) fn wants_writable(&self) -> bool {
        if self.comm.offset < self.comm.length {
            return true;
        }
        self.flags.contains(CepFlags::ON_CLIENT) && !self.flags.contains(CepFlags::PRIV_DATA_PACKED)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.flags.intersects(
            CepFlags::CLIENT_CONNECTED_CB_INVOKED | CepFlags::SERVER_NOTIFY_CB_INVOKED,
        )
    }

    /// True once this CEP has reached a terminal state (§8: "fd is either
    /// registered with exactly one reactor or the CEP is in `Failed`/
    /// `Disconnected`"). The manager must not re-arm or keep dispatching
    /// events to a CEP past this point.
    pub(crate) fn is_terminal(&self) -> bool {
        self.flags.intersects(CepFlags::FAILED | CepFlags::DISCONNECTED)
    }

    pub(crate) fn set_disconnect_cb(&mut self, cb: DisconnectCb) {
        self.disconnect_cb = Some(cb);
    }

    pub(crate) fn set_server_notify_cb(&mut self, cb: ServerNotifyCb) {
        self.server_notify_cb = Some(cb);
    }

    /// Ownership is about to transfer out of the manager's map (server
    /// accept or listener's `conn_request_cb`); the endpoint must not still
    /// owe the listener a connection-request callback.
    pub(crate) fn assert_not_pending_conn_req(&self) {
        debug_assert!(!self.flags.contains(CepFlags::SERVER_CONN_REQ_CB_INVOKED));
    }

    // ---- resolve / pack --------------------------------------------------

    /// First send-path entry for a client CEP: resolves the local interface
    /// and hands off to whichever of `resolve_cb`/`priv_pack_cb` the caller
    /// configured. Only ever called once per CEP.
    fn resolve(&mut self, resolve_status: Status) {
        let local_addr = self.stream.local_addr().unwrap_or(self.peer_addr);
        let dev_name = socket::ifname_for_addr(local_addr);

        if let Some(cb) = self.resolve_cb.take() {
            self.flags |= CepFlags::RESOLVE_CB_INVOKED;
            if resolve_status != Status::Ok {
                self.flags |= CepFlags::RESOLVE_CB_FAILED;
            }
            cb(ResolveEvent { endpoint: self.id(), local_addr, dev_name });
        } else {
            self.invoke_pack_cb();
        }
    }

    fn invoke_pack_cb(&mut self) {
        let Some(cb) = self.priv_pack_cb.take() else {
            return;
        };
        let mut payload = Vec::with_capacity(self.priv_data_cap);
        cb(PackArgs { endpoint: self.id(), buf: &mut payload });
        self.finish_pack(&payload);
    }

    /// Writes a pre-packed payload directly, matching the `connect()` entry
    /// point that bypasses `priv_pack_cb` when the caller already has the
    /// bytes in hand.
    pub(crate) fn pack_priv_data(&mut self, payload: &[u8]) -> crate::error::Result<()> {
        self.finish_pack(payload)
    }

    fn finish_pack(&mut self, payload: &[u8]) -> crate::error::Result<()> {
        debug_assert_eq!(self.comm.offset, 0);
        match frame::pack_outgoing(&mut self.comm.buf, payload, self.priv_data_cap, WireStatus::Ok)
        {
            Ok(n) => {
                self.comm.length = n;
                self.flags |= CepFlags::PRIV_DATA_PACKED;
                Ok(())
            }
            Err(err) => {
                self.flags |= CepFlags::PACK_CB_FAILED;
                Err(err)
            }
        }
    }

    // ---- send path ---------------------------------------------------

    /// Entry point driven by a writable reactor event (or immediately after
    /// connect). Mirrors the original's dispatch: resolve first if needed,
    /// otherwise skip spurious writable events, otherwise progress the send.
    pub(crate) fn on_writable(&mut self) -> CepOutcome {
        if !self.flags.intersects(
            CepFlags::RESOLVE_CB_INVOKED | CepFlags::PRIV_DATA_PACKED | CepFlags::ON_SERVER,
        ) {
            debug_assert!(self.flags.contains(CepFlags::ON_CLIENT));
            self.resolve(Status::Ok);
            return CepOutcome::Pending;
        }

        if self.should_skip_write() {
            debug_assert!(!self.flags.contains(CepFlags::DISCONNECTING));
            return CepOutcome::Pending;
        }

        self.progress_send()
    }

    /// Stray-writable-event filter (`send_skip_event` in the original):
    /// once a CEP is mid-teardown, or has already sent what it owes for its
    /// role, further writable events are spurious and must be ignored rather
    /// than re-entering `progress_send` with nothing left to send.
    fn should_skip_write(&self) -> bool {
        debug_assert!(!self.flags.intersects(CepFlags::DISCONNECTED | CepFlags::FAILED));

        if self.flags.contains(CepFlags::DISCONNECTING) {
            return true;
        }
        if self.flags.contains(CepFlags::ON_SERVER) {
            return self.flags.contains(CepFlags::DATA_SENT);
        }
        debug_assert!(self.flags.contains(CepFlags::ON_CLIENT));
        self.flags.intersects(CepFlags::CLIENT_NOTIFY_SENT | CepFlags::DATA_SENT)
            || !self.flags.contains(CepFlags::PRIV_DATA_PACKED)
    }

    fn progress_send(&mut self) -> CepOutcome {
        debug_assert!(self.comm.offset < self.comm.length);
        let remaining = &self.comm.buf[self.comm.offset..self.comm.length];

        match socket::send_nb(&mut self.stream, remaining) {
            IoOutcome::Progress(n) => {
                self.comm.offset += n;
                if self.comm.is_tx_rx_done() {
                    self.flags |= CepFlags::DATA_SENT;
                    self.mark_tx_completed();
                    self.comm.reset();

                    if self.flags.contains(CepFlags::SERVER_REJECT_SENT) {
                        return CepOutcome::Reap;
                    }
                }
                CepOutcome::Pending
            }
            IoOutcome::WouldBlock => CepOutcome::Pending,
            IoOutcome::PeerReset => self.handle_remote_disconnect(Status::ConnectionReset),
            IoOutcome::Other(err) => {
                warn!(%err, token = ?self.token, "sockcm: send failed");
                self.handle_remote_disconnect(Status::IoError)
            }
        }
    }

    /// Records that the just-completed send was the client's notify-ack or
    /// the server's reject frame, so later bookkeeping (e.g. `disconnect`)
    /// can tell a finished handshake from one still in flight.
    fn mark_tx_completed(&mut self) {
        if self.flags.contains(CepFlags::CLIENT_NOTIFY_CALLED) {
            self.flags |= CepFlags::CLIENT_NOTIFY_SENT;
        }
        if self.flags.contains(CepFlags::SERVER_REJECT_CALLED) {
            self.flags |= CepFlags::SERVER_REJECT_SENT;
        }
    }

    /// Queues the post-handshake notify-ack frame a client sends back to the
    /// server once its own handshake has completed.
    pub(crate) fn conn_notify(&mut self) -> crate::error::Result<CepOutcome> {
        if self.flags.intersects(CepFlags::DISCONNECTING | CepFlags::FAILED) {
            return Err(crate::error::SockCmError::NotConnected);
        }
        debug_assert!(self.flags.intersects(
            CepFlags::ON_CLIENT | CepFlags::DATA_SENT | CepFlags::DATA_RECEIVED
                | CepFlags::CLIENT_CONNECTED_CB_INVOKED
        ));
        debug_assert!(!self.flags.contains(CepFlags::CLIENT_NOTIFY_SENT));

        self.comm.length =
            frame::pack_outgoing(&mut self.comm.buf, &[], self.priv_data_cap, WireStatus::Ok)?;
        self.flags |= CepFlags::CLIENT_NOTIFY_CALLED;
        Ok(self.progress_send())
    }

    /// Queues the reject frame a server sends back instead of a normal
    /// reply, then tears the CEP down once it's fully on the wire.
    pub(crate) fn server_reject(&mut self) -> crate::error::Result<()> {
        self.comm.length =
            frame::pack_outgoing(&mut self.comm.buf, &[], self.priv_data_cap, WireStatus::Rejected)?;
        self.flags |= CepFlags::SERVER_REJECT_CALLED;
        Ok(())
    }

    /// Queues a server's normal reply frame (private data to send back to
    /// the client) once the connection has been accepted and created.
    pub(crate) fn server_reply(&mut self, payload: &[u8]) -> crate::error::Result<()> {
        self.finish_pack(payload)?;
        self.flags |= CepFlags::SERVER_CREATED;
        Ok(())
    }

    // ---- recv path -----------------------------------------------------

    pub(crate) fn on_readable(&mut self) -> CepOutcome {
        if self.flags.contains(CepFlags::SERVER_REJECT_CALLED) {
            return CepOutcome::Pending;
        }

        loop {
            let want = self.priv_data_cap + HDR_SIZE - self.comm.offset;
            let buf_slice = &mut self.comm.buf[self.comm.offset..self.comm.offset + want.min(
                self.comm.buf.len() - self.comm.offset,
            )];

            match socket::recv_nb(&mut self.stream, buf_slice) {
                IoOutcome::Progress(0) => return CepOutcome::Pending,
                IoOutcome::Progress(n) => {
                    self.comm.offset += n;
                    if let Some(outcome) = self.advance_recv_state() {
                        return outcome;
                    }
                }
                IoOutcome::WouldBlock => return CepOutcome::Pending,
                IoOutcome::PeerReset => {
                    return self.handle_remote_disconnect(Status::ConnectionReset);
                }
                IoOutcome::Other(err) => {
                    warn!(%err, token = ?self.token, "sockcm: recv failed");
                    return self.handle_remote_disconnect(Status::IoError);
                }
            }
        }
    }

    /// After bytes land in `comm.buf`, checks whether the header and then
    /// the full frame have arrived, dispatching `handle_data_received` once
    /// they have. Returns `Some(outcome)` when the caller should stop
    /// looping (either a terminal outcome, or the frame isn't complete yet
    /// and another `recv` attempt is needed).
    fn advance_recv_state(&mut self) -> Option<CepOutcome> {
        if !self.flags.contains(CepFlags::HDR_RECEIVED) {
            if self.comm.offset < HDR_SIZE {
                return None;
            }
            let hdr = frame::decode_header(&self.comm.buf);
            self.comm.length = HDR_SIZE + hdr.length as usize;
            self.flags |= CepFlags::HDR_RECEIVED;
        }

        if self.comm.is_tx_rx_done() {
            Some(self.handle_data_received())
        } else {
            None
        }
    }

    fn handle_data_received(&mut self) -> CepOutcome {
        debug_assert!(!self.flags.contains(CepFlags::DISCONNECTED));
        self.flags |= CepFlags::DATA_RECEIVED;
        self.flags.remove(CepFlags::HDR_RECEIVED);

        if self.flags.contains(CepFlags::ON_SERVER) {
            let remote_data = self.comm.buf[HDR_SIZE..self.comm.length.max(HDR_SIZE)].to_vec();
            let outcome = self.server_handle_data_received(remote_data);
            self.comm.reset();
            outcome
        } else {
            let hdr = frame::decode_header(&self.comm.buf);
            let payload_len = hdr.length as usize;
            self.comm.reset();
            if WireStatus::from_u8(hdr.status) == Some(WireStatus::Rejected) {
                debug_assert!(!self.flags.contains(CepFlags::CLIENT_CONNECTED_CB_INVOKED));
                self.flags |= CepFlags::CLIENT_GOT_REJECT;
                self.client_invoke_connect_cb(Status::Rejected, payload_len)
            } else {
                self.client_invoke_connect_cb(Status::Ok, payload_len)
            }
        }
    }

    fn server_handle_data_received(&mut self, remote_data: Vec<u8>) -> CepOutcome {
        if self.flags.contains(CepFlags::DATA_SENT) {
            debug_assert!(self.flags.contains(CepFlags::SERVER_CREATED));
            self.flags |= CepFlags::SERVER_NOTIFY_CB_INVOKED;
            CepOutcome::ServerNotify { cb: self.server_notify_cb.take().unwrap(), status: Status::Ok }
        } else if !self.flags.contains(CepFlags::SERVER_CREATED) {
            self.flags |= CepFlags::SERVER_CONN_REQ_CB_INVOKED;
            CepOutcome::ServerConnRequest { remote_data }
        } else {
            warn!(token = ?self.token, flags = ?self.flags, "sockcm: unexpected server ep state on data received");
            self.handle_event_status(Status::IoError)
        }
    }

    fn client_invoke_connect_cb(&mut self, status: Status, payload_len: usize) -> CepOutcome {
        let remote_data = self.comm.buf[HDR_SIZE..HDR_SIZE + payload_len].to_vec();
        self.flags |= CepFlags::CLIENT_CONNECTED_CB_INVOKED;
        CepOutcome::ClientConnect {
            cb: self.client_connect_cb.take().expect("client_connect_cb fires exactly once"),
            status,
            remote_data,
        }
    }

    // ---- error / teardown -----------------------------------------------

    /// The remote peer reset the connection, or a recv/send error occurred
    /// that must be treated the same way: distinguishes a network-level
    /// reject (client sent its frame, never heard back) from a reset after
    /// a real connection was established.
    fn handle_remote_disconnect(&mut self, status: Status) -> CepOutcome {
        debug!(token = ?self.token, peer = %self.peer_addr_string(), ?status, "sockcm: remote peer disconnected");

        let cb_status = if self.flags.contains(CepFlags::ON_CLIENT)
            && self.flags.contains(CepFlags::DATA_SENT)
            && !self.flags.intersects(CepFlags::HDR_RECEIVED | CepFlags::DATA_RECEIVED)
        {
            self.flags |= CepFlags::CLIENT_GOT_REJECT;
            Status::Unreachable
        } else {
            status
        };

        self.comm.reset();
        self.handle_event_status(cb_status)
    }

    /// Single terminal-error entry point: every non-`Ok` event this CEP can
    /// observe — a reactor-reported fd error, a recv/send I/O failure, a
    /// peer reset — funnels through here exactly once. Unconditionally
    /// removes the fd from the reactor (by leaving `self` in a state
    /// `Manager::rearm` recognizes as terminal) and sets `Failed` before
    /// returning, whatever the outcome; the caller must not call this twice
    /// on the same CEP.
    fn handle_event_status(&mut self, status: Status) -> CepOutcome {
        debug_assert!(status != Status::Ok);
        debug_assert!(!self.flags.contains(CepFlags::FAILED));

        if self.flags.contains(CepFlags::ON_SERVER)
            && !self.flags.intersects(CepFlags::SERVER_CREATED | CepFlags::SERVER_CONN_REQ_CB_INVOKED)
        {
            // Never surfaced to the user (pre-accept, pre-conn_request_cb);
            // quietly drop it rather than invoking any callback.
            self.flags |= CepFlags::FAILED;
            return CepOutcome::Reap;
        }

        // A CEP already mid a failed user callback (ResolveCbFailed/
        // PackCbFailed) has already had its one chance to observe the
        // failure; don't invoke a second callback for it. Likewise a server
        // CEP that hasn't been accepted yet (conn_request_cb fired, but no
        // ServerCreated) has no notify_cb to call.
        let should_invoke = !self.flags.intersects(CepFlags::RESOLVE_CB_FAILED | CepFlags::PACK_CB_FAILED)
            && self.flags.intersects(CepFlags::SERVER_CREATED | CepFlags::ON_CLIENT);

        let outcome = if !should_invoke {
            CepOutcome::Pending
        } else if self.is_connected() {
            self.flags |= CepFlags::DISCONNECTED;
            CepOutcome::Disconnect {
                cb: self.disconnect_cb.take().expect("disconnect_cb fires exactly once"),
                status,
            }
        } else if self.flags.contains(CepFlags::ON_CLIENT) {
            // Once resolve/pack has happened at all, any later failure is a
            // genuine connect error and must reach client_connect_cb — not
            // just the narrower "resolve_cb already invoked" case, or a
            // pack_cb-configured client whose first send attempt fails would
            // never hear back.
            if self.flags.intersects(CepFlags::RESOLVE_CB_INVOKED | CepFlags::PRIV_DATA_PACKED) {
                self.client_invoke_connect_cb(status, 0)
            } else {
                self.resolve(status);
                // A `priv_pack_cb`-configured client packs synchronously
                // inside `resolve`, so the failure can be reported right
                // away instead of waiting for another reactor event on a
                // socket that's already dead.
                if self.flags.intersects(CepFlags::PRIV_DATA_PACKED | CepFlags::PACK_CB_FAILED) {
                    self.client_invoke_connect_cb(status, 0)
                } else {
                    CepOutcome::Pending
                }
            }
        } else {
            debug_assert!(self.flags.contains(CepFlags::ON_SERVER));
            match self.server_notify_cb.take() {
                Some(cb) => {
                    self.flags |= CepFlags::SERVER_NOTIFY_CB_INVOKED;
                    CepOutcome::ServerNotify { cb, status }
                }
                // server might not have a valid ep yet (pre-accept) - no callback to invoke
                None => CepOutcome::Reap,
            }
        };

        self.flags |= CepFlags::FAILED;
        outcome
    }

    /// Top-level error-path entry driven by the reactor reporting a
    /// readiness error on this CEP's fd (as opposed to an I/O error
    /// surfaced from an actual `send`/`recv` call). Funnels straight into
    /// the same unified handler every other error path uses.
    pub(crate) fn handle_event_error(&mut self, status: Status, reason: &str) -> CepOutcome {
        trace!(
            token = ?self.token,
            peer = %self.peer_addr_string(),
            ?status,
            reason,
            flags = ?self.flags,
            "sockcm: handling fd error event"
        );
        self.handle_event_status(status)
    }

    /// Half-closes the write side so the peer sees EOF while this side keeps
    /// reading until it observes the peer's own disconnect (which drives
    /// `disconnect_cb`).
    pub(crate) fn disconnect(&mut self) -> crate::error::Result<()> {
        use crate::error::SockCmError;

        if self.flags.contains(CepFlags::FAILED) && !self.flags.contains(CepFlags::DISCONNECTED) {
            return Err(SockCmError::NotConnected);
        }
        if self.flags.contains(CepFlags::DISCONNECTING) {
            return if self.flags.contains(CepFlags::DISCONNECTED) {
                Err(SockCmError::NotConnected)
            } else {
                Err(SockCmError::InProgress)
            };
        }
        if !self.is_connected() {
            return Err(SockCmError::Busy);
        }

        self.flags |= CepFlags::DISCONNECTING;
        match self.stream.shutdown(std::net::Shutdown::Write) {
            Ok(()) => Ok(()),
            Err(ref err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(SockCmError::Io(err)),
        }
    }
}
