//! Event payloads and callback signatures exchanged between a [`crate::Cep`]
//! and its owner.
//!
//! Most callbacks are single-shot (`FnOnce`): the manager never calls one
//! more than once per endpoint, matching the original protocol's per-CEP
//! handshake lifecycle. The listener's `conn_request_cb` is the one
//! exception — it fires once per accepted connection for as long as the
//! listener lives, so it is `FnMut`.

use std::net::SocketAddr;

use mio::Token;

use crate::{cep::Cep, status::Status};

/// Identifies one [`crate::Cep`] within its owning [`crate::Manager`].
/// Thin wrapper over the `mio::Token` used to register the endpoint's
/// socket with the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub(crate) Token);

impl EndpointId {
    pub(crate) fn new(token: Token) -> Self {
        Self(token)
    }

    pub(crate) fn token(&self) -> Token {
        self.0
    }
}

/// Private-data payload handed back to a callback, borrowed from the CEP's
/// internal receive buffer. Valid only for the duration of the callback.
pub type RemoteData<'a> = &'a [u8];

/// Argument to `resolve_cb`: fires once the client's connect() syscall has
/// progressed enough to know the local address actually used (relevant when
/// the OS picked an ephemeral port/interface).
pub struct ResolveEvent {
    pub endpoint: EndpointId,
    pub local_addr: SocketAddr,
    /// Name of the local interface carrying `local_addr` (e.g. `"eth0"`),
    /// when the lookup succeeds. Best-effort diagnostic, not an invariant.
    pub dev_name: Option<String>,
}

/// Argument to `priv_pack_cb`: the endpoint is ready to send its private
/// data frame and is asking the owner to fill `buf` (up to the manager's
/// configured cap).
pub struct PackArgs<'a> {
    pub endpoint: EndpointId,
    pub buf: &'a mut Vec<u8>,
}

/// Argument to a client's `connect_cb`: the handshake has finished from the
/// client's perspective (either it received the server's reply frame, or
/// the attempt failed).
pub struct ClientConnectEvent<'a> {
    pub endpoint: EndpointId,
    pub status: Status,
    pub remote_data: RemoteData<'a>,
}

/// Argument to a server's `notify_cb`: delivered after the server has sent
/// its reply frame (success) or decided to reject, notifying the owner the
/// handshake on this CEP is done.
pub struct ServerNotifyEvent {
    pub endpoint: EndpointId,
    pub status: Status,
}

/// Argument to `disconnect_cb`: the peer tore down the connection after a
/// successful handshake (not to be confused with handshake-time failures,
/// which go through `connect_cb`/`notify_cb` instead).
pub struct DisconnectEvent {
    pub endpoint: EndpointId,
    pub status: Status,
}

/// Argument to a listener's `conn_request_cb`. Owns the accepted CEP:
/// accepting it (via [`crate::Manager::accept`]) or letting it drop rejects
/// the connection, matching the "ownership passes to the user" invariant.
pub struct ConnRequestArgs {
    pub listener: EndpointId,
    pub peer_addr: SocketAddr,
    pub remote_data: Vec<u8>,
    pub(crate) pending: ConnRequest,
}

/// An accepted-but-not-yet-claimed server connection. Dropping this without
/// calling [`crate::Manager::accept`] closes the socket and rejects the peer.
pub struct ConnRequest {
    pub(crate) cep: Cep,
}

pub(crate) type ResolveCb = Box<dyn FnOnce(ResolveEvent)>;
pub(crate) type PrivPackCb = Box<dyn FnOnce(PackArgs<'_>)>;
pub(crate) type ClientConnectCb = Box<dyn FnOnce(ClientConnectEvent<'_>)>;
pub(crate) type ServerNotifyCb = Box<dyn FnOnce(ServerNotifyEvent)>;
pub(crate) type DisconnectCb = Box<dyn FnOnce(DisconnectEvent)>;
pub(crate) type ConnRequestCb = Box<dyn FnMut(ConnRequestArgs)>;
