//! Per-CEP role and OR-combinable lifecycle flags.
//!
//! The flag set mirrors the original connection endpoint's state bitmask
//! one-for-one (down to the naming), since the handshake's branching logic
//! is defined entirely in terms of these combinations and re-deriving them
//! independently would risk silently diverging from the protocol.

use bitflags::bitflags;

/// Which side of the handshake a CEP plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CepFlags: u32 {
        const ON_CLIENT                      = 1 << 0;
        const ON_SERVER                      = 1 << 1;

        /// Client's connect() has resolved a local address; `resolve_cb` fired.
        const RESOLVE_CB_INVOKED             = 1 << 2;
        /// The resolve attempt itself failed (address family mismatch, etc).
        const RESOLVE_CB_FAILED              = 1 << 3;

        /// `priv_pack_cb` has filled the endpoint's private-data frame.
        const PRIV_DATA_PACKED               = 1 << 4;
        /// `priv_pack_cb` declined to pack data (treated as a local failure).
        const PACK_CB_FAILED                 = 1 << 5;

        /// The one handshake frame this CEP sends has gone out in full.
        const DATA_SENT                      = 1 << 6;
        /// The one handshake frame from the peer has arrived in full.
        const DATA_RECEIVED                  = 1 << 7;
        /// The 3-byte header of the inbound frame has been read; payload
        /// still pending. Cleared once the payload completes.
        const HDR_RECEIVED                   = 1 << 8;

        /// Server: the listener has handed this CEP to `conn_request_cb`.
        const SERVER_CONN_REQ_CB_INVOKED     = 1 << 9;
        /// Server: the user accepted the connection (`Manager::accept`) and
        /// the CEP now lives under its destination manager.
        const SERVER_CREATED                 = 1 << 10;
        /// Server: the user rejected instead of accepting.
        const SERVER_REJECT_CALLED           = 1 << 11;
        /// Server: the reject frame has gone out.
        const SERVER_REJECT_SENT             = 1 << 12;
        /// Server: `server_notify_cb` has fired.
        const SERVER_NOTIFY_CB_INVOKED       = 1 << 13;

        /// Client: the handshake concluded with a reject frame instead of a
        /// normal reply.
        const CLIENT_GOT_REJECT              = 1 << 14;
        /// Client: `client_connect_cb` has fired.
        const CLIENT_CONNECTED_CB_INVOKED    = 1 << 15;
        /// Client: the post-connect notify ack has been scheduled.
        const CLIENT_NOTIFY_CALLED           = 1 << 16;
        /// Client: the post-connect notify ack has gone out.
        const CLIENT_NOTIFY_SENT             = 1 << 17;

        /// Explicit `disconnect()` has been requested on this CEP.
        const DISCONNECTING                  = 1 << 18;
        /// The CEP has fully torn down (socket closed, no further I/O).
        const DISCONNECTED                   = 1 << 19;
        /// An unrecoverable local/peer error occurred outside the normal
        /// handshake outcome (I/O error, peer reset mid-handshake).
        const FAILED                         = 1 << 20;
    }
}

impl CepFlags {
    /// True once the CEP has delivered its one terminal outcome to the user
    /// (`client_connect_cb` for clients, `server_notify_cb` for servers).
    pub fn terminal_cb_invoked(&self) -> bool {
        self.intersects(Self::CLIENT_CONNECTED_CB_INVOKED | Self::SERVER_NOTIFY_CB_INVOKED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_cb_invoked_tracks_either_role() {
        let mut f = CepFlags::ON_CLIENT;
        assert!(!f.terminal_cb_invoked());
        f |= CepFlags::CLIENT_CONNECTED_CB_INVOKED;
        assert!(f.terminal_cb_invoked());

        let mut g = CepFlags::ON_SERVER;
        assert!(!g.terminal_cb_invoked());
        g |= CepFlags::SERVER_NOTIFY_CB_INVOKED;
        assert!(g.terminal_cb_invoked());
    }
}
