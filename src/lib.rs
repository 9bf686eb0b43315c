//! Non-blocking TCP connection-manager endpoint state machine.
//!
//! A [`Manager`] owns a set of connection endpoints (CEPs), each driving a
//! single non-blocking TCP socket through a bounded handshake: client and
//! server exchange exactly one length-prefixed private-data frame apiece,
//! after which the connection is handed to the application as an ordinary
//! established stream (read/write beyond the handshake is out of scope —
//! see the crate's spec for the full boundary).
//!
//! Drive every manager you create with [`Manager::poll`] from your own
//! event loop; every outcome (resolve, pack, connect, accept, disconnect)
//! is delivered through callbacks supplied when the operation was started.

mod callbacks;
mod cep;
mod config;
mod error;
mod frame;
mod manager;
mod socket;
mod state;
mod status;

pub use callbacks::{
    ClientConnectEvent, ConnRequest, ConnRequestArgs, DisconnectEvent, EndpointId, PackArgs,
    RemoteData, ResolveEvent, ServerNotifyEvent,
};
pub use config::ManagerConfig;
pub use error::{Result, SockCmError};
pub use manager::{ClientParams, Manager};
pub use status::Status;
