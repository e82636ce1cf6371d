// Error types shared by the relay.
//
// Nothing here is ever sent to a client: a session that fails simply has its
// stream closed, and the failure is logged by whoever owns that session.

use std::io;

use thiserror::Error;

use crate::server::connection::ConnectionId;

/// Top-level error for the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Accept/read/write failure. Always local to one connection, except when
    /// it comes from binding the listener.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The session never produced a usable display name.
    #[error("registration failed: {0}")]
    Registration(#[from] RegistrationError),

    /// A client sent a line longer than the configured limit.
    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },

    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The async runtime could not be built.
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Why a session never reached `Active`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("stream closed before a display name was received")]
    StreamClosed,

    #[error("display name is empty")]
    EmptyName,
}

/// A single recipient could not be reached during a broadcast.
///
/// Collected into a `BroadcastReport` and logged, never propagated.
#[derive(Debug, Error)]
#[error("failed to send to {peer} ({id}): {source}")]
pub struct WriteFailure {
    pub id: ConnectionId,
    pub peer: String,
    #[source]
    pub source: io::Error,
}

pub type Result<T> = std::result::Result<T, RelayError>;
