use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::session::SessionId;

/// Failures scoped to a single client connection.
///
/// None of these ever propagate past the task that owns the connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connection closed by peer")]
    EndOfStream,
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),
    #[error("session is closed")]
    Closed,
}

impl SessionError {
    pub(crate) fn handshake(reason: impl Into<String>) -> Self {
        Self::Handshake(reason.into())
    }

    /// True when the session ended without a transport fault: the peer hung up
    /// or the relay closed it on purpose.
    pub fn is_orderly(&self) -> bool {
        matches!(self, Self::EndOfStream | Self::Closed)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {0} is already registered")]
    DuplicateSession(SessionId),
    #[error("session {0} is not awaiting admission")]
    Inactive(SessionId),
    #[error("registry is shutting down")]
    ShuttingDown,
}

/// Whole-server failures. Only binding the listening socket can fail this way.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}
