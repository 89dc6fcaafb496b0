use std::time::Duration;

use crate::{state::DisconnectReason, store::StoreError};

/// Errors surfaced to administrative callers of the session core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid session id {0:?}")]
    InvalidSessionId(String),

    #[error("session {0} already exists")]
    AlreadyExists(String),

    #[error("session {0} not found")]
    NotFound(String),

    #[error("session {0} is not authenticated")]
    NotAuthenticated(String),

    #[error("session registry is shut down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error("network: {0}")]
    Network(#[from] anyhow::Error),
}

/// Why an interactive pairing attempt produced no code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("pairing timed out after {0:?}")]
    TimedOut(Duration),

    #[error("session ended before pairing: {0}")]
    SessionEnded(DisconnectReason),

    #[error("session was removed before pairing")]
    Removed,

    #[error("failed to render pairing code: {0}")]
    Render(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
