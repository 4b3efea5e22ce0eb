//! Error types for session-wrapped requests

use transport::{StatusCode, TransportError};

/// Errors surfaced to callers of `RefreshCoordinator::request`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No response was obtained.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The API answered with a non-2xx status that the refresh flow does not
    /// absorb (including a 401 on a replayed request).
    #[error("{message}")]
    Rejected { status: StatusCode, message: String },

    /// The credential could not be refreshed; the session has been ended.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// The caller that was refreshing went away before the refresh settled.
    #[error("credential refresh abandoned before completion")]
    RefreshAbandoned,

    /// Too many callers already waiting on the in-flight refresh.
    #[error("too many requests waiting for credential refresh (limit {0})")]
    TooManyPending(usize),
}

impl Error {
    /// HTTP status carried by a rejection, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the caller must sign in again.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Error::SessionExpired(_))
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
