use thiserror::Error;
use tidegate_blip::SenderClosed;

/// Protocol-level error for a single message exchange.
///
/// Handlers return these to the dispatcher, which encodes the status into
/// the paired response's `Error-Domain`/`Error-Code` properties. Store
/// conflicts bubble up through [`SyncError::Conflict`] unchanged; a closed
/// transport passes through as [`SyncError::SenderClosed`] so background
/// tasks can treat it as a clean shutdown.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{0}")]
    BadRequest(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
    #[error("delta unavailable")]
    DeltaUnavailable,
    #[error(transparent)]
    SenderClosed(#[from] SenderClosed),
}

impl SyncError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        SyncError::BadRequest(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        SyncError::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        SyncError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        SyncError::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        SyncError::Internal(msg.into())
    }

    /// The HTTP-shaped status the dispatcher writes into `Error-Code`.
    pub fn status(&self) -> u16 {
        match self {
            SyncError::BadRequest(_) => 400,
            SyncError::Forbidden(_) => 403,
            SyncError::NotFound(_) => 404,
            SyncError::Conflict(_) => 409,
            SyncError::Internal(_) | SyncError::DeltaUnavailable => 500,
            SyncError::SenderClosed(_) => 500,
        }
    }

    /// Whether this error means the connection is gone rather than the
    /// exchange having failed.
    pub fn is_transport_closed(&self) -> bool {
        matches!(self, SyncError::SenderClosed(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::BadRequest(format!("invalid JSON: {e}"))
    }
}
