//! Error types for the feedwatch components.
//!
//! Steady-state loops (sampling, queue draining, listening) never return these
//! upward; they are logged and the loop moves on. They surface only from the
//! explicit entry points (`start`, `stop`, `connect`, `send`, `submit`).

use crate::registry::SourceId;

/// Failure talking to one of the backend HTTP endpoints.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Connection refused, DNS failure, timeout.
    #[error("backend unreachable: {0}")]
    Transport(String),

    /// The backend answered with a non-success status.
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body did not match the expected shape.
    #[error("invalid backend response: {0}")]
    Decode(String),
}

impl From<ureq::Error> for BackendError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(status, response) => BackendError::Status {
                status,
                body: response.into_string().unwrap_or_default(),
            },
            ureq::Error::Transport(transport) => BackendError::Transport(transport.to_string()),
        }
    }
}

/// Failure submitting a single frame for detection.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("detection endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("detection endpoint returned {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("frame encoding failed: {0}")]
    Encode(String),

    #[error("detection response invalid: {0}")]
    Decode(String),
}

impl From<BackendError> for DispatchError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Transport(msg) => DispatchError::Unreachable(msg),
            BackendError::Status { status, body } => DispatchError::Backend { status, body },
            BackendError::Decode(msg) => DispatchError::Decode(msg),
        }
    }
}

/// Caller misuse of the worker supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("source {0} not found")]
    NotFound(SourceId),

    #[error("source {0} is not running")]
    NotRunning(SourceId),

    #[error("failed to spawn worker for source {id}: {reason}")]
    Spawn { id: SourceId, reason: String },
}

/// Failure on the message connection.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("not connected to message server")]
    NotConnected,

    #[error("failed to send message: {0}")]
    Send(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Invalid frame construction.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame dimensions overflow ({width}x{height})")]
    Overflow { width: u32, height: u32 },

    #[error("RGB frame length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}
