// pulsegate/src/error.rs
//
// Library error type. Device probe failures never surface here; the
// collector turns them into sentinel values (see fingerprint::ProbeError).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Classifier endpoint unreachable, non-2xx, or otherwise failed.
    #[error("transport error{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Transport {
        message: String,
        status:  Option<u16>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("session is closed")]
    SessionClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into(), status: None }
    }

    pub fn transport_status(status: u16, message: impl Into<String>) -> Self {
        Self::Transport { message: message.into(), status: Some(status) }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
