//! Error taxonomy for a detection run.
//!
//! Every variant terminates the run; none is retried automatically.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DetectError>;

/// Message shown when the transport failure looks like the service is down.
pub const BACKEND_UNREACHABLE: &str =
    "Backend unreachable, check that the detection service is running";

const UNREACHABLE_MARKERS: &[&str] = &[
    "error sending request",
    "connection refused",
    "connection reset",
    "dns error",
    "failed to lookup address",
    "network is unreachable",
    "tcp connect error",
    "io error",
    "timed out",
];

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DetectError {
    /// Rejected locally before any submission.
    #[error("{0}")]
    Validation(String),

    /// Connect/submit/HTTP failure.
    #[error("{0}")]
    Transport(String),

    /// Explicit failure event pushed by the backend.
    #[error("{0}")]
    BackendTask(String),

    #[error("{what} timed out after {}", humantime::format_duration(*.after))]
    Timeout { what: &'static str, after: Duration },

    /// Operation not allowed in the current run status.
    #[error("{0}")]
    InvalidState(String),
}

impl DetectError {
    /// Build a transport error, normalizing recognized network failures.
    pub fn transport(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let lower = detail.to_ascii_lowercase();
        if UNREACHABLE_MARKERS.iter().any(|m| lower.contains(m)) {
            tracing::debug!(%detail, "normalizing transport failure");
            DetectError::Transport(BACKEND_UNREACHABLE.to_string())
        } else {
            DetectError::Transport(detail)
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, DetectError::Validation(_))
    }
}

impl From<reqwest::Error> for DetectError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            return DetectError::Transport(BACKEND_UNREACHABLE.to_string());
        }
        DetectError::transport(format!("{e:#}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DetectError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Io(io) => DetectError::transport(format!("io error: {io}")),
            other => DetectError::transport(format!("websocket connection failed: {other}")),
        }
    }
}
