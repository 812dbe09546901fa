//! Error taxonomy for capture sessions

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = CaptureError> = std::result::Result<T, E>;

/// Errors raised by capture sessions and their collaborators.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Invalid configuration, reported before any hardware is touched
    #[error("invalid configuration: {0}")]
    Precondition(String),

    #[error("failed to resolve rendezvous authority {host}")]
    Resolve {
        host: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("no trigger response within {0:?}")]
    Timeout(Duration),

    #[error("malformed trigger message {message:?}: {reason}")]
    MalformedResponse { message: String, reason: String },

    #[error("coordination failed: {0}")]
    Coordination(String),

    #[error("camera error: {0}")]
    Camera(String),

    #[error("cannot persist frame to {path}: {reason}")]
    Sink { path: PathBuf, reason: String },

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session cancelled")]
    Cancelled,
}

/// Coarse classification used for reporting and exit handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Precondition,
    Coordination,
    Runtime,
    Cancelled,
}

impl CaptureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::Precondition(_) => ErrorKind::Precondition,
            CaptureError::Resolve { .. }
            | CaptureError::Timeout(_)
            | CaptureError::MalformedResponse { .. }
            | CaptureError::Coordination(_) => ErrorKind::Coordination,
            CaptureError::Camera(_)
            | CaptureError::Sink { .. }
            | CaptureError::Image(_)
            | CaptureError::Io(_) => ErrorKind::Runtime,
            CaptureError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn camera(err: impl std::fmt::Display) -> Self {
        CaptureError::Camera(err.to_string())
    }

    pub(crate) fn malformed(message: &str, reason: impl Into<String>) -> Self {
        CaptureError::MalformedResponse {
            message: message.to_string(),
            reason: reason.into(),
        }
    }
}
