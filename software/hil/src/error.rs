//! Error types for the link, the control law and the session as a whole.

use hil_shared::MalformedFrame;
use thiserror::Error;

/// Failure on a plant/controller link.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The other end is gone. Fatal for the session.
    #[error("link disconnected")]
    Disconnected,

    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(#[from] MalformedFrame),
}

/// Failure of a single `compute` call.
///
/// These never end a session; the controller client substitutes
/// its last safe command.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ComputeError {
    #[error("control law failed: {0}")]
    Failed(String),

    #[error("control law panicked: {0}")]
    Panicked(String),

    #[error("control law returned non-finite command {0}")]
    NonFinite(f64),
}

/// Failure to set up or run a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("telemetry error: {0}")]
    Telemetry(String),

    #[error("{0} thread panicked")]
    ThreadPanicked(String),
}
