// Error taxonomy for navigation sync

use std::time::Duration;
use thiserror::Error;

/// A 4x4 transform was rejected; whatever was loaded before stays active.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("invalid matrix shape: expected 4x4, got {rows}x{cols}")]
    InvalidShape { rows: usize, cols: usize },

    #[error("matrix entry ({row}, {col}) is not finite")]
    NonFinite { row: usize, col: usize },

    #[error("matrix is singular (determinant {determinant:e})")]
    Singular { determinant: f64 },
}

/// Capability negotiation with the tracking source failed.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake connection failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("tracking source rejected session: {0}")]
    Rejected(String),

    #[error("handshake protocol error: {0}")]
    Protocol(String),
}

/// The persistent streaming channel could not be opened or was lost.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to open stream channel: {0}")]
    Open(#[source] std::io::Error),

    #[error("timed out opening stream channel")]
    OpenTimeout,

    #[error("stream channel dropped: {0}")]
    Dropped(String),

    #[error("stream client is already connected")]
    AlreadyConnected,
}

/// A single stream message could not be turned into a tracking tick.
#[derive(Debug, Error)]
pub enum MalformedTickError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid tick: {0}")]
    Invalid(String),
}

/// The external case store could not produce a transform.
#[derive(Debug, Error)]
pub enum CaseLookupError {
    #[error("no stored transform for case {0}")]
    NotFound(String),

    #[error("case store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("case file is not valid: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum NavError {
    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    MalformedTick(#[from] MalformedTickError),

    #[error(transparent)]
    CaseLookup(#[from] CaseLookupError),
}

pub type Result<T> = std::result::Result<T, NavError>;
