//! Shared foundation types for the chaostrace workspace.
//!
//! Every other crate in this workspace defines its own `thiserror` error
//! enum and wraps the handful of leaf variants here via `#[from]` rather
//! than redefining "an I/O error happened" five times over.

use thiserror::Error;

/// Leaf errors common to more than one crate in the workspace.
#[derive(Error, Debug)]
pub enum FoundationError {
    /// Filesystem or socket I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias over [`FoundationError`].
pub type Result<T> = std::result::Result<T, FoundationError>;

/// A UTC timestamp, serialized the same way across every event and
/// lifecycle record in the workspace.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// The current instant, as a [`Timestamp`].
pub fn now() -> Timestamp {
    chrono::Utc::now()
}
