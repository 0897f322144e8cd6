use std::path::PathBuf;

/// Core error type for the orchestrator host.
///
/// Adapter crates (`g2-store`, `g2-container`, `g2-channels`, `g2-orchestrator`) map
/// their specific errors into this type so callers can handle failures consistently
/// (fatal at startup vs recoverable mid-run).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("security violation: {0}")]
    Security(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("container error: {0}")]
    Container(String),

    #[error("ipc handler error: {0}")]
    IpcHandler(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
