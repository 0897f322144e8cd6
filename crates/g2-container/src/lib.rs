//! The container execution engine (§4.5-4.6): runtime abstraction, deterministic
//! mount construction, and the sentinel-framed process runner.

pub mod marker;
pub mod mount;
pub mod runner;
pub mod runtime;
pub mod types;

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to spawn container: {0}")]
    Spawn(String),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("mount not allowed: {0}")]
    MountNotAllowed(PathBuf),
}

pub type Result<T> = std::result::Result<T, ContainerError>;

impl From<ContainerError> for g2_core::Error {
    fn from(e: ContainerError) -> Self {
        g2_core::Error::Container(e.to_string())
    }
}

pub use marker::MarkerScanner;
pub use mount::{MountAllowlist, MountBuilder};
pub use runner::{ContainerHandle, ContainerRunner, RunningContainer};
pub use runtime::{CliContainerRuntime, ContainerRuntime};
pub use types::{
    AdditionalMount, ContainerInput, ContainerOutcome, GroupMountSpec, RunStatus, Secrets,
    TimeoutConfig, VolumeMount, SECRET_KEYS,
};
