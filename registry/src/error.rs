//! Error types returned by the registry

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Expected, recoverable failures of registry operations.
///
/// Stop-side outcomes ("nothing running", "already exited") are not errors;
/// they come back as plain `bool`/`usize` values.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("receiver executable not found: {0}")]
    NotFound(String),

    #[error("instance '{label}' is already running (PID={pid})")]
    AlreadyRunning { label: String, pid: u32 },

    #[error("failed to start instance '{label}': {source}")]
    Spawn {
        label: String,
        #[source]
        source: io::Error,
    },

    #[error("instance label must not be empty")]
    EmptyLabel,

    #[error("invalid base port {0}: the receiver binds base_port..=base_port+2")]
    InvalidPort(u16),
}

impl RegistryError {
    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::NotFound(_) => "not_found",
            RegistryError::AlreadyRunning { .. } => "already_running",
            RegistryError::Spawn { .. } => "spawn_failure",
            RegistryError::EmptyLabel => "empty_label",
            RegistryError::InvalidPort(_) => "invalid_port",
        }
    }
}
