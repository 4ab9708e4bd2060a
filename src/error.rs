//! Error taxonomy for app orchestration.
//!
//! Validation failures (`Config`, `Resolution`) abort a single operation before any
//! side effect. `SessionExists` and `PortConflict` carry the conflicting identity so a
//! caller can decide to force-resolve. `Timeout`, `Update` and `Unsupported` are
//! reported as warnings by the orchestrator and never abort an operation on their own.

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T, E = DevrackError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DevrackError {
    /// Invalid or missing descriptor field, or a duplicate name.
    #[error("config error: {0}")]
    Config(String),

    /// Working directory, entry point or management file could not be resolved.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// The session technology refused to create or destroy a session.
    #[error("backend error: {0}")]
    Backend(String),

    /// A session with this name is already live.
    #[error("session '{0}' already exists")]
    SessionExists(String),

    /// The port is held by processes that do not belong to this app's session.
    #[error("port {port} is in use by pid(s) {}", format_pids(.pids))]
    PortConflict { port: u16, pids: Vec<u32> },

    /// `wait_for_port_free` exceeded its bound.
    #[error("port {port} still in use after {waited_ms}ms")]
    Timeout { port: u16, waited_ms: u128 },

    /// Source pull or dependency sync failed.
    #[error("update error: {0}")]
    Update(String),

    /// The backend cannot perform the requested signal.
    #[error("unsupported by {backend} backend: {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DevrackError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn resolution(message: impl Into<String>) -> Self {
        Self::Resolution(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    pub fn update(message: impl Into<String>) -> Self {
        Self::Update(message.into())
    }

    pub fn unsupported(backend: &'static str, operation: &'static str) -> Self {
        Self::Unsupported { backend, operation }
    }

    /// Conflicts are the only failures a caller can retry with force.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::SessionExists(_) | Self::PortConflict { .. })
    }
}

fn format_pids(pids: &[u32]) -> String {
    pids.iter()
        .map(|pid| pid.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
