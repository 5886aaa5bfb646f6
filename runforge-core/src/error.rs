//! Error types for the run execution engine

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by engine operations
///
/// Validation and conflict errors are synchronous and reach the caller of
/// `execute`/`stop`/`restart` directly. Process errors indicate a failed
/// spawn after which any allocated resources have been rolled back.
/// Reconciliation errors mean a persisted-store write failed; monitor-side
/// occurrences are logged rather than raised.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or invalid run specification, detected before any side effect
    #[error("validation failed for run {run_id}: {message}")]
    Validation { run_id: Uuid, message: String },

    /// The run already owns a live process, or the requested operation is
    /// incompatible with its current state
    #[error("conflict on run {run_id}: {message}")]
    Conflict { run_id: Uuid, message: String },

    /// Spawning or signaling the external process failed
    #[error("process error for run {run_id}: {message}")]
    Process {
        run_id: Uuid,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// A persisted-store write failed during or after an execution
    #[error("reconciliation failed for run {run_id}: {message}")]
    Reconciliation { run_id: Uuid, message: String },
}

impl EngineError {
    pub fn validation(run_id: Uuid, message: impl Into<String>) -> Self {
        Self::Validation {
            run_id,
            message: message.into(),
        }
    }

    pub fn conflict(run_id: Uuid, message: impl Into<String>) -> Self {
        Self::Conflict {
            run_id,
            message: message.into(),
        }
    }

    pub fn process(run_id: Uuid, message: impl Into<String>) -> Self {
        Self::Process {
            run_id,
            message: message.into(),
            source: None,
        }
    }

    pub fn process_io(run_id: Uuid, message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Process {
            run_id,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn reconciliation(run_id: Uuid, message: impl Into<String>) -> Self {
        Self::Reconciliation {
            run_id,
            message: message.into(),
        }
    }

    /// The run this error concerns.
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::Validation { run_id, .. }
            | Self::Conflict { run_id, .. }
            | Self::Process { run_id, .. }
            | Self::Reconciliation { run_id, .. } => *run_id,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_process(&self) -> bool {
        matches!(self, Self::Process { .. })
    }

    pub fn is_reconciliation(&self) -> bool {
        matches!(self, Self::Reconciliation { .. })
    }
}
