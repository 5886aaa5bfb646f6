//! Run domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle status of a run
///
/// `Created`, `Starting` and `Running` are non-terminal; everything else is
/// terminal. A run can cycle from any terminal state back to `Starting` via
/// restart without changing its identity or immutable snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Specification stored, never launched
    Created,
    /// Process spawned, inside the startup grace window
    Starting,
    /// Confirmed alive past the grace window
    Running,
    /// Exited with code zero
    Succeeded,
    /// Exited with a positive code
    Failed,
    /// User-initiated graceful stop
    Stopped,
    /// Terminated by signal or forced kill
    Killed,
    /// The monitor could not determine a clean outcome
    Error,
    /// Known to neither the registry nor the store
    Unknown,
}

impl RunStatus {
    /// True for states that end an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded
                | RunStatus::Failed
                | RunStatus::Stopped
                | RunStatus::Killed
                | RunStatus::Error
        )
    }

    /// True while a process is (supposedly) alive for this run.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Starting | RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Created => "created",
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
            RunStatus::Killed => "killed",
            RunStatus::Error => "error",
            RunStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Restart mode for re-executing a run
///
/// Only meaningful on restart, never on first execution. `Resume` asks the
/// trainer to continue from its last checkpoint and preserves prior logs and
/// outputs; `Force` starts over and clears them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartMode {
    Resume,
    Force,
}

impl RestartMode {
    /// The trainer switch appended for this mode.
    pub fn as_flag(&self) -> &'static str {
        match self {
            RestartMode::Resume => "--resume",
            RestartMode::Force => "--force",
        }
    }
}

/// CLI flag bag passed to the trainer
///
/// Defaults match the trainer's own defaults; `seed` of -1 and a
/// `torch_device` of "auto" mean "let the trainer decide" and are omitted
/// from the command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliFlags {
    pub time_scale: u32,
    pub num_envs: u16,
    pub no_graphics: bool,
    pub seed: i64,
    pub torch_device: String,
    pub width: u32,
    pub height: u32,
    pub quality_level: u32,
}

impl Default for CliFlags {
    fn default() -> Self {
        Self {
            time_scale: 20,
            num_envs: 1,
            no_graphics: true,
            seed: -1,
            torch_device: "auto".to_string(),
            width: 84,
            height: 84,
            quality_level: 5,
        }
    }
}

/// Request to create a new run
///
/// Everything in here becomes part of the immutable snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    pub experiment_id: String,
    pub revision_id: String,
    /// Trainer configuration file content (stored verbatim)
    pub config_text: String,
    pub cli_flags: CliFlags,
    /// Environment executable, or a directory containing it
    pub env_path: PathBuf,
    /// Executable file name inside `env_path` when it is a directory
    pub executable_file: Option<String>,
}

/// Persisted run record
///
/// Owned by the external document store; the engine reads the immutable
/// snapshot and patches the mutable execution state via [`RunUpdate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub experiment_id: String,
    pub revision_id: String,

    // Immutable snapshot, fixed at creation
    pub config_text: String,
    pub cli_flags: CliFlags,
    pub resolved_env_path: PathBuf,

    // Filesystem layout, fixed at creation
    pub artifacts_dir: PathBuf,
    pub config_path: PathBuf,
    pub log_path: PathBuf,
    pub results_dir: PathBuf,

    // Mutable execution state
    pub status: RunStatus,
    pub process_id: Option<u32>,
    pub command: Option<String>,
    pub execution_count: u32,
    pub created_at: DateTime<Utc>,
    /// First execution time only; preserved across restarts
    pub started_at: Option<DateTime<Utc>>,
    pub last_restarted_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub return_code: Option<i32>,
}

/// Partial update applied to a run record
///
/// Outer `None` means "leave unchanged"; for nullable fields the inner
/// `Option` is the new value, so `Some(None)` clears the field.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub process_id: Option<Option<u32>>,
    pub command: Option<String>,
    pub execution_count: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_restarted_at: Option<DateTime<Utc>>,
    pub ended_at: Option<Option<DateTime<Utc>>>,
    pub return_code: Option<Option<i32>>,
}

impl RunUpdate {
    /// Shorthand for a terminal-status write-back.
    pub fn terminal(
        status: RunStatus,
        ended_at: DateTime<Utc>,
        return_code: Option<i32>,
    ) -> Self {
        Self {
            status: Some(status),
            ended_at: Some(Some(ended_at)),
            return_code: Some(return_code),
            ..Self::default()
        }
    }

    /// Applies this patch to a record in place.
    pub fn apply_to(&self, record: &mut RunRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(process_id) = self.process_id {
            record.process_id = process_id;
        }
        if let Some(ref command) = self.command {
            record.command = Some(command.clone());
        }
        if let Some(execution_count) = self.execution_count {
            record.execution_count = execution_count;
        }
        if let Some(started_at) = self.started_at {
            record.started_at = Some(started_at);
        }
        if let Some(last_restarted_at) = self.last_restarted_at {
            record.last_restarted_at = Some(last_restarted_at);
        }
        if let Some(ended_at) = self.ended_at {
            record.ended_at = ended_at;
        }
        if let Some(return_code) = self.return_code {
            record.return_code = return_code;
        }
    }
}

/// Advisory health snapshot for an active run
///
/// Reported by the non-destructive health check; never triggers termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub stuck: bool,
    pub reason: String,
    pub pid: Option<u32>,
    pub runtime_seconds: Option<u64>,
    pub seconds_since_log_update: Option<u64>,
    pub log_size_bytes: Option<u64>,
}

impl HealthReport {
    /// A report for a run with no live process.
    pub fn inactive(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            stuck: false,
            reason: reason.into(),
            pid: None,
            runtime_seconds: None,
            seconds_since_log_update: None,
            log_size_bytes: None,
        }
    }

    /// A healthy report with no further detail (e.g. log not yet created).
    pub fn healthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: true,
            stuck: false,
            reason: reason.into(),
            pid: None,
            runtime_seconds: None,
            seconds_since_log_update: None,
            log_size_bytes: None,
        }
    }
}
