//! Run engine facade
//!
//! Composes the port allocator, command builder, process launcher, registry
//! and monitor into the lifecycle operations the rest of the system calls:
//! create, execute, stop, restart, force-kill, status reconciliation and
//! the advisory health checks.

use chrono::Utc;
use runforge_core::domain::run::{
    HealthReport, RestartMode, RunRecord, RunSpec, RunStatus, RunUpdate,
};
use runforge_core::error::{EngineError, Result};
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::command;
use crate::config::EngineConfig;
use crate::monitor::{self, MonitorContext};
use crate::ports::PortAllocator;
use crate::process::ProcessHandle;
use crate::registry::RunRegistry;
use crate::store::RunStore;
use crate::workspace;

/// Interval used when waiting for a signaled process to go away
const EXIT_POLL: Duration = Duration::from_millis(200);

/// The run execution engine
///
/// One instance owns one registry and one port table; multiple isolated
/// instances can coexist (and be tested) in the same process.
pub struct RunEngine {
    config: EngineConfig,
    store: Arc<dyn RunStore>,
    registry: Arc<RunRegistry>,
    allocator: Arc<PortAllocator>,
}

impl RunEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn RunStore>) -> Self {
        let allocator = Arc::new(PortAllocator::new(config.port_floor, config.port_spacing));
        Self {
            config,
            store,
            registry: Arc::new(RunRegistry::new()),
            allocator,
        }
    }

    /// Stores a new run: immutable snapshot, status `created`, no process.
    ///
    /// Validates the specification and prepares the run directory and config
    /// snapshot on disk; nothing is spawned.
    pub async fn create(&self, spec: RunSpec) -> Result<Uuid> {
        let run_id = Uuid::new_v4();

        if spec.config_text.trim().is_empty() {
            return Err(EngineError::validation(
                run_id,
                "configuration text is required",
            ));
        }

        let resolved_env_path =
            workspace::resolve_env_executable(&spec.env_path, spec.executable_file.as_deref())
                .map_err(|e| EngineError::validation(run_id, format!("{:#}", e)))?;

        let paths = workspace::run_paths(
            &self.config.workspace_root,
            &spec.experiment_id,
            &spec.revision_id,
            run_id,
        );
        workspace::ensure_run_dir(&paths)
            .map_err(|e| EngineError::process(run_id, format!("{:#}", e)))?;
        std::fs::write(&paths.config_path, &spec.config_text)
            .map_err(|e| EngineError::process_io(run_id, "failed to write config snapshot", e))?;

        let record = RunRecord {
            id: run_id,
            experiment_id: spec.experiment_id,
            revision_id: spec.revision_id,
            config_text: spec.config_text,
            cli_flags: spec.cli_flags,
            resolved_env_path,
            artifacts_dir: paths.run_dir,
            config_path: paths.config_path,
            log_path: paths.log_path,
            results_dir: paths.results_dir,
            status: RunStatus::Created,
            process_id: None,
            command: None,
            execution_count: 0,
            created_at: Utc::now(),
            started_at: None,
            last_restarted_at: None,
            ended_at: None,
            return_code: None,
        };
        let experiment_id = record.experiment_id.clone();
        self.store.insert(record).await.map_err(|e| {
            EngineError::reconciliation(run_id, format!("failed to store run record: {:#}", e))
        })?;

        info!("Created run {} for experiment {}", run_id, experiment_id);
        Ok(run_id)
    }

    /// Creates a run and immediately executes it.
    pub async fn launch(&self, spec: RunSpec) -> Result<Uuid> {
        let run_id = self.create(spec).await?;
        self.execute(run_id, None).await?;
        Ok(run_id)
    }

    /// Executes a stored run using its immutable snapshot.
    ///
    /// Fails with a conflict if the run already has a live process, and with
    /// a validation error (before any side effect) if the snapshot is
    /// incomplete. A failed launch releases everything it allocated.
    pub async fn execute(&self, run_id: Uuid, restart_mode: Option<RestartMode>) -> Result<bool> {
        self.registry.reserve(run_id)?;

        match self.execute_reserved(run_id, restart_mode).await {
            Ok(launched) => Ok(launched),
            Err(e) => {
                // No half-started state may survive a failed execute.
                self.registry.remove(&run_id);
                self.allocator.release(&run_id);
                Err(e)
            }
        }
    }

    async fn execute_reserved(
        &self,
        run_id: Uuid,
        restart_mode: Option<RestartMode>,
    ) -> Result<bool> {
        let record = self
            .store
            .get(run_id)
            .await
            .map_err(|e| {
                EngineError::reconciliation(run_id, format!("failed to load run record: {:#}", e))
            })?
            .ok_or_else(|| EngineError::validation(run_id, "run not found"))?;

        if record.config_text.trim().is_empty() {
            return Err(EngineError::validation(
                run_id,
                "run is missing its configuration snapshot",
            ));
        }
        if record.resolved_env_path.as_os_str().is_empty() || !record.resolved_env_path.exists() {
            return Err(EngineError::validation(
                run_id,
                "resolved environment executable is missing",
            ));
        }

        let ports = self
            .allocator
            .allocate(run_id, record.cli_flags.num_envs)
            .map_err(|e| EngineError::process(run_id, format!("{:#}", e)))?;

        let preserve_log = restart_mode == Some(RestartMode::Resume);
        let mut log = workspace::prepare_log(&record.log_path, preserve_log)
            .map_err(|e| EngineError::process(run_id, format!("{:#}", e)))?;

        let args = command::build_args(
            &record.config_path,
            &record.resolved_env_path,
            &record.artifacts_dir,
            &record.cli_flags,
            ports.base,
            restart_mode,
        );
        let command_line = command::render_command_line(&self.config.trainer_program, &args);

        if !preserve_log {
            write_log_header(&mut log, run_id, &command_line).map_err(|e| {
                EngineError::process_io(run_id, "failed to write log header", e)
            })?;
        }

        info!("Executing run {}: {}", run_id, command_line);

        let handle = ProcessHandle::spawn(
            &self.config.trainer_program,
            &args,
            &log,
            &record.artifacts_dir,
        )
        .map_err(|e| EngineError::process(run_id, format!("{:#}", e)))?;
        let handle = Arc::new(handle);
        self.registry
            .activate(run_id, Arc::clone(&handle), ports);

        let now = Utc::now();
        let execution_count = record.execution_count + 1;
        let update = RunUpdate {
            status: Some(RunStatus::Starting),
            process_id: Some(Some(handle.pid())),
            command: Some(command_line),
            execution_count: Some(execution_count),
            // First execution time is preserved across restarts
            started_at: if record.started_at.is_none() {
                Some(now)
            } else {
                None
            },
            last_restarted_at: if execution_count > 1 { Some(now) } else { None },
            ended_at: Some(None),
            return_code: Some(None),
        };
        if let Err(e) = self.store.apply(run_id, update).await {
            // The execution cannot be recorded; do not leave an untracked
            // process behind.
            handle.kill().await;
            return Err(EngineError::reconciliation(
                run_id,
                format!("failed to record execution: {:#}", e),
            ));
        }

        let monitor = monitor::spawn_monitor(MonitorContext {
            run_id,
            handle,
            registry: Arc::clone(&self.registry),
            allocator: Arc::clone(&self.allocator),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        });
        self.registry.set_monitor(run_id, monitor);

        info!(
            "Run {} started (execution {} of this record)",
            run_id, execution_count
        );
        Ok(true)
    }

    /// Gracefully stops a run: SIGTERM to the process group, bounded wait,
    /// SIGKILL escalation, terminal status `stopped`.
    ///
    /// With no live process, an orphaned active record is reconciled to
    /// `stopped`; an already-terminal record is a successful no-op.
    pub async fn stop(&self, run_id: Uuid) -> Result<bool> {
        let Some(handle) = self.registry.handle(&run_id) else {
            return self.reconcile_orphan(run_id).await;
        };

        // Already exited naturally: classification belongs to the monitor.
        match handle.try_wait().await {
            Ok(Some(_)) => {
                info!("Run {} already exited; leaving outcome to its monitor", run_id);
                return Ok(true);
            }
            Ok(None) => {}
            Err(e) => warn!("Error checking process for run {}: {:#}", run_id, e),
        }

        // This stop owns the outcome; cancel the monitor before signaling
        // so it cannot classify the exit stop is about to cause.
        if let Some(monitor) = self.registry.take_monitor(&run_id) {
            monitor.abort();
        }

        info!("Stopping run {} (pid {})", run_id, handle.pid());
        handle.terminate().await;

        match handle
            .wait_timeout(self.config.stop_timeout, EXIT_POLL)
            .await
        {
            Ok(Some(_)) => info!("Run {} terminated gracefully", run_id),
            Ok(None) => {
                warn!(
                    "Run {} did not stop within {:?}, escalating to kill",
                    run_id, self.config.stop_timeout
                );
                handle.kill().await;
                if let Ok(None) = handle
                    .wait_timeout(self.config.kill_timeout, EXIT_POLL)
                    .await
                {
                    warn!("Run {} still alive after kill", run_id);
                }
            }
            Err(e) => warn!("Error waiting for run {} to stop: {:#}", run_id, e),
        }

        // A concurrent force kill may have claimed the outcome already.
        let status = match self.store.get(run_id).await {
            Ok(Some(record)) if record.status == RunStatus::Killed => RunStatus::Killed,
            _ => RunStatus::Stopped,
        };
        if let Err(e) = self
            .store
            .apply(run_id, RunUpdate::terminal(status, Utc::now(), None))
            .await
        {
            warn!("Failed to persist stop for run {}: {:#}", run_id, e);
        }

        self.teardown(&run_id);
        Ok(true)
    }

    /// Unconditionally kills the process group, bypassing the graceful
    /// window. Returns false if the run has no live process.
    pub async fn force_kill(&self, run_id: Uuid) -> Result<bool> {
        let Some(handle) = self.registry.handle(&run_id) else {
            warn!("Cannot force kill run {}: no live process", run_id);
            return Ok(false);
        };

        warn!("Force killing run {} (pid {})", run_id, handle.pid());
        handle.kill().await;
        let _ = handle
            .wait_timeout(self.config.kill_timeout, EXIT_POLL)
            .await;

        if let Some(monitor) = self.registry.take_monitor(&run_id) {
            monitor.abort();
        }

        if let Err(e) = self
            .store
            .apply(
                run_id,
                RunUpdate::terminal(RunStatus::Killed, Utc::now(), None),
            )
            .await
        {
            warn!("Failed to persist kill for run {}: {:#}", run_id, e);
        }

        self.teardown(&run_id);
        Ok(true)
    }

    /// Restarts a run: stop if live, clear artifacts unless resuming, then
    /// execute again with the given mode.
    pub async fn restart(&self, run_id: Uuid, mode: Option<RestartMode>) -> Result<bool> {
        let record = self
            .store
            .get(run_id)
            .await
            .map_err(|e| {
                EngineError::reconciliation(run_id, format!("failed to load run record: {:#}", e))
            })?
            .ok_or_else(|| EngineError::validation(run_id, "run not found"))?;

        if self.registry.contains(&run_id) {
            info!("Stopping run {} before restart", run_id);
            self.stop(run_id).await?;
        }

        if mode != Some(RestartMode::Resume) {
            // Cleanup failures do not block the relaunch.
            if let Err(e) = workspace::clear_artifacts(&record.log_path, &record.results_dir) {
                warn!("Error clearing artifacts for run {}: {:#}", run_id, e);
            }
        }

        self.execute(run_id, mode).await
    }

    /// Single source of truth for a run's status: live registry entry
    /// first, persisted record second, `unknown` last.
    pub async fn effective_status(&self, run_id: Uuid) -> RunStatus {
        if let Some(status) = self.registry.status(&run_id) {
            return status;
        }
        match self.store.get(run_id).await {
            Ok(Some(record)) => record.status,
            Ok(None) => RunStatus::Unknown,
            Err(e) => {
                warn!("Error reading persisted status for run {}: {:#}", run_id, e);
                RunStatus::Unknown
            }
        }
    }

    /// Advisory health check; never terminates anything.
    pub async fn check_process_health(&self, run_id: Uuid) -> HealthReport {
        monitor::check_health(run_id, &self.registry, self.store.as_ref(), &self.config).await
    }

    /// Ids of active runs that currently look stuck.
    pub async fn list_stale(&self) -> Vec<Uuid> {
        let mut stale = Vec::new();
        for run_id in self.registry.active_ids() {
            let health = self.check_process_health(run_id).await;
            if health.stuck {
                stale.push(run_id);
            }
        }
        stale
    }

    /// Ids of runs currently owned by this engine instance.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.registry.active_ids()
    }

    /// Stops every active run. Used for graceful engine shutdown.
    pub async fn shutdown(&self) {
        info!("Shutting down run engine; stopping all active runs");
        for run_id in self.registry.active_ids() {
            if let Err(e) = self.stop(run_id).await {
                warn!("Failed to stop run {} during shutdown: {:#}", run_id, e);
            }
        }
    }

    /// Reconciles a stop request for a run with no live process.
    async fn reconcile_orphan(&self, run_id: Uuid) -> Result<bool> {
        let record = self
            .store
            .get(run_id)
            .await
            .map_err(|e| {
                EngineError::reconciliation(run_id, format!("failed to load run record: {:#}", e))
            })?
            .ok_or_else(|| EngineError::validation(run_id, "run not found"))?;

        if record.status.is_active() {
            // The record claims a process this engine does not own.
            info!("Reconciling orphaned run {} to stopped", run_id);
            self.store
                .apply(
                    run_id,
                    RunUpdate::terminal(RunStatus::Stopped, Utc::now(), None),
                )
                .await
                .map_err(|e| {
                    EngineError::reconciliation(
                        run_id,
                        format!("failed to reconcile orphaned run: {:#}", e),
                    )
                })?;
            return Ok(true);
        }

        if record.status.is_terminal() {
            // Already settled; nothing to do.
            return Ok(true);
        }

        warn!("No active process found for run {}", run_id);
        Ok(false)
    }

    /// Removes the registry entry and port allocation. Idempotent; the
    /// monitor performs the same teardown on natural exit.
    fn teardown(&self, run_id: &Uuid) {
        self.registry.remove(run_id);
        self.allocator.release(run_id);
    }
}

fn write_log_header(log: &mut File, run_id: Uuid, command_line: &str) -> std::io::Result<()> {
    use std::io::Write;
    writeln!(log, "=== Training Run ===")?;
    writeln!(log, "Run ID: {}", run_id)?;
    writeln!(log, "Command: {}", command_line)?;
    writeln!(log, "Started: {}", Utc::now().to_rfc3339())?;
    writeln!(log, "{}", "=".repeat(50))?;
    writeln!(log)
}
