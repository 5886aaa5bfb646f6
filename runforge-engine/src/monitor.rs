//! Per-run health monitoring
//!
//! One monitor task per active run. The task polls process liveness
//! (quickly during the startup grace window, coarsely afterwards), flips
//! the in-memory status to `running` once the grace window elapses, and on
//! exit classifies the outcome, writes it back to the store, and tears down
//! the registry entry and port allocation.
//!
//! A separate, non-destructive health check reports whether an active run
//! looks stuck based on log-activity heuristics; it never terminates
//! anything.

use chrono::Utc;
use runforge_core::domain::run::{HealthReport, RunStatus, RunUpdate};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::ports::PortAllocator;
use crate::process::ProcessHandle;
use crate::registry::RunRegistry;
use crate::store::RunStore;

/// Everything a monitor task needs to drive one run to a terminal state
pub(crate) struct MonitorContext {
    pub run_id: Uuid,
    pub handle: Arc<ProcessHandle>,
    pub registry: Arc<RunRegistry>,
    pub allocator: Arc<PortAllocator>,
    pub store: Arc<dyn RunStore>,
    pub config: EngineConfig,
}

/// Spawns the monitor task for a freshly launched run.
pub(crate) fn spawn_monitor(ctx: MonitorContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let run_id = ctx.run_id;
        match watch(&ctx).await {
            Ok(status) => {
                finalize(&ctx, status.0, status.1).await;
            }
            Err(e) => {
                // A broken monitor must not leave the run stuck in
                // starting/running; force it terminal.
                error!("Monitor for run {} failed: {:#}", run_id, e);
                finalize(&ctx, RunStatus::Error, None).await;
            }
        }
    })
}

/// Polls the process until it exits; returns the classified outcome.
async fn watch(ctx: &MonitorContext) -> anyhow::Result<(RunStatus, Option<i32>)> {
    info!(
        "Monitoring run {} (pid {})",
        ctx.run_id,
        ctx.handle.pid()
    );
    let started = Instant::now();

    loop {
        let in_grace = started.elapsed() < ctx.config.grace_window;
        let interval = if in_grace {
            ctx.config.poll_fast
        } else {
            ctx.config.poll_slow
        };
        tokio::time::sleep(interval).await;

        match ctx.handle.try_wait().await {
            Ok(Some(status)) => {
                return Ok((classify(&status), status.code()));
            }
            Ok(None) => {
                if started.elapsed() >= ctx.config.grace_window {
                    ctx.registry.set_status(&ctx.run_id, RunStatus::Running);
                }
            }
            Err(e) => {
                warn!("Error polling process for run {}: {:#}", ctx.run_id, e);
                return Ok((RunStatus::Error, None));
            }
        }
    }
}

/// Commits the terminal outcome and tears down the registry entry.
async fn finalize(ctx: &MonitorContext, mut status: RunStatus, return_code: Option<i32>) {
    // A concurrent graceful stop may already have claimed this outcome;
    // whoever observed `stopped` first wins.
    match ctx.store.get(ctx.run_id).await {
        Ok(Some(record)) if record.status == RunStatus::Stopped => {
            info!(
                "Run {} preserving user-initiated stopped status",
                ctx.run_id
            );
            status = RunStatus::Stopped;
        }
        Ok(_) => {}
        Err(e) => {
            warn!(
                "Could not re-read persisted status for run {}: {:#}",
                ctx.run_id, e
            );
        }
    }

    ctx.registry.set_status(&ctx.run_id, status);
    info!(
        "Run {} finished with status {} (return code {:?})",
        ctx.run_id, status, return_code
    );

    let update = RunUpdate::terminal(status, Utc::now(), return_code);
    if let Err(e) = ctx.store.apply(ctx.run_id, update).await {
        // Reconciliation failure: the persisted record is now stale, but
        // the monitor must not crash over it.
        error!(
            "Failed to persist terminal status for run {}: {:#}",
            ctx.run_id, e
        );
    }

    ctx.registry.remove(&ctx.run_id);
    ctx.allocator.release(&ctx.run_id);
}

/// Maps a wait status onto a terminal run status.
fn classify(status: &ExitStatus) -> RunStatus {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal: Option<i32> = None;

    classify_exit(status.code(), signal)
}

/// Pure exit classification: zero succeeds, signals and negative codes were
/// killed, positive codes failed, and no obtainable outcome is an error.
pub(crate) fn classify_exit(code: Option<i32>, signal: Option<i32>) -> RunStatus {
    match (code, signal) {
        (_, Some(_)) => RunStatus::Killed,
        (Some(0), None) => RunStatus::Succeeded,
        (Some(code), None) if code < 0 => RunStatus::Killed,
        (Some(_), None) => RunStatus::Failed,
        (None, None) => RunStatus::Error,
    }
}

/// Advisory stuck check for an active run.
///
/// A run is stuck when its current execution has been alive longer than the
/// stuck threshold and the log file has not been written within that same
/// window. Absence of data that simply has not appeared yet (no log file)
/// is healthy, not stuck.
pub(crate) async fn check_health(
    run_id: Uuid,
    registry: &RunRegistry,
    store: &dyn RunStore,
    config: &EngineConfig,
) -> HealthReport {
    let Some(handle) = registry.handle(&run_id) else {
        return HealthReport::inactive("Process not found in active runs");
    };

    match handle.try_wait().await {
        Ok(Some(status)) => {
            return HealthReport::inactive(format!(
                "Process exited with code {:?}",
                status.code()
            ));
        }
        Err(e) => {
            return HealthReport::inactive(format!("Error checking process: {:#}", e));
        }
        Ok(None) => {}
    }

    let record = match store.get(run_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return HealthReport::inactive("Run record not found in store"),
        Err(e) => return HealthReport::inactive(format!("Error reading run record: {:#}", e)),
    };

    let log_meta = match std::fs::metadata(&record.log_path) {
        Ok(meta) => meta,
        Err(_) => {
            return HealthReport::healthy("Log file not yet created (early startup)");
        }
    };

    let seconds_since_log_update = log_meta
        .modified()
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);

    // Runtime of the current execution, not the first one
    let execution_start = record.last_restarted_at.or(record.started_at);
    let runtime_seconds = execution_start
        .map(|start| (Utc::now() - start).num_seconds().max(0) as u64)
        .unwrap_or(0);

    let threshold = config.stuck_threshold.as_secs();
    let stuck = runtime_seconds > threshold && seconds_since_log_update > threshold;

    HealthReport {
        healthy: !stuck,
        stuck,
        reason: if stuck {
            format!("No log activity for {} seconds", seconds_since_log_update)
        } else {
            "Process appears healthy".to_string()
        },
        pid: Some(handle.pid()),
        runtime_seconds: Some(runtime_seconds),
        seconds_since_log_update: Some(seconds_since_log_update),
        log_size_bytes: Some(log_meta.len()),
    }
}
