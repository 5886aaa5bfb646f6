//! End-to-end lifecycle tests against real processes.
//!
//! Each test gets its own workspace, store and engine, and a stand-in
//! trainer script so runs execute in milliseconds instead of hours.

#![cfg(unix)]

use runforge_core::domain::run::{CliFlags, RestartMode, RunSpec, RunStatus};
use runforge_engine::config::EngineConfig;
use runforge_engine::engine::RunEngine;
use runforge_engine::store::{MemoryRunStore, RunStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Harness {
    _dir: tempfile::TempDir,
    env_path: PathBuf,
    engine: Arc<RunEngine>,
    store: Arc<MemoryRunStore>,
}

impl Harness {
    /// Engine wired to a shell script standing in for the trainer.
    fn with_trainer(trainer_body: &str) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        let trainer = dir.path().join("trainer.sh");
        write_script(&trainer, trainer_body);
        let env_path = dir.path().join("env.x86_64");
        write_script(&env_path, "exit 0");

        let mut config = EngineConfig::new(dir.path().to_path_buf());
        config.trainer_program = trainer.display().to_string();
        config.grace_window = Duration::from_millis(100);
        config.poll_fast = Duration::from_millis(20);
        config.poll_slow = Duration::from_millis(50);
        config.stop_timeout = Duration::from_millis(500);
        config.kill_timeout = Duration::from_secs(2);
        config.stuck_threshold = Duration::from_secs(1);

        let store = Arc::new(MemoryRunStore::new());
        let engine = Arc::new(RunEngine::new(config, store.clone()));
        Self {
            _dir: dir,
            env_path,
            engine,
            store,
        }
    }

    fn spec(&self) -> RunSpec {
        RunSpec {
            experiment_id: "exp".to_string(),
            revision_id: "rev".to_string(),
            config_text: "behaviors: {}".to_string(),
            cli_flags: CliFlags::default(),
            env_path: self.env_path.clone(),
            executable_file: None,
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    let mut perms = std::fs::metadata(path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).expect("chmod script");
}

async fn wait_for_terminal(engine: &RunEngine, run_id: Uuid) -> RunStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = engine.effective_status(run_id).await;
        if status.is_terminal() {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {} never reached a terminal status (last seen: {})",
            run_id,
            status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_successful_run_reaches_succeeded() {
    let h = Harness::with_trainer("echo training; exit 0");
    let run_id = h.engine.launch(h.spec()).await.unwrap();

    assert_eq!(wait_for_terminal(&h.engine, run_id).await, RunStatus::Succeeded);
    assert!(h.engine.active_runs().is_empty());

    let record = h.store.get(run_id).await.unwrap().expect("record");
    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.return_code, Some(0));
    assert_eq!(record.execution_count, 1);
    assert!(record.started_at.is_some());
    assert!(record.last_restarted_at.is_none());
    assert!(record.ended_at.is_some());
    assert!(record.process_id.is_some());

    // Combined log: header first, then trainer output
    let contents = std::fs::read_to_string(&record.log_path).unwrap();
    assert!(contents.contains("=== Training Run ==="));
    assert!(contents.contains(&run_id.to_string()));
    assert!(contents.contains("training"));
}

#[tokio::test]
async fn test_nonzero_exit_reaches_failed() {
    let h = Harness::with_trainer("exit 3");
    let run_id = h.engine.launch(h.spec()).await.unwrap();

    assert_eq!(wait_for_terminal(&h.engine, run_id).await, RunStatus::Failed);
    let record = h.store.get(run_id).await.unwrap().expect("record");
    assert_eq!(record.return_code, Some(3));
}

#[tokio::test]
async fn test_second_execute_conflicts_while_live() {
    let h = Harness::with_trainer("sleep 30");
    let run_id = h.engine.launch(h.spec()).await.unwrap();

    let err = h.engine.execute(run_id, None).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(err.run_id(), run_id);

    h.engine.stop(run_id).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_executes_admit_exactly_one() {
    let h = Harness::with_trainer("sleep 30");
    let run_id = h.engine.create(h.spec()).await.unwrap();

    let (a, b) = tokio::join!(
        h.engine.execute(run_id, None),
        h.engine.execute(run_id, None)
    );
    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1, "exactly one launch wins");
    let conflict = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
    assert!(conflict.is_conflict());

    h.engine.stop(run_id).await.unwrap();
}

#[tokio::test]
async fn test_stop_yields_stopped() {
    let h = Harness::with_trainer("sleep 30");
    let run_id = h.engine.launch(h.spec()).await.unwrap();

    assert!(h.engine.stop(run_id).await.unwrap());
    assert_eq!(h.engine.effective_status(run_id).await, RunStatus::Stopped);
    assert!(h.engine.active_runs().is_empty());

    // No late monitor write may flip the operator's decision
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.engine.effective_status(run_id).await, RunStatus::Stopped);
}

#[tokio::test]
async fn test_stop_escalates_when_sigterm_is_ignored() {
    let h = Harness::with_trainer("trap '' TERM; sleep 30");
    let run_id = h.engine.launch(h.spec()).await.unwrap();

    // Give the shell a moment to install its trap
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(h.engine.stop(run_id).await.unwrap());
    assert_eq!(h.engine.effective_status(run_id).await, RunStatus::Stopped);
    assert!(h.engine.active_runs().is_empty());
}

#[tokio::test]
async fn test_force_kill_yields_killed() {
    let h = Harness::with_trainer("sleep 30");
    let run_id = h.engine.launch(h.spec()).await.unwrap();

    assert!(h.engine.force_kill(run_id).await.unwrap());
    assert_eq!(h.engine.effective_status(run_id).await, RunStatus::Killed);
    assert!(h.engine.active_runs().is_empty());
}

#[tokio::test]
async fn test_force_kill_during_graceful_stop_yields_killed() {
    let h = Harness::with_trainer("trap '' TERM; sleep 30");
    let run_id = h.engine.launch(h.spec()).await.unwrap();

    // Give the shell a moment to install its trap
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Stop sits in its graceful wait because the trainer ignores TERM
    let engine = h.engine.clone();
    let stopper = tokio::spawn(async move { engine.stop(run_id).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(h.engine.force_kill(run_id).await.unwrap());
    stopper.await.unwrap().unwrap();

    // The kill wins over the in-flight stop
    assert_eq!(h.engine.effective_status(run_id).await, RunStatus::Killed);
    assert!(h.engine.active_runs().is_empty());

    // Port allocation was released: the run is executable again
    assert!(h.engine.execute(run_id, Some(RestartMode::Resume)).await.unwrap());
    h.engine.stop(run_id).await.unwrap();
}

#[tokio::test]
async fn test_force_kill_without_live_process_is_refused() {
    let h = Harness::with_trainer("exit 0");
    let run_id = h.engine.create(h.spec()).await.unwrap();

    assert!(!h.engine.force_kill(run_id).await.unwrap());
    assert_eq!(h.engine.effective_status(run_id).await, RunStatus::Created);
}

#[tokio::test]
async fn test_restart_resume_preserves_log_and_passes_resume() {
    let h = Harness::with_trainer("echo pass; exit 0");
    let run_id = h.engine.launch(h.spec()).await.unwrap();
    wait_for_terminal(&h.engine, run_id).await;

    assert!(h.engine.restart(run_id, Some(RestartMode::Resume)).await.unwrap());
    wait_for_terminal(&h.engine, run_id).await;

    let record = h.store.get(run_id).await.unwrap().expect("record");
    assert_eq!(record.execution_count, 2);
    assert!(record.last_restarted_at.is_some());
    assert!(record.command.as_deref().unwrap().ends_with("--resume"));

    // Output from both executions survives a resume
    let contents = std::fs::read_to_string(&record.log_path).unwrap();
    assert_eq!(contents.matches("pass").count(), 2);
}

#[tokio::test]
async fn test_restart_force_clears_artifacts_and_passes_force() {
    let h = Harness::with_trainer("echo pass; exit 0");
    let run_id = h.engine.launch(h.spec()).await.unwrap();
    wait_for_terminal(&h.engine, run_id).await;

    // Prior results from the first execution
    let record = h.store.get(run_id).await.unwrap().expect("record");
    std::fs::create_dir_all(record.results_dir.join("checkpoints")).unwrap();

    assert!(h.engine.restart(run_id, Some(RestartMode::Force)).await.unwrap());
    wait_for_terminal(&h.engine, run_id).await;

    let record = h.store.get(run_id).await.unwrap().expect("record");
    assert!(record.command.as_deref().unwrap().ends_with("--force"));
    assert!(!record.results_dir.join("checkpoints").exists());

    // Log was truncated: one header, one line of output
    let contents = std::fs::read_to_string(&record.log_path).unwrap();
    assert_eq!(contents.matches("=== Training Run ===").count(), 1);
    assert_eq!(contents.matches("pass").count(), 1);
}

#[tokio::test]
async fn test_restart_of_live_run_stops_it_first() {
    let h = Harness::with_trainer("sleep 30");
    let run_id = h.engine.launch(h.spec()).await.unwrap();
    let first_pid = h.store.get(run_id).await.unwrap().unwrap().process_id;

    assert!(h.engine.restart(run_id, Some(RestartMode::Resume)).await.unwrap());

    let record = h.store.get(run_id).await.unwrap().expect("record");
    assert_eq!(record.execution_count, 2);
    assert!(record.status.is_active());
    assert_ne!(record.process_id, first_pid);
    assert_eq!(h.engine.active_runs(), vec![run_id]);

    h.engine.stop(run_id).await.unwrap();
}

#[tokio::test]
async fn test_stop_reconciles_orphaned_record() {
    let h = Harness::with_trainer("exit 0");
    let run_id = h.engine.create(h.spec()).await.unwrap();

    // Record claims a live process this engine does not own
    use runforge_core::domain::run::RunUpdate;
    h.store
        .apply(
            run_id,
            RunUpdate {
                status: Some(RunStatus::Running),
                process_id: Some(Some(999_999)),
                ..RunUpdate::default()
            },
        )
        .await
        .unwrap();

    assert!(h.engine.stop(run_id).await.unwrap());
    assert_eq!(h.engine.effective_status(run_id).await, RunStatus::Stopped);
}

#[tokio::test]
async fn test_stop_without_process_or_orphan() {
    let h = Harness::with_trainer("exit 0");

    // Never-launched run: nothing to stop
    let run_id = h.engine.create(h.spec()).await.unwrap();
    assert!(!h.engine.stop(run_id).await.unwrap());
    assert_eq!(h.engine.effective_status(run_id).await, RunStatus::Created);

    // Already-terminal run: successful no-op, outcome untouched
    let done = h.engine.launch(h.spec()).await.unwrap();
    assert_eq!(wait_for_terminal(&h.engine, done).await, RunStatus::Succeeded);
    assert!(h.engine.stop(done).await.unwrap());
    assert_eq!(h.engine.effective_status(done).await, RunStatus::Succeeded);

    // Unknown run id is a validation error
    let err = h.engine.stop(Uuid::new_v4()).await.unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_effective_status_prefers_live_registry() {
    let h = Harness::with_trainer("sleep 30");
    let run_id = h.engine.launch(h.spec()).await.unwrap();

    // Past the grace window the registry says running while the stored
    // record still says starting.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.engine.effective_status(run_id).await, RunStatus::Running);
    let record = h.store.get(run_id).await.unwrap().expect("record");
    assert_eq!(record.status, RunStatus::Starting);

    h.engine.stop(run_id).await.unwrap();
}

#[tokio::test]
async fn test_health_check_reports_active_and_inactive() {
    let h = Harness::with_trainer("sleep 30");
    let run_id = h.engine.launch(h.spec()).await.unwrap();

    let health = h.engine.check_process_health(run_id).await;
    assert!(health.healthy);
    assert!(!health.stuck);
    assert!(health.pid.is_some());
    assert!(health.log_size_bytes.is_some());

    h.engine.stop(run_id).await.unwrap();

    let health = h.engine.check_process_health(run_id).await;
    assert!(!health.healthy);
    assert!(!health.stuck);
    assert!(health.pid.is_none());
}

#[tokio::test]
async fn test_silent_run_goes_stale() {
    let h = Harness::with_trainer("sleep 30");
    let run_id = h.engine.launch(h.spec()).await.unwrap();

    // Fresh runs are never stale
    assert!(h.engine.list_stale().await.is_empty());

    // Outlive the 1s stuck threshold with no log activity
    tokio::time::sleep(Duration::from_millis(2300)).await;
    let health = h.engine.check_process_health(run_id).await;
    assert!(health.stuck, "silent long-running process should be stuck");
    assert_eq!(h.engine.list_stale().await, vec![run_id]);

    h.engine.stop(run_id).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_every_active_run() {
    let h = Harness::with_trainer("sleep 30");
    let a = h.engine.launch(h.spec()).await.unwrap();
    let b = h.engine.launch(h.spec()).await.unwrap();
    assert_eq!(h.engine.active_runs().len(), 2);

    h.engine.shutdown().await;

    assert!(h.engine.active_runs().is_empty());
    assert_eq!(h.engine.effective_status(a).await, RunStatus::Stopped);
    assert_eq!(h.engine.effective_status(b).await, RunStatus::Stopped);
}

#[tokio::test]
async fn test_failed_launch_releases_everything() {
    let h = Harness::with_trainer("exit 0");
    let run_id = h.engine.create(h.spec()).await.unwrap();

    // Pull the environment out from under the snapshot
    std::fs::remove_file(&h.env_path).unwrap();

    let err = h.engine.execute(run_id, None).await.unwrap_err();
    assert!(err.is_validation());
    assert!(h.engine.active_runs().is_empty());

    // The run is executable again once the environment is back
    write_script(&h.env_path, "exit 0");
    assert!(h.engine.execute(run_id, None).await.unwrap());
    assert_eq!(wait_for_terminal(&h.engine, run_id).await, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_concurrent_runs_get_disjoint_ports() {
    let h = Harness::with_trainer("sleep 30");
    let a = h.engine.launch(h.spec()).await.unwrap();
    let b = h.engine.launch(h.spec()).await.unwrap();

    let port = |cmd: &str| -> u16 {
        cmd.split_whitespace()
            .find_map(|arg| arg.strip_prefix("--base-port="))
            .expect("base port in command")
            .parse()
            .expect("numeric port")
    };
    let cmd_a = h.store.get(a).await.unwrap().unwrap().command.unwrap();
    let cmd_b = h.store.get(b).await.unwrap().unwrap().command.unwrap();
    assert_ne!(port(&cmd_a), port(&cmd_b));

    h.engine.shutdown().await;
}
