//! External trainer process handling
//!
//! Spawns the trainer as the leader of its own process group, with combined
//! stdout/stderr appended to the run log file, and exposes group-wide
//! signaling so descendant environment workers die together with the
//! trainer. Liveness is observed through a non-blocking poll; nothing here
//! holds a lock across a blocking wait.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Handle to a spawned trainer process
///
/// The child is guarded by an async mutex taken only for the duration of a
/// single non-blocking poll, so a stop/kill caller and the health monitor
/// can both observe the process without blocking each other.
pub struct ProcessHandle {
    pid: u32,
    child: Mutex<Child>,
}

impl ProcessHandle {
    /// Spawns `program` with `args` in a new process group.
    ///
    /// Stdout and stderr are both redirected to `log_file`, which must be
    /// open in append mode so restarts in resume mode keep prior content.
    pub fn spawn(program: &str, args: &[String], log_file: &File, cwd: &Path) -> Result<Self> {
        let stdout = log_file
            .try_clone()
            .context("Failed to clone log file for stdout")?;
        let stderr = log_file
            .try_clone()
            .context("Failed to clone log file for stderr")?;

        let mut cmd = std::process::Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        #[cfg(unix)]
        {
            // New process group so the trainer and every worker it forks
            // can be signaled together.
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = tokio::process::Command::from(cmd)
            .spawn()
            .with_context(|| format!("Failed to spawn trainer process '{}'", program))?;

        let pid = child
            .id()
            .context("Spawned trainer process has no pid")?;

        Ok(Self {
            pid,
            child: Mutex::new(child),
        })
    }

    /// OS process id of the group leader.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking liveness poll; `Some(status)` once the process exited.
    pub async fn try_wait(&self) -> Result<Option<ExitStatus>> {
        let mut child = self.child.lock().await;
        child
            .try_wait()
            .context("Failed to poll trainer process status")
    }

    /// Polls for exit for up to `timeout`, checking every `poll`.
    ///
    /// Returns `Ok(None)` if the process is still alive at the deadline.
    pub async fn wait_timeout(
        &self,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait().await? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Requests graceful termination of the whole process group (SIGTERM).
    pub async fn terminate(&self) {
        #[cfg(unix)]
        signal_group(self.pid, nix::sys::signal::Signal::SIGTERM);

        #[cfg(not(unix))]
        {
            let mut child = self.child.lock().await;
            let _ = child.start_kill();
        }
    }

    /// Unconditionally kills the whole process group (SIGKILL).
    pub async fn kill(&self) {
        #[cfg(unix)]
        signal_group(self.pid, nix::sys::signal::Signal::SIGKILL);

        #[cfg(not(unix))]
        {
            let mut child = self.child.lock().await;
            let _ = child.start_kill();
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => debug!("Sent {} to process group {}", signal, pid),
        Err(e) => debug!(
            "Could not signal process group {} with {}: {} (may already be gone)",
            pid, signal, e
        ),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Read;

    fn sh_handle(dir: &Path, script: &str, log: &File) -> ProcessHandle {
        ProcessHandle::spawn(
            "/bin/sh",
            &["-c".to_string(), script.to_string()],
            log,
            dir,
        )
        .expect("spawn")
    }

    #[tokio::test]
    async fn test_spawn_captures_output_and_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("stdout.log");
        let log = File::options()
            .create(true)
            .append(true)
            .open(&log_path)
            .unwrap();

        let handle = sh_handle(dir.path(), "echo hello; exit 0", &log);
        let status = handle
            .wait_timeout(Duration::from_secs(5), Duration::from_millis(20))
            .await
            .unwrap()
            .expect("process should exit");
        assert_eq!(status.code(), Some(0));

        let mut contents = String::new();
        File::open(&log_path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert!(contents.contains("hello"));
    }

    #[tokio::test]
    async fn test_kill_takes_down_the_group() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("stdout.log");
        let log = File::options()
            .create(true)
            .append(true)
            .open(&log_path)
            .unwrap();

        // Parent shell forks a child sleeper; both belong to the group.
        let handle = sh_handle(dir.path(), "sleep 30 & sleep 30", &log);
        assert!(handle.try_wait().await.unwrap().is_none());

        handle.kill().await;
        let status = handle
            .wait_timeout(Duration::from_secs(5), Duration::from_millis(20))
            .await
            .unwrap()
            .expect("killed process should be reaped");

        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.signal(), Some(9));
    }
}
