//! Per-run filesystem layout
//!
//! Every run owns a directory under the workspace root holding its config
//! snapshot, combined stdout/stderr log, and trainer results. This module
//! also resolves an environment path (file, or directory plus executable
//! name) to the concrete executable the trainer launches.

use anyhow::{Context, Result, bail};
use std::fs::File;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Paths owned by a single run
#[derive(Debug, Clone)]
pub struct RunPaths {
    /// The run's artifacts directory
    pub run_dir: PathBuf,
    /// Trainer configuration file (snapshot written at creation)
    pub config_path: PathBuf,
    /// Combined stdout/stderr log
    pub log_path: PathBuf,
    /// Trainer output directory (created by the trainer itself)
    pub results_dir: PathBuf,
}

/// Computes the canonical layout for a run.
pub fn run_paths(root: &Path, experiment_id: &str, revision_id: &str, run_id: Uuid) -> RunPaths {
    let run_dir = root
        .join("runs")
        .join(experiment_id)
        .join(revision_id)
        .join(run_id.to_string());
    RunPaths {
        config_path: run_dir.join("config.yaml"),
        log_path: run_dir.join("stdout.log"),
        results_dir: run_dir.join("results"),
        run_dir,
    }
}

/// Creates the run directory. The results directory is left to the trainer.
pub fn ensure_run_dir(paths: &RunPaths) -> Result<()> {
    std::fs::create_dir_all(&paths.run_dir)
        .with_context(|| format!("Failed to create run directory {}", paths.run_dir.display()))
}

/// Opens the run log for appending, truncating first unless `preserve`.
pub fn prepare_log(log_path: &Path, preserve: bool) -> Result<File> {
    if !preserve {
        File::create(log_path)
            .with_context(|| format!("Failed to truncate log file {}", log_path.display()))?;
    }
    File::options()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))
}

/// Clears execution artifacts before a non-resume restart: empties the log
/// and removes the results directory.
pub fn clear_artifacts(log_path: &Path, results_dir: &Path) -> Result<()> {
    if log_path.exists() {
        File::create(log_path)
            .with_context(|| format!("Failed to clear log file {}", log_path.display()))?;
    }
    if results_dir.exists() {
        std::fs::remove_dir_all(results_dir).with_context(|| {
            format!("Failed to clear results directory {}", results_dir.display())
        })?;
    }
    Ok(())
}

/// Resolves an environment path to the executable the trainer should load.
///
/// Accepts either an executable file directly, or a directory together with
/// the executable's file name inside it.
pub fn resolve_env_executable(env_path: &Path, executable_file: Option<&str>) -> Result<PathBuf> {
    if !env_path.exists() {
        bail!("Environment path does not exist: {}", env_path.display());
    }

    if env_path.is_file() {
        if !is_executable(env_path) {
            bail!(
                "Environment file is not executable: {}",
                env_path.display()
            );
        }
        return Ok(env_path.to_path_buf());
    }

    if env_path.is_dir() {
        let Some(name) = executable_file else {
            bail!(
                "Environment path {} is a directory; an executable file name is required",
                env_path.display()
            );
        };
        let full = env_path.join(name);
        if !full.is_file() || !is_executable(&full) {
            bail!(
                "Executable file not found or not executable: {}",
                full.display()
            );
        }
        return Ok(full);
    }

    bail!(
        "Environment path is neither a file nor a directory: {}",
        env_path.display()
    );
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}
