//! Engine configuration
//!
//! Defines all tunable parameters for the execution engine: workspace
//! location, trainer program, port allocation bounds, monitor polling
//! cadence, and termination timeouts.

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration
///
/// All timeouts and intervals are configurable to allow tuning for
/// different deployments (and fast, deterministic tests).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for per-run artifacts (config, log, results)
    pub workspace_root: PathBuf,

    /// Trainer program invoked for each execution
    pub trainer_program: String,

    /// Lowest port the allocator will hand out
    pub port_floor: u16,

    /// Margin kept free between any two allocated port ranges
    pub port_spacing: u16,

    /// Startup window during which the monitor polls quickly and the run
    /// stays in `starting`
    pub grace_window: Duration,

    /// Liveness poll interval inside the grace window
    pub poll_fast: Duration,

    /// Liveness poll interval after the grace window
    pub poll_slow: Duration,

    /// How long a graceful stop waits before escalating to a kill
    pub stop_timeout: Duration,

    /// How long to wait for a kill to take effect
    pub kill_timeout: Duration,

    /// Runtime and log-silence threshold for the advisory stuck check
    pub stuck_threshold: Duration,
}

impl EngineConfig {
    /// Creates a configuration with defaults for everything but the
    /// workspace root.
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            workspace_root,
            trainer_program: "mlagents-learn".to_string(),
            port_floor: 5000,
            port_spacing: 10,
            grace_window: Duration::from_secs(60),
            poll_fast: Duration::from_secs(5),
            poll_slow: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(30),
            kill_timeout: Duration::from_secs(10),
            stuck_threshold: Duration::from_secs(120),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Recognized variables (all optional):
    /// - WORKSPACE (default: /workspace)
    /// - TRAINER_PROGRAM (default: mlagents-learn)
    /// - PORT_FLOOR (default: 5000)
    /// - PORT_SPACING (default: 10)
    /// - GRACE_WINDOW_SECS (default: 60)
    /// - STOP_TIMEOUT_SECS (default: 30)
    /// - STUCK_THRESHOLD_SECS (default: 120)
    pub fn from_env() -> Result<Self> {
        let workspace_root = std::env::var("WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/workspace"));

        let mut config = Self::new(workspace_root);

        if let Ok(program) = std::env::var("TRAINER_PROGRAM") {
            config.trainer_program = program;
        }
        if let Some(floor) = env_parse::<u16>("PORT_FLOOR") {
            config.port_floor = floor;
        }
        if let Some(spacing) = env_parse::<u16>("PORT_SPACING") {
            config.port_spacing = spacing;
        }
        if let Some(secs) = env_parse::<u64>("GRACE_WINDOW_SECS") {
            config.grace_window = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("STOP_TIMEOUT_SECS") {
            config.stop_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("STUCK_THRESHOLD_SECS") {
            config.stuck_threshold = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.trainer_program.is_empty() {
            anyhow::bail!("trainer_program cannot be empty");
        }

        if self.workspace_root.as_os_str().is_empty() {
            anyhow::bail!("workspace_root cannot be empty");
        }

        if self.port_floor < 1024 {
            anyhow::bail!("port_floor must be at least 1024");
        }

        if self.port_spacing == 0 {
            anyhow::bail!("port_spacing must be greater than 0");
        }

        if self.poll_fast.is_zero() || self.poll_slow.is_zero() {
            anyhow::bail!("poll intervals must be greater than 0");
        }

        if self.stop_timeout.is_zero() {
            anyhow::bail!("stop_timeout must be greater than 0");
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}
