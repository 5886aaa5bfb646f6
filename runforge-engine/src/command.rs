//! Trainer command construction
//!
//! Pure translation from a run's immutable snapshot and allocated base port
//! to the trainer's argument list. No filesystem or process side effects.

use runforge_core::domain::run::{CliFlags, RestartMode};
use std::path::Path;

/// Trainer run name; outputs land in `<results-dir>/<RUN_NAME>/`, which is
/// why the run's artifacts directory is passed as `--results-dir`.
const RUN_NAME: &str = "results";

/// Builds the ordered argument list for one trainer invocation.
///
/// Defaults come from [`CliFlags`]; a `seed` of -1 and a `torch_device` of
/// "auto" are omitted so the trainer applies its own behavior. The restart
/// switch, when present, is appended last.
pub fn build_args(
    config_path: &Path,
    env_path: &Path,
    results_dir: &Path,
    flags: &CliFlags,
    base_port: u16,
    restart_mode: Option<RestartMode>,
) -> Vec<String> {
    let mut args = vec![
        config_path.display().to_string(),
        format!("--run-id={}", RUN_NAME),
        format!("--env={}", env_path.display()),
        format!("--time-scale={}", flags.time_scale),
        format!("--base-port={}", base_port),
        format!("--num-envs={}", flags.num_envs),
    ];

    if flags.no_graphics {
        args.push("--no-graphics".to_string());
    }

    args.push(format!("--results-dir={}", results_dir.display()));

    if flags.seed != -1 {
        args.push(format!("--seed={}", flags.seed));
    }

    if !flags.torch_device.is_empty() && !flags.torch_device.eq_ignore_ascii_case("auto") {
        args.push(format!("--torch-device={}", flags.torch_device));
    }

    args.push(format!("--width={}", flags.width));
    args.push(format!("--height={}", flags.height));
    args.push(format!("--quality-level={}", flags.quality_level));

    if let Some(mode) = restart_mode {
        args.push(mode.as_flag().to_string());
    }

    args
}

/// Renders the full command line for persisting on the run record.
pub fn render_command_line(program: &str, args: &[String]) -> String {
    let mut line = String::from(program);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}
