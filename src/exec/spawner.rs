//! Agent process spawning.
//!
//! Builds the agent invocation with:
//! - the fixed streaming flag set, in the order the agent CLI expects;
//! - the caller's environment minus the nested-session markers, so an agent
//!   launched from inside another agent session does not refuse to start;
//! - `kill_on_drop(true)` so abandoned processes are cleaned up.
//!
//! Also hosts the preflight check and the exit supervisor that turns a
//! kill request into SIGTERM followed by a forced kill after a grace period.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::execution::ExecuteOptions;
use crate::{AppError, Result};

/// Environment variables removed from the agent's environment.
///
/// The agent CLI refuses to start when it detects it is already running
/// inside one of its own sessions.
pub const NESTED_SESSION_MARKERS: &[&str] = &["CLAUDECODE"];

/// Upper bound for the `--version` probe.
pub const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the agent argument list.
///
/// `-p <prompt> --output-format stream-json --verbose
/// --dangerously-skip-permissions [--resume <id>] [--allowedTools <csv>]
/// [--mcp-config <path>] [--append-system-prompt <text>]`
#[must_use]
pub fn build_args(options: &ExecuteOptions) -> Vec<String> {
    let mut args = vec![
        "-p".to_owned(),
        options.prompt.clone(),
        "--output-format".to_owned(),
        "stream-json".to_owned(),
        "--verbose".to_owned(),
        "--dangerously-skip-permissions".to_owned(),
    ];

    if let Some(session_id) = options.resume_session_id.as_deref().filter(|s| !s.is_empty()) {
        args.push("--resume".to_owned());
        args.push(session_id.to_owned());
    }

    let tools: Vec<&str> = options
        .allowed_tools
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect();
    if !tools.is_empty() {
        args.push("--allowedTools".to_owned());
        args.push(tools.join(","));
    }

    if let Some(path) = options.mcp_config.as_deref().filter(|s| !s.is_empty()) {
        args.push("--mcp-config".to_owned());
        args.push(path.to_owned());
    }

    if let Some(text) = options
        .append_system_prompt
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        args.push("--append-system-prompt".to_owned());
        args.push(text.to_owned());
    }

    args
}

/// Build the [`Command`] for one execution. Stdout/stderr are left to the
/// capture strategy.
#[must_use]
pub fn build_command(program: &Path, options: &ExecuteOptions) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(build_args(options));

    for &key in NESTED_SESSION_MARKERS {
        cmd.env_remove(key);
    }

    cmd.current_dir(&options.working_directory)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    cmd
}

/// Resolve the agent binary on `PATH`.
///
/// # Errors
///
/// Returns [`AppError::Preflight`] when the binary cannot be found.
pub fn resolve_binary(binary: &str) -> Result<PathBuf> {
    which::which(binary).map_err(|err| {
        AppError::Preflight(format!(
            "agent binary `{binary}` not found on PATH ({err}); install it or set agent.binary"
        ))
    })
}

/// Run `<binary> --version` and return its trimmed output.
///
/// # Errors
///
/// Returns [`AppError::Preflight`] when the binary is missing, cannot run,
/// exits unsuccessfully, or does not answer within [`VERSION_PROBE_TIMEOUT`].
pub async fn probe_version(binary: &str) -> Result<String> {
    let program = resolve_binary(binary)?;

    let mut cmd = Command::new(&program);
    cmd.arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for &key in NESTED_SESSION_MARKERS {
        cmd.env_remove(key);
    }

    let output = match tokio::time::timeout(VERSION_PROBE_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            return Err(AppError::Preflight(format!(
                "agent binary `{binary}` could not be started: {err}"
            )));
        }
        Err(_elapsed) => {
            return Err(AppError::Preflight(format!(
                "agent binary `{binary}` did not answer --version within {VERSION_PROBE_TIMEOUT:?}"
            )));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::Preflight(format!(
            "agent binary `{binary}` --version failed ({}): {}",
            output.status,
            stderr.trim()
        )));
    }

    let version = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    debug!(binary, version, "agent version probe succeeded");
    Ok(version)
}

/// Spawn a background task that owns `child` until it exits.
///
/// When `kill` fires the process receives a termination signal; if it is
/// still alive after `grace` it is force-killed. `exited` flips to `true`
/// once the process has been reaped, before the task returns the status.
#[must_use]
pub fn supervise(
    mut child: Child,
    kill: CancellationToken,
    grace: Duration,
    exited: watch::Sender<bool>,
) -> JoinHandle<std::io::Result<ExitStatus>> {
    tokio::spawn(async move {
        let pid = child.id();
        let status = tokio::select! {
            status = child.wait() => status,
            () = kill.cancelled() => {
                info!(pid, "terminating agent process");
                terminate(&mut child);
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(status) => status,
                    Err(_elapsed) => {
                        warn!(pid, grace_secs = grace.as_secs(), "agent ignored termination signal, killing");
                        if let Err(err) = child.start_kill() {
                            warn!(pid, %err, "failed to kill agent process");
                        }
                        child.wait().await
                    }
                }
            }
        };

        match &status {
            Ok(s) => debug!(pid, exit_code = s.code(), "agent process exited"),
            Err(err) => warn!(pid, %err, "error waiting for agent process"),
        }
        exited.send_replace(true);
        status
    })
}

/// Send the polite termination signal.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        // Already reaped.
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!(pid, %err, "SIGTERM failed, killing");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        warn!(%err, "failed to terminate agent process");
    }
}
