//! Unit tests for agent argument construction and environment isolation.

use std::ffi::OsStr;
use std::path::Path;

use agent_relay::exec::spawner::{build_args, build_command, resolve_binary, NESTED_SESSION_MARKERS};
use agent_relay::models::execution::ExecuteOptions;
use agent_relay::AppError;

/// A fresh prompt gets exactly the fixed streaming flags.
#[test]
fn minimal_args() {
    let options = ExecuteOptions::new("fix it", "/tmp");
    assert_eq!(
        build_args(&options),
        vec![
            "-p",
            "fix it",
            "--output-format",
            "stream-json",
            "--verbose",
            "--dangerously-skip-permissions",
        ]
    );
}

/// Optional flags follow the fixed ones in a stable order.
#[test]
fn full_args_in_order() {
    let mut options = ExecuteOptions::new("go on", "/tmp");
    options.resume_session_id = Some("s-1".into());
    options.allowed_tools = vec![" Read ".into(), String::new(), "Bash(git:*)".into()];
    options.mcp_config = Some("/etc/mcp.json".into());
    options.append_system_prompt = Some("Be terse.".into());

    let args = build_args(&options);
    assert_eq!(
        &args[6..],
        &[
            "--resume",
            "s-1",
            "--allowedTools",
            "Read,Bash(git:*)",
            "--mcp-config",
            "/etc/mcp.json",
            "--append-system-prompt",
            "Be terse.",
        ]
    );
}

/// Empty optional values add no flags.
#[test]
fn empty_optionals_are_omitted() {
    let mut options = ExecuteOptions::new("p", "/tmp");
    options.resume_session_id = Some(String::new());
    options.allowed_tools = vec!["  ".into()];
    options.mcp_config = Some(String::new());
    options.append_system_prompt = Some(" ".into());
    assert_eq!(build_args(&options).len(), 6);
}

/// The command removes nested-session markers and runs in the working
/// directory.
#[test]
fn command_isolates_environment() {
    let options = ExecuteOptions::new("p", "/srv/app");
    let cmd = build_command(Path::new("claude"), &options);
    let std_cmd = cmd.as_std();

    assert_eq!(std_cmd.get_program(), OsStr::new("claude"));
    assert_eq!(std_cmd.get_current_dir(), Some(Path::new("/srv/app")));
    for marker in NESTED_SESSION_MARKERS {
        let removed = std_cmd
            .get_envs()
            .any(|(key, value)| key == OsStr::new(marker) && value.is_none());
        assert!(removed, "{marker} must be removed from the agent env");
    }
}

/// A binary that is not on PATH fails preflight.
#[test]
fn missing_binary_fails_preflight() {
    let err = resolve_binary("definitely-not-an-agent-binary-7f3a").expect_err("must fail");
    assert!(matches!(err, AppError::Preflight(_)));
}
