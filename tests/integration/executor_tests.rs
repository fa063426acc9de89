//! Integration tests for the executor against fake agent scripts.
//!
//! Covers the result path, tolerance of non-JSON output, failing exits with
//! diagnostics, cancellation, timeout, the trailing-line flush, and
//! environment isolation.

use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use tokio::sync::mpsc;

use agent_relay::exec::pipe_capture::PipeCapture;
use agent_relay::exec::{Executor, ExecutorConfig};
use agent_relay::models::execution::{ExecuteOptions, ExecutionEvent, ExecutionOutcome};
use agent_relay::AppError;

use super::test_helpers::{write_agent, BLOCKING_SCRIPT, SUCCESS_SCRIPT};

fn executor_for(binary: &std::path::Path, timeout: Option<Duration>) -> Executor {
    let config = ExecutorConfig {
        binary: binary.to_string_lossy().into_owned(),
        timeout,
        preflight: false,
        termination_grace: Duration::from_secs(2),
    };
    Executor::new(config, Arc::new(PipeCapture))
}

async fn run_to_end(
    executor: &Executor,
    options: ExecuteOptions,
) -> (agent_relay::Result<ExecutionOutcome>, Vec<ExecutionEvent>) {
    let (tx, mut rx) = mpsc::channel(64);
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });
    let outcome = tokio::time::timeout(Duration::from_secs(10), executor.execute(options, tx))
        .await
        .expect("execution finished in time");
    let events = collector.await.expect("collector");
    (outcome, events)
}

// ── Result path ─────────────────────────────────────────────────────────────

/// A well-behaved agent streams its messages, then exactly one result.
#[tokio::test]
async fn successful_run_streams_messages_and_one_result() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = write_agent(temp.path(), "agent.sh", SUCCESS_SCRIPT);
    let executor = executor_for(&agent, None);

    let (outcome, events) = run_to_end(&executor, ExecuteOptions::new("hi", temp.path())).await;

    assert_eq!(
        outcome.expect("ran"),
        ExecutionOutcome::Exited {
            code: Some(0),
            diagnostics: None
        }
    );

    let messages = events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::Message(_)))
        .count();
    assert_eq!(messages, 3, "the non-JSON line is skipped");

    let results: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::Result(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].result_text, "done");
    assert_eq!(results[0].session_id.as_deref(), Some("s-1"));
    assert_eq!(results[0].num_turns, 2);
    assert!(matches!(events.last(), Some(ExecutionEvent::Result(_))));

    assert_eq!(executor.current_session_id().as_deref(), Some("s-1"));
}

/// A second `result` line is streamed but not reported as a result again.
#[tokio::test]
async fn only_first_result_line_counts() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = write_agent(
        temp.path(),
        "agent.sh",
        r#"
echo '{"type":"result","result":"first"}'
echo '{"type":"result","result":"second"}'
"#,
    );
    let executor = executor_for(&agent, None);
    let (_, events) = run_to_end(&executor, ExecuteOptions::new("hi", temp.path())).await;

    let results: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::Result(r) => Some(r.result_text.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(results, vec!["first".to_owned()]);
}

/// An unterminated final line is decoded at exit.
#[tokio::test]
async fn trailing_line_without_newline_is_flushed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = write_agent(
        temp.path(),
        "agent.sh",
        r#"printf '{"type":"result","result":"tail","session_id":"s-t"}'"#,
    );
    let executor = executor_for(&agent, None);
    let (outcome, events) = run_to_end(&executor, ExecuteOptions::new("hi", temp.path())).await;

    assert!(outcome.expect("ran").is_success());
    assert!(events.iter().any(
        |e| matches!(e, ExecutionEvent::Result(r) if r.result_text == "tail")
    ));
}

// ── Failures ────────────────────────────────────────────────────────────────

/// A non-zero exit carries stderr and stray stdout as diagnostics.
#[tokio::test]
async fn failing_exit_reports_diagnostics() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = write_agent(
        temp.path(),
        "agent.sh",
        "echo 'not json at all'\necho 'unknown option --bogus' >&2\nexit 3\n",
    );
    let executor = executor_for(&agent, None);
    let (outcome, events) = run_to_end(&executor, ExecuteOptions::new("hi", temp.path())).await;

    match outcome.expect("ran") {
        ExecutionOutcome::Exited {
            code: Some(3),
            diagnostics: Some(text),
        } => {
            assert!(text.contains("unknown option --bogus"), "{text}");
            assert!(text.contains("not json at all"), "{text}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(events.is_empty());
}

/// A missing program fails to spawn.
#[tokio::test]
async fn missing_program_is_a_spawn_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let executor = executor_for(&temp.path().join("no-such-agent"), None);
    let (outcome, _) = run_to_end(&executor, ExecuteOptions::new("hi", temp.path())).await;
    assert!(matches!(outcome, Err(AppError::Spawn(_))));
}

/// Executors are single-use.
#[tokio::test]
async fn executor_cannot_be_reused() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = write_agent(temp.path(), "agent.sh", SUCCESS_SCRIPT);
    let executor = executor_for(&agent, None);

    let (first, _) = run_to_end(&executor, ExecuteOptions::new("hi", temp.path())).await;
    first.expect("first run");
    let (second, _) = run_to_end(&executor, ExecuteOptions::new("hi", temp.path())).await;
    assert!(matches!(second, Err(AppError::Execution(_))));
}

// ── Cancellation and timeout ────────────────────────────────────────────────

/// Cancelling a running agent terminates it; repeated cancels are no-ops.
#[tokio::test]
async fn cancel_terminates_and_is_idempotent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = write_agent(temp.path(), "agent.sh", BLOCKING_SCRIPT);
    let executor = Arc::new(executor_for(&agent, None));

    let (tx, mut rx) = mpsc::channel(64);
    let runner = {
        let executor = Arc::clone(&executor);
        let options = ExecuteOptions::new("hi", temp.path());
        tokio::spawn(async move { executor.execute(options, tx).await })
    };

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("first event in time");
    assert!(matches!(first, Some(ExecutionEvent::Message(_))));
    assert_eq!(executor.current_session_id().as_deref(), Some("s-block"));

    executor.cancel();
    executor.cancel();
    assert!(executor.is_cancelled());

    let outcome = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("cancelled in time")
        .expect("join")
        .expect("ran");
    assert_eq!(outcome, ExecutionOutcome::Cancelled);

    executor.cancel();
}

/// Cancelling before start never spawns the agent.
#[tokio::test]
async fn cancel_before_start_skips_spawn() {
    let temp = tempfile::tempdir().expect("tempdir");
    let marker = temp.path().join("spawned");
    let agent = write_agent(
        temp.path(),
        "agent.sh",
        &format!("touch '{}'\n", marker.display()),
    );
    let executor = executor_for(&agent, None);
    executor.cancel();

    let (outcome, events) = run_to_end(&executor, ExecuteOptions::new("hi", temp.path())).await;
    assert_eq!(outcome.expect("ran"), ExecutionOutcome::Cancelled);
    assert!(events.is_empty());
    assert!(!marker.exists(), "agent must not have been spawned");
}

/// The timeout terminates a silent agent.
#[tokio::test]
async fn timeout_terminates_agent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = write_agent(temp.path(), "agent.sh", "exec sleep 30\n");
    let executor = executor_for(&agent, Some(Duration::from_millis(300)));

    let (outcome, _) = run_to_end(&executor, ExecuteOptions::new("hi", temp.path())).await;
    assert_eq!(
        outcome.expect("ran"),
        ExecutionOutcome::TimedOut {
            after: Duration::from_millis(300)
        }
    );
}

/// An agent that ignores SIGTERM is killed after the grace period.
#[tokio::test]
async fn stubborn_agent_is_killed_after_grace() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = write_agent(
        temp.path(),
        "agent.sh",
        "trap '' TERM\necho '{\"type\":\"system\"}'\nwhile :; do sleep 0.1; done\n",
    );
    let executor = Arc::new(Executor::new(
        ExecutorConfig {
            binary: agent.to_string_lossy().into_owned(),
            timeout: None,
            preflight: false,
            termination_grace: Duration::from_millis(300),
        },
        Arc::new(PipeCapture),
    ));

    let (tx, mut rx) = mpsc::channel(64);
    let runner = {
        let executor = Arc::clone(&executor);
        let options = ExecuteOptions::new("hi", temp.path());
        tokio::spawn(async move { executor.execute(options, tx).await })
    };
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("first event in time");

    executor.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("killed in time")
        .expect("join")
        .expect("ran");
    assert_eq!(outcome, ExecutionOutcome::Cancelled);
}

// ── Invocation ──────────────────────────────────────────────────────────────

/// The agent runs in the requested directory without nested-session markers
/// and receives the streaming flags.
#[tokio::test]
#[serial]
async fn agent_runs_isolated_in_working_directory() {
    let temp = tempfile::tempdir().expect("tempdir");
    let workdir = temp.path().join("project");
    std::fs::create_dir(&workdir).expect("mkdir");
    let agent = write_agent(
        temp.path(),
        "agent.sh",
        r#"printf '{"type":"result","result":"%s|%s|%s"}\n' "$(pwd)" "${CLAUDECODE:-unset}" "$*""#,
    );

    std::env::set_var("CLAUDECODE", "1");
    let executor = executor_for(&agent, None);
    let (outcome, events) = run_to_end(&executor, ExecuteOptions::new("hello", &workdir)).await;
    std::env::remove_var("CLAUDECODE");
    outcome.expect("ran");

    let text = events
        .iter()
        .find_map(|e| match e {
            ExecutionEvent::Result(r) => Some(r.result_text.clone()),
            _ => None,
        })
        .expect("result");
    let mut parts = text.splitn(3, '|');
    let cwd = parts.next().expect("cwd");
    assert_eq!(
        std::path::Path::new(cwd).canonicalize().expect("cwd exists"),
        workdir.canonicalize().expect("workdir exists")
    );
    assert_eq!(parts.next(), Some("unset"));
    assert_eq!(
        parts.next(),
        Some("-p hello --output-format stream-json --verbose --dangerously-skip-permissions")
    );
}
