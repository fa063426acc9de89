//! Unit tests for the outbound wire format.

use chrono::Utc;
use serde_json::{json, Value};

use agent_relay::models::execution::{AgentStatus, ExecutionOutcome, ExecutionResult};
use agent_relay::models::outbound::{DirEntry, Heartbeat, OutboundMessage};
use agent_relay::relay::manager::describe_failure;
use agent_relay::system_info::SystemInfoProvider;
use agent_relay::AppError;

fn to_value(message: &OutboundMessage) -> Value {
    serde_json::to_value(message).expect("serialise")
}

/// Result messages are flat objects tagged `result`.
#[test]
fn result_message_shape() {
    let result = ExecutionResult::from_line(
        &json!({
            "type": "result",
            "result": "done",
            "total_cost_usd": 0.25,
            "duration_ms": 1200,
            "num_turns": 3,
            "is_error": false
        }),
        Some("s-1".into()),
    );
    let value = to_value(&OutboundMessage::result("r1", &result));

    assert_eq!(
        value,
        json!({
            "type": "result",
            "request_id": "r1",
            "session_id": "s-1",
            "message": "done",
            "cost_usd": 0.25,
            "duration_ms": 1200,
            "num_turns": 3,
            "is_error": false
        })
    );
}

/// Cost falls back to `cost_usd` and missing numbers default to zero.
#[test]
fn result_line_defaults() {
    let result = ExecutionResult::from_line(&json!({"type": "result", "cost_usd": 1.5}), None);
    assert!((result.cost_usd - 1.5).abs() < f64::EPSILON);
    assert_eq!(result.duration_ms, 0);
    assert_eq!(result.num_turns, 0);
    assert!(result.result_text.is_empty());
    assert!(!result.is_error);
}

/// Errors omit the session when unknown.
#[test]
fn error_message_shape() {
    let value = to_value(&OutboundMessage::error("r2", "busy: agent is busy"));
    assert_eq!(
        value,
        json!({"type": "error", "request_id": "r2", "error": "busy: agent is busy"})
    );
}

/// Directory entries use the controller's `isDirectory` key.
#[test]
fn browse_result_shape() {
    let message = OutboundMessage::FileBrowseResult {
        request_id: "r3".into(),
        path: "/srv".into(),
        entries: vec![DirEntry {
            name: "app".into(),
            path: "/srv/app".into(),
            is_directory: true,
        }],
        error: None,
    };
    let value = to_value(&message);
    assert_eq!(value["type"], "file_browse_result");
    assert_eq!(value["entries"][0]["isDirectory"], true);
    assert!(value.get("error").is_none());
    assert_eq!(message.request_id(), Some("r3"));
}

/// Heartbeats carry status and host telemetry.
#[test]
fn heartbeat_shape() {
    let system = SystemInfoProvider::new(Some("2.0.1 (Claude Code)".into()));
    let message = OutboundMessage::Heartbeat(Heartbeat {
        agent_id: "agent-1".into(),
        status: AgentStatus::Busy,
        system_info: system.snapshot(),
        current_session: Some("s-1".into()),
        timestamp: Utc::now(),
    });
    let value = to_value(&message);

    assert_eq!(value["type"], "heartbeat");
    assert_eq!(value["agent_id"], "agent-1");
    assert_eq!(value["status"], "busy");
    assert_eq!(value["current_session"], "s-1");
    assert_eq!(value["system_info"]["agent_version"], "2.0.1 (Claude Code)");
    assert_eq!(value["system_info"]["os"], std::env::consts::OS);
    assert_eq!(message.kind(), "heartbeat");
    assert_eq!(message.request_id(), None);
}

/// Status messages serialise the status in snake case.
#[test]
fn status_message_shape() {
    let value = to_value(&OutboundMessage::Status {
        request_id: None,
        status: AgentStatus::Error,
        message: Some("agent binary missing".into()),
    });
    assert_eq!(
        value,
        json!({"type": "status", "status": "error", "message": "agent binary missing"})
    );
}

/// Failure descriptions distinguish every way an execution can end badly.
#[test]
fn failure_descriptions() {
    assert_eq!(
        describe_failure(&Ok(ExecutionOutcome::Exited {
            code: Some(0),
            diagnostics: None
        })),
        "agent exited without producing a result"
    );
    assert_eq!(
        describe_failure(&Ok(ExecutionOutcome::Exited {
            code: Some(2),
            diagnostics: Some("bad flag".into())
        })),
        "agent process exited with code 2: bad flag"
    );
    assert_eq!(
        describe_failure(&Ok(ExecutionOutcome::Exited {
            code: None,
            diagnostics: None
        })),
        "agent process was terminated by a signal"
    );
    assert_eq!(
        describe_failure(&Ok(ExecutionOutcome::TimedOut {
            after: std::time::Duration::from_secs(60)
        })),
        "timeout: agent did not finish within 60s"
    );
    assert_eq!(
        describe_failure(&Err(AppError::Spawn("no such file".into()))),
        "spawn: no such file"
    );
}
