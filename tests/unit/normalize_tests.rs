//! Unit tests for agent event normalisation.

use serde_json::json;

use agent_relay::relay::normalize::{flatten_text, normalize_event};

/// Nested assistant content is flattened from its text items.
#[test]
fn assistant_message_text_is_flattened() {
    let event = json!({
        "type": "assistant",
        "message": {
            "role": "assistant",
            "content": [
                {"type": "text", "text": "Hello, "},
                {"type": "tool_use", "name": "Bash", "input": {}},
                {"type": "text", "text": "world"}
            ]
        }
    });
    let message = normalize_event(&event);

    assert_eq!(message.role, "assistant");
    assert_eq!(message.content, "Hello, world");
    assert_eq!(message.metadata.raw_type, "assistant");
    assert_eq!(message.metadata.tools, Some(vec!["Bash".to_owned()]));
}

/// Nested content wins over a top-level array.
#[test]
fn nested_content_takes_precedence() {
    let event = json!({
        "type": "user",
        "content": [{"type": "text", "text": "outer"}],
        "message": {"role": "user", "content": [{"type": "text", "text": "inner"}]}
    });
    assert_eq!(normalize_event(&event).content, "inner");
}

/// A top-level content array is used when there is no nested message.
#[test]
fn top_level_content_is_used() {
    let event = json!({
        "type": "system",
        "content": [{"type": "text", "text": "booting"}]
    });
    let message = normalize_event(&event);
    assert_eq!(message.content, "booting");
    assert_eq!(message.role, "system", "role falls back to the event type");
}

/// Init events carry the announced tool list and subtype.
#[test]
fn init_event_lists_tools() {
    let event = json!({
        "type": "system",
        "subtype": "init",
        "session_id": "s-1",
        "tools": ["Read", {"name": "Write"}, 7]
    });
    let message = normalize_event(&event);
    assert_eq!(message.metadata.subtype.as_deref(), Some("init"));
    assert_eq!(
        message.metadata.tools,
        Some(vec!["Read".to_owned(), "Write".to_owned()])
    );
    assert!(message.content.is_empty());
}

/// Result events expose their final text.
#[test]
fn result_event_uses_result_text() {
    let event = json!({"type": "result", "subtype": "success", "result": "all done"});
    let message = normalize_event(&event);
    assert_eq!(message.content, "all done");
    assert_eq!(message.metadata.tools, None);
}

/// Events without a type are still normalised.
#[test]
fn untyped_event_is_unknown() {
    let message = normalize_event(&json!({"foo": 1}));
    assert_eq!(message.metadata.raw_type, "unknown");
    assert_eq!(message.role, "unknown");
}

/// Only `text` items contribute to flattened text.
#[test]
fn flatten_skips_non_text_items() {
    let items = vec![
        json!({"type": "text", "text": "a"}),
        json!({"type": "image", "text": "ignored"}),
        json!({"type": "text"}),
        json!({"type": "text", "text": "b"}),
    ];
    assert_eq!(flatten_text(&items), "ab");
}
