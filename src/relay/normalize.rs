//! Normalisation of raw agent stream events into [`StreamMessage`]s.
//!
//! Agent events nest their content differently depending on the event type:
//!
//! | Shape                                            | Example type        |
//! |--------------------------------------------------|---------------------|
//! | `{"message": {"role": …, "content": [items]}}`   | `assistant`, `user` |
//! | `{"content": [items]}`                           | some `system` events|
//! | `{"result": "…"}`                                | `result`            |
//!
//! Text items (`{"type": "text", "text": …}`) are concatenated; the nested
//! message content takes precedence over a top-level array.

use serde_json::Value;

use crate::models::outbound::{StreamMessage, StreamMetadata};

/// Build the displayable form of one agent event.
#[must_use]
pub fn normalize_event(event: &Value) -> StreamMessage {
    let raw_type = event
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_owned();
    let nested = event.get("message").filter(|m| m.is_object());

    let items = nested
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .or_else(|| event.get("content").and_then(Value::as_array));

    let mut content = items.map(|items| flatten_text(items)).unwrap_or_default();
    if content.is_empty() {
        if let Some(text) = nested
            .and_then(|m| m.get("content"))
            .or_else(|| event.get("content"))
            .and_then(Value::as_str)
        {
            content = text.to_owned();
        } else if raw_type == "result" {
            content = event
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
        }
    }

    let role = nested
        .and_then(|m| m.get("role"))
        .and_then(Value::as_str)
        .or_else(|| event.get("role").and_then(Value::as_str))
        .unwrap_or(&raw_type)
        .to_owned();

    StreamMessage {
        role,
        content,
        metadata: StreamMetadata {
            subtype: event
                .get("subtype")
                .and_then(Value::as_str)
                .map(str::to_owned),
            tools: tool_names(event, items),
            raw_type,
        },
    }
}

/// Concatenate the `text` of every `type: "text"` item.
#[must_use]
pub fn flatten_text(items: &[Value]) -> String {
    items
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("")
}

/// Tools announced by an `init` event (`tools`), or invoked by `tool_use`
/// items.
fn tool_names(event: &Value, items: Option<&Vec<Value>>) -> Option<Vec<String>> {
    if let Some(tools) = event.get("tools").and_then(Value::as_array) {
        let names: Vec<String> = tools
            .iter()
            .filter_map(|t| {
                t.as_str()
                    .or_else(|| t.get("name").and_then(Value::as_str))
                    .map(str::to_owned)
            })
            .collect();
        return Some(names);
    }

    let names: Vec<String> = items?
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("tool_use"))
        .filter_map(|item| item.get("name").and_then(Value::as_str))
        .map(str::to_owned)
        .collect();
    (!names.is_empty()).then_some(names)
}
