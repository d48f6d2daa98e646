//! Rendering for JSON-lines runner streams.
//!
//! Agents emit one JSON event per stdout line; the renderer extracts the
//! human-readable text fragments and tool start/stop markers so the
//! `.stream.log` transcript reads like a terminal session.

use serde_json::Value;

const MAX_ARG_CHARS: usize = 200;

#[derive(Debug, Default)]
pub struct RenderState {
    line_start: bool,
}

impl RenderState {
    pub fn new() -> Self {
        Self { line_start: true }
    }
}

fn shorten(value: &Value) -> String {
    let text = match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.chars().count() > MAX_ARG_CHARS {
        let prefix: String = cleaned.chars().take(MAX_ARG_CHARS - 3).collect();
        format!("{prefix}...")
    } else {
        cleaned
    }
}

fn extract_text(event: &Value) -> Vec<String> {
    for key in ["text", "delta", "content", "message"] {
        if let Some(text) = event.get(key).and_then(Value::as_str) {
            if !text.is_empty() {
                return vec![text.to_string()];
            }
        }
    }
    let content_fragments = |content: &Value| -> Vec<String> {
        content
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("text"))
                    .filter_map(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    if let Some(payload) = event.get("payload") {
        for key in ["text", "delta"] {
            if let Some(text) = payload.get(key).and_then(Value::as_str) {
                if !text.is_empty() {
                    return vec![text.to_string()];
                }
            }
        }
        let fragments = content_fragments(payload.get("content").unwrap_or(&Value::Null));
        if !fragments.is_empty() {
            return fragments;
        }
    }
    content_fragments(event.get("content").unwrap_or(&Value::Null))
}

fn payload_of(event: &Value) -> &Value {
    event.get("payload").filter(|p| p.is_object()).unwrap_or(event)
}

fn tool_name(payload: &Value) -> String {
    ["tool_name", "name", "tool"]
        .iter()
        .filter_map(|key| payload.get(key))
        .filter_map(Value::as_str)
        .find(|name| !name.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

fn tool_start(event: &Value) -> Option<String> {
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
    if !matches!(event_type, "tool_use" | "tool_call" | "tool.execute.before") {
        return None;
    }
    let payload = payload_of(event);
    let name = tool_name(payload);
    let args = ["args", "input", "arguments"]
        .iter()
        .filter_map(|key| payload.get(key))
        .find(|v| !v.is_null())
        .map(shorten)
        .unwrap_or_default();
    Some(if args.is_empty() {
        format!("[tool:start] {name}")
    } else {
        format!("[tool:start] {name} {args}")
    })
}

fn tool_stop(event: &Value) -> Option<String> {
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
    if !matches!(event_type, "tool_result" | "tool.execute.after") {
        return None;
    }
    let payload = payload_of(event);
    let name = tool_name(payload);
    let exit_code = payload
        .get("exit_code")
        .or_else(|| payload.get("code"))
        .map(shorten)
        .unwrap_or_default();
    let status = payload
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            if payload.get("error").map(|e| !e.is_null()).unwrap_or(false) {
                "error".to_string()
            } else {
                "ok".to_string()
            }
        });
    let mut line = format!("[tool:stop] {name}");
    if !exit_code.is_empty() {
        line.push_str(&format!(" exit_code={exit_code}"));
    }
    line.push_str(&format!(" status={status}"));
    Some(line)
}

/// Render one raw stream line into the transcript buffer. Returns false
/// when the line was not valid JSON.
pub fn render_line(raw: &str, out: &mut String, state: &mut RenderState) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return true;
    }
    let Ok(event) = serde_json::from_str::<Value>(trimmed) else {
        return false;
    };
    for fragment in extract_text(&event) {
        out.push_str(&fragment);
        state.line_start = fragment.ends_with('\n');
    }
    for marker in [tool_start(&event), tool_stop(&event)].into_iter().flatten() {
        if !state.line_start {
            out.push('\n');
        }
        out.push_str(&marker);
        out.push('\n');
        state.line_start = true;
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
