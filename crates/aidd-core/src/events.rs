//! Per-ticket event log under `reports/events/<ticket>.jsonl`.
//!
//! Every tool appends one line per meaningful transition. Reason codes are
//! normalized to `[a-z0-9_:]` tokens so downstream policy can match on them
//! without caring how the producer spelled the reason.

use crate::ast_index;
use crate::context_quality::{self, normalize_reason_code, MetricsUpdate, ReadCounts};
use crate::error::Result;
use crate::io;
use crate::paths;
use serde_json::{json, Map, Value};
use std::path::Path;

#[derive(Debug, Default)]
pub struct Event {
    pub event_type: String,
    pub status: String,
    pub slug_hint: String,
    pub details: Option<Map<String, Value>>,
    pub report_path: String,
    pub source: String,
}

impl Event {
    pub fn new(event_type: &str) -> Self {
        Self { event_type: event_type.to_string(), ..Default::default() }
    }

    pub fn status(mut self, status: &str) -> Self {
        self.status = status.to_string();
        self
    }

    pub fn slug_hint(mut self, slug_hint: &str) -> Self {
        self.slug_hint = slug_hint.to_string();
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details.as_object().cloned();
        self
    }

    pub fn report_path(mut self, report_path: &str) -> Self {
        self.report_path = report_path.to_string();
        self
    }

    pub fn source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }
}

fn normalize_details(details: &Map<String, Value>) -> Map<String, Value> {
    let mut normalized = Map::new();
    for (key, value) in details {
        if key.ends_with("reason_code") {
            let token = normalize_reason_code(value.as_str().unwrap_or(""));
            normalized.insert(key.clone(), json!(token));
        } else if key.ends_with("reason_codes") && value.is_array() {
            let tokens: Vec<String> = value
                .as_array()
                .unwrap()
                .iter()
                .map(|raw| normalize_reason_code(raw.as_str().unwrap_or("")))
                .filter(|t| !t.is_empty())
                .collect();
            normalized.insert(key.clone(), json!(tokens));
        } else {
            normalized.insert(key.clone(), value.clone());
        }
    }
    normalized
}

/// Primary reason: the well-known keys in priority order, then any other
/// `*reason_code` key that carries a token.
fn first_reason_code(details: &Map<String, Value>) -> String {
    for key in ["reason_code", "ast_reason_code", "pending_reason_code", "memory_reason_code"] {
        let token = normalize_reason_code(
            details.get(key).and_then(Value::as_str).unwrap_or(""),
        );
        if !token.is_empty() {
            return token;
        }
    }
    for (key, value) in details {
        if key.ends_with("reason_code") {
            let token = normalize_reason_code(value.as_str().unwrap_or(""));
            if !token.is_empty() {
                return token;
            }
        }
    }
    String::new()
}

/// AST policy for the event: a known AST reason code escalates to blocked
/// when the adapter is required, otherwise to a warning.
fn ast_policy(details: &Map<String, Value>) -> (String, String) {
    let reason_code = normalize_reason_code(
        details.get("ast_reason_code").and_then(Value::as_str).unwrap_or(""),
    );
    if !ast_index::REASON_CODES.contains(&reason_code.as_str()) {
        return (String::new(), reason_code);
    }
    let required = details.get("ast_required").and_then(Value::as_bool).unwrap_or(false);
    (if required { "blocked" } else { "warn" }.to_string(), reason_code)
}

fn apply_context_quality_details(root: &Path, ticket: &str, details: &Map<String, Value>) {
    let Some(raw) = details.get("context_quality").and_then(Value::as_object) else {
        return;
    };
    let count = |key: &str| raw.get(key).and_then(Value::as_u64).unwrap_or(0);
    let update = MetricsUpdate {
        reads: ReadCounts {
            pack_reads: count("pack_reads"),
            slice_reads: count("slice_reads"),
            memory_slice_reads: count("memory_slice_reads"),
            full_reads: count("full_reads"),
        },
        retrieval_events: count("retrieval_events"),
        fallback_events: count("fallback_events"),
        output_contract_total: count("output_contract_total"),
        output_contract_warn: raw
            .get("output_contract_warn")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        context_expand_refresh: raw
            .get("context_expand_refresh")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        source: "events".to_string(),
        ..Default::default()
    };
    let _ = context_quality::update_metrics(root, ticket, update);
}

/// Append one event. Events are advisory; an empty ticket is a no-op.
pub fn append_event(root: &Path, ticket: &str, event: Event) -> Result<()> {
    if ticket.is_empty() {
        return Ok(());
    }
    let mut details = event.details.as_ref().map(normalize_details);
    let mut status = event.status.trim().to_ascii_lowercase();
    let (policy, ast_reason_code) =
        details.as_ref().map(ast_policy).unwrap_or_default();
    if policy == "blocked" {
        status = "blocked".to_string();
    } else if policy == "warn" && matches!(status.as_str(), "" | "ok") {
        status = "warn".to_string();
    }
    let primary_reason =
        details.as_ref().map(first_reason_code).unwrap_or_default();
    if let Some(details) = details.as_mut() {
        if !policy.is_empty() {
            details.entry("ast_fallback_policy").or_insert_with(|| json!(policy.clone()));
        }
        if !primary_reason.is_empty() {
            details.entry("reason_code").or_insert_with(|| json!(primary_reason.clone()));
        }
        if policy == "blocked" {
            let next_action = details
                .get("ast_next_action")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();
            if !next_action.is_empty() {
                details.entry("next_action").or_insert_with(|| json!(next_action));
            }
        }
    }

    let mut payload = Map::new();
    payload.insert("ts".into(), json!(io::utc_timestamp()));
    payload.insert("ticket".into(), json!(ticket));
    if !event.slug_hint.is_empty() {
        payload.insert("slug_hint".into(), json!(event.slug_hint));
    }
    payload.insert("type".into(), json!(event.event_type));
    if !status.is_empty() {
        payload.insert("status".into(), json!(status));
    }
    if !primary_reason.is_empty() {
        payload.insert("reason_code".into(), json!(primary_reason.clone()));
    }
    if !ast_reason_code.is_empty() && ast_reason_code != primary_reason && !primary_reason.is_empty()
    {
        payload.insert("ast_reason_code".into(), json!(ast_reason_code));
    }
    if let Some(details) = &details {
        if !details.is_empty() {
            payload.insert("details".into(), Value::Object(details.clone()));
        }
    }
    if !event.report_path.is_empty() {
        payload.insert("report".into(), json!(event.report_path));
    }
    if !event.source.is_empty() {
        payload.insert("source".into(), json!(event.source));
    }

    io::append_jsonl(&paths::events_path(root, ticket), &Value::Object(payload))?;
    if let Some(details) = &details {
        apply_context_quality_details(root, ticket, details);
    }
    Ok(())
}

/// Last `limit` events for the ticket, oldest first.
pub fn read_events(root: &Path, ticket: &str, limit: usize) -> Result<Vec<Value>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let path = paths::events_path(root, ticket);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let (mut events, _) = io::read_jsonl(&path)?;
    if events.len() > limit {
        events.drain(..events.len() - limit);
    }
    Ok(events)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn normalizes_reason_tokens_in_details() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        append_event(
            root,
            "EV-1",
            Event::new("stage_blocked")
                .status("blocked")
                .details(json!({"reason_code": "Tests Failed!", "extra": 1})),
        )
        .unwrap();
        let events = read_events(root, "EV-1", 5).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["reason_code"], "tests_failed");
        assert_eq!(events[0]["details"]["extra"], 1);
    }

    #[test]
    fn primary_reason_scan_order() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        append_event(
            root,
            "EV-2",
            Event::new("loop_step").details(json!({
                "pending_reason_code": "questions-pending",
                "memory_reason_code": "memory_slice_missing",
            })),
        )
        .unwrap();
        let events = read_events(root, "EV-2", 1).unwrap();
        assert_eq!(events[0]["reason_code"], "questions_pending");
    }

    #[test]
    fn required_ast_fallback_blocks_the_event() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        append_event(
            root,
            "EV-3",
            Event::new("research").status("ok").details(json!({
                "ast_reason_code": "ast_index_timeout",
                "ast_required": true,
                "ast_next_action": "increase ast_index.timeout_s",
            })),
        )
        .unwrap();
        let events = read_events(root, "EV-3", 1).unwrap();
        assert_eq!(events[0]["status"], "blocked");
        assert_eq!(events[0]["reason_code"], "ast_index_timeout");
        assert_eq!(events[0]["details"]["ast_fallback_policy"], "blocked");
        assert_eq!(events[0]["details"]["next_action"], "increase ast_index.timeout_s");
    }

    #[test]
    fn optional_ast_fallback_only_warns() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        append_event(
            root,
            "EV-4",
            Event::new("research").status("ok").details(json!({
                "ast_reason_code": "ast_index_fallback_rg",
                "ast_required": false,
            })),
        )
        .unwrap();
        let events = read_events(root, "EV-4", 1).unwrap();
        assert_eq!(events[0]["status"], "warn");
    }

    #[test]
    fn read_events_returns_tail_in_order() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for i in 0..6 {
            append_event(root, "EV-5", Event::new(&format!("step_{i}"))).unwrap();
        }
        let events = read_events(root, "EV-5", 3).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["type"], "step_3");
        assert_eq!(events[2]["type"], "step_5");
    }
}
