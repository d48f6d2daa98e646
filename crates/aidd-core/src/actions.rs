//! Actions: the declarative mutation channel. A stage emits
//! `<stage>.actions.json`; the control plane validates it against the closed
//! action-type set, then applies each action through DocOps or the memory
//! layer and journals the outcome to `<stage>.apply.jsonl`.

use crate::docops::{self, ProgressEntry};
use crate::error::Result;
use crate::io;
use crate::paths;
use crate::schema;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Closed vocabularies
// ---------------------------------------------------------------------------

pub const SUPPORTED_ACTION_TYPES: [&str; 5] = [
    "tasklist_ops.set_iteration_done",
    "tasklist_ops.append_progress_log",
    "tasklist_ops.next3_recompute",
    "context_pack_ops.context_pack_update",
    "memory_ops.decision_append",
];

pub const PROGRESS_SOURCES: [&str; 5] = ["implement", "review", "qa", "research", "normalize"];
pub const PROGRESS_KINDS: [&str; 2] = ["iteration", "handoff"];

/// Param keys recognized when lifting a legacy flat action into
/// `{type, params}` during canonicalization.
const KNOWN_PARAM_KEYS: [&str; 13] = [
    "item_id", "kind", "date", "source", "id", "hash", "link", "msg", "topic", "decision",
    "alternatives", "status", "supersedes",
];

static DATE_RE: OnceLock<Regex> = OnceLock::new();

fn date_re() -> &'static Regex {
    DATE_RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn param_str<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

fn check_action_params(action_type: &str, params: &Map<String, Value>, label: &str, errors: &mut Vec<String>) {
    match action_type {
        "tasklist_ops.set_iteration_done" => {
            if param_str(params, "item_id").is_none() {
                errors.push(format!("{label}: params.item_id is required"));
            }
            if let Some(kind) = param_str(params, "kind") {
                if !PROGRESS_KINDS.contains(&kind) {
                    errors.push(format!("{label}: params.kind must be iteration|handoff"));
                }
            }
        }
        "tasklist_ops.append_progress_log" => {
            match param_str(params, "date") {
                Some(date) if date_re().is_match(date) => {}
                Some(_) => errors.push(format!("{label}: params.date must be YYYY-MM-DD")),
                None => errors.push(format!("{label}: params.date is required")),
            }
            match param_str(params, "source") {
                Some(source) if PROGRESS_SOURCES.contains(&source) => {}
                Some(source) => {
                    errors.push(format!("{label}: params.source '{source}' not allowed"))
                }
                None => errors.push(format!("{label}: params.source is required")),
            }
            if param_str(params, "id").is_none() {
                errors.push(format!("{label}: params.id is required"));
            }
            match param_str(params, "kind") {
                Some(kind) if PROGRESS_KINDS.contains(&kind) => {}
                Some(_) => errors.push(format!("{label}: params.kind must be iteration|handoff")),
                None => errors.push(format!("{label}: params.kind is required")),
            }
            if param_str(params, "hash").is_none() {
                errors.push(format!("{label}: params.hash is required"));
            }
        }
        "tasklist_ops.next3_recompute" => {}
        "context_pack_ops.context_pack_update" => {
            if params.is_empty() {
                errors.push(format!("{label}: params cannot be empty"));
            }
            for (key, value) in params {
                if !docops::CONTEXT_PACK_KEYS.contains(&key.as_str()) {
                    errors.push(format!("{label}: unknown context_pack field '{key}'"));
                    continue;
                }
                let ok = match value {
                    Value::String(_) => true,
                    Value::Array(items) => items.iter().all(Value::is_string),
                    _ => false,
                };
                if !ok {
                    errors.push(format!("{label}: field '{key}' must be a string or list of strings"));
                }
            }
        }
        "memory_ops.decision_append" => {
            if param_str(params, "topic").is_none() {
                errors.push(format!("{label}: params.topic is required"));
            }
            if param_str(params, "decision").is_none() {
                errors.push(format!("{label}: params.decision is required"));
            }
        }
        _ => errors.push(format!("{label}: unsupported type '{action_type}'")),
    }
}

/// Validate an actions payload; error strings, empty when valid. Every
/// action type must be supported, listed in the payload's own
/// `allowed_action_types` when present, and in `allowed_types` (from the
/// stage contract) when that list is non-empty.
pub fn validate_actions(payload: &Value, allowed_types: &[String]) -> Vec<String> {
    let mut errors = Vec::new();
    let declared = payload
        .get("schema_version")
        .or_else(|| payload.get("schema"))
        .and_then(Value::as_str)
        .unwrap_or("");
    if declared != schema::ACTIONS_V1 && declared != schema::ACTIONS_V0 {
        errors.push(format!(
            "schema_version: expected {} or {}, got '{declared}'",
            schema::ACTIONS_V1,
            schema::ACTIONS_V0
        ));
    }
    for field in ["ticket", "stage"] {
        if payload.get(field).and_then(Value::as_str).unwrap_or("").trim().is_empty() {
            errors.push(format!("{field}: missing"));
        }
    }
    let payload_allowed: Vec<&str> = payload
        .get("allowed_action_types")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let Some(actions) = payload.get("actions").and_then(Value::as_array) else {
        errors.push("actions: must be a list".to_string());
        return errors;
    };
    for (index, action) in actions.iter().enumerate() {
        let label = format!("actions[{index}]");
        let Some(obj) = action.as_object() else {
            errors.push(format!("{label}: must be an object"));
            continue;
        };
        let action_type = obj.get("type").and_then(Value::as_str).unwrap_or("");
        if !SUPPORTED_ACTION_TYPES.contains(&action_type) {
            errors.push(format!("{label}: unsupported type '{action_type}'"));
            continue;
        }
        if !payload_allowed.is_empty() && !payload_allowed.contains(&action_type) {
            errors.push(format!("{label}: type '{action_type}' not in allowed_action_types"));
            continue;
        }
        if !allowed_types.is_empty() && !allowed_types.iter().any(|t| t == action_type) {
            errors.push(format!("{label}: type '{action_type}' not allowed for this stage"));
            continue;
        }
        let empty = Map::new();
        let params = obj.get("params").and_then(Value::as_object).unwrap_or(&empty);
        if obj.get("params").map(|p| !p.is_object()).unwrap_or(false) {
            errors.push(format!("{label}: params must be an object"));
            continue;
        }
        check_action_params(action_type, params, &label, &mut errors);
    }
    errors
}

// ---------------------------------------------------------------------------
// Canonicalization
// ---------------------------------------------------------------------------

/// One repair pass for near-miss payloads: pin `schema_version`, align the
/// identity fields to the expected values, and lift legacy flat actions
/// (param keys beside `type`) into `{type, params}`. The caller re-validates
/// afterwards; anything still wrong is a real error.
pub fn canonicalize_actions(
    payload: &mut Value,
    ticket: &str,
    stage: &str,
    scope_key: &str,
    work_item_key: &str,
) {
    let Some(obj) = payload.as_object_mut() else { return };
    obj.insert("schema_version".to_string(), Value::String(schema::ACTIONS_V1.to_string()));
    obj.remove("schema");
    for (field, value) in [
        ("ticket", ticket),
        ("stage", stage),
        ("scope_key", scope_key),
        ("work_item_key", work_item_key),
    ] {
        obj.insert(field.to_string(), Value::String(value.to_string()));
    }
    let Some(actions) = obj.get_mut("actions").and_then(Value::as_array_mut) else { return };
    for action in actions {
        let Some(action_obj) = action.as_object_mut() else { continue };
        if action_obj.get("params").map(Value::is_object).unwrap_or(false) {
            continue;
        }
        let mut params = Map::new();
        for key in KNOWN_PARAM_KEYS {
            if let Some(value) = action_obj.remove(key) {
                params.insert(key.to_string(), value);
            }
        }
        for key in docops::CONTEXT_PACK_KEYS {
            if let Some(value) = action_obj.remove(key) {
                params.insert(key.to_string(), value);
            }
        }
        action_obj.insert("params".to_string(), Value::Object(params));
    }
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped: usize,
    pub errors: usize,
    pub log_path: std::path::PathBuf,
}

fn log_entry(index: i64, action_type: &str, status: &str, message: &str) -> Value {
    json!({
        "ts": io::utc_timestamp(),
        "index": index,
        "type": action_type,
        "status": status,
        "message": message,
    })
}

/// Apply a validated actions payload. Each action appends one log entry;
/// an empty payload still journals a single `(none)` skip so the run is
/// visible in the log.
pub fn apply_actions(
    root: &Path,
    ticket: &str,
    scope_key: &str,
    stage: &str,
    payload: &Value,
) -> Result<ApplyReport> {
    let log_path = paths::actions_apply_log_path(root, ticket, scope_key, stage);
    let empty_list = Vec::new();
    let actions = payload.get("actions").and_then(Value::as_array).unwrap_or(&empty_list);

    let mut report = ApplyReport { applied: 0, skipped: 0, errors: 0, log_path: log_path.clone() };
    if actions.is_empty() {
        io::append_jsonl(&log_path, &log_entry(-1, "(none)", "skipped", "no actions to apply"))?;
        report.skipped = 1;
        return Ok(report);
    }

    for (index, action) in actions.iter().enumerate() {
        let action_type = action.get("type").and_then(Value::as_str).unwrap_or("");
        let empty = Map::new();
        let params = action.get("params").and_then(Value::as_object).unwrap_or(&empty);
        let outcome = apply_one(root, ticket, action_type, params);
        let (status, message) = match outcome {
            Ok(op) if op.error => {
                report.errors += 1;
                ("error", op.message)
            }
            Ok(op) if op.changed => {
                report.applied += 1;
                ("applied", op.message)
            }
            Ok(op) => {
                report.skipped += 1;
                ("skipped", op.message)
            }
            Err(e) => {
                report.errors += 1;
                ("error", e.to_string())
            }
        };
        io::append_jsonl(&log_path, &log_entry(index as i64, action_type, status, &message))?;
    }
    Ok(report)
}

fn apply_one(
    root: &Path,
    ticket: &str,
    action_type: &str,
    params: &Map<String, Value>,
) -> Result<docops::OpOutcome> {
    match action_type {
        "tasklist_ops.set_iteration_done" => {
            let item_id = param_str(params, "item_id").unwrap_or("");
            let kind = param_str(params, "kind").unwrap_or("iteration");
            docops::set_iteration_done(root, ticket, item_id, kind)
        }
        "tasklist_ops.append_progress_log" => {
            let entry = ProgressEntry {
                date: param_str(params, "date").unwrap_or("").to_string(),
                source: param_str(params, "source").unwrap_or("").to_string(),
                item_id: param_str(params, "id").unwrap_or("").to_string(),
                kind: param_str(params, "kind").unwrap_or("iteration").to_string(),
                hash: param_str(params, "hash").unwrap_or("").to_string(),
                link: param_str(params, "link").unwrap_or("").to_string(),
                msg: param_str(params, "msg").unwrap_or("").to_string(),
            };
            docops::append_progress_log(root, ticket, &entry)
        }
        "tasklist_ops.next3_recompute" => docops::next3_recompute(root, ticket),
        "context_pack_ops.context_pack_update" => docops::context_pack_update(root, ticket, params),
        "memory_ops.decision_append" => crate::memory::decisions::append_from_action(root, ticket, params),
        other => Ok(docops::OpOutcome {
            changed: false,
            error: true,
            message: format!("unsupported type '{other}'"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
