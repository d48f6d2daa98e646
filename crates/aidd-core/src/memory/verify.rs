//! Memory payload validation: schema shape, columnar blocks, enum fields,
//! and canonical-JSON budget checks. Errors carry `memory_*` prefixes so
//! callers can classify without string matching on prose.

use crate::io;
use crate::schema;
use serde_json::Value;
use std::path::Path;

const SEMANTIC_SECTIONS: [(&str, &[&str]); 4] = [
    ("terms", &["term", "definition", "aliases", "scope", "confidence"]),
    ("defaults", &["key", "value", "source", "rationale"]),
    ("constraints", &["id", "text", "source", "severity"]),
    ("invariants", &["id", "text", "source"]),
];

const ACTIVE_COLS: [&str; 8] =
    ["decision_id", "topic", "decision", "status", "ts", "scope_key", "stage", "source_path"];
const SUPERSEDED_COLS: [&str; 5] = ["decision_id", "supersedes", "topic", "status", "ts"];
const MANIFEST_COLS: [&str; 4] = ["query", "slice_pack", "latest_alias", "hits"];

fn declared_schema(payload: &Value) -> &str {
    payload
        .get("schema_version")
        .or_else(|| payload.get("schema"))
        .and_then(Value::as_str)
        .unwrap_or("")
}

fn check_memory_budget(payload: &Value, max_chars: usize, max_lines: usize, errors: &mut Vec<String>) {
    let Ok((chars, lines)) = io::payload_size(payload) else {
        errors.push("memory_payload_unserializable".to_string());
        return;
    };
    if chars > max_chars {
        errors.push(format!("memory_budget_chars_exceeded: {chars} > {max_chars}"));
    }
    if lines > max_lines {
        errors.push(format!("memory_budget_lines_exceeded: {lines} > {max_lines}"));
    }
}

/// Validate a memory pack (semantic, decisions pack, or slices manifest)
/// against its declared schema plus the byte/line budget.
pub fn validate_memory_data(payload: &Value, max_chars: usize, max_lines: usize) -> Vec<String> {
    let mut errors = Vec::new();
    match declared_schema(payload) {
        s if s == schema::MEMORY_SEMANTIC_V1 => {
            schema::check_schema_field(payload, schema::MEMORY_SEMANTIC_V1, &mut errors);
            schema::require_str(payload, "ticket", &mut errors);
            for (section, cols) in SEMANTIC_SECTIONS {
                match payload.get(section) {
                    Some(block) => schema::check_columnar(block, cols, section, &mut errors),
                    None => errors.push(format!("memory_section_missing: {section}")),
                }
            }
            match payload.get("open_questions") {
                Some(Value::Array(items)) if items.iter().all(Value::is_string) => {}
                _ => errors.push("memory_section_invalid: open_questions".to_string()),
            }
        }
        s if s == schema::MEMORY_DECISIONS_PACK_V1 => {
            schema::check_schema_field(payload, schema::MEMORY_DECISIONS_PACK_V1, &mut errors);
            schema::require_str(payload, "ticket", &mut errors);
            match payload.get("active_decisions") {
                Some(block) => schema::check_columnar(block, &ACTIVE_COLS, "active_decisions", &mut errors),
                None => errors.push("memory_section_missing: active_decisions".to_string()),
            }
            match payload.get("superseded_heads") {
                Some(block) => {
                    schema::check_columnar(block, &SUPERSEDED_COLS, "superseded_heads", &mut errors)
                }
                None => errors.push("memory_section_missing: superseded_heads".to_string()),
            }
            match payload.get("conflicts") {
                Some(Value::Array(items)) if items.iter().all(Value::is_string) => {}
                _ => errors.push("memory_section_invalid: conflicts".to_string()),
            }
        }
        s if s == schema::MEMORY_SLICES_MANIFEST_V1 => {
            schema::check_schema_field(payload, schema::MEMORY_SLICES_MANIFEST_V1, &mut errors);
            schema::require_str(payload, "ticket", &mut errors);
            match payload.get("slices") {
                Some(block) => schema::check_columnar(block, &MANIFEST_COLS, "slices", &mut errors),
                None => errors.push("memory_section_missing: slices".to_string()),
            }
        }
        s if s == schema::MEMORY_DECISION_V1 => {
            return validate_decision_data(payload);
        }
        other => {
            errors.push(format!("memory_unknown_schema: '{other}'"));
        }
    }
    check_memory_budget(payload, max_chars, max_lines, &mut errors);
    errors
}

/// Validate a single decision log entry.
pub fn validate_decision_data(payload: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    schema::check_schema_field(payload, schema::MEMORY_DECISION_V1, &mut errors);
    for field in ["ts", "ticket", "decision_id", "topic", "decision"] {
        schema::require_str(payload, field, &mut errors);
    }
    let status = payload.get("status").and_then(Value::as_str).unwrap_or("");
    if !super::decisions::DECISION_STATUSES.contains(&status) {
        errors.push(format!("memory_invalid_enum: status '{status}'"));
    }
    if let Some(alternatives) = payload.get("alternatives") {
        if !alternatives.as_array().map(|a| a.iter().all(Value::is_string)).unwrap_or(false) {
            errors.push("memory_invalid_field: alternatives must be a list of strings".to_string());
        }
    }
    errors
}

/// Validate a decisions JSONL file line by line; one error per bad line.
pub fn validate_decision_log(path: &Path) -> Vec<String> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return vec![format!("memory_log_unreadable: {}", path.display())];
    };
    let mut errors = Vec::new();
    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(entry) => {
                for error in validate_decision_data(&entry) {
                    errors.push(format!("line {}: {error}", number + 1));
                }
            }
            Err(_) => errors.push(format!("line {}: memory_invalid_json", number + 1)),
        }
    }
    errors
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn semantic_payload() -> Value {
        json!({
            "schema": "aidd.memory.semantic.v1",
            "schema_version": "aidd.memory.semantic.v1",
            "ticket": "MEM-1",
            "terms": {
                "cols": ["term", "definition", "aliases", "scope", "confidence"],
                "rows": [["api", "Application API", [], "aidd/docs/plan/MEM-1.md", 0.7]],
            },
            "defaults": {
                "cols": ["key", "value", "source", "rationale"],
                "rows": [["timeout", "30", "aidd/docs/plan/MEM-1.md", "default"]],
            },
            "constraints": {
                "cols": ["id", "text", "source", "severity"],
                "rows": [["c1", "must use auth", "aidd/docs/plan/MEM-1.md", "high"]],
            },
            "invariants": {
                "cols": ["id", "text", "source"],
                "rows": [["i1", "always validate input", "aidd/docs/plan/MEM-1.md"]],
            },
            "open_questions": ["How is token refresh handled?"],
        })
    }

    fn decision_payload() -> Value {
        json!({
            "schema": "aidd.memory.decision.v1",
            "schema_version": "aidd.memory.decision.v1",
            "ts": "2026-02-25T00:00:00Z",
            "ticket": "MEM-1",
            "decision_id": "d1",
            "topic": "storage",
            "decision": "use sqlite",
            "alternatives": ["postgres"],
            "status": "active",
        })
    }

    #[test]
    fn semantic_payload_validates() {
        assert!(validate_memory_data(&semantic_payload(), 8000, 320).is_empty());
    }

    #[test]
    fn bad_status_is_enum_error() {
        let mut payload = decision_payload();
        payload["status"] = json!("pending");
        let errors = validate_decision_data(&payload);
        assert!(errors.iter().any(|e| e.contains("memory_invalid_enum")), "{errors:?}");
    }

    #[test]
    fn budget_overflow_is_reported() {
        let errors = validate_memory_data(&semantic_payload(), 120, 10);
        assert!(errors.iter().any(|e| e.contains("memory_budget_chars_exceeded")), "{errors:?}");
    }

    #[test]
    fn wrong_cols_are_rejected() {
        let mut payload = semantic_payload();
        payload["terms"]["cols"] = json!(["term", "definition"]);
        let errors = validate_memory_data(&payload, 8000, 320);
        assert!(!errors.is_empty());
    }

    #[test]
    fn decision_log_reports_bad_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("decisions.jsonl");
        let valid = serde_json::to_string(&decision_payload()).unwrap();
        std::fs::write(&path, format!("{valid}\n{{broken json}}\n")).unwrap();
        let errors = validate_decision_log(&path);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("line 2"));
    }
}
