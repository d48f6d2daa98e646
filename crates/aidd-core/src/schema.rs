//! Shared validator rules for canonical artifacts.
//!
//! Validators accumulate error strings instead of failing fast; the CLI
//! prints one per line and exits 2 when any exist. Per-artifact validators
//! live next to their artifact modules and compose the helpers here.

use crate::io;
use crate::scope;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Schema names
// ---------------------------------------------------------------------------

pub const STAGE_RESULT_V1: &str = "aidd.stage_result.v1";
pub const ACTIONS_V1: &str = "aidd.actions.v1";
pub const ACTIONS_V0: &str = "aidd.actions.v0";
pub const REPORT_PACK_V1: &str = "aidd.report.pack.v1";
pub const SKILL_CONTRACT_V1: &str = "aidd.skill_contract.v1";
pub const LOOP_PACK_V1: &str = "aidd.loop_pack.v1";
pub const READMAP_V1: &str = "aidd.readmap.v1";
pub const WRITEMAP_V1: &str = "aidd.writemap.v1";
pub const MEMORY_SEMANTIC_V1: &str = "aidd.memory.semantic.v1";
pub const MEMORY_DECISION_V1: &str = "aidd.memory.decision.v1";
pub const MEMORY_DECISIONS_PACK_V1: &str = "aidd.memory.decisions.pack.v1";
pub const MEMORY_SLICES_MANIFEST_V1: &str = "aidd.memory.slices.manifest.v1";
pub const OUTPUT_CONTRACT_V1: &str = "aidd.output_contract.v1";
pub const AST_PACK_V1: &str = "aidd.ast.pack.v1";

pub fn known_schemas() -> &'static [&'static str] {
    &[
        STAGE_RESULT_V1,
        ACTIONS_V0,
        ACTIONS_V1,
        REPORT_PACK_V1,
        SKILL_CONTRACT_V1,
        LOOP_PACK_V1,
        READMAP_V1,
        WRITEMAP_V1,
        MEMORY_SEMANTIC_V1,
        MEMORY_DECISION_V1,
        MEMORY_DECISIONS_PACK_V1,
        MEMORY_SLICES_MANIFEST_V1,
        OUTPUT_CONTRACT_V1,
        AST_PACK_V1,
    ]
}

// ---------------------------------------------------------------------------
// Field rules
// ---------------------------------------------------------------------------

/// The payload must carry `schema` and/or `schema_version` equal to
/// `expected`; carrying neither, or a different value, is an error.
pub fn check_schema_field(payload: &Value, expected: &str, errors: &mut Vec<String>) {
    let schema = payload.get("schema").and_then(Value::as_str);
    let version = payload.get("schema_version").and_then(Value::as_str);
    match (schema, version) {
        (None, None) => errors.push(format!("schema: missing (expected {expected})")),
        (s, v) => {
            for (field, got) in [("schema", s), ("schema_version", v)] {
                if let Some(got) = got {
                    if got != expected {
                        errors.push(format!("{field}: expected {expected}, got {got}"));
                    }
                }
            }
        }
    }
}

pub fn require_str<'a>(
    payload: &'a Value,
    field: &str,
    errors: &mut Vec<String>,
) -> Option<&'a str> {
    match payload.get(field).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Some(s),
        Some(_) => {
            errors.push(format!("{field}: must be a non-empty string"));
            None
        }
        None => {
            errors.push(format!("{field}: missing"));
            None
        }
    }
}

pub fn require_member(value: &str, allowed: &[&str], field: &str, errors: &mut Vec<String>) {
    if !allowed.contains(&value) {
        errors.push(format!("{field}: '{value}' not in {allowed:?}"));
    }
}

// ---------------------------------------------------------------------------
// Columnar blocks
// ---------------------------------------------------------------------------

/// `{cols, rows}` blocks require `cols` to equal the declared tuple exactly
/// and every row to be a list of the same length.
pub fn check_columnar(block: &Value, expected_cols: &[&str], label: &str, errors: &mut Vec<String>) {
    let Some(obj) = block.as_object() else {
        errors.push(format!("{label}: must be an object with cols/rows"));
        return;
    };
    let cols: Vec<&str> = obj
        .get("cols")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if cols != expected_cols {
        errors.push(format!("{label}.cols: expected {expected_cols:?}, got {cols:?}"));
        return;
    }
    match obj.get("rows").and_then(Value::as_array) {
        Some(rows) => {
            for (i, row) in rows.iter().enumerate() {
                match row.as_array() {
                    Some(cells) if cells.len() == expected_cols.len() => {}
                    Some(cells) => errors.push(format!(
                        "{label}.rows[{i}]: expected {} cells, got {}",
                        expected_cols.len(),
                        cells.len()
                    )),
                    None => errors.push(format!("{label}.rows[{i}]: must be a list")),
                }
            }
        }
        None => errors.push(format!("{label}.rows: missing")),
    }
}

// ---------------------------------------------------------------------------
// Scope alignment & budgets
// ---------------------------------------------------------------------------

/// When `work_item_key` is an iteration key, `scope_key` must equal its
/// canonical form exactly.
pub fn check_scope_alignment(
    work_item_key: &str,
    scope_key: &str,
    ticket: &str,
    errors: &mut Vec<String>,
) {
    if !scope::is_iteration_work_item_key(work_item_key) {
        return;
    }
    let expected = scope::resolve_scope_key(work_item_key, ticket);
    if scope_key != expected {
        errors.push(format!(
            "scope_key: expected canonical '{expected}' for '{work_item_key}', got '{scope_key}'"
        ));
    }
}

/// Budget violations are measured on the canonical serialization.
pub fn check_budget(payload: &Value, max_chars: usize, max_lines: usize, errors: &mut Vec<String>) {
    match io::payload_size(payload) {
        Ok((chars, lines)) => {
            if chars > max_chars {
                errors.push(format!("budget: {chars} chars exceeds {max_chars}"));
            }
            if lines > max_lines {
                errors.push(format!("budget: {lines} lines exceeds {max_lines}"));
            }
        }
        Err(e) => errors.push(format!("budget: serialization failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_field_matches_either_spelling() {
        let mut errors = Vec::new();
        check_schema_field(&json!({"schema": STAGE_RESULT_V1}), STAGE_RESULT_V1, &mut errors);
        check_schema_field(&json!({"schema_version": ACTIONS_V1}), ACTIONS_V1, &mut errors);
        assert!(errors.is_empty());

        check_schema_field(&json!({}), STAGE_RESULT_V1, &mut errors);
        check_schema_field(&json!({"schema": "other"}), STAGE_RESULT_V1, &mut errors);
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn columnar_rules() {
        let mut errors = Vec::new();
        check_columnar(
            &json!({"cols": ["a", "b"], "rows": [["1", "2"]]}),
            &["a", "b"],
            "block",
            &mut errors,
        );
        assert!(errors.is_empty());

        check_columnar(
            &json!({"cols": ["a"], "rows": []}),
            &["a", "b"],
            "block",
            &mut errors,
        );
        check_columnar(
            &json!({"cols": ["a", "b"], "rows": [["only-one"]]}),
            &["a", "b"],
            "block",
            &mut errors,
        );
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn scope_alignment_only_binds_iteration_keys() {
        let mut errors = Vec::new();
        check_scope_alignment("iteration_id=I1", "iteration_id_I1", "T", &mut errors);
        check_scope_alignment("id=free form", "anything", "T", &mut errors);
        assert!(errors.is_empty());

        check_scope_alignment("iteration_id=I1", "wrong", "T", &mut errors);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("iteration_id_I1"));
    }

    #[test]
    fn budget_errors_name_the_limit() {
        let mut errors = Vec::new();
        check_budget(&json!({"x": "y".repeat(200)}), 50, 1000, &mut errors);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("exceeds 50"));
    }

    #[test]
    fn require_str_rules() {
        let mut errors = Vec::new();
        assert_eq!(require_str(&json!({"t": "x"}), "t", &mut errors), Some("x"));
        assert_eq!(require_str(&json!({"t": "  "}), "t", &mut errors), None);
        assert_eq!(require_str(&json!({}), "t", &mut errors), None);
        assert_eq!(errors.len(), 2);
    }
}
