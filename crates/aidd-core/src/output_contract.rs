//! Output-contract checker for implement/review/qa stage logs.
//!
//! A stage's final message must carry a fixed set of fields plus the
//! `AIDD:READ_LOG` / `AIDD:ACTIONS_LOG` markers. The checker grades read
//! discipline (packs before full docs, loop pack first), cross-checks the
//! reported status against the persisted stage result, and applies the
//! memory-slice and AST gates. The verdict is persisted next to the stage
//! result.

use crate::ast_index::{self, AstIndexConfig};
use crate::context_quality;
use crate::error::Result;
use crate::gates::GatesConfig;
use crate::io;
use crate::memory;
use crate::paths;
use crate::stage_result;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::OnceLock;

pub const OUTPUT_CONTRACT_V1: &str = "aidd.output_contract.v1";

pub const REQUIRED_FIELDS: [&str; 7] =
    ["artifacts", "blockers", "next_actions", "read_log", "status", "tests", "work_item_key"];

const FULL_DOC_PREFIXES: [&str; 5] = [
    "aidd/docs/prd/",
    "aidd/docs/plan/",
    "aidd/docs/tasklist/",
    "aidd/docs/research/",
    "aidd/docs/spec/",
];

pub const DEFAULT_MAX_READ_ITEMS: usize = 8;

// ---------------------------------------------------------------------------
// Field parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ReadEntry {
    pub path: String,
    pub reason: String,
}

static FIELD_RES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
static REASON_CODE_RE: OnceLock<Regex> = OnceLock::new();

fn field_res() -> &'static [(&'static str, Regex)] {
    FIELD_RES.get_or_init(|| {
        [
            ("status", r"(?i)^Status:\s*(.+)$"),
            ("work_item_key", r"(?i)^Work item key:\s*(.+)$"),
            ("artifacts", r"(?i)^Artifacts updated:\s*(.+)$"),
            ("tests", r"(?i)^Tests:\s*(.+)$"),
            ("blockers", r"(?i)^Blockers/Handoff:\s*(.+)$"),
            ("next_actions", r"(?i)^Next actions:\s*(.+)$"),
            ("read_log", r"(?i)^AIDD:READ_LOG:\s*(.+)$"),
            ("actions_log", r"(?i)^AIDD:ACTIONS_LOG:\s*(.+)$"),
        ]
        .into_iter()
        .map(|(key, pattern)| (key, Regex::new(pattern).unwrap()))
        .collect()
    })
}

fn reason_code_re() -> &'static Regex {
    REASON_CODE_RE.get_or_init(|| Regex::new(r"(?i)reason_code\s*=\s*([a-z0-9_:-]+)").unwrap())
}

/// Scan the log for the last occurrence of each contract field.
pub fn parse_fields(text: &str) -> std::collections::BTreeMap<String, String> {
    let mut fields = std::collections::BTreeMap::new();
    for raw in text.lines() {
        let line = raw.trim();
        for (key, pattern) in field_res() {
            if let Some(caps) = pattern.captures(line) {
                fields.insert(key.to_string(), caps[1].trim().to_string());
            }
        }
    }
    fields
}

static READ_REASON_RE: OnceLock<Regex> = OnceLock::new();

/// Split a read-log value on `;`, stripping list dashes and the optional
/// `(reason: …)` suffix per entry.
pub fn parse_read_log(raw: &str) -> Vec<ReadEntry> {
    let reason_re = READ_REASON_RE
        .get_or_init(|| Regex::new(r"(?i)\(reason:\s*([^)]+)\)").unwrap());
    raw.split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let cleaned = part.trim_start_matches('-').trim();
            match reason_re.find(cleaned) {
                Some(found) => {
                    let caps = reason_re.captures(cleaned).unwrap();
                    ReadEntry {
                        path: cleaned[..found.start()].trim().to_string(),
                        reason: caps[1].trim().to_string(),
                    }
                }
                None => ReadEntry { path: cleaned.to_string(), reason: String::new() },
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Path classification
// ---------------------------------------------------------------------------

fn norm(path: &str) -> String {
    path.replace('\\', "/")
}

fn is_full_doc(path: &str) -> bool {
    let p = norm(path);
    FULL_DOC_PREFIXES.iter().any(|prefix| p.starts_with(prefix))
}

fn is_report_path(path: &str) -> bool {
    norm(path).starts_with("aidd/reports/")
}

fn is_memory_pack(path: &str) -> bool {
    let p = norm(path);
    p.starts_with("aidd/reports/memory/") && p.ends_with(".pack.json")
}

fn is_ast_pack(path: &str) -> bool {
    let p = norm(path);
    p.starts_with("aidd/reports/research/") && p.ends_with("-ast.pack.json")
}

fn reason_allows_full_doc(reason: &str) -> bool {
    let lowered = reason.to_ascii_lowercase();
    ["missing field", "missing_fields", "missing-fields", "excerpt missing", "missing excerpt"]
        .iter()
        .any(|token| lowered.contains(token))
}

/// Pull `reason_code=<token>` assignments plus bare AST reason codes out of
/// a read-log reason string.
pub fn extract_reason_codes(reason: &str) -> Vec<String> {
    if reason.is_empty() {
        return Vec::new();
    }
    let mut found: Vec<String> = reason_code_re()
        .captures_iter(reason)
        .map(|caps| caps[1].trim().to_ascii_lowercase())
        .collect();
    let lowered = reason.to_ascii_lowercase();
    for code in ast_index::REASON_CODES {
        if lowered.contains(code) {
            found.push(code.to_string());
        }
    }
    found.sort();
    found.dedup();
    found
}

fn strip_project_prefix(path: &str) -> &str {
    path.strip_prefix("aidd/").unwrap_or(path)
}

fn find_index(entries: &[ReadEntry], predicate: impl Fn(&str) -> bool) -> Option<usize> {
    entries.iter().position(|entry| predicate(&entry.path))
}

// ---------------------------------------------------------------------------
// Cross-checks
// ---------------------------------------------------------------------------

fn manifest_is_valid(path: &Path) -> bool {
    io::read_json::<Value>(path)
        .ok()
        .map(|payload| {
            payload.get("schema").and_then(Value::as_str).unwrap_or("").trim()
                == crate::schema::MEMORY_SLICES_MANIFEST_V1
        })
        .unwrap_or(false)
}

fn manifest_age_minutes(path: &Path) -> Option<f64> {
    let payload = io::read_json::<Value>(path).ok()?;
    let ts = payload
        .get("updated_at")
        .or_else(|| payload.get("generated_at"))
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .or_else(|| {
            let modified = std::fs::metadata(path).ok()?.modified().ok()?;
            Some(DateTime::<Utc>::from(modified))
        })?;
    let age = (Utc::now() - ts).num_milliseconds() as f64 / 60_000.0;
    Some(age.max(0.0))
}

/// Status label the agent is expected to report for the persisted result.
fn expected_status(stage: &str, path: &Path) -> String {
    let Ok(raw) = io::read_json::<Value>(path) else {
        return String::new();
    };
    let Ok(payload) = stage_result::normalize_stage_result_payload(&raw, stage) else {
        return String::new();
    };
    match stage_result::effective_stage_result(&payload).as_str() {
        "done" => "OK".to_string(),
        "blocked" => "BLOCKED".to_string(),
        "continue" => "CONTINUE".to_string(),
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

pub struct ContractRequest<'a> {
    pub ticket: &'a str,
    pub stage: &'a str,
    pub scope_key: &'a str,
    pub work_item_key: &'a str,
    pub log_path: &'a Path,
    pub stage_result_path: Option<&'a Path>,
    pub max_read_items: usize,
}

/// Evaluate the output contract for one stage log and persist the verdict
/// to `reports/loops/<ticket>/<scope>/output.contract.json`.
pub fn check_output_contract(root: &Path, request: &ContractRequest<'_>) -> Result<Value> {
    let ContractRequest { ticket, stage, scope_key, work_item_key, log_path, .. } = *request;
    let text = std::fs::read_to_string(log_path).unwrap_or_default();
    let fields = parse_fields(&text);
    let mut missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .filter(|field| !fields.contains_key(**field))
        .copied()
        .collect();
    missing.sort_unstable();
    let mut warnings: Vec<String> = Vec::new();

    let read_entries = parse_read_log(fields.get("read_log").map(String::as_str).unwrap_or(""));
    if read_entries.is_empty() {
        warnings.push("read_log_missing".to_string());
    }
    if request.max_read_items > 0 && read_entries.len() > request.max_read_items {
        warnings.push("read_log_too_long".to_string());
    }
    for entry in &read_entries {
        if is_full_doc(&entry.path) && !reason_allows_full_doc(&entry.reason) {
            warnings.push("full_doc_without_missing_fields".to_string());
        }
        if !is_report_path(&entry.path) && !is_full_doc(&entry.path) {
            warnings.push("non_pack_read_log_entry".to_string());
        }
    }

    let loop_idx = find_index(&read_entries, |p| p.contains(".loop.pack."));
    let review_idx = find_index(&read_entries, |p| p.contains("review.latest.pack"));
    let context_idx = find_index(&read_entries, |p| p.contains("/reports/context/"));
    let memory_idx = find_index(&read_entries, is_memory_pack);
    let ast_idx = find_index(&read_entries, is_ast_pack);
    let full_read_idx = find_index(&read_entries, is_full_doc);

    // Memory-slice freshness gate.
    let gates = GatesConfig::load(root);
    let gate = gates.memory_slice_gate();
    let memory_enforced = gate.mode != "off" && gate.stages.iter().any(|s| s == stage);
    let manifest_path = memory::slices_manifest_path(root, ticket, stage, scope_key);
    let manifest_expected = paths::rel_path(&manifest_path, root);
    let manifest_idx = find_index(&read_entries, |p| {
        strip_project_prefix(&norm(p)) == strip_project_prefix(&manifest_expected)
    });
    let manifest_exists = manifest_is_valid(&manifest_path);
    let manifest_age =
        if manifest_exists { manifest_age_minutes(&manifest_path) } else { None };

    let mut memory_blocked_reason = String::new();
    let mut memory_next_action = String::new();
    if memory_enforced {
        if manifest_idx.is_none() {
            warnings.push("memory_slice_missing".to_string());
        }
        if !manifest_exists {
            warnings.push("memory_slice_manifest_missing".to_string());
        }
        if manifest_age.map(|age| age > gate.max_slice_age_minutes as f64).unwrap_or(false) {
            warnings.push("memory_slice_stale".to_string());
        }
        if let Some(full_idx) = full_read_idx {
            if manifest_idx.map(|idx| idx > full_idx).unwrap_or(true) {
                warnings.push("memory_slice_missing".to_string());
            }
        }
        if gate.mode == "hard" {
            for code in ["memory_slice_stale", "memory_slice_manifest_missing", "memory_slice_missing"] {
                if warnings.iter().any(|w| w == code) {
                    memory_blocked_reason = code.to_string();
                    break;
                }
            }
            if !memory_blocked_reason.is_empty() {
                memory_next_action = format!(
                    "aidd memory-autoslice --ticket {ticket} --stage {stage} --scope-key {scope_key}"
                );
            }
        }
    }

    // Actions-log presence and read-order discipline.
    if matches!(stage, "implement" | "review" | "qa") {
        match fields.get("actions_log").map(String::as_str).unwrap_or("").trim() {
            "" => warnings.push("actions_log_missing".to_string()),
            value if value.eq_ignore_ascii_case("n/a") => {
                warnings.push("actions_log_invalid".to_string())
            }
            value => {
                let resolved = paths::resolve_path_for_target(Path::new(value), root);
                if !resolved.exists() {
                    warnings.push("actions_log_path_missing".to_string());
                }
            }
        }
        let before = |a: Option<usize>, b: Option<usize>| matches!((a, b), (Some(a), Some(b)) if a < b);
        if stage == "qa" {
            if context_idx.is_none() {
                warnings.push("read_order_missing_context_pack".to_string());
            }
            if before(context_idx, manifest_idx) {
                warnings.push("read_order_context_before_memory_slice".to_string());
            }
        } else {
            if loop_idx.is_none() {
                warnings.push("read_order_missing_loop_pack".to_string());
            }
            if before(ast_idx, loop_idx) {
                warnings.push("read_order_ast_before_loop".to_string());
            }
        }
        if before(review_idx, loop_idx) {
            warnings.push("read_order_review_before_loop".to_string());
        }
        if before(context_idx, loop_idx) {
            warnings.push("read_order_context_before_loop".to_string());
        }
        if before(context_idx, review_idx) {
            warnings.push("read_order_context_before_review".to_string());
        }
        if before(context_idx, memory_idx) {
            warnings.push("read_order_context_before_memory".to_string());
        }
    }

    // Reported status vs the persisted stage result.
    let default_result_path = paths::stage_result_path(root, ticket, scope_key, stage);
    let result_path = request.stage_result_path.unwrap_or(&default_result_path);
    let status_expected = expected_status(stage, result_path);
    let status_output = fields.get("status").cloned().unwrap_or_default();
    if !status_expected.is_empty()
        && !status_output.is_empty()
        && !status_expected.eq_ignore_ascii_case(status_output.trim())
    {
        warnings.push("status_mismatch_stage_result".to_string());
    }

    // AST fallback gate.
    let ast_config = AstIndexConfig::from_gates(&gates);
    let ast_required = ast_config.enforced();
    let mut ast_reason_codes: Vec<String> = read_entries
        .iter()
        .flat_map(|entry| extract_reason_codes(&entry.reason))
        .filter(|code| ast_index::REASON_CODES.contains(&code.as_str()))
        .collect();
    ast_reason_codes.sort();
    ast_reason_codes.dedup();
    let mut ast_blocked_reason = String::new();
    let mut ast_next_action = String::new();
    if !ast_reason_codes.is_empty() {
        if ast_required {
            warnings.push("ast_index_required_fallback".to_string());
            ast_blocked_reason = ast_reason_codes[0].clone();
            ast_next_action = ast_index::next_action(ticket, &ast_blocked_reason);
        } else {
            warnings.push("ast_index_fallback_warn".to_string());
        }
    }

    warnings.sort();
    warnings.dedup();

    let blocked_reason = if memory_blocked_reason.is_empty() {
        ast_blocked_reason
    } else {
        memory_blocked_reason.clone()
    };
    let status = if !blocked_reason.is_empty() {
        "blocked"
    } else if !warnings.is_empty() || !missing.is_empty() {
        "warn"
    } else {
        "ok"
    };
    let reason_code = if !blocked_reason.is_empty() {
        blocked_reason.clone()
    } else if status == "warn" {
        "output_contract_warn".to_string()
    } else {
        String::new()
    };
    let next_action = if !memory_blocked_reason.is_empty() {
        memory_next_action
    } else {
        ast_next_action
    };

    let payload = json!({
        "schema": OUTPUT_CONTRACT_V1,
        "ticket": ticket,
        "stage": stage,
        "scope_key": scope_key,
        "work_item_key": if work_item_key.is_empty() { Value::Null } else { json!(work_item_key) },
        "log_path": paths::rel_path(log_path, root),
        "stage_result_path": paths::rel_path(result_path, root),
        "status": status,
        "reason_code": reason_code,
        "missing_fields": missing,
        "warnings": warnings,
        "status_output": status_output,
        "status_expected": status_expected,
        "read_log": read_entries,
        "actions_log": fields.get("actions_log").cloned().unwrap_or_default(),
        "ast_required": ast_required,
        "ast_reason_codes": ast_reason_codes,
        "memory_slice_policy_mode": gate.mode,
        "memory_slice_enforced": memory_enforced,
        "memory_slice_manifest_expected": manifest_expected,
        "memory_slice_manifest_read": manifest_idx.is_some(),
        "memory_slice_manifest_exists": manifest_exists,
        "memory_slice_manifest_age_minutes": manifest_age.map(|a| (a * 1000.0).round() / 1000.0),
        "memory_slice_max_age_minutes": gate.max_slice_age_minutes,
        "next_action": next_action,
    });

    io::write_json(&paths::output_contract_path(root, ticket, scope_key), &payload)?;

    let read_paths: Vec<String> =
        payload["read_log"].as_array().unwrap().iter().map(|e| e["path"].as_str().unwrap_or("").to_string()).collect();
    let warnings_vec: Vec<String> = payload["warnings"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    let ast_codes_vec: Vec<String> = payload["ast_reason_codes"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    // Rollup failures never fail the contract check itself.
    let _ = context_quality::update_from_output_contract(
        root,
        ticket,
        &read_paths,
        payload["status"].as_str().unwrap_or(""),
        payload["reason_code"].as_str().unwrap_or(""),
        &ast_codes_vec,
        &warnings_vec,
    );
    Ok(payload)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_log(root: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = root.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn request<'a>(log_path: &'a Path) -> ContractRequest<'a> {
        ContractRequest {
            ticket: "OC-1",
            stage: "implement",
            scope_key: "iteration_id_I1",
            work_item_key: "iteration_id=I1",
            log_path,
            stage_result_path: None,
            max_read_items: DEFAULT_MAX_READ_ITEMS,
        }
    }

    fn compliant_log() -> String {
        [
            "Status: OK",
            "Work item key: iteration_id=I1",
            "Artifacts updated: src/lib.rs",
            "Tests: cargo test",
            "Blockers/Handoff: none",
            "Next actions: none",
            "AIDD:READ_LOG: aidd/reports/loops/OC-1/iteration_id_I1.loop.pack.md; aidd/reports/context/OC-1.pack.md",
            "AIDD:ACTIONS_LOG: n/a-not-a-file",
        ]
        .join("\n")
    }

    #[test]
    fn parses_fields_and_read_log() {
        let fields = parse_fields(&compliant_log());
        assert_eq!(fields["status"], "OK");
        let entries = parse_read_log(&fields["read_log"]);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].path.contains(".loop.pack.md"));
    }

    #[test]
    fn read_log_reason_suffix_is_split_off() {
        let entries =
            parse_read_log("- aidd/docs/plan/OC-1.md (reason: missing fields in excerpt)");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "aidd/docs/plan/OC-1.md");
        assert_eq!(entries[0].reason, "missing fields in excerpt");
    }

    #[test]
    fn missing_fields_and_log_produce_warn() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let log = write_log(root, "stage.implement.log", "Status: OK\n");
        let payload = check_output_contract(root, &request(&log)).unwrap();
        assert_eq!(payload["status"], "warn");
        assert_eq!(payload["reason_code"], "output_contract_warn");
        let missing: Vec<&str> =
            payload["missing_fields"].as_array().unwrap().iter().map(|v| v.as_str().unwrap()).collect();
        assert!(missing.contains(&"read_log"));
        let warnings = payload["warnings"].as_array().unwrap();
        assert!(warnings.iter().any(|w| w == "read_log_missing"));
        assert!(warnings.iter().any(|w| w == "read_order_missing_loop_pack"));
        assert!(paths::output_contract_path(root, "OC-1", "iteration_id_I1").exists());
    }

    #[test]
    fn full_doc_needs_missing_fields_reason() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let log = write_log(
            root,
            "stage.implement.log",
            &compliant_log().replace(
                "AIDD:READ_LOG: aidd/reports/loops/OC-1/iteration_id_I1.loop.pack.md; aidd/reports/context/OC-1.pack.md",
                "AIDD:READ_LOG: aidd/reports/loops/OC-1/iteration_id_I1.loop.pack.md; aidd/docs/plan/OC-1.md",
            ),
        );
        let payload = check_output_contract(root, &request(&log)).unwrap();
        let warnings = payload["warnings"].as_array().unwrap();
        assert!(warnings.iter().any(|w| w == "full_doc_without_missing_fields"));

        let log = write_log(
            root,
            "stage.implement.2.log",
            &compliant_log().replace(
                "aidd/docs/plan/OC-1.md",
                "aidd/docs/plan/OC-1.md (reason: missing fields)",
            ),
        );
        let payload = check_output_contract(root, &request(&log)).unwrap();
        let warnings = payload["warnings"].as_array().unwrap();
        assert!(!warnings.iter().any(|w| w == "full_doc_without_missing_fields"));
    }

    #[test]
    fn actions_log_field_is_checked() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        let log = write_log(
            root,
            "stage.implement.log",
            &compliant_log().replace("\nAIDD:ACTIONS_LOG: n/a-not-a-file", ""),
        );
        let payload = check_output_contract(root, &request(&log)).unwrap();
        let warnings = payload["warnings"].as_array().unwrap();
        assert!(warnings.iter().any(|w| w == "actions_log_missing"));

        let log = write_log(
            root,
            "stage.implement.2.log",
            &compliant_log().replace("AIDD:ACTIONS_LOG: n/a-not-a-file", "AIDD:ACTIONS_LOG: n/a"),
        );
        let payload = check_output_contract(root, &request(&log)).unwrap();
        let warnings = payload["warnings"].as_array().unwrap();
        assert!(warnings.iter().any(|w| w == "actions_log_invalid"));
    }

    #[test]
    fn read_order_violations_are_flagged() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let log = write_log(
            root,
            "stage.implement.log",
            &compliant_log().replace(
                "AIDD:READ_LOG: aidd/reports/loops/OC-1/iteration_id_I1.loop.pack.md; aidd/reports/context/OC-1.pack.md",
                "AIDD:READ_LOG: aidd/reports/context/OC-1.pack.md; aidd/reports/loops/OC-1/iteration_id_I1.loop.pack.md",
            ),
        );
        let payload = check_output_contract(root, &request(&log)).unwrap();
        let warnings = payload["warnings"].as_array().unwrap();
        assert!(warnings.iter().any(|w| w == "read_order_context_before_loop"));
    }

    #[test]
    fn hard_memory_gate_blocks_with_precedence() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        io::write_json(
            &paths::gates_config_path(root),
            &json!({"memory": {"slice_enforcement": "hard", "enforce_stages": ["implement"]}}),
        )
        .unwrap();
        let log = write_log(root, "stage.implement.log", &compliant_log());
        let payload = check_output_contract(root, &request(&log)).unwrap();
        assert_eq!(payload["status"], "blocked");
        assert_eq!(payload["reason_code"], "memory_slice_manifest_missing");
        assert!(payload["next_action"].as_str().unwrap().contains("memory-autoslice"));
    }

    #[test]
    fn status_mismatch_against_stage_result() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        io::write_json(
            &paths::stage_result_path(root, "OC-1", "iteration_id_I1", "implement"),
            &json!({
                "schema": "aidd.stage_result.v1",
                "stage": "implement",
                "result": "blocked",
                "reason_code": "tests_failed",
            }),
        )
        .unwrap();
        let log = write_log(root, "stage.implement.log", &compliant_log());
        let payload = check_output_contract(root, &request(&log)).unwrap();
        assert_eq!(payload["status_expected"], "BLOCKED");
        let warnings = payload["warnings"].as_array().unwrap();
        assert!(warnings.iter().any(|w| w == "status_mismatch_stage_result"));
    }

    #[test]
    fn ast_fallback_warns_when_not_required() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let log = write_log(
            root,
            "stage.implement.log",
            &compliant_log().replace(
                "aidd/reports/context/OC-1.pack.md",
                "aidd/reports/research/OC-1-ast.pack.json (reason: reason_code=ast_index_fallback_rg)",
            ),
        );
        let payload = check_output_contract(root, &request(&log)).unwrap();
        let warnings = payload["warnings"].as_array().unwrap();
        assert!(warnings.iter().any(|w| w == "ast_index_fallback_warn"));
        assert_eq!(payload["ast_reason_codes"][0], "ast_index_fallback_rg");
        assert_ne!(payload["status"], "blocked");
    }

    #[test]
    fn ast_fallback_blocks_when_required() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        io::write_json(
            &paths::gates_config_path(root),
            &json!({"ast_index": {"mode": "required"}}),
        )
        .unwrap();
        let log = write_log(
            root,
            "stage.implement.log",
            &compliant_log().replace(
                "aidd/reports/context/OC-1.pack.md",
                "aidd/reports/research/OC-1-ast.pack.json (reason: ast_index_timeout)",
            ),
        );
        let payload = check_output_contract(root, &request(&log)).unwrap();
        assert_eq!(payload["status"], "blocked");
        assert_eq!(payload["reason_code"], "ast_index_timeout");
        assert!(payload["next_action"].as_str().unwrap().contains("timeout_s"));
    }
}
