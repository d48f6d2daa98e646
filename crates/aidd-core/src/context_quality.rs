//! Per-ticket context-quality rollup: how often stages read packs and
//! slices versus whole documents, and how often retrieval fell back to
//! plain-text search. The artifact accumulates across runs; every update
//! rewrites the derived rates.

use crate::error::Result;
use crate::io;
use crate::paths;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub const CONTEXT_QUALITY_V1: &str = "aidd.context_quality.v1";

const AST_FALLBACK_CODES: [&str; 5] = [
    "ast_index_binary_missing",
    "ast_index_index_missing",
    "ast_index_timeout",
    "ast_index_json_invalid",
    "ast_index_fallback_rg",
];

const COUNTERS: [&str; 11] = [
    "pack_reads",
    "slice_reads",
    "memory_slice_reads",
    "full_reads",
    "retrieval_events",
    "fallback_events",
    "rg_invocations",
    "rg_without_slice",
    "decisions_pack_stale_events",
    "output_contract_total",
    "output_contract_warns",
];

/// Lowercase, `-`/space to `_`, strip anything outside `[a-z0-9_:]`.
pub fn normalize_reason_code(value: &str) -> String {
    value
        .trim()
        .to_ascii_lowercase()
        .replace(['-', ' '], "_")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == ':')
        .collect()
}

fn normalized_path(path: &str) -> String {
    path.trim().replace('\\', "/")
}

fn is_pack_path(path: &str) -> bool {
    let p = normalized_path(path);
    !p.is_empty() && (p.contains(".pack.") || p.ends_with(".pack.json") || p.ends_with(".pack.md"))
}

fn is_slice_path(path: &str) -> bool {
    let p = normalized_path(path);
    !p.is_empty() && (p.contains("-slice") || p.contains("/slices/") || p.contains("-chunk-"))
}

fn is_memory_slice_path(path: &str) -> bool {
    let p = normalized_path(path);
    p.contains("-memory-slice") || p.contains("-memory-slices.")
}

fn is_full_read_path(path: &str) -> bool {
    let p = normalized_path(path);
    if p.is_empty() {
        return false;
    }
    if p.starts_with("aidd/docs/") || p.starts_with("docs/") {
        return true;
    }
    if p.starts_with("aidd/reports/") {
        return !is_pack_path(&p);
    }
    true
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReadCounts {
    pub pack_reads: u64,
    pub slice_reads: u64,
    pub memory_slice_reads: u64,
    pub full_reads: u64,
}

/// Classify read-log paths. Slices win over packs; a memory-slice read
/// also counts in its broader bucket.
pub fn classify_read_paths<'a>(paths: impl IntoIterator<Item = &'a str>) -> ReadCounts {
    let mut counts = ReadCounts::default();
    for path in paths {
        if path.trim().is_empty() {
            continue;
        }
        if is_slice_path(path) {
            counts.slice_reads += 1;
            if is_memory_slice_path(path) {
                counts.memory_slice_reads += 1;
            }
        } else if is_pack_path(path) {
            counts.pack_reads += 1;
            if is_memory_slice_path(path) {
                counts.memory_slice_reads += 1;
            }
        } else if is_full_read_path(path) {
            counts.full_reads += 1;
        }
    }
    counts
}

fn default_payload(ticket: &str) -> Value {
    let now = io::utc_timestamp();
    let mut metrics = Map::new();
    for counter in COUNTERS {
        metrics.insert(counter.to_string(), json!(0));
    }
    metrics.insert("fallback_rate".to_string(), json!(0.0));
    metrics.insert("rg_without_slice_rate".to_string(), json!(0.0));
    metrics.insert("output_contract_warn_rate".to_string(), json!(0.0));
    metrics.insert("context_expand_count_by_reason".to_string(), json!({}));
    json!({
        "schema": CONTEXT_QUALITY_V1,
        "schema_version": CONTEXT_QUALITY_V1,
        "ticket": ticket,
        "generated_at": now,
        "updated_at": now,
        "metrics": metrics,
    })
}

fn load_payload(path: &Path, ticket: &str) -> Value {
    let mut payload = std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok())
        .filter(Value::is_object)
        .unwrap_or_else(|| default_payload(ticket));
    if !payload["metrics"].is_object() {
        payload["metrics"] = json!({});
    }
    let defaults = default_payload(ticket);
    for (key, value) in defaults["metrics"].as_object().unwrap() {
        if payload["metrics"].get(key).is_none() {
            payload["metrics"][key] = value.clone();
        }
    }
    payload
}

fn metric(payload: &Value, key: &str) -> u64 {
    payload["metrics"][key].as_u64().unwrap_or(0)
}

fn bump(payload: &mut Value, key: &str, delta: u64) {
    let next = metric(payload, key) + delta;
    payload["metrics"][key] = json!(next);
}

fn rate(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    (numerator as f64 / denominator as f64 * 1e6).round() / 1e6
}

/// Rebuild the context-expand reason counters from the per-scope audit
/// logs under `reports/actions/<ticket>/`.
pub fn collect_context_expand_counts(root: &Path, ticket: &str) -> BTreeMap<String, u64> {
    let mut counters = BTreeMap::new();
    let base = root.join("reports/actions").join(ticket);
    let Ok(entries) = std::fs::read_dir(&base) else {
        return counters;
    };
    for entry in entries.flatten() {
        let audit = entry.path().join("context-expand.audit.jsonl");
        let Ok((rows, _)) = io::read_jsonl(&audit) else {
            continue;
        };
        for row in rows {
            let code = normalize_reason_code(
                row.get("reason_code").and_then(Value::as_str).unwrap_or(""),
            );
            if !code.is_empty() {
                *counters.entry(code).or_insert(0) += 1;
            }
        }
    }
    counters
}

#[derive(Debug, Default)]
pub struct MetricsUpdate {
    pub reads: ReadCounts,
    pub retrieval_events: u64,
    pub fallback_events: u64,
    pub rg_invocations: u64,
    pub rg_without_slice: u64,
    pub decisions_pack_stale_events: u64,
    pub output_contract_total: u64,
    pub output_contract_warn: bool,
    pub context_expand_refresh: bool,
    pub source: String,
}

/// Apply one increment batch and rewrite the artifact.
pub fn update_metrics(root: &Path, ticket: &str, update: MetricsUpdate) -> Result<Value> {
    let path = paths::context_quality_path(root, ticket);
    let mut payload = load_payload(&path, ticket);

    bump(&mut payload, "pack_reads", update.reads.pack_reads);
    bump(&mut payload, "slice_reads", update.reads.slice_reads);
    bump(&mut payload, "memory_slice_reads", update.reads.memory_slice_reads);
    bump(&mut payload, "full_reads", update.reads.full_reads);
    bump(&mut payload, "retrieval_events", update.retrieval_events);
    bump(&mut payload, "fallback_events", update.fallback_events);
    bump(&mut payload, "rg_invocations", update.rg_invocations);
    bump(&mut payload, "rg_without_slice", update.rg_without_slice);
    bump(&mut payload, "decisions_pack_stale_events", update.decisions_pack_stale_events);
    bump(&mut payload, "output_contract_total", update.output_contract_total);
    bump(&mut payload, "output_contract_warns", if update.output_contract_warn { 1 } else { 0 });

    payload["metrics"]["fallback_rate"] =
        json!(rate(metric(&payload, "fallback_events"), metric(&payload, "retrieval_events")));
    payload["metrics"]["rg_without_slice_rate"] =
        json!(rate(metric(&payload, "rg_without_slice"), metric(&payload, "rg_invocations")));
    payload["metrics"]["output_contract_warn_rate"] = json!(rate(
        metric(&payload, "output_contract_warns"),
        metric(&payload, "output_contract_total")
    ));

    if update.context_expand_refresh {
        payload["metrics"]["context_expand_count_by_reason"] =
            json!(collect_context_expand_counts(root, ticket));
    }
    payload["updated_at"] = json!(io::utc_timestamp());
    if !update.source.is_empty() {
        payload["source"] = json!(update.source);
    }
    io::write_json(&path, &payload)?;
    Ok(payload)
}

/// Fold one output-contract evaluation into the rollup.
pub fn update_from_output_contract(
    root: &Path,
    ticket: &str,
    read_paths: &[String],
    status: &str,
    reason_code: &str,
    ast_reason_codes: &[String],
    warnings: &[String],
) -> Result<Value> {
    let reads = classify_read_paths(read_paths.iter().map(String::as_str));
    let ast_codes: Vec<String> = ast_reason_codes
        .iter()
        .map(|c| normalize_reason_code(c))
        .filter(|c| !c.is_empty())
        .collect();
    let warning_codes: Vec<String> =
        warnings.iter().map(|w| normalize_reason_code(w)).filter(|w| !w.is_empty()).collect();
    let reason_token = normalize_reason_code(reason_code);
    let ast_pack_seen =
        read_paths.iter().any(|p| normalized_path(p).ends_with("-ast.pack.json"));

    let has = |needle: &str| {
        warning_codes.iter().any(|w| w == needle) || reason_token == needle
    };
    let warn = status.trim().eq_ignore_ascii_case("warn") || reason_token == "output_contract_warn";
    update_metrics(
        root,
        ticket,
        MetricsUpdate {
            reads,
            retrieval_events: u64::from(ast_pack_seen || !ast_codes.is_empty()),
            fallback_events: u64::from(!ast_codes.is_empty()),
            rg_without_slice: u64::from(has("rg_without_slice")),
            decisions_pack_stale_events: u64::from(has("memory_decisions_pack_stale")),
            output_contract_total: 1,
            output_contract_warn: warn,
            context_expand_refresh: true,
            source: "output_contract".to_string(),
            ..Default::default()
        },
    )
}

/// Fold one research/AST retrieval attempt into the rollup.
pub fn update_from_ast(
    root: &Path,
    ticket: &str,
    ast_mode: &str,
    ast_status: &str,
    ast_reason_codes: &[String],
    ast_fallback_used: bool,
) -> Result<Value> {
    let mode = ast_mode.trim().to_ascii_lowercase();
    let status = ast_status.trim().to_ascii_lowercase();
    let codes: Vec<String> = ast_reason_codes
        .iter()
        .map(|c| normalize_reason_code(c))
        .filter(|c| !c.is_empty())
        .collect();
    let fallback =
        ast_fallback_used || codes.iter().any(|c| AST_FALLBACK_CODES.contains(&c.as_str()));
    update_metrics(
        root,
        ticket,
        MetricsUpdate {
            retrieval_events: u64::from(!mode.is_empty() && mode != "off" && status != "skipped"),
            fallback_events: u64::from(fallback),
            context_expand_refresh: true,
            source: "research_plan".to_string(),
            ..Default::default()
        },
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn normalizes_reason_tokens() {
        assert_eq!(normalize_reason_code("AST-Index Timeout"), "ast_index_timeout");
        assert_eq!(normalize_reason_code("  reason:code! "), "reason:code");
        assert_eq!(normalize_reason_code(""), "");
    }

    #[test]
    fn classifies_reads_by_shape() {
        let paths = [
            "aidd/reports/loops/T-1/T-1.loop.pack.md",
            "aidd/reports/context/T-1-memory-slice.latest.pack.json",
            "aidd/docs/plan/T-1.md",
            "aidd/reports/loops/T-1/scope/raw-notes.txt",
        ];
        let counts = classify_read_paths(paths);
        assert_eq!(counts.pack_reads, 1);
        assert_eq!(counts.slice_reads, 1);
        assert_eq!(counts.memory_slice_reads, 1);
        assert_eq!(counts.full_reads, 2);
    }

    #[test]
    fn accumulates_and_derives_rates() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        update_from_output_contract(
            root,
            "CQ-1",
            &["aidd/reports/research/CQ-1-ast.pack.json".to_string()],
            "ok",
            "",
            &[],
            &[],
        )
        .unwrap();
        let payload = update_from_output_contract(
            root,
            "CQ-1",
            &[],
            "warn",
            "output_contract_warn",
            &["ast_index_fallback_rg".to_string()],
            &["ast_index_fallback_warn".to_string()],
        )
        .unwrap();
        let metrics = &payload["metrics"];
        assert_eq!(metrics["output_contract_total"], 2);
        assert_eq!(metrics["output_contract_warns"], 1);
        assert_eq!(metrics["output_contract_warn_rate"], 0.5);
        assert_eq!(metrics["retrieval_events"], 2);
        assert_eq!(metrics["fallback_events"], 1);
        assert_eq!(metrics["fallback_rate"], 0.5);
    }

    #[test]
    fn context_expand_counts_come_from_audit_logs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let audit = root.join("reports/actions/CQ-2/scope-a/context-expand.audit.jsonl");
        io::append_jsonl(&audit, &serde_json::json!({"reason_code": "missing-fields"})).unwrap();
        io::append_jsonl(&audit, &serde_json::json!({"reason_code": "missing_fields"})).unwrap();
        let counts = collect_context_expand_counts(root, "CQ-2");
        assert_eq!(counts.get("missing_fields"), Some(&2));
    }
}
