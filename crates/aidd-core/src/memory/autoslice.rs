//! Autoslice: drive per-stage memory queries from policy so a stage always
//! has a fresh slices manifest before it runs. When nothing matches, a
//! placeholder manifest is written and the slice gate decides whether that
//! warns or blocks.

use super::{slice, SliceLimits};
use crate::error::Result;
use crate::gates::GatesConfig;
use serde_json::json;
use std::path::{Path, PathBuf};

/// Queries used when the gates config carries no `stage_queries` entry for
/// the stage.
pub const DEFAULT_QUERIES: [&str; 3] = ["decision", "constraint", "default"];

#[derive(Debug, Clone)]
pub struct AutosliceOutcome {
    pub status: String,
    pub reason_code: String,
    pub manifest_path: PathBuf,
    pub total_hits: usize,
    /// `(query, hits)` per executed query.
    pub queries: Vec<(String, usize)>,
}

impl AutosliceOutcome {
    pub fn is_blocked(&self) -> bool {
        self.status == "blocked"
    }

    pub fn to_json(&self, ticket: &str, stage: &str, scope_key: &str) -> serde_json::Value {
        json!({
            "status": self.status,
            "reason_code": self.reason_code,
            "ticket": ticket,
            "stage": stage,
            "scope_key": scope_key,
            "manifest": self.manifest_path.display().to_string(),
            "total_hits": self.total_hits,
            "queries": self.queries.iter().map(|(q, h)| json!({"query": q, "hits": h})).collect::<Vec<_>>(),
        })
    }
}

pub fn run_autoslice(
    root: &Path,
    ticket: &str,
    stage: &str,
    scope_key: &str,
    gates: &GatesConfig,
    limits: &SliceLimits,
) -> Result<AutosliceOutcome> {
    let configured = gates.stage_queries(stage);
    let queries: Vec<String> = if configured.is_empty() {
        DEFAULT_QUERIES.iter().map(|q| q.to_string()).collect()
    } else {
        configured
    };

    let mut executed = Vec::new();
    let mut total_hits = 0usize;
    let mut manifest_path = super::slices_manifest_path(root, ticket, stage, scope_key);
    for query in &queries {
        let outcome = slice::build_slice(root, ticket, query, Some(stage), Some(scope_key), limits)?;
        total_hits += outcome.hits;
        executed.push((query.clone(), outcome.hits));
        if let Some(path) = outcome.manifest_path {
            manifest_path = path;
        }
    }

    if total_hits > 0 {
        return Ok(AutosliceOutcome {
            status: "ok".to_string(),
            reason_code: String::new(),
            manifest_path,
            total_hits,
            queries: executed,
        });
    }

    let manifest_path = slice::write_placeholder_manifest(root, ticket, stage, scope_key)?;
    let gate = gates.memory_slice_gate();
    let enforced = gate.stages.iter().any(|s| s == stage);
    let (status, reason_code) = match gate.mode.as_str() {
        "hard" if enforced => ("blocked", "memory_slice_missing"),
        "off" => ("ok", ""),
        _ => ("warn", "memory_slice_missing_warn"),
    };
    Ok(AutosliceOutcome {
        status: status.to_string(),
        reason_code: reason_code.to_string(),
        manifest_path,
        total_hits: 0,
        queries: executed,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io;
    use serde_json::Value;
    use tempfile::TempDir;

    fn seed_decisions(root: &Path, ticket: &str) {
        let decisions = json!({
            "schema": "aidd.memory.decisions.pack.v1",
            "ticket": ticket,
            "active_decisions": {
                "cols": ["decision_id", "topic", "decision", "status", "ts", "scope_key", "stage", "source_path"],
                "rows": [["d1", "fallback", "use slices first", "active", "2026-02-25T00:00:00Z", ticket, "plan", "aidd/docs/plan"]],
            },
            "superseded_heads": { "cols": ["decision_id", "supersedes", "topic", "status", "ts"], "rows": [] },
        });
        io::write_json(&super::super::decisions_pack_path(root, ticket), &decisions).unwrap();
    }

    #[test]
    fn writes_stage_manifest_when_queries_hit() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        seed_decisions(root, "MEM-AUTO-1");
        let outcome = run_autoslice(
            root,
            "MEM-AUTO-1",
            "plan",
            "MEM-AUTO-1",
            &GatesConfig::default(),
            &SliceLimits::default(),
        )
        .unwrap();
        assert_eq!(outcome.status, "ok");
        assert!(outcome.total_hits >= 1);
        let manifest: Value = io::read_json(&outcome.manifest_path).unwrap();
        assert_eq!(manifest["schema"], "aidd.memory.slices.manifest.v1");
        assert!(!manifest["slices"]["rows"].as_array().unwrap().is_empty());
        assert_eq!(manifest["stats"]["placeholder"], false);
    }

    #[test]
    fn hard_mode_blocks_when_nothing_matches() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let gates = GatesConfig::from_value(json!({
            "memory": { "slice_enforcement": "hard", "enforce_stages": ["plan"] }
        }));
        let outcome = run_autoslice(
            root,
            "MEM-AUTO-2",
            "plan",
            "MEM-AUTO-2",
            &gates,
            &SliceLimits::default(),
        )
        .unwrap();
        assert!(outcome.is_blocked());
        assert_eq!(outcome.reason_code, "memory_slice_missing");
        let manifest: Value = io::read_json(&outcome.manifest_path).unwrap();
        assert_eq!(manifest["stats"]["placeholder"], true);
    }

    #[test]
    fn warn_mode_degrades_instead_of_blocking() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let outcome = run_autoslice(
            root,
            "MEM-AUTO-3",
            "plan",
            "MEM-AUTO-3",
            &GatesConfig::default(),
            &SliceLimits::default(),
        )
        .unwrap();
        assert_eq!(outcome.status, "warn");
        assert_eq!(outcome.reason_code, "memory_slice_missing_warn");

        let gates = GatesConfig::from_value(json!({
            "memory": { "slice_enforcement": "off" }
        }));
        let outcome = run_autoslice(
            root,
            "MEM-AUTO-3",
            "plan",
            "MEM-AUTO-3",
            &gates,
            &SliceLimits::default(),
        )
        .unwrap();
        assert_eq!(outcome.status, "ok");
    }

    #[test]
    fn stage_alias_normalization_applies_to_enforce_stages() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let gates = GatesConfig::from_value(json!({
            "memory": { "slice_enforcement": "hard", "enforce_stages": ["review_spec"] }
        }));
        let outcome = run_autoslice(
            root,
            "MEM-AUTO-4",
            "review-spec",
            "MEM-AUTO-4",
            &gates,
            &SliceLimits::default(),
        )
        .unwrap();
        assert!(outcome.is_blocked());
    }
}
