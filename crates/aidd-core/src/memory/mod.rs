//! Ticket-scoped memory: a semantic pack distilled from the planning docs,
//! an append-only decisions log with a deterministic pack snapshot, and
//! query slices indexed by a per-(stage, scope) manifest.

pub mod autoslice;
pub mod decisions;
pub mod semantic;
pub mod slice;
pub mod verify;

use crate::scope;
use std::path::{Path, PathBuf};

pub const PACK_VERSION: &str = "v1";

// ---------------------------------------------------------------------------
// Budgets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SemanticLimits {
    pub max_chars: usize,
    pub max_lines: usize,
    pub max_items: usize,
    /// Sections are trimmed in this order until the pack fits.
    pub trim_priority: Vec<String>,
}

impl Default for SemanticLimits {
    fn default() -> Self {
        Self {
            max_chars: 8000,
            max_lines: 320,
            max_items: 120,
            trim_priority: ["open_questions", "terms", "defaults", "constraints", "invariants"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl SemanticLimits {
    pub fn per_section(&self) -> usize {
        (self.max_items / 4).clamp(8, 30)
    }
}

#[derive(Debug, Clone)]
pub struct DecisionsLimits {
    pub max_chars: usize,
    pub max_lines: usize,
    pub max_active: usize,
    pub max_history: usize,
}

impl Default for DecisionsLimits {
    fn default() -> Self {
        Self { max_chars: 8000, max_lines: 220, max_active: 50, max_history: 150 }
    }
}

#[derive(Debug, Clone)]
pub struct SliceLimits {
    pub max_hits: usize,
    pub max_chars: usize,
}

impl Default for SliceLimits {
    fn default() -> Self {
        Self { max_hits: 20, max_chars: 3000 }
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

pub fn memory_dir(root: &Path) -> PathBuf {
    root.join("reports/memory")
}

pub fn semantic_pack_path(root: &Path, ticket: &str) -> PathBuf {
    memory_dir(root).join(format!("{ticket}.semantic.pack.json"))
}

pub fn decisions_log_path(root: &Path, ticket: &str) -> PathBuf {
    memory_dir(root).join(format!("{ticket}.decisions.jsonl"))
}

pub fn decisions_pack_path(root: &Path, ticket: &str) -> PathBuf {
    memory_dir(root).join(format!("{ticket}.decisions.pack.json"))
}

pub fn slice_path(root: &Path, ticket: &str, query: &str) -> PathBuf {
    let digest = scope::stable_id(&[ticket, query], 10);
    root.join("reports/context")
        .join(format!("{ticket}-memory-slice-{digest}.pack.json"))
}

pub fn slice_latest_path(root: &Path, ticket: &str) -> PathBuf {
    root.join("reports/context")
        .join(format!("{ticket}-memory-slice.latest.pack.json"))
}

pub fn slice_stage_latest_path(root: &Path, ticket: &str, stage: &str, scope_key: &str) -> PathBuf {
    root.join("reports/context")
        .join(format!("{ticket}-memory-slice.{stage}.{scope_key}.latest.pack.json"))
}

pub fn slices_manifest_path(root: &Path, ticket: &str, stage: &str, scope_key: &str) -> PathBuf {
    root.join("reports/context")
        .join(format!("{ticket}-memory-slices.{stage}.{scope_key}.pack.json"))
}
