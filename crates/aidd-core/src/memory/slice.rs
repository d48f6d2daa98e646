//! Memory slices: run a query over the semantic and decisions packs and
//! persist the hits as a small pack, plus latest aliases and a per-(stage,
//! scope) manifest used by the output-contract freshness gate.

use super::SliceLimits;
use crate::error::Result;
use crate::io;
use crate::paths;
use regex::Regex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

const MATCH_COLS: [&str; 4] = ["kind", "ref", "snippet", "source_path"];
const MANIFEST_COLS: [&str; 4] = ["query", "slice_pack", "latest_alias", "hits"];
pub const DEFAULT_MANIFEST_MAX_SLICES: usize = 10;

#[derive(Debug, Clone)]
pub struct SliceOutcome {
    pub hits: usize,
    pub slice_path: PathBuf,
    pub latest_path: PathBuf,
    pub manifest_path: Option<PathBuf>,
}

fn compile_query(query: &str) -> Regex {
    Regex::new(&format!("(?i){query}"))
        .unwrap_or_else(|_| Regex::new(&format!("(?i){}", regex::escape(query))).unwrap())
}

fn row_text(row: &Value) -> String {
    match row {
        Value::Array(cells) => cells
            .iter()
            .map(|c| match c {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" "),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    text.chars().take(max).collect()
}

struct Matcher<'a> {
    re: &'a Regex,
    limits: &'a SliceLimits,
    rows: Vec<Value>,
    budget_left: usize,
}

impl Matcher<'_> {
    fn scan_block(&mut self, pack: &Value, section: &str, kind: &str, source_path: &str) {
        let Some(rows) = pack.get(section).and_then(|b| b.get("rows")).and_then(Value::as_array)
        else {
            return;
        };
        for (index, row) in rows.iter().enumerate() {
            self.push_match(section, index, &row_text(row), kind, source_path);
            if self.rows.len() >= self.limits.max_hits || self.budget_left == 0 {
                return;
            }
        }
    }

    fn scan_list(&mut self, pack: &Value, section: &str, kind: &str, source_path: &str) {
        let Some(items) = pack.get(section).and_then(Value::as_array) else { return };
        for (index, item) in items.iter().enumerate() {
            self.push_match(section, index, &row_text(item), kind, source_path);
            if self.rows.len() >= self.limits.max_hits || self.budget_left == 0 {
                return;
            }
        }
    }

    // The query is matched against "<section> <row text>" so section-level
    // queries (e.g. "decision") select whole blocks.
    fn push_match(&mut self, section: &str, index: usize, text: &str, kind: &str, source_path: &str) {
        if self.rows.len() >= self.limits.max_hits || self.budget_left == 0 {
            return;
        }
        if !self.re.is_match(&format!("{section} {text}")) {
            return;
        }
        let snippet = truncate_chars(text, self.budget_left.min(240));
        self.budget_left = self.budget_left.saturating_sub(snippet.chars().count());
        self.rows.push(json!([kind, format!("{section}[{index}]"), snippet, source_path]));
    }
}

/// Run one query against the ticket's memory packs and write the slice
/// pack plus its latest alias. With stage+scope, also refresh the
/// stage-latest alias and the slices manifest.
pub fn build_slice(
    root: &Path,
    ticket: &str,
    query: &str,
    stage: Option<&str>,
    scope_key: Option<&str>,
    limits: &SliceLimits,
) -> Result<SliceOutcome> {
    let re = compile_query(query);
    let mut matcher = Matcher { re: &re, limits, rows: Vec::new(), budget_left: limits.max_chars };

    let semantic_path = super::semantic_pack_path(root, ticket);
    if let Ok(pack) = io::read_json::<Value>(&semantic_path) {
        let source = paths::rel_path(&semantic_path, root);
        for section in ["terms", "defaults", "constraints", "invariants"] {
            matcher.scan_block(&pack, section, "semantic", &source);
        }
        matcher.scan_list(&pack, "open_questions", "semantic", &source);
    }
    let decisions_path = super::decisions_pack_path(root, ticket);
    if let Ok(pack) = io::read_json::<Value>(&decisions_path) {
        let source = paths::rel_path(&decisions_path, root);
        matcher.scan_block(&pack, "active_decisions", "decision", &source);
        matcher.scan_block(&pack, "superseded_heads", "decision", &source);
    }

    let hits = matcher.rows.len();
    let slice_path = super::slice_path(root, ticket, query);
    let latest_path = super::slice_latest_path(root, ticket);
    let payload = json!({
        "schema": crate::schema::REPORT_PACK_V1,
        "schema_version": crate::schema::REPORT_PACK_V1,
        "pack_version": super::PACK_VERSION,
        "type": "memory-slice",
        "kind": "pack",
        "ticket": ticket,
        "query": query,
        "generated_at": io::utc_timestamp(),
        "matches": { "cols": MATCH_COLS, "rows": matcher.rows },
        "stats": {
            "hits": hits,
            "budget": { "max_hits": limits.max_hits, "max_chars": limits.max_chars },
        },
    });
    io::write_json(&slice_path, &payload)?;
    io::write_json(&latest_path, &payload)?;

    let manifest_path = match (stage, scope_key) {
        (Some(stage), Some(scope_key)) if !stage.is_empty() && !scope_key.is_empty() => {
            let stage_latest = super::slice_stage_latest_path(root, ticket, stage, scope_key);
            io::write_json(&stage_latest, &payload)?;
            let manifest = super::slices_manifest_path(root, ticket, stage, scope_key);
            update_manifest(
                &manifest,
                ticket,
                stage,
                scope_key,
                query,
                &paths::rel_path(&slice_path, root),
                &paths::rel_path(&stage_latest, root),
                hits,
            )?;
            Some(manifest)
        }
        _ => None,
    };

    Ok(SliceOutcome { hits, slice_path, latest_path, manifest_path })
}

#[allow(clippy::too_many_arguments)]
fn update_manifest(
    manifest_path: &Path,
    ticket: &str,
    stage: &str,
    scope_key: &str,
    query: &str,
    slice_rel: &str,
    latest_rel: &str,
    hits: usize,
) -> Result<()> {
    let mut rows: Vec<Value> = io::read_json::<Value>(manifest_path)
        .ok()
        .and_then(|m| m.get("slices").and_then(|s| s.get("rows")).and_then(Value::as_array).cloned())
        .unwrap_or_default();
    rows.retain(|row| row.get(0).and_then(Value::as_str) != Some(query));
    rows.push(json!([query, slice_rel, latest_rel, hits]));
    rows.sort_by_key(|row| row.get(0).and_then(Value::as_str).unwrap_or("").to_string());
    if rows.len() > DEFAULT_MANIFEST_MAX_SLICES {
        let excess = rows.len() - DEFAULT_MANIFEST_MAX_SLICES;
        rows.drain(..excess);
    }

    let payload = json!({
        "schema": crate::schema::MEMORY_SLICES_MANIFEST_V1,
        "schema_version": crate::schema::MEMORY_SLICES_MANIFEST_V1,
        "pack_version": super::PACK_VERSION,
        "type": "memory-slices",
        "kind": "manifest",
        "ticket": ticket,
        "stage": stage,
        "scope_key": scope_key,
        "updated_at": io::utc_timestamp(),
        "slices": { "cols": MANIFEST_COLS, "rows": rows },
        "stats": { "placeholder": false },
    });
    io::write_json(manifest_path, &payload)
}

/// Manifest recording that autoslice ran but nothing matched; the gate
/// distinguishes this from a manifest that was never written.
pub fn write_placeholder_manifest(
    root: &Path,
    ticket: &str,
    stage: &str,
    scope_key: &str,
) -> Result<PathBuf> {
    let manifest_path = super::slices_manifest_path(root, ticket, stage, scope_key);
    let payload = json!({
        "schema": crate::schema::MEMORY_SLICES_MANIFEST_V1,
        "schema_version": crate::schema::MEMORY_SLICES_MANIFEST_V1,
        "pack_version": super::PACK_VERSION,
        "type": "memory-slices",
        "kind": "manifest",
        "ticket": ticket,
        "stage": stage,
        "scope_key": scope_key,
        "updated_at": io::utc_timestamp(),
        "slices": { "cols": MANIFEST_COLS, "rows": [] },
        "stats": { "placeholder": true },
    });
    io::write_json(&manifest_path, &payload)?;
    Ok(manifest_path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
