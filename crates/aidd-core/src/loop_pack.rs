//! Loop pack builder: selects the active work item from the tasklist and
//! renders `reports/loops/<ticket>/<scope>.loop.pack.md` with a YAML front
//! matter the loop runner and preflight both read back.

use crate::active::{self, ActiveUpdate};
use crate::error::Result;
use crate::io;
use crate::paths;
use crate::scope;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const EVIDENCE_POLICY: &str = "RLM-first";

// ---------------------------------------------------------------------------
// Tasklist work items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    pub done: bool,
    pub blocking: bool,
    pub dod: String,
    pub boundaries: Vec<String>,
    pub skills: Vec<String>,
    pub tests: Vec<String>,
    pub excerpt: Vec<String>,
}

impl WorkItem {
    pub fn key(&self) -> String {
        format!("iteration_id={}", self.id)
    }
}

static ITEM_RE: OnceLock<Regex> = OnceLock::new();
static FIELD_RE: OnceLock<Regex> = OnceLock::new();
static NEXT3_REF_RE: OnceLock<Regex> = OnceLock::new();
static PROGRESS_REF_RE: OnceLock<Regex> = OnceLock::new();

fn item_re() -> &'static Regex {
    ITEM_RE.get_or_init(|| {
        Regex::new(
            r"^-\s*\[(?P<state>[ xX])\]\s+(?P<id>[A-Za-z0-9._-]+):\s+(?P<title>.+?)\s*\(iteration_id:\s*(?P<ref>[A-Za-z0-9._-]+)\)\s*$",
        )
        .unwrap()
    })
}

fn field_re() -> &'static Regex {
    FIELD_RE.get_or_init(|| {
        Regex::new(r"^\s+-\s+(?P<key>DoD|Boundaries|Skills|Tests|Blocking)\s*:\s*(?P<value>.+)$")
            .unwrap()
    })
}

fn next3_ref_re() -> &'static Regex {
    NEXT3_REF_RE.get_or_init(|| {
        Regex::new(r"^-\s*\[(?P<state>[ xX])\]\s+.*\(ref:\s*(?P<key>[A-Za-z0-9._=-]+)\)\s*$")
            .unwrap()
    })
}

fn progress_ref_re() -> &'static Regex {
    PROGRESS_REF_RE.get_or_init(|| {
        Regex::new(r"^-\s+\d{4}-\d{2}-\d{2}\s+source=\S+\s+id=(?P<id>\S+)\s+kind=iteration\b")
            .unwrap()
    })
}

fn section_body<'a>(text: &'a str, title: &str) -> &'a str {
    let heading = format!("## {title}");
    let mut collecting = false;
    let mut start = 0usize;
    let mut end = text.len();
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if collecting && trimmed.starts_with("## ") {
            end = offset;
            break;
        }
        if !collecting && trimmed == heading {
            collecting = true;
            start = offset + line.len();
        }
        offset += line.len();
    }
    if collecting {
        &text[start..end]
    } else {
        ""
    }
}

/// Parse every `## AIDD:ITERATIONS_FULL` item with its indented sub-fields
/// (`DoD`, `Boundaries`, `Skills`, `Tests`, `Blocking`).
pub fn parse_work_items(tasklist_text: &str) -> Vec<WorkItem> {
    let body = section_body(tasklist_text, "AIDD:ITERATIONS_FULL");
    let mut items: Vec<WorkItem> = Vec::new();
    for line in body.lines() {
        if let Some(caps) = item_re().captures(line) {
            items.push(WorkItem {
                id: caps["ref"].to_string(),
                title: caps["title"].trim().to_string(),
                done: !caps["state"].trim().is_empty(),
                excerpt: vec![line.to_string()],
                ..Default::default()
            });
            continue;
        }
        let Some(item) = items.last_mut() else { continue };
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(' ') && !line.starts_with('\t') {
            continue;
        }
        item.excerpt.push(line.to_string());
        if let Some(caps) = field_re().captures(line) {
            let value = caps["value"].trim();
            match &caps["key"] {
                "DoD" => item.dod = value.to_string(),
                "Boundaries" => item.boundaries = split_paths(value),
                "Skills" => item.skills = split_list(value),
                "Tests" => item.tests = split_list(value),
                "Blocking" => item.blocking = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }
    }
    items
}

fn split_paths(value: &str) -> Vec<String> {
    scope::dedupe_preserve_order(
        value
            .split([',', ' '])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    )
}

fn split_list(value: &str) -> Vec<String> {
    scope::dedupe_preserve_order(
        value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string),
    )
}

// ---------------------------------------------------------------------------
// Work item selection
// ---------------------------------------------------------------------------

fn find_item<'a>(items: &'a [WorkItem], key: &str) -> Option<&'a WorkItem> {
    let id = key.strip_prefix("iteration_id=").unwrap_or(key);
    items.iter().find(|i| i.id == id)
}

/// Selection order: explicit override, then the active-state key (implement
/// stage only), then the first open NEXT_3 reference, then the most recent
/// iteration row in the progress log.
fn select_work_item<'a>(
    items: &'a [WorkItem],
    tasklist_text: &str,
    override_key: Option<&str>,
    active_key: &str,
    active_stage: &str,
) -> Option<(&'a WorkItem, &'static str)> {
    if let Some(key) = override_key {
        if let Some(item) = find_item(items, key) {
            return Some((item, "override"));
        }
        return None;
    }
    if active_stage == "implement" && scope::is_iteration_work_item_key(active_key) {
        if let Some(item) = find_item(items, active_key) {
            return Some((item, "active"));
        }
    }
    for line in section_body(tasklist_text, "AIDD:NEXT_3").lines() {
        if let Some(caps) = next3_ref_re().captures(line.trim_end()) {
            if !caps["state"].trim().is_empty() {
                continue;
            }
            if let Some(item) = find_item(items, &caps["key"]) {
                return Some((item, "next3"));
            }
        }
    }
    let last_ref = section_body(tasklist_text, "AIDD:PROGRESS_LOG")
        .lines()
        .rev()
        .find_map(|line| progress_ref_re().captures(line.trim_end()).map(|c| c["id"].to_string()));
    if let Some(id) = last_ref {
        if let Some(item) = find_item(items, &format!("iteration_id={id}")) {
            return Some((item, "progress"));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Pack rendering
// ---------------------------------------------------------------------------

fn yaml_list(out: &mut String, key: &str, indent: &str, items: &[String]) {
    if items.is_empty() {
        out.push_str(&format!("{indent}{key}: []\n"));
        return;
    }
    out.push_str(&format!("{indent}{key}:\n"));
    for item in items {
        out.push_str(&format!("{indent}  - {item}\n"));
    }
}

fn build_front_matter(ticket: &str, item: &WorkItem, updated_at: &str) -> String {
    let mut out = String::from("---\n");
    out.push_str(&format!("schema: {}\n", crate::schema::LOOP_PACK_V1));
    out.push_str(&format!("updated_at: {updated_at}\n"));
    out.push_str(&format!("ticket: {ticket}\n"));
    out.push_str(&format!("work_item_id: {}\n", item.id));
    out.push_str(&format!("work_item_key: {}\n", item.key()));
    out.push_str("boundaries:\n");
    yaml_list(&mut out, "allowed_paths", "  ", &item.boundaries);
    yaml_list(&mut out, "forbidden_paths", "  ", &[]);
    yaml_list(&mut out, "skills_required", "", &item.skills);
    yaml_list(&mut out, "tests_required", "", &item.tests);
    out.push_str("arch_profile: default\n");
    out.push_str(&format!("evidence_policy: {EVIDENCE_POLICY}\n"));
    out.push_str("---\n");
    out
}

fn md_list(out: &mut String, items: &[String]) {
    if items.is_empty() {
        out.push_str("- (none)\n");
        return;
    }
    for item in items {
        out.push_str(&format!("- {item}\n"));
    }
}

fn build_pack(ticket: &str, scope_key: &str, item: &WorkItem, updated_at: &str) -> String {
    let mut out = build_front_matter(ticket, item, updated_at);
    out.push_str(&format!("\n# Loop Pack — {ticket} / {scope_key}\n\n"));
    out.push_str("## Work item\n");
    out.push_str(&format!("- id: {}\n", item.id));
    out.push_str(&format!("- key: {}\n", item.key()));
    out.push_str(&format!("- title: {}\n", item.title));
    if !item.dod.is_empty() {
        out.push_str(&format!("- DoD: {}\n", item.dod));
    }
    out.push_str(&format!("- blocking: {}\n", item.blocking));
    out.push_str("\n## Boundaries\n");
    md_list(&mut out, &item.boundaries);
    out.push_str("\n## Skills required\n");
    md_list(&mut out, &item.skills);
    out.push_str("\n## Tests required\n");
    md_list(&mut out, &item.tests);
    out.push_str("\n## Work item excerpt\n");
    for line in &item.excerpt {
        out.push_str(line);
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct LoopPackOutcome {
    pub schema: String,
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scope_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub work_item_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub work_item_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub selection: String,
    pub boundaries: Vec<String>,
}

impl LoopPackOutcome {
    fn blocked(reason: &str) -> Self {
        Self {
            schema: crate::schema::LOOP_PACK_V1.to_string(),
            status: "blocked".to_string(),
            reason: reason.to_string(),
            path: String::new(),
            scope_key: String::new(),
            work_item_id: String::new(),
            work_item_key: String::new(),
            selection: String::new(),
            boundaries: Vec::new(),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.status == "blocked"
    }
}

/// Build (or rebuild) the loop pack for the current work item and record the
/// selection in the active state. A missing tasklist or unresolvable item
/// yields a `work_item_not_found` blocked outcome, never an error.
pub fn build_loop_pack(
    root: &Path,
    ticket: &str,
    override_key: Option<&str>,
) -> Result<LoopPackOutcome> {
    let tasklist = paths::tasklist_path(root, ticket);
    if !tasklist.exists() {
        return Ok(LoopPackOutcome::blocked("work_item_not_found"));
    }
    let text = std::fs::read_to_string(&tasklist)?;
    let items = parse_work_items(&text);
    let state = active::load_active(root);
    let Some((item, selection)) =
        select_work_item(&items, &text, override_key, &state.work_item_key, &state.stage)
    else {
        return Ok(LoopPackOutcome::blocked("work_item_not_found"));
    };

    let work_item_key = item.key();
    let scope_key = scope::resolve_scope_key(&work_item_key, ticket);
    let pack_path = paths::loop_pack_path(root, ticket, &scope_key);
    let pack = build_pack(ticket, &scope_key, item, &io::utc_timestamp());
    io::write_text(&pack_path, &pack)?;

    if state.work_item_key != work_item_key {
        active::update_active(
            root,
            &ActiveUpdate { work_item_key: Some(work_item_key.clone()), ..Default::default() },
        )?;
    }

    Ok(LoopPackOutcome {
        schema: crate::schema::LOOP_PACK_V1.to_string(),
        status: "ok".to_string(),
        reason: String::new(),
        path: paths::rel_path(&pack_path, root),
        scope_key,
        work_item_id: item.id.clone(),
        work_item_key,
        selection: selection.to_string(),
        boundaries: item.boundaries.clone(),
    })
}

// ---------------------------------------------------------------------------
// Front matter read-back
// ---------------------------------------------------------------------------

fn front_matter(text: &str) -> Option<Value> {
    let rest = text.strip_prefix("---\n")?;
    let end = rest.find("\n---")?;
    serde_yaml::from_str::<Value>(&rest[..end]).ok()
}

/// Allowed paths recorded in a pack's `boundaries.allowed_paths`.
pub fn read_loop_allowed_paths(pack_path: &Path) -> Vec<String> {
    let Ok(text) = std::fs::read_to_string(pack_path) else {
        return Vec::new();
    };
    let Some(meta) = front_matter(&text) else {
        return Vec::new();
    };
    meta.get("boundaries")
        .and_then(|b| b.get("allowed_paths"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// The pack-level status from front matter; a blocked pack carries
/// `status: blocked` instead of work-item metadata.
pub fn pack_work_item_key(pack_path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(pack_path).ok()?;
    let meta = front_matter(&text)?;
    meta.get("work_item_key").and_then(Value::as_str).map(str::to_string)
}

pub fn pack_path_for(root: &Path, ticket: &str, scope_key: &str) -> PathBuf {
    paths::loop_pack_path(root, ticket, scope_key)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
