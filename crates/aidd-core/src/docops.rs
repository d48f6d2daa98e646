//! DocOps: the only writer of tasklist and context-pack documents.
//!
//! Tasklists are anchored Markdown: `## AIDD:ITERATIONS_FULL` holds the
//! iteration checkboxes, `## AIDD:NEXT_3` the recomputed queue,
//! `## AIDD:PROGRESS_LOG` the append-only progress rows, and the QA handoff
//! inbox sits between `<!-- handoff:qa start/end -->` markers. Every op is
//! deterministic and idempotent and reports `{changed, error, message}`.

use crate::error::Result;
use crate::io;
use crate::paths;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OpOutcome {
    pub changed: bool,
    pub error: bool,
    pub message: String,
}

impl OpOutcome {
    fn changed(message: impl Into<String>) -> Self {
        Self { changed: true, error: false, message: message.into() }
    }

    fn skipped(message: impl Into<String>) -> Self {
        Self { changed: false, error: false, message: message.into() }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self { changed: false, error: true, message: message.into() }
    }
}

// ---------------------------------------------------------------------------
// Markers & patterns
// ---------------------------------------------------------------------------

pub const HANDOFF_QA_START: &str = "<!-- handoff:qa start -->";
pub const HANDOFF_QA_END: &str = "<!-- handoff:qa end -->";
pub const CONTEXT_PACK_FENCE_OPEN: &str = "```aidd:context_pack";
pub const CONTEXT_PACK_FENCE_CLOSE: &str = "```";

static CHECKBOX_RE: OnceLock<Regex> = OnceLock::new();
static ITERATION_REF_RE: OnceLock<Regex> = OnceLock::new();
static BLOCKING_RE: OnceLock<Regex> = OnceLock::new();
static PROGRESS_ROW_RE: OnceLock<Regex> = OnceLock::new();

fn checkbox_re() -> &'static Regex {
    CHECKBOX_RE.get_or_init(|| Regex::new(r"^(\s*-\s*)\[(?P<state>[ xX])\](?P<body>\s+.+)$").unwrap())
}

fn iteration_ref_re() -> &'static Regex {
    ITERATION_REF_RE
        .get_or_init(|| Regex::new(r"\(iteration_id:\s*(?P<id>[A-Za-z0-9._-]+)\)").unwrap())
}

fn blocking_re() -> &'static Regex {
    BLOCKING_RE.get_or_init(|| Regex::new(r"(?i)\bBlocking:\s*(true|false)\b").unwrap())
}

fn progress_row_re() -> &'static Regex {
    PROGRESS_ROW_RE.get_or_init(|| {
        Regex::new(
            r"^-\s+(?P<date>\d{4}-\d{2}-\d{2})\s+source=(?P<source>\S+)\s+id=(?P<id>\S+)\s+kind=(?P<kind>\S+)\s+hash=(?P<hash>\S+)",
        )
        .unwrap()
    })
}

// ---------------------------------------------------------------------------
// Section helpers
// ---------------------------------------------------------------------------

/// Byte range of the body of `## <title>` (exclusive of the heading line,
/// up to the next `## ` heading or end of text).
fn section_range(text: &str, title: &str) -> Option<(usize, usize)> {
    let mut offset = 0usize;
    let mut start: Option<usize> = None;
    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let trimmed = line.trim_end();
        if let Some(body_start) = start {
            if trimmed.starts_with("## ") {
                return Some((body_start, line_start));
            }
            continue;
        }
        if trimmed == format!("## {title}") {
            start = Some(offset);
        }
    }
    start.map(|s| (s, text.len()))
}

// ---------------------------------------------------------------------------
// set_iteration_done
// ---------------------------------------------------------------------------

/// Check the iteration (or handoff) box identified by `item_id`. No-op when
/// the box is already checked; error when no matching checkbox exists.
pub fn set_iteration_done(root: &Path, ticket: &str, item_id: &str, kind: &str) -> Result<OpOutcome> {
    let path = paths::tasklist_path(root, ticket);
    if !path.exists() {
        return Ok(OpOutcome::failed(format!("tasklist missing: {}", paths::rel_path(&path, root))));
    }
    let text = std::fs::read_to_string(&path)?;
    let mut found = false;
    let mut changed = false;
    let mut out = Vec::new();
    for line in text.lines() {
        if !found {
            if let Some(caps) = checkbox_re().captures(line) {
                if checkbox_matches_item(line, item_id, kind) {
                    found = true;
                    let state = caps.name("state").map(|m| m.as_str()).unwrap_or(" ");
                    if state.trim().is_empty() {
                        changed = true;
                        out.push(format!("{}[x]{}", &caps[1], &caps["body"]));
                        continue;
                    }
                }
            }
        }
        out.push(line.to_string());
    }
    if !found {
        return Ok(OpOutcome::failed(format!("no {kind} checkbox for item '{item_id}'")));
    }
    if !changed {
        return Ok(OpOutcome::skipped(format!("{kind} '{item_id}' already done")));
    }
    io::write_text(&path, &join_lines(&out))?;
    Ok(OpOutcome::changed(format!("{kind} '{item_id}' marked done")))
}

fn checkbox_matches_item(line: &str, item_id: &str, kind: &str) -> bool {
    match kind {
        "handoff" => line.contains(&format!("id: {item_id}")),
        _ => iteration_ref_re()
            .captures(line)
            .map(|c| &c["id"] == item_id)
            .unwrap_or(false),
    }
}

// ---------------------------------------------------------------------------
// append_progress_log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ProgressEntry {
    pub date: String,
    pub source: String,
    pub item_id: String,
    pub kind: String,
    pub hash: String,
    pub link: String,
    pub msg: String,
}

impl ProgressEntry {
    fn render(&self) -> String {
        let mut row = format!(
            "- {} source={} id={} kind={} hash={}",
            self.date, self.source, self.item_id, self.kind, self.hash
        );
        if !self.link.is_empty() {
            row.push_str(&format!(" link={}", self.link));
        }
        if !self.msg.is_empty() {
            row.push_str(&format!(" msg={}", self.msg));
        }
        row
    }
}

/// Append one row to `## AIDD:PROGRESS_LOG`. Duplicates by
/// `(source, item_id, hash)` are skipped; the `- (empty)` placeholder is
/// removed on first real row.
pub fn append_progress_log(root: &Path, ticket: &str, entry: &ProgressEntry) -> Result<OpOutcome> {
    let path = paths::tasklist_path(root, ticket);
    if !path.exists() {
        return Ok(OpOutcome::failed(format!("tasklist missing: {}", paths::rel_path(&path, root))));
    }
    let text = std::fs::read_to_string(&path)?;
    let Some((start, end)) = section_range(&text, "AIDD:PROGRESS_LOG") else {
        return Ok(OpOutcome::failed("missing section: ## AIDD:PROGRESS_LOG".to_string()));
    };
    let body = &text[start..end];
    for line in body.lines() {
        if let Some(caps) = progress_row_re().captures(line.trim_end()) {
            if &caps["source"] == entry.source
                && &caps["id"] == entry.item_id
                && &caps["hash"] == entry.hash
            {
                return Ok(OpOutcome::skipped(format!(
                    "progress row already present ({} {} {})",
                    entry.source, entry.item_id, entry.hash
                )));
            }
        }
    }

    let mut rows: Vec<String> = body
        .lines()
        .filter(|l| !l.trim().is_empty() && l.trim() != "- (empty)")
        .map(str::to_string)
        .collect();
    rows.push(entry.render());
    let mut updated = String::with_capacity(text.len() + 128);
    updated.push_str(&text[..start]);
    updated.push_str(&rows.join("\n"));
    updated.push('\n');
    if end < text.len() {
        updated.push('\n');
        updated.push_str(&text[end..]);
    }
    io::write_text(&path, &updated)?;
    Ok(OpOutcome::changed(format!("progress row appended for {}", entry.item_id)))
}

// ---------------------------------------------------------------------------
// next3_recompute
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct OpenItem {
    iteration_id: String,
    title: String,
    blocking: bool,
}

/// Recompute `## AIDD:NEXT_3` from the open checkboxes of
/// `## AIDD:ITERATIONS_FULL`: blocking items first, then order of
/// appearance, capped at three.
pub fn next3_recompute(root: &Path, ticket: &str) -> Result<OpOutcome> {
    let path = paths::tasklist_path(root, ticket);
    if !path.exists() {
        return Ok(OpOutcome::failed(format!("tasklist missing: {}", paths::rel_path(&path, root))));
    }
    let text = std::fs::read_to_string(&path)?;
    let Some((full_start, full_end)) = section_range(&text, "AIDD:ITERATIONS_FULL") else {
        return Ok(OpOutcome::failed("missing section: ## AIDD:ITERATIONS_FULL".to_string()));
    };
    let Some((next_start, next_end)) = section_range(&text, "AIDD:NEXT_3") else {
        return Ok(OpOutcome::failed("missing section: ## AIDD:NEXT_3".to_string()));
    };

    let items = collect_open_items(&text[full_start..full_end]);
    let mut ordered: Vec<&OpenItem> = items.iter().filter(|i| i.blocking).collect();
    ordered.extend(items.iter().filter(|i| !i.blocking));
    let rows: Vec<String> = ordered
        .iter()
        .take(3)
        .map(|item| {
            format!(
                "- [ ] {}: {} (ref: iteration_id={})",
                item.iteration_id, item.title, item.iteration_id
            )
        })
        .collect();
    let rendered = if rows.is_empty() {
        "- (empty)\n".to_string()
    } else {
        format!("{}\n", rows.join("\n"))
    };

    let current = &text[next_start..next_end];
    let normalized_current = format!("{}\n", current.trim_end_matches('\n').trim_start_matches('\n'));
    if normalized_current == rendered {
        return Ok(OpOutcome::skipped("NEXT_3 already current".to_string()));
    }
    let mut updated = String::with_capacity(text.len());
    updated.push_str(&text[..next_start]);
    updated.push_str(&rendered);
    if next_end < text.len() {
        updated.push('\n');
        updated.push_str(&text[next_end..]);
    }
    io::write_text(&path, &updated)?;
    Ok(OpOutcome::changed(format!("NEXT_3 recomputed ({} items)", rows.len())))
}

fn collect_open_items(body: &str) -> Vec<OpenItem> {
    let mut items = Vec::new();
    let mut current: Option<OpenItem> = None;
    for line in body.lines() {
        if let Some(caps) = checkbox_re().captures(line) {
            if let Some(item) = current.take() {
                items.push(item);
            }
            let state = caps.name("state").map(|m| m.as_str().trim()).unwrap_or("");
            if !state.is_empty() {
                continue;
            }
            let body_text = caps["body"].trim();
            let Some(id_caps) = iteration_ref_re().captures(body_text) else {
                continue;
            };
            let iteration_id = id_caps["id"].to_string();
            let title = body_text
                .split_once(':')
                .map(|(_, rest)| rest)
                .unwrap_or(body_text)
                .split('(')
                .next()
                .unwrap_or("")
                .trim()
                .to_string();
            current = Some(OpenItem { iteration_id, title, blocking: false });
        } else if let Some(item) = current.as_mut() {
            if let Some(caps) = blocking_re().captures(line) {
                item.blocking = caps[1].eq_ignore_ascii_case("true");
            }
        }
    }
    if let Some(item) = current {
        items.push(item);
    }
    items
}

// ---------------------------------------------------------------------------
// context_pack_update
// ---------------------------------------------------------------------------

pub const CONTEXT_PACK_KEYS: [&str; 6] =
    ["read_log", "read_next", "artefact_links", "what_to_do", "user_note", "generated_at"];

/// Upsert keyed fields inside the `aidd:context_pack` fenced block of
/// `docs/loops/<ticket>.context-pack.md`. List values render as `key:`
/// followed by `- item` lines; scalars as `key: value`. The block and file
/// are created on first write.
pub fn context_pack_update(
    root: &Path,
    ticket: &str,
    params: &serde_json::Map<String, serde_json::Value>,
) -> Result<OpOutcome> {
    let unknown: Vec<&str> = params
        .keys()
        .map(String::as_str)
        .filter(|k| !CONTEXT_PACK_KEYS.contains(k))
        .collect();
    if !unknown.is_empty() {
        return Ok(OpOutcome::failed(format!("unknown context_pack fields: {}", unknown.join(", "))));
    }
    if params.is_empty() {
        return Ok(OpOutcome::failed("context_pack_update params cannot be empty".to_string()));
    }

    let path = paths::context_pack_doc_path(root, ticket);
    let text = if path.exists() {
        std::fs::read_to_string(&path)?
    } else {
        format!(
            "# Context Pack — {ticket}\n\n{CONTEXT_PACK_FENCE_OPEN}\n{CONTEXT_PACK_FENCE_CLOSE}\n"
        )
    };

    let Some(open_pos) = text.find(CONTEXT_PACK_FENCE_OPEN) else {
        return Ok(OpOutcome::failed("context pack fenced block not found".to_string()));
    };
    let block_start = open_pos + CONTEXT_PACK_FENCE_OPEN.len();
    let Some(close_offset) = text[block_start..].find(CONTEXT_PACK_FENCE_CLOSE) else {
        return Ok(OpOutcome::failed("context pack fenced block not closed".to_string()));
    };
    let block_end = block_start + close_offset;
    let block = &text[block_start..block_end];

    let mut fields = parse_block_fields(block);
    for (key, value) in params {
        fields.retain(|(k, _)| k != key);
        fields.push((key.clone(), render_field(key, value)));
    }
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    let mut rendered = String::from("\n");
    for (_, lines) in &fields {
        rendered.push_str(lines);
    }

    if rendered == block {
        return Ok(OpOutcome::skipped("context pack already current".to_string()));
    }
    let mut updated = String::with_capacity(text.len() + rendered.len());
    updated.push_str(&text[..block_start]);
    updated.push_str(&rendered);
    updated.push_str(&text[block_end..]);
    io::write_text(&path, &updated)?;
    Ok(OpOutcome::changed(format!("context pack updated ({} fields)", params.len())))
}

fn parse_block_fields(block: &str) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = Vec::new();
    for line in block.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(' ') && !line.starts_with('-') && line.contains(':') {
            let key = line.split(':').next().unwrap_or("").trim().to_string();
            fields.push((key, format!("{line}\n")));
        } else if let Some((_, body)) = fields.last_mut() {
            body.push_str(line);
            body.push('\n');
        }
    }
    fields
}

fn render_field(key: &str, value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Array(items) => {
            let mut out = format!("{key}:\n");
            for item in items {
                if let Some(s) = item.as_str() {
                    out.push_str(&format!("- {s}\n"));
                }
            }
            out
        }
        serde_json::Value::String(s) => format!("{key}: {s}\n"),
        other => format!("{key}: {other}\n"),
    }
}

// ---------------------------------------------------------------------------
// QA handoff inbox
// ---------------------------------------------------------------------------

/// Unchecked, blocking handoff items between the QA markers:
/// `(work_item_key, label)` pairs in document order.
pub fn qa_handoff_candidates(tasklist_text: &str) -> Vec<(String, String)> {
    static SCOPE_RE: OnceLock<Regex> = OnceLock::new();
    static ITEM_ID_RE: OnceLock<Regex> = OnceLock::new();
    let scope_re = SCOPE_RE
        .get_or_init(|| Regex::new(r"(?i)\bscope\s*:\s*([A-Za-z0-9_.:=-]+)").unwrap());
    let item_id_re =
        ITEM_ID_RE.get_or_init(|| Regex::new(r"\bid\s*:\s*([A-Za-z0-9_.:-]+)").unwrap());

    let mut candidates = Vec::new();
    let mut in_handoff = false;
    let mut block: Vec<&str> = Vec::new();

    let flush = |block: &[&str], candidates: &mut Vec<(String, String)>| {
        let Some(first) = block.first() else { return };
        let Some(caps) = checkbox_re().captures(first) else { return };
        if !caps["state"].trim().is_empty() {
            return;
        }
        let blocking = block.iter().any(|line| {
            blocking_re()
                .captures(line)
                .map(|c| c[1].eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        });
        if !blocking {
            return;
        }
        let key = block
            .iter()
            .find_map(|line| scope_re.captures(line).map(|c| c[1].trim_matches(')').to_string()))
            .unwrap_or_default();
        if !crate::scope::is_valid_work_item_key(&key) {
            return;
        }
        let label = block
            .iter()
            .find_map(|line| item_id_re.captures(line).map(|c| c[1].to_string()))
            .unwrap_or_else(|| key.clone());
        candidates.push((key, label));
    };

    for raw in tasklist_text.lines() {
        let stripped = raw.trim();
        if stripped == HANDOFF_QA_START {
            in_handoff = true;
            block.clear();
            continue;
        }
        if stripped == HANDOFF_QA_END {
            flush(&block, &mut candidates);
            block.clear();
            in_handoff = false;
            continue;
        }
        if !in_handoff {
            continue;
        }
        if checkbox_re().is_match(raw) {
            flush(&block, &mut candidates);
            block = vec![raw];
        } else if !block.is_empty() {
            block.push(raw);
        }
    }
    flush(&block, &mut candidates);
    candidates
}

fn join_lines(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const TASKLIST: &str = "\
---
Ticket: DEMO
---

## AIDD:ITERATIONS_FULL
- [ ] I1: Bootstrap (iteration_id: I1)
  - DoD: done
- [ ] I2: Follow-up (iteration_id: I2)
  - Blocking: true
- [x] I3: Done already (iteration_id: I3)

## AIDD:NEXT_3
- (empty)

## AIDD:HANDOFF_INBOX
<!-- handoff:qa start -->
- [ ] Fix flaky test (id: H1, scope: iteration_id=I2) (Blocking: true)
- [ ] Docs polish (id: H2, scope: iteration_id=I1) (Blocking: false)
<!-- handoff:qa end -->

## AIDD:PROGRESS_LOG
- (empty)

## AIDD:HOW_TO_UPDATE
- update NEXT_3
";

    fn fixture() -> (TempDir, std::path::PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let path = paths::tasklist_path(&root, "DEMO");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, TASKLIST).unwrap();
        (dir, root)
    }

    #[test]
    fn set_iteration_done_toggles_once() {
        let (_dir, root) = fixture();
        let first = set_iteration_done(&root, "DEMO", "I1", "iteration").unwrap();
        assert!(first.changed && !first.error);
        let text = std::fs::read_to_string(paths::tasklist_path(&root, "DEMO")).unwrap();
        assert!(text.contains("- [x] I1: Bootstrap"));

        let second = set_iteration_done(&root, "DEMO", "I1", "iteration").unwrap();
        assert!(!second.changed && !second.error);
    }

    #[test]
    fn set_iteration_done_unknown_item_errors() {
        let (_dir, root) = fixture();
        let outcome = set_iteration_done(&root, "DEMO", "I9", "iteration").unwrap();
        assert!(outcome.error);
    }

    #[test]
    fn progress_log_appends_and_dedupes() {
        let (_dir, root) = fixture();
        let entry = ProgressEntry {
            date: "2025-01-01".into(),
            source: "implement".into(),
            item_id: "I1".into(),
            kind: "iteration".into(),
            hash: "abc123".into(),
            link: "aidd/reports/tests/t.log".into(),
            msg: "done".into(),
        };
        let first = append_progress_log(&root, "DEMO", &entry).unwrap();
        assert!(first.changed);
        let text = std::fs::read_to_string(paths::tasklist_path(&root, "DEMO")).unwrap();
        assert!(text.contains("- 2025-01-01 source=implement id=I1 kind=iteration hash=abc123"));
        assert!(!text.contains("## AIDD:PROGRESS_LOG\n- (empty)"));

        let dup = append_progress_log(&root, "DEMO", &entry).unwrap();
        assert!(!dup.changed && !dup.error);
        let text = std::fs::read_to_string(paths::tasklist_path(&root, "DEMO")).unwrap();
        assert_eq!(text.matches("hash=abc123").count(), 1);
    }

    #[test]
    fn next3_ranks_blocking_first() {
        let (_dir, root) = fixture();
        let outcome = next3_recompute(&root, "DEMO").unwrap();
        assert!(outcome.changed);
        let text = std::fs::read_to_string(paths::tasklist_path(&root, "DEMO")).unwrap();
        let section = text.split("## AIDD:NEXT_3").nth(1).unwrap();
        let i2 = section.find("iteration_id=I2").unwrap();
        let i1 = section.find("iteration_id=I1").unwrap();
        assert!(i2 < i1, "blocking item must rank first");
        assert!(!section[..section.find("## ").unwrap()].contains("I3"));

        let again = next3_recompute(&root, "DEMO").unwrap();
        assert!(!again.changed, "recompute is idempotent");
    }

    #[test]
    fn context_pack_upserts_fenced_block() {
        let (_dir, root) = fixture();
        let params = json!({
            "read_log": ["aidd/reports/loops/DEMO/iteration_id_I1.loop.pack.md"],
            "what_to_do": "implement I1",
        });
        let outcome =
            context_pack_update(&root, "DEMO", params.as_object().unwrap()).unwrap();
        assert!(outcome.changed);
        let text =
            std::fs::read_to_string(paths::context_pack_doc_path(&root, "DEMO")).unwrap();
        assert!(text.contains(CONTEXT_PACK_FENCE_OPEN));
        assert!(text.contains("what_to_do: implement I1"));
        assert!(text.contains("- aidd/reports/loops/DEMO/iteration_id_I1.loop.pack.md"));

        // Upsert replaces, never duplicates.
        let params = json!({"what_to_do": "implement I2"});
        context_pack_update(&root, "DEMO", params.as_object().unwrap()).unwrap();
        let text =
            std::fs::read_to_string(paths::context_pack_doc_path(&root, "DEMO")).unwrap();
        assert_eq!(text.matches("what_to_do:").count(), 1);
        assert!(text.contains("what_to_do: implement I2"));
    }

    #[test]
    fn context_pack_rejects_unknown_keys() {
        let (_dir, root) = fixture();
        let params = json!({"bogus": "x"});
        let outcome =
            context_pack_update(&root, "DEMO", params.as_object().unwrap()).unwrap();
        assert!(outcome.error);
    }

    #[test]
    fn qa_handoff_selects_blocking_unchecked() {
        let candidates = qa_handoff_candidates(TASKLIST);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0, "iteration_id=I2");
        assert_eq!(candidates[0].1, "H1");
    }
}
