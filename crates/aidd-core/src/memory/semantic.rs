//! Semantic memory extraction: scan the ticket's planning docs line by
//! line, classify what they assert, and persist a budgeted columnar pack.

use super::SemanticLimits;
use crate::error::Result;
use crate::io;
use crate::paths;
use crate::scope;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

const TERM_COLS: [&str; 5] = ["term", "definition", "aliases", "scope", "confidence"];
const DEFAULT_COLS: [&str; 4] = ["key", "value", "source", "rationale"];
const CONSTRAINT_COLS: [&str; 4] = ["id", "text", "source", "severity"];
const INVARIANT_COLS: [&str; 3] = ["id", "text", "source"];

#[derive(Debug, Default)]
struct Harvest {
    terms: Vec<(String, String, String)>,
    defaults: Vec<(String, String, String)>,
    constraints: Vec<(String, String)>,
    invariants: Vec<(String, String)>,
    open_questions: Vec<String>,
}

fn source_docs(root: &Path, ticket: &str) -> Vec<PathBuf> {
    let mut sources = vec![
        root.join("docs/prd").join(format!("{ticket}.md")),
        root.join("docs/plan").join(format!("{ticket}.md")),
        root.join("docs/research").join(format!("{ticket}.md")),
        paths::tasklist_path(root, ticket),
        root.join("reports/context").join(format!("{ticket}.pack.md")),
    ];
    sources.retain(|p| p.exists());
    sources
}

fn is_constraint(lower: &str) -> bool {
    lower.contains("must not")
        || lower.contains("must ")
        || lower.starts_with("must")
        || lower.contains("shall not")
        || lower.contains("forbidden")
        || lower.contains("not allowed")
}

fn is_invariant(lower: &str) -> bool {
    lower.starts_with("always ")
        || lower.contains(" always ")
        || lower.starts_with("never ")
        || lower.contains(" never ")
        || lower.contains("invariant")
}

fn classify_line(line: &str, source: &str, harvest: &mut Harvest) {
    let text = scope::normalize_text(line.trim_start_matches(['-', '*', ' ']));
    if text.is_empty() || text.starts_with('#') {
        return;
    }
    let lower = text.to_ascii_lowercase();
    if text.ends_with('?') {
        harvest.open_questions.push(text);
        return;
    }
    if is_constraint(&lower) {
        harvest.constraints.push((text, source.to_string()));
        return;
    }
    if is_invariant(&lower) {
        harvest.invariants.push((text, source.to_string()));
        return;
    }
    if let Some((key, value)) = text.split_once(':') {
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() || key.contains(' ') && key.len() > 40 {
            return;
        }
        if value.parse::<f64>().is_ok() {
            harvest.defaults.push((key.to_string(), value.to_string(), source.to_string()));
        } else {
            harvest.terms.push((key.to_string(), value.to_string(), source.to_string()));
        }
    }
}

fn dedupe_sort<T: Clone>(items: &[T], key: impl Fn(&T) -> String) -> Vec<T> {
    let mut seen = std::collections::BTreeMap::new();
    for item in items {
        seen.entry(key(item)).or_insert_with(|| item.clone());
    }
    seen.into_values().collect()
}

fn columnar(cols: &[&str], rows: Vec<Value>) -> Value {
    json!({ "cols": cols, "rows": rows })
}

fn section_rows(payload: &Value, section: &str) -> usize {
    if section == "open_questions" {
        payload[section].as_array().map(Vec::len).unwrap_or(0)
    } else {
        payload[section]["rows"].as_array().map(Vec::len).unwrap_or(0)
    }
}

fn pop_section_row(payload: &mut Value, section: &str) {
    let rows = if section == "open_questions" {
        payload[section].as_array_mut()
    } else {
        payload[section]["rows"].as_array_mut()
    };
    if let Some(rows) = rows {
        rows.pop();
    }
}

/// Extract the semantic pack for a ticket and write it to
/// `reports/memory/<ticket>.semantic.pack.json`. Returns the payload.
pub fn extract(
    root: &Path,
    ticket: &str,
    slug_hint: &str,
    limits: &SemanticLimits,
) -> Result<Value> {
    let sources = source_docs(root, ticket);
    let mut harvest = Harvest::default();
    for path in &sources {
        let source = paths::rel_path(path, root);
        let text = std::fs::read_to_string(path)?;
        for line in text.lines() {
            classify_line(line, &source, &mut harvest);
        }
    }

    let cap = limits.per_section();
    let terms: Vec<Value> = dedupe_sort(&harvest.terms, |t| t.0.to_ascii_lowercase())
        .into_iter()
        .take(cap)
        .map(|(term, definition, source)| json!([term, definition, [], source, 0.7]))
        .collect();
    let defaults: Vec<Value> = dedupe_sort(&harvest.defaults, |d| d.0.to_ascii_lowercase())
        .into_iter()
        .take(cap)
        .map(|(key, value, source)| json!([key, value, source, "default"]))
        .collect();
    let constraints: Vec<Value> = dedupe_sort(&harvest.constraints, |c| c.0.to_ascii_lowercase())
        .into_iter()
        .take(cap)
        .enumerate()
        .map(|(i, (text, source))| json!([format!("c{}", i + 1), text, source, "high"]))
        .collect();
    let invariants: Vec<Value> = dedupe_sort(&harvest.invariants, |i| i.0.to_ascii_lowercase())
        .into_iter()
        .take(cap)
        .enumerate()
        .map(|(i, (text, source))| json!([format!("i{}", i + 1), text, source]))
        .collect();
    let open_questions: Vec<String> =
        scope::dedupe_preserve_order(harvest.open_questions).into_iter().take(cap).collect();

    let mut payload = json!({
        "schema": crate::schema::MEMORY_SEMANTIC_V1,
        "schema_version": crate::schema::MEMORY_SEMANTIC_V1,
        "pack_version": super::PACK_VERSION,
        "type": "memory-semantic",
        "kind": "pack",
        "ticket": ticket,
        "slug_hint": slug_hint,
        "generated_at": io::utc_timestamp(),
        "source_path": sources.first().map(|p| paths::rel_path(p, root)).unwrap_or_default(),
        "terms": columnar(&TERM_COLS, terms),
        "defaults": columnar(&DEFAULT_COLS, defaults),
        "constraints": columnar(&CONSTRAINT_COLS, constraints),
        "invariants": columnar(&INVARIANT_COLS, invariants),
        "open_questions": open_questions,
        "stats": {},
    });

    let mut trimmed = 0usize;
    for section in &limits.trim_priority {
        while io::budget_exceeded(&payload, limits.max_chars, limits.max_lines)?
            && section_rows(&payload, section) > 0
        {
            pop_section_row(&mut payload, section);
            trimmed += 1;
        }
    }

    let (chars, lines) = io::payload_size(&payload)?;
    payload["stats"] = json!({
        "source_files_count": sources.len(),
        "size": { "chars": chars, "lines": lines },
        "budget": { "max_chars": limits.max_chars, "max_lines": limits.max_lines },
        "trimmed": trimmed,
    });

    io::write_json(&super::semantic_pack_path(root, ticket), &payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed(root: &Path, ticket: &str, lines: &[&str]) {
        let path = root.join("docs/plan").join(format!("{ticket}.md"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();
    }

    #[test]
    fn classifies_sections_and_respects_budget() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        seed(
            root,
            "MEM-1",
            &[
                "Status: READY",
                "timeout: 30",
                "API: gateway endpoint",
                "must authenticate each request",
                "always keep decision ids stable",
                "How do we rotate secrets?",
            ],
        );
        let payload = extract(root, "MEM-1", "mem-1", &SemanticLimits::default()).unwrap();
        assert_eq!(payload["schema_version"], "aidd.memory.semantic.v1");
        assert!(!payload["terms"]["rows"].as_array().unwrap().is_empty());
        assert!(!payload["defaults"]["rows"].as_array().unwrap().is_empty());
        assert!(!payload["constraints"]["rows"].as_array().unwrap().is_empty());
        assert!(!payload["invariants"]["rows"].as_array().unwrap().is_empty());
        assert_eq!(payload["open_questions"][0], "How do we rotate secrets?");
        assert!(payload["stats"]["size"]["chars"].as_u64().unwrap() <= 8000);
        assert!(super::super::semantic_pack_path(root, "MEM-1").exists());
    }

    #[test]
    fn trim_drops_open_questions_first() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let mut lines: Vec<String> = Vec::new();
        for i in 0..30 {
            lines.push(format!("What about edge case number {i:02}?"));
            lines.push(format!("must validate input field {i:02} thoroughly"));
        }
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        seed(root, "MEM-2", &refs);

        let limits = SemanticLimits { max_chars: 1200, max_lines: 60, ..Default::default() };
        let payload = extract(root, "MEM-2", "mem-2", &limits).unwrap();
        assert!(payload["stats"]["trimmed"].as_u64().unwrap() > 0);
        let questions = payload["open_questions"].as_array().unwrap().len();
        let constraints = payload["constraints"]["rows"].as_array().unwrap().len();
        assert!(questions <= constraints, "questions trimmed before constraints");
        let (chars, lines) = io::payload_size(&payload).unwrap();
        assert!(chars <= 1200 + 200, "stats block may add a little, got {chars}");
        let _ = lines;
    }

    #[test]
    fn dedupes_and_sorts_terms() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        seed(root, "MEM-3", &["Zed: editor", "API: gateway", "api: duplicate", "API: gateway"]);
        let payload = extract(root, "MEM-3", "mem-3", &SemanticLimits::default()).unwrap();
        let rows = payload["terms"]["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], "API");
        assert_eq!(rows[1][0], "Zed");
    }
}
