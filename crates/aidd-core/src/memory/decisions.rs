//! Decisions: append-only JSONL log plus a deterministic pack snapshot.
//! The pack is rebuilt after every append so readers never see a stale
//! snapshot on the happy path.

use super::DecisionsLimits;
use crate::docops::OpOutcome;
use crate::error::Result;
use crate::io;
use crate::scope;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub const DECISION_STATUSES: [&str; 3] = ["active", "superseded", "rejected"];

const ACTIVE_COLS: [&str; 8] =
    ["decision_id", "topic", "decision", "status", "ts", "scope_key", "stage", "source_path"];
const SUPERSEDED_COLS: [&str; 5] = ["decision_id", "supersedes", "topic", "status", "ts"];

// ---------------------------------------------------------------------------
// Append
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct DecisionInput {
    pub topic: String,
    pub decision: String,
    pub decision_id: String,
    pub alternatives: Vec<String>,
    pub rationale: String,
    pub status: String,
    pub supersedes: String,
    pub source_path: String,
    pub scope_key: String,
    pub stage: String,
}

/// Append one decision to the log and rebuild the pack. `decision_id`
/// defaults to a stable hash of (ticket, topic, decision) so re-appending
/// the same decision keeps the same id.
pub fn append_decision(root: &Path, ticket: &str, input: &DecisionInput) -> Result<Value> {
    let topic = scope::normalize_text(&input.topic);
    let decision = scope::normalize_text(&input.decision);
    let decision_id = if input.decision_id.is_empty() {
        scope::stable_id(&[ticket, &topic.to_ascii_lowercase(), &decision.to_ascii_lowercase()], 12)
    } else {
        input.decision_id.clone()
    };
    let status = {
        let s = input.status.trim().to_ascii_lowercase();
        if s.is_empty() { "active".to_string() } else { s }
    };
    let source_path = if input.source_path.is_empty() {
        format!("aidd/reports/context/{ticket}.pack.md")
    } else {
        input.source_path.clone()
    };

    let mut entry = json!({
        "schema": crate::schema::MEMORY_DECISION_V1,
        "schema_version": crate::schema::MEMORY_DECISION_V1,
        "ts": io::utc_timestamp(),
        "ticket": ticket,
        "scope_key": input.scope_key,
        "stage": input.stage,
        "decision_id": decision_id,
        "topic": topic,
        "decision": decision,
        "alternatives": scope::dedupe_preserve_order(input.alternatives.clone()),
        "rationale": input.rationale,
        "source_path": source_path,
        "status": status,
    });
    if !input.supersedes.is_empty() {
        entry["supersedes"] = Value::String(input.supersedes.clone());
    }

    let errors = super::verify::validate_decision_data(&entry);
    if !errors.is_empty() {
        return Err(crate::error::AiddError::Validation(errors.join("; ")));
    }

    io::append_jsonl(&super::decisions_log_path(root, ticket), &entry)?;
    build_pack(root, ticket, &DecisionsLimits::default())?;
    Ok(entry)
}

/// DocOps-style adapter for `memory_ops.decision_append` actions.
pub fn append_from_action(root: &Path, ticket: &str, params: &Map<String, Value>) -> Result<OpOutcome> {
    let get = |key: &str| {
        params.get(key).and_then(Value::as_str).map(str::trim).unwrap_or("").to_string()
    };
    let alternatives = match params.get("alternatives") {
        Some(Value::Array(items)) => {
            items.iter().filter_map(Value::as_str).map(str::to_string).collect()
        }
        Some(Value::String(text)) => {
            text.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
        }
        _ => Vec::new(),
    };
    let input = DecisionInput {
        topic: get("topic"),
        decision: get("decision"),
        decision_id: get("decision_id"),
        alternatives,
        rationale: get("rationale"),
        status: get("status"),
        supersedes: get("supersedes"),
        source_path: get("source_path"),
        scope_key: get("scope_key"),
        stage: get("stage"),
    };
    if input.topic.is_empty() || input.decision.is_empty() {
        return Ok(OpOutcome {
            changed: false,
            error: true,
            message: "decision_append requires topic and decision".to_string(),
        });
    }
    let entry = append_decision(root, ticket, &input)?;
    Ok(OpOutcome {
        changed: true,
        error: false,
        message: format!("decision {} recorded", entry["decision_id"].as_str().unwrap_or("")),
    })
}

// ---------------------------------------------------------------------------
// Pack
// ---------------------------------------------------------------------------

fn field<'a>(entry: &'a Value, key: &str) -> &'a str {
    entry.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Collapse the JSONL log into the decisions pack: the latest entry per
/// decision_id, split into active rows and superseded heads, plus topic
/// conflicts. Budget trims active rows, then superseded, then conflicts.
pub fn build_pack(root: &Path, ticket: &str, limits: &DecisionsLimits) -> Result<Value> {
    let log_path = super::decisions_log_path(root, ticket);
    let (entries, invalid_entries) = if log_path.exists() {
        io::read_jsonl(&log_path)?
    } else {
        (Vec::new(), 0)
    };
    let entries_total = entries.len();

    // Last write wins per decision_id; insertion order is the log order.
    let mut latest: BTreeMap<String, Value> = BTreeMap::new();
    for entry in entries {
        let id = field(&entry, "decision_id").to_string();
        if id.is_empty() {
            continue;
        }
        latest.insert(id, entry);
    }
    let latest_decisions = latest.len();

    let mut active: Vec<&Value> = Vec::new();
    let mut superseded: Vec<&Value> = Vec::new();
    let mut rejected_total = 0usize;
    for entry in latest.values() {
        match field(entry, "status") {
            "active" => active.push(entry),
            "superseded" => superseded.push(entry),
            "rejected" => rejected_total += 1,
            _ => {}
        }
    }
    active.sort_by_key(|e| (field(e, "topic").to_ascii_lowercase(), field(e, "decision_id").to_string()));
    superseded.sort_by_key(|e| (field(e, "ts").to_string(), field(e, "decision_id").to_string()));

    let active_total = active.len();
    let superseded_total = superseded.len();
    let active_truncated = active_total > limits.max_active;
    active.truncate(limits.max_active);
    superseded.truncate(limits.max_history);

    let mut topic_counts: BTreeMap<String, usize> = BTreeMap::new();
    for entry in &active {
        *topic_counts.entry(field(entry, "topic").to_ascii_lowercase()).or_default() += 1;
    }
    let conflicts: Vec<String> = topic_counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(topic, count)| format!("{topic}: {count} active variants"))
        .collect();

    let active_rows: Vec<Value> = active
        .iter()
        .map(|e| {
            json!([
                field(e, "decision_id"),
                field(e, "topic"),
                field(e, "decision"),
                field(e, "status"),
                field(e, "ts"),
                field(e, "scope_key"),
                field(e, "stage"),
                field(e, "source_path"),
            ])
        })
        .collect();
    let superseded_rows: Vec<Value> = superseded
        .iter()
        .map(|e| {
            json!([
                field(e, "decision_id"),
                field(e, "supersedes"),
                field(e, "topic"),
                field(e, "status"),
                field(e, "ts"),
            ])
        })
        .collect();

    let mut payload = json!({
        "schema": crate::schema::MEMORY_DECISIONS_PACK_V1,
        "schema_version": crate::schema::MEMORY_DECISIONS_PACK_V1,
        "pack_version": super::PACK_VERSION,
        "type": "memory-decisions",
        "kind": "pack",
        "ticket": ticket,
        "slug_hint": ticket.to_ascii_lowercase(),
        "generated_at": io::utc_timestamp(),
        "source_path": format!("aidd/reports/memory/{ticket}.decisions.jsonl"),
        "active_decisions": { "cols": ACTIVE_COLS, "rows": active_rows },
        "superseded_heads": { "cols": SUPERSEDED_COLS, "rows": superseded_rows },
        "conflicts": conflicts,
        "stats": {},
    });

    let mut trimmed = 0usize;
    for section in ["active_decisions", "superseded_heads"] {
        while io::budget_exceeded(&payload, limits.max_chars, limits.max_lines)? {
            let Some(rows) = payload[section]["rows"].as_array_mut() else { break };
            if rows.pop().is_none() {
                break;
            }
            trimmed += 1;
        }
    }
    while io::budget_exceeded(&payload, limits.max_chars, limits.max_lines)? {
        let Some(items) = payload["conflicts"].as_array_mut() else { break };
        if items.pop().is_none() {
            break;
        }
        trimmed += 1;
    }

    let (chars, lines) = io::payload_size(&payload)?;
    payload["stats"] = json!({
        "entries_total": entries_total,
        "invalid_entries": invalid_entries,
        "latest_decisions": latest_decisions,
        "active_total": active_total,
        "superseded_total": superseded_total,
        "rejected_total": rejected_total,
        "active_truncated": active_truncated,
        "size": { "chars": chars, "lines": lines },
        "budget": { "max_chars": limits.max_chars, "max_lines": limits.max_lines },
        "trimmed": trimmed,
    });

    io::write_json(&super::decisions_pack_path(root, ticket), &payload)?;
    Ok(payload)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn append_then_pack_tracks_supersession_and_invalid_rows() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let first = append_decision(
            root,
            "MEM-DEC-1",
            &DecisionInput {
                topic: "storage".into(),
                decision: "use sqlite".into(),
                alternatives: vec!["postgres".into()],
                rationale: "local workflow".into(),
                ..Default::default()
            },
        )
        .unwrap();
        let first_id = first["decision_id"].as_str().unwrap().to_string();

        append_decision(
            root,
            "MEM-DEC-1",
            &DecisionInput {
                topic: "storage".into(),
                decision: "use postgres".into(),
                status: "superseded".into(),
                supersedes: first_id.clone(),
                ..Default::default()
            },
        )
        .unwrap();

        let log = super::super::decisions_log_path(root, "MEM-DEC-1");
        let mut text = std::fs::read_to_string(&log).unwrap();
        text.push_str("{broken json}\n");
        std::fs::write(&log, text).unwrap();

        let pack = build_pack(root, "MEM-DEC-1", &DecisionsLimits::default()).unwrap();
        assert_eq!(pack["schema_version"], "aidd.memory.decisions.pack.v1");
        assert_eq!(pack["active_decisions"]["rows"].as_array().unwrap().len(), 1);
        assert_eq!(pack["superseded_heads"]["rows"].as_array().unwrap().len(), 1);
        assert_eq!(pack["superseded_heads"]["rows"][0][1], first_id);
        assert_eq!(pack["stats"]["entries_total"], 2);
        assert_eq!(pack["stats"]["invalid_entries"], 1);
    }

    #[test]
    fn stable_decision_id_is_repeatable() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let input = DecisionInput {
            topic: "Retrieval-Order".into(),
            decision: "Pack/Slice First".into(),
            ..Default::default()
        };
        let a = append_decision(root, "MEM-DEC-2", &input).unwrap();
        let b = append_decision(root, "MEM-DEC-2", &input).unwrap();
        assert_eq!(a["decision_id"], b["decision_id"]);

        let pack = build_pack(root, "MEM-DEC-2", &DecisionsLimits::default()).unwrap();
        assert_eq!(pack["stats"]["entries_total"], 2);
        assert_eq!(pack["stats"]["latest_decisions"], 1);
    }

    #[test]
    fn conflicts_flag_multiple_active_per_topic() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for decision in ["use sqlite", "use postgres"] {
            append_decision(
                root,
                "MEM-DEC-3",
                &DecisionInput { topic: "storage".into(), decision: decision.into(), ..Default::default() },
            )
            .unwrap();
        }
        let pack = build_pack(root, "MEM-DEC-3", &DecisionsLimits::default()).unwrap();
        assert_eq!(pack["conflicts"][0], "storage: 2 active variants");
    }

    #[test]
    fn action_adapter_requires_topic_and_decision() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let params = json!({"topic": "x"});
        let outcome = append_from_action(root, "MEM-DEC-4", params.as_object().unwrap()).unwrap();
        assert!(outcome.error);

        let params = json!({"topic": "cache", "decision": "keep lru", "alternatives": "lfu, none"});
        let outcome = append_from_action(root, "MEM-DEC-4", params.as_object().unwrap()).unwrap();
        assert!(outcome.changed);
        assert!(super::super::decisions_pack_path(root, "MEM-DEC-4").exists());
    }
}
