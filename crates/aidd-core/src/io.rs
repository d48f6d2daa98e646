//! Canonical serialization and atomic file primitives.
//!
//! Every JSON artifact in the repository goes through [`canonical_json`]:
//! sorted keys, 2-space indent, Unicode preserved, trailing newline. Budget
//! checks measure this exact text, so size accounting is deterministic.

use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

// ---------------------------------------------------------------------------
// Canonical JSON
// ---------------------------------------------------------------------------

fn sort_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = serde_json::Map::new();
            for (k, v) in entries {
                sorted.insert(k, sort_value(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}

/// Serialize to the single canonical JSON form used across the codebase:
/// keys sorted, 2-space indent, `\n` newlines, trailing newline, no BOM.
pub fn canonical_json<T: Serialize>(payload: &T) -> Result<String> {
    let value = sort_value(serde_json::to_value(payload)?);
    let mut text = serde_json::to_string_pretty(&value)?;
    text.push('\n');
    Ok(text)
}

/// Size of the canonical serialization: `(chars, lines)`.
pub fn payload_size<T: Serialize>(payload: &T) -> Result<(usize, usize)> {
    let text = canonical_json(payload)?;
    let chars = text.chars().count();
    let lines = text.matches('\n').count();
    Ok((chars, lines))
}

pub fn budget_exceeded<T: Serialize>(payload: &T, max_chars: usize, max_lines: usize) -> Result<bool> {
    let (chars, lines) = payload_size(payload)?;
    Ok(chars > max_chars || lines > max_lines)
}

// ---------------------------------------------------------------------------
// Atomic writes
// ---------------------------------------------------------------------------

/// Atomically write `data` to `path` using a tempfile in the same directory.
/// Prevents partial writes from corrupting artifact files.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Write a payload as canonical JSON, atomically.
pub fn write_json<T: Serialize>(path: &Path, payload: &T) -> Result<()> {
    let text = canonical_json(payload)?;
    atomic_write(path, text.as_bytes())
}

pub fn write_text(path: &Path, text: &str) -> Result<()> {
    atomic_write(path, text.as_bytes())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// JSONL
// ---------------------------------------------------------------------------

/// Append one object as a single JSON line. The log is append-only; entries
/// are never rewritten.
pub fn append_jsonl<T: Serialize>(path: &Path, payload: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(payload)?;
    line.push('\n');
    let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(line.as_bytes())?;
    Ok(())
}

/// Read every parseable JSON line; corrupted lines are counted, not fatal.
pub fn read_jsonl(path: &Path) -> Result<(Vec<Value>, usize)> {
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }
    let text = std::fs::read_to_string(path)?;
    let mut entries = Vec::new();
    let mut invalid = 0usize;
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => entries.push(Value::Object(map)),
            Ok(_) | Err(_) => invalid += 1,
        }
    }
    Ok((entries, invalid))
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Read a JSON file, retrying once after 50ms. Writers are atomic, but a
/// neighbor may be mid-rename; one back-off covers that window.
pub fn read_json_retry<T: DeserializeOwned>(path: &Path) -> Result<T> {
    match read_json(path) {
        Ok(value) => Ok(value),
        Err(_) => {
            std::thread::sleep(std::time::Duration::from_millis(50));
            read_json(path)
        }
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

// ---------------------------------------------------------------------------
// Markers & timestamps
// ---------------------------------------------------------------------------

/// Replace content between `start_marker` and `end_marker` (inclusive).
/// Returns `true` if both markers were found and the file was updated.
pub fn replace_between_markers(
    path: &Path,
    start_marker: &str,
    end_marker: &str,
    replacement: &str,
) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let content = std::fs::read_to_string(path)?;
    let Some(start_pos) = content.find(start_marker) else {
        return Ok(false);
    };
    let search_from = start_pos + start_marker.len();
    let Some(end_offset) = content[search_from..].find(end_marker) else {
        return Ok(false);
    };
    let end_pos = search_from + end_offset + end_marker.len();

    let mut updated = String::with_capacity(content.len());
    updated.push_str(&content[..start_pos]);
    updated.push_str(replacement);
    updated.push_str(&content[end_pos..]);

    atomic_write(path, updated.as_bytes())?;
    Ok(true)
}

/// ISO-8601 UTC timestamp with second precision: `YYYY-MM-DDTHH:MM:SSZ`.
pub fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn canonical_json_sorts_keys_and_ends_with_newline() {
        let text = canonical_json(&json!({"b": 1, "a": {"z": 2, "y": 3}})).unwrap();
        assert_eq!(text, "{\n  \"a\": {\n    \"y\": 3,\n    \"z\": 2\n  },\n  \"b\": 1\n}\n");
    }

    #[test]
    fn canonical_json_is_stable_across_runs() {
        let payload = json!({"k": ["c", "a"], "n": 1});
        assert_eq!(
            canonical_json(&payload).unwrap(),
            canonical_json(&payload).unwrap()
        );
    }

    #[test]
    fn canonical_json_preserves_unicode() {
        let text = canonical_json(&json!({"msg": "привет"})).unwrap();
        assert!(text.contains("привет"));
    }

    #[test]
    fn payload_size_counts_canonical_text() {
        let payload = json!({"a": 1});
        let text = canonical_json(&payload).unwrap();
        let (chars, lines) = payload_size(&payload).unwrap();
        assert_eq!(chars, text.chars().count());
        assert_eq!(lines, 3);
    }

    #[test]
    fn budget_check_uses_canonical_serialization() {
        let payload = json!({"a": "x".repeat(100)});
        assert!(budget_exceeded(&payload, 50, 100).unwrap());
        assert!(!budget_exceeded(&payload, 10_000, 100).unwrap());
    }

    #[test]
    fn atomic_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c/test.json");
        atomic_write(&path, b"{}").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("payload.json");
        write_json(&path, &json!({"b": 2, "a": 1})).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("{\n  \"a\": 1"));
        assert!(text.ends_with("\n"));
    }

    #[test]
    fn jsonl_append_and_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.jsonl");
        append_jsonl(&path, &json!({"n": 1})).unwrap();
        append_jsonl(&path, &json!({"n": 2})).unwrap();
        let (entries, invalid) = read_jsonl(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(invalid, 0);
        assert_eq!(entries[1]["n"], 2);
    }

    #[test]
    fn jsonl_counts_corrupted_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, "{\"ok\":1}\nnot-json\n[1,2]\n").unwrap();
        let (entries, invalid) = read_jsonl(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(invalid, 2);
    }

    #[test]
    fn replace_between_markers_updates_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.md");
        std::fs::write(&path, "head\n<!-- S -->old<!-- E -->\ntail\n").unwrap();
        let changed =
            replace_between_markers(&path, "<!-- S -->", "<!-- E -->", "<!-- S -->new<!-- E -->")
                .unwrap();
        assert!(changed);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("new"));
        assert!(!text.contains("old"));
    }

    #[test]
    fn utc_timestamp_shape() {
        let ts = utc_timestamp();
        assert_eq!(ts.len(), 20);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], "T");
    }
}
