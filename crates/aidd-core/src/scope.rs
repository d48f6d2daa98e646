//! Work item keys and scope-key canonicalization.
//!
//! A scope key is the path-safe form of a work item key; canonicalization is
//! a pure function and every artifact path carrying a scope must match it.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Work item keys
// ---------------------------------------------------------------------------

static ITERATION_KEY_RE: OnceLock<Regex> = OnceLock::new();
static GENERIC_KEY_RE: OnceLock<Regex> = OnceLock::new();
static SCOPE_SANITIZE_RE: OnceLock<Regex> = OnceLock::new();

fn iteration_key_re() -> &'static Regex {
    ITERATION_KEY_RE.get_or_init(|| Regex::new(r"^iteration_id=[A-Za-z0-9._-]+$").unwrap())
}

fn generic_key_re() -> &'static Regex {
    GENERIC_KEY_RE.get_or_init(|| Regex::new(r"^id=.+$").unwrap())
}

/// `iteration_id=<id>` — the only key form accepted by loop stages.
pub fn is_iteration_work_item_key(value: &str) -> bool {
    iteration_key_re().is_match(value.trim())
}

/// `iteration_id=<id>` or `id=<value>`.
pub fn is_valid_work_item_key(value: &str) -> bool {
    let trimmed = value.trim();
    is_iteration_work_item_key(trimmed) || generic_key_re().is_match(trimmed)
}

// ---------------------------------------------------------------------------
// Scope keys
// ---------------------------------------------------------------------------

/// Replace every run of characters outside `[A-Za-z0-9_.-]` with `_`, then
/// trim leading/trailing `._-`.
pub fn sanitize_scope_key(value: &str) -> String {
    let re = SCOPE_SANITIZE_RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_.-]+").unwrap());
    let cleaned = re.replace_all(value.trim(), "_");
    cleaned.trim_matches(|c| matches!(c, '.' | '_' | '-')).to_string()
}

/// Canonical scope key for a work item, falling back to the ticket and then
/// a literal `ticket` placeholder. `iteration_id=I1` maps to `iteration_id_I1`.
pub fn resolve_scope_key(work_item_key: &str, ticket: &str) -> String {
    let scope = sanitize_scope_key(work_item_key);
    if !scope.is_empty() {
        return scope;
    }
    let scope = sanitize_scope_key(ticket);
    if !scope.is_empty() {
        return scope;
    }
    "ticket".to_string()
}

/// Feature-level fallback scope for QA: `ticket:<TICKET>` sanitized.
pub fn qa_scope_key(ticket: &str) -> String {
    resolve_scope_key("", ticket)
}

// ---------------------------------------------------------------------------
// Stable ids
// ---------------------------------------------------------------------------

/// Deterministic short id from a prefix-free part list. Parts are separated
/// so `("ab","c")` and `("a","bc")` never collide.
pub fn stable_id(parts: &[&str], length: usize) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..length.min(hex.len())].to_string()
}

/// Collapse internal whitespace and trim. Used before dedupe/id derivation.
pub fn normalize_text(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn dedupe_preserve_order<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for raw in items {
        let value = normalize_text(raw.as_ref());
        if value.is_empty() || !seen.insert(value.clone()) {
            continue;
        }
        out.push(value);
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_keys() {
        assert!(is_iteration_work_item_key("iteration_id=I1"));
        assert!(is_iteration_work_item_key("iteration_id=wave-2.1"));
        assert!(!is_iteration_work_item_key("id=foo"));
        assert!(!is_iteration_work_item_key("iteration_id="));
        assert!(!is_iteration_work_item_key("iteration_id=a b"));
    }

    #[test]
    fn generic_keys() {
        assert!(is_valid_work_item_key("id=anything goes"));
        assert!(is_valid_work_item_key("iteration_id=I1"));
        assert!(!is_valid_work_item_key("slug=foo"));
        assert!(!is_valid_work_item_key(""));
    }

    #[test]
    fn scope_canonicalization_is_pure() {
        assert_eq!(resolve_scope_key("iteration_id=I1", "DEMO"), "iteration_id_I1");
        assert_eq!(
            resolve_scope_key("iteration_id=I1", "DEMO"),
            resolve_scope_key("iteration_id=I1", "OTHER")
        );
    }

    #[test]
    fn scope_fallbacks() {
        assert_eq!(resolve_scope_key("", "DEMO-123"), "DEMO-123");
        assert_eq!(resolve_scope_key("", ""), "ticket");
        assert_eq!(qa_scope_key("DEMO"), "DEMO");
    }

    #[test]
    fn sanitize_strips_edges() {
        assert_eq!(sanitize_scope_key("  id=x/y  "), "id_x_y");
        assert_eq!(sanitize_scope_key("__a__"), "a");
        assert_eq!(sanitize_scope_key("///"), "");
    }

    #[test]
    fn stable_id_deterministic_and_separated() {
        assert_eq!(stable_id(&["a", "b"], 12), stable_id(&["a", "b"], 12));
        assert_ne!(stable_id(&["ab", ""], 12), stable_id(&["a", "b"], 12));
        assert_eq!(stable_id(&["x"], 10).len(), 10);
    }

    #[test]
    fn dedupe_normalizes_whitespace() {
        let out = dedupe_preserve_order(["a  b", "a b", " c ", ""]);
        assert_eq!(out, vec!["a b".to_string(), "c".to_string()]);
    }
}
