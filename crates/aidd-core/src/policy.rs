//! Blocked-reason policy matrix shared by loop-step and loop-run.
//!
//! Every non-success path carries a reason code from a closed vocabulary;
//! classification maps it to a policy class. Defaults can be replaced (not
//! merged) per class via `config/gates.json` and then via
//! `AIDD_LOOP_BLOCK_REASON_*` environment variables.

use crate::gates::GatesConfig;
use serde::Serialize;
use std::collections::BTreeSet;

pub const DEFAULT_BLOCKED_POLICY: &str = "strict";
pub const BLOCKED_POLICY_VALUES: [&str; 2] = ["strict", "ralph"];
pub const RALPH_POLICY_VERSION: &str = "v2";

pub const DEFAULT_HARD_BLOCK_REASONS: [&str; 12] = [
    "loop_runner_permissions",
    "user_approval_required",
    "diff_boundary_violation",
    "preflight_contract_mismatch",
    "plugin_root_missing",
    "command_unavailable",
    "invalid_work_item_key",
    "work_item_resolution_failed",
    "active_stage_sync_failed",
    "prompt_flow_blocker",
    "contract_mismatch_stage_result_shape",
    "contract_mismatch_actions_shape",
];

pub const DEFAULT_RECOVERABLE_REASONS: [&str; 21] = [
    "stage_result_missing_or_invalid",
    "stage_result_blocked",
    "blocked_without_reason",
    "blocking_findings",
    "scope_drift_recoverable",
    "rlm_links_empty_warn",
    "rlm_worklist_missing",
    "rlm_status_pending",
    "no_tests_hard",
    "qa_tests_failed",
    "review_context_pack_missing",
    "qa_blocked",
    // Compatibility reasons from the historical recoverable set.
    "invalid_loop_step_payload",
    "stage_result_missing",
    "stage_chain_logs_missing",
    "preflight_missing",
    "qa_repair_missing_work_item",
    "qa_repair_no_handoff",
    "qa_repair_multiple_handoffs",
    "qa_repair_tasklist_missing",
    "unsupported_stage_result",
];

pub const DEFAULT_WARN_CONTINUE_REASONS: [&str; 7] = [
    "output_contract_warn",
    "no_tests_soft",
    "review_context_pack_placeholder_warn",
    "fast_mode_warn",
    "out_of_scope_warn",
    "no_boundaries_defined_warn",
    "auto_boundary_extend_warn",
];

pub const DEFAULT_STRICT_RECOVERABLE_REASONS: [&str; 1] = ["no_tests_hard"];

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

pub fn normalize_reason_code(reason_code: &str) -> String {
    reason_code.trim().to_ascii_lowercase()
}

fn split_reason_codes(value: &str) -> BTreeSet<String> {
    value
        .replace([',', ';'], " ")
        .split_whitespace()
        .map(normalize_reason_code)
        .filter(|s| !s.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Policy resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReasonPolicy {
    pub hard: BTreeSet<String>,
    pub recoverable: BTreeSet<String>,
    pub warn: BTreeSet<String>,
    pub strict_recoverable: BTreeSet<String>,
}

fn to_set(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|s| s.to_string()).collect()
}

const ENV_REASON_KEYS: [(&str, &str); 4] = [
    ("hard", "AIDD_LOOP_BLOCK_REASON_HARD"),
    ("recoverable", "AIDD_LOOP_BLOCK_REASON_RECOVERABLE"),
    ("warn", "AIDD_LOOP_BLOCK_REASON_WARN"),
    ("strict_recoverable", "AIDD_LOOP_BLOCK_REASON_STRICT_RECOVERABLE"),
];

/// Defaults, overridden per class by gates config, then by env.
pub fn resolve_reason_policy(gates: &GatesConfig) -> ReasonPolicy {
    let mut policy = ReasonPolicy {
        hard: to_set(&DEFAULT_HARD_BLOCK_REASONS),
        recoverable: to_set(&DEFAULT_RECOVERABLE_REASONS),
        warn: to_set(&DEFAULT_WARN_CONTINUE_REASONS),
        strict_recoverable: to_set(&DEFAULT_STRICT_RECOVERABLE_REASONS),
    };
    for (key, slot) in [
        ("hard", &mut policy.hard),
        ("recoverable", &mut policy.recoverable),
        ("warn", &mut policy.warn),
    ] {
        let configured = gates.loop_block_reason_codes(key);
        if !configured.is_empty() {
            *slot = configured.iter().map(|s| normalize_reason_code(s)).collect();
        }
    }
    let strict = gates.strict_recoverable_reason_codes();
    if !strict.is_empty() {
        policy.strict_recoverable = strict.iter().map(|s| normalize_reason_code(s)).collect();
    }
    for (key, env_name) in ENV_REASON_KEYS {
        let Ok(raw) = std::env::var(env_name) else { continue };
        if raw.trim().is_empty() {
            continue;
        }
        let parsed = split_reason_codes(&raw);
        match key {
            "hard" => policy.hard = parsed,
            "recoverable" => policy.recoverable = parsed,
            "warn" => policy.warn = parsed,
            _ => policy.strict_recoverable = parsed,
        }
    }
    policy
}

/// Precedence: explicit argument, `AIDD_LOOP_BLOCKED_POLICY`, gates config,
/// then the strict default.
pub fn resolve_blocked_policy(raw: Option<&str>, gates: &GatesConfig) -> String {
    let candidates = [
        normalize_reason_code(raw.unwrap_or("")),
        normalize_reason_code(&std::env::var("AIDD_LOOP_BLOCKED_POLICY").unwrap_or_default()),
        normalize_reason_code(&gates.loop_blocked_policy()),
        DEFAULT_BLOCKED_POLICY.to_string(),
    ];
    candidates
        .into_iter()
        .find(|c| BLOCKED_POLICY_VALUES.contains(&c.as_str()))
        .unwrap_or_else(|| DEFAULT_BLOCKED_POLICY.to_string())
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BlockClassification {
    pub reason_code: String,
    pub blocked_policy: String,
    pub reason_class: String,
    pub is_hard_block: bool,
    pub is_recoverable_retry: bool,
    pub is_warn_continue: bool,
    pub policy_version: String,
}

/// Pure mapping from `(reason_code, blocked_policy, hooks_mode)` to a policy
/// class. An empty reason normalizes to `blocked_without_reason`. Under
/// `ralph`, unknown `stage_result_*`/`qa_repair_*` prefixes fall back to
/// recoverable and unknown `*_warn` suffixes to warn.
pub fn classify_block_reason(
    reason_code: &str,
    blocked_policy: Option<&str>,
    hooks_mode: &str,
    gates: &GatesConfig,
) -> BlockClassification {
    let resolved_policy = resolve_blocked_policy(blocked_policy, gates);
    let normalized = {
        let n = normalize_reason_code(reason_code);
        if n.is_empty() { "blocked_without_reason".to_string() } else { n }
    };
    let hooks_value = hooks_mode.trim().to_ascii_lowercase();
    let policy = resolve_reason_policy(gates);

    let mut reason_class = "not_recoverable";
    if policy.hard.contains(&normalized) {
        reason_class = "hard_block";
    } else if resolved_policy == "strict" && policy.strict_recoverable.contains(&normalized) {
        reason_class = "recoverable_retry";
    } else if resolved_policy == "ralph" {
        if policy.recoverable.contains(&normalized) {
            reason_class = "recoverable_retry";
        } else if policy.warn.contains(&normalized) {
            reason_class = "warn_continue";
        } else if normalized.starts_with("stage_result_") || normalized.starts_with("qa_repair_") {
            reason_class = "recoverable_retry";
        } else if normalized.ends_with("_warn") {
            reason_class = "warn_continue";
        }
    } else if hooks_value != "strict" && policy.warn.contains(&normalized) {
        // Strict policy remains fail-fast; this branch drives telemetry only.
        reason_class = "warn_continue";
    }

    BlockClassification {
        reason_code: normalized,
        blocked_policy: resolved_policy.clone(),
        reason_class: reason_class.to_string(),
        is_hard_block: reason_class == "hard_block",
        is_recoverable_retry: reason_class == "recoverable_retry",
        is_warn_continue: reason_class == "warn_continue",
        policy_version: if resolved_policy == "ralph" {
            RALPH_POLICY_VERSION.to_string()
        } else {
            String::new()
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::GatesConfig;

    fn gates() -> GatesConfig {
        GatesConfig::default()
    }

    #[test]
    fn hard_block_dominates_in_both_policies() {
        for policy in ["strict", "ralph"] {
            let c = classify_block_reason("plugin_root_missing", Some(policy), "", &gates());
            assert_eq!(c.reason_class, "hard_block");
            assert!(c.is_hard_block);
        }
    }

    #[test]
    fn strict_recoverable_escapes_under_strict_only() {
        let c = classify_block_reason("no_tests_hard", Some("strict"), "", &gates());
        assert_eq!(c.reason_class, "recoverable_retry");
        let c = classify_block_reason("no_tests_hard", Some("ralph"), "", &gates());
        assert_eq!(c.reason_class, "recoverable_retry");
    }

    #[test]
    fn ralph_prefix_and_suffix_fallbacks() {
        let c = classify_block_reason("stage_result_totally_new", Some("ralph"), "", &gates());
        assert_eq!(c.reason_class, "recoverable_retry");
        let c = classify_block_reason("qa_repair_novel_case", Some("ralph"), "", &gates());
        assert_eq!(c.reason_class, "recoverable_retry");
        let c = classify_block_reason("brand_new_warn", Some("ralph"), "", &gates());
        assert_eq!(c.reason_class, "warn_continue");
        let c = classify_block_reason("something_else", Some("ralph"), "", &gates());
        assert_eq!(c.reason_class, "not_recoverable");
    }

    #[test]
    fn empty_reason_becomes_blocked_without_reason() {
        let c = classify_block_reason("", Some("ralph"), "", &gates());
        assert_eq!(c.reason_code, "blocked_without_reason");
        assert_eq!(c.reason_class, "recoverable_retry");
    }

    #[test]
    fn warn_telemetry_respects_hooks_mode() {
        let c = classify_block_reason("out_of_scope_warn", Some("strict"), "", &gates());
        assert_eq!(c.reason_class, "warn_continue");
        let c = classify_block_reason("out_of_scope_warn", Some("strict"), "strict", &gates());
        assert_eq!(c.reason_class, "not_recoverable");
    }

    #[test]
    fn policy_version_only_for_ralph() {
        let c = classify_block_reason("qa_blocked", Some("ralph"), "", &gates());
        assert_eq!(c.policy_version, RALPH_POLICY_VERSION);
        let c = classify_block_reason("qa_blocked", Some("strict"), "", &gates());
        assert_eq!(c.policy_version, "");
    }

    #[test]
    fn classification_is_pure_modulo_class_fields() {
        let strict = classify_block_reason("qa_blocked", Some("strict"), "", &gates());
        let ralph = classify_block_reason("qa_blocked", Some("ralph"), "", &gates());
        assert_eq!(strict.reason_code, ralph.reason_code);
        assert_ne!(strict.reason_class, ralph.reason_class);
    }

    #[test]
    fn split_handles_mixed_separators() {
        let set = split_reason_codes("a, b;c  D");
        let expected: Vec<&str> = vec!["a", "b", "c", "d"];
        assert_eq!(set.iter().map(String::as_str).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn gates_config_overrides_warn_set() {
        let gates = GatesConfig::from_value(serde_json::json!({
            "loop": {"block_reason_policy": {"warn": "only_this_warn"}}
        }));
        let policy = resolve_reason_policy(&gates);
        assert!(policy.warn.contains("only_this_warn"));
        assert!(!policy.warn.contains("out_of_scope_warn"));
        // Other classes keep their defaults.
        assert!(policy.hard.contains("plugin_root_missing"));
    }
}
