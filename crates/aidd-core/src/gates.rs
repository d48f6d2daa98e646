//! `config/gates.json` — operator-tunable gate configuration.
//!
//! The file is optional; absence or malformed JSON yields an empty config
//! and every consumer falls back to its defaults.

use crate::paths;
use crate::stage::resolve_stage_name;
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct GatesConfig {
    value: Value,
}

#[derive(Debug, Clone)]
pub struct MemorySliceGate {
    pub mode: String,
    pub stages: Vec<String>,
    pub max_slice_age_minutes: u64,
}

impl GatesConfig {
    pub fn load(root: &Path) -> Self {
        let path = paths::gates_config_path(root);
        let value = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or(Value::Null);
        Self { value }
    }

    pub fn from_value(value: Value) -> Self {
        Self { value }
    }

    fn loop_section(&self) -> &Value {
        self.value.get("loop").unwrap_or(&Value::Null)
    }

    fn memory_section(&self) -> &Value {
        self.value.get("memory").unwrap_or(&Value::Null)
    }

    /// Raw access to a top-level section; `Null` when absent.
    pub fn section(&self, name: &str) -> &Value {
        self.value.get(name).unwrap_or(&Value::Null)
    }

    /// Reason codes for one class under `loop.block_reason_policy`; accepts
    /// a list or a comma/semicolon/space-separated string.
    pub fn loop_block_reason_codes(&self, class: &str) -> Vec<String> {
        let raw = self
            .loop_section()
            .get("block_reason_policy")
            .and_then(|p| p.get(class));
        split_codes(raw)
    }

    pub fn strict_recoverable_reason_codes(&self) -> Vec<String> {
        split_codes(self.loop_section().get("strict_recoverable_reason_codes"))
    }

    pub fn loop_blocked_policy(&self) -> String {
        self.loop_section()
            .get("blocked_policy")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase()
    }

    pub fn auto_repair_from_qa(&self) -> bool {
        truthy(self.loop_section().get("auto_repair_from_qa"))
    }

    pub fn review_pack_v2_required(&self) -> bool {
        truthy(self.value.get("review_pack_v2_required"))
    }

    pub fn hooks_mode(&self) -> String {
        self.value
            .get("hooks_mode")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase()
    }

    /// Memory slice-freshness gate: `{mode, stages, max_slice_age_minutes}`.
    /// Mode is clamped to `off|warn|hard`; stage labels go through the alias
    /// table; unknown labels are dropped.
    pub fn memory_slice_gate(&self) -> MemorySliceGate {
        let memory = self.memory_section();
        let raw_mode = memory
            .get("slice_enforcement")
            .and_then(Value::as_str)
            .unwrap_or("warn")
            .trim()
            .to_ascii_lowercase();
        let mode = if matches!(raw_mode.as_str(), "off" | "warn" | "hard") {
            raw_mode
        } else {
            "warn".to_string()
        };
        let stages = match memory.get("enforce_stages").and_then(Value::as_array) {
            Some(items) => items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(resolve_stage_name)
                .map(|s| s.as_str().to_string())
                .collect(),
            None => ["research", "plan", "review-spec", "implement", "review", "qa"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };
        let max_slice_age_minutes = memory
            .get("max_slice_age_minutes")
            .and_then(Value::as_u64)
            .filter(|v| *v >= 1)
            .unwrap_or(240);
        MemorySliceGate { mode, stages, max_slice_age_minutes }
    }

    /// Per-stage autoslice queries: `memory.stage_queries.<stage>`.
    pub fn stage_queries(&self, stage: &str) -> Vec<String> {
        self.memory_section()
            .get("stage_queries")
            .and_then(|q| q.get(stage))
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
}

fn split_codes(raw: Option<&Value>) -> Vec<String> {
    match raw {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(text)) => text
            .replace([',', ';'], " ")
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn truthy(raw: Option<&Value>) -> bool {
    match raw {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => {
            matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "block" | "strict")
        }
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    }
}
