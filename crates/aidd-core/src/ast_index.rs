//! Adapter for the external `ast-index` symbol search binary.
//!
//! The binary is optional: every failure maps to a reason code so callers
//! can decide between hard-blocking (when `required`) and degrading to a
//! plain-text fallback (`ast_index_fallback_rg`).

use crate::error::Result;
use crate::gates::GatesConfig;
use serde_json::Value;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

pub const REASON_BINARY_MISSING: &str = "ast_index_binary_missing";
pub const REASON_INDEX_MISSING: &str = "ast_index_index_missing";
pub const REASON_TIMEOUT: &str = "ast_index_timeout";
pub const REASON_JSON_INVALID: &str = "ast_index_json_invalid";
pub const REASON_FALLBACK_RG: &str = "ast_index_fallback_rg";

pub const REASON_CODES: [&str; 5] = [
    REASON_BINARY_MISSING,
    REASON_INDEX_MISSING,
    REASON_TIMEOUT,
    REASON_JSON_INVALID,
    REASON_FALLBACK_RG,
];

pub const NORMALIZED_COLS: [&str; 7] =
    ["symbol", "kind", "path", "line", "column", "score", "snippet"];

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AstIndexConfig {
    pub mode: String,
    pub required: bool,
    pub binary: String,
    pub timeout_s: u64,
    pub auto_ensure_index: bool,
    pub max_results: usize,
    pub allow_fallback_rg: bool,
}

impl Default for AstIndexConfig {
    fn default() -> Self {
        Self {
            mode: "auto".to_string(),
            required: false,
            binary: "ast-index".to_string(),
            timeout_s: 8,
            auto_ensure_index: true,
            max_results: 200,
            allow_fallback_rg: true,
        }
    }
}

impl AstIndexConfig {
    /// Read the `ast_index` section of the gates config. `mode: required`
    /// forces the required flag on; `mode: off` forces it off.
    pub fn load(root: &Path) -> Self {
        Self::from_gates(&GatesConfig::load(root))
    }

    pub fn from_gates(gates: &GatesConfig) -> Self {
        let section = gates.section("ast_index");
        let defaults = Self::default();
        let mut mode = section
            .get("mode")
            .and_then(Value::as_str)
            .unwrap_or(&defaults.mode)
            .trim()
            .to_ascii_lowercase();
        if !matches!(mode.as_str(), "off" | "auto" | "required") {
            mode = "auto".to_string();
        }
        let mut required =
            section.get("required").and_then(Value::as_bool).unwrap_or(defaults.required);
        if mode == "required" {
            required = true;
        }
        if mode == "off" {
            required = false;
        }
        Self {
            mode,
            required,
            binary: section
                .get("binary")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .unwrap_or(&defaults.binary)
                .to_string(),
            timeout_s: section
                .get("timeout_s")
                .and_then(Value::as_u64)
                .filter(|v| *v >= 1)
                .unwrap_or(defaults.timeout_s),
            auto_ensure_index: section
                .get("auto_ensure_index")
                .and_then(Value::as_bool)
                .unwrap_or(defaults.auto_ensure_index),
            max_results: section
                .get("max_results")
                .and_then(Value::as_u64)
                .filter(|v| *v >= 1)
                .map(|v| v as usize)
                .unwrap_or(defaults.max_results),
            allow_fallback_rg: section
                .get("allow_fallback_rg")
                .and_then(Value::as_bool)
                .unwrap_or(defaults.allow_fallback_rg),
        }
    }

    /// The adapter is enforced when the gate says so and the mode is on.
    pub fn enforced(&self) -> bool {
        self.required && self.mode != "off"
    }

    fn fallback_reason(&self, reason_code: &str) -> String {
        if self.allow_fallback_rg && !reason_code.is_empty() {
            REASON_FALLBACK_RG.to_string()
        } else {
            String::new()
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct AstIndexOutcome {
    pub ok: bool,
    pub reason_code: String,
    pub fallback_reason_code: String,
    pub binary_path: String,
    pub index_ready: bool,
    pub payload: Option<Value>,
    pub normalized: Vec<Value>,
    pub stdout: String,
    pub stderr: String,
}

fn run_with_timeout(
    binary: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> Result<(bool, String, String, bool)> {
    let mut child = Command::new(binary)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            let mut stdout = String::new();
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stdout.take() {
                pipe.read_to_string(&mut stdout)?;
            }
            if let Some(mut pipe) = child.stderr.take() {
                pipe.read_to_string(&mut stderr)?;
            }
            return Ok((status.success(), stdout, stderr, false));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok((false, String::new(), String::new(), true));
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

fn command_outcome(
    config: &AstIndexConfig,
    binary: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> AstIndexOutcome {
    let mut outcome = AstIndexOutcome { binary_path: binary.to_string(), ..Default::default() };
    match run_with_timeout(binary, args, cwd, timeout) {
        Ok((success, stdout, stderr, timed_out)) => {
            outcome.ok = success;
            outcome.stdout = stdout;
            outcome.stderr = stderr;
            if timed_out {
                outcome.reason_code = REASON_TIMEOUT.to_string();
            } else if !success {
                outcome.reason_code = REASON_INDEX_MISSING.to_string();
            }
        }
        Err(_) => {
            outcome.reason_code = REASON_BINARY_MISSING.to_string();
        }
    }
    if !outcome.ok {
        outcome.fallback_reason_code = config.fallback_reason(&outcome.reason_code);
    }
    outcome
}

fn parse_json_payload(config: &AstIndexConfig, mut outcome: AstIndexOutcome) -> AstIndexOutcome {
    if !outcome.ok {
        return outcome;
    }
    match serde_json::from_str::<Value>(outcome.stdout.trim()) {
        Ok(payload) => outcome.payload = Some(payload),
        Err(_) => {
            outcome.ok = false;
            outcome.reason_code = REASON_JSON_INVALID.to_string();
            outcome.fallback_reason_code = config.fallback_reason(REASON_JSON_INVALID);
        }
    }
    outcome
}

/// Locate the configured binary on PATH.
pub fn detect(config: &AstIndexConfig) -> AstIndexOutcome {
    if config.mode == "off" {
        return AstIndexOutcome::default();
    }
    match which::which(&config.binary) {
        Ok(path) => AstIndexOutcome {
            ok: true,
            binary_path: path.display().to_string(),
            ..Default::default()
        },
        Err(_) => AstIndexOutcome {
            reason_code: REASON_BINARY_MISSING.to_string(),
            fallback_reason_code: config.fallback_reason(REASON_BINARY_MISSING),
            ..Default::default()
        },
    }
}

/// Probe the index with `stats --format json`, rebuilding once when the
/// config allows it.
pub fn ensure_index(workspace: &Path, config: &AstIndexConfig) -> AstIndexOutcome {
    let detection = detect(config);
    if !detection.ok {
        return detection;
    }
    let binary = detection.binary_path;
    let timeout = Duration::from_secs(config.timeout_s);

    let stats = parse_json_payload(
        config,
        command_outcome(config, &binary, &["stats", "--format", "json"], workspace, timeout),
    );
    if stats.ok {
        return AstIndexOutcome { index_ready: true, binary_path: binary, ..stats };
    }
    if stats.reason_code == REASON_TIMEOUT || stats.reason_code == REASON_JSON_INVALID {
        return AstIndexOutcome { binary_path: binary, ..stats };
    }
    if !config.auto_ensure_index {
        return AstIndexOutcome { binary_path: binary, ..stats };
    }

    let rebuild = command_outcome(
        config,
        &binary,
        &["rebuild"],
        workspace,
        Duration::from_secs((config.timeout_s * 4).max(30)),
    );
    if !rebuild.ok {
        return AstIndexOutcome { binary_path: binary, ..rebuild };
    }
    let retry = parse_json_payload(
        config,
        command_outcome(config, &binary, &["stats", "--format", "json"], workspace, timeout),
    );
    AstIndexOutcome { index_ready: retry.ok, binary_path: binary, ..retry }
}

/// Run a query subcommand and normalize its JSON output.
pub fn run_query(workspace: &Path, config: &AstIndexConfig, args: &[&str]) -> AstIndexOutcome {
    let ensured = ensure_index(workspace, config);
    if !ensured.ok {
        return ensured;
    }
    let binary = ensured.binary_path.clone();
    let mut full_args: Vec<&str> = args.to_vec();
    if !args.contains(&"--format") {
        full_args.extend(["--format", "json"]);
    }
    let timeout = Duration::from_secs(config.timeout_s);
    let mut outcome = parse_json_payload(
        config,
        command_outcome(config, &binary, &full_args, workspace, timeout),
    );
    if outcome.ok {
        if let Some(payload) = outcome.payload.as_ref() {
            outcome.normalized = normalize(payload, config.max_results);
        }
        outcome.index_ready = true;
    }
    outcome
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

fn first_text(item: &Value, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|k| item.get(k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_default()
}

fn as_int(value: Option<&Value>) -> i64 {
    value.and_then(Value::as_i64).unwrap_or(0)
}

fn as_float(value: Option<&Value>) -> f64 {
    value.and_then(Value::as_f64).unwrap_or(0.0)
}

fn extract_records(payload: &Value) -> Vec<Value> {
    if let Some(list) = payload.as_array() {
        return list.clone();
    }
    if let Some(map) = payload.as_object() {
        for key in ["results", "items", "matches", "symbols", "data", "rows"] {
            if let Some(list) = map.get(key).and_then(Value::as_array) {
                return list.clone();
            }
        }
        return vec![payload.clone()];
    }
    Vec::new()
}

/// Flatten whatever shape the binary emitted into the canonical row layout,
/// ordered by `(score desc, path, line, symbol)` and capped at `max_results`.
pub fn normalize(payload: &Value, max_results: usize) -> Vec<Value> {
    let mut rows: Vec<(String, String, String, i64, i64, f64, String)> = Vec::new();
    for item in extract_records(payload) {
        let row = if item.is_object() {
            (
                first_text(&item, &["symbol", "name", "title", "identifier", "id"]),
                first_text(&item, &["kind", "type", "symbol_kind", "node_kind"]),
                first_text(&item, &["path", "file", "file_path", "source_path", "uri", "module"]),
                as_int(item.get("line").or_else(|| item.get("line_start"))),
                as_int(item.get("column").or_else(|| item.get("col"))),
                as_float(item.get("score").or_else(|| item.get("rank"))),
                first_text(&item, &["snippet", "context", "extract", "line_text", "text"]),
            )
        } else {
            let symbol = item.as_str().unwrap_or_default().trim().to_string();
            (symbol, String::new(), String::new(), 0, 0, 0.0, String::new())
        };
        if row.0.is_empty() && row.2.is_empty() {
            continue;
        }
        rows.push(row);
    }
    rows.sort_by(|a, b| {
        b.5.partial_cmp(&a.5)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.2.cmp(&b.2))
            .then_with(|| a.3.cmp(&b.3))
            .then_with(|| a.0.cmp(&b.0))
    });
    rows.truncate(max_results.max(1));
    rows.into_iter()
        .map(|(symbol, kind, path, line, column, score, snippet)| {
            serde_json::json!([symbol, kind, path, line, column, score, snippet])
        })
        .collect()
}

/// Operator hint for recovering from a given failure reason.
pub fn next_action(ticket: &str, reason_code: &str) -> String {
    match reason_code.trim().to_ascii_lowercase().as_str() {
        r if r == REASON_BINARY_MISSING => {
            "Install ast-index and run `ast-index rebuild` in the workspace root.".to_string()
        }
        r if r == REASON_INDEX_MISSING => {
            "Run `ast-index rebuild` in the workspace root and rerun the stage.".to_string()
        }
        r if r == REASON_TIMEOUT => format!(
            "Rerun `aidd research --ticket {ticket} --auto` after increasing ast_index.timeout_s."
        ),
        r if r == REASON_JSON_INVALID => {
            "Update ast-index to a version that supports `--format json` and rebuild the index."
                .to_string()
        }
        _ => format!("aidd research --ticket {ticket} --auto"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_mode_overrides_required() {
        let gates = GatesConfig::from_value(json!({
            "ast_index": { "mode": "required" }
        }));
        assert!(AstIndexConfig::from_gates(&gates).required);

        let gates = GatesConfig::from_value(json!({
            "ast_index": { "mode": "off", "required": true }
        }));
        let config = AstIndexConfig::from_gates(&gates);
        assert!(!config.required);
        assert!(!config.enforced());
    }

    #[test]
    fn missing_binary_sets_reason_and_fallback() {
        let config = AstIndexConfig {
            binary: "definitely-not-a-real-binary-name".to_string(),
            ..Default::default()
        };
        let outcome = detect(&config);
        assert!(!outcome.ok);
        assert_eq!(outcome.reason_code, REASON_BINARY_MISSING);
        assert_eq!(outcome.fallback_reason_code, REASON_FALLBACK_RG);
    }

    #[test]
    fn normalize_handles_aliased_keys_and_orders_by_score() {
        let payload = json!({
            "results": [
                {"name": "beta", "file": "src/b.rs", "line": 4, "score": 0.2},
                {"symbol": "alpha", "path": "src/a.rs", "line_start": 10, "rank": 0.9,
                 "snippet": "fn alpha()"},
                {"kind": "comment"},
            ]
        });
        let rows = normalize(&payload, 10);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], "alpha");
        assert_eq!(rows[0][2], "src/a.rs");
        assert_eq!(rows[0][3], 10);
        assert_eq!(rows[1][0], "beta");
    }

    #[test]
    fn normalize_caps_results() {
        let items: Vec<Value> =
            (0..20).map(|i| json!({"symbol": format!("s{i:02}"), "path": "p"})).collect();
        let rows = normalize(&json!(items), 5);
        assert_eq!(rows.len(), 5);
    }

    #[test]
    fn next_action_names_the_recovery_step() {
        assert!(next_action("T-1", REASON_BINARY_MISSING).contains("Install"));
        assert!(next_action("T-1", REASON_TIMEOUT).contains("timeout_s"));
        assert!(next_action("T-1", "other").contains("aidd research"));
    }
}
