//! Stage preflight: resolves the work item, builds the loop pack, expands
//! the skill contract into read/write maps and an actions template, and
//! records the outcome as a `stage.preflight.result.json` in the scope slot.
//!
//! Preflight never fails silently: every refusal is a blocked result with a
//! reason code from the closed set below, written to the canonical slot.

use crate::active;
use crate::contract::{self, SkillContract, TemplateContext};
use crate::error::{AiddError, Result};
use crate::io;
use crate::loop_pack;
use crate::paths;
use crate::schema;
use crate::scope;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Blocked reason codes
// ---------------------------------------------------------------------------

pub const BLOCKED_CODES: [&str; 14] = [
    "work_item_key_missing",
    "scope_key_not_canonical",
    "contract_missing",
    "contract_invalid",
    "scope_key_mismatch",
    "artifact_path_mismatch",
    "loop_pack_missing",
    "loop_pack_blocked",
    "loop_pack_payload_invalid",
    "actions_template_invalid",
    "readmap_invalid",
    "writemap_invalid",
    "preflight_result_invalid",
    "preflight_internal_error",
];

#[derive(Debug)]
struct Blocked {
    reason_code: String,
    reason: String,
}

impl Blocked {
    fn new(reason_code: &str, reason: impl Into<String>) -> Self {
        Self { reason_code: reason_code.to_string(), reason: reason.into() }
    }
}

// ---------------------------------------------------------------------------
// Request & outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PreflightRequest {
    pub ticket: String,
    pub stage: String,
    /// Overrides the active-state key when set.
    pub work_item_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PreflightOutcome {
    pub status: String,
    pub reason_code: String,
    pub reason: String,
    pub scope_key: String,
    pub work_item_key: String,
    pub result_path: PathBuf,
    pub artifacts: Vec<String>,
}

impl PreflightOutcome {
    pub fn is_blocked(&self) -> bool {
        self.status == "blocked"
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run preflight for a target stage. The result payload is always written
/// to the canonical slot, blocked or not; only I/O failures surface as Err.
pub fn run_preflight(
    root: &Path,
    plugin_root: &Path,
    request: &PreflightRequest,
) -> Result<PreflightOutcome> {
    let work_item_key = resolve_work_item_key(root, request);
    let scope_key = match &work_item_key {
        Some(key) => scope::resolve_scope_key(key, &request.ticket),
        None => scope::resolve_scope_key("", &request.ticket),
    };

    let planned = match work_item_key {
        Some(key) => plan(root, plugin_root, request, &key, &scope_key),
        None => Err(Blocked::new(
            "work_item_key_missing",
            "no work_item_key provided and none recorded in the active state",
        )),
    };

    match planned {
        Ok(outcome) => Ok(outcome),
        Err(blocked) => write_result(
            root,
            &request.ticket,
            &request.stage,
            &scope_key,
            "",
            "blocked",
            &blocked.reason_code,
            &blocked.reason,
            Vec::new(),
            "",
        ),
    }
}

fn resolve_work_item_key(root: &Path, request: &PreflightRequest) -> Option<String> {
    let raw = match &request.work_item_key {
        Some(key) if !key.trim().is_empty() => key.trim().to_string(),
        _ => active::load_active(root).work_item_key,
    };
    (scope::is_valid_work_item_key(&raw)).then_some(raw)
}

fn plan(
    root: &Path,
    plugin_root: &Path,
    request: &PreflightRequest,
    work_item_key: &str,
    scope_key: &str,
) -> std::result::Result<PreflightOutcome, Blocked> {
    if scope::sanitize_scope_key(scope_key) != scope_key {
        return Err(Blocked::new(
            "scope_key_not_canonical",
            format!("scope key '{scope_key}' is not in canonical form"),
        ));
    }

    // Loop pack first: the runner reads it before anything else.
    let pack = loop_pack::build_loop_pack(root, &request.ticket, Some(work_item_key))
        .map_err(|e| Blocked::new("loop_pack_missing", e.to_string()))?;
    if pack.is_blocked() {
        return Err(Blocked::new("loop_pack_blocked", format!("loop pack blocked: {}", pack.reason)));
    }
    let pack_path = paths::loop_pack_path(root, &request.ticket, scope_key);
    if !pack_path.exists() {
        return Err(Blocked::new(
            "loop_pack_missing",
            format!("loop pack not found at {}", paths::rel_path(&pack_path, root)),
        ));
    }
    let pack_key = loop_pack::pack_work_item_key(&pack_path).ok_or_else(|| {
        Blocked::new("loop_pack_payload_invalid", "loop pack front matter is unreadable")
    })?;
    if pack_key != work_item_key {
        return Err(Blocked::new(
            "scope_key_mismatch",
            format!("loop pack covers '{pack_key}', requested '{work_item_key}'"),
        ));
    }

    // Contract.
    let contract_file = contract::contract_path(plugin_root, &request.stage);
    let skill = contract::load_contract(&contract_file).map_err(|e| match e {
        AiddError::ContractMissing(_) => Blocked::new(
            "contract_missing",
            format!("no contract for stage '{}'", request.stage),
        ),
        other => Blocked::new("contract_invalid", other.to_string()),
    })?;
    let contract_errors = contract::validate_contract_data(&skill);
    if !contract_errors.is_empty() {
        return Err(Blocked::new("contract_invalid", contract_errors.join("; ")));
    }

    let ctx = TemplateContext {
        ticket: request.ticket.clone(),
        scope_key: scope_key.to_string(),
        work_item_key: work_item_key.to_string(),
        stage: request.stage.clone(),
    };

    let outputs = contract::render_items(&skill.outputs, &ctx)
        .map_err(|e| Blocked::new("contract_invalid", e.to_string()))?;
    check_canonical_slots(root, &request.ticket, &request.stage, scope_key, &outputs)?;

    let mut artifacts = Vec::new();
    let loop_allowed = loop_pack::read_loop_allowed_paths(&pack_path);

    let readmap = build_readmap(root, request, scope_key, work_item_key, &skill, &ctx, &pack_path)
        .map_err(|e| Blocked::new("readmap_invalid", e.to_string()))?;
    let writemap =
        build_writemap(request, scope_key, work_item_key, &skill, &ctx, &loop_allowed, &contract_file, plugin_root)
            .map_err(|e| Blocked::new("writemap_invalid", e.to_string()))?;
    let template = build_actions_template(request, scope_key, work_item_key, &skill);

    write_artifact(
        root,
        &paths::readmap_json_path(root, &request.ticket, scope_key),
        |p| io::write_json(p, &readmap),
        "readmap_invalid",
        &mut artifacts,
    )?;
    write_artifact(
        root,
        &paths::readmap_md_path(root, &request.ticket, scope_key),
        |p| io::write_text(p, &render_readmap_md(&readmap)),
        "readmap_invalid",
        &mut artifacts,
    )?;
    write_artifact(
        root,
        &paths::writemap_json_path(root, &request.ticket, scope_key),
        |p| io::write_json(p, &writemap),
        "writemap_invalid",
        &mut artifacts,
    )?;
    write_artifact(
        root,
        &paths::writemap_md_path(root, &request.ticket, scope_key),
        |p| io::write_text(p, &render_writemap_md(&writemap)),
        "writemap_invalid",
        &mut artifacts,
    )?;
    write_artifact(
        root,
        &paths::actions_template_path(root, &request.ticket, scope_key, &request.stage),
        |p| io::write_json(p, &template),
        "actions_template_invalid",
        &mut artifacts,
    )?;
    artifacts.push(paths::rel_path(&pack_path, root));

    write_result(
        root,
        &request.ticket,
        &request.stage,
        scope_key,
        work_item_key,
        "ok",
        "",
        "",
        artifacts,
        &paths::rel_path(&contract_file, plugin_root),
    )
    .map_err(|e| Blocked::new("preflight_internal_error", e.to_string()))
}

fn write_artifact(
    root: &Path,
    path: &Path,
    write: impl FnOnce(&Path) -> Result<()>,
    code: &str,
    artifacts: &mut Vec<String>,
) -> std::result::Result<(), Blocked> {
    write(path).map_err(|e| Blocked::new(code, e.to_string()))?;
    artifacts.push(paths::rel_path(path, root));
    Ok(())
}

// ---------------------------------------------------------------------------
// Canonical slot checks
// ---------------------------------------------------------------------------

/// Any contract output naming a stage result must point at the canonical
/// slot for this scope; anything else would make the result unfindable.
fn check_canonical_slots(
    root: &Path,
    ticket: &str,
    stage: &str,
    scope_key: &str,
    outputs: &[String],
) -> std::result::Result<(), Blocked> {
    let canonical = paths::rel_path(&paths::stage_result_path(root, ticket, scope_key, stage), root);
    let canonical = canonical.strip_prefix("aidd/").unwrap_or(&canonical);
    let marker = format!("stage.{stage}.result.json");
    for output in outputs {
        let normalized = output.strip_prefix("aidd/").unwrap_or(output);
        if normalized.ends_with(&marker) && normalized != canonical {
            return Err(Blocked::new(
                "artifact_path_mismatch",
                format!("stage result output '{output}' must be '{canonical}'"),
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Read map
// ---------------------------------------------------------------------------

/// Split a contract ref into path and selector. Selectors are anchored
/// fragments (`#AIDD:...`) or handoff blocks (`@handoff:...`).
fn split_ref(reference: &str) -> (String, String) {
    if let Some(pos) = reference.find("#AIDD:") {
        return (reference[..pos].to_string(), reference[pos..].to_string());
    }
    if let Some(pos) = reference.find("@handoff:") {
        return (reference[..pos].to_string(), reference[pos..].to_string());
    }
    (reference.to_string(), String::new())
}

fn readmap_entry(reference: &str, required: bool, reason: &str) -> Value {
    let (path, selector) = split_ref(reference);
    json!({
        "ref": reference,
        "path": path,
        "selector": selector,
        "required": required,
        "reason": reason,
    })
}

fn build_readmap(
    root: &Path,
    request: &PreflightRequest,
    scope_key: &str,
    work_item_key: &str,
    skill: &SkillContract,
    ctx: &TemplateContext,
    pack_path: &Path,
) -> Result<Value> {
    let mut entries = Vec::new();
    entries.push(readmap_entry(&paths::rel_path(pack_path, root), true, "loop.pack"));
    for entry in &skill.reads.required {
        let rendered = contract::render_template(entry.reference(), ctx)?;
        entries.push(readmap_entry(&rendered, true, entry.reason().unwrap_or("contract.required")));
    }
    for entry in &skill.reads.optional {
        let rendered = contract::render_template(entry.reference(), ctx)?;
        entries.push(readmap_entry(&rendered, false, entry.reason().unwrap_or("contract.optional")));
    }
    let review_pack = paths::review_pack_path(root, &request.ticket, scope_key);
    if review_pack.exists() {
        entries.push(readmap_entry(&paths::rel_path(&review_pack, root), false, "review.latest"));
    }

    let allowed: Vec<String> = {
        let mut seen = BTreeSet::new();
        entries
            .iter()
            .filter_map(|e| e.get("path").and_then(Value::as_str))
            .filter(|p| !p.is_empty() && seen.insert(p.to_string()))
            .map(str::to_string)
            .collect()
    };

    Ok(json!({
        "schema": schema::READMAP_V1,
        "ticket": request.ticket,
        "stage": request.stage,
        "scope_key": scope_key,
        "work_item_key": work_item_key,
        "generated_at": io::utc_timestamp(),
        "source_contract": format!("skills/{}/CONTRACT.yaml", request.stage),
        "entries": entries,
        "allowed_paths": allowed,
        "loop_allowed_paths": loop_pack::read_loop_allowed_paths(pack_path),
        "always_allow": paths::ALWAYS_ALLOW_REPORTS,
    }))
}

fn render_entries(out: &mut String, entries: &[&Value]) {
    if entries.is_empty() {
        out.push_str("- (none)\n");
        return;
    }
    for entry in entries {
        let path = entry.get("path").and_then(Value::as_str).unwrap_or("");
        let selector = entry.get("selector").and_then(Value::as_str).unwrap_or("");
        let reason = entry.get("reason").and_then(Value::as_str).unwrap_or("");
        if selector.is_empty() {
            out.push_str(&format!("- {path} ({reason})\n"));
        } else {
            out.push_str(&format!("- {path} {selector} ({reason})\n"));
        }
    }
}

pub fn render_readmap_md(readmap: &Value) -> String {
    let ticket = readmap.get("ticket").and_then(Value::as_str).unwrap_or("");
    let stage = readmap.get("stage").and_then(Value::as_str).unwrap_or("");
    let empty = Vec::new();
    let entries = readmap.get("entries").and_then(Value::as_array).unwrap_or(&empty);
    let required: Vec<&Value> = entries
        .iter()
        .filter(|e| e.get("required").and_then(Value::as_bool).unwrap_or(false))
        .collect();
    let optional: Vec<&Value> = entries
        .iter()
        .filter(|e| !e.get("required").and_then(Value::as_bool).unwrap_or(false))
        .collect();

    let mut out = format!("# Read Map\n\n- ticket: {ticket}\n- stage: {stage}\n");
    out.push_str("\n## Required\n");
    render_entries(&mut out, &required);
    out.push_str("\n## Optional\n");
    render_entries(&mut out, &optional);
    out
}

// ---------------------------------------------------------------------------
// Write map
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn build_writemap(
    request: &PreflightRequest,
    scope_key: &str,
    work_item_key: &str,
    skill: &SkillContract,
    ctx: &TemplateContext,
    loop_allowed: &[String],
    contract_file: &Path,
    plugin_root: &Path,
) -> Result<Value> {
    let mut allowed = contract::render_items(&skill.writes.files, ctx)?;
    allowed.extend(contract::render_items(&skill.writes.patterns, ctx)?);
    let allowed = scope::dedupe_preserve_order(allowed);
    for path in &allowed {
        if path.split('/').any(|seg| seg == "..") {
            return Err(AiddError::Validation(format!("write path escapes workspace: {path}")));
        }
    }
    Ok(json!({
        "schema": schema::WRITEMAP_V1,
        "ticket": request.ticket,
        "stage": request.stage,
        "scope_key": scope_key,
        "work_item_key": work_item_key,
        "generated_at": io::utc_timestamp(),
        "source_contract": paths::rel_path(contract_file, plugin_root),
        "allowed_paths": allowed,
        "loop_allowed_paths": loop_allowed,
        "always_allow": paths::ALWAYS_ALLOW_REPORTS,
        "docops_only_paths": contract::render_items(&skill.writes.via.docops_only, ctx)?,
        "write_blocks": contract::render_items(&skill.writes.blocks, ctx)?,
    }))
}

fn render_str_list(out: &mut String, title: &str, paths: &[Value]) {
    out.push_str(&format!("\n## {title}\n"));
    if paths.is_empty() {
        out.push_str("- (none)\n");
        return;
    }
    for path in paths {
        if let Some(s) = path.as_str() {
            out.push_str(&format!("- {s}\n"));
        }
    }
}

pub fn render_writemap_md(writemap: &Value) -> String {
    let ticket = writemap.get("ticket").and_then(Value::as_str).unwrap_or("");
    let stage = writemap.get("stage").and_then(Value::as_str).unwrap_or("");
    let mut out = format!("# Write Map\n\n- ticket: {ticket}\n- stage: {stage}\n");
    let list = |key: &str| -> Vec<Value> {
        writemap.get(key).and_then(Value::as_array).cloned().unwrap_or_default()
    };
    render_str_list(&mut out, "Allowed Paths", &list("allowed_paths"));
    render_str_list(&mut out, "Loop Allowed Paths", &list("loop_allowed_paths"));
    render_str_list(&mut out, "DocOps Only Paths", &list("docops_only_paths"));
    render_str_list(&mut out, "Always Allow", &list("always_allow"));
    out
}

// ---------------------------------------------------------------------------
// Actions template
// ---------------------------------------------------------------------------

fn build_actions_template(
    request: &PreflightRequest,
    scope_key: &str,
    work_item_key: &str,
    skill: &SkillContract,
) -> Value {
    json!({
        "schema_version": schema::ACTIONS_V1,
        "ticket": request.ticket,
        "stage": request.stage,
        "scope_key": scope_key,
        "work_item_key": work_item_key,
        "allowed_action_types": skill.actions.allowed_types,
        "actions": [],
    })
}

// ---------------------------------------------------------------------------
// Preflight result
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn write_result(
    root: &Path,
    ticket: &str,
    target_stage: &str,
    scope_key: &str,
    work_item_key: &str,
    status: &str,
    reason_code: &str,
    reason: &str,
    mut artifacts: Vec<String>,
    contract_rel: &str,
) -> Result<PreflightOutcome> {
    artifacts.sort();
    let result = if status == "ok" { "done" } else { "blocked" };
    let mut payload = json!({
        "schema": schema::STAGE_RESULT_V1,
        "ticket": ticket,
        "stage": "preflight",
        "scope_key": scope_key,
        "work_item_key": work_item_key,
        "result": result,
        "status": status,
        "updated_at": io::utc_timestamp(),
        "details": {
            "preflight_status": status,
            "target_stage": target_stage,
            "contract": contract_rel,
            "artifacts": artifacts,
        },
    });
    if !reason_code.is_empty() {
        payload["reason_code"] = Value::String(reason_code.to_string());
        payload["reason"] = Value::String(reason.to_string());
    }

    let errors = validate_preflight_result(&payload);
    if !errors.is_empty() {
        payload["result"] = Value::String("blocked".to_string());
        payload["status"] = Value::String("blocked".to_string());
        payload["reason_code"] = Value::String("preflight_result_invalid".to_string());
        payload["reason"] = Value::String(errors.join("; "));
    }

    let result_path = paths::stage_result_path(root, ticket, scope_key, "preflight");
    io::write_json(&result_path, &payload)?;

    Ok(PreflightOutcome {
        status: payload["status"].as_str().unwrap_or("blocked").to_string(),
        reason_code: payload.get("reason_code").and_then(Value::as_str).unwrap_or("").to_string(),
        reason: payload.get("reason").and_then(Value::as_str).unwrap_or("").to_string(),
        scope_key: scope_key.to_string(),
        work_item_key: work_item_key.to_string(),
        result_path,
        artifacts,
    })
}

/// Structural validation of a preflight result payload.
pub fn validate_preflight_result(payload: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    schema::check_schema_field(payload, schema::STAGE_RESULT_V1, &mut errors);
    if payload.get("stage").and_then(Value::as_str) != Some("preflight") {
        errors.push("stage: must be 'preflight'".to_string());
    }
    match payload.get("result").and_then(Value::as_str) {
        Some("done") | Some("blocked") => {}
        other => errors.push(format!("result: expected done|blocked, got {other:?}")),
    }
    let details = payload.get("details").unwrap_or(&Value::Null);
    if !details.is_object() {
        errors.push("details: must be an object".to_string());
    } else {
        if details.get("target_stage").and_then(Value::as_str).unwrap_or("").is_empty() {
            errors.push("details.target_stage: missing".to_string());
        }
        if !details.get("artifacts").map(Value::is_array).unwrap_or(false) {
            errors.push("details.artifacts: must be a list".to_string());
        }
    }
    if payload.get("status").and_then(Value::as_str) == Some("blocked") {
        let code = payload.get("reason_code").and_then(Value::as_str).unwrap_or("");
        if !BLOCKED_CODES.contains(&code) {
            errors.push(format!("reason_code: '{code}' not a preflight code"));
        }
    }
    errors
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TASKLIST: &str = "\
## AIDD:ITERATIONS_FULL
- [ ] I1: Wire login flow (iteration_id: I1)
  - Boundaries: src/auth/**
  - Blocking: true

## AIDD:NEXT_3
- [ ] I1: Wire login flow (ref: iteration_id=I1)

## AIDD:PROGRESS_LOG
- (empty)
";

    const CONTRACT: &str = "\
schema: aidd.skill_contract.v1
stage: implement
reads:
  required:
    - aidd/docs/tasklist/{ticket}.md#AIDD:ITERATIONS_FULL
  optional:
    - aidd/docs/prd/{ticket}.md
writes:
  files:
    - aidd/docs/tasklist/{ticket}.md
  via:
    docops_only:
      - aidd/docs/tasklist/{ticket}.md
actions:
  allowed_types:
    - tasklist_ops.set_iteration_done
outputs:
  - aidd/reports/loops/{ticket}/{scope_key}/stage.{stage}.result.json
";

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        plugin: PathBuf,
    }

    fn fixture(contract: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("workspace");
        let plugin = dir.path().join("plugin");
        let tasklist = paths::tasklist_path(&root, "DEMO");
        std::fs::create_dir_all(tasklist.parent().unwrap()).unwrap();
        std::fs::write(&tasklist, TASKLIST).unwrap();
        let contract_file = contract::contract_path(&plugin, "implement");
        std::fs::create_dir_all(contract_file.parent().unwrap()).unwrap();
        std::fs::write(&contract_file, contract).unwrap();
        Fixture { _dir: dir, root, plugin }
    }

    fn request() -> PreflightRequest {
        PreflightRequest {
            ticket: "DEMO".into(),
            stage: "implement".into(),
            work_item_key: Some("iteration_id=I1".into()),
        }
    }

    #[test]
    fn ok_preflight_writes_maps_and_result() {
        let fx = fixture(CONTRACT);
        let outcome = run_preflight(&fx.root, &fx.plugin, &request()).unwrap();
        assert_eq!(outcome.status, "ok", "reason: {}", outcome.reason);
        assert_eq!(outcome.scope_key, "iteration_id_I1");

        let readmap: Value =
            io::read_json(&paths::readmap_json_path(&fx.root, "DEMO", "iteration_id_I1")).unwrap();
        assert_eq!(readmap["schema"], "aidd.readmap.v1");
        let entries = readmap["entries"].as_array().unwrap();
        assert!(entries[0]["path"].as_str().unwrap().ends_with(".loop.pack.md"));
        assert_eq!(entries[1]["selector"], "#AIDD:ITERATIONS_FULL");
        assert_eq!(entries[1]["required"], true);

        let writemap: Value =
            io::read_json(&paths::writemap_json_path(&fx.root, "DEMO", "iteration_id_I1")).unwrap();
        assert_eq!(writemap["loop_allowed_paths"][0], "src/auth/**");
        assert_eq!(writemap["docops_only_paths"][0], "aidd/docs/tasklist/DEMO.md");

        let md = std::fs::read_to_string(paths::writemap_md_path(&fx.root, "DEMO", "iteration_id_I1"))
            .unwrap();
        assert!(md.starts_with("# Write Map"));
        assert!(md.contains("## DocOps Only Paths"));

        let result: Value = io::read_json(&outcome.result_path).unwrap();
        assert_eq!(result["stage"], "preflight");
        assert_eq!(result["result"], "done");
        assert_eq!(result["details"]["target_stage"], "implement");
        let artifacts = result["details"]["artifacts"].as_array().unwrap();
        assert!(!artifacts.is_empty());
        assert!(validate_preflight_result(&result).is_empty());
    }

    #[test]
    fn missing_work_item_key_blocks_to_canonical_slot() {
        let fx = fixture(CONTRACT);
        let req = PreflightRequest { work_item_key: None, ..request() };
        let outcome = run_preflight(&fx.root, &fx.plugin, &req).unwrap();
        assert!(outcome.is_blocked());
        assert_eq!(outcome.reason_code, "work_item_key_missing");

        let result: Value = io::read_json(&outcome.result_path).unwrap();
        assert_eq!(result["result"], "blocked");
        assert_eq!(result["scope_key"], "DEMO");
    }

    #[test]
    fn missing_contract_blocks() {
        let fx = fixture(CONTRACT);
        let req = PreflightRequest { stage: "review".into(), ..request() };
        let outcome = run_preflight(&fx.root, &fx.plugin, &req).unwrap();
        assert!(outcome.is_blocked());
        assert_eq!(outcome.reason_code, "contract_missing");
    }

    #[test]
    fn unknown_placeholder_blocks_as_contract_invalid() {
        let bad = CONTRACT.replace("{ticket}.md#AIDD:ITERATIONS_FULL", "{bogus}.md");
        let fx = fixture(&bad);
        let outcome = run_preflight(&fx.root, &fx.plugin, &request()).unwrap();
        assert!(outcome.is_blocked());
        assert_eq!(outcome.reason_code, "readmap_invalid");
    }

    #[test]
    fn non_canonical_output_slot_blocks() {
        let bad = CONTRACT.replace(
            "aidd/reports/loops/{ticket}/{scope_key}/stage.{stage}.result.json",
            "aidd/reports/loops/{ticket}/stage.{stage}.result.json",
        );
        let fx = fixture(&bad);
        let outcome = run_preflight(&fx.root, &fx.plugin, &request()).unwrap();
        assert!(outcome.is_blocked());
        assert_eq!(outcome.reason_code, "artifact_path_mismatch");
    }

    #[test]
    fn unresolvable_work_item_blocks_loop_pack() {
        let fx = fixture(CONTRACT);
        let req = PreflightRequest { work_item_key: Some("iteration_id=I9".into()), ..request() };
        let outcome = run_preflight(&fx.root, &fx.plugin, &req).unwrap();
        assert!(outcome.is_blocked());
        assert_eq!(outcome.reason_code, "loop_pack_blocked");
    }
}
