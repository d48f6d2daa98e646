use crate::output::{print_json, EXIT_BLOCKED, EXIT_OK, EXIT_VALIDATION};
use aidd_core::preflight::{run_preflight, PreflightRequest};
use aidd_core::{active, paths, scope};
use serde_json::json;
use std::path::Path;

#[allow(clippy::too_many_arguments)]
pub fn run(
    project: &Path,
    ticket: Option<&str>,
    stage: &str,
    work_item_key: Option<&str>,
    scope_key: Option<&str>,
    json: bool,
) -> anyhow::Result<i32> {
    let state = active::load_active(project);
    let ticket = match ticket {
        Some(t) => t.to_string(),
        None => state.require_ticket()?.to_string(),
    };

    // An explicit scope key must agree with the canonical one before any
    // artifact is written.
    if let Some(requested) = scope_key {
        let key = work_item_key.unwrap_or(state.work_item_key.as_str());
        let canonical = scope::resolve_scope_key(key, &ticket);
        if requested != canonical {
            let verdict = json!({
                "result": "blocked",
                "reason_code": "scope_key_not_canonical",
                "reason": format!("scope key '{requested}' does not match canonical '{canonical}'"),
                "ticket": ticket,
                "stage": stage,
            });
            print_json(&verdict)?;
            return Ok(EXIT_VALIDATION);
        }
    }

    let plugin_root = match paths::require_plugin_root() {
        Ok(root) => root,
        Err(err) => {
            let verdict = json!({
                "result": "blocked",
                "reason_code": "plugin_root_missing",
                "reason": err.to_string(),
            });
            print_json(&verdict)?;
            return Ok(EXIT_BLOCKED);
        }
    };

    let request = PreflightRequest {
        ticket,
        stage: stage.to_string(),
        work_item_key: work_item_key.map(str::to_string),
    };
    let outcome = run_preflight(project, &plugin_root, &request)?;

    if json {
        print_json(&json!({
            "result": outcome.status,
            "reason_code": outcome.reason_code,
            "reason": outcome.reason,
            "scope_key": outcome.scope_key,
            "work_item_key": outcome.work_item_key,
            "result_path": paths::rel_path(&outcome.result_path, project),
            "artifacts": outcome.artifacts,
        }))?;
    } else if outcome.is_blocked() {
        eprintln!("preflight blocked: {} ({})", outcome.reason, outcome.reason_code);
    } else {
        println!("preflight ok: scope {}", outcome.scope_key);
        for artifact in &outcome.artifacts {
            println!("  {artifact}");
        }
    }

    Ok(if outcome.is_blocked() { EXIT_VALIDATION } else { EXIT_OK })
}
