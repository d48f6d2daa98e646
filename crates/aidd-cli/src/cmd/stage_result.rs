use crate::output::{print_json, status_exit_code, EXIT_VALIDATION};
use aidd_core::stage_result::{effective_stage_result, load_stage_result};
use aidd_core::{active, paths, scope};
use serde_json::json;
use std::path::Path;

pub fn run(
    project: &Path,
    ticket: Option<&str>,
    stage: &str,
    work_item_key: Option<&str>,
    json: bool,
) -> anyhow::Result<i32> {
    let state = active::load_active(project);
    let ticket = match ticket {
        Some(t) => t.to_string(),
        None => state.require_ticket()?.to_string(),
    };
    let key = work_item_key.unwrap_or(state.work_item_key.as_str());
    let scope_key = scope::resolve_scope_key(key, &ticket);

    let loaded = load_stage_result(project, &ticket, &scope_key, stage, None)?;
    let Some(payload) = &loaded.payload else {
        if json {
            print_json(&json!({
                "result": "blocked",
                "reason_code": loaded.reason_code,
                "path": paths::rel_path(&loaded.path, project),
                "diagnostics": loaded.diagnostics,
            }))?;
        } else {
            eprintln!(
                "stage result unavailable: {} ({})",
                loaded.reason_code,
                loaded.path.display()
            );
        }
        return Ok(EXIT_VALIDATION);
    };

    let result = effective_stage_result(payload);
    if json {
        print_json(payload)?;
    } else {
        println!("stage {stage}: {result} ({})", paths::rel_path(&loaded.path, project));
    }
    Ok(status_exit_code(&result))
}
