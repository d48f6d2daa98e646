use crate::output::{print_json, status_exit_code};
use aidd_core::output_contract::{check_output_contract, ContractRequest, DEFAULT_MAX_READ_ITEMS};
use aidd_core::{active, paths, scope};
use std::path::Path;

#[allow(clippy::too_many_arguments)]
pub fn run(
    project: &Path,
    ticket: Option<&str>,
    stage: &str,
    work_item_key: Option<&str>,
    log: &Path,
    stage_result: Option<&Path>,
    max_read_items: Option<usize>,
    json: bool,
) -> anyhow::Result<i32> {
    let state = active::load_active(project);
    let ticket = match ticket {
        Some(t) => t.to_string(),
        None => state.require_ticket()?.to_string(),
    };
    let key = work_item_key.unwrap_or(state.work_item_key.as_str());
    let scope_key = scope::resolve_scope_key(key, &ticket);

    let request = ContractRequest {
        ticket: &ticket,
        stage,
        scope_key: &scope_key,
        work_item_key: key,
        log_path: log,
        stage_result_path: stage_result,
        max_read_items: max_read_items.unwrap_or(DEFAULT_MAX_READ_ITEMS),
    };
    let verdict = check_output_contract(project, &request)?;
    let status = verdict.get("status").and_then(|v| v.as_str()).unwrap_or("blocked").to_string();

    if json {
        print_json(&verdict)?;
    } else {
        let reason = verdict.get("reason_code").and_then(|v| v.as_str()).unwrap_or("");
        println!("output contract: {status} {reason}");
        if let Some(warnings) = verdict.get("warnings").and_then(|v| v.as_array()) {
            for warning in warnings {
                println!("  warn: {}", warning.as_str().unwrap_or_default());
            }
        }
        if let Some(next) = verdict.get("next_action").and_then(|v| v.as_str()) {
            if !next.is_empty() {
                println!("  next: {next}");
            }
        }
        println!(
            "  report: {}",
            paths::rel_path(&paths::output_contract_path(project, &ticket, &scope_key), project)
        );
    }

    Ok(status_exit_code(&status))
}
