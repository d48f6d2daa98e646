use crate::output::{print_json, report_errors, EXIT_OK, EXIT_VALIDATION};
use aidd_core::actions::{
    apply_actions, canonicalize_actions, validate_actions, SUPPORTED_ACTION_TYPES,
};
use aidd_core::{active, io, paths, scope};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

fn supported_types() -> Vec<String> {
    SUPPORTED_ACTION_TYPES.iter().map(|t| t.to_string()).collect()
}

pub fn validate(file: &Path) -> anyhow::Result<i32> {
    let payload: Value = io::read_json(file)?;
    let errors = validate_actions(&payload, &supported_types());
    Ok(report_errors("actions", &errors))
}

pub fn apply(
    project: &Path,
    ticket: Option<&str>,
    stage: &str,
    work_item_key: Option<&str>,
    file: Option<&Path>,
    json: bool,
) -> anyhow::Result<i32> {
    let state = active::load_active(project);
    let ticket = match ticket {
        Some(t) => t.to_string(),
        None => state.require_ticket()?.to_string(),
    };
    let key = work_item_key.unwrap_or(state.work_item_key.as_str());
    let scope_key = scope::resolve_scope_key(key, &ticket);

    let actions_file: PathBuf = match file {
        Some(path) => path.to_path_buf(),
        None => paths::actions_path(project, &ticket, &scope_key, stage),
    };
    if !actions_file.exists() {
        eprintln!("actions file not found: {}", actions_file.display());
        return Ok(EXIT_VALIDATION);
    }

    let mut payload: Value = io::read_json(&actions_file)?;
    canonicalize_actions(&mut payload, &ticket, stage, &scope_key, key);
    let errors = validate_actions(&payload, &supported_types());
    if !errors.is_empty() {
        return Ok(report_errors("actions", &errors));
    }

    let report = apply_actions(project, &ticket, &scope_key, stage, &payload)?;
    if json {
        print_json(&json!({
            "applied": report.applied,
            "skipped": report.skipped,
            "errors": report.errors,
            "log_path": paths::rel_path(&report.log_path, project),
        }))?;
    } else {
        println!(
            "actions applied={} skipped={} errors={}",
            report.applied, report.skipped, report.errors
        );
    }
    Ok(if report.errors > 0 { EXIT_VALIDATION } else { EXIT_OK })
}
