use crate::output::{print_json, report_errors, status_exit_code, EXIT_OK};
use aidd_core::gates::GatesConfig;
use aidd_core::memory::{
    self, autoslice, decisions, semantic, slice, verify, DecisionsLimits, SemanticLimits,
    SliceLimits,
};
use aidd_core::{active, io, paths};
use serde_json::{json, Value};
use std::path::Path;

fn resolve_ticket(project: &Path, ticket: Option<&str>) -> anyhow::Result<String> {
    match ticket {
        Some(t) => Ok(t.to_string()),
        None => Ok(active::load_active(project).require_ticket()?.to_string()),
    }
}

pub fn extract(
    project: &Path,
    ticket: Option<&str>,
    slug_hint: Option<&str>,
    json: bool,
) -> anyhow::Result<i32> {
    let ticket = resolve_ticket(project, ticket)?;
    let state = active::load_active(project);
    let slug_hint = slug_hint.unwrap_or(state.slug_hint.as_str());

    let payload = semantic::extract(project, &ticket, slug_hint, &SemanticLimits::default())?;
    let path = memory::semantic_pack_path(project, &ticket);
    if json {
        print_json(&payload)?;
    } else {
        println!("memory extract: {}", paths::rel_path(&path, project));
    }
    Ok(EXIT_OK)
}

pub fn pack(project: &Path, ticket: Option<&str>, json: bool) -> anyhow::Result<i32> {
    let ticket = resolve_ticket(project, ticket)?;
    let payload = decisions::build_pack(project, &ticket, &DecisionsLimits::default())?;
    let path = memory::decisions_pack_path(project, &ticket);
    if json {
        print_json(&payload)?;
    } else {
        println!("decisions pack: {}", paths::rel_path(&path, project));
    }
    Ok(EXIT_OK)
}

pub fn slice(
    project: &Path,
    ticket: Option<&str>,
    query: &str,
    stage: Option<&str>,
    scope_key: Option<&str>,
    json: bool,
) -> anyhow::Result<i32> {
    let ticket = resolve_ticket(project, ticket)?;
    let outcome = slice::build_slice(project, &ticket, query, stage, scope_key, &SliceLimits::default())?;
    if json {
        print_json(&json!({
            "ticket": ticket,
            "query": query,
            "hits": outcome.hits,
            "slice_path": paths::rel_path(&outcome.slice_path, project),
            "latest_path": paths::rel_path(&outcome.latest_path, project),
            "manifest_path": outcome
                .manifest_path
                .as_deref()
                .map(|p| paths::rel_path(p, project)),
        }))?;
    } else {
        println!("memory slice '{query}': {} hits", outcome.hits);
        println!("  {}", paths::rel_path(&outcome.slice_path, project));
    }
    Ok(EXIT_OK)
}

pub fn autoslice(
    project: &Path,
    ticket: Option<&str>,
    stage: &str,
    scope_key: Option<&str>,
    json: bool,
) -> anyhow::Result<i32> {
    let ticket = resolve_ticket(project, ticket)?;
    let state = active::load_active(project);
    let scope_key = match scope_key {
        Some(key) => key.to_string(),
        None => aidd_core::scope::resolve_scope_key(&state.work_item_key, &ticket),
    };

    let gates = GatesConfig::load(project);
    let outcome = autoslice::run_autoslice(
        project,
        &ticket,
        stage,
        &scope_key,
        &gates,
        &SliceLimits::default(),
    )?;

    if json {
        print_json(&outcome.to_json(&ticket, stage, &scope_key))?;
    } else if outcome.is_blocked() {
        eprintln!("memory autoslice blocked: {}", outcome.reason_code);
    } else {
        println!(
            "memory autoslice: {} hits across {} queries -> {}",
            outcome.total_hits,
            outcome.queries.len(),
            paths::rel_path(&outcome.manifest_path, project)
        );
    }
    Ok(status_exit_code(&outcome.status))
}

pub fn verify(project: &Path, ticket: Option<&str>) -> anyhow::Result<i32> {
    let ticket = resolve_ticket(project, ticket)?;
    let limits = SemanticLimits::default();
    let mut errors = Vec::new();

    let pack_path = memory::semantic_pack_path(project, &ticket);
    if pack_path.exists() {
        let payload: Value = io::read_json(&pack_path)?;
        errors.extend(verify::validate_memory_data(&payload, limits.max_chars, limits.max_lines));
    }

    let log_path = memory::decisions_log_path(project, &ticket);
    if log_path.exists() {
        errors.extend(verify::validate_decision_log(&log_path));
    }

    if errors.is_empty() {
        println!("memory verify: ok");
    }
    Ok(report_errors("memory", &errors))
}

#[allow(clippy::too_many_arguments)]
pub fn decision_append(
    project: &Path,
    ticket: Option<&str>,
    topic: &str,
    decision: &str,
    rationale: Option<&str>,
    alternatives: &[String],
    status: Option<&str>,
    supersedes: Option<&str>,
    stage: Option<&str>,
    scope_key: Option<&str>,
    json: bool,
) -> anyhow::Result<i32> {
    let ticket = resolve_ticket(project, ticket)?;
    let input = decisions::DecisionInput {
        topic: topic.to_string(),
        decision: decision.to_string(),
        decision_id: String::new(),
        alternatives: alternatives.to_vec(),
        rationale: rationale.unwrap_or_default().to_string(),
        status: status.unwrap_or("active").to_string(),
        supersedes: supersedes.unwrap_or_default().to_string(),
        source_path: String::new(),
        scope_key: scope_key.unwrap_or_default().to_string(),
        stage: stage.unwrap_or_default().to_string(),
    };
    let entry = decisions::append_decision(project, &ticket, &input)?;
    if json {
        print_json(&entry)?;
    } else {
        let id = entry.get("decision_id").and_then(Value::as_str).unwrap_or("");
        println!("decision appended: {id}");
    }
    Ok(EXIT_OK)
}
