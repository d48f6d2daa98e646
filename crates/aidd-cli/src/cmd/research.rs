use crate::output::{print_json, EXIT_OK};
use aidd_core::research::run_research;
use aidd_core::{active, paths};
use serde_json::json;
use std::path::Path;

pub fn run(
    workspace: &Path,
    project: &Path,
    ticket: Option<&str>,
    slug_hint: Option<&str>,
    extra_paths: &[String],
    extra_keywords: &[String],
    limit: usize,
    json: bool,
) -> anyhow::Result<i32> {
    let state = active::load_active(project);
    let ticket = match ticket {
        Some(t) => t.to_string(),
        None => state.require_ticket()?.to_string(),
    };
    let slug_hint = slug_hint.unwrap_or(state.slug_hint.as_str());

    let outcome = run_research(
        project,
        workspace,
        &ticket,
        slug_hint,
        extra_paths,
        extra_keywords,
        limit,
    )?;

    if json {
        print_json(&json!({
            "ticket": ticket,
            "targets_path": paths::rel_path(&outcome.targets_path, project),
            "context_path": paths::rel_path(&outcome.context_path, project),
            "match_count": outcome.match_count,
        }))?;
    } else {
        println!("research: {} matches", outcome.match_count);
        println!("  {}", paths::rel_path(&outcome.targets_path, project));
        println!("  {}", paths::rel_path(&outcome.context_path, project));
    }
    Ok(EXIT_OK)
}
