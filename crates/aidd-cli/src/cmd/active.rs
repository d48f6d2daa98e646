use crate::output::{print_json, EXIT_OK, EXIT_VALIDATION};
use aidd_core::{active, paths, stage};
use std::path::Path;

pub fn set_feature(
    project: &Path,
    ticket: &str,
    slug_hint: Option<&str>,
    work_item_key: Option<&str>,
    json: bool,
) -> anyhow::Result<i32> {
    if paths::validate_ticket(ticket).is_err() {
        eprintln!("invalid ticket '{ticket}'");
        return Ok(EXIT_VALIDATION);
    }
    let update = active::ActiveUpdate {
        ticket: Some(ticket.to_string()),
        slug_hint: slug_hint.map(str::to_string),
        work_item_key: work_item_key.map(str::to_string),
        ..Default::default()
    };
    let state = active::update_active(project, &update)?;
    if json {
        print_json(&state)?;
    } else {
        println!("active ticket: {}", state.ticket);
    }
    Ok(EXIT_OK)
}

pub fn set_stage(project: &Path, raw_stage: &str, json: bool) -> anyhow::Result<i32> {
    let Some(resolved) = stage::resolve_stage_name(raw_stage) else {
        eprintln!("invalid stage '{raw_stage}'");
        return Ok(EXIT_VALIDATION);
    };
    let update = active::ActiveUpdate {
        stage: Some(resolved.as_str().to_string()),
        ..Default::default()
    };
    let state = active::update_active(project, &update)?;
    if json {
        print_json(&state)?;
    } else {
        println!("active stage: {}", state.stage);
    }
    Ok(EXIT_OK)
}

pub fn status(project: &Path, json: bool) -> anyhow::Result<i32> {
    let state = active::load_active(project);
    if json {
        print_json(&state)?;
        return Ok(EXIT_OK);
    }
    if state.ticket.is_empty() {
        println!("No active feature. Run: aidd set-active-feature --ticket <ticket>");
        return Ok(EXIT_OK);
    }
    println!("Ticket:    {}", state.ticket);
    if !state.slug_hint.is_empty() {
        println!("Slug hint: {}", state.slug_hint);
    }
    println!("Stage:     {}", if state.stage.is_empty() { "(unset)" } else { &state.stage });
    println!(
        "Work item: {}",
        if state.work_item_key.is_empty() { "(unset)" } else { &state.work_item_key }
    );
    Ok(EXIT_OK)
}
