use crate::output::{print_json, EXIT_OK};
use aidd_core::events::read_events;
use aidd_core::active;
use serde_json::Value;
use std::path::Path;

pub fn run(
    project: &Path,
    ticket: Option<&str>,
    limit: usize,
    json: bool,
) -> anyhow::Result<i32> {
    let ticket = match ticket {
        Some(t) => t.to_string(),
        None => active::load_active(project).require_ticket()?.to_string(),
    };
    let events = read_events(project, &ticket, limit)?;

    if json {
        print_json(&events)?;
        return Ok(EXIT_OK);
    }
    if events.is_empty() {
        println!("no events for {ticket}");
        return Ok(EXIT_OK);
    }
    for event in &events {
        let ts = event.get("ts").and_then(Value::as_str).unwrap_or("-");
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("-");
        let status = event.get("status").and_then(Value::as_str).unwrap_or("");
        let reason = event.get("reason_code").and_then(Value::as_str).unwrap_or("");
        let mut line = format!("{ts}  {event_type}");
        if !status.is_empty() {
            line.push_str(&format!("  {status}"));
        }
        if !reason.is_empty() {
            line.push_str(&format!("  {reason}"));
        }
        println!("{line}");
    }
    Ok(EXIT_OK)
}
