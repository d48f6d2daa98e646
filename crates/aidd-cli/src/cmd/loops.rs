//! Loop driver: resolve the stage to run, supervise the runner, interpret
//! the stage result, and classify the outcome.
//!
//! One `loop-step` invocation runs exactly one stage. The transition table:
//! implement done/continue -> review, review continue -> implement, review
//! done -> loop finished. A blocked QA result can be repaired into a fresh
//! implement pass over the first blocking handoff task.

use crate::output::{print_json, EXIT_BLOCKED, EXIT_CONTINUE, EXIT_OK, EXIT_RUNTIME};
use aidd_core::events::{append_event, Event};
use aidd_core::gates::GatesConfig;
use aidd_core::lock::ScopeLock;
use aidd_core::output_contract::{check_output_contract, ContractRequest, DEFAULT_MAX_READ_ITEMS};
use aidd_core::policy::classify_block_reason;
use aidd_core::stage_result::{effective_stage_result, load_stage_result, ResultWindow};
use aidd_core::{active, actions, docops, io, loop_pack, paths, schema, scope, AiddError};
use aidd_runner::{launch, RunnerSpec, StreamMode};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::SystemTime;

const QUESTION_REASON_CODES: [&str; 6] = [
    "answers_required",
    "missing_answers",
    "questions_pending",
    "missing_spec_answers",
    "spec_questions_unresolved",
    "prompt_flow_blocker",
];

const LOG_EXCERPT_BYTES: usize = 64 * 1024;
const DEFAULT_LOOP_RUN_ITERATIONS: usize = 25;

#[derive(Debug, Clone, Copy, Default)]
pub struct LoopOptions<'a> {
    pub ticket: Option<&'a str>,
    pub runner: Option<&'a str>,
    pub from_qa: Option<&'a str>,
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Question retry
// ---------------------------------------------------------------------------

fn question_prompt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(?:question|answer|aidd:answers)\b").unwrap())
}

fn question_reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(?:Q|Question\s*)(\d+)").unwrap())
}

fn default_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bDefault\s*:\s*([A-Za-z0-9]+)").unwrap())
}

fn is_question_retry_candidate(reason_code: &str, material: &str) -> bool {
    let code = reason_code.trim().to_ascii_lowercase();
    if QUESTION_REASON_CODES.contains(&code.as_str()) {
        return true;
    }
    if material.is_empty() || !question_prompt_re().is_match(material) {
        return false;
    }
    question_reference_re().is_match(material) || material.to_ascii_lowercase().contains("aidd:answers")
}

/// Build a compact `AIDD:ANSWERS Q1=B; Q2=C` payload from documented
/// defaults. Unnumbered defaults fill sequential slots; numbered questions
/// bind the following `Default:` marker to their slot.
fn build_compact_answers(material: &str) -> String {
    let mut answers: BTreeMap<u32, String> = BTreeMap::new();
    let mut current_question: Option<u32> = None;
    let mut next_sequential: u32 = 1;

    for line in material.lines() {
        if let Some(caps) = question_reference_re().captures(line) {
            if let Ok(number) = caps[1].parse::<u32>() {
                current_question = Some(number);
            }
        }
        if let Some(caps) = default_marker_re().captures(line) {
            let slot = match current_question.take() {
                Some(number) => number,
                None => {
                    while answers.contains_key(&next_sequential) {
                        next_sequential += 1;
                    }
                    next_sequential
                }
            };
            answers.entry(slot).or_insert_with(|| caps[1].to_ascii_uppercase());
        }
    }

    if answers.is_empty() {
        return String::new();
    }
    let parts: Vec<String> =
        answers.iter().map(|(number, letter)| format!("Q{number}={letter}")).collect();
    format!("AIDD:ANSWERS {}", parts.join("; "))
}

fn log_excerpt(path: &Path) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::new();
    };
    if content.len() <= LOG_EXCERPT_BYTES {
        return content;
    }
    let start = content.len() - LOG_EXCERPT_BYTES;
    let boundary = (start..content.len()).find(|i| content.is_char_boundary(*i)).unwrap_or(start);
    content[boundary..].to_string()
}

fn question_material(payload: Option<&Value>, reason: &str, reason_code: &str, log_path: &Path) -> String {
    let mut chunks: Vec<String> = Vec::new();
    if !reason.is_empty() {
        chunks.push(reason.to_string());
    }
    if !reason_code.is_empty() {
        chunks.push(format!("reason_code={reason_code}"));
    }
    if let Some(payload) = payload {
        for key in ["questions", "question", "details", "hint", "next_action"] {
            match payload.get(key) {
                Some(Value::Array(items)) => {
                    chunks.extend(items.iter().filter_map(Value::as_str).map(str::to_string));
                }
                Some(Value::String(text)) if !text.trim().is_empty() => chunks.push(text.clone()),
                _ => {}
            }
        }
    }
    let excerpt = log_excerpt(log_path);
    if !excerpt.is_empty() {
        chunks.push(excerpt);
    }
    chunks.retain(|chunk| !chunk.trim().is_empty());
    chunks.join("\n")
}

// ---------------------------------------------------------------------------
// Stage planning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum StepPlan {
    Run(String),
    Done,
}

/// Decide what this step should do, from the active stage and the previous
/// result (if any) of that stage at the current scope.
fn plan_step(active_stage: &str, previous_result: Option<&str>) -> StepPlan {
    let stage = match active_stage {
        "implement" | "review" | "qa" => active_stage,
        _ => return StepPlan::Run("implement".to_string()),
    };
    let Some(result) = previous_result else {
        return StepPlan::Run(stage.to_string());
    };
    match (stage, result) {
        ("implement", "done") | ("implement", "continue") => StepPlan::Run("review".to_string()),
        ("review", "done") => StepPlan::Done,
        ("review", "continue") => StepPlan::Run("implement".to_string()),
        ("qa", "done") => StepPlan::Done,
        // blocked results re-run the same stage
        _ => StepPlan::Run(stage.to_string()),
    }
}

fn runner_is_claude(token: &str) -> bool {
    Path::new(token)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_ascii_lowercase().contains("claude"))
        .unwrap_or(false)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| !v.trim().is_empty() && v.trim() != "0").unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Verdict plumbing
// ---------------------------------------------------------------------------

struct StepVerdict {
    status: String,
    reason_code: String,
    reason: String,
    stage: String,
    scope_key: String,
    exit_code: i32,
}

impl StepVerdict {
    fn blocked(stage: &str, scope_key: &str, reason_code: &str, reason: &str) -> Self {
        Self {
            status: "blocked".to_string(),
            reason_code: reason_code.to_string(),
            reason: reason.to_string(),
            stage: stage.to_string(),
            scope_key: scope_key.to_string(),
            exit_code: EXIT_BLOCKED,
        }
    }

    fn finish(
        self,
        project: &Path,
        ticket: &str,
        extra_details: Value,
        json: bool,
    ) -> anyhow::Result<i32> {
        let mut details = json!({
            "stage": self.stage,
            "scope_key": self.scope_key,
            "reason_code": self.reason_code,
            "exit_code": self.exit_code,
        });
        if let (Some(target), Some(source)) =
            (details.as_object_mut(), extra_details.as_object())
        {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        let event = Event::new("loop-step").status(&self.status).details(details);
        append_event(project, ticket, event)?;

        if json {
            print_json(&json!({
                "status": self.status,
                "stage": self.stage,
                "scope_key": self.scope_key,
                "reason_code": self.reason_code,
                "reason": self.reason,
                "exit_code": self.exit_code,
            }))?;
        } else if self.status == "blocked" {
            eprintln!(
                "loop-step blocked at {}: {} ({})",
                self.stage, self.reason, self.reason_code
            );
        } else {
            println!("loop-step {}: {}", self.stage, self.status);
        }
        Ok(self.exit_code)
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

pub fn step(workspace: &Path, project: &Path, opts: LoopOptions<'_>) -> anyhow::Result<i32> {
    let state = active::load_active(project);
    let ticket = match opts.ticket {
        Some(t) => t.to_string(),
        None => state.require_ticket()?.to_string(),
    };
    let gates = GatesConfig::load(project);

    // Stage to run, from the active stage and its last recorded result.
    let active_stage = state.stage.clone();
    let previous_scope = if active_stage == "qa" {
        scope::qa_scope_key(&ticket)
    } else {
        scope::resolve_scope_key(&state.work_item_key, &ticket)
    };
    let previous_result = if active_stage.is_empty() {
        None
    } else {
        load_stage_result(project, &ticket, &previous_scope, &active_stage, None)
            .ok()
            .and_then(|loaded| loaded.payload)
            .map(|payload| effective_stage_result(&payload))
    };

    // QA repair: a blocked QA result hands the first blocking handoff task
    // back to implement.
    let from_qa = opts.from_qa.map(str::to_string).unwrap_or_else(|| {
        if gates.auto_repair_from_qa() { "auto".to_string() } else { "off".to_string() }
    });
    if active_stage == "qa" && previous_result.as_deref() == Some("blocked") && from_qa != "off" {
        let tasklist = paths::tasklist_path(project, &ticket);
        let text = std::fs::read_to_string(&tasklist).unwrap_or_default();
        let Some((repair_key, label)) = docops::qa_handoff_candidates(&text).into_iter().next()
        else {
            return StepVerdict::blocked(
                "qa",
                &previous_scope,
                "qa_repair_no_candidates",
                "QA is blocked but the tasklist has no blocking handoff items",
            )
            .finish(project, &ticket, json!({}), opts.json);
        };
        active::update_active(
            project,
            &active::ActiveUpdate {
                stage: Some("implement".to_string()),
                work_item_key: Some(repair_key.clone()),
                ..Default::default()
            },
        )?;
        let event = Event::new("loop-step").status("warn").details(json!({
            "stage": "qa",
            "reason_code": "qa_repair",
            "repair_work_item_key": repair_key,
            "repair_label": label,
        }));
        append_event(project, &ticket, event)?;
        tracing::info!(work_item_key = %repair_key, "qa repair: handing back to implement");
        return Ok(EXIT_CONTINUE);
    }

    let stage = match plan_step(&active_stage, previous_result.as_deref()) {
        StepPlan::Done => {
            if opts.json {
                print_json(&json!({
                    "status": "done",
                    "stage": active_stage,
                    "exit_code": EXIT_OK,
                }))?;
            } else {
                println!("loop finished: {active_stage} is done");
            }
            return Ok(EXIT_OK);
        }
        StepPlan::Run(stage) => stage,
    };

    // Scope and work-item validation.
    let (scope_key, work_item_key) = if stage == "qa" {
        (scope::qa_scope_key(&ticket), state.work_item_key.clone())
    } else {
        let key = state.work_item_key.clone();
        if !scope::is_iteration_work_item_key(&key) {
            return StepVerdict::blocked(
                &stage,
                &scope::resolve_scope_key(&key, &ticket),
                "invalid_work_item_key",
                "loop stages require an iteration_id=<id> work item key",
            )
            .finish(project, &ticket, json!({}), opts.json);
        }
        (scope::resolve_scope_key(&key, &ticket), key)
    };

    // Per-scope advisory lock for the whole step.
    let _lock = match ScopeLock::acquire(project, &ticket, &scope_key) {
        Ok(lock) => lock,
        Err(AiddError::ScopeLocked(scope)) => {
            return StepVerdict::blocked(
                &stage,
                &scope_key,
                "scope_locked",
                &format!("scope '{scope}' is locked by a concurrent invocation"),
            )
            .finish(project, &ticket, json!({}), opts.json);
        }
        Err(err) => return Err(err.into()),
    };

    // Runner resolution and availability.
    let runner_raw = opts
        .runner
        .map(str::to_string)
        .or_else(|| std::env::var("AIDD_LOOP_RUNNER").ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "claude".to_string());
    let runner_tokens: Vec<String> = runner_raw.split_whitespace().map(str::to_string).collect();
    let claude_runner = runner_is_claude(&runner_tokens[0]);
    if which::which(&runner_tokens[0]).is_err() {
        return StepVerdict::blocked(
            &stage,
            &scope_key,
            "command_unavailable",
            &format!("runner '{}' is not installed", runner_tokens[0]),
        )
        .finish(project, &ticket, json!({"runner": runner_raw}), opts.json);
    }
    if claude_runner
        && !env_flag("AIDD_LOOP_ALLOW_APPROVAL")
        && !runner_tokens.iter().any(|t| t == "--dangerously-skip-permissions")
    {
        return StepVerdict::blocked(
            &stage,
            &scope_key,
            "loop_runner_permissions",
            "loop runner requires non-interactive permissions; \
             --dangerously-skip-permissions is missing. Set AIDD_LOOP_RUNNER with \
             this flag or allow approvals explicitly.",
        )
        .finish(project, &ticket, json!({"runner": runner_raw}), opts.json);
    }

    // Loop pack and preflight.
    let pack_path = paths::loop_pack_path(project, &ticket, &scope_key);
    if stage != "qa" {
        let pack = loop_pack::build_loop_pack(project, &ticket, Some(&work_item_key))?;
        if pack.is_blocked() {
            return pack_blocked_verdict(&stage, &scope_key, &pack.reason)
                .finish(project, &ticket, json!({}), opts.json);
        }
    }
    let plugin_root = match paths::require_plugin_root() {
        Ok(root) => root,
        Err(err) => {
            return StepVerdict::blocked(&stage, &scope_key, "plugin_root_missing", &err.to_string())
                .finish(project, &ticket, json!({}), opts.json);
        }
    };
    let preflight = aidd_core::preflight::run_preflight(
        project,
        &plugin_root,
        &aidd_core::preflight::PreflightRequest {
            ticket: ticket.clone(),
            stage: stage.clone(),
            work_item_key: Some(work_item_key.clone()),
        },
    )?;
    if preflight.is_blocked() {
        return StepVerdict::blocked(&stage, &scope_key, &preflight.reason_code, &preflight.reason)
            .finish(project, &ticket, json!({}), opts.json);
    }

    // Runner environment.
    let mut env: Vec<(String, String)> = vec![
        ("AIDD_TICKET".to_string(), ticket.clone()),
        ("AIDD_STAGE".to_string(), stage.clone()),
        ("AIDD_SCOPE_KEY".to_string(), scope_key.clone()),
        ("AIDD_LOOP_RUNNER_HINT".to_string(), runner_raw.clone()),
    ];
    if stage == "implement" && !env_flag("AIDD_LOOP_ALLOW_FORMAT") {
        env.push(("SKIP_FORMAT".to_string(), "1".to_string()));
    }
    let loop_allowed = loop_pack::read_loop_allowed_paths(&pack_path);
    if !loop_allowed.is_empty() {
        let joined = loop_allowed.join(":");
        env.push(("TEST_SCOPE".to_string(), joined.clone()));
        env.push(("AIDD_LOOP_SCOPE_PATHS".to_string(), joined));
    }

    let loops_dir = paths::loops_scope_dir(project, &ticket, &scope_key);
    io::ensure_dir(&loops_dir)?;
    let log_path = loops_dir.join(format!("stage.{stage}.log"));

    let runtime = tokio::runtime::Runtime::new()?;
    let run_stage = |answers: &str| -> anyhow::Result<i32> {
        let mut command = runner_tokens.clone();
        if !answers.is_empty() {
            command.push(answers.to_string());
        }
        let mut spec = RunnerSpec::new(command, workspace.to_path_buf());
        spec.env = env.clone();
        spec.stream = if claude_runner { StreamMode::JsonLines } else { StreamMode::Text };
        spec.stream_base = Some(loops_dir.join(format!("stage.{stage}")));
        let result = runtime.block_on(launch(&spec))?;

        let mut log = result.stdout.clone();
        if !result.stderr.is_empty() {
            log.push_str("\n--- stderr ---\n");
            log.push_str(&result.stderr);
        }
        io::write_text(&log_path, &log)?;

        if !result.launcher_error_reason.is_empty() {
            return Ok(EXIT_RUNTIME);
        }
        Ok(EXIT_OK)
    };

    let started_at = SystemTime::now();
    let launch_code = run_stage("")?;
    if launch_code != EXIT_OK {
        let reason = std::fs::read_to_string(&log_path)
            .ok()
            .and_then(|text| {
                text.lines()
                    .find(|line| line.starts_with("reason_code="))
                    .map(|line| line.trim_start_matches("reason_code=").to_string())
            })
            .unwrap_or_else(|| "launcher_io_unknown".to_string());
        return StepVerdict::blocked(&stage, &scope_key, &reason, "runner failed to launch")
            .finish(project, &ticket, json!({"runner": runner_raw}), opts.json);
    }

    let window = ResultWindow { started_at, finished_at: SystemTime::now() };
    let mut loaded = load_stage_result(project, &ticket, &scope_key, &stage, Some(window))?;
    let mut retry_applied = false;
    let mut answers_compact = String::new();

    // Exactly one compact-answers retry.
    let retry_material = match &loaded.payload {
        Some(payload) if effective_stage_result(payload) == "blocked" => {
            let reason_code =
                payload.get("reason_code").and_then(Value::as_str).unwrap_or("").to_string();
            let reason = payload.get("reason").and_then(Value::as_str).unwrap_or("").to_string();
            let material = question_material(Some(payload), &reason, &reason_code, &log_path);
            is_question_retry_candidate(&reason_code, &material).then_some(material)
        }
        _ => None,
    };
    if let Some(material) = retry_material {
        answers_compact = build_compact_answers(&material);
        if answers_compact.is_empty() {
            return StepVerdict::blocked(
                &stage,
                &scope_key,
                "prompt_flow_blocker",
                "stage requested compact AIDD:ANSWERS but no documented defaults were found",
            )
            .finish(project, &ticket, json!({}), opts.json);
        }
        io::write_text(&loops_dir.join(format!("stage.{stage}.questions.txt")), &material)?;
        io::write_text(&loops_dir.join(format!("stage.{stage}.answers.txt")), &answers_compact)?;
        tracing::info!(answers = %answers_compact, "question retry with compact answers");
        let retry_started = SystemTime::now();
        let retry_code = run_stage(&answers_compact)?;
        retry_applied = true;
        if retry_code == EXIT_OK {
            let retry_window =
                ResultWindow { started_at: retry_started, finished_at: SystemTime::now() };
            loaded = load_stage_result(project, &ticket, &scope_key, &stage, Some(retry_window))?;
        }
    }

    let Some(payload) = &loaded.payload else {
        let verdict = classify_verdict(&gates, &stage, &scope_key, &loaded.reason_code, &loaded.diagnostics);
        return verdict.finish(project, &ticket, json!({"retry": retry_applied}), opts.json);
    };
    let result = effective_stage_result(payload);
    let reason_code = payload.get("reason_code").and_then(Value::as_str).unwrap_or("").to_string();
    let reason = payload.get("reason").and_then(Value::as_str).unwrap_or("").to_string();

    // Apply runner-emitted actions before the contract check.
    let actions_file = paths::actions_path(project, &ticket, &scope_key, &stage);
    if actions_file.exists() {
        let mut actions_payload = match read_actions_payload(&actions_file, &stage, &scope_key) {
            Ok(payload) => payload,
            Err(verdict) => {
                return verdict.finish(project, &ticket, json!({"retry": retry_applied}), opts.json);
            }
        };
        actions::canonicalize_actions(
            &mut actions_payload,
            &ticket,
            &stage,
            &scope_key,
            &work_item_key,
        );
        let allowed: Vec<String> =
            actions::SUPPORTED_ACTION_TYPES.iter().map(|t| t.to_string()).collect();
        let errors = actions::validate_actions(&actions_payload, &allowed);
        if !errors.is_empty() {
            return StepVerdict::blocked(
                &stage,
                &scope_key,
                "contract_mismatch_actions_shape",
                &errors.join("; "),
            )
            .finish(project, &ticket, json!({"retry": retry_applied}), opts.json);
        }
        actions::apply_actions(project, &ticket, &scope_key, &stage, &actions_payload)?;
    }

    // Review pack gate for review outcomes.
    if stage == "review" && matches!(result.as_str(), "done" | "continue") {
        let pack_path = paths::review_pack_path(project, &ticket, &scope_key);
        let pack_ok = io::read_json::<Value>(&pack_path)
            .map(|pack| {
                let schema_ok =
                    pack.get("schema").and_then(Value::as_str) == Some(schema::REPORT_PACK_V1);
                // Columnar findings block must declare its columns; zero
                // rows is a legitimate clean review.
                let findings = pack.get("findings");
                let cols_ok = findings
                    .and_then(|f| f.get("cols"))
                    .and_then(Value::as_array)
                    .map(|cols| !cols.is_empty())
                    .or_else(|| findings.and_then(Value::as_array).map(|_| true))
                    .unwrap_or(false);
                schema_ok && cols_ok
            })
            .unwrap_or(false);
        if !pack_ok && gates.review_pack_v2_required() {
            return StepVerdict::blocked(
                &stage,
                &scope_key,
                "review_pack_missing",
                "review finished without a valid review pack",
            )
            .finish(project, &ticket, json!({"retry": retry_applied}), opts.json);
        }
    }

    // Output contract.
    let contract = check_output_contract(
        project,
        &ContractRequest {
            ticket: &ticket,
            stage: &stage,
            scope_key: &scope_key,
            work_item_key: &work_item_key,
            log_path: &log_path,
            stage_result_path: Some(&loaded.path),
            max_read_items: DEFAULT_MAX_READ_ITEMS,
        },
    )?;
    let contract_status =
        contract.get("status").and_then(Value::as_str).unwrap_or("blocked").to_string();
    if contract_status == "blocked" {
        let contract_reason =
            contract.get("reason_code").and_then(Value::as_str).unwrap_or("").to_string();
        let verdict = classify_verdict(&gates, &stage, &scope_key, &contract_reason, &reason);
        return verdict.finish(
            project,
            &ticket,
            json!({"retry": retry_applied, "output_contract": contract_status}),
            opts.json,
        );
    }

    // Final classification and transition.
    let details = json!({
        "retry": retry_applied,
        "answers": answers_compact,
        "output_contract": contract_status,
        "result": result,
    });
    match result.as_str() {
        "done" | "continue" => {
            let next = match (stage.as_str(), result.as_str()) {
                ("implement", _) => Some("review"),
                ("review", "continue") => Some("implement"),
                _ => None,
            };
            if let Some(next_stage) = next {
                active::update_active(
                    project,
                    &active::ActiveUpdate {
                        stage: Some(next_stage.to_string()),
                        ..Default::default()
                    },
                )?;
            } else {
                active::update_active(
                    project,
                    &active::ActiveUpdate { stage: Some(stage.clone()), ..Default::default() },
                )?;
            }
            let status = if contract_status == "warn" { "warn" } else { "ok" };
            let exit_code = if next.is_some() { EXIT_CONTINUE } else { EXIT_OK };
            let verdict = StepVerdict {
                status: status.to_string(),
                reason_code: String::new(),
                reason: String::new(),
                stage: stage.clone(),
                scope_key: scope_key.clone(),
                exit_code,
            };
            verdict.finish(project, &ticket, details, opts.json)
        }
        _ => {
            let verdict = classify_verdict(&gates, &stage, &scope_key, &reason_code, &reason);
            verdict.finish(project, &ticket, details, opts.json)
        }
    }
}

/// A blocked loop pack means the work item could not be resolved; the pack's
/// own reason code is tool-internal and only survives in the reason text.
fn pack_blocked_verdict(stage: &str, scope_key: &str, pack_reason: &str) -> StepVerdict {
    StepVerdict::blocked(
        stage,
        scope_key,
        "work_item_resolution_failed",
        &format!("loop pack unavailable: {pack_reason}"),
    )
}

/// A malformed actions file is a contract violation, not a crash.
fn read_actions_payload(
    path: &Path,
    stage: &str,
    scope_key: &str,
) -> std::result::Result<Value, StepVerdict> {
    io::read_json(path).map_err(|err| {
        StepVerdict::blocked(
            stage,
            scope_key,
            "contract_mismatch_actions_shape",
            &format!("actions payload is not valid JSON: {err}"),
        )
    })
}

fn classify_verdict(
    gates: &GatesConfig,
    stage: &str,
    scope_key: &str,
    reason_code: &str,
    reason: &str,
) -> StepVerdict {
    let policy_override = std::env::var("AIDD_LOOP_BLOCKED_POLICY").ok();
    let classification = classify_block_reason(
        reason_code,
        policy_override.as_deref(),
        &gates.hooks_mode(),
        gates,
    );
    if classification.is_warn_continue {
        StepVerdict {
            status: "warn".to_string(),
            reason_code: classification.reason_code,
            reason: reason.to_string(),
            stage: stage.to_string(),
            scope_key: scope_key.to_string(),
            exit_code: EXIT_CONTINUE,
        }
    } else {
        StepVerdict {
            status: "blocked".to_string(),
            reason_code: classification.reason_code,
            reason: reason.to_string(),
            stage: stage.to_string(),
            scope_key: scope_key.to_string(),
            exit_code: EXIT_BLOCKED,
        }
    }
}

// ---------------------------------------------------------------------------
// loop-run
// ---------------------------------------------------------------------------

pub fn run(
    workspace: &Path,
    project: &Path,
    opts: LoopOptions<'_>,
    max_iterations: Option<usize>,
) -> anyhow::Result<i32> {
    let limit = max_iterations.unwrap_or(DEFAULT_LOOP_RUN_ITERATIONS).max(1);
    let mut code = EXIT_CONTINUE;
    for iteration in 0..limit {
        code = step(workspace, project, opts)?;
        if code != EXIT_CONTINUE {
            return Ok(code);
        }
        tracing::debug!(iteration, "loop-run continuing");
    }
    Ok(code)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_answers_from_numbered_questions() {
        let material = "Question 1: pick runner mode\nDefault: B\nQuestion 2: keep cache?\nDefault: c\n";
        assert_eq!(build_compact_answers(material), "AIDD:ANSWERS Q1=B; Q2=C");
    }

    #[test]
    fn compact_answers_sequential_when_unnumbered() {
        let material = "Default: A\nDefault: B\n";
        assert_eq!(build_compact_answers(material), "AIDD:ANSWERS Q1=A; Q2=B");
    }

    #[test]
    fn no_defaults_yields_empty_answers() {
        assert_eq!(build_compact_answers("Question 1: anything?"), "");
    }

    #[test]
    fn retry_candidate_by_reason_code() {
        assert!(is_question_retry_candidate("answers_required", ""));
        assert!(is_question_retry_candidate("QUESTIONS_PENDING", ""));
        assert!(!is_question_retry_candidate("no_tests_soft", ""));
    }

    #[test]
    fn retry_candidate_by_material() {
        assert!(is_question_retry_candidate("", "Question 1 requires AIDD:ANSWERS"));
        assert!(!is_question_retry_candidate("", "just a plain failure"));
    }

    #[test]
    fn plan_transitions() {
        assert_eq!(plan_step("", None), StepPlan::Run("implement".to_string()));
        assert_eq!(plan_step("implement", None), StepPlan::Run("implement".to_string()));
        assert_eq!(plan_step("implement", Some("done")), StepPlan::Run("review".to_string()));
        assert_eq!(plan_step("implement", Some("continue")), StepPlan::Run("review".to_string()));
        assert_eq!(plan_step("review", Some("done")), StepPlan::Done);
        assert_eq!(plan_step("review", Some("continue")), StepPlan::Run("implement".to_string()));
        assert_eq!(plan_step("review", Some("blocked")), StepPlan::Run("review".to_string()));
    }

    #[test]
    fn blocked_loop_pack_maps_to_resolution_failure() {
        let verdict = pack_blocked_verdict("implement", "iteration_id_i1", "work_item_not_found");
        assert_eq!(verdict.reason_code, "work_item_resolution_failed");
        assert_eq!(verdict.exit_code, EXIT_BLOCKED);
        assert!(verdict.reason.contains("work_item_not_found"));
    }

    #[test]
    fn malformed_actions_payload_blocks_with_contract_reason() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("actions.json");
        std::fs::write(&path, "{not json").unwrap();
        let verdict =
            read_actions_payload(&path, "implement", "iteration_id_i1").unwrap_err();
        assert_eq!(verdict.reason_code, "contract_mismatch_actions_shape");
        assert_eq!(verdict.exit_code, EXIT_BLOCKED);
    }

    #[test]
    fn claude_runner_detection() {
        assert!(runner_is_claude("claude"));
        assert!(runner_is_claude("/usr/local/bin/claude"));
        assert!(!runner_is_claude("opencode"));
    }
}
