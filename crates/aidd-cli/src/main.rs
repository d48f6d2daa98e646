mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::loops::LoopOptions;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "aidd",
    about = "Stage-loop control plane — drive AI-assisted implement/review/qa loops over ticketed docs",
    version,
    propagate_version = true
)]
struct Cli {
    /// Workspace root (default: auto-detect from aidd/ or .git/)
    #[arg(long, global = true, env = "AIDD_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set the active feature ticket
    SetActiveFeature {
        #[arg(long)]
        ticket: String,

        #[arg(long)]
        slug_hint: Option<String>,

        #[arg(long)]
        work_item_key: Option<String>,
    },

    /// Set the active stage
    SetActiveStage {
        #[arg(long)]
        stage: String,
    },

    /// Show the active feature state
    Status,

    /// Prepare the read/write maps and stage contracts for one stage
    Preflight {
        #[arg(long)]
        ticket: Option<String>,

        #[arg(long)]
        stage: String,

        #[arg(long)]
        work_item_key: Option<String>,

        /// Explicit scope key; must match the canonical one
        #[arg(long)]
        scope_key: Option<String>,
    },

    /// Validate an actions payload
    ActionsValidate {
        /// Path to the actions JSON file
        file: PathBuf,
    },

    /// Canonicalize, validate, and apply an actions payload
    ActionsApply {
        #[arg(long)]
        ticket: Option<String>,

        #[arg(long)]
        stage: String,

        #[arg(long)]
        work_item_key: Option<String>,

        /// Actions file (default: the canonical per-stage slot)
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Check a stage log against the output contract
    OutputContract {
        #[arg(long)]
        ticket: Option<String>,

        #[arg(long)]
        stage: String,

        #[arg(long)]
        work_item_key: Option<String>,

        /// Stage log to check
        #[arg(long)]
        log: PathBuf,

        /// Stage result file for the status cross-check
        #[arg(long)]
        stage_result: Option<PathBuf>,

        #[arg(long)]
        max_read_items: Option<usize>,
    },

    /// Load and classify the canonical stage result
    StageResult {
        #[arg(long)]
        ticket: Option<String>,

        #[arg(long)]
        stage: String,

        #[arg(long)]
        work_item_key: Option<String>,
    },

    /// Run one loop stage under supervision
    LoopStep {
        #[arg(long)]
        ticket: Option<String>,

        /// Runner command override (also AIDD_LOOP_RUNNER)
        #[arg(long)]
        runner: Option<String>,

        /// QA repair mode: auto, manual, or off
        #[arg(long)]
        from_qa: Option<String>,
    },

    /// Run loop steps until done or blocked
    LoopRun {
        #[arg(long)]
        ticket: Option<String>,

        #[arg(long)]
        runner: Option<String>,

        #[arg(long)]
        from_qa: Option<String>,

        #[arg(long)]
        max_iterations: Option<usize>,
    },

    /// Scan the workspace for ticket-relevant files and keywords
    Research {
        #[arg(long)]
        ticket: Option<String>,

        #[arg(long)]
        slug_hint: Option<String>,

        /// Extra scope paths
        #[arg(long = "path")]
        paths: Vec<String>,

        /// Extra keywords
        #[arg(long = "keyword")]
        keywords: Vec<String>,

        #[arg(long, default_value = "200")]
        limit: usize,
    },

    /// Extract the semantic memory pack from ticket docs
    MemoryExtract {
        #[arg(long)]
        ticket: Option<String>,

        #[arg(long)]
        slug_hint: Option<String>,
    },

    /// Rebuild the decisions pack from the decision log
    MemoryPack {
        #[arg(long)]
        ticket: Option<String>,
    },

    /// Build one memory slice for a query
    MemorySlice {
        #[arg(long)]
        ticket: Option<String>,

        #[arg(long)]
        query: String,

        #[arg(long)]
        stage: Option<String>,

        #[arg(long)]
        scope_key: Option<String>,
    },

    /// Build the per-stage slice manifest from configured queries
    MemoryAutoslice {
        #[arg(long)]
        ticket: Option<String>,

        #[arg(long)]
        stage: String,

        #[arg(long)]
        scope_key: Option<String>,
    },

    /// Validate memory packs and the decision log
    MemoryVerify {
        #[arg(long)]
        ticket: Option<String>,
    },

    /// Append a decision to the ticket decision log
    DecisionAppend {
        #[arg(long)]
        ticket: Option<String>,

        #[arg(long)]
        topic: String,

        #[arg(long)]
        decision: String,

        #[arg(long)]
        rationale: Option<String>,

        #[arg(long = "alternative")]
        alternatives: Vec<String>,

        /// active, superseded, or rejected
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        supersedes: Option<String>,

        #[arg(long)]
        stage: Option<String>,

        #[arg(long)]
        scope_key: Option<String>,
    },

    /// Show recent events for a ticket
    Events {
        #[arg(long)]
        ticket: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .init();

    let workspace = root::resolve_root(cli.root.as_deref());
    let project = root::project_root(&workspace);

    let result = match cli.command {
        Commands::SetActiveFeature { ticket, slug_hint, work_item_key } => cmd::active::set_feature(
            &project,
            &ticket,
            slug_hint.as_deref(),
            work_item_key.as_deref(),
            cli.json,
        ),
        Commands::SetActiveStage { stage } => cmd::active::set_stage(&project, &stage, cli.json),
        Commands::Status => cmd::active::status(&project, cli.json),
        Commands::Preflight { ticket, stage, work_item_key, scope_key } => cmd::preflight::run(
            &project,
            ticket.as_deref(),
            &stage,
            work_item_key.as_deref(),
            scope_key.as_deref(),
            cli.json,
        ),
        Commands::ActionsValidate { file } => cmd::actions::validate(&file),
        Commands::ActionsApply { ticket, stage, work_item_key, file } => cmd::actions::apply(
            &project,
            ticket.as_deref(),
            &stage,
            work_item_key.as_deref(),
            file.as_deref(),
            cli.json,
        ),
        Commands::OutputContract {
            ticket,
            stage,
            work_item_key,
            log,
            stage_result,
            max_read_items,
        } => cmd::contract::run(
            &project,
            ticket.as_deref(),
            &stage,
            work_item_key.as_deref(),
            &log,
            stage_result.as_deref(),
            max_read_items,
            cli.json,
        ),
        Commands::StageResult { ticket, stage, work_item_key } => cmd::stage_result::run(
            &project,
            ticket.as_deref(),
            &stage,
            work_item_key.as_deref(),
            cli.json,
        ),
        Commands::LoopStep { ticket, runner, from_qa } => cmd::loops::step(
            &workspace,
            &project,
            LoopOptions {
                ticket: ticket.as_deref(),
                runner: runner.as_deref(),
                from_qa: from_qa.as_deref(),
                json: cli.json,
            },
        ),
        Commands::LoopRun { ticket, runner, from_qa, max_iterations } => cmd::loops::run(
            &workspace,
            &project,
            LoopOptions {
                ticket: ticket.as_deref(),
                runner: runner.as_deref(),
                from_qa: from_qa.as_deref(),
                json: cli.json,
            },
            max_iterations,
        ),
        Commands::Research { ticket, slug_hint, paths, keywords, limit } => cmd::research::run(
            &workspace,
            &project,
            ticket.as_deref(),
            slug_hint.as_deref(),
            &paths,
            &keywords,
            limit,
            cli.json,
        ),
        Commands::MemoryExtract { ticket, slug_hint } => {
            cmd::memory::extract(&project, ticket.as_deref(), slug_hint.as_deref(), cli.json)
        }
        Commands::MemoryPack { ticket } => cmd::memory::pack(&project, ticket.as_deref(), cli.json),
        Commands::MemorySlice { ticket, query, stage, scope_key } => cmd::memory::slice(
            &project,
            ticket.as_deref(),
            &query,
            stage.as_deref(),
            scope_key.as_deref(),
            cli.json,
        ),
        Commands::MemoryAutoslice { ticket, stage, scope_key } => cmd::memory::autoslice(
            &project,
            ticket.as_deref(),
            &stage,
            scope_key.as_deref(),
            cli.json,
        ),
        Commands::MemoryVerify { ticket } => cmd::memory::verify(&project, ticket.as_deref()),
        Commands::DecisionAppend {
            ticket,
            topic,
            decision,
            rationale,
            alternatives,
            status,
            supersedes,
            stage,
            scope_key,
        } => cmd::memory::decision_append(
            &project,
            ticket.as_deref(),
            &topic,
            &decision,
            rationale.as_deref(),
            &alternatives,
            status.as_deref(),
            supersedes.as_deref(),
            stage.as_deref(),
            scope_key.as_deref(),
            cli.json,
        ),
        Commands::Events { ticket, limit } => {
            cmd::events::run(&project, ticket.as_deref(), limit, cli.json)
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            // Print the full error chain (anyhow's alternate Display)
            eprintln!("error: {e:#}");
            std::process::exit(output::EXIT_RUNTIME);
        }
    }
}
