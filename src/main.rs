use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use orc_engine::config::{self, OrcConfig};
use orc_engine::gate::HumanResolution;
use orc_engine::lock;
use orc_engine::log::parse_log_level;
use orc_engine::orchestrator::{self, OrchestratorConfig, PhaseRuntimeConfig, WorkflowOutcome};
use orc_engine::phase_engine::CompletionCriteria;
use orc_engine::record::{
    parse_weight, CompletionSchemaKind, GateType, PhaseDef, Run, RunOutcome, Task, TaskStatus,
    Weight, Workflow,
};
use orc_engine::store::{spawn_store, StoreHandle};
use orc_engine::turn::{
    install_signal_handlers, is_shutdown_requested, kill_all_children, CliTurnRunner,
};
use orc_engine::variables::VariableCache;
use orc_engine::worktree;
use orc_engine::{log_error, log_info, log_warn};

#[derive(Parser)]
#[command(
    name = "orc",
    about = "Workflow execution engine that drives AI coding agents through multi-phase tasks"
)]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/phase-golem.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the engine's runtime directory and config
    Init {
        /// Project prefix for task IDs (e.g., WRK)
        #[arg(long, default_value = "WRK")]
        prefix: String,
    },
    /// Manage tasks in the store
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Run (or resume) a task's workflow to completion or the next pause point
    Run {
        /// Task ID to run
        task_id: String,
        /// Branch/ref the task's worktree is based on, when starting a new run
        #[arg(long)]
        base_ref: Option<String>,
    },
    /// Apply a collected human decision to a run paused at a human gate
    Resolve {
        /// Task ID whose run is paused awaiting a human decision
        task_id: String,
        /// Approve the gated phase (default is reject)
        #[arg(long)]
        approve: bool,
        /// Decision reason, recorded in the gate's audit trail
        #[arg(long, default_value = "")]
        reason: String,
        /// Outstanding clarifying question; repeatable
        #[arg(long = "question", action = clap::ArgAction::Append)]
        questions: Vec<String>,
    },
    /// Show all tasks and their current status
    Status,
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Add a new task to the store
    Add {
        /// Task title
        title: String,
        /// Work-size classification driving the phase sequence
        #[arg(long, default_value = "small")]
        weight: String,
        /// Branch the task's changes should eventually land on
        #[arg(long)]
        target_branch: Option<String>,
        /// Longer-form description
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List tasks in the store
    List,
    /// Show one task's full record
    Show {
        /// Task ID to show
        task_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => orc_engine::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let root = cli.root.clone();
    let config_path = cli.config.clone();

    let result = match cli.command {
        Commands::Init { prefix } => handle_init(&root, &prefix),
        Commands::Task { command } => handle_task(&root, config_path.as_deref(), command).await,
        Commands::Run { task_id, base_ref } => {
            handle_run(&root, config_path.as_deref(), &task_id, base_ref.as_deref()).await
        }
        Commands::Resolve {
            task_id,
            approve,
            reason,
            questions,
        } => handle_resolve(&root, config_path.as_deref(), &task_id, approve, reason, questions).await,
        Commands::Status => handle_status(&root).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn handle_init(root: &Path, prefix: &str) -> Result<(), String> {
    if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(
            "Prefix must contain only alphanumeric characters, hyphens, and underscores"
                .to_string(),
        );
    }

    orc_engine::git::is_git_repo(None)
        .map_err(|_| "Not a git repository. Run `git init` first.".to_string())?;

    std::fs::create_dir_all(root.join(".orc"))
        .map_err(|e| format!("Failed to create .orc/: {}", e))?;

    let config_path = root.join("phase-golem.toml");
    if !config_path.exists() {
        let config_contents = format!(
            r#"[project]
prefix = "{prefix}"

[guardrails]
max_size = "medium"
max_complexity = "medium"
max_risk = "low"

[execution]
phase_timeout_minutes = 30
max_retries = 2
default_phase_cap = 100
max_wip = 1
max_concurrent = 1

[agent]
# cli = "claude"          # AI CLI tool: "claude", "opencode"
# model = ""              # Model override (e.g., "opus", "sonnet")

[gates]
# phase_gate_store_enabled = true
# disabled_phases = ["validate"]

[completion.forge]
# owner = "your-org"
# repo = "your-repo"
"#,
        );
        std::fs::write(&config_path, config_contents)
            .map_err(|e| format!("Failed to write {}: {}", config_path.display(), e))?;
    }

    let gitignore_path = root.join(".gitignore");
    let gitignore_entry = ".orc/";
    let existing_gitignore = if gitignore_path.exists() {
        std::fs::read_to_string(&gitignore_path)
            .map_err(|e| format!("Failed to read .gitignore: {}", e))?
    } else {
        String::new()
    };

    let has_entry = existing_gitignore
        .lines()
        .any(|line| line.trim() == gitignore_entry);

    if !has_entry {
        let mut contents = existing_gitignore;
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(gitignore_entry);
        contents.push('\n');
        std::fs::write(&gitignore_path, contents)
            .map_err(|e| format!("Failed to write .gitignore: {}", e))?;
    }

    println!("Initialized orc in {}", root.display());
    println!("  Created: .orc/");
    println!("  Created: phase-golem.toml");
    println!("  Updated: .gitignore");

    Ok(())
}

fn load_config(root: &Path, config_path: Option<&Path>) -> Result<OrcConfig, String> {
    config::load_config_from(config_path, root)
}

fn next_task_id(prefix: &str, existing: &[Task]) -> String {
    let max_existing = existing
        .iter()
        .filter_map(|t| t.id.strip_prefix(&format!("{}-", prefix)))
        .filter_map(|n| n.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("{}-{:03}", prefix, max_existing + 1)
}

async fn handle_task(
    root: &Path,
    config_path: Option<&Path>,
    command: TaskCommands,
) -> Result<(), String> {
    let config = load_config(root, config_path)?;
    let (store, _handle) = spawn_store(root).map_err(|e| e.to_string())?;

    match command {
        TaskCommands::Add {
            title,
            weight,
            target_branch,
            description,
        } => {
            let weight = parse_weight(&weight)?;
            let existing = store.list_tasks().await.map_err(|e| e.to_string())?;
            let id = next_task_id(&config.project.prefix, &existing);
            let now = chrono::Utc::now();
            let task = Task {
                id: id.clone(),
                title: title.clone(),
                description,
                weight,
                status: TaskStatus::Created,
                target_branch,
                initiative_ref: None,
                blocked_by: Vec::new(),
                related_to: Vec::new(),
                automation: true,
                metadata: serde_json::Map::new(),
                created_at: now,
                updated_at: now,
            };
            store
                .upsert_task(task, None)
                .await
                .map_err(|e| e.to_string())?;
            println!("Added {} ({:?}) — {}", id, weight, title);
            Ok(())
        }
        TaskCommands::List => {
            let mut tasks = store.list_tasks().await.map_err(|e| e.to_string())?;
            if tasks.is_empty() {
                println!("No tasks in store.");
                return Ok(());
            }
            tasks.sort_by(|a, b| a.id.cmp(&b.id));
            println!(
                "{:<12} {:<12} {:<10} TITLE",
                "ID", "STATUS", "WEIGHT"
            );
            println!("{}", "-".repeat(70));
            for task in &tasks {
                println!(
                    "{:<12} {:<12} {:<10} {}",
                    task.id,
                    format!("{:?}", task.status).to_lowercase(),
                    task.weight.to_string(),
                    task.title,
                );
            }
            println!("\n{} task(s) total", tasks.len());
            Ok(())
        }
        TaskCommands::Show { task_id } => {
            let task = store.get_task(&task_id).await.map_err(|e| e.to_string())?;
            println!("{}", serde_json::to_string_pretty(&task).map_err(|e| e.to_string())?);
            Ok(())
        }
    }
}

/// Builds the phase sequence for a task's weight. Only one canonical
/// sequence (research, spec, design, implement, review, test, validate,
/// finalize) is documented; lighter weights drop the phases that add
/// overhead disproportionate to the change (research/spec/design for a
/// one-line fix is pure ceremony), heavier ones run the whole thing.
fn phase_ids_for_weight(weight: Weight) -> Vec<&'static str> {
    match weight {
        Weight::Trivial => vec!["implement", "review", "finalize"],
        Weight::Small => vec!["implement", "review", "test", "finalize"],
        Weight::Medium | Weight::Large => vec![
            "research", "spec", "implement", "review", "test", "validate", "finalize",
        ],
        Weight::Greenfield => vec![
            "research", "spec", "design", "implement", "review", "test", "validate", "finalize",
        ],
    }
}

fn completion_schema_for_phase(phase_id: &str) -> CompletionSchemaKind {
    match phase_id {
        "review" => CompletionSchemaKind::ReviewRound1,
        "test" | "validate" => CompletionSchemaKind::Qa,
        _ => CompletionSchemaKind::Generic,
    }
}

fn prompt_template_for_phase(phase_id: &str) -> String {
    match phase_id {
        "research" => "Research the codebase context needed for: {{TASK_TITLE}}. Summarize relevant files, existing patterns, and constraints.".to_string(),
        "spec" => "Write an implementation spec for: {{TASK_TITLE}}.\n\nResearch notes:\n{{RESEARCH_CONTENT}}".to_string(),
        "design" => "Design the architecture for: {{TASK_TITLE}}, grounded in the spec below.\n\n{{SPEC_CONTENT}}".to_string(),
        "implement" => "Implement: {{TASK_TITLE}}.\n\n{{#if SPEC_CONTENT}}Spec:\n{{SPEC_CONTENT}}{{/if}}{{#if RETRY_CONTEXT}}\n\nPrevious attempt failed:\n{{RETRY_CONTEXT}}{{/if}}".to_string(),
        "review" => "Review the changes made for: {{TASK_TITLE}}. List findings as issues, ranked by severity.".to_string(),
        "test" => "Run and assess the test suite for: {{TASK_TITLE}}.\n\n{{REVIEW_FINDINGS}}".to_string(),
        "validate" => "Validate the final state of: {{TASK_TITLE}} against its spec.\n\n{{SPEC_CONTENT}}".to_string(),
        _ => "Continue work on: {{TASK_TITLE}}.".to_string(),
    }
}

fn build_workflow(weight: Weight) -> Workflow {
    let phases = phase_ids_for_weight(weight)
        .into_iter()
        .map(|id| PhaseDef {
            id: id.to_string(),
            kind: if id == "finalize" { "finalize".to_string() } else { "turn".to_string() },
            prompt_template: prompt_template_for_phase(id),
            max_iterations: 10,
            checkpoint_frequency: 1,
            completion_schema_kind: completion_schema_for_phase(id),
            gate_ref: None,
        })
        .collect();

    Workflow {
        id: format!("workflow-{}", weight),
        phases,
    }
}

fn build_phase_runtime(config: &OrcConfig, workflow: &Workflow) -> HashMap<String, PhaseRuntimeConfig> {
    let turn_max = Duration::from_secs(config.executor.turn_max_seconds);
    let idle_timeout = Duration::from_secs(config.executor.idle_timeout_seconds);

    workflow
        .phases
        .iter()
        .map(|phase| {
            let mut criteria = CompletionCriteria::default();
            if phase.id == "test" || phase.id == "validate" {
                if let Some(ref cmd) = config.linting.command {
                    criteria.lint_command = Some(cmd.clone());
                }
            }
            let runtime = PhaseRuntimeConfig {
                variable_defs: Vec::new(),
                criteria,
                artifact_kind: artifact_kind_for_phase(&phase.id),
                turn_max,
                idle_timeout,
                idle_escalates: config.executor.idle_escalates,
                gate_type_default: GateType::Auto,
                auto_criteria: vec![orc_engine::gate::AutoCriterion::HasCompletionMarker],
                ai_gate_prompt: format!("Evaluate whether the {} phase's output is acceptable.", phase.id),
            };
            (phase.id.clone(), runtime)
        })
        .collect()
}

fn artifact_kind_for_phase(phase_id: &str) -> Option<orc_engine::record::ArtifactKind> {
    use orc_engine::record::ArtifactKind;
    match phase_id {
        "research" => Some(ArtifactKind::Research),
        "spec" | "design" => Some(ArtifactKind::Spec),
        "review" => Some(ArtifactKind::Review),
        "test" | "validate" => Some(ArtifactKind::TestResults),
        "finalize" => Some(ArtifactKind::FinalizeReport),
        _ => None,
    }
}

/// Finds an existing non-terminal run for the task, or starts a new one at
/// the first phase of its weight-appropriate workflow.
async fn find_or_create_run(
    store: &StoreHandle,
    task: &Task,
    workflow: &Workflow,
) -> Result<Run, String> {
    let runs = store
        .list_runs_for_task(&task.id)
        .await
        .map_err(|e| e.to_string())?;
    if let Some(run) = runs
        .into_iter()
        .find(|r| !matches!(r.outcome, Some(RunOutcome::Completed) | Some(RunOutcome::Failed)))
    {
        return Ok(run);
    }

    let first_phase = workflow
        .phases
        .first()
        .ok_or_else(|| format!("workflow '{}' has no phases", workflow.id))?;

    let run = Run {
        id: format!("{}-run-{}", task.id, chrono::Utc::now().timestamp()),
        task_id: task.id.clone(),
        workflow_id: workflow.id.clone(),
        started_at: chrono::Utc::now(),
        finished_at: None,
        outcome: None,
        current_phase_id: first_phase.id.clone(),
        retry_counter: 0,
    };
    store.upsert_run(run.clone()).await.map_err(|e| e.to_string())?;
    Ok(run)
}

async fn handle_run(
    root: &Path,
    config_path: Option<&Path>,
    task_id: &str,
    base_ref: Option<&str>,
) -> Result<(), String> {
    install_signal_handlers()?;

    log_info!("--- orc ---");
    log_info!("");

    log_info!("[pre] Acquiring lock...");
    let runtime_dir = root.join(".orc");
    let _lock = lock::try_acquire(&runtime_dir)?;
    log_info!("[pre] Checking git preconditions...");
    orc_engine::git::check_preconditions(Some(root))?;

    let config = load_config(root, config_path)?;

    let runner = CliTurnRunner::new(config.agent.cli.binary_name(), config.agent.model.clone());
    log_info!("[pre] Verifying agent CLI...");
    runner.verify_cli_available().await.map_err(|e| e.to_string())?;

    let (store, _handle) = spawn_store(root).map_err(|e| e.to_string())?;
    let task = store.get_task(task_id).await.map_err(|e| e.to_string())?;

    let workflow = build_workflow(task.weight);
    let phase_runtime = build_phase_runtime(&config, &workflow);
    let mut run = find_or_create_run(&store, &task, &workflow).await?;

    log_info!(
        "[run] task {} ({:?}) — workflow '{}', resuming at phase '{}'",
        task.id,
        task.weight,
        workflow.id,
        run.current_phase_id
    );

    let effective_base_ref = base_ref
        .map(|s| s.to_string())
        .or_else(|| task.target_branch.clone())
        .unwrap_or_else(|| "main".to_string());

    let (worktree, release) =
        worktree::acquire(root, &task.id, &run.id, &effective_base_ref).map_err(|e| e.to_string())?;

    let mut updated_task = task.clone();
    updated_task.status = TaskStatus::Running;
    updated_task.updated_at = chrono::Utc::now();
    store
        .upsert_task(updated_task, Some(task.updated_at))
        .await
        .map_err(|e| e.to_string())?;

    let cfg = OrchestratorConfig {
        workflow: &workflow,
        phase_runtime: &phase_runtime,
        gates: &config.gates,
        retry: &config.retry,
        finalize: &config.completion.finalize,
        ci: &config.completion.ci,
        pr: &config.completion.pr,
        forge: &config.completion.forge,
    };
    let cache = VariableCache::new();

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        loop {
            if is_shutdown_requested() {
                cancel_clone.cancel();
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    let outcome = orchestrator::run_workflow(
        &store, &runner, &task, &mut run, &worktree, root, &cfg, &cache, &cancel,
    )
    .await;

    kill_all_children().await;

    let outcome = outcome.map_err(|e| e.to_string())?;

    let final_status = match &outcome {
        WorkflowOutcome::Completed => TaskStatus::Completed,
        WorkflowOutcome::Blocked { .. } => TaskStatus::Blocked,
        WorkflowOutcome::Failed { .. } => TaskStatus::Failed,
        WorkflowOutcome::Paused { .. } => TaskStatus::Paused,
    };
    let mut refreshed = store.get_task(&task.id).await.map_err(|e| e.to_string())?;
    let prior_updated_at = refreshed.updated_at;
    refreshed.status = final_status;
    refreshed.updated_at = chrono::Utc::now();
    store
        .upsert_task(refreshed, Some(prior_updated_at))
        .await
        .map_err(|e| e.to_string())?;

    match &outcome {
        WorkflowOutcome::Completed => {
            log_info!("[run] task {} completed", task.id);
            // Finalize already merged the branch upstream; discard tears
            // down the worktree and deletes the now-unneeded task branch.
            if let Err(e) = worktree::discard(root, &worktree) {
                log_warn!("failed to discard worktree after completion: {}", e);
            }
        }
        WorkflowOutcome::Blocked { phase, reason } => {
            log_error!("[run] task {} blocked at phase '{}': {}", task.id, phase, reason);
        }
        WorkflowOutcome::Failed { phase, reason } => {
            log_error!("[run] task {} failed at phase '{}': {}", task.id, phase, reason);
        }
        WorkflowOutcome::Paused { resume_phase } => {
            log_info!(
                "[run] task {} paused, will resume at phase '{}'",
                task.id,
                resume_phase
            );
        }
    }

    // Idempotent even after `discard` already removed the path.
    release.call().map_err(|e| e.to_string())?;

    Ok(())
}

async fn handle_resolve(
    root: &Path,
    config_path: Option<&Path>,
    task_id: &str,
    approve: bool,
    reason: String,
    questions: Vec<String>,
) -> Result<(), String> {
    let config = load_config(root, config_path)?;
    let (store, _handle) = spawn_store(root).map_err(|e| e.to_string())?;

    let task = store.get_task(task_id).await.map_err(|e| e.to_string())?;
    let workflow = build_workflow(task.weight);
    let phase_runtime = build_phase_runtime(&config, &workflow);

    let runs = store
        .list_runs_for_task(task_id)
        .await
        .map_err(|e| e.to_string())?;
    let mut run = runs
        .into_iter()
        .find(|r| r.outcome.is_none())
        .ok_or_else(|| format!("no run for task {} is awaiting a human decision", task_id))?;

    let cfg = OrchestratorConfig {
        workflow: &workflow,
        phase_runtime: &phase_runtime,
        gates: &config.gates,
        retry: &config.retry,
        finalize: &config.completion.finalize,
        ci: &config.completion.ci,
        pr: &config.completion.pr,
        forge: &config.completion.forge,
    };

    let resolution = HumanResolution {
        approved: approve,
        reason,
        questions,
    };

    let outcome = orchestrator::apply_human_resolution(&store, &task, &mut run, &cfg, &resolution)
        .await
        .map_err(|e| e.to_string())?;

    match &outcome {
        WorkflowOutcome::Completed => println!("Task {} completed", task_id),
        WorkflowOutcome::Blocked { phase, reason } => {
            println!("Task {} blocked at phase '{}': {}", task_id, phase, reason)
        }
        WorkflowOutcome::Failed { phase, reason } => {
            println!("Task {} failed at phase '{}': {}", task_id, phase, reason)
        }
        WorkflowOutcome::Paused { resume_phase } => println!(
            "Task {} paused at phase '{}' — run `orc run {}` to continue",
            task_id, resume_phase, task_id
        ),
    }

    Ok(())
}

async fn handle_status(root: &Path) -> Result<(), String> {
    let (store, _handle) = spawn_store(root).map_err(|e| e.to_string())?;
    let mut tasks = store.list_tasks().await.map_err(|e| e.to_string())?;

    if tasks.is_empty() {
        println!("No tasks in store.");
        return Ok(());
    }

    tasks.sort_by(|a, b| a.id.cmp(&b.id));

    let mut counts: HashMap<String, usize> = HashMap::new();
    for task in &tasks {
        *counts.entry(format!("{:?}", task.status).to_lowercase()).or_insert(0) += 1;
    }

    println!("{:<12} {:<12} {:<10} {:<14} TITLE", "ID", "STATUS", "WEIGHT", "PHASE");
    println!("{}", "-".repeat(90));

    for task in &tasks {
        let runs = store
            .list_runs_for_task(&task.id)
            .await
            .map_err(|e| e.to_string())?;
        let phase = runs
            .iter()
            .find(|r| r.outcome.is_none())
            .map(|r| r.current_phase_id.as_str())
            .unwrap_or("-");

        println!(
            "{:<12} {:<12} {:<10} {:<14} {}",
            task.id,
            format!("{:?}", task.status).to_lowercase(),
            task.weight.to_string(),
            phase,
            task.title,
        );
    }

    println!("\n{} task(s) total", tasks.len());
    let summary: Vec<String> = counts.iter().map(|(k, v)| format!("{} {}", v, k)).collect();
    println!("{}", summary.join(", "));

    Ok(())
}
