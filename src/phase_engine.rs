//! Phase engine (C6): drives one phase through its bounded iteration loop.
//! Grounded on `executor.rs`'s `execute_phase` retry loop, generalized
//! from a fixed CLI-retry shape into the turn-based iterate/checkpoint/
//! stuck-detect loop this engine's phases require; stuck detection and
//! artifact-skip policy have no direct teacher analogue and are built
//! fresh in its error-signature-extraction-then-normalize style.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;

use crate::config::ArtifactSkipConfig;
use crate::error::OrcError;
use crate::git;
use crate::record::{Artifact, ArtifactKind, PhaseState, PhaseStatus, Weight};
use crate::store::StoreHandle;
use crate::turn::{
    transcript_filename, transcript_path, CompletionSchema, CompletionStatus, TurnInput,
    TurnRunner,
};
use crate::variables::{interpolate, resolve, ResolutionContext, VariableCache, VariableDef};
use crate::{log_info, log_warn};

const STUCK_WINDOW: usize = 3;
const SIGNATURE_MAX_CHARS: usize = 200;

/// Deterministic, non-LLM checks applied alongside the completion object's
/// own `status == complete` before a phase is allowed to exit its loop.
/// Each configured check is optional; an unset field always holds.
#[derive(Debug, Clone, Default)]
pub struct CompletionCriteria {
    pub test_command: Option<String>,
    pub lint_command: Option<String>,
    pub custom_command: Option<String>,
    pub required_files: Vec<PathBuf>,
    pub min_coverage: Option<f64>,
    pub coverage_command: Option<String>,
    pub artifact_validator_command: Option<String>,
}

/// What the caller (the workflow orchestrator) has already gathered for
/// one phase iteration. Dynamic run state lives in `ResolutionContext`;
/// this struct describes the phase definition itself.
pub struct PhaseRequest<'a> {
    pub task_id: &'a str,
    pub phase_id: &'a str,
    pub phase_index: u32,
    pub weight: Weight,
    pub prompt_template: &'a str,
    pub schema: CompletionSchema,
    pub max_iterations: u32,
    pub checkpoint_frequency: u32,
    pub turn_max: Duration,
    pub idle_timeout: Duration,
    pub idle_escalates: bool,
    pub variable_defs: &'a [VariableDef],
    pub criteria: &'a CompletionCriteria,
    pub artifact_kind: Option<ArtifactKind>,
    pub worktree_path: &'a Path,
    pub project_root: &'a Path,
}

#[derive(Debug, Clone)]
pub enum PhaseOutcome {
    Completed { artifact_path: Option<String>, summary: String },
    Blocked { reason: String },
    Stuck { iteration: u32, signature: String },
    MaxIterationsExhausted { iterations: u32 },
    Skipped { reason: String },
}

/// Whether a phase configured for artifact-skip should run at all.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactSkipDecision {
    Proceed,
    Skip(String),
    Prompt(String),
}

/// Checks whether a prior artifact for this phase already satisfies the
/// phase's weight-specific minimum, per the configured `artifact_skip`
/// policy. `Skip` is returned only when the policy names this weight as
/// auto-skippable; otherwise a human/event-bus prompt is requested.
pub fn artifact_skip_decision(
    phase_id: &str,
    weight: Weight,
    skip_cfg: &ArtifactSkipConfig,
    prior_artifact: Option<&Artifact>,
) -> ArtifactSkipDecision {
    if !skip_cfg.skip_phases.iter().any(|p| p == phase_id) {
        return ArtifactSkipDecision::Proceed;
    }
    let Some(artifact) = prior_artifact else {
        return ArtifactSkipDecision::Proceed;
    };
    if artifact.content_hash.is_empty() {
        return ArtifactSkipDecision::Proceed;
    }

    let reason = format!(
        "prior {} artifact at {} (committed {}) satisfies weight {}",
        phase_id, artifact.path, artifact.committed_at, weight
    );
    if skip_cfg.skip_for_weights.iter().any(|w| w == &weight.to_string()) {
        ArtifactSkipDecision::Skip(reason)
    } else {
        ArtifactSkipDecision::Prompt(reason)
    }
}

/// Renders the phase's prompt by resolving its variable definitions
/// against the run's resolution context.
pub async fn build_prompt(
    req: &PhaseRequest<'_>,
    ctx: &ResolutionContext,
    cache: &VariableCache,
) -> Result<String, OrcError> {
    let vars = resolve(req.variable_defs, ctx, req.project_root, cache).await?;
    let (rendered, missing) = interpolate(req.prompt_template, &vars, true);
    if !missing.is_empty() {
        log_warn!(
            "phase '{}' prompt references unresolved variables: {:?}",
            req.phase_id,
            missing
        );
    }
    Ok(rendered)
}

async fn run_check_command(command: &str, cwd: &Path) -> Result<bool, OrcError> {
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .status()
        .await
        .map_err(|e| OrcError::Subprocess(format!("completion check '{command}' failed to run: {e}")))?;
    Ok(status.success())
}

async fn run_coverage_command(command: &str, cwd: &Path) -> Result<f64, OrcError> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| OrcError::Subprocess(format!("coverage command '{command}' failed to run: {e}")))?;
    let text = String::from_utf8_lossy(&output.stdout);
    text.trim()
        .parse::<f64>()
        .map_err(|e| OrcError::Subprocess(format!("coverage command produced non-numeric output: {e}")))
}

/// Evaluates every configured deterministic criterion; all must hold for
/// the phase to be allowed to exit its loop on a `complete` status.
pub async fn deterministic_criteria_hold(
    criteria: &CompletionCriteria,
    worktree_path: &Path,
) -> Result<bool, OrcError> {
    for f in &criteria.required_files {
        if !worktree_path.join(f).exists() {
            return Ok(false);
        }
    }
    if let Some(ref cmd) = criteria.test_command {
        if !run_check_command(cmd, worktree_path).await? {
            return Ok(false);
        }
    }
    if let Some(ref cmd) = criteria.lint_command {
        if !run_check_command(cmd, worktree_path).await? {
            return Ok(false);
        }
    }
    if let Some(ref cmd) = criteria.custom_command {
        if !run_check_command(cmd, worktree_path).await? {
            return Ok(false);
        }
    }
    if let Some(ref cmd) = criteria.artifact_validator_command {
        if !run_check_command(cmd, worktree_path).await? {
            return Ok(false);
        }
    }
    if let (Some(min), Some(ref cmd)) = (criteria.min_coverage, &criteria.coverage_command) {
        let actual = run_coverage_command(cmd, worktree_path).await?;
        if actual < min {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Pulls the error-signal lines (`error:`/`Error:`/`FAILED`) out of turn
/// output, normalizes away timestamps/paths/line-col locations, and
/// truncates to a fixed length so near-identical failures hash alike.
pub fn extract_error_signature(output: &str) -> String {
    let lines: Vec<&str> = output
        .lines()
        .filter(|l| {
            let trimmed = l.trim_start();
            trimmed.starts_with("error:")
                || trimmed.starts_with("Error:")
                || trimmed.contains("FAILED")
        })
        .collect();
    if lines.is_empty() {
        return String::new();
    }
    let normalized = normalize_signature(&lines.join("\n"));
    truncate_chars(&normalized, SIGNATURE_MAX_CHARS)
}

fn normalize_signature(s: &str) -> String {
    s.split_whitespace().map(normalize_token).collect::<Vec<_>>().join(" ")
}

fn normalize_token(token: &str) -> String {
    let trimmed = token.trim_matches(|c: char| matches!(c, ',' | ';' | ')' | '(' | '"'));
    if trimmed.contains('/') && trimmed.len() > 1 {
        return "<path>".to_string();
    }
    if looks_like_timestamp(trimmed) {
        return "<timestamp>".to_string();
    }
    if looks_like_loc(trimmed) {
        return "<loc>".to_string();
    }
    token.to_string()
}

fn looks_like_timestamp(s: &str) -> bool {
    let digits = s.chars().filter(char::is_ascii_digit).count();
    digits >= 8 && s.contains('-') && (s.contains('T') || s.contains(':'))
}

fn looks_like_loc(s: &str) -> bool {
    !s.is_empty()
        && s.contains(':')
        && s.chars().all(|c| c.is_ascii_digit() || c == ':')
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

pub fn signature_hash(signature: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    signature.hash(&mut hasher);
    hasher.finish()
}

/// Tracks the last `STUCK_WINDOW` iterations' error signatures for one
/// phase run. An empty signature (turn produced no recognizable error
/// lines) always resets the window rather than counting toward stuck.
#[derive(Default)]
pub struct StuckDetector {
    recent: Vec<u64>,
    last_signature: String,
}

impl StuckDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one iteration's turn output; returns `Some(signature)` if
    /// the most recent `STUCK_WINDOW` iterations produced the same
    /// non-empty signature.
    pub fn record(&mut self, output: &str) -> Option<String> {
        let signature = extract_error_signature(output);
        if signature.is_empty() {
            self.recent.clear();
            self.last_signature.clear();
            return None;
        }
        let hash = signature_hash(&signature);
        self.recent.push(hash);
        if self.recent.len() > STUCK_WINDOW {
            self.recent.remove(0);
        }
        self.last_signature = signature.clone();
        if self.recent.len() == STUCK_WINDOW && self.recent.iter().all(|h| *h == hash) {
            Some(signature)
        } else {
            None
        }
    }
}

fn checkpoint_commit_message(task_id: &str, phase_id: &str, iteration: u32) -> String {
    format!("[orc] {task_id}: {phase_id} - checkpoint {iteration}")
}

fn completion_commit_message(task_id: &str, phase_id: &str, summary: &str) -> String {
    let summary = summary.trim();
    if summary.is_empty() {
        format!("[orc] {task_id}: {phase_id} - complete")
    } else {
        format!("[orc] {task_id}: {phase_id} - complete\n\n{summary}")
    }
}

fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Commits whatever is currently staged/modified in the worktree, if
/// anything is. Returns `None` when there was nothing to commit.
fn checkpoint_if_dirty(worktree_path: &Path, message: &str) -> Result<Option<String>, OrcError> {
    let status = git::get_status(Some(worktree_path)).map_err(OrcError::Git)?;
    if status.is_empty() {
        return Ok(None);
    }
    let paths: Vec<&Path> = status.iter().map(|e| Path::new(e.path.as_str())).collect();
    git::stage_paths(&paths, Some(worktree_path)).map_err(OrcError::Git)?;
    let sha = git::commit(message, Some(worktree_path)).map_err(OrcError::Git)?;
    Ok(Some(sha))
}

/// Runs one phase's bounded iteration loop to completion, blockage,
/// stuck detection, or iteration exhaustion. Persists `PhaseState` after
/// every iteration so a crash mid-loop resumes from the last checkpoint.
pub async fn run_phase(
    store: &StoreHandle,
    runner: &impl TurnRunner,
    req: &PhaseRequest<'_>,
    ctx: &mut ResolutionContext,
    cache: &VariableCache,
) -> Result<PhaseOutcome, OrcError> {
    let mut state = PhaseState::pending(req.task_id, req.phase_id);
    state.status = PhaseStatus::Running;
    state.started_at = Some(Utc::now());
    store.upsert_phase_state(state.clone()).await?;

    let mut detector = StuckDetector::new();

    for iteration in 1..=req.max_iterations {
        ctx.iteration = iteration;
        let prompt = build_prompt(req, ctx, cache).await?;

        let input = TurnInput {
            prompt,
            working_dir: req.worktree_path.to_path_buf(),
            schema: req.schema,
            turn_max: req.turn_max,
            idle_timeout: req.idle_timeout,
            idle_escalates: req.idle_escalates,
        };

        let output = runner.run_turn(&input).await?;

        let filename = transcript_filename(req.phase_index, req.phase_id, iteration);
        let path = transcript_path(req.project_root, req.task_id, &filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &output.transcript).await?;

        state.iteration_count = iteration;

        match output.completion.status {
            CompletionStatus::Complete => {
                if deterministic_criteria_hold(req.criteria, req.worktree_path).await? {
                    let summary = output.completion.summary.clone().unwrap_or_default();
                    let message = completion_commit_message(req.task_id, req.phase_id, &summary);
                    let sha = checkpoint_if_dirty(req.worktree_path, &message)?;

                    let artifact_path = if let Some(kind) = req.artifact_kind.clone() {
                        let path = output
                            .completion
                            .artifact
                            .clone()
                            .unwrap_or_else(|| format!("{}.md", req.phase_id));
                        let bytes = tokio::fs::read(req.worktree_path.join(&path))
                            .await
                            .unwrap_or_default();
                        let artifact = Artifact {
                            task_id: req.task_id.to_string(),
                            phase_id: req.phase_id.to_string(),
                            kind,
                            path: path.clone(),
                            content_hash: content_hash(&bytes),
                            committed_at: Utc::now(),
                        };
                        store.upsert_artifact(artifact).await?;
                        Some(path)
                    } else {
                        None
                    };

                    state.status = PhaseStatus::Completed;
                    state.completed_at = Some(Utc::now());
                    state.last_checkpoint = sha.or(state.last_checkpoint);
                    state.artifact_ref = artifact_path.clone();
                    store.upsert_phase_state(state.clone()).await?;

                    log_info!("phase '{}' completed at iteration {}", req.phase_id, iteration);
                    return Ok(PhaseOutcome::Completed { artifact_path, summary });
                }
                log_info!(
                    "phase '{}' reported complete at iteration {} but deterministic criteria failed; continuing",
                    req.phase_id,
                    iteration
                );
            }
            CompletionStatus::Blocked => {
                let reason = output
                    .completion
                    .reason
                    .clone()
                    .or_else(|| output.completion.summary.clone())
                    .unwrap_or_else(|| "phase reported blocked with no reason".to_string());
                state.status = PhaseStatus::Blocked;
                state.completed_at = Some(Utc::now());
                state.error_text = Some(reason.clone());
                store.upsert_phase_state(state.clone()).await?;
                return Ok(PhaseOutcome::Blocked { reason });
            }
            _ => {}
        }

        if iteration % req.checkpoint_frequency == 0 {
            let message = checkpoint_commit_message(req.task_id, req.phase_id, iteration);
            state.last_checkpoint = checkpoint_if_dirty(req.worktree_path, &message)?.or(state.last_checkpoint.clone());
        }

        if let Some(signature) = detector.record(&output.transcript) {
            state.status = PhaseStatus::Failed;
            state.completed_at = Some(Utc::now());
            state.error_text = Some(format!("stuck: {signature}"));
            store.upsert_phase_state(state.clone()).await?;
            return Ok(PhaseOutcome::Stuck { iteration, signature });
        }

        store.upsert_phase_state(state.clone()).await?;
    }

    state.status = PhaseStatus::Failed;
    state.completed_at = Some(Utc::now());
    state.error_text = Some(format!(
        "exhausted {} iterations without completion",
        req.max_iterations
    ));
    store.upsert_phase_state(state.clone()).await?;
    Ok(PhaseOutcome::MaxIterationsExhausted { iterations: req.max_iterations })
}
