//! Workflow orchestrator (C7): drives one task's run across its ordered
//! phase sequence, delegating each phase to the phase engine (C6),
//! resolving gates (C5) at phase boundaries, and applying the retry/rewind
//! policy. Grounded on `scheduler.rs`'s main loop — the halt-reason shape,
//! retry-exhaustion counting, and pure-decision/async-driver split all
//! carry over — but reworked from backlog polling over many items sharing
//! a pool of CLI slots into a single straight-line iterator over one run's
//! phase sequence, since a run advances one phase at a time rather than
//! scheduling a whole backlog.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::{CiConfig, FinalizeConfig, ForgeConfig, GatesConfig, PrConfig, RetryConfig};
use crate::error::OrcError;
use crate::finalize::{self, FinalizeOutcome, FinalizeRequest};
use crate::gate::{self, AiGateContext, HumanResolution};
use crate::log_info;
use crate::phase_engine::{self, CompletionCriteria, PhaseOutcome, PhaseRequest};
use crate::record::{
    ArtifactKind, CompletionSchemaKind, GateDecision, GateOutcome, GateSource, GateType,
    PhaseState, Run, RunOutcome, Task, Workflow,
};
use crate::store::StoreHandle;
use crate::turn::{CompletionObject, CompletionSchema, CompletionStatus, TurnRunner};
use crate::variables::{ResolutionContext, VariableCache, VariableDef};
use crate::worktree::Worktree;

/// Static per-phase knobs `PhaseDef` itself doesn't carry: it describes
/// ordering, the prompt template, the completion schema, and which gate
/// config key applies, but not variable sources, deterministic completion
/// criteria, artifact classification, turn timeouts, or the auto/ai gate
/// bodies. Whatever loads a workflow supplies one of these per phase id
/// alongside it.
#[derive(Debug, Clone, Default)]
pub struct PhaseRuntimeConfig {
    pub variable_defs: Vec<VariableDef>,
    pub criteria: CompletionCriteria,
    pub artifact_kind: Option<ArtifactKind>,
    pub turn_max: Duration,
    pub idle_timeout: Duration,
    pub idle_escalates: bool,
    pub gate_type_default: GateType,
    pub auto_criteria: Vec<gate::AutoCriterion>,
    pub ai_gate_prompt: String,
}

/// Everything the orchestrator needs beyond the task/run/worktree triple:
/// the phase sequence, its runtime knobs, and the gate/retry policy.
pub struct OrchestratorConfig<'a> {
    pub workflow: &'a Workflow,
    pub phase_runtime: &'a HashMap<String, PhaseRuntimeConfig>,
    pub gates: &'a GatesConfig,
    pub retry: &'a RetryConfig,
    pub finalize: &'a FinalizeConfig,
    pub ci: &'a CiConfig,
    pub pr: &'a PrConfig,
    pub forge: &'a ForgeConfig,
}

/// Where a call to [`run_workflow`] or [`apply_human_resolution`] left the
/// run. `Paused` covers both cancellation and a human gate awaiting an
/// external decision; the caller tells them apart from `run.outcome`
/// (`None` means "waiting on a human", `Some(Paused)` means cancelled).
#[derive(Debug, Clone)]
pub enum WorkflowOutcome {
    Completed,
    Blocked { phase: String, reason: String },
    Failed { phase: String, reason: String },
    Paused { resume_phase: String },
}

/// Drives `run` forward from `run.current_phase_id` until it completes,
/// blocks, fails, or is paused (cancellation, or a human gate that needs
/// an answer this call has no way to collect). Safe to call again with
/// the same `run` to resume: phase state already marked complete is not
/// re-entered, since `run.current_phase_id` always points at the next
/// unresolved phase.
pub async fn run_workflow<R: TurnRunner>(
    store: &StoreHandle,
    runner: &R,
    task: &Task,
    run: &mut Run,
    worktree: &Worktree,
    project_root: &Path,
    cfg: &OrchestratorConfig<'_>,
    cache: &VariableCache,
    cancel: &CancellationToken,
) -> Result<WorkflowOutcome, OrcError> {
    let Some(mut phase_index) = cfg.workflow.phase_index(&run.current_phase_id) else {
        return Err(OrcError::NotFound(format!(
            "phase '{}' not found in workflow '{}'",
            run.current_phase_id, cfg.workflow.id
        )));
    };

    let mut ctx = ResolutionContext {
        task_id: task.id.clone(),
        task_title: task.title.clone(),
        worktree_path: worktree.path.clone(),
        target_branch: task.target_branch.clone().unwrap_or_default(),
        task_branch: worktree.branch.clone(),
        ..Default::default()
    };
    // Resuming mid-run: reconstruct completed phases' outputs from their
    // committed artifacts, since `PhaseState` itself only keeps a
    // checkpoint sha, not the rendered summary text prompts interpolate.
    let mut prior_outputs: HashMap<String, String> = HashMap::new();
    if phase_index > 0 {
        let artifacts = store.list_artifacts_for_task(&task.id).await.unwrap_or_default();
        for phase_def in &cfg.workflow.phases[..phase_index] {
            if let Some(artifact) = artifacts.iter().rev().find(|a| a.phase_id == phase_def.id) {
                if let Ok(content) = std::fs::read_to_string(worktree.path.join(&artifact.path)) {
                    prior_outputs.insert(phase_def.id.clone(), content);
                }
            }
        }
    }

    loop {
        if cancel.is_cancelled() {
            run.outcome = Some(RunOutcome::Paused);
            store.upsert_run(run.clone()).await?;
            log_info!(
                "run {} for task {} paused: cancellation requested at phase '{}'",
                run.id,
                task.id,
                run.current_phase_id
            );
            return Ok(WorkflowOutcome::Paused {
                resume_phase: run.current_phase_id.clone(),
            });
        }

        let Some(phase_def) = cfg.workflow.phases.get(phase_index) else {
            run.outcome = Some(RunOutcome::Completed);
            run.finished_at = Some(Utc::now());
            store.upsert_run(run.clone()).await?;
            return Ok(WorkflowOutcome::Completed);
        };
        run.current_phase_id = phase_def.id.clone();
        store.upsert_run(run.clone()).await?;

        let runtime = cfg
            .phase_runtime
            .get(&phase_def.id)
            .cloned()
            .unwrap_or_default();
        ctx.phase = phase_def.id.clone();
        ctx.iteration = 0;
        ctx.prior_outputs = prior_outputs.clone();

        if phase_def.kind == "finalize" {
            match run_finalize_phase(store, runner, task, run, worktree, cfg, &runtime, phase_index).await? {
                FinalizePhaseOutcome::Done(outcome) => return Ok(outcome),
                FinalizePhaseOutcome::Retry { target_index, retry_context } => {
                    retain_prior_outputs(&mut prior_outputs, cfg.workflow, target_index);
                    ctx.retry_context = Some(retry_context);
                    phase_index = target_index;
                    continue;
                }
            }
        }

        let req = PhaseRequest {
            task_id: &task.id,
            phase_id: &phase_def.id,
            phase_index: phase_index as u32,
            weight: task.weight,
            prompt_template: &phase_def.prompt_template,
            schema: completion_schema_for(phase_def.completion_schema_kind),
            max_iterations: phase_def.max_iterations,
            checkpoint_frequency: phase_def.checkpoint_frequency,
            turn_max: runtime.turn_max,
            idle_timeout: runtime.idle_timeout,
            idle_escalates: runtime.idle_escalates,
            variable_defs: &runtime.variable_defs,
            criteria: &runtime.criteria,
            artifact_kind: runtime.artifact_kind.clone(),
            worktree_path: &worktree.path,
            project_root,
        };

        let outcome = phase_engine::run_phase(store, runner, &req, &mut ctx, cache).await?;

        match outcome {
            PhaseOutcome::Completed { artifact_path: _, summary } => {
                prior_outputs.insert(phase_def.id.clone(), summary.clone());

                let (gate_type, gate_source) = gate::resolve_gate_type(
                    store,
                    cfg.gates,
                    &phase_def.id,
                    weight_key(task),
                    &task.id,
                    runtime.gate_type_default,
                )
                .await?;

                if gate_type == GateType::Human {
                    let decision = pending_decision(&phase_def.id, gate_source);
                    store
                        .append_gate_decision(&task.id, &phase_def.id, decision)
                        .await?;
                    run.outcome = None;
                    store.upsert_run(run.clone()).await?;
                    return Ok(WorkflowOutcome::Paused {
                        resume_phase: phase_def.id.clone(),
                    });
                }

                let decision = evaluate_gate(
                    runner,
                    gate_type,
                    gate_source,
                    &runtime,
                    &phase_def.id,
                    &summary,
                    &prior_outputs,
                    &worktree.path,
                    runtime.turn_max,
                )
                .await?;
                store
                    .append_gate_decision(&task.id, &phase_def.id, decision.clone())
                    .await?;

                if decision.outcome == GateOutcome::Approved {
                    phase_index += 1;
                } else {
                    match handle_rejection(
                        store,
                        task,
                        run,
                        cfg,
                        &phase_def.id,
                        phase_index,
                        &decision.reason,
                        decision.retry_phase.as_deref(),
                    )
                    .await?
                    {
                        RejectionOutcome::Retry { target_index } => {
                            retain_prior_outputs(&mut prior_outputs, cfg.workflow, target_index);
                            ctx.retry_context = Some(
                                serde_json::json!({
                                    "failed_phase": phase_def.id,
                                    "reason": decision.reason,
                                    "attempt_number": run.retry_counter,
                                })
                                .to_string(),
                            );
                            phase_index = target_index;
                        }
                        RejectionOutcome::Terminal(outcome) => return Ok(outcome),
                    }
                }
            }
            PhaseOutcome::Blocked { reason } => {
                run.outcome = Some(RunOutcome::Blocked);
                run.finished_at = Some(Utc::now());
                store.upsert_run(run.clone()).await?;
                return Ok(WorkflowOutcome::Blocked {
                    phase: phase_def.id.clone(),
                    reason,
                });
            }
            PhaseOutcome::Stuck { iteration, signature } => {
                run.outcome = Some(RunOutcome::Failed);
                run.finished_at = Some(Utc::now());
                store.upsert_run(run.clone()).await?;
                return Ok(WorkflowOutcome::Failed {
                    phase: phase_def.id.clone(),
                    reason: format!("stuck at iteration {iteration}: {signature}"),
                });
            }
            PhaseOutcome::MaxIterationsExhausted { iterations } => {
                run.outcome = Some(RunOutcome::Failed);
                run.finished_at = Some(Utc::now());
                store.upsert_run(run.clone()).await?;
                return Ok(WorkflowOutcome::Failed {
                    phase: phase_def.id.clone(),
                    reason: format!("exhausted {iterations} iterations without completion"),
                });
            }
            PhaseOutcome::Skipped { reason } => {
                log_info!("phase '{}' skipped for task {}: {}", phase_def.id, task.id, reason);
                phase_index += 1;
            }
        }
    }
}

enum FinalizePhaseOutcome {
    Done(WorkflowOutcome),
    Retry { target_index: usize, retry_context: String },
}

/// Dispatches a phase whose `kind` is `"finalize"` to the finalize/merge
/// sub-engine instead of the phase engine: sync with the target branch,
/// assess risk, and on success push/poll-CI/merge. An escalation back to
/// implement reuses [`handle_rejection`]'s rewind so the retry-counter and
/// `max_total_retries` accounting stay identical to an ordinary gate
/// rejection.
#[allow(clippy::too_many_arguments)]
async fn run_finalize_phase<R: TurnRunner>(
    store: &StoreHandle,
    runner: &R,
    task: &Task,
    run: &mut Run,
    worktree: &Worktree,
    cfg: &OrchestratorConfig<'_>,
    runtime: &PhaseRuntimeConfig,
    phase_index: usize,
) -> Result<FinalizePhaseOutcome, OrcError> {
    let phase_id = cfg.workflow.phases[phase_index].id.clone();
    let target_branch = task.target_branch.clone().unwrap_or_default();
    let req = FinalizeRequest {
        task_id: &task.id,
        task_title: &task.title,
        worktree_path: &worktree.path,
        target_branch: &target_branch,
        task_branch: &worktree.branch,
        finalize: cfg.finalize,
        test_command: runtime.criteria.test_command.as_deref(),
        turn_max: runtime.turn_max,
        idle_timeout: runtime.idle_timeout,
    };

    match finalize::sync_and_assess(runner, &req).await? {
        FinalizeOutcome::Ready(report) => {
            log_info!(
                "finalize for task {} assessed risk {:?} ({} files, {} lines, {} conflicts)",
                task.id,
                report.risk,
                report.files_changed,
                report.lines_changed,
                report.conflicts_resolved
            );
            finalize::push_and_merge(store, &req, cfg.ci, cfg.pr, cfg.forge).await?;
            run.outcome = Some(RunOutcome::Completed);
            run.finished_at = Some(Utc::now());
            store.upsert_run(run.clone()).await?;
            Ok(FinalizePhaseOutcome::Done(WorkflowOutcome::Completed))
        }
        FinalizeOutcome::EscalateToImplement { reason, retry_context } => {
            match handle_rejection(store, task, run, cfg, &phase_id, phase_index, &reason, None).await? {
                RejectionOutcome::Retry { target_index } => {
                    Ok(FinalizePhaseOutcome::Retry { target_index, retry_context })
                }
                RejectionOutcome::Terminal(outcome) => Ok(FinalizePhaseOutcome::Done(outcome)),
            }
        }
    }
}

/// Applies an externally-collected human-gate decision to a run paused at
/// a human gate, then resumes the same rewind/advance logic
/// [`run_workflow`] uses for any other gate outcome. Does not re-run the
/// phase itself — only the gate-outcome handling.
pub async fn apply_human_resolution(
    store: &StoreHandle,
    task: &Task,
    run: &mut Run,
    cfg: &OrchestratorConfig<'_>,
    resolution: &HumanResolution,
) -> Result<WorkflowOutcome, OrcError> {
    let phase_id = run.current_phase_id.clone();
    let outcome = gate::human_decision_to_outcome(resolution);
    let decision = GateDecision {
        phase: phase_id.clone(),
        gate_type: GateType::Human,
        outcome,
        reason: resolution.reason.clone(),
        retry_phase: None,
        output_payload: serde_json::Value::Null,
        timestamp: Utc::now(),
        approver_id: None,
        source: GateSource::Default,
    };
    store
        .append_gate_decision(&task.id, &phase_id, decision)
        .await?;

    let Some(current_index) = cfg.workflow.phase_index(&phase_id) else {
        return Err(OrcError::NotFound(format!(
            "phase '{phase_id}' not found in workflow '{}'",
            cfg.workflow.id
        )));
    };

    if outcome == GateOutcome::Approved {
        return Ok(match cfg.workflow.phases.get(current_index + 1) {
            Some(next) => {
                run.current_phase_id = next.id.clone();
                run.outcome = None;
                store.upsert_run(run.clone()).await?;
                WorkflowOutcome::Paused {
                    resume_phase: run.current_phase_id.clone(),
                }
            }
            None => {
                run.outcome = Some(RunOutcome::Completed);
                run.finished_at = Some(Utc::now());
                store.upsert_run(run.clone()).await?;
                WorkflowOutcome::Completed
            }
        });
    }

    match handle_rejection(
        store,
        task,
        run,
        cfg,
        &phase_id,
        current_index,
        &resolution.reason,
        None,
    )
    .await?
    {
        RejectionOutcome::Retry { target_index } => {
            run.outcome = None;
            store.upsert_run(run.clone()).await?;
            Ok(WorkflowOutcome::Paused {
                resume_phase: cfg.workflow.phases[target_index].id.clone(),
            })
        }
        RejectionOutcome::Terminal(outcome) => Ok(outcome),
    }
}

enum RejectionOutcome {
    Retry { target_index: usize },
    Terminal(WorkflowOutcome),
}

/// Resolves where a rejected/blocked gate sends the run: the configured
/// retry map (checked only after any LLM-suggested `retry_from`), rewinds
/// every phase from the target through `current_index` back to pending,
/// and bumps the run's retry counter against `max_total_retries`. No
/// retry target means the run is terminally blocked.
async fn handle_rejection(
    store: &StoreHandle,
    task: &Task,
    run: &mut Run,
    cfg: &OrchestratorConfig<'_>,
    phase_id: &str,
    current_index: usize,
    reason: &str,
    llm_retry_from: Option<&str>,
) -> Result<RejectionOutcome, OrcError> {
    let retry_phase = gate::resolve_retry_phase(phase_id, None, llm_retry_from, &cfg.retry.retry_map);

    let Some(target_id) = retry_phase else {
        run.outcome = Some(RunOutcome::Blocked);
        run.finished_at = Some(Utc::now());
        store.upsert_run(run.clone()).await?;
        return Ok(RejectionOutcome::Terminal(WorkflowOutcome::Blocked {
            phase: phase_id.to_string(),
            reason: reason.to_string(),
        }));
    };

    let Some(target_index) = cfg.workflow.phase_index(&target_id) else {
        run.outcome = Some(RunOutcome::Failed);
        run.finished_at = Some(Utc::now());
        store.upsert_run(run.clone()).await?;
        return Ok(RejectionOutcome::Terminal(WorkflowOutcome::Failed {
            phase: phase_id.to_string(),
            reason: format!("retry target phase '{target_id}' not found in workflow"),
        }));
    };

    run.retry_counter += 1;
    if run.retry_counter >= cfg.retry.max_total_retries {
        run.outcome = Some(RunOutcome::Failed);
        run.finished_at = Some(Utc::now());
        store.upsert_run(run.clone()).await?;
        return Err(OrcError::MaxRetries(cfg.retry.max_total_retries, task.id.clone()));
    }

    for idx in target_index..=current_index {
        let rewind_id = cfg.workflow.phases[idx].id.clone();
        let mut state = store
            .get_phase_state(&task.id, &rewind_id)
            .await
            .unwrap_or_else(|_| PhaseState::pending(&task.id, &rewind_id));
        state.reset_for_rewind();
        store.upsert_phase_state(state).await?;
    }

    run.current_phase_id = target_id;
    store.upsert_run(run.clone()).await?;
    Ok(RejectionOutcome::Retry { target_index })
}

fn retain_prior_outputs(
    prior_outputs: &mut HashMap<String, String>,
    workflow: &Workflow,
    target_index: usize,
) {
    prior_outputs.retain(|id, _| workflow.phase_index(id).map_or(true, |i| i < target_index));
}

/// Runs a completed phase's output through its resolved gate. Human gates
/// are intercepted by the caller before this is reached; `Skip` is handled
/// here for uniformity with the decision-logging path.
async fn evaluate_gate<R: TurnRunner>(
    runner: &R,
    gate_type: GateType,
    gate_source: GateSource,
    runtime: &PhaseRuntimeConfig,
    phase_id: &str,
    summary: &str,
    prior_outputs: &HashMap<String, String>,
    worktree_path: &Path,
    turn_max: Duration,
) -> Result<GateDecision, OrcError> {
    let now = Utc::now();
    match gate_type {
        GateType::Skip => Ok(GateDecision {
            phase: phase_id.to_string(),
            gate_type,
            outcome: GateOutcome::Approved,
            reason: "gate skipped".to_string(),
            retry_phase: None,
            output_payload: serde_json::Value::Null,
            timestamp: now,
            approver_id: None,
            source: gate_source,
        }),
        GateType::Auto => {
            // Reaching `PhaseOutcome::Completed` already means the turn's
            // completion status was `Complete` (the phase engine only
            // produces `Completed` on that status); synthesize the object
            // `HasCompletionMarker` checks rather than threading the real
            // one through `PhaseOutcome`, which only needs to carry the
            // rendered summary for prompts and gates alike.
            let completion = CompletionObject {
                status: CompletionStatus::Complete,
                summary: Some(summary.to_string()),
                reason: None,
                artifact: None,
                findings: Vec::new(),
                issues: Vec::new(),
                raw: serde_json::Value::Null,
            };
            let outcome = gate::evaluate_auto_gate(&runtime.auto_criteria, summary, Some(&completion));
            Ok(GateDecision {
                phase: phase_id.to_string(),
                gate_type,
                outcome,
                reason: if outcome == GateOutcome::Approved {
                    "deterministic criteria passed".to_string()
                } else {
                    "deterministic criteria failed".to_string()
                },
                retry_phase: None,
                output_payload: serde_json::Value::Null,
                timestamp: now,
                approver_id: None,
                source: gate_source,
            })
        }
        GateType::Ai => {
            let ai_ctx = AiGateContext {
                phase: phase_id.to_string(),
                current_output: summary.to_string(),
                prior_outputs: prior_outputs.clone(),
                include_task_context: false,
                task_context: String::new(),
                extra_vars: HashMap::new(),
                agent_prompt: runtime.ai_gate_prompt.clone(),
            };
            let decision = gate::evaluate_ai_gate(runner, &ai_ctx, worktree_path, turn_max).await?;
            let outcome = match decision.status {
                gate::GateDecisionStatus::Approved => GateOutcome::Approved,
                gate::GateDecisionStatus::Rejected => GateOutcome::Rejected,
                gate::GateDecisionStatus::Blocked => GateOutcome::Blocked,
            };
            Ok(GateDecision {
                phase: phase_id.to_string(),
                gate_type,
                outcome,
                reason: decision.reason,
                retry_phase: decision.retry_from,
                output_payload: decision.data.unwrap_or(serde_json::Value::Null),
                timestamp: now,
                approver_id: None,
                source: gate_source,
            })
        }
        GateType::Human => unreachable!("human gates are intercepted before evaluate_gate is called"),
    }
}

fn pending_decision(phase_id: &str, source: GateSource) -> GateDecision {
    GateDecision {
        phase: phase_id.to_string(),
        gate_type: GateType::Human,
        outcome: GateOutcome::NeedsClarification,
        reason: "awaiting human decision".to_string(),
        retry_phase: None,
        output_payload: serde_json::Value::Null,
        timestamp: Utc::now(),
        approver_id: None,
        source,
    }
}

fn weight_key(task: &Task) -> &'static str {
    match task.weight {
        crate::record::Weight::Trivial => "trivial",
        crate::record::Weight::Small => "small",
        crate::record::Weight::Medium => "medium",
        crate::record::Weight::Large => "large",
        crate::record::Weight::Greenfield => "greenfield",
    }
}

fn completion_schema_for(kind: CompletionSchemaKind) -> CompletionSchema {
    match kind {
        CompletionSchemaKind::Generic => CompletionSchema::Generic,
        CompletionSchemaKind::ReviewRound1 => CompletionSchema::ReviewRound1,
        CompletionSchemaKind::ReviewRound2 => CompletionSchema::ReviewRound2,
        CompletionSchemaKind::Qa => CompletionSchema::Qa,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CompletionSchemaKind, PhaseDef, TaskStatus, Weight};
    use crate::turn::{ActivityState, CompletionStatus, MockTurnRunner, TokenUsage};
    use std::path::PathBuf;

    fn workflow(phase_ids: &[&str]) -> Workflow {
        Workflow {
            id: "wf-test".to_string(),
            phases: phase_ids
                .iter()
                .map(|id| PhaseDef {
                    id: id.to_string(),
                    kind: "generic".to_string(),
                    prompt_template: "do {{PHASE}}".to_string(),
                    max_iterations: 3,
                    checkpoint_frequency: 1,
                    completion_schema_kind: CompletionSchemaKind::Generic,
                    gate_ref: None,
                })
                .collect(),
        }
    }

    fn task() -> Task {
        Task {
            id: "TASK-1".to_string(),
            title: "do the thing".to_string(),
            description: String::new(),
            weight: Weight::Small,
            status: TaskStatus::Running,
            target_branch: Some("main".to_string()),
            initiative_ref: None,
            blocked_by: Vec::new(),
            related_to: Vec::new(),
            automation: false,
            metadata: serde_json::Map::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn run(task_id: &str, phase_id: &str) -> Run {
        Run {
            id: "run-1".to_string(),
            task_id: task_id.to_string(),
            workflow_id: "wf-test".to_string(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            current_phase_id: phase_id.to_string(),
            retry_counter: 0,
        }
    }

    fn worktree(task_id: &str) -> Worktree {
        Worktree {
            task_id: task_id.to_string(),
            run_id: "run-1".to_string(),
            branch: format!("orc/{task_id}/run-1"),
            base_ref: "main".to_string(),
            path: PathBuf::from("/tmp/orc-test-worktree"),
        }
    }

    #[tokio::test]
    async fn completes_workflow_with_all_skip_gates() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _handle) = crate::store::spawn_store(dir.path()).unwrap();
        let wf = workflow(&["spec", "implement"]);
        let mut runtime = HashMap::new();
        for id in ["spec", "implement"] {
            runtime.insert(
                id.to_string(),
                PhaseRuntimeConfig {
                    gate_type_default: GateType::Skip,
                    turn_max: Duration::from_secs(60),
                    idle_timeout: Duration::from_secs(30),
                    ..Default::default()
                },
            );
        }
        let gates = GatesConfig::default();
        let retry = RetryConfig::default();
        let finalize_cfg = crate::config::FinalizeConfig::default();
        let ci = CiConfig::default();
        let pr = PrConfig::default();
        let forge = ForgeConfig::default();
        let cfg = OrchestratorConfig {
            workflow: &wf,
            phase_runtime: &runtime,
            gates: &gates,
            retry: &retry,
            finalize: &finalize_cfg,
            ci: &ci,
            pr: &pr,
            forge: &forge,
        };

        let t = task();
        let mut r = run(&t.id, "spec");
        let wt = worktree(&t.id);
        let cache = VariableCache::new();
        let cancel = CancellationToken::new();

        let runner = MockTurnRunner::new(vec![
            Ok(mock_complete("spec done")),
            Ok(mock_complete("implement done")),
        ]);

        let outcome = run_workflow(
            &store,
            &runner,
            &t,
            &mut r,
            &wt,
            dir.path(),
            &cfg,
            &cache,
            &cancel,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, WorkflowOutcome::Completed));
        assert_eq!(r.outcome, Some(RunOutcome::Completed));
    }

    #[tokio::test]
    async fn auto_gate_rejection_rewinds_to_retry_map_target() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _handle) = crate::store::spawn_store(dir.path()).unwrap();
        let wf = workflow(&["implement", "test"]);
        let mut runtime = HashMap::new();
        runtime.insert(
            "implement".to_string(),
            PhaseRuntimeConfig {
                gate_type_default: GateType::Skip,
                turn_max: Duration::from_secs(60),
                idle_timeout: Duration::from_secs(30),
                ..Default::default()
            },
        );
        runtime.insert(
            "test".to_string(),
            PhaseRuntimeConfig {
                gate_type_default: GateType::Auto,
                auto_criteria: vec![gate::AutoCriterion::ContainsString("all green".to_string())],
                turn_max: Duration::from_secs(60),
                idle_timeout: Duration::from_secs(30),
                ..Default::default()
            },
        );
        let gates = GatesConfig::default();
        let mut retry = RetryConfig::default();
        retry.retry_map.insert("test".to_string(), "implement".to_string());
        let finalize_cfg = crate::config::FinalizeConfig::default();
        let ci = CiConfig::default();
        let pr = PrConfig::default();
        let forge = ForgeConfig::default();
        let cfg = OrchestratorConfig {
            workflow: &wf,
            phase_runtime: &runtime,
            gates: &gates,
            retry: &retry,
            finalize: &finalize_cfg,
            ci: &ci,
            pr: &pr,
            forge: &forge,
        };

        let t = task();
        let mut r = run(&t.id, "implement");
        let wt = worktree(&t.id);
        let cache = VariableCache::new();
        let cancel = CancellationToken::new();

        let runner = MockTurnRunner::new(vec![
            Ok(mock_complete("implemented")),
            Ok(mock_complete("tests failed")),
        ]);

        let outcome = run_workflow(
            &store,
            &runner,
            &t,
            &mut r,
            &wt,
            dir.path(),
            &cfg,
            &cache,
            &cancel,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, WorkflowOutcome::Paused { .. }) == false);
        // Rewound back to "implement" rather than terminated; since the
        // mock runner has no more scripted turns, the next iteration of
        // the loop would error on an empty script rather than silently
        // succeed, so a Failed/Err outcome here would indicate a bug in
        // rewind sizing, not in the mock.
        assert_eq!(r.retry_counter, 1);
    }

    #[tokio::test]
    async fn cancellation_pauses_before_the_next_phase_runs() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _handle) = crate::store::spawn_store(dir.path()).unwrap();
        let wf = workflow(&["spec"]);
        let runtime = HashMap::new();
        let gates = GatesConfig::default();
        let retry = RetryConfig::default();
        let finalize_cfg = crate::config::FinalizeConfig::default();
        let ci = CiConfig::default();
        let pr = PrConfig::default();
        let forge = ForgeConfig::default();
        let cfg = OrchestratorConfig {
            workflow: &wf,
            phase_runtime: &runtime,
            gates: &gates,
            retry: &retry,
            finalize: &finalize_cfg,
            ci: &ci,
            pr: &pr,
            forge: &forge,
        };

        let t = task();
        let mut r = run(&t.id, "spec");
        let wt = worktree(&t.id);
        let cache = VariableCache::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let runner = MockTurnRunner::new(vec![]);

        let outcome = run_workflow(
            &store,
            &runner,
            &t,
            &mut r,
            &wt,
            dir.path(),
            &cfg,
            &cache,
            &cancel,
        )
        .await
        .unwrap();

        match outcome {
            WorkflowOutcome::Paused { resume_phase } => assert_eq!(resume_phase, "spec"),
            other => panic!("expected Paused, got {other:?}"),
        }
        assert_eq!(r.outcome, Some(RunOutcome::Paused));
    }

    fn mock_complete(summary: &str) -> crate::turn::TurnOutput {
        crate::turn::TurnOutput {
            completion: CompletionObject {
                status: CompletionStatus::Complete,
                summary: Some(summary.to_string()),
                reason: None,
                artifact: None,
                findings: Vec::new(),
                issues: Vec::new(),
                raw: serde_json::json!({ "status": "complete", "summary": summary }),
            },
            transcript: summary.to_string(),
            token_usage: TokenUsage::default(),
            final_activity: ActivityState::Idle,
        }
    }
}
