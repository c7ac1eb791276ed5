//! Gate evaluator (C5): resolves the effective gate type for a
//! (phase, weight, task) tuple via a strict precedence chain, then
//! evaluates it. No teacher module owns this concept directly; the
//! precedence-chain-as-pure-function and config-enum-dispatch idiom
//! is grounded on `config::validate`'s accumulate-all-problems style and
//! `executor::check_staleness`'s dispatch over a `StalenessAction`-shaped
//! config enum.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::config::GatesConfig;
use crate::error::OrcError;
use crate::record::{GateDecision, GateOutcome, GateSource, GateType};
use crate::store::StoreHandle;
use crate::turn::{CompletionObject, CompletionSchema, CompletionStatus, TurnInput, TurnRunner};
use crate::{log_info, log_warn};

/// Resolve the effective gate type for one phase, honoring the six-link
/// precedence chain (first match wins): task override, weight override,
/// phase override, phase-gate-from-store, enabled/disabled membership,
/// workflow default.
pub async fn resolve_gate_type(
    store: &StoreHandle,
    gates: &GatesConfig,
    phase: &str,
    weight: &str,
    task_id: &str,
    workflow_default: GateType,
) -> Result<(GateType, GateSource), OrcError> {
    if let Some(t) = gates.task_overrides.get(task_id).and_then(|m| m.get(phase)) {
        return Ok((*t, GateSource::TaskOverride));
    }
    if let Some(per_phase) = gates.weight_overrides.get(weight) {
        if let Some(t) = per_phase.get(phase) {
            return Ok((*t, GateSource::WeightOverride));
        }
    }
    if let Some(t) = gates.phase_overrides.get(phase) {
        return Ok((*t, GateSource::PhaseOverride));
    }
    if gates.phase_gate_store_enabled {
        if let Some(t) = store.get_phase_gate(phase).await? {
            return Ok((t, GateSource::PhaseGate));
        }
    }
    if gates.disabled_phases.contains(&phase.to_string()) {
        return Ok((GateType::Skip, GateSource::Disabled));
    }
    if !gates.enabled_phases.is_empty() && !gates.enabled_phases.contains(&phase.to_string()) {
        return Ok((GateType::Skip, GateSource::EnabledPhases));
    }
    Ok((workflow_default, GateSource::Default))
}

/// Deterministic criteria evaluated for an `auto` gate. All must hold.
#[derive(Debug, Clone)]
pub enum AutoCriterion {
    HasOutput,
    NoErrors,
    HasCompletionMarker,
    ContainsString(String),
}

pub fn evaluate_auto_criterion(
    criterion: &AutoCriterion,
    output_text: &str,
    completion: Option<&CompletionObject>,
) -> bool {
    match criterion {
        AutoCriterion::HasOutput => !output_text.trim().is_empty(),
        AutoCriterion::NoErrors => !output_text.to_lowercase().contains("error"),
        AutoCriterion::HasCompletionMarker => {
            matches!(completion.map(|c| &c.status), Some(CompletionStatus::Complete))
        }
        AutoCriterion::ContainsString(s) => output_text.contains(s.as_str()),
    }
}

pub fn evaluate_auto_gate(
    criteria: &[AutoCriterion],
    output_text: &str,
    completion: Option<&CompletionObject>,
) -> GateOutcome {
    let all_pass = criteria
        .iter()
        .all(|c| evaluate_auto_criterion(c, output_text, completion));
    if all_pass {
        GateOutcome::Approved
    } else {
        GateOutcome::Rejected
    }
}

/// Context passed to an `ai` gate turn: current phase output plus a
/// configured subset of prior phase outputs and extra variables.
#[derive(Debug, Clone, Default)]
pub struct AiGateContext {
    pub phase: String,
    pub current_output: String,
    pub prior_outputs: HashMap<String, String>,
    pub include_task_context: bool,
    pub task_context: String,
    pub extra_vars: HashMap<String, String>,
    pub agent_prompt: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AiGateDecision {
    pub status: GateDecisionStatus,
    pub reason: String,
    #[serde(default)]
    pub retry_from: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecisionStatus {
    Approved,
    Rejected,
    Blocked,
}

fn build_gate_prompt(ctx: &AiGateContext) -> String {
    let mut prompt = String::new();
    prompt.push_str(&ctx.agent_prompt);
    prompt.push_str("\n\n## Phase output\n\n");
    prompt.push_str(&ctx.current_output);

    if !ctx.prior_outputs.is_empty() {
        prompt.push_str("\n\n## Prior phase outputs\n\n");
        for (phase, output) in &ctx.prior_outputs {
            prompt.push_str(&format!("### {phase}\n\n{output}\n\n"));
        }
    }

    if ctx.include_task_context {
        prompt.push_str("\n\n## Task context\n\n");
        prompt.push_str(&ctx.task_context);
    }

    for (k, v) in &ctx.extra_vars {
        prompt.push_str(&format!("\n\n## {k}\n\n{v}"));
    }

    prompt.push_str(
        "\n\nRespond with a JSON completion object: \
         {\"status\": \"approved\"|\"rejected\"|\"blocked\", \"reason\": string, \
         \"retry_from\": string?, \"context\": string?, \"data\": object?}",
    );
    prompt
}

/// Runs an `ai` gate as an ordinary turn through C4 with a bespoke schema,
/// per the design note treating gate evaluation as just another turn.
pub async fn evaluate_ai_gate(
    runner: &impl TurnRunner,
    ctx: &AiGateContext,
    working_dir: &Path,
    turn_max: std::time::Duration,
) -> Result<AiGateDecision, OrcError> {
    let prompt = build_gate_prompt(ctx);
    let input = TurnInput {
        prompt,
        working_dir: working_dir.to_path_buf(),
        schema: CompletionSchema::Generic,
        turn_max,
        idle_timeout: std::time::Duration::from_secs(120),
        idle_escalates: false,
    };

    let output = runner.run_turn(&input).await?;
    serde_json::from_value(output.completion.raw).map_err(|e| OrcError::CompletionParse {
        schema: "ai_gate".to_string(),
        detail: e.to_string(),
    })
}

/// Resolves the retry-phase for a rejected/blocked gate decision: a
/// static config override wins over the LLM-suggested `retry_from`;
/// otherwise falls back to the configured retry map.
pub fn resolve_retry_phase(
    phase: &str,
    static_override: Option<&str>,
    llm_retry_from: Option<&str>,
    retry_map: &HashMap<String, String>,
) -> Option<String> {
    static_override
        .map(str::to_string)
        .or_else(|| llm_retry_from.map(str::to_string))
        .or_else(|| retry_map.get(phase).cloned())
}

/// A pending human-gate decision, held in-memory only. Cleared on process
/// restart; a resumed run re-requests (per the design note on pending
/// decisions not surviving restart).
#[derive(Debug, Clone)]
pub struct PendingDecision {
    pub id: String,
    pub task_id: String,
    pub phase: String,
    pub question: String,
    pub context: String,
    pub requested_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Default)]
pub struct PendingDecisionStore {
    inner: std::sync::RwLock<HashMap<String, PendingDecision>>,
}

impl PendingDecisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, decision: PendingDecision) {
        self.inner.write().unwrap().insert(decision.id.clone(), decision);
    }

    pub fn take(&self, id: &str) -> Option<PendingDecision> {
        self.inner.write().unwrap().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<PendingDecision> {
        self.inner.read().unwrap().get(id).cloned()
    }
}

/// Resolution an external actor supplies for a pending human decision.
#[derive(Debug, Clone)]
pub struct HumanResolution {
    pub approved: bool,
    pub reason: String,
    pub questions: Vec<String>,
}

pub fn human_decision_to_outcome(resolution: &HumanResolution) -> GateOutcome {
    if resolution.approved {
        GateOutcome::Approved
    } else if !resolution.questions.is_empty() {
        GateOutcome::NeedsClarification
    } else {
        GateOutcome::Rejected
    }
}

/// Runs the optional override script attached to a gate: the decision
/// JSON is piped to the script on stdin; a non-zero exit overrides the
/// decision to rejected with a reason taken from stderr. Infrastructure
/// failures (script missing, timeout) surface as errors, never as a
/// decision override.
pub async fn apply_override_script(
    script_path: &Path,
    decision: &GateDecision,
    project_root: &Path,
) -> Result<Option<GateDecision>, OrcError> {
    let payload = serde_json::to_vec(decision)
        .map_err(|e| OrcError::ScriptFailed { exit_code: None, stderr: e.to_string() })?;

    let mut child = Command::new(script_path)
        .current_dir(project_root)
        .env("ORC_PROJECT_ROOT", project_root)
        .env("ORC_SCRIPT_PATH", script_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| OrcError::ScriptFailed { exit_code: None, stderr: e.to_string() })?;

    {
        use tokio::io::AsyncWriteExt;
        let mut stdin = child.stdin.take().expect("piped stdin");
        stdin
            .write_all(&payload)
            .await
            .map_err(|e| OrcError::ScriptFailed { exit_code: None, stderr: e.to_string() })?;
    }

    let output = tokio::time::timeout(std::time::Duration::from_secs(10), child.wait_with_output())
        .await
        .map_err(|_| OrcError::ScriptFailed {
            exit_code: None,
            stderr: "override script timed out".to_string(),
        })?
        .map_err(|e| OrcError::ScriptFailed { exit_code: None, stderr: e.to_string() })?;

    if output.status.success() {
        log_info!("gate override script passed through decision unchanged");
        return Ok(None);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    log_warn!("gate override script overrode decision: {stderr}");

    let mut overridden = decision.clone();
    overridden.outcome = GateOutcome::Rejected;
    overridden.reason = stderr;
    Ok(Some(overridden))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gates_config() -> GatesConfig {
        GatesConfig::default()
    }

    #[tokio::test]
    async fn precedence_task_override_wins_over_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _handle) = crate::store::spawn_store(dir.path()).unwrap();

        let mut gates = gates_config();
        gates
            .task_overrides
            .entry("WRK-001".into())
            .or_default()
            .insert("review".into(), GateType::Skip);
        gates
            .phase_overrides
            .insert("review".into(), GateType::Human);

        let (gate, source) = resolve_gate_type(
            &store,
            &gates,
            "review",
            "medium",
            "WRK-001",
            GateType::Auto,
        )
        .await
        .unwrap();
        assert_eq!(gate, GateType::Skip);
        assert_eq!(source, GateSource::TaskOverride);
    }

    #[tokio::test]
    async fn disabled_phase_yields_skip() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _handle) = crate::store::spawn_store(dir.path()).unwrap();

        let mut gates = gates_config();
        gates.disabled_phases.push("finalize".into());
        let (gate, source) = resolve_gate_type(
            &store,
            &gates,
            "finalize",
            "small",
            "WRK-002",
            GateType::Auto,
        )
        .await
        .unwrap();
        assert_eq!(gate, GateType::Skip);
        assert_eq!(source, GateSource::Disabled);
    }

    #[tokio::test]
    async fn falls_back_to_workflow_default() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _handle) = crate::store::spawn_store(dir.path()).unwrap();

        let gates = gates_config();
        let (gate, source) = resolve_gate_type(
            &store,
            &gates,
            "implement",
            "large",
            "WRK-003",
            GateType::Ai,
        )
        .await
        .unwrap();
        assert_eq!(gate, GateType::Ai);
        assert_eq!(source, GateSource::Default);
    }

    #[tokio::test]
    async fn phase_gate_store_link_fires_when_enabled_and_no_higher_override() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _handle) = crate::store::spawn_store(dir.path()).unwrap();
        store
            .set_phase_gate("review", GateType::Human)
            .await
            .unwrap();

        let mut gates = gates_config();
        gates.phase_gate_store_enabled = true;

        let (gate, source) = resolve_gate_type(
            &store,
            &gates,
            "review",
            "medium",
            "WRK-004",
            GateType::Auto,
        )
        .await
        .unwrap();
        assert_eq!(gate, GateType::Human);
        assert_eq!(source, GateSource::PhaseGate);

        // Disabled while the flag is off: store record must be ignored.
        gates.phase_gate_store_enabled = false;
        let (gate, source) = resolve_gate_type(
            &store,
            &gates,
            "review",
            "medium",
            "WRK-004",
            GateType::Auto,
        )
        .await
        .unwrap();
        assert_eq!(gate, GateType::Auto);
        assert_eq!(source, GateSource::Default);
    }

    #[test]
    fn auto_gate_requires_all_criteria() {
        let criteria = vec![AutoCriterion::HasOutput, AutoCriterion::NoErrors];
        assert_eq!(
            evaluate_auto_gate(&criteria, "all good", None),
            GateOutcome::Approved
        );
        assert_eq!(
            evaluate_auto_gate(&criteria, "Error: bad", None),
            GateOutcome::Rejected
        );
    }

    #[test]
    fn has_completion_marker_on_non_complete_status_rejects() {
        let criteria = vec![AutoCriterion::HasCompletionMarker];
        assert_eq!(evaluate_auto_gate(&criteria, "anything", None), GateOutcome::Rejected);
    }

    #[test]
    fn retry_phase_static_override_wins_over_llm_suggestion() {
        let mut map = HashMap::new();
        map.insert("test".to_string(), "implement".to_string());
        let resolved = resolve_retry_phase("test", Some("design"), Some("spec"), &map);
        assert_eq!(resolved.as_deref(), Some("design"));
    }

    #[test]
    fn retry_phase_falls_back_to_map_when_llm_omits() {
        let mut map = HashMap::new();
        map.insert("test".to_string(), "implement".to_string());
        let resolved = resolve_retry_phase("test", None, None, &map);
        assert_eq!(resolved.as_deref(), Some("implement"));
    }

    #[test]
    fn human_resolution_with_questions_is_needs_clarification() {
        let resolution = HumanResolution {
            approved: false,
            reason: String::new(),
            questions: vec!["which database?".into()],
        };
        assert_eq!(human_decision_to_outcome(&resolution), GateOutcome::NeedsClarification);
    }
}
