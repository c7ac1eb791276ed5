//! Store-level record types: Run, Workflow, Phase state, Artifact, Gate
//! decision, Branch record, Event. These have no extension-bag analogue in
//! the task model (`types.rs`/`task_item.rs`) — they are persisted as their
//! own records by the store (`store.rs`), one JSONL file per run under
//! `.orc/runs/<run-id>.jsonl` plus a flat `.orc/events/<task-id>.jsonl` log.

use serde::{Deserialize, Serialize};

use crate::types::DimensionLevel;

/// Work-size classification driving which workflow phase sequence a task
/// gets. Supersedes the narrower `SizeLevel` for run-sequencing purposes;
/// `SizeLevel`/`DimensionLevel` remain in use for guardrail assessments.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Weight {
    Trivial,
    #[default]
    Small,
    Medium,
    Large,
    Greenfield,
}

impl std::fmt::Display for Weight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Weight::Trivial => "trivial",
            Weight::Small => "small",
            Weight::Medium => "medium",
            Weight::Large => "large",
            Weight::Greenfield => "greenfield",
        };
        write!(f, "{s}")
    }
}

pub fn parse_weight(s: &str) -> Result<Weight, String> {
    match s.to_lowercase().as_str() {
        "trivial" => Ok(Weight::Trivial),
        "small" => Ok(Weight::Small),
        "medium" => Ok(Weight::Medium),
        "large" => Ok(Weight::Large),
        "greenfield" => Ok(Weight::Greenfield),
        _ => Err(format!(
            "invalid weight '{s}': expected trivial, small, medium, large, or greenfield"
        )),
    }
}

/// Task lifecycle status, distinct from the item-pipeline `ItemStatus` used
/// by the backlog-adjacent CLI surface. A task owns at most one active run.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Created,
    Classifying,
    Planned,
    Running,
    Paused,
    Blocked,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Identity plus intent for one unit of work driven through the engine.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub weight: Weight,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiative_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_to: Vec<String>,
    #[serde(default)]
    pub automation: bool,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Task {
    /// Dependency ids `blocks`/`referenced_by` are derived, not stored: the
    /// set of other tasks whose `blocked_by`/`related_to` names this task.
    /// Computing them is a scan over the task set, not a field on self.
    pub fn blocks<'a>(&self, all: &'a [Task]) -> Vec<&'a Task> {
        all.iter().filter(|t| t.blocked_by.contains(&self.id)).collect()
    }

    pub fn referenced_by<'a>(&self, all: &'a [Task]) -> Vec<&'a Task> {
        all.iter().filter(|t| t.related_to.contains(&self.id)).collect()
    }
}

/// One execution attempt of a task against a workflow.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Run {
    pub id: String,
    pub task_id: String,
    pub workflow_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    pub current_phase_id: String,
    #[serde(default)]
    pub retry_counter: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    Paused,
    Blocked,
}

/// One named step in a workflow definition.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PhaseDef {
    pub id: String,
    pub kind: String,
    pub prompt_template: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_checkpoint_frequency")]
    pub checkpoint_frequency: u32,
    pub completion_schema_kind: CompletionSchemaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_ref: Option<String>,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_checkpoint_frequency() -> u32 {
    1
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSchemaKind {
    Generic,
    ReviewRound1,
    ReviewRound2,
    Qa,
}

/// Ordered list of phase definitions; the sequence actually run for a task
/// is selected at run start from the task's weight.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Workflow {
    pub id: String,
    pub phases: Vec<PhaseDef>,
}

impl Workflow {
    pub fn phase_index(&self, phase_id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == phase_id)
    }

    pub fn phase(&self, phase_id: &str) -> Option<&PhaseDef> {
        self.phases.iter().find(|p| p.id == phase_id)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Blocked,
}

/// Per (task, phase) execution record.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PhaseState {
    pub task_id: String,
    pub phase_id: String,
    pub status: PhaseStatus,
    #[serde(default)]
    pub iteration_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    #[serde(default)]
    pub gate_decisions: Vec<GateDecision>,
}

impl PhaseState {
    pub fn pending(task_id: &str, phase_id: &str) -> Self {
        PhaseState {
            task_id: task_id.to_string(),
            phase_id: phase_id.to_string(),
            status: PhaseStatus::Pending,
            iteration_count: 0,
            started_at: None,
            completed_at: None,
            last_checkpoint: None,
            artifact_ref: None,
            error_text: None,
            gate_decisions: Vec::new(),
        }
    }

    /// Reset to pending for a rewind, preserving identity but clearing
    /// execution history. Gate decisions are append-only and NOT cleared —
    /// the log records every decision ever made for this phase.
    pub fn reset_for_rewind(&mut self) {
        self.status = PhaseStatus::Pending;
        self.iteration_count = 0;
        self.started_at = None;
        self.completed_at = None;
        self.last_checkpoint = None;
        self.artifact_ref = None;
        self.error_text = None;
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Spec,
    Research,
    Review,
    TestResults,
    FinalizeReport,
    Other(String),
}

/// Content produced by a phase, addressed by (task, phase, kind).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Artifact {
    pub task_id: String,
    pub phase_id: String,
    pub kind: ArtifactKind,
    pub path: String,
    pub content_hash: String,
    pub committed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    Auto,
    Human,
    Ai,
    Skip,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Approved,
    Rejected,
    Blocked,
    NeedsClarification,
}

/// A single gate decision. Gates are append-only per phase — `PhaseState`
/// accumulates one of these per evaluation, never overwriting history.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GateDecision {
    pub phase: String,
    #[serde(rename = "type")]
    pub gate_type: GateType,
    pub outcome: GateOutcome,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_phase: Option<String>,
    #[serde(default)]
    pub output_payload: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver_id: Option<String>,
    pub source: GateSource,
}

/// Where the effective gate type for a (phase, weight, task) resolution
/// came from — recorded for auditability per the precedence chain.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateSource {
    TaskOverride,
    WeightOverride,
    PhaseOverride,
    PhaseGate,
    EnabledPhases,
    Default,
    Disabled,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BranchType {
    Initiative,
    Staging,
    Task,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Active,
    Merged,
    Stale,
    Orphaned,
}

/// A tracked git branch. Name is the primary key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BranchRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub branch_type: BranchType,
    pub owner_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_activity: chrono::DateTime<chrono::Utc>,
    pub status: BranchStatus,
}

/// One entry in a task's ordered, gap-free event log.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Event {
    pub seq: u64,
    pub task_id: String,
    pub kind: EventKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub time: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    State,
    Phase,
    Gate,
    Transcript,
    Tokens,
    DecisionRequired,
    Complete,
    Error,
    Overflow,
}

/// Structured summary of what failed and why, injected into a rewound
/// phase's resolution context under `RETRY_CONTEXT`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RetryContext {
    pub failed_phase: String,
    pub reason: String,
    pub attempt_number: u32,
}

/// Reuses the dimension vocabulary already used for guardrail assessments
/// (complexity/risk/impact) so risk classification in the finalize
/// sub-engine shares one enum instead of inventing a parallel one.
pub fn dimension_from_risk_tier(tier: RiskTier) -> DimensionLevel {
    match tier {
        RiskTier::Low => DimensionLevel::Low,
        RiskTier::Medium | RiskTier::High => DimensionLevel::Medium,
        RiskTier::Critical => DimensionLevel::High,
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_roundtrips_through_parse_and_display() {
        for w in [
            Weight::Trivial,
            Weight::Small,
            Weight::Medium,
            Weight::Large,
            Weight::Greenfield,
        ] {
            let parsed = parse_weight(&w.to_string()).unwrap();
            assert_eq!(parsed, w);
        }
    }

    #[test]
    fn phase_state_reset_for_rewind_preserves_gate_log() {
        let mut ps = PhaseState::pending("WRK-001", "implement");
        ps.status = PhaseStatus::Completed;
        ps.iteration_count = 3;
        ps.gate_decisions.push(GateDecision {
            phase: "implement".into(),
            gate_type: GateType::Auto,
            outcome: GateOutcome::Approved,
            reason: "ok".into(),
            retry_phase: None,
            output_payload: serde_json::Value::Null,
            timestamp: chrono::Utc::now(),
            approver_id: None,
            source: GateSource::Default,
        });

        ps.reset_for_rewind();

        assert_eq!(ps.status, PhaseStatus::Pending);
        assert_eq!(ps.iteration_count, 0);
        assert_eq!(ps.gate_decisions.len(), 1, "gate log is append-only");
    }

    #[test]
    fn task_status_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
