use std::time::Duration;

/// Central error type for the orchestration engine.
///
/// Categories (mirrors the policy in the error handling design):
/// - Retryable: transient contention, worth retrying internally
/// - Fatal: halt the run/orchestrator, unrecoverable without operator action
/// - Turn-scoped: surfaced to the phase engine, which continues unless stuck
///   or out of iterations
/// - Phase-scoped: surfaced to the orchestrator, which rewinds or blocks
/// - Finalize-scoped: surfaced by the finalize + merge sub-engine
#[derive(Debug, thiserror::Error)]
pub enum OrcError {
    // --- Store (C1) ---
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}. Recovery: `git checkout .orc/store`")]
    Storage(String),

    // --- Worktree manager (C2) ---
    #[error("worktree unavailable for task {task_id}: {reason}")]
    WorktreeUnavailable { task_id: String, reason: String },

    // --- Variable resolver (C3) ---
    #[error("variable resolution failed for required variable '{0}': {1}")]
    VariableResolution(String, String),

    #[error("script failed (exit {exit_code:?}): {stderr}")]
    ScriptFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    // --- Turn executor (C4) ---
    #[error("subprocess error: {0}")]
    Subprocess(String),

    #[error("turn exceeded turn-max timeout of {0:?}")]
    TurnTimeout(Duration),

    #[error("turn cancelled")]
    TurnCancelled,

    #[error("completion object failed to parse against schema '{schema}': {detail}")]
    CompletionParse { schema: String, detail: String },

    // --- Phase engine (C6) ---
    #[error("phase '{phase}' stuck at iteration {iteration}: {signature}")]
    Stuck {
        phase: String,
        iteration: u32,
        signature: String,
    },

    #[error("phase '{phase}' exhausted {max_iterations} iterations without completion")]
    MaxIterations { phase: String, max_iterations: u32 },

    // --- Workflow orchestrator (C7) ---
    #[error("run exceeded max_retries ({0}) for task {1}")]
    MaxRetries(u32, String),

    // --- Gate evaluator (C5) ---
    #[error("gate rejected phase '{phase}': {reason}")]
    GateRejected { phase: String, reason: String },

    #[error("gate blocked phase '{phase}': {reason}")]
    GateBlocked { phase: String, reason: String },

    // --- Finalize + merge sub-engine (C8) ---
    #[error("merge failed after {attempts} attempts: {detail}")]
    MergeFailed { attempts: u32, detail: String },

    #[error("rebase conflict while syncing branch '{branch}': {detail}")]
    RebaseConflict { branch: String, detail: String },

    #[error("CI failed: {0}")]
    CIFailed(String),

    #[error("CI wait exceeded {0:?}")]
    CITimeout(Duration),

    #[error("lock timeout after {0:?}")]
    LockTimeout(Duration),

    #[error("store not initialized: {0}")]
    NotInitialized(String),

    #[error("id collision exhausted after {0} attempts")]
    IdCollisionExhausted(u32),

    #[error("internal panic in storage thread: {0}")]
    InternalPanic(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("cycle detected: {0}")]
    CycleDetected(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("unexpected storage error: {0}")]
    Unexpected(String),
}

impl OrcError {
    /// True if the error is transient and the operation should be retried
    /// internally without surfacing to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrcError::LockTimeout(_) | OrcError::Conflict(_))
    }

    /// True if the error is unrecoverable and the orchestrator should halt
    /// rather than retry or rewind.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrcError::Storage(_)
                | OrcError::NotInitialized(_)
                | OrcError::IdCollisionExhausted(_)
                | OrcError::InternalPanic(_)
        )
    }
}

/// Transitional bridge: allows `?` to convert `OrcError` to `String` in code
/// that still uses `Result<T, String>` (store persistence, config validation).
/// TODO: remove once those call sites adopt `OrcError` directly.
impl From<OrcError> for String {
    fn from(err: OrcError) -> String {
        err.to_string()
    }
}

impl From<std::io::Error> for OrcError {
    fn from(err: std::io::Error) -> Self {
        OrcError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for OrcError {
    fn from(err: serde_json::Error) -> Self {
        OrcError::CompletionParse {
            schema: "unknown".to_string(),
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_is_retryable() {
        assert!(OrcError::LockTimeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn storage_error_is_fatal() {
        assert!(OrcError::Storage("disk full".into()).is_fatal());
    }

    #[test]
    fn gate_rejected_is_neither_retryable_nor_fatal() {
        let err = OrcError::GateRejected {
            phase: "review".into(),
            reason: "findings unresolved".into(),
        };
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn string_bridge_preserves_message() {
        let err = OrcError::NotFound("TASK-001".into());
        let s: String = err.into();
        assert_eq!(s, "not found: TASK-001");
    }
}
