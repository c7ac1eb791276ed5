//! Turn executor (C4): spawns the LLM subprocess for one "turn", streams
//! its line-delimited event feed, parses the schema-constrained completion
//! object, and enforces the turn-max / idle timeouts.
//!
//! The subprocess lifecycle (process-group isolation, signal handling,
//! graceful-then-forced shutdown, global child registry) is carried over
//! unchanged from the single-agent-call version this module replaces —
//! only the contract around it (two timeouts, an activity-state stream,
//! and a schema-selected completion object) is new.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::os::unix::process::CommandExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::OrcError;
use crate::{log_debug, log_error, log_info, log_warn};

// --- Shutdown + process registry (unchanged shape from the single-call agent runner) ---

static SHUTDOWN_FLAG: OnceLock<std::sync::Arc<AtomicBool>> = OnceLock::new();

fn shutdown_flag() -> &'static std::sync::Arc<AtomicBool> {
    SHUTDOWN_FLAG.get_or_init(|| std::sync::Arc::new(AtomicBool::new(false)))
}

pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::SeqCst)
}

#[cfg(test)]
pub fn set_shutdown_flag_for_testing(value: bool) {
    shutdown_flag().store(value, Ordering::SeqCst);
}

pub fn install_signal_handlers() -> Result<(), OrcError> {
    let flag = shutdown_flag().clone();
    signal_hook::flag::register(signal_hook::consts::SIGTERM, flag.clone())
        .map_err(|e| OrcError::Subprocess(format!("failed to register SIGTERM handler: {e}")))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| OrcError::Subprocess(format!("failed to register SIGINT handler: {e}")))?;
    Ok(())
}

static CHILD_REGISTRY: OnceLock<Mutex<HashSet<i32>>> = OnceLock::new();

fn child_registry() -> &'static Mutex<HashSet<i32>> {
    CHILD_REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

fn register_child(pid: i32) {
    if let Ok(mut set) = child_registry().lock() {
        set.insert(pid);
    }
}

fn unregister_child(pid: i32) {
    if let Ok(mut set) = child_registry().lock() {
        set.remove(&pid);
    }
}

/// Best-effort shutdown of every still-tracked subprocess group, invoked
/// from the binary's top-level signal handling path.
pub async fn kill_all_children() {
    let pids: Vec<i32> = child_registry()
        .lock()
        .map(|set| set.iter().copied().collect())
        .unwrap_or_default();

    for pid in pids {
        kill_process_group(pid, Duration::from_secs(2)).await;
    }
}

async fn kill_process_group(pid: i32, grace: Duration) {
    tokio::task::spawn_blocking(move || {
        let pgid = Pid::from_raw(-pid);
        let _ = signal::kill(pgid, Signal::SIGTERM);

        let deadline = std::time::Instant::now() + grace;
        while std::time::Instant::now() < deadline {
            if signal::kill(Pid::from_raw(pid), None).is_err() {
                return; // process gone
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        let _ = signal::kill(pgid, Signal::SIGKILL);
    })
    .await
    .ok();
}

// --- Turn contract ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Idle,
    WaitingApi,
    Streaming,
    RunningTool,
    Processing,
}

/// One line of the subprocess's event feed.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TurnEvent {
    Activity { state: ActivityState },
    Chunk { text: String },
    ToolCall { name: String },
    Completion { data: serde_json::Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSchema {
    Generic,
    ReviewRound1,
    ReviewRound2,
    Qa,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Complete,
    Blocked,
    Continue,
    Pass,
    Fail,
    NeedsUserInput,
    Approved,
    Rejected,
}

/// The parsed, schema-validated completion object. `raw` is kept for
/// gate evaluators and variable extraction that need fields the generic
/// shape doesn't surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionObject {
    pub status: CompletionStatus,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

fn validate_against_schema(
    value: serde_json::Value,
    schema: CompletionSchema,
) -> Result<CompletionObject, OrcError> {
    let raw = value.clone();
    let mut obj: CompletionObject =
        serde_json::from_value(value).map_err(|e| OrcError::CompletionParse {
            schema: format!("{schema:?}"),
            detail: e.to_string(),
        })?;
    obj.raw = raw;

    let status_ok = match schema {
        CompletionSchema::Generic => matches!(
            obj.status,
            CompletionStatus::Complete | CompletionStatus::Blocked | CompletionStatus::Continue
        ),
        CompletionSchema::ReviewRound1 => true, // findings[] only, status is informational
        CompletionSchema::ReviewRound2 => matches!(
            obj.status,
            CompletionStatus::Pass | CompletionStatus::Fail | CompletionStatus::NeedsUserInput
        ),
        CompletionSchema::Qa => true,
    };

    if !status_ok {
        return Err(OrcError::CompletionParse {
            schema: format!("{schema:?}"),
            detail: format!("status {:?} not valid for schema", obj.status),
        });
    }

    Ok(obj)
}

#[derive(Debug, Clone)]
pub struct TurnInput {
    pub prompt: String,
    pub working_dir: PathBuf,
    pub schema: CompletionSchema,
    pub turn_max: Duration,
    pub idle_timeout: Duration,
    pub idle_escalates: bool,
}

#[derive(Debug, Clone)]
pub struct TurnOutput {
    pub completion: CompletionObject,
    pub transcript: String,
    pub token_usage: TokenUsage,
    pub final_activity: ActivityState,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Abstraction over "run one turn", so the phase engine and tests never
/// depend on a real subprocess.
pub trait TurnRunner: Send + Sync {
    fn run_turn(
        &self,
        input: &TurnInput,
    ) -> impl std::future::Future<Output = Result<TurnOutput, OrcError>> + Send;
}

#[derive(Debug, Clone)]
pub struct CliTurnRunner {
    pub binary: PathBuf,
    pub model: Option<String>,
}

impl CliTurnRunner {
    pub fn new(binary: impl Into<PathBuf>, model: Option<String>) -> Self {
        Self { binary: binary.into(), model }
    }

    pub async fn verify_cli_available(&self) -> Result<(), OrcError> {
        let status = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                OrcError::Subprocess(format!(
                    "agent binary '{}' not available: {e}",
                    self.binary.display()
                ))
            })?;
        if !status.success() {
            return Err(OrcError::Subprocess(format!(
                "agent binary '{}' exited non-zero on --version",
                self.binary.display()
            )));
        }
        Ok(())
    }
}

impl TurnRunner for CliTurnRunner {
    async fn run_turn(&self, input: &TurnInput) -> Result<TurnOutput, OrcError> {
        run_subprocess_turn(self, input).await
    }
}

async fn run_subprocess_turn(
    runner: &CliTurnRunner,
    input: &TurnInput,
) -> Result<TurnOutput, OrcError> {
    let mut cmd = Command::new(&runner.binary);
    cmd.current_dir(&input.working_dir)
        .arg("-p")
        .arg(&input.prompt)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(ref model) = runner.model {
        cmd.arg("--model").arg(model);
    }

    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| OrcError::Subprocess(format!("failed to spawn turn: {e}")))?;

    let pid = child.id().map(|p| p as i32);
    if let Some(pid) = pid {
        register_child(pid);
    }

    let stdout = child.stdout.take().expect("piped stdout");
    let mut lines = BufReader::new(stdout).lines();

    let mut transcript = String::new();
    let mut last_activity = ActivityState::Idle;
    let mut completion: Option<serde_json::Value> = None;
    let mut usage = TokenUsage::default();

    let idle_timeout = input.idle_timeout;
    let turn_result: Result<(), OrcError> = async {
        loop {
            let line = tokio::time::timeout(idle_timeout, lines.next_line()).await;
            let line = match line {
                Ok(Ok(Some(l))) => l,
                Ok(Ok(None)) => break, // subprocess closed stdout
                Ok(Err(e)) => return Err(OrcError::Subprocess(e.to_string())),
                Err(_) => {
                    log_warn!("turn idle for {:?}", idle_timeout);
                    if input.idle_escalates {
                        return Err(OrcError::TurnTimeout(idle_timeout));
                    }
                    continue;
                }
            };

            transcript.push_str(&line);
            transcript.push('\n');

            match serde_json::from_str::<TurnEvent>(&line) {
                Ok(TurnEvent::Activity { state }) => last_activity = state,
                Ok(TurnEvent::Chunk { .. }) => last_activity = ActivityState::Streaming,
                Ok(TurnEvent::ToolCall { .. }) => last_activity = ActivityState::RunningTool,
                Ok(TurnEvent::Completion { data }) => {
                    completion = Some(data);
                }
                Err(_) => {
                    // Non-JSON lines are raw output; kept in the transcript only.
                }
            }
        }
        Ok(())
    }
    .await;

    let turn_max_result = tokio::time::timeout(input.turn_max, async { turn_result }).await;

    if let Some(pid) = pid {
        unregister_child(pid);
    }

    match turn_max_result {
        Err(_) => {
            if let Some(pid) = pid {
                kill_process_group(pid, Duration::from_secs(1)).await;
            }
            let _ = child.wait().await;
            return Err(OrcError::TurnTimeout(input.turn_max));
        }
        Ok(Err(e)) => {
            let _ = child.wait().await;
            return Err(e);
        }
        Ok(Ok(())) => {}
    }

    if is_shutdown_requested() {
        if let Some(pid) = pid {
            kill_process_group(pid, Duration::from_secs(1)).await;
        }
        return Err(OrcError::TurnCancelled);
    }

    let status = child
        .wait()
        .await
        .map_err(|e| OrcError::Subprocess(e.to_string()))?;

    if !status.success() && completion.is_none() {
        return Err(OrcError::Subprocess(format!(
            "turn exited with {status} and produced no completion object"
        )));
    }

    let completion_value = completion.ok_or_else(|| OrcError::CompletionParse {
        schema: format!("{:?}", input.schema),
        detail: "no completion event in event stream".to_string(),
    })?;

    let completion = validate_against_schema(completion_value, input.schema)?;

    Ok(TurnOutput {
        completion,
        transcript,
        token_usage: usage,
        final_activity: last_activity,
    })
}

/// Test double: a scripted sequence of results, popped front-to-back.
pub struct MockTurnRunner {
    results: tokio::sync::Mutex<Vec<Result<TurnOutput, OrcError>>>,
}

impl MockTurnRunner {
    /// Results are given in the order they should be returned; stored
    /// reversed so each call can `pop()`.
    pub fn new(mut results: Vec<Result<TurnOutput, OrcError>>) -> Self {
        results.reverse();
        Self { results: tokio::sync::Mutex::new(results) }
    }
}

impl TurnRunner for MockTurnRunner {
    async fn run_turn(&self, _input: &TurnInput) -> Result<TurnOutput, OrcError> {
        let mut results = self.results.lock().await;
        results
            .pop()
            .unwrap_or_else(|| Err(OrcError::Subprocess("no more mock results".into())))
    }
}

/// Deterministic transcript filename: phase sequence two-digit, iteration
/// three-digit, e.g. `02-implement-003.md`.
pub fn transcript_filename(phase_index: u32, phase: &str, iteration: u32) -> String {
    format!("{phase_index:02}-{phase}-{iteration:03}.md")
}

pub fn transcript_path(project_root: &Path, task_id: &str, filename: &str) -> PathBuf {
    project_root
        .join("tasks")
        .join(task_id)
        .join("transcripts")
        .join(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_filename_zero_pads() {
        assert_eq!(transcript_filename(2, "implement", 3), "02-implement-003.md");
    }

    #[test]
    fn generic_schema_accepts_complete_status() {
        let value = serde_json::json!({"status": "complete", "summary": "done"});
        let obj = validate_against_schema(value, CompletionSchema::Generic).unwrap();
        assert_eq!(obj.status, CompletionStatus::Complete);
    }

    #[test]
    fn generic_schema_rejects_review_only_status() {
        let value = serde_json::json!({"status": "pass"});
        let err = validate_against_schema(value, CompletionSchema::Generic).unwrap_err();
        assert!(matches!(err, OrcError::CompletionParse { .. }));
    }

    #[test]
    fn has_completion_marker_on_non_json_rejects() {
        let result = serde_json::from_str::<serde_json::Value>("not json at all");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn mock_turn_runner_returns_results_in_order() {
        let output_a = TurnOutput {
            completion: CompletionObject {
                status: CompletionStatus::Complete,
                summary: Some("a".into()),
                reason: None,
                artifact: None,
                findings: vec![],
                issues: vec![],
                raw: serde_json::Value::Null,
            },
            transcript: String::new(),
            token_usage: TokenUsage::default(),
            final_activity: ActivityState::Idle,
        };
        let runner = MockTurnRunner::new(vec![Ok(output_a)]);
        let input = TurnInput {
            prompt: String::new(),
            working_dir: PathBuf::from("."),
            schema: CompletionSchema::Generic,
            turn_max: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(1),
            idle_escalates: false,
        };
        let result = runner.run_turn(&input).await.unwrap();
        assert_eq!(result.completion.summary.as_deref(), Some("a"));
    }
}
