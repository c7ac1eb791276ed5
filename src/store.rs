//! Durable store (C1): single-writer actor over task/run/phase-state/
//! artifact/gate-decision/branch records plus the per-task event log.
//! The actor pattern (command enum + mpsc/oneshot + a background task
//! owning the mutable state) is lifted directly from `coordinator.rs`;
//! the atomic write-temp-rename persistence discipline is lifted from
//! `backlog.rs::save`. Generalizes both from one flat backlog file to
//! the full record set in `record.rs`.

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};

use crate::error::OrcError;
use crate::log_warn;
use crate::record::{
    Artifact, BranchRecord, Event, EventKind, GateDecision, GateType, PhaseState, Run, Task,
};

const CHANNEL_CAPACITY: usize = 64;
const SNAPSHOT_FILE: &str = "store.json";
const EVENTS_DIR: &str = "events";

/// Full in-memory state the actor owns exclusively. Never shared across
/// threads directly — only mutated from inside `run_store`.
#[derive(Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoreSnapshot {
    pub tasks: Vec<Task>,
    pub runs: Vec<Run>,
    pub phase_states: Vec<PhaseState>,
    pub artifacts: Vec<Artifact>,
    pub branch_records: Vec<BranchRecord>,
    /// Operator-set gate type per phase id, consulted by the gate resolver
    /// as the store-backed link in its precedence chain (gated by
    /// `GatesConfig::phase_gate_store_enabled`).
    #[serde(default)]
    pub phase_gates: HashMap<String, GateType>,
    /// Monotone per-task sequence counters for the event log, persisted
    /// alongside the rest of the snapshot so a restart resumes the
    /// sequence rather than restarting it at zero.
    #[serde(default)]
    pub event_seq: HashMap<String, u64>,
}

impl StoreSnapshot {
    fn find_task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    fn find_task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    fn find_run(&self, id: &str) -> Option<&Run> {
        self.runs.iter().find(|r| r.id == id)
    }

    fn find_run_mut(&mut self, id: &str) -> Option<&mut Run> {
        self.runs.iter_mut().find(|r| r.id == id)
    }

    fn find_phase_state_mut(&mut self, task_id: &str, phase_id: &str) -> Option<&mut PhaseState> {
        self.phase_states
            .iter_mut()
            .find(|p| p.task_id == task_id && p.phase_id == phase_id)
    }

    fn next_seq(&mut self, task_id: &str) -> u64 {
        let counter = self.event_seq.entry(task_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }
}

type TxnFn = Box<dyn FnOnce(&mut StoreSnapshot) -> Result<Box<dyn Any + Send>, OrcError> + Send>;

enum StoreCommand {
    GetTask {
        id: String,
        reply: oneshot::Sender<Result<Task, OrcError>>,
    },
    ListTasks {
        reply: oneshot::Sender<Vec<Task>>,
    },
    /// Insert or update a task. `expected_updated_at` implements optimistic
    /// concurrency: if set and it doesn't match the stored value, the
    /// write is rejected with `ErrConflict` rather than silently clobbering
    /// a concurrent update.
    UpsertTask {
        task: Task,
        expected_updated_at: Option<chrono::DateTime<chrono::Utc>>,
        reply: oneshot::Sender<Result<(), OrcError>>,
    },
    GetRun {
        id: String,
        reply: oneshot::Sender<Result<Run, OrcError>>,
    },
    ListRunsForTask {
        task_id: String,
        reply: oneshot::Sender<Vec<Run>>,
    },
    UpsertRun {
        run: Run,
        reply: oneshot::Sender<Result<(), OrcError>>,
    },
    GetPhaseState {
        task_id: String,
        phase_id: String,
        reply: oneshot::Sender<Result<PhaseState, OrcError>>,
    },
    UpsertPhaseState {
        state: PhaseState,
        reply: oneshot::Sender<Result<(), OrcError>>,
    },
    AppendGateDecision {
        task_id: String,
        phase_id: String,
        decision: GateDecision,
        reply: oneshot::Sender<Result<(), OrcError>>,
    },
    UpsertArtifact {
        artifact: Artifact,
        reply: oneshot::Sender<Result<(), OrcError>>,
    },
    ListArtifactsForTask {
        task_id: String,
        reply: oneshot::Sender<Vec<Artifact>>,
    },
    UpsertBranchRecord {
        record: BranchRecord,
        reply: oneshot::Sender<Result<(), OrcError>>,
    },
    GetBranchRecord {
        name: String,
        reply: oneshot::Sender<Option<BranchRecord>>,
    },
    GetPhaseGate {
        phase_id: String,
        reply: oneshot::Sender<Option<GateType>>,
    },
    SetPhaseGate {
        phase_id: String,
        gate_type: GateType,
        reply: oneshot::Sender<Result<(), OrcError>>,
    },
    AppendEvent {
        task_id: String,
        kind: EventKind,
        payload: serde_json::Value,
        reply: oneshot::Sender<Result<Event, OrcError>>,
    },
    ListEvents {
        task_id: String,
        since_seq: u64,
        reply: oneshot::Sender<Vec<Event>>,
    },
    WithTxn {
        f: TxnFn,
        reply: oneshot::Sender<Result<Box<dyn Any + Send>, OrcError>>,
    },
}

#[derive(Clone)]
pub struct StoreHandle {
    sender: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> StoreCommand,
    ) -> Result<T, OrcError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(make(reply))
            .await
            .map_err(|_| OrcError::Unexpected("store actor shut down".to_string()))?;
        rx.await
            .map_err(|_| OrcError::Unexpected("store actor dropped reply".to_string()))
    }

    pub async fn get_task(&self, id: &str) -> Result<Task, OrcError> {
        self.call(|reply| StoreCommand::GetTask { id: id.to_string(), reply })
            .await?
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, OrcError> {
        self.call(|reply| StoreCommand::ListTasks { reply }).await
    }

    pub async fn upsert_task(
        &self,
        task: Task,
        expected_updated_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), OrcError> {
        self.call(|reply| StoreCommand::UpsertTask { task, expected_updated_at, reply })
            .await?
    }

    pub async fn get_run(&self, id: &str) -> Result<Run, OrcError> {
        self.call(|reply| StoreCommand::GetRun { id: id.to_string(), reply })
            .await?
    }

    pub async fn list_runs_for_task(&self, task_id: &str) -> Result<Vec<Run>, OrcError> {
        self.call(|reply| StoreCommand::ListRunsForTask { task_id: task_id.to_string(), reply })
            .await
    }

    pub async fn upsert_run(&self, run: Run) -> Result<(), OrcError> {
        self.call(|reply| StoreCommand::UpsertRun { run, reply }).await?
    }

    pub async fn get_phase_state(&self, task_id: &str, phase_id: &str) -> Result<PhaseState, OrcError> {
        self.call(|reply| StoreCommand::GetPhaseState {
            task_id: task_id.to_string(),
            phase_id: phase_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn upsert_phase_state(&self, state: PhaseState) -> Result<(), OrcError> {
        self.call(|reply| StoreCommand::UpsertPhaseState { state, reply }).await?
    }

    pub async fn append_gate_decision(
        &self,
        task_id: &str,
        phase_id: &str,
        decision: GateDecision,
    ) -> Result<(), OrcError> {
        self.call(|reply| StoreCommand::AppendGateDecision {
            task_id: task_id.to_string(),
            phase_id: phase_id.to_string(),
            decision,
            reply,
        })
        .await?
    }

    pub async fn upsert_artifact(&self, artifact: Artifact) -> Result<(), OrcError> {
        self.call(|reply| StoreCommand::UpsertArtifact { artifact, reply }).await?
    }

    pub async fn list_artifacts_for_task(&self, task_id: &str) -> Result<Vec<Artifact>, OrcError> {
        self.call(|reply| StoreCommand::ListArtifactsForTask { task_id: task_id.to_string(), reply })
            .await
    }

    pub async fn upsert_branch_record(&self, record: BranchRecord) -> Result<(), OrcError> {
        self.call(|reply| StoreCommand::UpsertBranchRecord { record, reply }).await?
    }

    pub async fn get_branch_record(&self, name: &str) -> Result<Option<BranchRecord>, OrcError> {
        self.call(|reply| StoreCommand::GetBranchRecord { name: name.to_string(), reply })
            .await
    }

    pub async fn get_phase_gate(&self, phase_id: &str) -> Result<Option<GateType>, OrcError> {
        self.call(|reply| StoreCommand::GetPhaseGate { phase_id: phase_id.to_string(), reply })
            .await
    }

    pub async fn set_phase_gate(&self, phase_id: &str, gate_type: GateType) -> Result<(), OrcError> {
        self.call(|reply| StoreCommand::SetPhaseGate {
            phase_id: phase_id.to_string(),
            gate_type,
            reply,
        })
        .await?
    }

    /// Appends an event, assigning it the next contiguous sequence number
    /// for this task. Durable: persisted before the reply is sent.
    pub async fn append_event(
        &self,
        task_id: &str,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<Event, OrcError> {
        self.call(|reply| StoreCommand::AppendEvent {
            task_id: task_id.to_string(),
            kind,
            payload,
            reply,
        })
        .await?
    }

    pub async fn list_events(&self, task_id: &str, since_seq: u64) -> Result<Vec<Event>, OrcError> {
        self.call(|reply| StoreCommand::ListEvents {
            task_id: task_id.to_string(),
            since_seq,
            reply,
        })
        .await
    }

    /// Snapshot-isolation transaction: `f` runs with exclusive access to
    /// the full store state on the actor task, and either its mutations
    /// all land (on `Ok`) or none do (on `Err`, or the actor persists
    /// anyway and returns the error — callers treat any `Err` as "did not
    /// commit" for the fields they care about).
    pub async fn with_txn<T, F>(&self, f: F) -> Result<T, OrcError>
    where
        T: Send + 'static,
        F: FnOnce(&mut StoreSnapshot) -> Result<T, OrcError> + Send + 'static,
    {
        let boxed: TxnFn = Box::new(move |state| f(state).map(|v| Box::new(v) as Box<dyn Any + Send>));
        let result = self
            .call(|reply| StoreCommand::WithTxn { f: boxed, reply })
            .await??;
        Ok(*result
            .downcast::<T>()
            .expect("with_txn closure result type mismatch"))
    }
}

fn snapshot_path(orc_dir: &Path) -> PathBuf {
    orc_dir.join(SNAPSHOT_FILE)
}

fn events_log_path(orc_dir: &Path, task_id: &str) -> PathBuf {
    orc_dir.join(EVENTS_DIR).join(format!("{task_id}.jsonl"))
}

/// Atomic write-temp-rename, same discipline as `backlog::save`: write to
/// a sibling temp file, fsync, then rename over the target so a crash mid
/// write never leaves a truncated snapshot on disk.
fn save_snapshot(orc_dir: &Path, snapshot: &StoreSnapshot) -> Result<(), OrcError> {
    std::fs::create_dir_all(orc_dir)?;
    let contents = serde_json::to_string_pretty(snapshot)?;

    let mut tmp = tempfile::NamedTempFile::new_in(orc_dir)?;
    use std::io::Write;
    tmp.write_all(contents.as_bytes())?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(snapshot_path(orc_dir))
        .map_err(|e| OrcError::Storage(e.to_string()))?;
    Ok(())
}

fn load_snapshot(orc_dir: &Path) -> Result<StoreSnapshot, OrcError> {
    let path = snapshot_path(orc_dir);
    if !path.exists() {
        return Ok(StoreSnapshot::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    serde_json::from_str(&contents).map_err(|e| {
        OrcError::Storage(format!("corrupt store snapshot at {}: {e}", path.display()))
    })
}

/// Appends one event line to the per-task durable log and fsyncs, so the
/// ordered event log survives a crash independent of the full-state
/// snapshot (which is rewritten wholesale, not appended).
fn append_event_line(orc_dir: &Path, task_id: &str, event: &Event) -> Result<(), OrcError> {
    use std::io::Write;
    let path = events_log_path(orc_dir, task_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
    let line = serde_json::to_string(event)?;
    writeln!(file, "{line}")?;
    file.sync_all()?;
    Ok(())
}

fn handle_upsert_task(
    state: &mut StoreSnapshot,
    mut task: Task,
    expected_updated_at: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<(), OrcError> {
    if let Some(existing) = state.find_task(&task.id) {
        if let Some(expected) = expected_updated_at {
            if existing.updated_at != expected {
                return Err(OrcError::Conflict(format!(
                    "task {} was modified concurrently (expected updated_at {}, found {})",
                    task.id, expected, existing.updated_at
                )));
            }
        }
    }
    task.updated_at = chrono::Utc::now();
    match state.find_task_mut(&task.id) {
        Some(slot) => *slot = task,
        None => state.tasks.push(task),
    }
    Ok(())
}

fn handle_append_gate_decision(
    state: &mut StoreSnapshot,
    task_id: &str,
    phase_id: &str,
    decision: GateDecision,
) -> Result<(), OrcError> {
    let phase_state = state
        .find_phase_state_mut(task_id, phase_id)
        .ok_or_else(|| OrcError::NotFound(format!("phase state {task_id}/{phase_id}")))?;
    phase_state.gate_decisions.push(decision);
    Ok(())
}

async fn run_store(mut rx: mpsc::Receiver<StoreCommand>, orc_dir: PathBuf, mut state: StoreSnapshot) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            StoreCommand::GetTask { id, reply } => {
                let result = state
                    .find_task(&id)
                    .cloned()
                    .ok_or_else(|| OrcError::NotFound(format!("task {id}")));
                let _ = reply.send(result);
            }
            StoreCommand::ListTasks { reply } => {
                let _ = reply.send(state.tasks.clone());
            }
            StoreCommand::UpsertTask { task, expected_updated_at, reply } => {
                let result = handle_upsert_task(&mut state, task, expected_updated_at)
                    .and_then(|()| save_snapshot(&orc_dir, &state));
                let _ = reply.send(result);
            }
            StoreCommand::GetRun { id, reply } => {
                let result = state
                    .find_run(&id)
                    .cloned()
                    .ok_or_else(|| OrcError::NotFound(format!("run {id}")));
                let _ = reply.send(result);
            }
            StoreCommand::ListRunsForTask { task_id, reply } => {
                let runs = state.runs.iter().filter(|r| r.task_id == task_id).cloned().collect();
                let _ = reply.send(runs);
            }
            StoreCommand::UpsertRun { run, reply } => {
                let result = (|| {
                    match state.find_run_mut(&run.id) {
                        Some(slot) => *slot = run,
                        None => state.runs.push(run),
                    }
                    save_snapshot(&orc_dir, &state)
                })();
                let _ = reply.send(result);
            }
            StoreCommand::GetPhaseState { task_id, phase_id, reply } => {
                let result = state
                    .phase_states
                    .iter()
                    .find(|p| p.task_id == task_id && p.phase_id == phase_id)
                    .cloned()
                    .ok_or_else(|| OrcError::NotFound(format!("phase state {task_id}/{phase_id}")));
                let _ = reply.send(result);
            }
            StoreCommand::UpsertPhaseState { state: phase_state, reply } => {
                let result = (|| {
                    match state.find_phase_state_mut(&phase_state.task_id, &phase_state.phase_id) {
                        Some(slot) => *slot = phase_state,
                        None => state.phase_states.push(phase_state),
                    }
                    save_snapshot(&orc_dir, &state)
                })();
                let _ = reply.send(result);
            }
            StoreCommand::AppendGateDecision { task_id, phase_id, decision, reply } => {
                let result = handle_append_gate_decision(&mut state, &task_id, &phase_id, decision)
                    .and_then(|()| save_snapshot(&orc_dir, &state));
                let _ = reply.send(result);
            }
            StoreCommand::UpsertArtifact { artifact, reply } => {
                let result = (|| {
                    if let Some(slot) = state
                        .artifacts
                        .iter_mut()
                        .find(|a| a.task_id == artifact.task_id && a.phase_id == artifact.phase_id && a.kind == artifact.kind)
                    {
                        *slot = artifact;
                    } else {
                        state.artifacts.push(artifact);
                    }
                    save_snapshot(&orc_dir, &state)
                })();
                let _ = reply.send(result);
            }
            StoreCommand::ListArtifactsForTask { task_id, reply } => {
                let artifacts = state.artifacts.iter().filter(|a| a.task_id == task_id).cloned().collect();
                let _ = reply.send(artifacts);
            }
            StoreCommand::UpsertBranchRecord { record, reply } => {
                let result = (|| {
                    match state.branch_records.iter_mut().find(|b| b.name == record.name) {
                        Some(slot) => *slot = record,
                        None => state.branch_records.push(record),
                    }
                    save_snapshot(&orc_dir, &state)
                })();
                let _ = reply.send(result);
            }
            StoreCommand::GetBranchRecord { name, reply } => {
                let record = state.branch_records.iter().find(|b| b.name == name).cloned();
                let _ = reply.send(record);
            }
            StoreCommand::GetPhaseGate { phase_id, reply } => {
                let gate = state.phase_gates.get(&phase_id).copied();
                let _ = reply.send(gate);
            }
            StoreCommand::SetPhaseGate { phase_id, gate_type, reply } => {
                let result = (|| {
                    state.phase_gates.insert(phase_id, gate_type);
                    save_snapshot(&orc_dir, &state)
                })();
                let _ = reply.send(result);
            }
            StoreCommand::AppendEvent { task_id, kind, payload, reply } => {
                let seq = state.next_seq(&task_id);
                let event = Event { seq, task_id: task_id.clone(), kind, payload, time: chrono::Utc::now() };
                let result = append_event_line(&orc_dir, &task_id, &event)
                    .and_then(|()| save_snapshot(&orc_dir, &state))
                    .map(|()| event.clone());
                if result.is_err() {
                    log_warn!("failed to persist event for task {task_id}");
                }
                let _ = reply.send(result);
            }
            StoreCommand::ListEvents { task_id, since_seq, reply } => {
                let events = read_events_log(&orc_dir, &task_id)
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|e| e.seq > since_seq)
                    .collect();
                let _ = reply.send(events);
            }
            StoreCommand::WithTxn { f, reply } => {
                let result = f(&mut state).and_then(|v| save_snapshot(&orc_dir, &state).map(|()| v));
                let _ = reply.send(result);
            }
        }
    }
}

fn read_events_log(orc_dir: &Path, task_id: &str) -> Result<Vec<Event>, OrcError> {
    let path = events_log_path(orc_dir, task_id);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(&path)?;
    let mut events = Vec::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(line)?);
    }
    Ok(events)
}

/// Loads (or initializes) the store rooted at `project_root/.orc` and
/// spawns its owning actor task.
pub fn spawn_store(project_root: &Path) -> Result<(StoreHandle, tokio::task::JoinHandle<()>), OrcError> {
    let orc_dir = project_root.join(".orc");
    let snapshot = load_snapshot(&orc_dir)?;
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = tokio::spawn(run_store(rx, orc_dir, snapshot));
    Ok((StoreHandle { sender: tx }, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{TaskStatus, Weight};

    fn sample_task(id: &str) -> Task {
        let now = chrono::Utc::now();
        Task {
            id: id.to_string(),
            title: "do the thing".to_string(),
            description: String::new(),
            weight: Weight::Small,
            status: TaskStatus::Created,
            target_branch: None,
            initiative_ref: None,
            blocked_by: Vec::new(),
            related_to: Vec::new(),
            automation: false,
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _handle) = spawn_store(dir.path()).unwrap();

        store.upsert_task(sample_task("WRK-001"), None).await.unwrap();
        let fetched = store.get_task("WRK-001").await.unwrap();
        assert_eq!(fetched.id, "WRK-001");
    }

    #[tokio::test]
    async fn conflicting_update_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _handle) = spawn_store(dir.path()).unwrap();

        store.upsert_task(sample_task("WRK-002"), None).await.unwrap();
        let stale = store.get_task("WRK-002").await.unwrap();

        // A concurrent writer updates first.
        let mut newer = stale.clone();
        newer.title = "updated elsewhere".to_string();
        store.upsert_task(newer, Some(stale.updated_at)).await.unwrap();

        // The original caller's compare-and-swap now targets a stale timestamp.
        let result = store.upsert_task(stale.clone(), Some(stale.updated_at)).await;
        assert!(matches!(result, Err(OrcError::Conflict(_))));
    }

    #[tokio::test]
    async fn events_are_assigned_contiguous_sequence_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _handle) = spawn_store(dir.path()).unwrap();

        let e1 = store
            .append_event("WRK-003", EventKind::State, serde_json::json!({"status": "running"}))
            .await
            .unwrap();
        let e2 = store
            .append_event("WRK-003", EventKind::Phase, serde_json::json!({"phase": "implement"}))
            .await
            .unwrap();

        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);

        let events = store.list_events("WRK-003", 0).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn with_txn_applies_arbitrary_multi_record_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _handle) = spawn_store(dir.path()).unwrap();
        store.upsert_task(sample_task("WRK-004"), None).await.unwrap();

        let new_status = store
            .with_txn(|snapshot| {
                let task = snapshot
                    .find_task_mut("WRK-004")
                    .ok_or_else(|| OrcError::NotFound("WRK-004".to_string()))?;
                task.status = TaskStatus::Running;
                Ok(task.status)
            })
            .await
            .unwrap();

        assert_eq!(new_status, TaskStatus::Running);
        let persisted = store.get_task("WRK-004").await.unwrap();
        assert_eq!(persisted.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn phase_gate_is_unset_until_explicitly_written() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _handle) = spawn_store(dir.path()).unwrap();

        assert_eq!(store.get_phase_gate("review").await.unwrap(), None);

        store.set_phase_gate("review", crate::record::GateType::Human).await.unwrap();
        assert_eq!(
            store.get_phase_gate("review").await.unwrap(),
            Some(crate::record::GateType::Human)
        );
    }

    #[tokio::test]
    async fn snapshot_persists_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (store, _handle) = spawn_store(dir.path()).unwrap();
            store.upsert_task(sample_task("WRK-005"), None).await.unwrap();
        }
        let (store2, _handle2) = spawn_store(dir.path()).unwrap();
        let reloaded = store2.get_task("WRK-005").await.unwrap();
        assert_eq!(reloaded.id, "WRK-005");
    }
}
