//! Finalize + merge sub-engine (C8): syncs a task branch with its target,
//! resolves conflicts as an ordinary turn, assesses risk from the diff,
//! and — separately — pushes, waits on CI, and merges server-side with
//! retry-on-race. Grounded on `git.rs`'s subprocess conventions plus
//! `coordinator.rs`'s git-driven merge bookkeeping; the forge REST calls
//! reuse `reqwest`, the same HTTP client `variables.rs`'s `api` source
//! already introduced.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;

use crate::config::{CiConfig, ConflictResolution, FinalizeConfig, ForgeConfig, MergeMethod, PrConfig, SyncStrategy};
use crate::error::OrcError;
use crate::git;
use crate::log_info;
use crate::record::{BranchRecord, BranchStatus, RiskTier};
use crate::store::StoreHandle;
use crate::turn::{CompletionSchema, CompletionStatus, TurnInput, TurnRunner};

const MAX_CONFLICT_ATTEMPTS: u32 = 12;
const MAX_UNRESOLVED_CONFLICTS: u32 = 10;
const MAX_FAILING_TEST_ATTEMPTS: u32 = 5;
const MERGE_RACE_BACKOFF_SECS: [u64; 3] = [2, 4, 8];

/// Static inputs for one finalize pass over a task's worktree.
pub struct FinalizeRequest<'a> {
    pub task_id: &'a str,
    pub task_title: &'a str,
    pub worktree_path: &'a Path,
    pub target_branch: &'a str,
    pub task_branch: &'a str,
    pub finalize: &'a FinalizeConfig,
    pub test_command: Option<&'a str>,
    pub turn_max: Duration,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeReport {
    pub risk: RiskTier,
    pub files_changed: u32,
    pub lines_changed: u32,
    pub conflicts_resolved: u32,
    pub markdown: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    Ready(FinalizeReport),
    EscalateToImplement { reason: String, retry_context: String },
}

/// Runs steps 1-9 of finalize: fetch, sync with the target branch,
/// resolve any conflicts as a turn, re-run tests, assess risk, and
/// either produce a report or escalate back to implement. Does not
/// push or merge — that is [`push_and_merge`]'s job, run only once this
/// returns `Ready`.
pub async fn sync_and_assess<R: TurnRunner>(
    runner: &R,
    req: &FinalizeRequest<'_>,
) -> Result<FinalizeOutcome, OrcError> {
    git::fetch("origin", req.target_branch, req.worktree_path).map_err(OrcError::Git)?;
    let target_ref = format!("origin/{}", req.target_branch);

    let conflicts_resolved = match sync_with_target(runner, req, &target_ref).await? {
        SyncResult::Synced { conflicts_resolved } => conflicts_resolved,
        SyncResult::Escalate { reason } => {
            return Ok(FinalizeOutcome::EscalateToImplement {
                retry_context: retry_context_json(req.task_id, &reason),
                reason,
            });
        }
    };

    if conflicts_resolved > MAX_UNRESOLVED_CONFLICTS {
        let reason = format!(
            "{conflicts_resolved} conflicts required resolution, exceeding the {MAX_UNRESOLVED_CONFLICTS} threshold"
        );
        return Ok(FinalizeOutcome::EscalateToImplement {
            retry_context: retry_context_json(req.task_id, &reason),
            reason,
        });
    }

    if let Some(test_command) = req.test_command {
        if let Some(reason) = run_tests_with_fix_attempts(runner, req, test_command).await? {
            return Ok(FinalizeOutcome::EscalateToImplement {
                retry_context: retry_context_json(req.task_id, &reason),
                reason,
            });
        }
    }

    let (files_changed, lines_changed) = git::diff_stat(&target_ref, "HEAD", req.worktree_path)
        .map_err(OrcError::Git)?;
    let risk = risk_tier(files_changed, lines_changed, conflicts_resolved);

    let markdown = finalize_report_markdown(req, files_changed, lines_changed, conflicts_resolved, risk);
    commit_report(req.worktree_path, req.task_id, &markdown)?;

    Ok(FinalizeOutcome::Ready(FinalizeReport {
        risk,
        files_changed,
        lines_changed,
        conflicts_resolved,
        markdown,
    }))
}

enum SyncResult {
    Synced { conflicts_resolved: u32 },
    Escalate { reason: String },
}

async fn sync_with_target<R: TurnRunner>(
    runner: &R,
    req: &FinalizeRequest<'_>,
    target_ref: &str,
) -> Result<SyncResult, OrcError> {
    let start_result = match req.finalize.sync_strategy {
        SyncStrategy::Rebase => git::rebase(target_ref, req.worktree_path),
        SyncStrategy::Merge => git::merge(target_ref, req.worktree_path),
    };

    if let Err(detail) = start_result {
        if !in_progress(&req.finalize.sync_strategy, req.worktree_path) {
            return Err(OrcError::RebaseConflict { branch: req.task_branch.to_string(), detail });
        }
    }

    let mut conflicts_resolved = 0u32;
    let mut attempt = 0u32;
    while in_progress(&req.finalize.sync_strategy, req.worktree_path) {
        attempt += 1;
        if attempt > MAX_CONFLICT_ATTEMPTS {
            abort(&req.finalize.sync_strategy, req.worktree_path);
            return Ok(SyncResult::Escalate {
                reason: format!("exceeded {MAX_CONFLICT_ATTEMPTS} conflict-resolution attempts"),
            });
        }

        let conflicts = git::conflicted_paths(req.worktree_path).map_err(OrcError::Git)?;
        if conflicts.is_empty() {
            break;
        }

        if req.finalize.conflict_resolution == ConflictResolution::Abort {
            abort(&req.finalize.sync_strategy, req.worktree_path);
            return Ok(SyncResult::Escalate {
                reason: format!("{} unresolved conflicts, conflict_resolution=abort", conflicts.len()),
            });
        }

        conflicts_resolved += conflicts.len() as u32;
        let resolved = resolve_conflicts_turn(runner, req, &conflicts).await?;
        if !resolved {
            abort(&req.finalize.sync_strategy, req.worktree_path);
            return Ok(SyncResult::Escalate {
                reason: "conflict-resolution turn reported blocked".to_string(),
            });
        }

        let paths: Vec<&Path> = conflicts.iter().map(|p| Path::new(p.as_str())).collect();
        git::stage_paths(&paths, Some(req.worktree_path)).map_err(OrcError::Git)?;

        let continue_result = match req.finalize.sync_strategy {
            SyncStrategy::Rebase => git::rebase_continue(req.worktree_path),
            SyncStrategy::Merge => git::commit(
                &format!("[orc] {}: merge {} into {}", req.task_id, req.target_branch, req.task_branch),
                Some(req.worktree_path),
            )
            .map(|_| ()),
        };
        if let Err(detail) = continue_result {
            if in_progress(&req.finalize.sync_strategy, req.worktree_path) {
                // Still more conflicts in the next commit of the rebase; loop again.
                continue;
            }
            return Err(OrcError::RebaseConflict { branch: req.task_branch.to_string(), detail });
        }
    }

    Ok(SyncResult::Synced { conflicts_resolved })
}

fn in_progress(strategy: &SyncStrategy, worktree_path: &Path) -> bool {
    match strategy {
        SyncStrategy::Rebase => git::rebase_in_progress(worktree_path),
        SyncStrategy::Merge => git::merge_in_progress(worktree_path),
    }
}

fn abort(strategy: &SyncStrategy, worktree_path: &Path) {
    let result = match strategy {
        SyncStrategy::Rebase => git::rebase_abort(worktree_path),
        SyncStrategy::Merge => git::merge_abort(worktree_path),
    };
    if let Err(e) = result {
        crate::log_warn!("failed to abort {strategy:?} for {}: {e}", worktree_path.display());
    }
}

async fn resolve_conflicts_turn<R: TurnRunner>(
    runner: &R,
    req: &FinalizeRequest<'_>,
    conflicts: &[String],
) -> Result<bool, OrcError> {
    let prompt = format!(
        "Resolve the git conflicts in the following files, currently checked out at {}.\n\n\
         Files in conflict:\n{}\n\n\
         Rules: never delete either side's functionality; prefer an additive resolution \
         that keeps both changes where they do not directly contradict; run the relevant \
         tests for a file if you can before considering it resolved. Edit the files \
         in place to remove all conflict markers; do not stage or commit.\n\n\
         Respond with a completion object: status \"complete\" once every listed file's \
         conflict markers are gone, or \"blocked\" with a reason if a conflict cannot be \
         resolved safely.",
        req.worktree_path.display(),
        conflicts.iter().map(|p| format!("- {p}")).collect::<Vec<_>>().join("\n"),
    );

    let input = TurnInput {
        prompt,
        working_dir: req.worktree_path.to_path_buf(),
        schema: CompletionSchema::Generic,
        turn_max: req.turn_max,
        idle_timeout: req.idle_timeout,
        idle_escalates: false,
    };
    let output = runner.run_turn(&input).await?;
    Ok(output.completion.status == CompletionStatus::Complete)
}

/// Re-runs `test_command`, and on failure invokes a fix-it turn before
/// retrying, up to [`MAX_FAILING_TEST_ATTEMPTS`] times. Returns `Some`
/// escalation reason if tests are still failing once attempts run out.
async fn run_tests_with_fix_attempts<R: TurnRunner>(
    runner: &R,
    req: &FinalizeRequest<'_>,
    test_command: &str,
) -> Result<Option<String>, OrcError> {
    for attempt in 0..=MAX_FAILING_TEST_ATTEMPTS {
        if run_shell(test_command, req.worktree_path).await? {
            return Ok(None);
        }
        if attempt == MAX_FAILING_TEST_ATTEMPTS {
            break;
        }

        let prompt = format!(
            "Running `{test_command}` in {} fails after syncing with `{}`. Fix the \
             failures without reverting the sync; do not stage or commit.",
            req.worktree_path.display(),
            req.target_branch,
        );
        let input = TurnInput {
            prompt,
            working_dir: req.worktree_path.to_path_buf(),
            schema: CompletionSchema::Generic,
            turn_max: req.turn_max,
            idle_timeout: req.idle_timeout,
            idle_escalates: false,
        };
        runner.run_turn(&input).await?;
    }

    Ok(Some(format!(
        "`{test_command}` still failing after {MAX_FAILING_TEST_ATTEMPTS} fix attempts"
    )))
}

async fn run_shell(command: &str, working_dir: &Path) -> Result<bool, OrcError> {
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .status()
        .await
        .map_err(|e| OrcError::Subprocess(e.to_string()))?;
    Ok(status.success())
}

/// Classifies risk by the worst of files-changed / lines-changed /
/// conflicts-resolved against the four bands:
/// low (1-5, <100, 0), medium (6-15, 100-500, 1-3),
/// high (16-30, 500-1000, 4-10), critical (beyond any of those).
fn risk_tier(files_changed: u32, lines_changed: u32, conflicts: u32) -> RiskTier {
    let files_tier = match files_changed {
        0..=5 => RiskTier::Low,
        6..=15 => RiskTier::Medium,
        16..=30 => RiskTier::High,
        _ => RiskTier::Critical,
    };
    let lines_tier = match lines_changed {
        0..=99 => RiskTier::Low,
        100..=500 => RiskTier::Medium,
        501..=1000 => RiskTier::High,
        _ => RiskTier::Critical,
    };
    let conflict_tier = match conflicts {
        0 => RiskTier::Low,
        1..=3 => RiskTier::Medium,
        4..=10 => RiskTier::High,
        _ => RiskTier::Critical,
    };
    [files_tier, lines_tier, conflict_tier]
        .into_iter()
        .max_by_key(|t| *t as u8)
        .unwrap_or(RiskTier::Low)
}

fn retry_context_json(task_id: &str, reason: &str) -> String {
    serde_json::json!({
        "failed_phase": "finalize",
        "reason": reason,
        "task_id": task_id,
    })
    .to_string()
}

fn finalize_report_markdown(
    req: &FinalizeRequest<'_>,
    files_changed: u32,
    lines_changed: u32,
    conflicts_resolved: u32,
    risk: RiskTier,
) -> String {
    format!(
        "# Finalize report: {}\n\n\
         - Target branch: `{}`\n\
         - Task branch: `{}`\n\
         - Files changed: {files_changed}\n\
         - Lines changed: {lines_changed}\n\
         - Conflicts resolved: {conflicts_resolved}\n\
         - Risk: {risk:?}\n",
        req.task_title, req.target_branch, req.task_branch,
    )
}

fn commit_report(worktree_path: &Path, task_id: &str, markdown: &str) -> Result<(), OrcError> {
    let report_dir = worktree_path.join(".orc");
    std::fs::create_dir_all(&report_dir).map_err(|e| OrcError::Io(e.to_string()))?;
    let report_path = report_dir.join("finalize-report.md");
    std::fs::write(&report_path, markdown).map_err(|e| OrcError::Io(e.to_string()))?;

    git::stage_paths(&[Path::new(".orc/finalize-report.md")], Some(worktree_path)).map_err(OrcError::Git)?;
    git::commit(&format!("[orc] {task_id}: finalize - report"), Some(worktree_path)).map_err(OrcError::Git)?;
    Ok(())
}

/// Result of a successful server-side merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub merge_commit_sha: String,
}

/// Pushes the task branch, waits on required CI checks if configured,
/// then merges server-side via the forge's pull-request merge endpoint.
/// On the forge's "base branch was modified" race (405), re-syncs and
/// retries with exponential backoff before giving up.
pub async fn push_and_merge(
    store: &StoreHandle,
    req: &FinalizeRequest<'_>,
    ci: &CiConfig,
    pr: &PrConfig,
    forge: &ForgeConfig,
) -> Result<MergeOutcome, OrcError> {
    git::push("origin", req.task_branch, false, req.worktree_path).map_err(OrcError::Git)?;

    if ci.enabled {
        let head_sha = git::get_head_sha(req.worktree_path).map_err(OrcError::Git)?;
        poll_ci(forge, ci, &head_sha).await?;
    }

    let token = std::env::var(&forge.token_env)
        .map_err(|_| OrcError::MergeFailed { attempts: 0, detail: format!("{} not set", forge.token_env) })?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| OrcError::MergeFailed { attempts: 0, detail: e.to_string() })?;

    let pr_number = ensure_pull_request(&client, forge, pr, req, &token).await?;

    let max_attempts = req.finalize.max_merge_retries.max(1);
    for attempt in 1..=max_attempts {
        match attempt_merge(&client, forge, pr_number, pr.merge_method.clone(), &token).await {
            Ok(sha) => {
                delete_remote_branch(&client, forge, req.task_branch, &token).await;
                update_branch_record(store, req.task_branch, BranchStatus::Merged).await?;
                return Ok(MergeOutcome { merge_commit_sha: sha });
            }
            Err(MergeAttemptError::Race) if attempt < max_attempts => {
                let backoff = MERGE_RACE_BACKOFF_SECS[(attempt as usize - 1).min(MERGE_RACE_BACKOFF_SECS.len() - 1)];
                log_info!(
                    "merge race on PR #{pr_number} for task {}, retrying in {backoff}s (attempt {attempt}/{max_attempts})",
                    req.task_id
                );
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                git::fetch("origin", req.target_branch, req.worktree_path).map_err(OrcError::Git)?;
                let target_ref = format!("origin/{}", req.target_branch);
                git::rebase(&target_ref, req.worktree_path).map_err(|detail| OrcError::RebaseConflict {
                    branch: req.task_branch.to_string(),
                    detail,
                })?;
                git::push("origin", req.task_branch, true, req.worktree_path).map_err(OrcError::Git)?;
            }
            Err(MergeAttemptError::Race) => {
                return Err(OrcError::MergeFailed {
                    attempts: attempt,
                    detail: "base branch kept moving; race retries exhausted".to_string(),
                });
            }
            Err(MergeAttemptError::Other(detail)) => {
                return Err(OrcError::MergeFailed { attempts: attempt, detail });
            }
        }
    }

    Err(OrcError::MergeFailed { attempts: max_attempts, detail: "unreachable retry loop exit".to_string() })
}

async fn poll_ci(forge: &ForgeConfig, ci: &CiConfig, head_sha: &str) -> Result<(), OrcError> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(ci.timeout_minutes as u64 * 60);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| OrcError::CIFailed(e.to_string()))?;
    let url = format!(
        "{}/repos/{}/{}/commits/{head_sha}/check-runs",
        forge.api_base, forge.owner, forge.repo
    );

    loop {
        let resp = client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| OrcError::CIFailed(e.to_string()))?;
        let body: CheckRunsResponse = resp.json().await.map_err(|e| OrcError::CIFailed(e.to_string()))?;

        let relevant: Vec<&CheckRun> = if ci.required_checks.is_empty() {
            body.check_runs.iter().collect()
        } else {
            body.check_runs
                .iter()
                .filter(|c| ci.required_checks.contains(&c.name))
                .collect()
        };

        let all_done = relevant.iter().all(|c| c.status == "completed");
        if all_done && !relevant.is_empty() {
            if relevant.iter().all(|c| c.conclusion.as_deref() == Some("success")) {
                return Ok(());
            }
            return Err(OrcError::CIFailed(format!(
                "required checks did not all succeed for {head_sha}"
            )));
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(OrcError::CITimeout(Duration::from_secs(ci.timeout_minutes as u64 * 60)));
        }
        tokio::time::sleep(Duration::from_secs(ci.poll_interval_seconds)).await;
    }
}

#[derive(Deserialize)]
struct CheckRunsResponse {
    check_runs: Vec<CheckRun>,
}

#[derive(Deserialize)]
struct CheckRun {
    name: String,
    status: String,
    conclusion: Option<String>,
}

enum MergeAttemptError {
    Race,
    Other(String),
}

async fn ensure_pull_request(
    client: &reqwest::Client,
    forge: &ForgeConfig,
    pr: &PrConfig,
    req: &FinalizeRequest<'_>,
    token: &str,
) -> Result<u64, OrcError> {
    let list_url = format!(
        "{}/repos/{}/{}/pulls?head={}:{}&state=open",
        forge.api_base, forge.owner, forge.repo, forge.owner, req.task_branch
    );
    let resp = client
        .get(&list_url)
        .bearer_auth(token)
        .header("Accept", "application/vnd.github+json")
        .send()
        .await
        .map_err(|e| OrcError::MergeFailed { attempts: 0, detail: e.to_string() })?;
    let existing: Vec<PullRequestRef> = resp
        .json()
        .await
        .map_err(|e| OrcError::MergeFailed { attempts: 0, detail: e.to_string() })?;
    if let Some(found) = existing.into_iter().next() {
        return Ok(found.number);
    }

    if !pr.auto_create {
        return Err(OrcError::MergeFailed {
            attempts: 0,
            detail: format!("no open PR for branch '{}' and pr.auto_create is false", req.task_branch),
        });
    }

    let title = pr
        .title_template
        .replace("{task_id}", req.task_id)
        .replace("{title}", req.task_title);
    let create_url = format!("{}/repos/{}/{}/pulls", forge.api_base, forge.owner, forge.repo);
    let resp = client
        .post(&create_url)
        .bearer_auth(token)
        .header("Accept", "application/vnd.github+json")
        .json(&serde_json::json!({
            "title": title,
            "head": req.task_branch,
            "base": req.target_branch,
        }))
        .send()
        .await
        .map_err(|e| OrcError::MergeFailed { attempts: 0, detail: e.to_string() })?;
    let created: PullRequestRef = resp
        .json()
        .await
        .map_err(|e| OrcError::MergeFailed { attempts: 0, detail: e.to_string() })?;
    Ok(created.number)
}

#[derive(Deserialize)]
struct PullRequestRef {
    number: u64,
}

async fn attempt_merge(
    client: &reqwest::Client,
    forge: &ForgeConfig,
    pr_number: u64,
    merge_method: MergeMethod,
    token: &str,
) -> Result<String, MergeAttemptError> {
    let url = format!(
        "{}/repos/{}/{}/pulls/{pr_number}/merge",
        forge.api_base, forge.owner, forge.repo
    );
    let method = match merge_method {
        MergeMethod::Squash => "squash",
        MergeMethod::Merge => "merge",
        MergeMethod::Rebase => "rebase",
    };

    let resp = client
        .put(&url)
        .bearer_auth(token)
        .header("Accept", "application/vnd.github+json")
        .json(&serde_json::json!({ "merge_method": method }))
        .send()
        .await
        .map_err(|e| MergeAttemptError::Other(e.to_string()))?;

    let status = resp.status();
    if status == reqwest::StatusCode::METHOD_NOT_ALLOWED {
        return Err(MergeAttemptError::Race);
    }
    if !status.is_success() {
        let detail = resp.text().await.unwrap_or_default();
        return Err(MergeAttemptError::Other(format!("merge failed with status {status}: {detail}")));
    }

    #[derive(Deserialize)]
    struct MergeResult {
        sha: String,
    }
    let result: MergeResult = resp.json().await.map_err(|e| MergeAttemptError::Other(e.to_string()))?;
    Ok(result.sha)
}

async fn delete_remote_branch(client: &reqwest::Client, forge: &ForgeConfig, branch: &str, token: &str) {
    let url = format!("{}/repos/{}/{}/git/refs/heads/{branch}", forge.api_base, forge.owner, forge.repo);
    if let Err(e) = client.delete(&url).bearer_auth(token).send().await {
        crate::log_warn!("failed to delete remote branch '{branch}': {e}");
    }
}

async fn update_branch_record(store: &StoreHandle, branch: &str, status: BranchStatus) -> Result<(), OrcError> {
    let mut record = store
        .get_branch_record(branch)
        .await?
        .unwrap_or_else(|| BranchRecord {
            name: branch.to_string(),
            branch_type: crate::record::BranchType::Task,
            owner_id: String::new(),
            created_at: Utc::now(),
            last_activity: Utc::now(),
            status,
        });
    record.status = status;
    record.last_activity = Utc::now();
    store.upsert_branch_record(record).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::{ActivityState, CompletionObject, TokenUsage, TurnOutput};
    use std::process::Command;

    fn setup_repo_with_divergent_branches(conflicting: bool) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let run = |args: &[&str], cwd: &std::path::Path| {
            let status = Command::new("git").args(args).current_dir(cwd).status().unwrap();
            assert!(status.success(), "git {:?} failed", args);
        };
        run(&["init", "-q", "-b", "main"], dir.path());
        run(&["config", "user.email", "test@example.com"], dir.path());
        run(&["config", "user.name", "Test"], dir.path());
        std::fs::write(dir.path().join("README.md"), "base\n").unwrap();
        run(&["add", "README.md"], dir.path());
        run(&["commit", "-q", "-m", "initial"], dir.path());

        run(&["checkout", "-q", "-b", "task"], dir.path());
        let file = if conflicting { "README.md" } else { "task.txt" };
        std::fs::write(dir.path().join(file), "task change\n").unwrap();
        run(&["add", file], dir.path());
        run(&["commit", "-q", "-m", "task commit"], dir.path());

        run(&["checkout", "-q", "main"], dir.path());
        std::fs::write(dir.path().join(file), "main change\n").unwrap();
        run(&["add", file], dir.path());
        run(&["commit", "-q", "-m", "main commit"], dir.path());

        run(&["checkout", "-q", "task"], dir.path());
        (dir, file.to_string())
    }

    fn complete_turn(summary: &str) -> TurnOutput {
        TurnOutput {
            completion: CompletionObject {
                status: CompletionStatus::Complete,
                summary: Some(summary.to_string()),
                reason: None,
                artifact: None,
                findings: Vec::new(),
                issues: Vec::new(),
                raw: serde_json::Value::Null,
            },
            transcript: summary.to_string(),
            token_usage: TokenUsage::default(),
            final_activity: ActivityState::Idle,
        }
    }

    #[test]
    fn risk_tier_uses_worst_of_three_dimensions() {
        assert_eq!(risk_tier(3, 50, 0), RiskTier::Low);
        assert_eq!(risk_tier(3, 50, 2), RiskTier::Medium);
        assert_eq!(risk_tier(40, 50, 0), RiskTier::Critical);
        assert_eq!(risk_tier(10, 200, 5), RiskTier::High);
    }

    #[tokio::test]
    async fn sync_with_no_divergence_in_target_succeeds_without_conflicts() {
        let (dir, _file) = setup_repo_with_divergent_branches(false);
        // Fake "origin/main" as a local ref pointing at main, since this
        // test has no real remote.
        Command::new("git")
            .args(["update-ref", "refs/remotes/origin/main", "main"])
            .current_dir(dir.path())
            .status()
            .unwrap();

        let req = FinalizeRequest {
            task_id: "TASK-1",
            task_title: "add a feature",
            worktree_path: dir.path(),
            target_branch: "main",
            task_branch: "task",
            finalize: &FinalizeConfig {
                sync_strategy: SyncStrategy::Rebase,
                conflict_resolution: ConflictResolution::Agent,
                max_merge_retries: 3,
            },
            test_command: None,
            turn_max: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(30),
        };
        let runner = crate::turn::MockTurnRunner::new(vec![]);

        let result = sync_with_target(&runner, &req, "origin/main").await.unwrap();
        match result {
            SyncResult::Synced { conflicts_resolved } => assert_eq!(conflicts_resolved, 0),
            SyncResult::Escalate { reason } => panic!("expected clean sync, got escalate: {reason}"),
        }
    }

    #[tokio::test]
    async fn sync_resolves_conflict_via_turn_and_continues_rebase() {
        let (dir, file) = setup_repo_with_divergent_branches(true);
        Command::new("git")
            .args(["update-ref", "refs/remotes/origin/main", "main"])
            .current_dir(dir.path())
            .status()
            .unwrap();

        let req = FinalizeRequest {
            task_id: "TASK-2",
            task_title: "add a feature",
            worktree_path: dir.path(),
            target_branch: "main",
            task_branch: "task",
            finalize: &FinalizeConfig {
                sync_strategy: SyncStrategy::Rebase,
                conflict_resolution: ConflictResolution::Agent,
                max_merge_retries: 3,
            },
            test_command: None,
            turn_max: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(30),
        };
        // The conflict turn "resolves" it by writing a merged version.
        std::fs::write(dir.path().join(&file), "resolved\n").unwrap();
        let runner = crate::turn::MockTurnRunner::new(vec![Ok(complete_turn("resolved conflict"))]);

        let result = sync_with_target(&runner, &req, "origin/main").await.unwrap();
        match result {
            SyncResult::Synced { conflicts_resolved } => assert_eq!(conflicts_resolved, 1),
            SyncResult::Escalate { reason } => panic!("expected resolved sync, got escalate: {reason}"),
        }
        assert!(!git::rebase_in_progress(dir.path()));
    }

    #[tokio::test]
    async fn escalates_when_conflict_resolution_is_configured_to_abort() {
        let (dir, _file) = setup_repo_with_divergent_branches(true);
        Command::new("git")
            .args(["update-ref", "refs/remotes/origin/main", "main"])
            .current_dir(dir.path())
            .status()
            .unwrap();

        let req = FinalizeRequest {
            task_id: "TASK-3",
            task_title: "add a feature",
            worktree_path: dir.path(),
            target_branch: "main",
            task_branch: "task",
            finalize: &FinalizeConfig {
                sync_strategy: SyncStrategy::Rebase,
                conflict_resolution: ConflictResolution::Abort,
                max_merge_retries: 3,
            },
            test_command: None,
            turn_max: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(30),
        };
        let runner = crate::turn::MockTurnRunner::new(vec![]);

        let result = sync_with_target(&runner, &req, "origin/main").await.unwrap();
        assert!(matches!(result, SyncResult::Escalate { .. }));
        assert!(!git::rebase_in_progress(dir.path()));
    }
}
