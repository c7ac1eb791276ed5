//! Worktree manager (C2): checks out an isolated working copy per run so
//! concurrent runs never contend for the same path. Grounded on the
//! battysh-batty worktree pattern (run-numbered branches under a
//! project-local directory, idempotent teardown), reworked onto this
//! crate's `Result<T, String>` git idiom (`git.rs`) instead of
//! anyhow/tracing.

use std::path::{Path, PathBuf};

use crate::error::OrcError;
use crate::git;
use crate::log_warn;

const WORKTREE_ROOT: &str = ".orc/worktrees";

/// A checked-out working copy for one (task, run). `path` is where the
/// phase engine and turn executor operate; `branch` is the branch it is
/// checked out on, based at `base_ref` when the worktree was acquired.
#[derive(Debug, Clone)]
pub struct Worktree {
    pub task_id: String,
    pub run_id: String,
    pub branch: String,
    pub base_ref: String,
    pub path: PathBuf,
}

/// Releases a held worktree. `release` is idempotent: calling it twice,
/// or calling it after the path was already removed out from under it
/// (e.g. by a prior crashed run's cleanup), is not an error.
pub struct Release {
    project_root: PathBuf,
    path: PathBuf,
    released: bool,
}

impl Release {
    pub fn call(mut self) -> Result<(), OrcError> {
        self.do_release()
    }

    fn do_release(&mut self) -> Result<(), OrcError> {
        if self.released {
            return Ok(());
        }
        git::worktree_remove(&self.path, &self.project_root).map_err(OrcError::Git)?;
        self.released = true;
        Ok(())
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.do_release() {
                log_warn!("failed to release worktree at {}: {e}", self.path.display());
            }
        }
    }
}

/// Acquires an isolated worktree for (`task_id`, `run_id`) checked out at
/// `base_ref`. Fails with `ErrWorktreeUnavailable` if the base ref does
/// not exist or the project tree is dirty in a way that would make the
/// checkout unsafe (mirrors `git::check_preconditions`'s rebase/merge
/// guard, but does NOT require a clean working tree — only the project
/// repo itself need be free of an in-progress rebase/merge, since the
/// worktree is a separate checkout).
pub fn acquire(
    project_root: &Path,
    task_id: &str,
    run_id: &str,
    base_ref: &str,
) -> Result<(Worktree, Release), OrcError> {
    if git::rebase_in_progress(project_root) {
        return Err(OrcError::WorktreeUnavailable {
            task_id: task_id.to_string(),
            reason: "project repo has a rebase in progress".to_string(),
        });
    }

    if !git::branch_exists(base_ref, project_root).unwrap_or(false)
        && !ref_resolves(base_ref, project_root)
    {
        return Err(OrcError::WorktreeUnavailable {
            task_id: task_id.to_string(),
            reason: format!("base ref '{base_ref}' does not exist"),
        });
    }

    let branch = branch_name(task_id, run_id);
    let worktree_path = project_root.join(WORKTREE_ROOT).join(slug(task_id, run_id));

    if worktree_path.exists() {
        return Err(OrcError::WorktreeUnavailable {
            task_id: task_id.to_string(),
            reason: format!("worktree path {} already in use", worktree_path.display()),
        });
    }

    std::fs::create_dir_all(worktree_path.parent().unwrap_or(Path::new(".")))
        .map_err(|e| OrcError::Io(e.to_string()))?;

    git::worktree_add(&worktree_path, &branch, base_ref, project_root).map_err(|reason| {
        OrcError::WorktreeUnavailable {
            task_id: task_id.to_string(),
            reason,
        }
    })?;

    let worktree = Worktree {
        task_id: task_id.to_string(),
        run_id: run_id.to_string(),
        branch,
        base_ref: base_ref.to_string(),
        path: worktree_path.clone(),
    };
    let release = Release {
        project_root: project_root.to_path_buf(),
        path: worktree_path,
        released: false,
    };

    Ok((worktree, release))
}

/// Tears down a worktree and deletes its branch. Distinct from `Release`
/// (which only removes the worktree's filesystem entry, per the spec's
/// idempotent-release contract) — call this once a run's branch is no
/// longer needed at all, e.g. after finalize has merged it upstream.
pub fn discard(project_root: &Path, worktree: &Worktree) -> Result<(), OrcError> {
    git::worktree_remove(&worktree.path, project_root).map_err(OrcError::Git)?;
    git::delete_branch(&worktree.branch, project_root).map_err(OrcError::Git)?;
    Ok(())
}

fn branch_name(task_id: &str, run_id: &str) -> String {
    format!("orc/{}/{}", slug_component(task_id), slug_component(run_id))
}

fn slug(task_id: &str, run_id: &str) -> String {
    format!("{}-{}", slug_component(task_id), slug_component(run_id))
}

fn slug_component(s: &str) -> String {
    let lowered: String = s
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let collapsed = lowered
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if collapsed.is_empty() {
        "x".to_string()
    } else {
        collapsed
    }
}

fn ref_resolves(base_ref: &str, project_root: &Path) -> bool {
    git::branch_exists(base_ref, project_root).unwrap_or(false) || {
        // Not a local branch: could still be a tag/sha the checkout can
        // resolve directly, which `worktree_add` will validate for real.
        base_ref.chars().all(|c| c.is_ascii_hexdigit()) && base_ref.len() >= 7
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn setup_temp_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            let status = Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .status()
                .unwrap();
            assert!(status.success(), "git {:?} failed", args);
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        run(&["add", "README.md"]);
        run(&["commit", "-q", "-m", "initial"]);
        dir
    }

    #[test]
    fn acquire_checks_out_isolated_worktree_at_head() {
        let dir = setup_temp_repo();
        let head = git::get_head_sha(dir.path()).unwrap();

        let (wt, release) = acquire(dir.path(), "TASK-1", "run-1", &head).unwrap();
        assert!(wt.path.exists());
        assert!(wt.path.join("README.md").exists());

        release.call().unwrap();
        assert!(!wt.path.exists());
    }

    #[test]
    fn release_is_idempotent() {
        let dir = setup_temp_repo();
        let head = git::get_head_sha(dir.path()).unwrap();
        let (wt, release) = acquire(dir.path(), "TASK-2", "run-1", &head).unwrap();
        let path = wt.path.clone();

        git::worktree_remove(&path, dir.path()).unwrap();
        release.call().unwrap();
    }

    #[test]
    fn acquire_rejects_unknown_base_ref() {
        let dir = setup_temp_repo();
        let err = acquire(dir.path(), "TASK-3", "run-1", "does-not-exist").unwrap_err();
        assert!(matches!(err, OrcError::WorktreeUnavailable { .. }));
    }

    #[test]
    fn acquire_rejects_reused_path() {
        let dir = setup_temp_repo();
        let head = git::get_head_sha(dir.path()).unwrap();
        let (_wt1, _release1) = acquire(dir.path(), "TASK-4", "run-1", &head).unwrap();

        let err = acquire(dir.path(), "TASK-4", "run-1", &head).unwrap_err();
        assert!(matches!(err, OrcError::WorktreeUnavailable { .. }));
    }

    #[test]
    fn discard_removes_worktree_and_branch() {
        let dir = setup_temp_repo();
        let head = git::get_head_sha(dir.path()).unwrap();
        let (wt, release) = acquire(dir.path(), "TASK-5", "run-1", &head).unwrap();
        let branch = wt.branch.clone();

        discard(dir.path(), &wt).unwrap();
        assert!(!git::branch_exists(&branch, dir.path()).unwrap());

        // worktree already gone; release must still be a no-op.
        release.call().unwrap();
    }
}
