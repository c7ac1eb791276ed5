use std::path::Path;
use std::process::Command;

/// A single entry from `git status --porcelain` output.
///
/// Note: porcelain v1 format uses ASCII for the two-character status code and space separator,
/// so byte-offset slicing at positions 0..2 and 3.. is safe. File paths with special characters
/// may be quoted by git.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEntry {
    /// Two-character status code (e.g., "M ", "??", "A ")
    pub status_code: String,
    /// The file path
    pub path: String,
}

/// Verify only that a git repository exists in the given directory.
///
/// Does not check working tree cleanliness, branch state, or rebase/merge status.
/// Use this when you only need to confirm git is available (e.g., `init`).
pub fn is_git_repo(repo_dir: Option<&Path>) -> Result<(), String> {
    run_git_command(&["rev-parse", "--git-dir"], repo_dir)
        .map_err(|_| "Not a git repository (or git is not installed)".to_string())?;
    Ok(())
}

/// Verify git preconditions for safe orchestrator operation.
///
/// Checks:
/// - Git repo exists (`git rev-parse --git-dir`)
/// - Working tree is clean (`git status --porcelain` is empty)
/// - Not in detached HEAD or rebase/merge state
pub fn check_preconditions(repo_dir: Option<&Path>) -> Result<(), String> {
    // Verify git repo exists and capture git dir path for later checks
    let git_dir_output = run_git_command(&["rev-parse", "--git-dir"], repo_dir)
        .map_err(|_| "Not a git repository (or git is not installed)".to_string())?;

    // Check for clean working tree
    let status_output = run_git_command(&["status", "--porcelain"], repo_dir)?;
    if !status_output.trim().is_empty() {
        return Err(
            "Working tree is not clean. Commit or stash changes before running the orchestrator."
                .to_string(),
        );
    }

    // Check for detached HEAD
    let head_check = run_git_command(&["symbolic-ref", "--quiet", "HEAD"], repo_dir);
    if head_check.is_err() {
        return Err(
            "Detached HEAD state detected. Check out a branch before running the orchestrator."
                .to_string(),
        );
    }

    // Check for rebase/merge in progress
    let git_dir_path = if let Some(base) = repo_dir {
        base.join(git_dir_output.trim())
    } else {
        std::path::PathBuf::from(git_dir_output.trim())
    };

    if git_dir_path.join("rebase-merge").exists() || git_dir_path.join("rebase-apply").exists() {
        return Err(
            "Rebase in progress. Complete or abort the rebase before running the orchestrator."
                .to_string(),
        );
    }

    if git_dir_path.join("MERGE_HEAD").exists() {
        return Err(
            "Merge in progress. Complete or abort the merge before running the orchestrator."
                .to_string(),
        );
    }

    Ok(())
}

/// Stage specific file paths for commit in a specific repo directory.
///
/// Uses `git add` with explicit paths only (never `-A` or `.`).
pub fn stage_paths(paths: &[&Path], repo_dir: Option<&Path>) -> Result<(), String> {
    if paths.is_empty() {
        return Ok(());
    }

    let mut args = vec!["add".to_string(), "--".to_string()];
    for p in paths {
        args.push(
            p.to_str()
                .ok_or_else(|| format!("Path contains invalid UTF-8: {:?}", p))?
                .to_string(),
        );
    }

    let args_ref: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    run_git_command(&args_ref, repo_dir)?;
    Ok(())
}

/// Create a git commit with the given message.
///
/// Returns the commit hash on success. If the commit fails, returns an error
/// (caller treats as phase failure).
pub fn commit(message: &str, repo_dir: Option<&Path>) -> Result<String, String> {
    run_git_command(&["commit", "-m", message], repo_dir)?;
    let hash = run_git_command(&["rev-parse", "HEAD"], repo_dir)?;
    Ok(hash.trim().to_string())
}

/// Parse `git status --porcelain` output into structured entries.
pub fn get_status(repo_dir: Option<&Path>) -> Result<Vec<StatusEntry>, String> {
    let output = run_git_command(&["status", "--porcelain"], repo_dir)?;

    let entries = output
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            if line.len() < 3 {
                // Malformed porcelain output line -- skip
                None
            } else {
                Some(StatusEntry {
                    status_code: line[..2].to_string(),
                    path: line[3..].to_string(),
                })
            }
        })
        .collect();

    Ok(entries)
}

/// Returns the full 40-character SHA of HEAD.
pub fn get_head_sha(project_root: &Path) -> Result<String, String> {
    let output = run_git_command(&["rev-parse", "HEAD"], Some(project_root))?;
    Ok(output.trim().to_string())
}

/// Checks whether `sha` is an ancestor of the current HEAD.
///
/// Uses `git merge-base --is-ancestor`:
/// - Exit 0 → true (sha is an ancestor of HEAD)
/// - Exit 1 → false (sha is not an ancestor)
/// - Exit 128 → Err (unknown commit / other git error)
pub fn is_ancestor(sha: &str, project_root: &Path) -> Result<bool, String> {
    if sha.is_empty() || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("Invalid SHA: '{}'", sha));
    }

    let mut cmd = Command::new("git");
    cmd.args(["merge-base", "--is-ancestor", sha, "HEAD"]);
    cmd.current_dir(project_root);

    let output = cmd
        .output()
        .map_err(|e| format!("Failed to run git merge-base: {}", e))?;

    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        Some(128) | None => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("git merge-base failed: {}", stderr.trim()))
        }
        Some(code) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "git merge-base exited with unexpected code {}: {}",
                code,
                stderr.trim()
            ))
        }
    }
}

/// Create a worktree at `path` checked out on a new branch `branch` based
/// at `base_ref`. Fails if the path is already occupied or the branch
/// already exists (callers pick a fresh branch name first).
pub fn worktree_add(path: &Path, branch: &str, base_ref: &str, project_root: &Path) -> Result<(), String> {
    let path_s = path
        .to_str()
        .ok_or_else(|| format!("worktree path contains invalid UTF-8: {:?}", path))?;
    run_git_command(
        &["worktree", "add", "-b", branch, path_s, base_ref],
        Some(project_root),
    )?;
    Ok(())
}

/// Tears down a worktree. Idempotent: a missing path is not an error.
pub fn worktree_remove(path: &Path, project_root: &Path) -> Result<(), String> {
    if !path.exists() {
        return Ok(());
    }
    let path_s = path
        .to_str()
        .ok_or_else(|| format!("worktree path contains invalid UTF-8: {:?}", path))?;
    run_git_command(&["worktree", "remove", "--force", path_s], Some(project_root))?;
    Ok(())
}

pub fn worktree_list(project_root: &Path) -> Result<String, String> {
    run_git_command(&["worktree", "list", "--porcelain"], Some(project_root))
}

pub fn branch_exists(branch: &str, repo_dir: &Path) -> Result<bool, String> {
    let ref_name = format!("refs/heads/{branch}");
    let mut cmd = Command::new("git");
    cmd.args(["show-ref", "--verify", "--quiet", ref_name.as_str()]);
    cmd.current_dir(repo_dir);
    let output = cmd
        .output()
        .map_err(|e| format!("Failed to run git show-ref: {}", e))?;
    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => Err(format!(
            "git show-ref failed for '{}': {}",
            branch,
            String::from_utf8_lossy(&output.stderr).trim()
        )),
    }
}

/// Deletes a local branch. Idempotent: a missing branch is not an error.
pub fn delete_branch(branch: &str, repo_dir: &Path) -> Result<(), String> {
    if !branch_exists(branch, repo_dir)? {
        return Ok(());
    }
    run_git_command(&["branch", "-D", branch], Some(repo_dir))?;
    Ok(())
}

pub fn fetch(remote: &str, refspec: &str, repo_dir: &Path) -> Result<(), String> {
    run_git_command(&["fetch", remote, refspec], Some(repo_dir))?;
    Ok(())
}

/// Rebases the current branch of `repo_dir` onto `onto_ref`. On conflict,
/// git leaves the repo mid-rebase; callers check `rebase_in_progress`
/// before invoking the conflict-resolution turn, and must eventually
/// `rebase_abort` or complete and `add`+`rebase --continue`.
pub fn rebase(onto_ref: &str, repo_dir: &Path) -> Result<(), String> {
    run_git_command(&["rebase", onto_ref], Some(repo_dir))?;
    Ok(())
}

pub fn rebase_continue(repo_dir: &Path) -> Result<(), String> {
    run_git_command(&["rebase", "--continue"], Some(repo_dir))?;
    Ok(())
}

pub fn rebase_abort(repo_dir: &Path) -> Result<(), String> {
    run_git_command(&["rebase", "--abort"], Some(repo_dir))?;
    Ok(())
}

/// Merges `onto_ref` into the current branch of `repo_dir` (no-ff). On
/// conflict, git leaves the repo mid-merge; callers check
/// `merge_in_progress` before invoking the conflict-resolution turn, and
/// must eventually `merge_abort` or complete and commit.
pub fn merge(onto_ref: &str, repo_dir: &Path) -> Result<(), String> {
    run_git_command(&["merge", "--no-ff", onto_ref], Some(repo_dir))?;
    Ok(())
}

pub fn merge_abort(repo_dir: &Path) -> Result<(), String> {
    run_git_command(&["merge", "--abort"], Some(repo_dir))?;
    Ok(())
}

pub fn merge_in_progress(repo_dir: &Path) -> bool {
    let git_dir_output = run_git_command(&["rev-parse", "--git-dir"], Some(repo_dir));
    let Ok(git_dir) = git_dir_output else {
        return false;
    };
    repo_dir.join(git_dir.trim()).join("MERGE_HEAD").exists()
}

pub fn rebase_in_progress(repo_dir: &Path) -> bool {
    let git_dir_output = run_git_command(&["rev-parse", "--git-dir"], Some(repo_dir));
    let Ok(git_dir) = git_dir_output else {
        return false;
    };
    let git_dir_path = repo_dir.join(git_dir.trim());
    git_dir_path.join("rebase-merge").exists() || git_dir_path.join("rebase-apply").exists()
}

/// Lists unmerged conflict paths (`git diff --name-only --diff-filter=U`).
pub fn conflicted_paths(repo_dir: &Path) -> Result<Vec<String>, String> {
    let output = run_git_command(&["diff", "--name-only", "--diff-filter=U"], Some(repo_dir))?;
    Ok(output.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
}

pub fn push(remote: &str, branch: &str, force_with_lease: bool, repo_dir: &Path) -> Result<(), String> {
    if force_with_lease {
        run_git_command(&["push", "--force-with-lease", remote, branch], Some(repo_dir))?;
    } else {
        run_git_command(&["push", remote, branch], Some(repo_dir))?;
    }
    Ok(())
}

/// Counts ahead/behind commits of `branch` relative to `base` as
/// `(ahead, behind)`, i.e. commits on `branch` not on `base` and vice
/// versa, via `git rev-list --left-right --count base...branch`.
pub fn divergence(branch: &str, base: &str, repo_dir: &Path) -> Result<(u32, u32), String> {
    let spec = format!("{base}...{branch}");
    let output = run_git_command(&["rev-list", "--left-right", "--count", spec.as_str()], Some(repo_dir))?;
    let mut parts = output.split_whitespace();
    let behind: u32 = parts
        .next()
        .ok_or_else(|| "unexpected rev-list output".to_string())?
        .parse()
        .map_err(|e| format!("failed to parse rev-list behind count: {}", e))?;
    let ahead: u32 = parts
        .next()
        .ok_or_else(|| "unexpected rev-list output".to_string())?
        .parse()
        .map_err(|e| format!("failed to parse rev-list ahead count: {}", e))?;
    Ok((ahead, behind))
}

/// Counts changed files and total changed lines between two refs, for
/// finalize risk assessment (`git diff --shortstat base...head`).
pub fn diff_stat(base: &str, head: &str, repo_dir: &Path) -> Result<(u32, u32), String> {
    let spec = format!("{base}...{head}");
    let output = run_git_command(&["diff", "--shortstat", spec.as_str()], Some(repo_dir))?;
    let files = extract_stat_number(&output, "file");
    let insertions = extract_stat_number(&output, "insertion");
    let deletions = extract_stat_number(&output, "deletion");
    Ok((files, insertions + deletions))
}

fn extract_stat_number(shortstat: &str, label: &str) -> u32 {
    for token in shortstat.split(',') {
        let token = token.trim();
        if token.contains(label) {
            if let Some(n) = token.split_whitespace().next() {
                return n.parse().unwrap_or(0);
            }
        }
    }
    0
}

/// Run a git command and return its stdout as a string.
fn run_git_command(args: &[&str], repo_dir: Option<&Path>) -> Result<String, String> {
    let mut cmd = Command::new("git");
    cmd.args(args);

    if let Some(dir) = repo_dir {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .map_err(|e| format!("Failed to run git {}: {}", args.first().unwrap_or(&""), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            stderr.trim()
        ));
    }

    String::from_utf8(output.stdout).map_err(|e| format!("git output is not valid UTF-8: {}", e))
}
