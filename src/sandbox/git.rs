// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git plumbing: clone and worktree primitives.
//!
//! Everything shells out to `git`. Each invocation is bounded by a timeout
//! and killed if it overruns.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// stderr fragments that mean the remote refused our credentials.
const ACCESS_DENIED_MARKERS: &[&str] = &[
    "permission denied",
    "repository not found",
    "could not read from remote repository",
    "access denied",
];

/// Errors from git invocations.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Repository access denied: {0}")]
    AccessDenied(String),

    #[error("git {0} timed out")]
    Timeout(String),

    #[error("Could not determine default branch of {0}")]
    NoDefaultBranch(PathBuf),

    #[error("Failed to run git: {0}")]
    Io(String),
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
    pub is_bare: bool,
    pub is_detached: bool,
}

/// Git operations used by the orchestrator and the sandbox manager.
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Whether `path` contains a git checkout.
    fn is_repository(&self, path: &Path) -> bool;

    /// Clone `url` into `dest`, authenticating with `ssh_key` when given.
    async fn clone_repo(&self, url: &str, dest: &Path, ssh_key: Option<&Path>) -> Result<(), GitError>;

    async fn current_branch(&self, repo: &Path) -> Result<String, GitError>;

    /// The remote's default branch, falling back to the current branch.
    async fn default_branch(&self, repo: &Path) -> Result<String, GitError>;

    async fn branch_exists(&self, repo: &Path, branch: &str) -> bool;

    /// `git worktree add -b <new_branch> <path> <base>`.
    async fn worktree_add(
        &self,
        repo: &Path,
        path: &Path,
        new_branch: &str,
        base: &str,
    ) -> Result<(), GitError>;

    async fn worktree_remove(&self, repo: &Path, path: &Path) -> Result<(), GitError>;

    async fn worktree_prune(&self, repo: &Path) -> Result<(), GitError>;

    async fn worktree_list(&self, repo: &Path) -> Result<Vec<WorktreeInfo>, GitError>;

    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<(), GitError>;

    /// Point `branch` at `target` inside `worktree` and discard local changes.
    async fn reset_worktree(&self, worktree: &Path, branch: &str, target: &str) -> Result<(), GitError>;
}

/// [`GitBackend`] backed by the `git` binary.
pub struct GitCli {
    timeout: Duration,
}

impl GitCli {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run a git command in `cwd` and return trimmed stdout.
    async fn git(&self, cwd: &Path, args: &[&str], env: &[(&str, String)]) -> Result<String, GitError> {
        let label = args.first().copied().unwrap_or("").to_string();
        debug!("git {} (in {})", args.join(" "), cwd.display());

        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            command.env(key, value);
        }

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| GitError::Timeout(label.clone()))?
            .map_err(|e| GitError::Io(e.to_string()))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(classify_failure(label, stderr))
        }
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

fn classify_failure(command: String, stderr: String) -> GitError {
    let lower = stderr.to_lowercase();
    if ACCESS_DENIED_MARKERS.iter().any(|m| lower.contains(m)) {
        GitError::AccessDenied(stderr)
    } else {
        GitError::CommandFailed { command, stderr }
    }
}

/// `GIT_SSH_COMMAND` value that pins one identity file.
pub fn ssh_command_for(key: &Path) -> String {
    format!(
        "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
        key.display()
    )
}

/// Parse `git worktree list --porcelain` output.
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current = WorktreeInfo::default();

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if !current.path.as_os_str().is_empty() {
                worktrees.push(std::mem::take(&mut current));
            }
            current.path = PathBuf::from(path);
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            current.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            current.branch = Some(branch.to_string());
        } else if line == "bare" {
            current.is_bare = true;
        } else if line == "detached" {
            current.is_detached = true;
        }
    }

    if !current.path.as_os_str().is_empty() {
        worktrees.push(current);
    }
    worktrees
}

#[async_trait]
impl GitBackend for GitCli {
    fn is_repository(&self, path: &Path) -> bool {
        path.join(".git").exists()
    }

    async fn clone_repo(&self, url: &str, dest: &Path, ssh_key: Option<&Path>) -> Result<(), GitError> {
        let parent = dest
            .parent()
            .ok_or_else(|| GitError::Io(format!("no parent for {}", dest.display())))?;
        std::fs::create_dir_all(parent).map_err(|e| GitError::Io(e.to_string()))?;

        let env: Vec<(&str, String)> = ssh_key
            .filter(|key| key.exists())
            .map(|key| vec![("GIT_SSH_COMMAND", ssh_command_for(key))])
            .unwrap_or_default();

        info!("Cloning {} into {}", url, dest.display());
        let dest_str = dest.to_string_lossy().to_string();
        let result = self.git(parent, &["clone", url, &dest_str], &env).await;

        if result.is_err() && dest.exists() && !self.is_repository(dest) {
            // Leave no half-cloned directory for the next attempt to trip over.
            if let Err(e) = std::fs::remove_dir_all(dest) {
                warn!("Failed to clean up partial clone {}: {}", dest.display(), e);
            }
        }
        result.map(|_| ())
    }

    async fn current_branch(&self, repo: &Path) -> Result<String, GitError> {
        let branch = self.git(repo, &["branch", "--show-current"], &[]).await?;
        if branch.is_empty() {
            Err(GitError::NoDefaultBranch(repo.to_path_buf()))
        } else {
            Ok(branch)
        }
    }

    async fn default_branch(&self, repo: &Path) -> Result<String, GitError> {
        match self
            .git(repo, &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"], &[])
            .await
        {
            Ok(reference) => {
                let name = reference.strip_prefix("origin/").unwrap_or(&reference);
                if !name.is_empty() {
                    return Ok(name.to_string());
                }
            }
            Err(e) => debug!("No origin/HEAD in {}: {}", repo.display(), e),
        }
        self.current_branch(repo).await
    }

    async fn branch_exists(&self, repo: &Path, branch: &str) -> bool {
        self.git(repo, &["rev-parse", "--verify", "--quiet", branch], &[])
            .await
            .is_ok()
    }

    async fn worktree_add(
        &self,
        repo: &Path,
        path: &Path,
        new_branch: &str,
        base: &str,
    ) -> Result<(), GitError> {
        let path_str = path.to_string_lossy().to_string();
        info!("Creating worktree {} on {} from {}", path.display(), new_branch, base);
        self.git(
            repo,
            &["worktree", "add", "-b", new_branch, &path_str, base],
            &[],
        )
        .await
        .map(|_| ())
    }

    async fn worktree_remove(&self, repo: &Path, path: &Path) -> Result<(), GitError> {
        let path_str = path.to_string_lossy().to_string();
        self.git(repo, &["worktree", "remove", "--force", &path_str], &[])
            .await
            .map(|_| ())
    }

    async fn worktree_prune(&self, repo: &Path) -> Result<(), GitError> {
        self.git(repo, &["worktree", "prune"], &[]).await.map(|_| ())
    }

    async fn worktree_list(&self, repo: &Path) -> Result<Vec<WorktreeInfo>, GitError> {
        let output = self
            .git(repo, &["worktree", "list", "--porcelain"], &[])
            .await?;
        Ok(parse_worktree_list(&output))
    }

    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        self.git(repo, &["branch", "-D", branch], &[]).await.map(|_| ())
    }

    async fn reset_worktree(&self, worktree: &Path, branch: &str, target: &str) -> Result<(), GitError> {
        self.git(worktree, &["checkout", "--force", "-B", branch, target], &[])
            .await?;
        self.git(worktree, &["clean", "-fd"], &[]).await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_worktree_list() {
        let output = "worktree /srv/p/repo\nHEAD abc123\nbranch refs/heads/main\n\n\
                      worktree /srv/p/sandboxes/x\nHEAD def456\nbranch refs/heads/sandbox/x\n\n\
                      worktree /srv/p/sandboxes/y\nHEAD 789\ndetached\n";
        let list = parse_worktree_list(output);
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].branch.as_deref(), Some("main"));
        assert_eq!(list[1].path, PathBuf::from("/srv/p/sandboxes/x"));
        assert_eq!(list[1].branch.as_deref(), Some("sandbox/x"));
        assert!(list[2].is_detached);
        assert!(list[2].branch.is_none());
    }

    #[test]
    fn test_access_denied_classification() {
        let err = classify_failure(
            "clone".to_string(),
            "git@github.com: Permission denied (publickey).\nfatal: Could not read from remote repository.".to_string(),
        );
        assert!(matches!(err, GitError::AccessDenied(_)));

        let err = classify_failure("worktree".to_string(), "fatal: invalid reference: nope".to_string());
        assert!(matches!(err, GitError::CommandFailed { .. }));
    }

    #[test]
    fn test_ssh_command_pins_identity() {
        let cmd = ssh_command_for(Path::new("/keys/user-repo/id_ed25519"));
        assert!(cmd.contains("-i /keys/user-repo/id_ed25519"));
        assert!(cmd.contains("IdentitiesOnly=yes"));
    }

    #[tokio::test]
    async fn test_worktree_lifecycle_against_real_git() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        test_repo::init(&repo);
        let git = GitCli::default();

        assert!(git.is_repository(&repo));
        assert_eq!(git.current_branch(&repo).await.unwrap(), "main");
        // No origin: falls back to the current branch.
        assert_eq!(git.default_branch(&repo).await.unwrap(), "main");

        let wt = temp.path().join("sandboxes").join("x");
        git.worktree_add(&repo, &wt, "sandbox/x", "main").await.unwrap();
        assert!(wt.join("README.md").exists());
        assert!(git.branch_exists(&repo, "sandbox/x").await);

        std::fs::write(wt.join("README.md"), "changed\n").unwrap();
        std::fs::write(wt.join("scratch.txt"), "junk\n").unwrap();
        git.reset_worktree(&wt, "sandbox/x", "main").await.unwrap();
        assert_eq!(std::fs::read_to_string(wt.join("README.md")).unwrap(), "hello\n");
        assert!(!wt.join("scratch.txt").exists());

        let list = git.worktree_list(&repo).await.unwrap();
        assert_eq!(list.len(), 2);

        git.worktree_remove(&repo, &wt).await.unwrap();
        git.delete_branch(&repo, "sandbox/x").await.unwrap();
        assert!(!wt.exists());
        assert!(!git.branch_exists(&repo, "sandbox/x").await);
    }

    #[tokio::test]
    async fn test_clone_missing_remote_cleans_up() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("p").join("repo");
        let git = GitCli::default();
        let missing = temp.path().join("no-such-remote");

        let err = git
            .clone_repo(&missing.to_string_lossy(), &dest, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GitError::CommandFailed { .. } | GitError::AccessDenied(_)
        ));
        assert!(!dest.exists());
    }
}
