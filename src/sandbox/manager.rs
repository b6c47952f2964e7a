// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sandbox lifecycle: create, list, delete, reset.
//!
//! Each sandbox is a worktree at `<baseDir>/sandboxes/<name>` on its own
//! `sandbox/<name>` branch, sharing the project clone's object store. Creation
//! is all-or-nothing: if the optional start command fails the worktree is
//! removed again and nothing is recorded.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn};

use super::git::GitBackend;
use super::SandboxError;
use crate::state::{ProjectRecord, SandboxRecord, StateError, StateStore};

/// Prefix of the branch each sandbox owns.
pub const SANDBOX_BRANCH_PREFIX: &str = "sandbox/";

static NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,64}$").expect("valid regex"));

/// Check a sandbox name before it is used as a path segment and branch name.
pub fn validate_name(name: &str) -> Result<(), SandboxError> {
    if name.starts_with('.') || !NAME.is_match(name) {
        return Err(SandboxError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// A sandbox record plus whether its directory is still there.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    #[serde(flatten)]
    pub record: SandboxRecord,
    pub exists: bool,
}

/// Creates and destroys sandboxes for projects in the state store.
pub struct SandboxManager {
    store: Arc<StateStore>,
    git: Arc<dyn GitBackend>,
    start_command_timeout: Duration,
}

impl SandboxManager {
    pub fn new(store: Arc<StateStore>, git: Arc<dyn GitBackend>, start_command_timeout: Duration) -> Self {
        Self {
            store,
            git,
            start_command_timeout,
        }
    }

    async fn project(&self, key: &str) -> Result<ProjectRecord, SandboxError> {
        self.store
            .get(key)
            .await?
            .ok_or_else(|| SandboxError::ProjectNotFound(key.to_string()))
    }

    fn find<'a>(record: &'a ProjectRecord, name: &str) -> Result<&'a SandboxRecord, SandboxError> {
        record.sandbox(name).ok_or_else(|| SandboxError::NotFound {
            project: record.repo_url.clone(),
            name: name.to_string(),
        })
    }

    /// Create sandbox `name` from `branch` (default: the clone's current branch).
    pub async fn create(
        &self,
        key: &str,
        name: &str,
        branch: Option<&str>,
        start_command: Option<&str>,
    ) -> Result<SandboxRecord, SandboxError> {
        validate_name(name)?;
        let project = self.project(key).await?;
        if project.sandbox(name).is_some() {
            return Err(SandboxError::AlreadyExists {
                project: key.to_string(),
                name: name.to_string(),
            });
        }

        let repo = project.repo_dir();
        if !self.git.is_repository(&repo) {
            return Err(SandboxError::RepositoryMissing(repo));
        }
        let path = project.sandboxes_dir().join(name);
        if path.exists() {
            return Err(SandboxError::PathOccupied(path));
        }

        let base_branch = match branch {
            Some(b) => b.to_string(),
            None => self.git.current_branch(&repo).await?,
        };
        let sandbox_branch = format!("{}{}", SANDBOX_BRANCH_PREFIX, name);
        self.git
            .worktree_add(&repo, &path, &sandbox_branch, &base_branch)
            .await?;

        if let Some(command) = start_command {
            if let Err(e) = self.run_start_command(name, &path, command).await {
                self.discard(&repo, &path, &sandbox_branch).await;
                return Err(e);
            }
        }

        let record = SandboxRecord {
            name: name.to_string(),
            branch: sandbox_branch.clone(),
            base_branch,
            path: path.clone(),
            created_at: Utc::now(),
        };

        let saved = record.clone();
        let result = self
            .store
            .update_project(key, move |project| {
                if project.sandbox(&saved.name).is_some() {
                    return Ok(false);
                }
                project.worktrees.push(saved);
                Ok(true)
            })
            .await;

        match result {
            Ok(true) => {
                info!("Created sandbox {} for {} at {}", name, key, path.display());
                Ok(record)
            }
            Ok(false) => {
                self.discard(&repo, &path, &sandbox_branch).await;
                Err(SandboxError::AlreadyExists {
                    project: key.to_string(),
                    name: name.to_string(),
                })
            }
            Err(e) => {
                self.discard(&repo, &path, &sandbox_branch).await;
                Err(e.into())
            }
        }
    }

    async fn run_start_command(&self, name: &str, dir: &Path, command: &str) -> Result<(), SandboxError> {
        info!("Running start command for sandbox {}: {}", name, command);
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.start_command_timeout, child)
            .await
            .map_err(|_| SandboxError::StartCommandTimeout {
                name: name.to_string(),
                secs: self.start_command_timeout.as_secs(),
            })?
            .map_err(|e| SandboxError::StartCommandFailed {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(SandboxError::StartCommandFailed {
                name: name.to_string(),
                message: format!("{}: {}", output.status, stderr),
            })
        }
    }

    /// Best-effort removal of a worktree and its branch.
    async fn discard(&self, repo: &Path, path: &Path, branch: &str) {
        if let Err(e) = self.git.worktree_remove(repo, path).await {
            warn!("git worktree remove {} failed: {}", path.display(), e);
            if path.exists() {
                if let Err(e) = std::fs::remove_dir_all(path) {
                    warn!("Failed to delete {}: {}", path.display(), e);
                }
            }
            if let Err(e) = self.git.worktree_prune(repo).await {
                warn!("git worktree prune failed: {}", e);
            }
        }
        if self.git.branch_exists(repo, branch).await {
            if let Err(e) = self.git.delete_branch(repo, branch).await {
                warn!("Failed to delete branch {}: {}", branch, e);
            }
        }
    }

    /// Sandboxes of a project, with a liveness flag for each directory.
    pub async fn list(&self, key: &str) -> Result<Vec<SandboxInfo>, SandboxError> {
        let project = self.project(key).await?;
        Ok(project
            .worktrees
            .into_iter()
            .map(|record| {
                let exists = record.path.is_dir();
                SandboxInfo { record, exists }
            })
            .collect())
    }

    /// Remove a sandbox's worktree, branch and record.
    pub async fn delete(&self, key: &str, name: &str) -> Result<SandboxRecord, SandboxError> {
        let project = self.project(key).await?;
        let record = Self::find(&project, name)?.clone();

        self.discard(&project.repo_dir(), &record.path, &record.branch).await;

        self.store
            .update_project(key, |project| {
                project.worktrees.retain(|w| w.name != name);
                Ok(())
            })
            .await?;
        info!("Deleted sandbox {} for {}", name, key);
        Ok(record)
    }

    /// Put a sandbox back on the project's default branch, discarding changes.
    pub async fn reset(&self, key: &str, name: &str) -> Result<SandboxRecord, SandboxError> {
        let project = self.project(key).await?;
        let record = Self::find(&project, name)?.clone();
        if !record.path.is_dir() {
            return Err(SandboxError::NotFound {
                project: key.to_string(),
                name: name.to_string(),
            });
        }

        let repo = project.repo_dir();
        let default = self.git.default_branch(&repo).await?;
        let target = if self.git.branch_exists(&repo, &default).await {
            default
        } else {
            let remote = format!("origin/{}", default);
            if !self.git.branch_exists(&repo, &remote).await {
                return Err(super::GitError::NoDefaultBranch(repo).into());
            }
            remote
        };

        self.git
            .reset_worktree(&record.path, &record.branch, &target)
            .await?;

        let updated = self
            .store
            .update_project(key, |project| {
                let sandbox = project
                    .worktrees
                    .iter_mut()
                    .find(|w| w.name == name)
                    .ok_or_else(|| StateError::NotFound(name.to_string()))?;
                sandbox.base_branch = target.clone();
                Ok(sandbox.clone())
            })
            .await?;
        info!("Reset sandbox {} for {} to {}", name, key, target);
        Ok(updated)
    }
}
