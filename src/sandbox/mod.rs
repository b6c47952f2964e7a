// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sandboxes: disposable git worktrees of a project's repository.

pub mod git;
pub mod manager;

use std::path::PathBuf;

pub use git::{GitBackend, GitCli, GitError, WorktreeInfo};
pub use manager::{validate_name, SandboxInfo, SandboxManager, SANDBOX_BRANCH_PREFIX};

use crate::state::StateError;

/// Errors from sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Invalid sandbox name '{0}': use 1-64 of [A-Za-z0-9._-], not starting with '.'")]
    InvalidName(String),

    #[error("Sandbox '{name}' already exists for {project}")]
    AlreadyExists { project: String, name: String },

    #[error("Sandbox '{name}' not found for {project}")]
    NotFound { project: String, name: String },

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Repository not cloned yet at {0}; start the project first")]
    RepositoryMissing(PathBuf),

    #[error("Sandbox directory already exists: {0}")]
    PathOccupied(PathBuf),

    #[error("Start command for sandbox '{name}' failed: {message}")]
    StartCommandFailed { name: String, message: String },

    #[error("Start command for sandbox '{name}' timed out after {secs}s")]
    StartCommandTimeout { name: String, secs: u64 },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    State(#[from] StateError),
}
