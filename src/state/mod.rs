// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persisted state store.
//!
//! The single source of truth for every managed project and the shared
//! router's own status. See [`store::StateStore`] for the locking contract
//! and [`migration`] for the upgrade path from older files.

pub mod migration;
pub mod store;
pub mod types;

use std::fmt;
use std::path::PathBuf;

pub use migration::{migrate, needs_migration, MigrationOutcome};
pub use store::{ProcessUpdate, StateStore};
pub use types::{
    repo_dir_for, ErrorStage, GlobalRouterState, ProcessRecord, ProjectRecord, ProjectStatus,
    RouterStatus, SandboxRecord, StateFile, REPO_DIR, SANDBOXES_DIR, STATE_VERSION,
};

/// Errors from the state store.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("IO error on {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("State file {path} is corrupted: {message}")]
    Corrupted { path: PathBuf, message: String },

    #[error("Project not found in state: {0}")]
    NotFound(String),

    #[error("Invalid {subject} transition: {from} -> {to}")]
    InvalidTransition {
        subject: &'static str,
        from: String,
        to: String,
    },
}

impl StateError {
    pub(crate) fn invalid_transition(
        subject: &'static str,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            subject,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
