// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! agentfleet - lifecycle orchestration for coding-agent servers.
//!
//! Runs one agent process per repository plus a single shared router that
//! exposes them all through one endpoint, and manages disposable worktree
//! sandboxes per repository.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`identity`] - Repository URL normalization, display names, base dirs
//! - [`persist`] - Atomic owner-only JSON files
//! - [`state`] - Persisted project and router records, with migration
//! - [`router_config`] - The routing file consumed by the shared router
//! - [`process`] - Spawning, health checks, termination, port handling
//! - [`sandbox`] - Git worktree sandboxes and the clone primitive
//! - [`keys`] - Per-project deploy keys
//! - [`orchestrator`] - The public lifecycle operations
//! - [`guard`] - Duplicate and orphan detection and repair
//! - [`config`] - Configuration loading, merging and secrets
//! - [`error`] - Error types and the error taxonomy
//! - [`telemetry`] - Tracing and metrics
//!
//! # Example
//!
//! ```rust,ignore
//! use agentfleet::config::{load_config, load_secrets, CliOptions};
//! use agentfleet::orchestrator::{Orchestrator, StartOptions};
//!
//! let config = load_config(&CliOptions::default())?;
//! let secrets = load_secrets(&config.secrets_path())?;
//! let orchestrator = Orchestrator::new(config, secrets)?;
//!
//! orchestrator.start("git@github.com:user/repo.git", StartOptions::default()).await?;
//! ```

pub mod config;
pub mod error;
pub mod guard;
pub mod identity;
pub mod keys;
pub mod orchestrator;
pub mod persist;
pub mod process;
pub mod router_config;
pub mod sandbox;
pub mod state;
pub mod telemetry;

// Re-export commonly used types at crate root
pub use error::{ConfigError, ErrorKind, FleetError, FleetResult, IdentityError, Result, SecretsError};
pub use guard::{ConsistencyGuard, DuplicateGroup, MergeReport, OrphanReport};
pub use identity::{normalize, RepoIdentity};
pub use orchestrator::{
    DestroyOutcome, Orchestrator, ProjectStatusReport, ProjectSummary, RouterReport, StartOptions,
    StartOutcome, StopOutcome,
};
pub use state::{GlobalRouterState, ProjectRecord, ProjectStatus, RouterStatus};

/// agentfleet version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
