// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persisted record types and their state machines.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StateError;

/// Current on-disk state format.
pub const STATE_VERSION: u32 = 2;

/// Directory under a project's base dir holding the clone.
pub const REPO_DIR: &str = "repo";

/// Directory under a project's base dir holding sandboxes.
pub const SANDBOXES_DIR: &str = "sandboxes";

// ============================================================================
// Project lifecycle
// ============================================================================

/// Lifecycle status of a project's agent process.
///
/// ```text
/// STOPPED ──► STARTING ──► RUNNING ──► STOPPING ──► STOPPED
///                │            │
///                └──► FAILED ◄┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        }
    }

    /// Whether `self -> next` is a legal edge.
    pub fn can_transition_to(self, next: ProjectStatus) -> bool {
        use ProjectStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Failed, Starting)
                | (Failed, Stopped)
                | (Starting, Running)
                | (Starting, Failed)
                // clone blocked on a deploy key: back to rest, not a failure
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Failed)
                // orphan correction
                | (Running, Stopped)
                | (Stopping, Stopped)
                | (Stopping, Failed)
        )
    }

    /// Validate and perform a transition. Staying in place is always allowed.
    pub fn transition(self, next: ProjectStatus) -> Result<ProjectStatus, StateError> {
        if self == next || self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(StateError::invalid_transition("project", self, next))
        }
    }

    /// Whether a project in this state holds one slot of the active counter.
    /// A STOPPING project was counted while it ran and keeps its slot until
    /// it settles.
    pub fn is_counted(self) -> bool {
        matches!(self, Self::Running | Self::Stopping)
    }

    /// Map a free-form status string from an older state file.
    pub fn from_legacy(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" | "healthy" | "active" | "started" => Self::Running,
            "starting" => Self::Starting,
            "stopping" => Self::Stopping,
            "failed" | "error" | "crashed" | "unhealthy" => Self::Failed,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of the shared router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterStatus {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl RouterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: RouterStatus) -> bool {
        use RouterStatus::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Failed, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                // a healthy process must not stay marked failed
                | (Failed, Running)
                | (Failed, Idle)
                | (Stopping, Idle)
                | (Stopping, Failed)
                // orphan correction
                | (Running, Idle)
        )
    }

    pub fn transition(self, next: RouterStatus) -> Result<RouterStatus, StateError> {
        if self == next || self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(StateError::invalid_transition("router", self, next))
        }
    }

    pub fn from_legacy(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" | "healthy" | "active" => Self::Running,
            "starting" => Self::Starting,
            "stopping" => Self::Stopping,
            "failed" | "error" => Self::Failed,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for RouterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which step of a multi-step operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStage {
    Clone,
    Binary,
    Port,
    Spawn,
    Health,
    Stop,
    Crash,
}

impl ErrorStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clone => "clone",
            Self::Binary => "binary",
            Self::Port => "port",
            Self::Spawn => "spawn",
            Self::Health => "health",
            Self::Stop => "stop",
            Self::Crash => "crash",
        }
    }
}

impl fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Records
// ============================================================================

/// The OS-level view of a project's agent process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stage: Option<ErrorStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// An isolated working copy of a project's repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRecord {
    pub name: String,
    /// Branch checked out in the sandbox.
    pub branch: String,
    /// Branch the sandbox was created from.
    #[serde(default)]
    pub base_branch: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// A managed repository and its agent process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    /// Normalized repository URL; the primary key.
    pub repo_url: String,
    pub display_name: String,
    pub base_dir: PathBuf,
    /// Pre-v2 name of `base_dir`, kept so older readers still find the directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_dir: Option<PathBuf>,
    /// Identifier assigned by the agent binary once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub worktrees: Vec<SandboxRecord>,
    #[serde(default)]
    pub process: ProcessRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectRecord {
    pub fn new(repo_url: impl Into<String>, display_name: impl Into<String>, base_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            repo_url: repo_url.into(),
            display_name: display_name.into(),
            base_dir,
            project_dir: None,
            project_id: None,
            worktrees: Vec::new(),
            process: ProcessRecord::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Directory holding the clone; the agent's working directory.
    pub fn repo_dir(&self) -> PathBuf {
        repo_dir_for(&self.base_dir)
    }

    /// Directory under which sandboxes are created.
    pub fn sandboxes_dir(&self) -> PathBuf {
        self.base_dir.join(SANDBOXES_DIR)
    }

    pub fn sandbox(&self, name: &str) -> Option<&SandboxRecord> {
        self.worktrees.iter().find(|w| w.name == name)
    }

    pub fn sandbox_names(&self) -> Vec<String> {
        self.worktrees.iter().map(|w| w.name.clone()).collect()
    }

    pub fn status(&self) -> ProjectStatus {
        self.process.status
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Clone location for a given base directory.
pub fn repo_dir_for(base_dir: &Path) -> PathBuf {
    base_dir.join(REPO_DIR)
}

/// Singleton record for the shared router process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRouterState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Sticky once chosen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub status: RouterStatus,
    #[serde(default)]
    pub active_project_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
}

impl Default for GlobalRouterState {
    fn default() -> Self {
        Self {
            pid: None,
            port: None,
            status: RouterStatus::Idle,
            active_project_count: 0,
            last_error: None,
            created_at: Utc::now(),
            last_health_check: None,
        }
    }
}

/// The whole state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFile {
    pub version: u32,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectRecord>,
    #[serde(default)]
    pub router: GlobalRouterState,
    /// Legacy records that could not be re-keyed, preserved verbatim.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub unmigrated: serde_json::Map<String, serde_json::Value>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            projects: BTreeMap::new(),
            router: GlobalRouterState::default(),
            unmigrated: serde_json::Map::new(),
        }
    }
}

impl StateFile {
    /// Number of projects whose recorded status is RUNNING.
    pub fn running_count(&self) -> u32 {
        self.projects
            .values()
            .filter(|p| p.process.status == ProjectStatus::Running)
            .count() as u32
    }
}
