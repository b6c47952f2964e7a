// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Inputs and results of orchestrator operations.

use std::path::PathBuf;

use serde::Serialize;

use crate::keys::DeployKey;
use crate::process::HealthReport;
use crate::router_config::RouterConfigEntry;
use crate::state::{GlobalRouterState, ProjectRecord, ProjectStatus};

/// Options for starting a project.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Base directory for a project seen for the first time.
    pub base_dir: Option<PathBuf>,
    /// Port to try before searching the configured range.
    pub port: Option<u16>,
}

impl StartOptions {
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

/// Compact view of a project.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub key: String,
    pub display_name: String,
    pub status: ProjectStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub base_dir: PathBuf,
    pub sandboxes: Vec<String>,
    /// Whether the recorded pid is alive right now.
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ProjectSummary {
    pub fn from_record(record: &ProjectRecord, hostname: &str, alive: bool) -> Self {
        Self {
            key: record.repo_url.clone(),
            display_name: record.display_name.clone(),
            status: record.process.status,
            pid: record.process.pid,
            port: record.process.port,
            url: record
                .process
                .port
                .map(|port| format!("http://{}:{}", hostname, port)),
            base_dir: record.base_dir.clone(),
            sandboxes: record.sandbox_names(),
            alive,
            last_error: record.process.last_error.clone(),
        }
    }
}

/// Result of [`Orchestrator::start`](super::Orchestrator::start).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum StartOutcome {
    /// A new agent process is up and registered.
    #[serde(rename_all = "camelCase")]
    Started {
        project: ProjectSummary,
        /// Set when the agent came up but the shared router did not.
        #[serde(skip_serializing_if = "Option::is_none")]
        router_error: Option<String>,
    },
    /// The agent was already healthy; only its router entry was refreshed.
    #[serde(rename_all = "camelCase")]
    AlreadyRunning {
        project: ProjectSummary,
        #[serde(skip_serializing_if = "Option::is_none")]
        router_error: Option<String>,
    },
    /// The clone was refused; register this key upstream and start again.
    #[serde(rename_all = "camelCase")]
    AwaitingCredential { deploy_key: DeployKey },
}

impl StartOutcome {
    pub fn project(&self) -> Option<&ProjectSummary> {
        match self {
            Self::Started { project, .. } | Self::AlreadyRunning { project, .. } => Some(project),
            Self::AwaitingCredential { .. } => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.project().is_some()
    }
}

/// Result of stopping a project.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    pub key: String,
    /// Whether a live process was stopped.
    pub was_running: bool,
    pub active_projects: u32,
    /// Whether this stop also took the router down.
    pub router_stopped: bool,
}

/// Result of destroying a project.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyOutcome {
    pub key: String,
    pub stop: StopOutcome,
    pub removed_dir: Option<PathBuf>,
}

/// Detailed status of one project.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatusReport {
    pub project: ProjectSummary,
    pub record: ProjectRecord,
    /// A recorded RUNNING process was found dead during this call.
    pub crashed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_entry: Option<RouterConfigEntry>,
}

/// Status of the shared router.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterReport {
    pub state: GlobalRouterState,
    pub alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthReport>,
}
