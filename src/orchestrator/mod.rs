// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lifecycle orchestrator.
//!
//! Composes the state store, router config, process supervisor and sandbox
//! manager into the public operations:
//!
//! - **Projects**: start, stop, restart, destroy, status, list
//! - **Sandboxes**: create, list, delete, reset (per project)
//! - **Router**: ensure running, restart, stop, status
//! - **Diagnostics**: duplicate detection and orphan cleanup via [`crate::guard`]
//!
//! # Locking
//!
//! Operations on one project are serialized by a per-key async lock; router
//! transitions by a separate router lock. A project lock may be held while
//! taking the router lock, never the other way round. The store and the
//! router config keep their own file locks underneath.
//!
//! # Usage
//!
//! ```rust,ignore
//! use agentfleet::orchestrator::{Orchestrator, StartOptions};
//!
//! let orchestrator = Orchestrator::new(config, secrets)?;
//! let outcome = orchestrator
//!     .start("https://github.com/user/repo", StartOptions::default())
//!     .await?;
//! ```

mod project;
mod router;
pub mod types;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

pub use types::{
    DestroyOutcome, ProjectStatusReport, ProjectSummary, RouterReport, StartOptions, StartOutcome,
    StopOutcome,
};

use crate::config::{ResolvedConfig, Secrets};
use crate::error::FleetResult;
use crate::guard::{ConsistencyGuard, DuplicateGroup, MergeReport, OrphanReport};
use crate::keys::{KeyProvider, SshKeygen};
use crate::process::{HealthAuth, OsSupervisor, ProcessSupervisor};
use crate::router_config::RouterConfigSync;
use crate::sandbox::{GitBackend, GitCli, SandboxManager};
use crate::state::StateStore;

/// Top-level coordinator for projects, sandboxes and the shared router.
pub struct Orchestrator {
    config: ResolvedConfig,
    secrets: Secrets,
    store: Arc<StateStore>,
    router_config: Arc<RouterConfigSync>,
    supervisor: Arc<dyn ProcessSupervisor>,
    git: Arc<dyn GitBackend>,
    keys: Arc<dyn KeyProvider>,
    project_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    router_lock: Mutex<()>,
}

impl Orchestrator {
    /// Build an orchestrator backed by the real OS, git and ssh-keygen.
    ///
    /// Fails if either secret is empty or a placeholder, since every agent
    /// and the router would otherwise run with that value.
    pub fn new(config: ResolvedConfig, secrets: Secrets) -> FleetResult<Self> {
        secrets.validate()?;
        let store = Arc::new(StateStore::new(config.state_path(), config.projects_root.clone()));
        let router_config = Arc::new(RouterConfigSync::new(config.router_config_path()));
        let supervisor: Arc<dyn ProcessSupervisor> =
            Arc::new(OsSupervisor::new(config.timeouts.spawn_grace()));
        let git: Arc<dyn GitBackend> = Arc::new(GitCli::new(config.timeouts.git_timeout()));
        let keys: Arc<dyn KeyProvider> = Arc::new(SshKeygen::new(config.keys_dir()));

        Ok(Self {
            config,
            secrets,
            store,
            router_config,
            supervisor,
            git,
            keys,
            project_locks: StdMutex::new(HashMap::new()),
            router_lock: Mutex::new(()),
        })
    }

    /// Replace the process supervisor.
    pub fn with_supervisor(mut self, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Replace the git backend.
    pub fn with_git(mut self, git: Arc<dyn GitBackend>) -> Self {
        self.git = git;
        self
    }

    /// Replace the deploy key provider.
    pub fn with_keys(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = keys;
        self
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn router_config(&self) -> &Arc<RouterConfigSync> {
        &self.router_config
    }

    /// Sandbox manager sharing this orchestrator's store and git backend.
    pub fn sandboxes(&self) -> SandboxManager {
        SandboxManager::new(
            self.store.clone(),
            self.git.clone(),
            self.config.timeouts.start_command_timeout(),
        )
    }

    /// Consistency guard over the same stores and supervisor.
    pub fn guard(&self) -> ConsistencyGuard {
        ConsistencyGuard::new(
            self.store.clone(),
            self.router_config.clone(),
            self.supervisor.clone(),
            self.config.timeouts.terminate_timeout(),
        )
    }

    /// Report repositories recorded under more than one key.
    pub async fn detect_duplicates(&self) -> FleetResult<Vec<DuplicateGroup>> {
        self.guard().detect_duplicates().await
    }

    /// Merge duplicate records. Holds every project lock while it runs.
    pub async fn merge_duplicates(&self) -> FleetResult<MergeReport> {
        let _locks = self.lock_all_projects().await?;
        let report = self.guard().merge_duplicates().await?;
        self.stop_router_if_idle().await?;
        Ok(report)
    }

    /// Correct orphaned RUNNING records, then stop the router if nothing runs.
    pub async fn cleanup_orphaned(&self) -> FleetResult<OrphanReport> {
        let _locks = self.lock_all_projects().await?;
        let report = self.guard().cleanup_orphaned().await?;
        self.stop_router_if_idle().await?;
        Ok(report)
    }

    /// Lock every known project, in key order.
    async fn lock_all_projects(&self) -> FleetResult<Vec<OwnedMutexGuard<()>>> {
        let mut guards = Vec::new();
        for key in self.store.list().await? {
            guards.push(self.lock_project(&key).await);
        }
        Ok(guards)
    }

    /// Acquire the lock for one project key.
    async fn lock_project(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .project_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Forget the lock of a destroyed project.
    fn drop_project_lock(&self, key: &str) {
        let mut locks = self
            .project_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(lock) = locks.get(key) {
            // Waiters hold their own clone.
            if Arc::strong_count(lock) == 1 {
                locks.remove(key);
            }
        }
    }

    fn agent_auth(&self) -> HealthAuth {
        HealthAuth::Basic {
            username: self.config.agent.username.clone(),
            password: self.secrets.server_password.clone(),
        }
    }

    fn router_auth(&self) -> HealthAuth {
        HealthAuth::Bearer(self.secrets.router_token.clone())
    }

    fn agent_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.config.agent.hostname, port)
    }

    fn router_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.config.router.hostname, port)
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.config.logs_dir().join(format!("{}.log", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FleetError, SecretsError};
    use tempfile::TempDir;

    fn orchestrator(temp: &TempDir) -> Orchestrator {
        let config = ResolvedConfig::with_home(temp.path().join("home"), temp.path().join("projects"));
        Orchestrator::new(config, Secrets::new("pw", "token")).unwrap()
    }

    #[test]
    fn test_placeholder_secrets_are_refused() {
        let temp = TempDir::new().unwrap();
        for (password, token) in [("", "token"), ("pw", "changeme"), ("<password>", "token")] {
            let config = ResolvedConfig::with_home(temp.path().join("home"), temp.path().join("projects"));
            let err = Orchestrator::new(config, Secrets::new(password, token)).err().unwrap();
            assert!(matches!(err, FleetError::Secrets(SecretsError::Placeholder { .. })));
        }
    }

    #[tokio::test]
    async fn test_project_lock_is_per_key() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(&temp);

        let a = orchestrator.lock_project("a").await;
        // A different key is not blocked.
        let b = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            orchestrator.lock_project("b"),
        )
        .await;
        assert!(b.is_ok());

        // The same key is.
        let again = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            orchestrator.lock_project("a"),
        )
        .await;
        assert!(again.is_err());
        drop(a);
    }

    #[test]
    fn test_urls_and_paths() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(&temp);
        assert_eq!(orchestrator.agent_url(4100), "http://127.0.0.1:4100");
        assert_eq!(orchestrator.router_url(3005), "http://127.0.0.1:3005");
        assert_eq!(
            orchestrator.log_path("router"),
            temp.path().join("home").join("logs").join("router.log")
        );
    }

    #[test]
    fn test_auth_uses_secrets() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(&temp);
        match orchestrator.agent_auth() {
            HealthAuth::Basic { username, password } => {
                assert_eq!(username, "opencode");
                assert_eq!(password, "pw");
            }
            other => panic!("unexpected auth {:?}", other),
        }
        assert!(matches!(orchestrator.router_auth(), HealthAuth::Bearer(t) if t == "token"));
    }
}
