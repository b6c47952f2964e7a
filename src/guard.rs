// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Consistency checks between the state store, the router config and the OS.
//!
//! - **Duplicates**: the same repository recorded under more than one key,
//!   or under a key that is not its normalized form
//! - **Orphans**: records claiming RUNNING whose process is gone
//!
//! Detection is read-only. The merge and cleanup passes perform only the
//! corrections they report.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::FleetResult;
use crate::identity::normalize;
use crate::process::ProcessSupervisor;
use crate::router_config::RouterConfigSync;
use crate::state::{ProcessUpdate, ProjectRecord, ProjectStatus, RouterStatus, StateStore};
#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::{self, Counter};

/// One record inside a duplicate group.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateEntry {
    /// Key the record is stored under.
    pub key: String,
    pub status: ProjectStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub alive: bool,
    pub updated_at: DateTime<Utc>,
}

/// Records that all refer to one repository.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateGroup {
    pub normalized_url: String,
    pub entries: Vec<DuplicateEntry>,
    /// Key of the entry to keep.
    pub keep: String,
}

impl DuplicateGroup {
    /// Keys that a merge would drop.
    pub fn dropped(&self) -> impl Iterator<Item = &DuplicateEntry> {
        self.entries.iter().filter(move |e| e.key != self.keep)
    }
}

/// What [`ConsistencyGuard::merge_duplicates`] changed.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub groups: Vec<DuplicateGroup>,
    pub removed_keys: Vec<String>,
    pub terminated_pids: Vec<u32>,
    pub active_projects: u32,
}

/// What [`ConsistencyGuard::cleanup_orphaned`] changed.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanReport {
    /// Projects moved from RUNNING to STOPPED.
    pub corrected: Vec<String>,
    /// Whether the router record claimed RUNNING with a dead process.
    pub router_corrected: bool,
    pub active_projects: u32,
}

impl OrphanReport {
    pub fn is_clean(&self) -> bool {
        self.corrected.is_empty() && !self.router_corrected
    }
}

/// Detects and repairs drift between the stores and the OS.
pub struct ConsistencyGuard {
    store: Arc<StateStore>,
    router_config: Arc<RouterConfigSync>,
    supervisor: Arc<dyn ProcessSupervisor>,
    terminate_timeout: Duration,
}

impl ConsistencyGuard {
    pub fn new(
        store: Arc<StateStore>,
        router_config: Arc<RouterConfigSync>,
        supervisor: Arc<dyn ProcessSupervisor>,
        terminate_timeout: Duration,
    ) -> Self {
        Self {
            store,
            router_config,
            supervisor,
            terminate_timeout,
        }
    }

    fn alive(&self, record: &ProjectRecord) -> bool {
        record
            .process
            .pid
            .is_some_and(|pid| self.supervisor.is_running(pid))
    }

    /// Group records by normalized repository URL and report every group with
    /// more than one record or with a non-normalized key.
    pub async fn detect_duplicates(&self) -> FleetResult<Vec<DuplicateGroup>> {
        let projects = self.store.read(|s| s.projects.clone()).await?;

        let mut groups: BTreeMap<String, Vec<(String, ProjectRecord)>> = BTreeMap::new();
        for (key, record) in projects {
            let normalized = match normalize(&record.repo_url).or_else(|_| normalize(&key)) {
                Ok(n) => n,
                Err(e) => {
                    debug!("Skipping {}: {}", key, e);
                    continue;
                }
            };
            groups.entry(normalized).or_default().push((key, record));
        }

        let mut duplicates = Vec::new();
        for (normalized_url, members) in groups {
            if members.len() == 1 && members[0].0 == normalized_url {
                continue;
            }

            let mut entries: Vec<DuplicateEntry> = members
                .iter()
                .map(|(key, record)| DuplicateEntry {
                    key: key.clone(),
                    status: record.process.status,
                    pid: record.process.pid,
                    alive: self.alive(record),
                    updated_at: record.updated_at,
                })
                .collect();
            entries.sort_by(|a, b| {
                let rank = |e: &DuplicateEntry| {
                    let running = e.status == ProjectStatus::Running;
                    (running && e.alive, running, e.key == normalized_url, e.updated_at)
                };
                rank(b).cmp(&rank(a))
            });
            let keep = entries[0].key.clone();

            warn!(
                "Duplicate records for {}: {} (keep {})",
                normalized_url,
                entries.iter().map(|e| e.key.as_str()).collect::<Vec<_>>().join(", "),
                keep
            );
            duplicates.push(DuplicateGroup {
                normalized_url,
                entries,
                keep,
            });
        }
        Ok(duplicates)
    }

    /// Apply the recommendation of every duplicate group.
    ///
    /// Processes of dropped records are terminated, their sandboxes are
    /// folded into the kept record, and the kept record ends up under the
    /// normalized key in both stores.
    pub async fn merge_duplicates(&self) -> FleetResult<MergeReport> {
        let groups = self.detect_duplicates().await?;
        let mut report = MergeReport::default();

        for group in &groups {
            let kept_pid = group
                .entries
                .iter()
                .find(|e| e.key == group.keep)
                .and_then(|e| e.pid);

            for entry in group.dropped() {
                if let Some(pid) = entry.pid.filter(|pid| entry.alive && Some(*pid) != kept_pid) {
                    info!(pid, "Terminating duplicate process for {}", entry.key);
                    match self.supervisor.terminate(pid, self.terminate_timeout).await {
                        Ok(_) => report.terminated_pids.push(pid),
                        Err(e) => warn!(pid, "Failed to terminate duplicate: {}", e),
                    }
                }
            }

            let normalized = group.normalized_url.clone();
            let keep = group.keep.clone();
            let dropped: Vec<String> = group.dropped().map(|e| e.key.clone()).collect();
            self.store
                .mutate(|state| {
                    let Some(mut kept) = state.projects.remove(&keep) else {
                        return Ok(());
                    };
                    for key in &dropped {
                        let Some(other) = state.projects.remove(key) else {
                            continue;
                        };
                        for sandbox in other.worktrees {
                            if kept.sandbox(&sandbox.name).is_none() {
                                kept.worktrees.push(sandbox);
                            }
                        }
                        if kept.project_id.is_none() {
                            kept.project_id = other.project_id;
                        }
                    }
                    kept.repo_url = normalized.clone();
                    kept.touch();
                    state.projects.insert(normalized.clone(), kept);
                    Ok(())
                })
                .await?;

            for key in &dropped {
                self.router_config.remove(key).await?;
            }
            self.router_config.rekey(&keep, &normalized).await?;

            info!("Merged {} record(s) into {}", dropped.len(), normalized);
            report.removed_keys.extend(dropped.into_iter().filter(|k| k != &normalized));
            if keep != normalized {
                report.removed_keys.push(keep);
            }
        }

        report.active_projects = self.recount().await?;
        report.groups = groups;
        Ok(report)
    }

    /// Correct RUNNING records whose process is gone, then recount.
    pub async fn cleanup_orphaned(&self) -> FleetResult<OrphanReport> {
        let mut report = OrphanReport::default();

        // Records are corrected under the key they are stored by, which for
        // legacy entries is not their repo URL.
        let projects = self.store.read(|s| s.projects.clone()).await?;
        for (key, record) in projects {
            if record.process.status != ProjectStatus::Running || self.alive(&record) {
                continue;
            }
            let note = match record.process.pid {
                Some(pid) => format!("orphaned: process {} was not running", pid),
                None => "orphaned: no process recorded".to_string(),
            };
            warn!("Correcting {}: {}", key, note);
            self.store
                .update_process_status(
                    &key,
                    ProcessUpdate::status(ProjectStatus::Stopped)
                        .with_pid(None)
                        .with_note(note),
                )
                .await?;
            self.router_config.set_active(&key, false).await?;
            #[cfg(feature = "telemetry")]
            metrics::increment(Counter::OrphanCorrected);
            report.corrected.push(key);
        }

        let router = self.store.get_router_state().await?;
        let router_alive = router.pid.is_some_and(|pid| self.supervisor.is_running(pid));
        if router.status == RouterStatus::Running && !router_alive {
            warn!("Router recorded running but its process is gone");
            self.store
                .update_router_state(|r| {
                    r.status = r.status.transition(RouterStatus::Failed)?;
                    r.pid = None;
                    r.last_error = Some("router process was not running".to_string());
                    Ok(())
                })
                .await?;
            report.router_corrected = true;
        }

        report.active_projects = self.recount().await?;
        Ok(report)
    }

    /// Reset the active-project counter to the number of RUNNING records.
    async fn recount(&self) -> FleetResult<u32> {
        let count = self
            .store
            .mutate(|state| {
                let count = state.running_count();
                if state.router.active_project_count != count {
                    warn!(
                        "Active project count {} corrected to {}",
                        state.router.active_project_count, count
                    );
                    state.router.active_project_count = count;
                }
                Ok(count)
            })
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist;
    use crate::process::{HealthAuth, HealthReport, ProcessError, SpawnRequest};
    use crate::router_config::EndpointRegistration;
    use crate::state::{SandboxRecord, StateFile};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Supervisor where only the listed pids are alive.
    struct LivePids(Vec<u32>);

    #[async_trait]
    impl ProcessSupervisor for LivePids {
        fn binary_exists(&self, _program: &str) -> bool {
            true
        }
        fn port_is_free(&self, _port: u16) -> bool {
            true
        }
        fn find_free_port(&self, start: u16, _end: u16, _exclude: &[u16]) -> Result<u16, ProcessError> {
            Ok(start)
        }
        async fn kill_process_on_port(&self, _port: u16, _timeout: Duration) -> Vec<u32> {
            Vec::new()
        }
        async fn spawn(&self, request: SpawnRequest) -> Result<u32, ProcessError> {
            Err(ProcessError::SpawnFailed {
                program: request.program,
                message: "not supported".to_string(),
            })
        }
        fn is_running(&self, pid: u32) -> bool {
            self.0.contains(&pid)
        }
        async fn terminate(&self, _pid: u32, _timeout: Duration) -> Result<bool, ProcessError> {
            Ok(false)
        }
        async fn health_check(
            &self,
            _url: &str,
            _auth: &HealthAuth,
            _timeout: Duration,
            _interval: Duration,
        ) -> HealthReport {
            unreachable!("not used by the guard")
        }
        async fn probe(&self, _url: &str, _auth: &HealthAuth) -> HealthReport {
            unreachable!("not used by the guard")
        }
    }

    const KEY: &str = "git@github.com:user/repo.git";
    const LEGACY_KEY: &str = "https://github.com/user/repo";

    fn record(key: &str, status: ProjectStatus, pid: Option<u32>) -> ProjectRecord {
        let mut record = ProjectRecord::new(key, "user-repo", PathBuf::from("/srv/user-repo"));
        record.process.status = status;
        record.process.pid = pid;
        record
    }

    fn guard(temp: &TempDir, state: &StateFile, live: Vec<u32>) -> (ConsistencyGuard, Arc<StateStore>, Arc<RouterConfigSync>) {
        let state_path = temp.path().join("state.json");
        persist::atomic_write_json(&state_path, state).unwrap();
        let store = Arc::new(StateStore::new(state_path, temp.path().join("projects")));
        let router_config = Arc::new(RouterConfigSync::new(temp.path().join("router.json")));
        let guard = ConsistencyGuard::new(
            store.clone(),
            router_config.clone(),
            Arc::new(LivePids(live)),
            Duration::from_secs(1),
        );
        (guard, store, router_config)
    }

    #[tokio::test]
    async fn test_clean_state_has_no_duplicates() {
        let temp = TempDir::new().unwrap();
        let mut state = StateFile::default();
        state.projects.insert(KEY.to_string(), record(KEY, ProjectStatus::Stopped, None));
        let (guard, _, _) = guard(&temp, &state, vec![]);
        assert!(guard.detect_duplicates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_two_forms_of_one_repo_are_one_group() {
        let temp = TempDir::new().unwrap();
        let mut state = StateFile::default();
        state.projects.insert(KEY.to_string(), record(KEY, ProjectStatus::Stopped, None));
        state.projects.insert(
            LEGACY_KEY.to_string(),
            record(LEGACY_KEY, ProjectStatus::Running, Some(77)),
        );
        let (guard, _, _) = guard(&temp, &state, vec![77]);

        let groups = guard.detect_duplicates().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].normalized_url, KEY);
        assert_eq!(groups[0].entries.len(), 2);
        // The live, running entry wins over the normalized key.
        assert_eq!(groups[0].keep, LEGACY_KEY);
    }

    #[tokio::test]
    async fn test_merge_rekeys_and_unions_sandboxes() {
        let temp = TempDir::new().unwrap();
        let mut state = StateFile::default();
        let mut kept = record(LEGACY_KEY, ProjectStatus::Running, Some(77));
        kept.worktrees.push(SandboxRecord {
            name: "a".to_string(),
            branch: "sandbox/a".to_string(),
            base_branch: "main".to_string(),
            path: PathBuf::from("/srv/user-repo/sandboxes/a"),
            created_at: Utc::now(),
        });
        let mut dropped = record(KEY, ProjectStatus::Stopped, None);
        dropped.worktrees.push(SandboxRecord {
            name: "b".to_string(),
            branch: "sandbox/b".to_string(),
            base_branch: "main".to_string(),
            path: PathBuf::from("/srv/user-repo/sandboxes/b"),
            created_at: Utc::now(),
        });
        state.projects.insert(LEGACY_KEY.to_string(), kept);
        state.projects.insert(KEY.to_string(), dropped);
        state.router.active_project_count = 0;
        let (guard, store, router_config) = guard(&temp, &state, vec![77]);

        router_config
            .add_or_update(EndpointRegistration::new(LEGACY_KEY, "127.0.0.1", 4100, "pw"))
            .await
            .unwrap();
        router_config
            .add_or_update(EndpointRegistration::new(KEY, "127.0.0.1", 4101, "pw"))
            .await
            .unwrap();

        let report = guard.merge_duplicates().await.unwrap();
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.active_projects, 1);

        let keys = store.list().await.unwrap();
        assert_eq!(keys, vec![KEY.to_string()]);
        let merged = store.require(KEY).await.unwrap();
        assert_eq!(merged.repo_url, KEY);
        assert_eq!(merged.process.pid, Some(77));
        assert_eq!(merged.sandbox_names(), vec!["a".to_string(), "b".to_string()]);

        let entries = router_config.list_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, KEY);
        assert_eq!(entries[0].url, "http://127.0.0.1:4100");

        assert!(guard.detect_duplicates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_orphaned_marks_stopped() {
        let temp = TempDir::new().unwrap();
        let mut state = StateFile::default();
        state
            .projects
            .insert(KEY.to_string(), record(KEY, ProjectStatus::Running, Some(999_999)));
        state.router.active_project_count = 1;
        state.router.status = RouterStatus::Running;
        state.router.pid = Some(999_998);
        let (guard, store, _) = guard(&temp, &state, vec![]);

        let report = guard.cleanup_orphaned().await.unwrap();
        assert_eq!(report.corrected, vec![KEY.to_string()]);
        assert!(report.router_corrected);
        assert_eq!(report.active_projects, 0);

        let record = store.require(KEY).await.unwrap();
        assert_eq!(record.process.status, ProjectStatus::Stopped);
        assert!(record.process.pid.is_none());
        assert!(record.process.last_error.unwrap().contains("orphaned"));
        assert_eq!(store.get_router_state().await.unwrap().status, RouterStatus::Failed);

        // A second pass finds nothing.
        assert!(guard.cleanup_orphaned().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_cleanup_orphaned_uses_stored_key() {
        let temp = TempDir::new().unwrap();
        let mut state = StateFile::default();
        // Stored under its display name, as a half-migrated file leaves it.
        state
            .projects
            .insert("user-repo".to_string(), record(KEY, ProjectStatus::Running, Some(999_999)));
        state.router.active_project_count = 1;
        let (guard, store, _) = guard(&temp, &state, vec![]);

        assert_eq!(guard.detect_duplicates().await.unwrap().len(), 1);

        let report = guard.cleanup_orphaned().await.unwrap();
        assert_eq!(report.corrected, vec!["user-repo".to_string()]);
        assert_eq!(report.active_projects, 0);

        let record = store.require("user-repo").await.unwrap();
        assert_eq!(record.process.status, ProjectStatus::Stopped);
        assert!(record.process.pid.is_none());
        assert!(store.get(KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_live_running_project_is_left_alone() {
        let temp = TempDir::new().unwrap();
        let mut state = StateFile::default();
        state
            .projects
            .insert(KEY.to_string(), record(KEY, ProjectStatus::Running, Some(10)));
        state.router.active_project_count = 3;
        let (guard, store, _) = guard(&temp, &state, vec![10]);

        let report = guard.cleanup_orphaned().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.active_projects, 1);
        assert_eq!(store.require(KEY).await.unwrap().process.status, ProjectStatus::Running);
    }
}
