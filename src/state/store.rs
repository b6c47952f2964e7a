// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! File-backed state store.
//!
//! One JSON file holds every project record and the router record. Every
//! operation, reads included, runs under a single async mutex and performs a
//! full read-modify-write, so two overlapping calls cannot lose an update
//! (the active-project counter in particular).

use std::path::{Path, PathBuf};
#[cfg(feature = "telemetry")]
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use super::migration::{document_version, migrate};
use super::types::{
    ErrorStage, GlobalRouterState, ProjectRecord, ProjectStatus, StateFile, STATE_VERSION,
};
use super::StateError;
use crate::persist;

/// Partial update of a project's process record.
///
/// `None` leaves a field alone; `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct ProcessUpdate {
    pub status: Option<ProjectStatus>,
    pub pid: Option<Option<u32>>,
    pub port: Option<Option<u16>>,
    pub last_error: Option<Option<String>>,
    pub error_stage: Option<Option<ErrorStage>>,
    pub last_health_check: Option<Option<DateTime<Utc>>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
}

impl ProcessUpdate {
    /// Start an update that moves to `status`.
    pub fn status(status: ProjectStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = Some(port);
        self
    }

    /// Record a failure at `stage`.
    pub fn with_error(mut self, stage: ErrorStage, message: impl Into<String>) -> Self {
        self.last_error = Some(Some(message.into()));
        self.error_stage = Some(Some(stage));
        self
    }

    /// Record a message without a failing stage.
    pub fn with_note(mut self, message: impl Into<String>) -> Self {
        self.last_error = Some(Some(message.into()));
        self.error_stage = Some(None);
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self.error_stage = Some(None);
        self
    }

    pub fn healthy_now(mut self) -> Self {
        self.last_health_check = Some(Some(Utc::now()));
        self
    }

    pub fn started_now(mut self) -> Self {
        self.started_at = Some(Some(Utc::now()));
        self
    }

    fn apply(self, record: &mut ProjectRecord) -> Result<(), StateError> {
        let process = &mut record.process;
        if let Some(status) = self.status {
            process.status = process.status.transition(status)?;
        }
        if let Some(pid) = self.pid {
            process.pid = pid;
        }
        if let Some(port) = self.port {
            process.port = port;
        }
        if let Some(err) = self.last_error {
            process.last_error = err;
        }
        if let Some(stage) = self.error_stage {
            process.error_stage = stage;
        }
        if let Some(checked) = self.last_health_check {
            process.last_health_check = checked;
        }
        if let Some(started) = self.started_at {
            process.started_at = started;
        }
        record.touch();
        Ok(())
    }
}

/// The persisted state store.
pub struct StateStore {
    path: PathBuf,
    projects_root: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    /// Open a store backed by `path`. Nothing is read until first access.
    ///
    /// `projects_root` supplies default base directories for legacy records
    /// that never recorded one.
    pub fn new(path: impl Into<PathBuf>, projects_root: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            projects_root: projects_root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file, migrating it in place when it predates the current format.
    fn load_locked(&self) -> Result<StateFile, StateError> {
        let raw: Option<Value> = persist::read_json(&self.path).map_err(|e| self.io_error(e))?;
        let Some(raw) = raw else {
            return Ok(StateFile::default());
        };

        if let Some(version) = document_version(&raw) {
            if version > STATE_VERSION as u64 {
                return Err(StateError::Corrupted {
                    path: self.path.clone(),
                    message: format!("written by a newer version (format {})", version),
                });
            }
        }

        let outcome = migrate(raw, &self.projects_root);
        if outcome.changed {
            info!(
                rekeyed = outcome.rekeyed.len(),
                merged = outcome.merged.len(),
                unmigrated = outcome.unmigrated.len(),
                "Migrated state file {} to format {}",
                self.path.display(),
                STATE_VERSION
            );
            persist::atomic_write_json(&self.path, &outcome.value).map_err(|e| self.io_error(e))?;
        }

        serde_json::from_value(outcome.value).map_err(|e| StateError::Corrupted {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    fn save_locked(&self, state: &StateFile) -> Result<(), StateError> {
        persist::atomic_write_json(&self.path, state).map_err(|e| self.io_error(e))
    }

    fn io_error(&self, err: std::io::Error) -> StateError {
        if err.kind() == std::io::ErrorKind::InvalidData {
            StateError::Corrupted {
                path: self.path.clone(),
                message: err.to_string(),
            }
        } else {
            StateError::Io {
                path: self.path.clone(),
                message: err.to_string(),
            }
        }
    }

    /// Run a read-only closure against the current state.
    pub async fn read<R>(&self, f: impl FnOnce(&StateFile) -> R) -> Result<R, StateError> {
        let _guard = self.lock.lock().await;
        let state = self.load_locked()?;
        Ok(f(&state))
    }

    /// Run a read-modify-write closure. The file is only rewritten when the
    /// closure succeeds.
    pub async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut StateFile) -> Result<R, StateError>,
    ) -> Result<R, StateError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let _guard = self.lock.lock().await;
        let mut state = self.load_locked()?;
        let result = f(&mut state)?;
        self.save_locked(&state)?;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("state.mutate", start.elapsed());

        Ok(result)
    }

    /// Snapshot of the whole file.
    pub async fn snapshot(&self) -> Result<StateFile, StateError> {
        self.read(Clone::clone).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<ProjectRecord>, StateError> {
        self.read(|s| s.projects.get(key).cloned()).await
    }

    /// Like [`get`](Self::get) but missing records are an error.
    pub async fn require(&self, key: &str) -> Result<ProjectRecord, StateError> {
        self.get(key)
            .await?
            .ok_or_else(|| StateError::NotFound(key.to_string()))
    }

    /// All project keys, sorted.
    pub async fn list(&self) -> Result<Vec<String>, StateError> {
        self.read(|s| s.projects.keys().cloned().collect()).await
    }

    pub async fn list_records(&self) -> Result<Vec<ProjectRecord>, StateError> {
        self.read(|s| s.projects.values().cloned().collect()).await
    }

    /// Insert or replace a record under its own key.
    pub async fn save(&self, mut record: ProjectRecord) -> Result<(), StateError> {
        record.touch();
        debug!("Saving project record {}", record.repo_url);
        self.mutate(|s| {
            s.projects.insert(record.repo_url.clone(), record);
            Ok(())
        })
        .await
    }

    /// Delete a record. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> Result<bool, StateError> {
        self.mutate(|s| Ok(s.projects.remove(key).is_some())).await
    }

    /// Apply a closure to one project record.
    pub async fn update_project<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut ProjectRecord) -> Result<R, StateError>,
    ) -> Result<R, StateError> {
        self.mutate(|s| {
            let record = s
                .projects
                .get_mut(key)
                .ok_or_else(|| StateError::NotFound(key.to_string()))?;
            let result = f(record)?;
            record.touch();
            Ok(result)
        })
        .await
    }

    /// Update the process fields of a project, validating any status change.
    pub async fn update_process_status(
        &self,
        key: &str,
        update: ProcessUpdate,
    ) -> Result<ProjectRecord, StateError> {
        self.update_project(key, |record| {
            update.apply(record)?;
            Ok(record.clone())
        })
        .await
    }

    pub async fn get_router_state(&self) -> Result<GlobalRouterState, StateError> {
        self.read(|s| s.router.clone()).await
    }

    pub async fn save_router_state(&self, router: GlobalRouterState) -> Result<(), StateError> {
        self.mutate(|s| {
            s.router = router;
            Ok(())
        })
        .await
    }

    /// Apply a closure to the router record.
    pub async fn update_router_state<R>(
        &self,
        f: impl FnOnce(&mut GlobalRouterState) -> Result<R, StateError>,
    ) -> Result<R, StateError> {
        self.mutate(|s| f(&mut s.router)).await
    }

    /// Increment the active-project counter. Returns the new value.
    pub async fn increment_active_projects(&self) -> Result<u32, StateError> {
        self.mutate(|s| {
            s.router.active_project_count = s.router.active_project_count.saturating_add(1);
            Ok(s.router.active_project_count)
        })
        .await
    }

    /// Decrement the active-project counter, never below zero. Returns the new value.
    pub async fn decrement_active_projects(&self) -> Result<u32, StateError> {
        self.mutate(|s| {
            s.router.active_project_count = s.router.active_project_count.saturating_sub(1);
            Ok(s.router.active_project_count)
        })
        .await
    }

    /// Overwrite the counter (used by reconciliation).
    pub async fn set_active_projects(&self, count: u32) -> Result<u32, StateError> {
        self.mutate(|s| {
            s.router.active_project_count = count;
            Ok(count)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> StateStore {
        StateStore::new(temp.path().join("state.json"), temp.path().join("projects"))
    }

    fn record(key: &str) -> ProjectRecord {
        ProjectRecord::new(key, "user-repo", PathBuf::from("/srv/user-repo"))
    }

    #[tokio::test]
    async fn test_empty_store() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        assert!(store.list().await.unwrap().is_empty());
        let router = store.get_router_state().await.unwrap();
        assert_eq!(router.active_project_count, 0);
    }

    #[tokio::test]
    async fn test_save_get_delete() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let key = "git@github.com:user/repo.git";

        store.save(record(key)).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec![key.to_string()]);
        assert_eq!(store.get(key).await.unwrap().unwrap().display_name, "user-repo");

        assert!(store.delete(key).await.unwrap());
        assert!(!store.delete(key).await.unwrap());
        assert!(store.get(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_process_status_validates_transitions() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let key = "git@github.com:user/repo.git";
        store.save(record(key)).await.unwrap();

        let err = store
            .update_process_status(key, ProcessUpdate::status(ProjectStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));

        store
            .update_process_status(key, ProcessUpdate::status(ProjectStatus::Starting))
            .await
            .unwrap();
        let updated = store
            .update_process_status(
                key,
                ProcessUpdate::status(ProjectStatus::Running)
                    .with_pid(Some(42))
                    .with_port(Some(4100))
                    .healthy_now(),
            )
            .await
            .unwrap();
        assert_eq!(updated.process.status, ProjectStatus::Running);
        assert_eq!(updated.process.pid, Some(42));
        assert!(updated.process.last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_update_missing_project() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let err = store
            .update_process_status("git@x.io:a/b.git", ProcessUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_counter_never_negative() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        assert_eq!(store.decrement_active_projects().await.unwrap(), 0);
        assert_eq!(store.increment_active_projects().await.unwrap(), 1);
        assert_eq!(store.decrement_active_projects().await.unwrap(), 0);
        assert_eq!(store.decrement_active_projects().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(store(&temp));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.increment_active_projects().await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get_router_state().await.unwrap().active_project_count, 20);
    }

    #[tokio::test]
    async fn test_legacy_file_is_migrated_on_first_access() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"projects": {"user-repo": {"repo_url": "https://github.com/user/repo", "project_dir": "/old/dir", "status": "stopped"}}}"#,
        )
        .unwrap();

        let store = StateStore::new(&path, temp.path().join("projects"));
        let keys = store.list().await.unwrap();
        assert_eq!(keys, vec!["git@github.com:user/repo.git".to_string()]);

        let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["version"], STATE_VERSION);

        // Second access must not rewrite anything.
        let before = std::fs::read(&path).unwrap();
        store.list().await.unwrap();
        assert_eq!(before, std::fs::read(&path).unwrap());
    }

    #[tokio::test]
    async fn test_newer_format_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");
        std::fs::write(&path, r#"{"version": 99, "projects": {}}"#).unwrap();
        let store = StateStore::new(&path, temp.path());
        let err = store.list().await.unwrap_err();
        assert!(matches!(err, StateError::Corrupted { .. }));
    }
}
