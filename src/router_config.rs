// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Router config synchronizer.
//!
//! Maintains the routing file the shared router watches. The file lists one
//! entry per known project. Stopped projects stay listed as `inactive` so
//! their history survives; only `destroy` removes an entry.
//!
//! The contract is simple: when a call returns, the file on disk reflects it.
//! How the router notices the change is its own business.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::persist;

/// Current router config file format.
pub const ROUTER_CONFIG_VERSION: u32 = 1;

/// Errors from the router config synchronizer.
#[derive(Debug, thiserror::Error)]
pub enum RouterConfigError {
    #[error("IO error on router config {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Router config {path} is corrupted: {message}")]
    Corrupted { path: PathBuf, message: String },

    #[error("Router config entry not found: {0}")]
    NotFound(String),
}

/// Whether the router should currently route to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[default]
    Active,
    Inactive,
}

/// One project endpoint in the routing file.
///
/// Field names are snake_case on disk; this is the router's format, not ours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfigEntry {
    /// Normalized repository URL.
    pub id: String,
    pub title: String,
    pub url: String,
    pub credential: String,
    #[serde(default)]
    pub status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<String>,
    pub added_at: DateTime<Utc>,
}

impl RouterConfigEntry {
    pub fn is_active(&self) -> bool {
        self.status == EntryStatus::Active
    }
}

/// The routing file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfigFile {
    pub version: u32,
    #[serde(default)]
    pub servers: Vec<RouterConfigEntry>,
    #[serde(default)]
    pub default_server: Option<String>,
}

impl Default for RouterConfigFile {
    fn default() -> Self {
        Self {
            version: ROUTER_CONFIG_VERSION,
            servers: Vec::new(),
            default_server: None,
        }
    }
}

impl RouterConfigFile {
    fn position(&self, id: &str) -> Option<usize> {
        self.servers.iter().position(|s| s.id == id)
    }

    /// Make sure `default_server` names an existing entry, or is empty.
    fn repair_default(&mut self) {
        let valid = self
            .default_server
            .as_deref()
            .map(|id| self.position(id).is_some())
            .unwrap_or(false);
        if valid {
            return;
        }
        self.default_server = self
            .servers
            .iter()
            .find(|s| s.is_active())
            .or_else(|| self.servers.first())
            .map(|s| s.id.clone());
    }
}

/// Input for [`RouterConfigSync::add_or_update`].
#[derive(Debug, Clone)]
pub struct EndpointRegistration {
    pub key: String,
    pub hostname: String,
    pub port: u16,
    pub credential: String,
    pub display_name: Option<String>,
    pub ssh_key_path: Option<PathBuf>,
    pub repo_url: Option<String>,
    pub base_dir: Option<PathBuf>,
}

impl EndpointRegistration {
    pub fn new(key: impl Into<String>, hostname: impl Into<String>, port: u16, credential: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            hostname: hostname.into(),
            port,
            credential: credential.into(),
            display_name: None,
            ssh_key_path: None,
            repo_url: None,
            base_dir: None,
        }
    }

    pub fn endpoint_url(&self) -> String {
        format!("http://{}:{}", self.hostname, self.port)
    }
}

/// Serialized, atomic access to the routing file.
pub struct RouterConfigSync {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RouterConfigSync {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_locked(&self) -> Result<RouterConfigFile, RouterConfigError> {
        match persist::read_json::<RouterConfigFile>(&self.path) {
            Ok(file) => Ok(file.unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                Err(RouterConfigError::Corrupted {
                    path: self.path.clone(),
                    message: e.to_string(),
                })
            }
            Err(e) => Err(RouterConfigError::Io {
                path: self.path.clone(),
                message: e.to_string(),
            }),
        }
    }

    async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut RouterConfigFile) -> Result<R, RouterConfigError>,
    ) -> Result<R, RouterConfigError> {
        let _guard = self.lock.lock().await;
        let mut file = self.load_locked()?;
        let result = f(&mut file)?;
        file.version = ROUTER_CONFIG_VERSION;
        file.repair_default();
        persist::atomic_write_json(&self.path, &file).map_err(|e| RouterConfigError::Io {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        Ok(result)
    }

    /// Snapshot of the whole file.
    pub async fn load(&self) -> Result<RouterConfigFile, RouterConfigError> {
        let _guard = self.lock.lock().await;
        self.load_locked()
    }

    /// Insert or update the entry for `reg.key` and mark it active.
    ///
    /// Existing entries are updated in place; `added_at` is preserved. The
    /// first entry ever added becomes the default.
    pub async fn add_or_update(
        &self,
        reg: EndpointRegistration,
    ) -> Result<RouterConfigEntry, RouterConfigError> {
        let url = reg.endpoint_url();
        let entry = self
            .mutate(|file| {
                let idx = match file.position(&reg.key) {
                    Some(idx) => idx,
                    None => {
                        file.servers.push(RouterConfigEntry {
                            id: reg.key.clone(),
                            title: reg.key.clone(),
                            url: url.clone(),
                            credential: String::new(),
                            status: EntryStatus::Active,
                            repo_url: None,
                            ssh_key_path: None,
                            base_dir: None,
                            added_at: Utc::now(),
                        });
                        if file.default_server.is_none() {
                            file.default_server = Some(reg.key.clone());
                        }
                        file.servers.len() - 1
                    }
                };

                let entry = &mut file.servers[idx];
                entry.url = url;
                entry.credential = reg.credential;
                entry.status = EntryStatus::Active;
                if let Some(title) = reg.display_name {
                    entry.title = title;
                }
                if let Some(repo_url) = reg.repo_url {
                    entry.repo_url = Some(repo_url);
                }
                if let Some(key_path) = reg.ssh_key_path {
                    entry.ssh_key_path = Some(key_path.display().to_string());
                }
                if let Some(base_dir) = reg.base_dir {
                    entry.base_dir = Some(base_dir.display().to_string());
                }
                Ok(entry.clone())
            })
            .await?;
        info!("Router entry {} -> {}", entry.id, entry.url);
        Ok(entry)
    }

    /// Remove an entry entirely. Returns whether it existed.
    pub async fn remove(&self, key: &str) -> Result<bool, RouterConfigError> {
        let removed = self
            .mutate(|file| {
                let Some(idx) = file.position(key) else {
                    return Ok(false);
                };
                file.servers.remove(idx);
                if file.default_server.as_deref() == Some(key) {
                    file.default_server = None;
                }
                Ok(true)
            })
            .await?;
        if removed {
            info!("Removed router entry {}", key);
        }
        Ok(removed)
    }

    /// Flip an entry's activity flag.
    ///
    /// Deactivating a missing entry is a no-op; activating one is an error
    /// since there is no endpoint to route to.
    pub async fn set_active(&self, key: &str, active: bool) -> Result<(), RouterConfigError> {
        self.mutate(|file| match file.position(key) {
            Some(idx) => {
                file.servers[idx].status = if active {
                    EntryStatus::Active
                } else {
                    EntryStatus::Inactive
                };
                Ok(())
            }
            None if !active => Ok(()),
            None => Err(RouterConfigError::NotFound(key.to_string())),
        })
        .await?;
        debug!("Router entry {} active={}", key, active);
        Ok(())
    }

    /// Move the entry under `old` to `new`. If `new` already has an entry the
    /// old one is simply dropped. Returns whether anything changed.
    pub async fn rekey(&self, old: &str, new: &str) -> Result<bool, RouterConfigError> {
        if old == new {
            return Ok(false);
        }
        self.mutate(|file| {
            let Some(idx) = file.position(old) else {
                return Ok(false);
            };
            if file.position(new).is_some() {
                file.servers.remove(idx);
            } else {
                file.servers[idx].id = new.to_string();
            }
            if file.default_server.as_deref() == Some(old) {
                file.default_server = Some(new.to_string());
            }
            Ok(true)
        })
        .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<RouterConfigEntry>, RouterConfigError> {
        let file = self.load().await?;
        Ok(file.servers.into_iter().find(|s| s.id == key))
    }

    pub async fn list_active(&self) -> Result<Vec<RouterConfigEntry>, RouterConfigError> {
        let file = self.load().await?;
        Ok(file.servers.into_iter().filter(|s| s.is_active()).collect())
    }

    pub async fn list_all(&self) -> Result<Vec<RouterConfigEntry>, RouterConfigError> {
        Ok(self.load().await?.servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY_A: &str = "git@github.com:user/a.git";
    const KEY_B: &str = "git@github.com:user/b.git";

    fn sync(temp: &TempDir) -> RouterConfigSync {
        RouterConfigSync::new(temp.path().join("router.json"))
    }

    fn reg(key: &str, port: u16) -> EndpointRegistration {
        let mut reg = EndpointRegistration::new(key, "127.0.0.1", port, "pw");
        reg.display_name = Some("user-a".to_string());
        reg
    }

    #[tokio::test]
    async fn test_add_sets_default_and_url() {
        let temp = TempDir::new().unwrap();
        let sync = sync(&temp);

        let entry = sync.add_or_update(reg(KEY_A, 4100)).await.unwrap();
        assert_eq!(entry.url, "http://127.0.0.1:4100");
        assert_eq!(entry.title, "user-a");

        let file = sync.load().await.unwrap();
        assert_eq!(file.version, ROUTER_CONFIG_VERSION);
        assert_eq!(file.default_server.as_deref(), Some(KEY_A));
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let sync = sync(&temp);

        let first = sync.add_or_update(reg(KEY_A, 4100)).await.unwrap();
        sync.set_active(KEY_A, false).await.unwrap();
        let second = sync.add_or_update(reg(KEY_A, 4101)).await.unwrap();

        let all = sync.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(second.url, "http://127.0.0.1:4101");
        assert!(second.is_active());
        assert_eq!(first.added_at, second.added_at);
    }

    #[tokio::test]
    async fn test_inactive_entries_are_kept() {
        let temp = TempDir::new().unwrap();
        let sync = sync(&temp);
        sync.add_or_update(reg(KEY_A, 4100)).await.unwrap();
        sync.add_or_update(reg(KEY_B, 4101)).await.unwrap();

        sync.set_active(KEY_A, false).await.unwrap();
        let active = sync.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, KEY_B);
        assert_eq!(sync.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_reassigns_default() {
        let temp = TempDir::new().unwrap();
        let sync = sync(&temp);
        sync.add_or_update(reg(KEY_A, 4100)).await.unwrap();
        sync.add_or_update(reg(KEY_B, 4101)).await.unwrap();

        assert!(sync.remove(KEY_A).await.unwrap());
        assert!(!sync.remove(KEY_A).await.unwrap());

        let file = sync.load().await.unwrap();
        assert_eq!(file.default_server.as_deref(), Some(KEY_B));

        sync.remove(KEY_B).await.unwrap();
        assert!(sync.load().await.unwrap().default_server.is_none());
    }

    #[tokio::test]
    async fn test_rekey() {
        let temp = TempDir::new().unwrap();
        let sync = sync(&temp);
        let legacy = "https://github.com/user/a";
        sync.add_or_update(reg(legacy, 4100)).await.unwrap();

        assert!(sync.rekey(legacy, KEY_A).await.unwrap());
        let file = sync.load().await.unwrap();
        assert_eq!(file.servers.len(), 1);
        assert_eq!(file.servers[0].id, KEY_A);
        assert_eq!(file.default_server.as_deref(), Some(KEY_A));

        // Both present: the old one goes away.
        sync.add_or_update(reg(legacy, 4101)).await.unwrap();
        assert!(sync.rekey(legacy, KEY_A).await.unwrap());
        let all = sync.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].url, "http://127.0.0.1:4100");
    }

    #[tokio::test]
    async fn test_activate_missing_entry_fails() {
        let temp = TempDir::new().unwrap();
        let sync = sync(&temp);
        sync.set_active(KEY_A, false).await.unwrap();
        let err = sync.set_active(KEY_A, true).await.unwrap_err();
        assert!(matches!(err, RouterConfigError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_file_format_matches_router_contract() {
        let temp = TempDir::new().unwrap();
        let sync = sync(&temp);
        let mut r = reg(KEY_A, 4100);
        r.repo_url = Some("https://github.com/user/a".to_string());
        r.base_dir = Some(PathBuf::from("/srv/user-a"));
        sync.add_or_update(r).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(sync.path()).unwrap()).unwrap();
        let server = &raw["servers"][0];
        assert_eq!(server["status"], "active");
        assert_eq!(server["base_dir"], "/srv/user-a");
        assert!(server["added_at"].is_string());
        assert_eq!(raw["default_server"], KEY_A);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_is_owner_only() {
        let temp = TempDir::new().unwrap();
        let sync = sync(&temp);
        sync.add_or_update(reg(KEY_A, 4100)).await.unwrap();
        assert_eq!(
            persist::file_mode(sync.path()).unwrap(),
            Some(persist::OWNER_ONLY_FILE)
        );
    }
}
