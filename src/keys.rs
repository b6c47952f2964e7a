// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-project deploy keys.
//!
//! Each project gets its own ed25519 key under `keys/<display name>/`. The
//! public half is handed back to the user together with host-specific steps
//! for registering it; the private half is only ever passed to git through
//! `GIT_SSH_COMMAND`. Keys outlive `destroy`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::info;

use crate::identity::RepoIdentity;
use crate::persist;

/// File name of the private key inside a project's key directory.
pub const KEY_FILE: &str = "id_ed25519";

/// Errors from deploy key handling.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Key IO error on {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("ssh-keygen failed: {0}")]
    Keygen(String),
}

/// A project's deploy key as shown to the user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployKey {
    pub key: String,
    pub public_key: String,
    pub private_key_path: PathBuf,
    pub steps: Vec<String>,
}

/// Generates and reads deploy keys.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Where the private key for `display_name` lives (whether or not it exists yet).
    fn private_key_path(&self, display_name: &str) -> PathBuf;

    /// Create the key pair if missing and return the public key line.
    async fn ensure_key(&self, display_name: &str) -> Result<String, KeyError>;
}

/// [`KeyProvider`] that shells out to `ssh-keygen`.
pub struct SshKeygen {
    keys_dir: PathBuf,
}

impl SshKeygen {
    pub fn new(keys_dir: impl Into<PathBuf>) -> Self {
        Self {
            keys_dir: keys_dir.into(),
        }
    }
}

fn io_err(path: &Path, e: std::io::Error) -> KeyError {
    KeyError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

#[async_trait]
impl KeyProvider for SshKeygen {
    fn private_key_path(&self, display_name: &str) -> PathBuf {
        self.keys_dir.join(display_name).join(KEY_FILE)
    }

    async fn ensure_key(&self, display_name: &str) -> Result<String, KeyError> {
        let private = self.private_key_path(display_name);
        let public = private.with_extension("pub");

        if !private.exists() {
            let dir = private
                .parent()
                .unwrap_or(self.keys_dir.as_path())
                .to_path_buf();
            persist::ensure_private_dir(&dir).map_err(|e| io_err(&dir, e))?;

            info!("Generating deploy key for {}", display_name);
            let comment = format!("agentfleet:{}", display_name);
            let private_str = private.to_string_lossy().to_string();
            let output = Command::new("ssh-keygen")
                .args(["-t", "ed25519", "-N", "", "-q", "-C", &comment, "-f", &private_str])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|e| KeyError::Keygen(e.to_string()))?;
            if !output.status.success() {
                return Err(KeyError::Keygen(
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ));
            }
        }

        let line = std::fs::read_to_string(&public).map_err(|e| io_err(&public, e))?;
        Ok(line.trim().to_string())
    }
}

/// Literal steps for registering `public_key` as a deploy key on the repo's host.
pub fn registration_steps(identity: &RepoIdentity) -> Vec<String> {
    let web = identity.web_url();
    match identity.host() {
        "github.com" => vec![
            format!("Open {}/settings/keys", web),
            "Click \"Add deploy key\"".to_string(),
            "Paste the public key above and give it a title".to_string(),
            "Tick \"Allow write access\" if the agent should push".to_string(),
            "Click \"Add key\", then start the project again".to_string(),
        ],
        host if host.contains("gitlab") => vec![
            format!("Open {}/-/settings/repository", web),
            "Expand \"Deploy keys\" and choose \"Add new key\"".to_string(),
            "Paste the public key above and give it a title".to_string(),
            "Tick \"Grant write permissions to this key\" if the agent should push".to_string(),
            "Click \"Add key\", then start the project again".to_string(),
        ],
        _ => vec![
            format!("Open the access settings for {}", web),
            "Add the public key above as a deploy key (or to a user with access)".to_string(),
            "Start the project again".to_string(),
        ],
    }
}

/// Ensure a key exists for `identity` and describe it.
pub async fn deploy_key_for(
    provider: &dyn KeyProvider,
    identity: &RepoIdentity,
) -> Result<DeployKey, KeyError> {
    let display_name = identity.display_name();
    let public_key = provider.ensure_key(&display_name).await?;
    Ok(DeployKey {
        key: identity.key(),
        public_key,
        private_key_path: provider.private_key_path(&display_name),
        steps: registration_steps(identity),
    })
}
