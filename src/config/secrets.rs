// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The global credential file.
//!
//! `secrets.json` supplies the shared agent password and the router's bearer
//! token. Anything wrong with it (missing, unreadable, placeholder values,
//! readable by group or others) is fatal before any operation runs.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::error::SecretsError;
use crate::persist;

/// Credentials shared by every agent and the router.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secrets {
    pub server_password: String,
    pub router_token: String,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("server_password", &"***")
            .field("router_token", &"***")
            .finish()
    }
}

impl Secrets {
    pub fn new(server_password: impl Into<String>, router_token: impl Into<String>) -> Self {
        Self {
            server_password: server_password.into(),
            router_token: router_token.into(),
        }
    }

    /// Reject empty or placeholder values.
    pub fn validate(&self) -> Result<(), SecretsError> {
        for (field, value) in [
            ("serverPassword", &self.server_password),
            ("routerToken", &self.router_token),
        ] {
            if is_placeholder(value) {
                return Err(SecretsError::Placeholder {
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Whether a secret value is empty or obviously not a real credential.
pub fn is_placeholder(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    v.is_empty()
        || matches!(
            v.as_str(),
            "changeme" | "change-me" | "change_me" | "placeholder" | "todo" | "xxx" | "secret" | "password"
        )
        || v.starts_with("your")
        || (v.starts_with('<') && v.ends_with('>'))
}

/// Load and validate the secrets file.
pub fn load_secrets(path: &Path) -> Result<Secrets, SecretsError> {
    if !path.exists() {
        return Err(SecretsError::Missing(path.to_path_buf()));
    }

    #[cfg(unix)]
    {
        let mode = persist::file_mode(path)
            .map_err(|e| SecretsError::Unreadable {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
            .unwrap_or(persist::OWNER_ONLY_FILE);
        if mode & 0o077 != 0 {
            return Err(SecretsError::InsecurePermissions {
                path: path.to_path_buf(),
                mode,
            });
        }
    }

    let content = std::fs::read_to_string(path).map_err(|e| SecretsError::Unreadable {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let secrets: Secrets = serde_json::from_str(&content).map_err(|e| SecretsError::Invalid {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    secrets.validate()?;
    Ok(secrets)
}
