// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the agent fleet orchestrator.
//!
//! Each subsystem owns a strongly-typed error (`thiserror`), and [`FleetError`]
//! wraps them for the public operation surface. [`FleetError::kind`] maps every
//! error onto the small taxonomy callers act on: validation problems are
//! rejected, conflicts and timeouts may be retried, drift is corrected.

use std::path::PathBuf;

use thiserror::Error;

use crate::keys::KeyError;
use crate::process::ProcessError;
use crate::router_config::RouterConfigError;
use crate::sandbox::{GitError, SandboxError};
use crate::state::StateError;

/// Errors produced while deriving a project identity from a repository URL.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Repository URL is empty")]
    Empty,

    #[error("Malformed repository URL '{url}': {reason}")]
    Malformed { url: String, reason: String },
}

impl IdentityError {
    pub(crate) fn malformed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid config format: {0}")]
    InvalidFormat(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Home directory could not be determined")]
    NoHomeDir,

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Errors raised while loading the global credential file.
///
/// All of these are fatal at startup.
#[derive(Error, Debug)]
pub enum SecretsError {
    #[error("Secrets file not found at {0}; create it with serverPassword and routerToken")]
    Missing(PathBuf),

    #[error("Secrets file {path} is unreadable: {message}")]
    Unreadable { path: PathBuf, message: String },

    #[error("Secrets file {path} is not valid JSON: {message}")]
    Invalid { path: PathBuf, message: String },

    #[error("Secret '{field}' is empty or still a placeholder")]
    Placeholder { field: String },

    #[error("Secrets file {path} has mode {mode:o}; run `chmod 600 {path}`")]
    InsecurePermissions { path: PathBuf, mode: u32 },
}

/// Broad classification of failures, used by callers to decide what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input or a name collision. Never retried.
    Validation,
    /// Repository not reachable with the current key.
    Access,
    /// A port or directory is held by something else.
    ResourceConflict,
    /// A bounded wait elapsed without success.
    Timeout,
    /// Persisted state disagrees with the OS.
    StateDrift,
    /// The referenced project, sandbox, or record does not exist.
    NotFound,
    /// Anything else: IO, serialization, unexpected subprocess failures.
    Internal,
}

/// Top-level error for orchestrator operations.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("State store error: {0}")]
    State(#[from] StateError),

    #[error("Router config error: {0}")]
    RouterConfig(#[from] RouterConfigError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("Deploy key error: {0}")]
    Key(#[from] KeyError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Secrets error: {0}")]
    Secrets(#[from] SecretsError),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Base directory {path} is already used by project {other}")]
    BaseDirConflict { path: PathBuf, other: String },

    #[error("Router cannot stop while {0} project(s) are active")]
    RouterBusy(u32),

    #[error("IO error on {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Start of {key} failed at stage '{stage}': {message}")]
    StartFailed {
        key: String,
        stage: String,
        message: String,
    },
}

impl FleetError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Identity(_) | Self::BaseDirConflict { .. } | Self::Config(_) | Self::Secrets(_) => {
                ErrorKind::Validation
            }
            Self::ProjectNotFound(_) => ErrorKind::NotFound,
            Self::RouterBusy(_) => ErrorKind::ResourceConflict,
            Self::State(StateError::NotFound(_)) => ErrorKind::NotFound,
            Self::State(StateError::InvalidTransition { .. }) => ErrorKind::StateDrift,
            Self::State(_) | Self::RouterConfig(_) | Self::Key(_) | Self::Io { .. } => {
                ErrorKind::Internal
            }
            Self::Process(err) => match err {
                ProcessError::HealthTimeout { .. } | ProcessError::Timeout { .. } => ErrorKind::Timeout,
                ProcessError::NoFreePort { .. } | ProcessError::PortInUse(_) => {
                    ErrorKind::ResourceConflict
                }
                ProcessError::BinaryNotFound(_) => ErrorKind::Validation,
                _ => ErrorKind::Internal,
            },
            Self::Sandbox(err) => match err {
                SandboxError::InvalidName(_) | SandboxError::AlreadyExists { .. } => {
                    ErrorKind::Validation
                }
                SandboxError::NotFound { .. } | SandboxError::ProjectNotFound(_) => {
                    ErrorKind::NotFound
                }
                SandboxError::Git(GitError::AccessDenied(_)) => ErrorKind::Access,
                SandboxError::Git(GitError::Timeout(_)) | SandboxError::StartCommandTimeout { .. } => {
                    ErrorKind::Timeout
                }
                _ => ErrorKind::Internal,
            },
            Self::Git(GitError::AccessDenied(_)) => ErrorKind::Access,
            Self::Git(GitError::Timeout(_)) => ErrorKind::Timeout,
            Self::Git(_) => ErrorKind::Internal,
            Self::StartFailed { stage, .. } => match stage.as_str() {
                "health" => ErrorKind::Timeout,
                "binary" => ErrorKind::Validation,
                "port" => ErrorKind::ResourceConflict,
                _ => ErrorKind::Internal,
            },
        }
    }

    /// Check if retrying the same call could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ResourceConflict | ErrorKind::Timeout)
    }
}

/// Result type for orchestrator operations.
pub type FleetResult<T> = std::result::Result<T, FleetError>;

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_error_is_validation() {
        let err: FleetError = IdentityError::malformed("nope", "missing path").into();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_health_timeout_is_retryable() {
        let err: FleetError = ProcessError::HealthTimeout {
            url: "http://127.0.0.1:4100/global/health".to_string(),
            elapsed_ms: 60_000,
            last_message: "connection refused".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_duplicate_sandbox_is_validation() {
        let err: FleetError = SandboxError::AlreadyExists {
            project: "git@github.com:user/repo.git".to_string(),
            name: "feature-x".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_access_denied_is_access() {
        let err: FleetError = GitError::AccessDenied("Permission denied (publickey)".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Access);
    }

    #[test]
    fn test_router_busy_display() {
        let err = FleetError::RouterBusy(2);
        assert_eq!(err.kind(), ErrorKind::ResourceConflict);
        assert!(err.to_string().contains("2 project(s)"));
    }

    #[test]
    fn test_config_error_from_json() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("invalid json");
        let config_err: ConfigError = result.unwrap_err().into();
        assert!(matches!(config_err, ConfigError::JsonError(_)));
    }

    #[test]
    fn test_start_failed_stage_classification() {
        let err = FleetError::StartFailed {
            key: "git@github.com:user/repo.git".to_string(),
            stage: "binary".to_string(),
            message: "opencode not found".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
