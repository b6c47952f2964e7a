// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! [`FleetConfigFile`] is what users write (every field optional, JSON or
//! YAML). [`ResolvedConfig`] is what the orchestrator runs with.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fleet configuration as written in `config.json` / `config.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfigFile {
    /// Where project base directories are created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projects_root: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfigPartial>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub router: Option<RouterConfigPartial>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<TimeoutsPartial>,
}

/// Agent process settings (partial).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfigPartial {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range_start: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range_end: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

/// Router process settings (partial).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfigPartial {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

/// Timeouts (partial).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutsPartial {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawn_grace_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminate_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_command_timeout_secs: Option<u64>,
}

/// Resolved agent settings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSettings {
    pub command: String,
    /// May contain `{port}` and `{hostname}` placeholders.
    pub args: Vec<String>,
    pub hostname: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub health_path: String,
    pub username: String,
    /// Env var the shared password is passed in.
    pub password_env: String,
    pub env: HashMap<String, String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: "opencode".to_string(),
            args: ["serve", "--port", "{port}", "--hostname", "{hostname}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            hostname: "127.0.0.1".to_string(),
            port_range_start: 4100,
            port_range_end: 4199,
            health_path: "/global/health".to_string(),
            username: "opencode".to_string(),
            password_env: "OPENCODE_SERVER_PASSWORD".to_string(),
            env: HashMap::new(),
        }
    }
}

/// Resolved router settings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterSettings {
    pub command: String,
    pub args: Vec<String>,
    pub hostname: String,
    pub default_port: u16,
    pub health_path: String,
    /// Env var carrying the router config file path.
    pub config_path_env: String,
    /// Env var carrying the bearer token.
    pub token_env: String,
    pub env: HashMap<String, String>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            command: "opencode-router".to_string(),
            args: ["--port", "{port}", "--hostname", "{hostname}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            hostname: "127.0.0.1".to_string(),
            default_port: 3005,
            health_path: "/health".to_string(),
            config_path_env: "ROUTER_CONFIG_PATH".to_string(),
            token_env: "ROUTER_AUTH_TOKEN".to_string(),
            env: HashMap::new(),
        }
    }
}

/// Resolved timeouts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    pub health_timeout_secs: u64,
    pub health_interval_ms: u64,
    pub spawn_grace_ms: u64,
    pub terminate_timeout_secs: u64,
    pub git_timeout_secs: u64,
    pub start_command_timeout_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            health_timeout_secs: 60,
            health_interval_ms: 500,
            spawn_grace_ms: 1500,
            terminate_timeout_secs: 10,
            git_timeout_secs: 300,
            start_command_timeout_secs: 600,
        }
    }
}

impl Timeouts {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn spawn_grace(&self) -> Duration {
        Duration::from_millis(self.spawn_grace_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn start_command_timeout(&self) -> Duration {
        Duration::from_secs(self.start_command_timeout_secs)
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    /// Fleet home (`~/.agentfleet` by default).
    pub home: PathBuf,
    pub projects_root: PathBuf,
    pub agent: AgentSettings,
    pub router: RouterSettings,
    pub timeouts: Timeouts,
}

impl ResolvedConfig {
    /// Defaults rooted at `home`, with projects under `projects_root`.
    pub fn with_home(home: impl Into<PathBuf>, projects_root: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            projects_root: projects_root.into(),
            agent: AgentSettings::default(),
            router: RouterSettings::default(),
            timeouts: Timeouts::default(),
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.home.join("state.json")
    }

    pub fn router_config_path(&self) -> PathBuf {
        self.home.join("router.json")
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.home.join("secrets.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.home.join("keys")
    }
}

/// Substitute `{port}` and `{hostname}` in argument templates.
pub fn expand_args(args: &[String], port: u16, hostname: &str) -> Vec<String> {
    let port = port.to_string();
    args.iter()
        .map(|a| a.replace("{port}", &port).replace("{hostname}", hostname))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_defaults() {
        let agent = AgentSettings::default();
        assert_eq!(agent.command, "opencode");
        assert_eq!((agent.port_range_start, agent.port_range_end), (4100, 4199));
        assert_eq!(agent.health_path, "/global/health");
        assert_eq!(agent.password_env, "OPENCODE_SERVER_PASSWORD");
    }

    #[test]
    fn test_router_default_port() {
        assert_eq!(RouterSettings::default().default_port, 3005);
    }

    #[test]
    fn test_expand_args() {
        let args = AgentSettings::default().args;
        assert_eq!(
            expand_args(&args, 4100, "127.0.0.1"),
            vec!["serve", "--port", "4100", "--hostname", "127.0.0.1"]
        );
    }

    #[test]
    fn test_partial_parses_camel_case() {
        let json = r#"{"projectsRoot": "/srv/p", "agent": {"portRangeStart": 5000}, "timeouts": {"healthTimeoutSecs": 5}}"#;
        let file: FleetConfigFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.projects_root, Some(PathBuf::from("/srv/p")));
        assert_eq!(file.agent.unwrap().port_range_start, Some(5000));
        assert_eq!(file.timeouts.unwrap().health_timeout_secs, Some(5));
    }

    #[test]
    fn test_paths_under_home() {
        let config = ResolvedConfig::with_home("/h", "/p");
        assert_eq!(config.state_path(), PathBuf::from("/h/state.json"));
        assert_eq!(config.router_config_path(), PathBuf::from("/h/router.json"));
        assert_eq!(config.keys_dir(), PathBuf::from("/h/keys"));
    }
}
