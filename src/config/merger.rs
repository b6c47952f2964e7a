// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Precedence (highest to lowest): CLI options, config file, defaults.

use std::path::PathBuf;

use crate::error::ConfigError;

use super::loader::expand_tilde;
use super::types::{
    AgentConfigPartial, FleetConfigFile, ResolvedConfig, RouterConfigPartial, TimeoutsPartial,
};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub home: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub projects_root: Option<PathBuf>,
    pub health_timeout_secs: Option<u64>,
}

/// Merge a config file and CLI options over defaults.
pub fn merge_config(
    home: PathBuf,
    default_projects_root: PathBuf,
    file: Option<FleetConfigFile>,
    cli: &CliOptions,
) -> Result<ResolvedConfig, ConfigError> {
    let mut result = ResolvedConfig::with_home(home, default_projects_root);

    if let Some(config) = file {
        apply_file_config(&mut result, config);
    }
    apply_cli_options(&mut result, cli);

    validate(&result)?;
    Ok(result)
}

fn apply_file_config(result: &mut ResolvedConfig, config: FleetConfigFile) {
    if let Some(root) = config.projects_root {
        result.projects_root = expand_tilde(&root);
    }
    if let Some(agent) = config.agent {
        apply_agent(result, agent);
    }
    if let Some(router) = config.router {
        apply_router(result, router);
    }
    if let Some(timeouts) = config.timeouts {
        apply_timeouts(result, timeouts);
    }
}

fn apply_agent(result: &mut ResolvedConfig, agent: AgentConfigPartial) {
    let target = &mut result.agent;
    if let Some(command) = agent.command {
        target.command = command;
    }
    if let Some(args) = agent.args {
        target.args = args;
    }
    if let Some(hostname) = agent.hostname {
        target.hostname = hostname;
    }
    if let Some(start) = agent.port_range_start {
        target.port_range_start = start;
    }
    if let Some(end) = agent.port_range_end {
        target.port_range_end = end;
    }
    if let Some(path) = agent.health_path {
        target.health_path = path;
    }
    if let Some(username) = agent.username {
        target.username = username;
    }
    if let Some(env_name) = agent.password_env {
        target.password_env = env_name;
    }
    if let Some(env) = agent.env {
        target.env.extend(env);
    }
}

fn apply_router(result: &mut ResolvedConfig, router: RouterConfigPartial) {
    let target = &mut result.router;
    if let Some(command) = router.command {
        target.command = command;
    }
    if let Some(args) = router.args {
        target.args = args;
    }
    if let Some(hostname) = router.hostname {
        target.hostname = hostname;
    }
    if let Some(port) = router.default_port {
        target.default_port = port;
    }
    if let Some(path) = router.health_path {
        target.health_path = path;
    }
    if let Some(env_name) = router.config_path_env {
        target.config_path_env = env_name;
    }
    if let Some(env_name) = router.token_env {
        target.token_env = env_name;
    }
    if let Some(env) = router.env {
        target.env.extend(env);
    }
}

fn apply_timeouts(result: &mut ResolvedConfig, timeouts: TimeoutsPartial) {
    let target = &mut result.timeouts;
    if let Some(v) = timeouts.health_timeout_secs {
        target.health_timeout_secs = v;
    }
    if let Some(v) = timeouts.health_interval_ms {
        target.health_interval_ms = v;
    }
    if let Some(v) = timeouts.spawn_grace_ms {
        target.spawn_grace_ms = v;
    }
    if let Some(v) = timeouts.terminate_timeout_secs {
        target.terminate_timeout_secs = v;
    }
    if let Some(v) = timeouts.git_timeout_secs {
        target.git_timeout_secs = v;
    }
    if let Some(v) = timeouts.start_command_timeout_secs {
        target.start_command_timeout_secs = v;
    }
}

fn apply_cli_options(result: &mut ResolvedConfig, cli: &CliOptions) {
    if let Some(ref root) = cli.projects_root {
        result.projects_root = expand_tilde(root);
    }
    if let Some(secs) = cli.health_timeout_secs {
        result.timeouts.health_timeout_secs = secs;
    }
}

fn validate(config: &ResolvedConfig) -> Result<(), ConfigError> {
    let agent = &config.agent;
    if agent.port_range_start == 0 || agent.port_range_start > agent.port_range_end {
        return Err(ConfigError::InvalidValue {
            field: "agent.portRangeStart".to_string(),
            message: format!(
                "port range {}-{} is empty",
                agent.port_range_start, agent.port_range_end
            ),
        });
    }
    let router_port = config.router.default_port;
    if router_port == 0 {
        return Err(ConfigError::InvalidValue {
            field: "router.defaultPort".to_string(),
            message: "must be non-zero".to_string(),
        });
    }
    if (agent.port_range_start..=agent.port_range_end).contains(&router_port) {
        return Err(ConfigError::InvalidValue {
            field: "router.defaultPort".to_string(),
            message: format!("{} overlaps the agent port range", router_port),
        });
    }
    if agent.command.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "agent.command".to_string(),
            message: "must not be empty".to_string(),
        });
    }
    if config.timeouts.health_interval_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "timeouts.healthIntervalMs".to_string(),
            message: "must be non-zero".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merge(file: Option<FleetConfigFile>, cli: CliOptions) -> Result<ResolvedConfig, ConfigError> {
        merge_config(PathBuf::from("/h"), PathBuf::from("/p"), file, &cli)
    }

    #[test]
    fn test_defaults_only() {
        let config = merge(None, CliOptions::default()).unwrap();
        assert_eq!(config.projects_root, PathBuf::from("/p"));
        assert_eq!(config.router.default_port, 3005);
        assert_eq!(config.timeouts.health_timeout_secs, 60);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file = FleetConfigFile {
            projects_root: Some(PathBuf::from("/srv")),
            agent: Some(AgentConfigPartial {
                command: Some("my-agent".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = merge(Some(file), CliOptions::default()).unwrap();
        assert_eq!(config.projects_root, PathBuf::from("/srv"));
        assert_eq!(config.agent.command, "my-agent");
        // Untouched fields keep their defaults.
        assert_eq!(config.agent.health_path, "/global/health");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = FleetConfigFile {
            projects_root: Some(PathBuf::from("/srv")),
            timeouts: Some(TimeoutsPartial {
                health_timeout_secs: Some(30),
                ..Default::default()
            }),
            ..Default::default()
        };
        let cli = CliOptions {
            projects_root: Some(PathBuf::from("/cli")),
            health_timeout_secs: Some(5),
            ..Default::default()
        };
        let config = merge(Some(file), cli).unwrap();
        assert_eq!(config.projects_root, PathBuf::from("/cli"));
        assert_eq!(config.timeouts.health_timeout_secs, 5);
    }

    #[test]
    fn test_router_port_inside_agent_range_rejected() {
        let file = FleetConfigFile {
            router: Some(RouterConfigPartial {
                default_port: Some(4150),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = merge(Some(file), CliOptions::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_empty_port_range_rejected() {
        let file = FleetConfigFile {
            agent: Some(AgentConfigPartial {
                port_range_start: Some(5000),
                port_range_end: Some(4000),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(merge(Some(file), CliOptions::default()).is_err());
    }
}
