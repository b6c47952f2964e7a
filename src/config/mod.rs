// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module.
//!
//! Everything lives in the fleet home (`~/.agentfleet` unless overridden):
//! - `config.json` / `config.yaml`: optional settings
//! - `secrets.json`: shared credentials, owner-only, required
//!
//! Configuration is merged with precedence (CLI > file > defaults).

mod loader;
mod merger;
mod secrets;
mod types;

pub use loader::{
    default_projects_root, expand_tilde, find_config_file, fleet_home, load_config_file,
    load_fleet_config, CONFIG_FILES, FLEET_HOME_DIR, FLEET_HOME_ENV, PROJECTS_ROOT_DIR,
};

pub use merger::{merge_config, CliOptions};

pub use secrets::{is_placeholder, load_secrets, Secrets};

pub use types::{
    expand_args, AgentConfigPartial, AgentSettings, FleetConfigFile, ResolvedConfig,
    RouterConfigPartial, RouterSettings, Timeouts, TimeoutsPartial,
};

use crate::error::ConfigError;

/// Load and merge configuration.
///
/// This is the main entry point for configuration loading. Secrets are
/// loaded separately with [`load_secrets`] so that read-only commands can
/// run without them.
pub fn load_config(cli: &CliOptions) -> Result<ResolvedConfig, ConfigError> {
    let home = fleet_home(cli.home.as_deref())?;
    let file = match cli.config_file {
        Some(ref path) => Some(load_config_file(path)?),
        None => load_fleet_config(&home)?,
    };
    merge_config(home, default_projects_root()?, file, cli)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_with_no_files() {
        let temp = TempDir::new().unwrap();
        let cli = CliOptions {
            home: Some(temp.path().to_path_buf()),
            ..Default::default()
        };
        let config = load_config(&cli).unwrap();
        assert_eq!(config.home, temp.path());
        assert_eq!(config.state_path(), temp.path().join("state.json"));
    }

    #[test]
    fn test_load_config_from_home() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("config.json"),
            r#"{"projectsRoot": "/srv/projects", "router": {"defaultPort": 3100}}"#,
        )
        .unwrap();
        let cli = CliOptions {
            home: Some(temp.path().to_path_buf()),
            ..Default::default()
        };
        let config = load_config(&cli).unwrap();
        assert_eq!(config.projects_root, PathBuf::from("/srv/projects"));
        assert_eq!(config.router.default_port, 3100);
    }

    #[test]
    fn test_explicit_config_file_and_cli_override() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("custom.yaml");
        std::fs::write(&file, "projectsRoot: /from/file\n").unwrap();

        let cli = CliOptions {
            home: Some(temp.path().to_path_buf()),
            config_file: Some(file),
            projects_root: Some(PathBuf::from("/from/cli")),
            ..Default::default()
        };
        let config = load_config(&cli).unwrap();
        assert_eq!(config.projects_root, PathBuf::from("/from/cli"));
    }
}
