// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files.
//!
//! Handles locating the fleet home and loading `config.json` / `config.yaml`.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::types::FleetConfigFile;

/// Fleet home directory name under the user's home.
pub const FLEET_HOME_DIR: &str = ".agentfleet";

/// Environment variable overriding the fleet home.
pub const FLEET_HOME_ENV: &str = "AGENTFLEET_HOME";

/// Default projects root directory name under the user's home.
pub const PROJECTS_ROOT_DIR: &str = "agentfleet-projects";

/// Config file names to search for in the fleet home (in order).
pub const CONFIG_FILES: &[&str] = &["config.json", "config.yaml", "config.yml"];

/// Resolve the fleet home: explicit override, then `AGENTFLEET_HOME`, then `~/.agentfleet`.
pub fn fleet_home(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(env) = std::env::var_os(FLEET_HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(env));
    }
    dirs::home_dir()
        .map(|home| home.join(FLEET_HOME_DIR))
        .ok_or(ConfigError::NoHomeDir)
}

/// Default root for project base directories.
pub fn default_projects_root() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(PROJECTS_ROOT_DIR))
        .ok_or(ConfigError::NoHomeDir)
}

/// Find the first config file present in `home`.
pub fn find_config_file(home: &Path) -> Option<PathBuf> {
    CONFIG_FILES
        .iter()
        .map(|name| home.join(name))
        .find(|path| path.exists())
}

/// Load the config file from `home`, if any.
pub fn load_fleet_config(home: &Path) -> Result<Option<FleetConfigFile>, ConfigError> {
    match find_config_file(home) {
        Some(path) => load_config_file(&path).map(Some),
        None => Ok(None),
    }
}

/// Load a configuration file (JSON or YAML).
pub fn load_config_file(path: &Path) -> Result<FleetConfigFile, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }
    let content = std::fs::read_to_string(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    match extension.to_lowercase().as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(ConfigError::from),
        _ => serde_json::from_str(&content).map_err(ConfigError::from),
    }
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_explicit_home_wins() {
        let home = fleet_home(Some(Path::new("/tmp/fleet"))).unwrap();
        assert_eq!(home, PathBuf::from("/tmp/fleet"));
    }

    #[test]
    fn test_no_config_file() {
        let temp = TempDir::new().unwrap();
        assert!(load_fleet_config(temp.path()).unwrap().is_none());
    }

    #[test]
    fn test_load_json() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("config.json"),
            r#"{"projectsRoot": "/srv/projects"}"#,
        )
        .unwrap();
        let config = load_fleet_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.projects_root, Some(PathBuf::from("/srv/projects")));
    }

    #[test]
    fn test_load_yaml() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("config.yaml"),
            "agent:\n  command: my-agent\n  portRangeStart: 5000\n",
        )
        .unwrap();
        let config = load_fleet_config(temp.path()).unwrap().unwrap();
        let agent = config.agent.unwrap();
        assert_eq!(agent.command.as_deref(), Some("my-agent"));
        assert_eq!(agent.port_range_start, Some(5000));
    }

    #[test]
    fn test_invalid_json_is_error() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.json"), "{ nope").unwrap();
        let err = load_fleet_config(temp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::JsonError(_)));
    }

    #[test]
    fn test_explicit_missing_file() {
        let err = load_config_file(Path::new("/definitely/missing/config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_expand_tilde() {
        let plain = expand_tilde(Path::new("/abs/path"));
        assert_eq!(plain, PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/x")), home.join("x"));
        }
    }
}
