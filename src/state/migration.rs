// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Forward migration of older state files.
//!
//! Version 1 files were keyed by display name, stored the project directory
//! as `projectDir`/`project_dir`, kept `pid`/`port`/`status` flat on the
//! record, and often had no router record or worktree list. Migration:
//!
//! 1. re-keys every record by its normalized repository URL,
//! 2. copies the directory into `baseDir` and keeps `projectDir` for readers
//!    that still look for it,
//! 3. fills router and worktree fields with safe defaults,
//! 4. merges records that turn out to describe the same repository.
//!
//! A file already at [`STATE_VERSION`] is returned untouched, so running the
//! migration any number of times is a no-op after the first.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::types::{
    GlobalRouterState, ProcessRecord, ProjectRecord, ProjectStatus, RouterStatus, SandboxRecord,
    StateFile, SANDBOXES_DIR, STATE_VERSION,
};
use crate::identity::RepoIdentity;

/// Top-level keys that can hold the router record in older files.
const ROUTER_KEYS: &[&str] = &["router", "globalRouter", "global_router", "globalServer", "global_server"];

/// Result of running the migration over a raw state document.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    /// The (possibly rewritten) document.
    pub value: Value,
    /// Whether anything changed.
    pub changed: bool,
    /// `(legacy key, new key)` for every re-keyed record.
    pub rekeyed: Vec<(String, String)>,
    /// `(dropped legacy key, kept key)` for every merged duplicate.
    pub merged: Vec<(String, String)>,
    /// Legacy keys that could not be normalized and were preserved verbatim.
    pub unmigrated: Vec<String>,
}

/// Version recorded in a raw document (`None` for pre-versioned files).
pub fn document_version(value: &Value) -> Option<u64> {
    value.get("version").and_then(Value::as_u64)
}

/// Whether a raw document needs migrating.
pub fn needs_migration(value: &Value) -> bool {
    document_version(value) != Some(STATE_VERSION as u64)
}

/// Migrate a raw document to the current format.
pub fn migrate(value: Value, projects_root: &Path) -> MigrationOutcome {
    if !needs_migration(&value) {
        return MigrationOutcome {
            value,
            changed: false,
            rekeyed: Vec::new(),
            merged: Vec::new(),
            unmigrated: Vec::new(),
        };
    }

    let root = match value {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    let legacy_projects: Map<String, Value> = match root.get("projects") {
        Some(Value::Object(projects)) => projects.clone(),
        // Oldest files put projects at the top level.
        _ => root
            .iter()
            .filter(|(k, v)| v.is_object() && !ROUTER_KEYS.contains(&k.as_str()) && k.as_str() != "unmigrated")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };

    let mut projects: BTreeMap<String, ProjectRecord> = BTreeMap::new();
    let mut unmigrated = match root.get("unmigrated") {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    let mut outcome_rekeyed = Vec::new();
    let mut outcome_merged = Vec::new();
    let mut outcome_unmigrated = Vec::new();

    for (legacy_key, raw) in legacy_projects {
        let Some(obj) = raw.as_object() else {
            unmigrated.insert(legacy_key.clone(), raw);
            outcome_unmigrated.push(legacy_key);
            continue;
        };
        let Some(record) = convert_record(&legacy_key, obj, projects_root) else {
            tracing::warn!("Could not normalize legacy project '{}'; preserving it verbatim", legacy_key);
            unmigrated.insert(legacy_key.clone(), raw);
            outcome_unmigrated.push(legacy_key);
            continue;
        };

        let key = record.repo_url.clone();
        if legacy_key != key {
            outcome_rekeyed.push((legacy_key.clone(), key.clone()));
        }
        match projects.remove(&key) {
            Some(existing) => {
                let kept = merge_records(existing, record);
                tracing::info!("Merged duplicate legacy record '{}' into {}", legacy_key, key);
                outcome_merged.push((legacy_key, key.clone()));
                projects.insert(key, kept);
            }
            None => {
                projects.insert(key, record);
            }
        }
    }

    let running = projects
        .values()
        .filter(|p| p.process.status == ProjectStatus::Running)
        .count() as u32;
    let router = ROUTER_KEYS
        .iter()
        .find_map(|k| root.get(*k).and_then(Value::as_object))
        .map(|obj| convert_router(obj, running))
        .unwrap_or_else(|| GlobalRouterState {
            active_project_count: running,
            ..GlobalRouterState::default()
        });

    let state = StateFile {
        version: STATE_VERSION,
        projects,
        router,
        unmigrated,
    };
    let value = serde_json::to_value(&state).unwrap_or(Value::Null);

    MigrationOutcome {
        value,
        changed: true,
        rekeyed: outcome_rekeyed,
        merged: outcome_merged,
        unmigrated: outcome_unmigrated,
    }
}

/// Pick the first present string field among `names`.
fn str_field<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|n| obj.get(*n).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
}

fn u64_field(obj: &Map<String, Value>, names: &[&str]) -> Option<u64> {
    names.iter().find_map(|n| match obj.get(*n) {
        Some(Value::Number(num)) => num.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn time_field(obj: &Map<String, Value>, names: &[&str]) -> Option<DateTime<Utc>> {
    str_field(obj, names)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn convert_record(legacy_key: &str, obj: &Map<String, Value>, projects_root: &Path) -> Option<ProjectRecord> {
    let identity = str_field(obj, &["repoUrl", "repo_url", "url", "repository", "gitUrl", "git_url"])
        .and_then(|url| RepoIdentity::parse(url).ok())
        .or_else(|| RepoIdentity::parse(legacy_key).ok())?;

    let display_name = str_field(obj, &["displayName", "display_name", "name"])
        .map(str::to_string)
        .unwrap_or_else(|| identity.display_name());

    let legacy_dir = str_field(obj, &["projectDir", "project_dir"]).map(PathBuf::from);
    let base_dir = str_field(obj, &["baseDir", "base_dir"])
        .map(PathBuf::from)
        .or_else(|| legacy_dir.clone())
        .unwrap_or_else(|| projects_root.join(identity.display_name()));

    let process_obj = obj.get("process").and_then(Value::as_object).unwrap_or(obj);
    let process = ProcessRecord {
        pid: u64_field(process_obj, &["pid"]).and_then(|p| u32::try_from(p).ok()),
        port: u64_field(process_obj, &["port"]).and_then(|p| u16::try_from(p).ok()),
        status: str_field(process_obj, &["status", "state"])
            .map(ProjectStatus::from_legacy)
            .unwrap_or_default(),
        last_error: str_field(process_obj, &["lastError", "last_error", "error"]).map(str::to_string),
        error_stage: process_obj
            .get("errorStage")
            .and_then(|v| serde_json::from_value(v.clone()).ok()),
        last_health_check: time_field(process_obj, &["lastHealthCheck", "last_health_check"]),
        started_at: time_field(process_obj, &["startedAt", "started_at"]),
    };

    let now = Utc::now();
    let worktrees = match obj.get("worktrees").or_else(|| obj.get("sandboxes")) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| convert_worktree(item, &base_dir, now))
            .collect(),
        _ => Vec::new(),
    };

    Some(ProjectRecord {
        repo_url: identity.key(),
        display_name,
        base_dir,
        project_dir: legacy_dir,
        project_id: str_field(obj, &["projectId", "project_id"]).map(str::to_string),
        worktrees,
        process,
        created_at: time_field(obj, &["createdAt", "created_at"]).unwrap_or(now),
        updated_at: time_field(obj, &["updatedAt", "updated_at"]).unwrap_or(now),
    })
}

fn convert_worktree(item: &Value, base_dir: &Path, now: DateTime<Utc>) -> Option<SandboxRecord> {
    match item {
        Value::String(name) if !name.is_empty() => Some(SandboxRecord {
            name: name.clone(),
            branch: format!("sandbox/{}", name),
            base_branch: String::new(),
            path: base_dir.join(SANDBOXES_DIR).join(name),
            created_at: now,
        }),
        Value::Object(obj) => {
            let name = str_field(obj, &["name"])?.to_string();
            Some(SandboxRecord {
                branch: str_field(obj, &["branch"])
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("sandbox/{}", name)),
                base_branch: str_field(obj, &["baseBranch", "base_branch"])
                    .unwrap_or_default()
                    .to_string(),
                path: str_field(obj, &["path"])
                    .map(PathBuf::from)
                    .unwrap_or_else(|| base_dir.join(SANDBOXES_DIR).join(&name)),
                created_at: time_field(obj, &["createdAt", "created_at"]).unwrap_or(now),
                name,
            })
        }
        _ => None,
    }
}

fn convert_router(obj: &Map<String, Value>, running: u32) -> GlobalRouterState {
    let mut router = GlobalRouterState {
        pid: u64_field(obj, &["pid"]).and_then(|p| u32::try_from(p).ok()),
        port: u64_field(obj, &["port"]).and_then(|p| u16::try_from(p).ok()),
        status: str_field(obj, &["status", "state"])
            .map(RouterStatus::from_legacy)
            .unwrap_or_default(),
        active_project_count: u64_field(
            obj,
            &["activeProjectCount", "active_project_count", "activeProjects", "active_projects"],
        )
        .and_then(|c| u32::try_from(c).ok())
        .unwrap_or(running),
        last_error: str_field(obj, &["lastError", "last_error"]).map(str::to_string),
        ..GlobalRouterState::default()
    };
    if let Some(created) = time_field(obj, &["createdAt", "created_at"]) {
        router.created_at = created;
    }
    router.last_health_check = time_field(obj, &["lastHealthCheck", "last_health_check"]);
    router
}

/// Merge two records for the same repository; a running record wins, then the newer one.
fn merge_records(a: ProjectRecord, b: ProjectRecord) -> ProjectRecord {
    let a_running = a.process.status == ProjectStatus::Running;
    let b_running = b.process.status == ProjectStatus::Running;
    let (mut keep, other) = match (a_running, b_running) {
        (true, false) => (a, b),
        (false, true) => (b, a),
        _ if b.updated_at > a.updated_at => (b, a),
        _ => (a, b),
    };

    for wt in other.worktrees {
        if keep.sandbox(&wt.name).is_none() {
            keep.worktrees.push(wt);
        }
    }
    if keep.project_id.is_none() {
        keep.project_id = other.project_id;
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn root() -> PathBuf {
        PathBuf::from("/srv/projects")
    }

    fn legacy_doc() -> Value {
        json!({
            "projects": {
                "user-repo": {
                    "repo_url": "https://github.com/user/repo",
                    "project_dir": "/old/user-repo",
                    "pid": 4242,
                    "port": 4101,
                    "status": "running",
                    "updated_at": "2026-01-02T00:00:00Z"
                },
                "other": {
                    "url": "git@gitlab.com:team/other.git",
                    "status": "stopped",
                    "worktrees": ["feature-a"]
                }
            }
        })
    }

    #[test]
    fn test_rekeys_by_normalized_url() {
        let outcome = migrate(legacy_doc(), &root());
        assert!(outcome.changed);
        let state: StateFile = serde_json::from_value(outcome.value).unwrap();
        assert_eq!(state.version, STATE_VERSION);
        assert!(state.projects.contains_key("git@github.com:user/repo.git"));
        assert!(state.projects.contains_key("git@gitlab.com:team/other.git"));
        assert_eq!(outcome.rekeyed.len(), 2);
    }

    #[test]
    fn test_renames_dir_field_and_keeps_legacy() {
        let outcome = migrate(legacy_doc(), &root());
        let state: StateFile = serde_json::from_value(outcome.value).unwrap();
        let record = &state.projects["git@github.com:user/repo.git"];
        assert_eq!(record.base_dir, PathBuf::from("/old/user-repo"));
        assert_eq!(record.project_dir, Some(PathBuf::from("/old/user-repo")));
        assert_eq!(record.process.pid, Some(4242));
        assert_eq!(record.process.port, Some(4101));
        assert_eq!(record.process.status, ProjectStatus::Running);

        let other = &state.projects["git@gitlab.com:team/other.git"];
        assert_eq!(other.base_dir, PathBuf::from("/srv/projects/team-other"));
        assert_eq!(other.sandbox_names(), vec!["feature-a".to_string()]);
    }

    #[test]
    fn test_initializes_router_defaults() {
        let outcome = migrate(legacy_doc(), &root());
        let state: StateFile = serde_json::from_value(outcome.value).unwrap();
        assert_eq!(state.router.status, RouterStatus::Idle);
        assert_eq!(state.router.port, None);
        assert_eq!(state.router.active_project_count, 1);
    }

    #[test]
    fn test_migration_twice_is_noop() {
        let first = migrate(legacy_doc(), &root());
        let bytes_after_first = serde_json::to_vec_pretty(&first.value).unwrap();

        let second = migrate(first.value.clone(), &root());
        assert!(!second.changed);
        assert!(second.rekeyed.is_empty());
        let bytes_after_second = serde_json::to_vec_pretty(&second.value).unwrap();
        assert_eq!(bytes_after_first, bytes_after_second);
    }

    #[test]
    fn test_merges_duplicates_preferring_running() {
        let doc = json!({
            "projects": {
                "user-repo": {
                    "repo_url": "https://github.com/user/repo",
                    "status": "stopped",
                    "worktrees": ["a"],
                    "updated_at": "2026-03-01T00:00:00Z"
                },
                "user-repo-old": {
                    "repo_url": "git@github.com:user/repo.git",
                    "status": "running",
                    "pid": 77,
                    "worktrees": ["b"],
                    "updated_at": "2026-01-01T00:00:00Z"
                }
            }
        });
        let outcome = migrate(doc, &root());
        assert_eq!(outcome.merged.len(), 1);
        let state: StateFile = serde_json::from_value(outcome.value).unwrap();
        assert_eq!(state.projects.len(), 1);
        let record = &state.projects["git@github.com:user/repo.git"];
        assert_eq!(record.process.pid, Some(77));
        let mut names = record.sandbox_names();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_unnormalizable_records_are_preserved() {
        let doc = json!({
            "projects": {
                "mystery": { "status": "stopped" }
            }
        });
        let outcome = migrate(doc, &root());
        assert_eq!(outcome.unmigrated, vec!["mystery".to_string()]);
        let state: StateFile = serde_json::from_value(outcome.value).unwrap();
        assert!(state.projects.is_empty());
        assert!(state.unmigrated.contains_key("mystery"));
    }

    #[test]
    fn test_legacy_router_record_is_carried() {
        let doc = json!({
            "projects": {},
            "global_router": { "pid": 12, "port": 3005, "status": "running", "active_projects": 2 }
        });
        let outcome = migrate(doc, &root());
        let state: StateFile = serde_json::from_value(outcome.value).unwrap();
        assert_eq!(state.router.port, Some(3005));
        assert_eq!(state.router.pid, Some(12));
        assert_eq!(state.router.status, RouterStatus::Running);
        assert_eq!(state.router.active_project_count, 2);
    }

    #[test]
    fn test_top_level_projects_without_wrapper() {
        let doc = json!({
            "user-repo": { "repo_url": "https://github.com/user/repo", "status": "stopped" }
        });
        let outcome = migrate(doc, &root());
        let state: StateFile = serde_json::from_value(outcome.value).unwrap();
        assert_eq!(state.projects.len(), 1);
    }
}
