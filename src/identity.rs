// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Project identity derived from a repository URL.
//!
//! Every accepted spelling of a remote collapses to one canonical SSH-style
//! key, which is the only join key between the state store and the router
//! config:
//!
//! ```text
//! https://github.com/user/repo          ┐
//! https://github.com/user/repo.git      │
//! git@github.com:user/repo              ├──► git@github.com:user/repo.git
//! ssh://git@github.com/user/repo.git    │
//! github.com/user/repo                  ┘
//! ```
//!
//! The display name (`user-repo`) and default base directory are derived from
//! the key and never used as keys themselves.

use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::IdentityError;

/// Suffix every canonical key ends with.
pub const KEY_SUFFIX: &str = ".git";

/// `user@host:path` (scp-like syntax).
static SCP_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9._-]+@)?([A-Za-z0-9.-]+):([^/].*)$").expect("valid regex")
});

/// `scheme://[userinfo@]host[:port]/path`.
static WITH_SCHEME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(ssh|git\+ssh|https?|git)://(?:[^@/]+@)?([A-Za-z0-9.-]+)(?::(\d+))?/(.+)$")
        .expect("valid regex")
});

/// `host.tld/path` with no scheme.
static BARE_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)+)/(.+)$").expect("valid regex"));

static SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid regex"));

/// A parsed, canonical repository identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoIdentity {
    host: String,
    ssh_port: Option<u16>,
    segments: Vec<String>,
}

impl RepoIdentity {
    /// Parse any accepted URL form.
    pub fn parse(url: &str) -> Result<Self, IdentityError> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(IdentityError::Empty);
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(IdentityError::malformed(url, "contains whitespace"));
        }

        let (host, ssh_port, path) = if let Some(caps) = WITH_SCHEME.captures(trimmed) {
            let scheme = &caps[1];
            let port = match caps.get(3) {
                Some(p) => Some(
                    p.as_str()
                        .parse::<u16>()
                        .map_err(|_| IdentityError::malformed(url, "invalid port"))?,
                ),
                None => None,
            };
            // Only an explicit, non-default SSH port changes which remote we talk to.
            let ssh_port = match scheme {
                "ssh" | "git+ssh" => port.filter(|p| *p != 22),
                _ => None,
            };
            (caps[2].to_string(), ssh_port, caps[4].to_string())
        } else if trimmed.contains("://") {
            return Err(IdentityError::malformed(url, "unsupported scheme"));
        } else if let Some(caps) = SCP_LIKE.captures(trimmed) {
            (caps[1].to_string(), None, caps[2].to_string())
        } else if let Some(caps) = BARE_HOST.captures(trimmed) {
            (caps[1].to_string(), None, caps[2].to_string())
        } else {
            return Err(IdentityError::malformed(url, "expected host and owner/repo path"));
        };

        let segments = split_path(url, &path)?;
        Ok(Self {
            host: host.to_ascii_lowercase(),
            ssh_port,
            segments,
        })
    }

    /// Host name, lowercased.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Everything before the repository name (`owner`, or `group/subgroup`).
    pub fn owner(&self) -> String {
        self.segments[..self.segments.len() - 1].join("/")
    }

    /// Repository name without suffix.
    pub fn repo(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    /// The canonical key.
    pub fn key(&self) -> String {
        let path = self.segments.join("/");
        match self.ssh_port {
            Some(port) => format!("ssh://git@{}:{}/{}{}", self.host, port, path, KEY_SUFFIX),
            None => format!("git@{}:{}{}", self.host, path, KEY_SUFFIX),
        }
    }

    /// Human-readable name, `owner-repo`.
    pub fn display_name(&self) -> String {
        self.segments.join("-")
    }

    /// HTTPS form of the remote, used in user-facing instructions.
    pub fn web_url(&self) -> String {
        format!("https://{}/{}", self.host, self.segments.join("/"))
    }
}

impl fmt::Display for RepoIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

fn split_path(url: &str, path: &str) -> Result<Vec<String>, IdentityError> {
    let path = path.trim_matches('/');
    let path = path.strip_suffix(KEY_SUFFIX).unwrap_or(path);
    let path = path.trim_end_matches('/');

    let segments: Vec<String> = path.split('/').map(str::to_string).collect();
    if segments.len() < 2 {
        return Err(IdentityError::malformed(url, "path must contain owner and repository"));
    }
    for segment in &segments {
        if segment.is_empty() || segment == "." || segment == ".." || !SEGMENT.is_match(segment) {
            return Err(IdentityError::malformed(
                url,
                format!("invalid path segment '{}'", segment),
            ));
        }
    }
    Ok(segments)
}

/// Normalize a repository URL into its canonical key.
pub fn normalize(url: &str) -> Result<String, IdentityError> {
    RepoIdentity::parse(url).map(|id| id.key())
}

/// Derive the display name for a key (or any accepted URL form).
pub fn display_name(key: &str) -> Result<String, IdentityError> {
    RepoIdentity::parse(key).map(|id| id.display_name())
}

/// Default base directory for a project under `projects_root`.
pub fn base_dir(key: &str, projects_root: &Path) -> Result<PathBuf, IdentityError> {
    display_name(key).map(|name| projects_root.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL: &str = "git@github.com:user/repo.git";

    #[test]
    fn test_equivalent_forms_normalize_identically() {
        let forms = [
            "https://github.com/user/repo",
            "https://github.com/user/repo.git",
            "https://github.com/user/repo/",
            "http://github.com/user/repo",
            "https://token@github.com/user/repo.git",
            "git@github.com:user/repo",
            "git@github.com:user/repo.git",
            "ssh://git@github.com/user/repo.git",
            "ssh://git@github.com:22/user/repo",
            "github.com/user/repo",
            "  https://GitHub.com/user/repo  ",
        ];
        for form in forms {
            assert_eq!(normalize(form).unwrap(), CANONICAL, "form: {form}");
        }
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize("https://gitlab.com/group/sub/project").unwrap();
        assert_eq!(once, "git@gitlab.com:group/sub/project.git");
        assert_eq!(normalize(&once).unwrap(), once);
    }

    #[test]
    fn test_custom_ssh_port_is_kept() {
        let key = normalize("ssh://git@git.example.com:2222/team/tool.git").unwrap();
        assert_eq!(key, "ssh://git@git.example.com:2222/team/tool.git");
        assert_eq!(normalize(&key).unwrap(), key);
    }

    #[test]
    fn test_path_case_is_preserved() {
        assert_eq!(
            normalize("https://github.com/User/Repo").unwrap(),
            "git@github.com:User/Repo.git"
        );
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(normalize("").unwrap_err(), IdentityError::Empty);
        for bad in [
            "not a url",
            "https://github.com/onlyowner",
            "ftp://github.com/user/repo",
            "git@github.com:user/../repo",
            "repo",
            "https://github.com//repo",
        ] {
            assert!(normalize(bad).is_err(), "should reject: {bad}");
        }
    }

    #[test]
    fn test_display_name_and_base_dir() {
        assert_eq!(display_name(CANONICAL).unwrap(), "user-repo");
        assert_eq!(
            base_dir(CANONICAL, Path::new("/srv/projects")).unwrap(),
            PathBuf::from("/srv/projects/user-repo")
        );
        assert_eq!(
            display_name("git@gitlab.com:group/sub/project.git").unwrap(),
            "group-sub-project"
        );
    }

    #[test]
    fn test_identity_parts() {
        let id = RepoIdentity::parse("https://gitlab.com/group/sub/project").unwrap();
        assert_eq!(id.host(), "gitlab.com");
        assert_eq!(id.owner(), "group/sub");
        assert_eq!(id.repo(), "project");
        assert_eq!(id.web_url(), "https://gitlab.com/group/sub/project");
    }
}
