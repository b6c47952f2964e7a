// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The process supervisor seam.
//!
//! [`ProcessSupervisor`] is everything the orchestrator needs from the OS.
//! [`OsSupervisor`] is the real implementation; tests substitute fakes.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::health::{self, HealthAuth, HealthReport};
use super::{ports, signals, ProcessError};

/// Everything needed to launch one managed process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
    /// stdout and stderr are appended here.
    pub log_file: PathBuf,
    /// Port the process is expected to listen on.
    pub port: u16,
    /// Command-line fragment identifying the real worker, e.g. `--port 4100`.
    pub signature: String,
}

impl SpawnRequest {
    /// Display form without the environment (which carries credentials).
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// OS operations used by the orchestrator.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Whether `program` resolves to an executable.
    fn binary_exists(&self, program: &str) -> bool;

    /// Whether `port` can be bound right now.
    fn port_is_free(&self, port: u16) -> bool;

    /// First free port in `start..=end` not listed in `exclude`.
    fn find_free_port(&self, start: u16, end: u16, exclude: &[u16]) -> Result<u16, ProcessError>;

    /// Best-effort termination of whatever listens on `port`. Returns the pids signalled.
    async fn kill_process_on_port(&self, port: u16, timeout: Duration) -> Vec<u32>;

    /// Launch a process and return the pid of the actual worker.
    async fn spawn(&self, request: SpawnRequest) -> Result<u32, ProcessError>;

    fn is_running(&self, pid: u32) -> bool;

    /// Graceful stop with escalation. `Ok(true)` when SIGKILL was needed.
    async fn terminate(&self, pid: u32, timeout: Duration) -> Result<bool, ProcessError>;

    /// Poll until healthy or `timeout`.
    async fn health_check(
        &self,
        url: &str,
        auth: &HealthAuth,
        timeout: Duration,
        interval: Duration,
    ) -> HealthReport;

    /// A single health request.
    async fn probe(&self, url: &str, auth: &HealthAuth) -> HealthReport;
}

/// Real process supervision via tokio, nix, lsof and pgrep.
pub struct OsSupervisor {
    client: reqwest::Client,
    spawn_grace: Duration,
}

impl OsSupervisor {
    pub fn new(spawn_grace: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            spawn_grace,
        }
    }

    /// Pick the pid that actually serves `port` once the grace period is over.
    async fn resolve_worker_pid(
        &self,
        request: &SpawnRequest,
        child_pid: u32,
        child_exit: &mut oneshot::Receiver<String>,
    ) -> Result<u32, ProcessError> {
        let exited = child_exit.try_recv().ok();

        let listeners = ports::listening_pids(request.port).await;
        if listeners.contains(&child_pid) {
            return Ok(child_pid);
        }
        if let Some(&pid) = listeners.first() {
            info!(
                "Resolved worker pid {} on port {} (launched as {})",
                pid, request.port, child_pid
            );
            return Ok(pid);
        }

        if exited.is_none() && signals::is_running(child_pid) {
            // Still alive but not listening yet; the health check decides.
            return Ok(child_pid);
        }

        if let Some(&pid) = ports::pids_matching(&request.signature)
            .await
            .iter()
            .find(|pid| **pid != child_pid)
        {
            info!("Resolved worker pid {} by signature '{}'", pid, request.signature);
            return Ok(pid);
        }

        let status = exited.unwrap_or_else(|| "exited".to_string());
        Err(ProcessError::SpawnFailed {
            program: request.program.clone(),
            message: format!(
                "process {} and no worker found for '{}'. Log tail:\n{}",
                status,
                request.signature,
                log_tail(&request.log_file, 20)
            ),
        })
    }
}

impl Default for OsSupervisor {
    fn default() -> Self {
        Self::new(Duration::from_millis(1500))
    }
}

#[async_trait]
impl ProcessSupervisor for OsSupervisor {
    fn binary_exists(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }

    fn port_is_free(&self, port: u16) -> bool {
        ports::port_is_free(port)
    }

    fn find_free_port(&self, start: u16, end: u16, exclude: &[u16]) -> Result<u16, ProcessError> {
        ports::find_free_port(start, end, exclude)
    }

    async fn kill_process_on_port(&self, port: u16, timeout: Duration) -> Vec<u32> {
        let own = std::process::id();
        let mut killed = Vec::new();
        for pid in ports::listening_pids(port).await {
            if pid == own {
                continue;
            }
            warn!("Killing stale process {} on port {}", pid, port);
            match signals::terminate(pid, timeout).await {
                Ok(_) => killed.push(pid),
                Err(e) => warn!("Could not kill {} on port {}: {}", pid, port, e),
            }
        }
        killed
    }

    async fn spawn(&self, request: SpawnRequest) -> Result<u32, ProcessError> {
        if let Some(parent) = request.log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.log_file)?;
        let log_err = log.try_clone()?;

        debug!("Spawning {} in {}", request.command_line(), request.cwd.display());
        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .envs(&request.env)
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| ProcessError::SpawnFailed {
            program: request.program.clone(),
            message: e.to_string(),
        })?;
        let child_pid = child.id().ok_or_else(|| ProcessError::SpawnFailed {
            program: request.program.clone(),
            message: "exited before a pid was assigned".to_string(),
        })?;

        // Reap the child in the background so it never lingers as a zombie.
        let (exit_tx, mut exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => format!("exited with {}", status),
                Err(e) => format!("wait failed: {}", e),
            };
            debug!("Child {} {}", child_pid, status);
            let _ = exit_tx.send(status);
        });

        tokio::time::sleep(self.spawn_grace).await;
        self.resolve_worker_pid(&request, child_pid, &mut exit_rx).await
    }

    fn is_running(&self, pid: u32) -> bool {
        signals::is_running(pid)
    }

    async fn terminate(&self, pid: u32, timeout: Duration) -> Result<bool, ProcessError> {
        signals::terminate(pid, timeout).await
    }

    async fn health_check(
        &self,
        url: &str,
        auth: &HealthAuth,
        timeout: Duration,
        interval: Duration,
    ) -> HealthReport {
        health::wait_healthy(&self.client, url, auth, timeout, interval).await
    }

    async fn probe(&self, url: &str, auth: &HealthAuth) -> HealthReport {
        health::check_once(&self.client, url, auth).await
    }
}

/// Last `lines` lines of a log file, for error messages.
pub fn log_tail(path: &Path, lines: usize) -> String {
    const MAX_BYTES: u64 = 16 * 1024;

    let Ok(mut file) = std::fs::File::open(path) else {
        return "(no log)".to_string();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if file.seek(SeekFrom::Start(len.saturating_sub(MAX_BYTES))).is_err() {
        return "(unreadable log)".to_string();
    }
    let mut bytes = Vec::new();
    if file.read_to_end(&mut bytes).is_err() {
        return "(unreadable log)".to_string();
    }

    let text = String::from_utf8_lossy(&bytes);
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(temp: &TempDir, program: &str, args: &[&str], port: u16) -> SpawnRequest {
        SpawnRequest {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            cwd: temp.path().to_path_buf(),
            log_file: temp.path().join("logs").join("test.log"),
            port,
            signature: format!("--port {}", port),
        }
    }

    #[test]
    fn test_command_line_omits_env() {
        let temp = TempDir::new().unwrap();
        let mut req = request(&temp, "opencode", &["serve", "--port", "4100"], 4100);
        req.env.insert("OPENCODE_SERVER_PASSWORD".into(), "secret".into());
        let line = req.command_line();
        assert_eq!(line, "opencode serve --port 4100");
        assert!(!line.contains("secret"));
    }

    #[test]
    fn test_log_tail() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.log");
        let content: String = (1..=30).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(&path, content).unwrap();

        let tail = log_tail(&path, 3);
        assert_eq!(tail, "line 28\nline 29\nline 30");
        assert_eq!(log_tail(&temp.path().join("missing.log"), 3), "(no log)");
    }

    #[test]
    fn test_binary_exists() {
        let sup = OsSupervisor::default();
        assert!(sup.binary_exists("sh"));
        assert!(!sup.binary_exists("definitely-not-a-real-binary-4f2a"));
    }

    #[tokio::test]
    async fn test_spawn_long_running_child() {
        let temp = TempDir::new().unwrap();
        let sup = OsSupervisor::new(Duration::from_millis(100));

        let pid = sup
            .spawn(request(&temp, "sleep", &["30"], 1))
            .await
            .unwrap();
        assert!(sup.is_running(pid));

        sup.terminate(pid, Duration::from_secs(5)).await.unwrap();
        assert!(!sup.is_running(pid));
    }

    #[tokio::test]
    async fn test_spawn_failure_includes_log_tail() {
        let temp = TempDir::new().unwrap();
        let sup = OsSupervisor::new(Duration::from_millis(300));

        let err = sup
            .spawn(request(
                &temp,
                "sh",
                &["-c", "echo boom-from-child; exit 3", "--port", "1"],
                1,
            ))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("boom-from-child"), "{}", message);
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let temp = TempDir::new().unwrap();
        let sup = OsSupervisor::new(Duration::from_millis(10));
        let err = sup
            .spawn(request(&temp, "definitely-not-a-real-binary-4f2a", &[], 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::SpawnFailed { .. }));
    }
}
