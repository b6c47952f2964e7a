// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Liveness checks and termination.

use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::ProcessError;

/// How often `terminate` re-checks a signalled process.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait after SIGKILL before giving up.
const KILL_WAIT: Duration = Duration::from_secs(1);

fn to_pid(pid: u32) -> Option<Pid> {
    // 0 and negative values address process groups, never a single process.
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

/// Whether `pid` names a live, non-zombie process.
pub fn is_running(pid: u32) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };
    let alive = match signal::kill(target, None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // Exists but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    };
    alive && !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| parse_stat_state(&stat))
        .map(|state| state == 'Z' || state == 'X')
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Process state letter from a `/proc/<pid>/stat` line.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so the state is read after the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat_state(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().next()?.chars().next()
}

/// Send `sig` to `pid`, or to its whole process group when it leads one.
fn send(pid: u32, sig: Signal) -> Result<(), ProcessError> {
    let Some(target) = to_pid(pid) else {
        return Ok(());
    };
    let leads_group = nix::unistd::getpgid(Some(target))
        .map(|pgid| pgid == target)
        .unwrap_or(false);

    let result = if leads_group {
        signal::killpg(target, sig).or_else(|_| signal::kill(target, sig))
    } else {
        signal::kill(target, sig)
    };

    match result {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::Signal {
            pid,
            message: format!("{:?}: {}", sig, e),
        }),
    }
}

async fn wait_for_exit(pid: u32, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        if !is_running(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Stop `pid`: SIGTERM, wait up to `timeout`, then SIGKILL.
///
/// Returns `true` when escalation to SIGKILL was needed. A pid that is
/// already gone is a successful no-op.
pub async fn terminate(pid: u32, timeout: Duration) -> Result<bool, ProcessError> {
    if !is_running(pid) {
        debug!("Process {} already gone", pid);
        return Ok(false);
    }

    send(pid, Signal::SIGTERM)?;
    if wait_for_exit(pid, timeout).await {
        debug!("Process {} exited after SIGTERM", pid);
        return Ok(false);
    }

    warn!("Process {} ignored SIGTERM for {:?}, sending SIGKILL", pid, timeout);
    send(pid, Signal::SIGKILL)?;
    if wait_for_exit(pid, KILL_WAIT).await {
        Ok(true)
    } else {
        Err(ProcessError::Signal {
            pid,
            message: "still alive after SIGKILL".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_pids_are_not_running() {
        assert!(!is_running(0));
        assert!(!is_running(u32::MAX));
    }

    #[test]
    fn test_own_process_is_running() {
        assert!(is_running(std::process::id()));
    }

    #[test]
    fn test_parse_stat_state() {
        assert_eq!(parse_stat_state("1234 (opencode) S 1 1234"), Some('S'));
        assert_eq!(parse_stat_state("1234 (weird) name)) Z 1 1234"), Some('Z'));
        assert_eq!(parse_stat_state("garbage"), None);
    }

    #[tokio::test]
    async fn test_terminate_missing_process_is_noop() {
        // Spawn and reap a short-lived child so its pid is known to be gone.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!terminate(pid, Duration::from_millis(200)).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminate_sleeping_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let reaper = tokio::spawn(async move { child.wait().await });

        let escalated = terminate(pid, Duration::from_secs(5)).await.unwrap();
        assert!(!escalated);
        assert!(reaper.await.unwrap().is_ok());
        assert!(!is_running(pid));
    }
}
