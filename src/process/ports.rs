// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Port allocation and listener discovery.

use std::net::{Ipv4Addr, TcpListener};
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use super::ProcessError;

/// Whether nothing is listening on `port` on the loopback interface.
pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// First free port in `start..=end`, skipping anything in `exclude`.
///
/// `exclude` carries ports already assigned to other projects, which may be
/// stopped right now but expect to get their port back.
pub fn find_free_port(start: u16, end: u16, exclude: &[u16]) -> Result<u16, ProcessError> {
    (start..=end)
        .filter(|p| !exclude.contains(p))
        .find(|p| port_is_free(*p))
        .ok_or(ProcessError::NoFreePort { start, end })
}

/// PIDs with a TCP listener on `port`, via `lsof`.
///
/// Returns an empty list when `lsof` is unavailable.
pub async fn listening_pids(port: u16) -> Vec<u32> {
    let output = Command::new("lsof")
        .args(["-nP", "-t", &format!("-iTCP:{}", port), "-sTCP:LISTEN"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) => parse_pid_lines(&String::from_utf8_lossy(&output.stdout)),
        Err(e) => {
            debug!("lsof unavailable: {}", e);
            Vec::new()
        }
    }
}

/// PIDs whose full command line matches `pattern`, via `pgrep -f`.
pub async fn pids_matching(pattern: &str) -> Vec<u32> {
    let output = Command::new("pgrep")
        .args(["-f", "--", pattern])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await;

    let own = std::process::id();
    match output {
        Ok(output) => parse_pid_lines(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .filter(|pid| *pid != own)
            .collect(),
        Err(e) => {
            debug!("pgrep unavailable: {}", e);
            Vec::new()
        }
    }
}

fn parse_pid_lines(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .filter(|pid| *pid > 0)
        .collect();
    pids.dedup();
    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_port_is_not_free() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!port_is_free(port));
        drop(listener);
    }

    #[test]
    fn test_find_free_port_skips_bound_and_excluded() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();

        // A range of one busy port has nothing to offer.
        let err = find_free_port(busy, busy, &[]).unwrap_err();
        assert!(matches!(err, ProcessError::NoFreePort { .. }));

        // Excluding the only candidate fails the same way even if it is free.
        drop(listener);
        assert!(find_free_port(busy, busy, &[busy]).is_err());
    }

    #[test]
    fn test_parse_pid_lines() {
        assert_eq!(parse_pid_lines("123\n456\n\nabc\n0\n"), vec![123, 456]);
        assert!(parse_pid_lines("").is_empty());
    }
}
