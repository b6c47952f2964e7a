// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process supervision for agent instances and the shared router.
//!
//! - [`ports`] - free-port search and listener discovery
//! - [`signals`] - liveness checks and graceful termination
//! - [`health`] - HTTP health polling
//! - [`supervisor`] - the [`ProcessSupervisor`] seam and its OS implementation

pub mod health;
pub mod ports;
pub mod signals;
pub mod supervisor;

pub use health::{HealthAuth, HealthReport};
pub use supervisor::{OsSupervisor, ProcessSupervisor, SpawnRequest};

/// Errors from process supervision.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Binary not found on PATH: {0}")]
    BinaryNotFound(String),

    #[error("No free port in range {start}-{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("Port {0} is still in use")]
    PortInUse(u16),

    #[error("Failed to spawn {program}: {message}")]
    SpawnFailed { program: String, message: String },

    #[error("Health check for {url} failed after {elapsed_ms}ms: {last_message}")]
    HealthTimeout {
        url: String,
        elapsed_ms: u64,
        last_message: String,
    },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("Failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
