// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tracing and metrics.
//!
//! - **Tracing**: structured logs to stderr, `#[instrument]` spans on the
//!   public orchestrator operations keyed by project
//! - **Metrics**: per-operation latency and lifecycle counters
//!
//! # Usage
//!
//! ```rust,ignore
//! use agentfleet::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::for_cli(verbose, debug))?;
//! ```
//!
//! Record fields that identify the project (key, port, pid), never
//! credentials.

mod init;
pub mod metrics;

pub use init::{init_telemetry, LogStyle, TelemetryConfig, TelemetryGuard};
pub use metrics::{
    Counter, CounterSnapshot, LatencyBuckets, Metrics, MetricsSnapshot, OperationStats,
    GLOBAL_METRICS,
};
