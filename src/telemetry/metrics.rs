// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process metrics for orchestrator operations.
//!
//! Each named operation (`project.start`, `state.mutate`, ...) keeps a run
//! count, a failure count and coarse latency buckets. A handful of lifecycle
//! events get their own counters. The CLI folds each run's snapshot into
//! `metrics.json` in the fleet home so `agentfleet metrics` reports totals
//! across invocations.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Process-wide metrics.
pub static GLOBAL_METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Upper bounds of the latency buckets in milliseconds. Anything slower
/// lands in a final overflow bucket.
const BUCKET_BOUNDS_MS: [u64; 7] = [10, 100, 1_000, 5_000, 30_000, 60_000, 300_000];

/// Lifecycle events counted on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Processes launched.
    Spawn,
    /// Health checks that timed out.
    HealthFailure,
    /// Stale listeners killed before a start.
    StalePortKill,
    /// RUNNING records corrected because the process was gone.
    OrphanCorrected,
    /// Terminations that needed SIGKILL.
    KillEscalation,
}

#[derive(Debug)]
pub struct Metrics {
    operations: RwLock<BTreeMap<String, OperationStats>>,
    counters: [AtomicU64; 5],
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            operations: RwLock::new(BTreeMap::new()),
            counters: Default::default(),
            start_time: Instant::now(),
        }
    }

    fn counter(&self, counter: Counter) -> &AtomicU64 {
        &self.counters[counter as usize]
    }

    /// Record a run of `name` that succeeded.
    pub fn record_operation(&self, name: &str, duration: Duration) {
        self.record_outcome(name, duration, true);
    }

    pub fn record_outcome(&self, name: &str, duration: Duration, success: bool) {
        let mut ops = self.operations.write().unwrap_or_else(|e| e.into_inner());
        ops.entry(name.to_string())
            .or_default()
            .record(duration, success);
    }

    pub fn increment(&self, counter: Counter) {
        self.counter(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, counter: Counter) -> u64 {
        self.counter(counter).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let operations = self
            .operations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        MetricsSnapshot {
            operations,
            counters: CounterSnapshot {
                spawns: self.count(Counter::Spawn),
                health_failures: self.count(Counter::HealthFailure),
                stale_port_kills: self.count(Counter::StalePortKill),
                orphans_corrected: self.count(Counter::OrphanCorrected),
                kill_escalations: self.count(Counter::KillEscalation),
            },
            uptime_ms: self.start_time.elapsed().as_millis() as u64,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Totals for one named operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperationStats {
    pub runs: u64,
    pub failures: u64,
    pub total_ms: u64,
    pub slowest_ms: u64,
    pub latency: LatencyBuckets,
}

impl OperationStats {
    fn record(&mut self, duration: Duration, success: bool) {
        let ms = duration.as_millis() as u64;
        self.runs += 1;
        self.failures += u64::from(!success);
        self.total_ms += ms;
        self.slowest_ms = self.slowest_ms.max(ms);
        self.latency.record(ms);
    }

    pub fn mean(&self) -> Duration {
        Duration::from_millis(self.total_ms.checked_div(self.runs).unwrap_or(0))
    }

    /// Percentage of runs that failed.
    pub fn failure_percent(&self) -> f64 {
        if self.runs == 0 {
            0.0
        } else {
            self.failures as f64 * 100.0 / self.runs as f64
        }
    }

    fn merge(&mut self, other: &OperationStats) {
        self.runs += other.runs;
        self.failures += other.failures;
        self.total_ms += other.total_ms;
        self.slowest_ms = self.slowest_ms.max(other.slowest_ms);
        self.latency.merge(&other.latency);
    }
}

/// Run counts per latency bucket; see [`BUCKET_BOUNDS_MS`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LatencyBuckets(Vec<u64>);

impl Default for LatencyBuckets {
    fn default() -> Self {
        Self(vec![0; BUCKET_BOUNDS_MS.len() + 1])
    }
}

impl LatencyBuckets {
    fn record(&mut self, ms: u64) {
        let idx = BUCKET_BOUNDS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        if let Some(slot) = self.0.get_mut(idx) {
            *slot += 1;
        }
    }

    /// Bound of the bucket that 99% of runs finished within, or `None` when
    /// they spill into the overflow bucket or nothing ran.
    pub fn p99_bound(&self) -> Option<Duration> {
        let total: u64 = self.0.iter().sum();
        let target = total - total / 100;
        let mut seen = 0;
        for (count, bound) in self.0.iter().zip(BUCKET_BOUNDS_MS) {
            seen += count;
            if total > 0 && seen >= target {
                return Some(Duration::from_millis(bound));
            }
        }
        None
    }

    fn merge(&mut self, other: &LatencyBuckets) {
        // Files written with another bucket layout are not comparable.
        if self.0.len() != other.0.len() {
            return;
        }
        for (mine, theirs) in self.0.iter_mut().zip(&other.0) {
            *mine += theirs;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub spawns: u64,
    pub health_failures: u64,
    pub stale_port_kills: u64,
    pub orphans_corrected: u64,
    pub kill_escalations: u64,
}

/// Everything recorded so far, in the shape of `metrics.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsSnapshot {
    pub operations: BTreeMap<String, OperationStats>,
    pub counters: CounterSnapshot,
    pub uptime_ms: u64,
}

impl MetricsSnapshot {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty() && self.counters == CounterSnapshot::default()
    }

    /// Add another run's totals to these.
    pub fn merge(&mut self, other: &MetricsSnapshot) {
        for (name, stats) in &other.operations {
            self.operations.entry(name.clone()).or_default().merge(stats);
        }
        let c = &mut self.counters;
        c.spawns += other.counters.spawns;
        c.health_failures += other.counters.health_failures;
        c.stale_port_kills += other.counters.stale_port_kills;
        c.orphans_corrected += other.counters.orphans_corrected;
        c.kill_escalations += other.counters.kill_escalations;
        self.uptime_ms += other.uptime_ms;
    }

    /// Text shown by `agentfleet metrics`.
    pub fn format_report(&self) -> String {
        let c = &self.counters;
        let mut lines = vec![
            format!("spawns            {}", c.spawns),
            format!("health failures   {}", c.health_failures),
            format!("stale port kills  {}", c.stale_port_kills),
            format!("orphans corrected {}", c.orphans_corrected),
            format!("SIGKILL needed    {}", c.kill_escalations),
        ];

        if !self.operations.is_empty() {
            lines.push(String::new());
            for (name, stats) in &self.operations {
                let p99 = match stats.latency.p99_bound() {
                    Some(bound) => format!("<= {:?}", bound),
                    None => format!("> {}ms", BUCKET_BOUNDS_MS[BUCKET_BOUNDS_MS.len() - 1]),
                };
                lines.push(format!(
                    "{}: {} runs, {:.1}% failed, mean {:?}, slowest {}ms, p99 {}",
                    name,
                    stats.runs,
                    stats.failure_percent(),
                    stats.mean(),
                    stats.slowest_ms,
                    p99
                ));
            }
        }

        lines.join("\n") + "\n"
    }
}

/// Record an operation outcome on [`GLOBAL_METRICS`].
pub fn record_outcome(name: &str, duration: Duration, success: bool) {
    GLOBAL_METRICS.record_outcome(name, duration, success);
}

/// Bump a counter on [`GLOBAL_METRICS`].
pub fn increment(counter: Counter) {
    GLOBAL_METRICS.increment(counter);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_stats() {
        let mut stats = OperationStats::default();
        stats.record(Duration::from_millis(10), true);
        stats.record(Duration::from_millis(20), true);
        stats.record(Duration::from_millis(30), false);
        stats.record(Duration::from_millis(40), false);

        assert_eq!(stats.runs, 4);
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.slowest_ms, 40);
        assert_eq!(stats.mean(), Duration::from_millis(25));
        assert_eq!(stats.failure_percent(), 50.0);
        assert_eq!(OperationStats::default().mean(), Duration::ZERO);
    }

    #[test]
    fn test_latency_buckets() {
        let mut buckets = LatencyBuckets::default();
        for ms in [5, 50, 2_000, 3_600_000] {
            buckets.record(ms);
        }
        assert_eq!(buckets.0, vec![1, 1, 0, 1, 0, 0, 0, 1]);
    }

    #[test]
    fn test_p99_bound() {
        let mut buckets = LatencyBuckets::default();
        assert_eq!(buckets.p99_bound(), None);

        for _ in 0..100 {
            buckets.record(500);
        }
        assert_eq!(buckets.p99_bound(), Some(Duration::from_secs(1)));

        // A single slow outlier in a hundred runs does not move it.
        buckets.record(20_000);
        assert_eq!(buckets.p99_bound(), Some(Duration::from_secs(1)));

        let mut slow = LatencyBuckets::default();
        slow.record(600_000);
        assert_eq!(slow.p99_bound(), None);
    }

    #[test]
    fn test_counters_and_outcomes() {
        let metrics = Metrics::new();
        assert!(metrics.snapshot().is_empty());

        metrics.increment(Counter::Spawn);
        metrics.increment(Counter::Spawn);
        metrics.increment(Counter::KillEscalation);
        metrics.record_outcome("project.start", Duration::from_millis(100), false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counters.spawns, 2);
        assert_eq!(snapshot.counters.kill_escalations, 1);
        assert_eq!(snapshot.counters.health_failures, 0);
        assert_eq!(snapshot.operations["project.start"].failures, 1);
    }

    #[test]
    fn test_snapshot_merge_and_serde() {
        let a = Metrics::new();
        a.record_operation("project.stop", Duration::from_millis(5));
        a.increment(Counter::OrphanCorrected);
        let b = Metrics::new();
        b.record_operation("project.stop", Duration::from_millis(15));

        let mut total = a.snapshot();
        total.merge(&b.snapshot());
        assert_eq!(total.operations["project.stop"].runs, 2);
        assert_eq!(total.operations["project.stop"].latency.0[..2], [1, 1]);
        assert_eq!(total.counters.orphans_corrected, 1);

        let json = serde_json::to_string(&total).unwrap();
        let back: MetricsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, total);
        assert!(total
            .format_report()
            .contains("project.stop: 2 runs, 0.0% failed"));
    }

    #[test]
    fn test_partial_file_still_loads() {
        let snapshot: MetricsSnapshot =
            serde_json::from_str(r#"{"counters":{"spawns":3,"healthFailures":0,"stalePortKills":0,"orphansCorrected":0,"killEscalations":0}}"#)
                .unwrap();
        assert_eq!(snapshot.counters.spawns, 3);
        assert!(snapshot.operations.is_empty());
    }
}
