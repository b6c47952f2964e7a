// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Subscriber setup for the CLI.
//!
//! Logs always go to stderr so `--json` output on stdout stays parseable.

use std::io::{self, IsTerminal};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// How much context each log line carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStyle {
    /// Level and message.
    Compact,
    /// Adds target, file and line, and logs span closes with their timings.
    Verbose,
}

/// Configuration for telemetry initialization.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Level for this crate when neither RUST_LOG nor a directive is set.
    pub default_level: Level,
    pub style: LogStyle,
    pub ansi_colors: bool,
    /// Filter directive used when RUST_LOG is unset.
    pub filter_directive: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_level: Level::WARN,
            style: LogStyle::Compact,
            ansi_colors: io::stderr().is_terminal(),
            filter_directive: None,
        }
    }
}

impl TelemetryConfig {
    /// Debug level with span timings, for `--debug`.
    pub fn development() -> Self {
        Self {
            default_level: Level::DEBUG,
            style: LogStyle::Verbose,
            ..Self::default()
        }
    }

    /// Warnings and errors only, never colored. For supervised runs whose
    /// stderr goes to a file.
    pub fn production() -> Self {
        Self {
            ansi_colors: false,
            ..Self::default()
        }
    }

    /// Everything from this crate.
    pub fn testing() -> Self {
        Self {
            default_level: Level::TRACE,
            style: LogStyle::Verbose,
            ansi_colors: false,
            filter_directive: Some("agentfleet=trace".to_string()),
        }
    }

    /// Preset for the CLI's `-v` / `--debug` flags.
    pub fn for_cli(verbose: bool, debug: bool) -> Self {
        match (verbose, debug) {
            (_, true) => Self::development(),
            (true, false) => Self::default().with_level(Level::INFO),
            (false, false) => Self::default(),
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_directive = Some(filter.into());
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi_colors = ansi;
        self
    }

    /// Filter directive this config resolves to when RUST_LOG is unset.
    ///
    /// Dependencies (reqwest, hyper) stay at warn whatever our level is.
    pub fn directive(&self) -> String {
        self.filter_directive.clone().unwrap_or_else(|| {
            format!("warn,agentfleet={}", self.default_level.as_str().to_lowercase())
        })
    }
}

/// Guard returned by [`init_telemetry`]. Keep it alive for the program's lifetime.
pub struct TelemetryGuard {
    _private: (),
}

/// Install the global subscriber.
///
/// RUST_LOG, when set and valid, wins over the config. Fails if a subscriber
/// is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> io::Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directive()))
        .unwrap_or_else(|_| EnvFilter::new(config.default_level.as_str()));

    let verbose = config.style == LogStyle::Verbose;
    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(config.ansi_colors)
        .with_target(verbose)
        .with_file(verbose)
        .with_line_number(verbose)
        .with_span_events(if verbose { FmtSpan::CLOSE } else { FmtSpan::NONE });

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.style {
        LogStyle::Compact => registry.with(fmt_layer.compact()).try_init(),
        LogStyle::Verbose => registry.with(fmt_layer).try_init(),
    };
    result.map_err(|e| io::Error::other(e.to_string()))?;

    Ok(TelemetryGuard { _private: () })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_quiet() {
        let config = TelemetryConfig::default();
        assert_eq!(config.default_level, Level::WARN);
        assert_eq!(config.style, LogStyle::Compact);
        assert_eq!(config.directive(), "warn,agentfleet=warn");
    }

    #[test]
    fn test_cli_presets() {
        assert_eq!(TelemetryConfig::for_cli(true, false).default_level, Level::INFO);
        let debug = TelemetryConfig::for_cli(true, true);
        assert_eq!(debug.default_level, Level::DEBUG);
        assert_eq!(debug.style, LogStyle::Verbose);
        assert_eq!(debug.directive(), "warn,agentfleet=debug");
    }

    #[test]
    fn test_production_never_colors() {
        assert!(!TelemetryConfig::production().ansi_colors);
        assert!(!TelemetryConfig::production().with_ansi(false).ansi_colors);
    }

    #[test]
    fn test_explicit_filter_wins() {
        assert_eq!(TelemetryConfig::testing().directive(), "agentfleet=trace");
        let config = TelemetryConfig::default().with_filter("agentfleet::process=trace");
        assert_eq!(config.directive(), "agentfleet::process=trace");
    }
}
