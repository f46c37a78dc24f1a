// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging setup shared by the daemon binary and its tests.

use tracing_subscriber::EnvFilter;

/// CLI log level enum for clap integration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl CliLogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            CliLogLevel::Error => "error",
            CliLogLevel::Warn => "warn",
            CliLogLevel::Info => "info",
            CliLogLevel::Debug => "debug",
            CliLogLevel::Trace => "trace",
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_directive())
    }
}

/// Initialize the global subscriber. `RUST_LOG` wins over the CLI level.
pub fn init(level: CliLogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}
