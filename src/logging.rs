// ABOUTME: Logging configuration and structured logging setup for observability
// ABOUTME: Configures level, format, and output destination from the environment
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Links HQ

//! Structured logging setup.
//!
//! Production deployments log JSON; development defaults to the pretty
//! formatter. Level filtering honors `RUST_LOG`.

use crate::constants::service;
use anyhow::Result;
use std::env;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON lines for production log shippers
    Json,
    /// Human-oriented output for development
    Pretty,
    /// Single-line output for space-constrained environments
    Compact,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level filter directive, e.g. `info` or `link_broker=debug`
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Include file/line locations
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Pretty,
            include_location: false,
        }
    }
}

impl LoggingConfig {
    /// Build from `RUST_LOG` / `LOG_FORMAT`
    #[must_use]
    pub fn from_env() -> Self {
        let level = env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
        let format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("compact") => LogFormat::Compact,
            _ => LogFormat::Pretty,
        };
        Self {
            level,
            format,
            include_location: false,
        }
    }

    /// Install the global subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if the level directive does not parse or a global
    /// subscriber is already installed.
    pub fn init(&self) -> Result<()> {
        let filter = EnvFilter::try_new(&self.level)?;

        match self.format {
            LogFormat::Json => {
                let layer = fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_file(self.include_location)
                    .with_line_number(self.include_location);
                tracing_subscriber::registry().with(filter).with(layer).try_init()?;
            }
            LogFormat::Pretty => {
                let layer = fmt::layer()
                    .with_target(true)
                    .with_file(self.include_location)
                    .with_line_number(self.include_location);
                tracing_subscriber::registry().with(filter).with(layer).try_init()?;
            }
            LogFormat::Compact => {
                let layer = fmt::layer().compact();
                tracing_subscriber::registry().with(filter).with(layer).try_init()?;
            }
        }

        tracing::info!(
            service = service::NAME,
            version = env!("CARGO_PKG_VERSION"),
            "logging initialized"
        );
        Ok(())
    }
}
