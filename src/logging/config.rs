// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration for diagnostic logging (the `diagnostics` section).

use crate::logging::structured::{LogFormat, LoggerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Diagnostic logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Log level
    #[serde(default = "default_level")]
    pub level: String,

    /// Whether to use structured logging
    #[serde(default)]
    pub structured: bool,

    /// Log format (terminal or json), structured mode only
    #[serde(default = "default_format")]
    pub format: String,

    /// Static fields to include in all structured records
    #[serde(default)]
    pub static_fields: HashMap<String, String>,
}

fn default_format() -> String {
    "terminal".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            structured: false,
            format: default_format(),
            static_fields: HashMap::new(),
        }
    }
}

impl DiagnosticsConfig {
    /// Convert to logger config
    pub fn to_logger_config(&self) -> LoggerConfig {
        let mut static_fields: Vec<(String, String)> = self
            .static_fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        static_fields.sort();

        LoggerConfig {
            format: match self.format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Terminal,
            },
            level: match self.level.to_lowercase().as_str() {
                "trace" => slog::Level::Trace,
                "debug" => slog::Level::Debug,
                "warn" | "warning" => slog::Level::Warning,
                "error" => slog::Level::Error,
                "critical" => slog::Level::Critical,
                _ => slog::Level::Info,
            },
            static_fields,
        }
    }
}
