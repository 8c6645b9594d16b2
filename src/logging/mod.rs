// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Diagnostic logging for the proxy process.
//!
//! This is the proxy's *own* log output (startup, warnings, access lines).
//! Captured traffic goes through [`crate::sink`] instead.
//!
//! Everything is written through the `log` facade. The backend is either
//! `env_logger` or, when `diagnostics.structured` is set, an `slog` drain
//! reached through the `slog_stdlog` bridge.

pub mod config;
pub mod structured;
#[macro_use]
pub mod wrapper;


use log::{info, LevelFilter};
use once_cell::sync::OnceCell;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

use self::config::DiagnosticsConfig;
use self::structured::LoggerGuard;

static INIT: Once = Once::new();
static USING_STRUCTURED: AtomicBool = AtomicBool::new(false);
static GLOBAL_GUARD: OnceCell<LoggerGuard> = OnceCell::new();

/// Initialise plain `env_logger` output at the given level.
///
/// Only the first call in a process has an effect.
pub fn init(level: Option<LevelFilter>) {
    init_with_config(level.unwrap_or(LevelFilter::Info), &DiagnosticsConfig::default());
}

/// Initialise logging from a [`DiagnosticsConfig`].
///
/// `RUST_LOG` still wins over `level` for the `env_logger` backend.
pub fn init_with_config(level: LevelFilter, config: &DiagnosticsConfig) {
    INIT.call_once(|| {
        if config.structured {
            let logger_config = config.to_logger_config();
            let guard = structured::init_global_logger(&logger_config);
            let _ = GLOBAL_GUARD.set(guard);

            if slog_stdlog::init_with_level(level.to_level().unwrap_or(log::Level::Info)).is_ok() {
                USING_STRUCTURED.store(true, Ordering::SeqCst);
            }
        } else {
            let env = env_logger::Env::default().filter_or("RUST_LOG", level_name(level));
            let _ = env_logger::Builder::from_env(env)
                .format_timestamp_millis()
                .format_target(true)
                .try_init();
        }

        info!("Logging initialized at level: {}", log::max_level());
    });
}

/// Whether the slog backend is active.
pub fn is_structured() -> bool {
    USING_STRUCTURED.load(Ordering::SeqCst)
}

/// Parse a textual level, falling back to `Info`.
pub fn parse_level(level: &str) -> LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

fn level_name(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Trace => "trace",
        LevelFilter::Debug => "debug",
        LevelFilter::Info => "info",
        LevelFilter::Warn => "warn",
        LevelFilter::Error => "error",
        LevelFilter::Off => "off",
    }
}
