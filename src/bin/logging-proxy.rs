// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stand-alone logging proxy.
//!
//!  Usage: `logging-proxy [config.yaml]`
//!  Without an argument the binary honours LOGGING_PROXY_CONFIG_FILE and
//!  falls back to ./config.yaml. LOGGING_PROXY_* variables override the file.

use logging_proxy::{LoggingProxy, info_fmt};
use std::env;
use std::path::Path;
use std::process::ExitCode;

const DEFAULT_CONFIG_FILE: &str = "config.yaml";

#[tokio::main]
async fn main() -> ExitCode {
    let explicit = env::args()
        .nth(1)
        .or_else(|| env::var("LOGGING_PROXY_CONFIG_FILE").ok());

    let mut loader = LoggingProxy::loader().with_env_vars();
    match explicit {
        Some(path) => {
            println!("Using configuration from {path}");
            loader = loader.with_config_file(&path);
        }
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            println!("Using configuration from {DEFAULT_CONFIG_FILE}");
            loader = loader.with_config_file(DEFAULT_CONFIG_FILE);
        }
        None => {
            println!("No {DEFAULT_CONFIG_FILE} found; configuring from environment only");
        }
    }

    let proxy = match loader.build() {
        Ok(proxy) => proxy,
        Err(e) => {
            eprintln!("Failed to build proxy: {e}");
            return ExitCode::FAILURE;
        }
    };

    match proxy.start().await {
        Ok(()) => {
            info_fmt!("Startup", "Proxy server stopped gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Proxy server failed: {e}");
            ExitCode::FAILURE
        }
    }
}
