// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration subsystem
//!
//! A running proxy is created from an ordered list of [`ConfigProvider`]s;
//! later providers override earlier ones.  The binary stacks them like this:
//!
//! 1. `FileConfigProvider` – `config.{yaml,toml,json}`
//! 2. `EnvConfigProvider`  – `LOGGING_PROXY_SERVER__PORT=9000`
//!
//! First-class keys:
//!
//! | key | type | default | description |
//! |-----|------|---------|-------------|
//! | `server.host`             | string  | `127.0.0.1` | Address to bind |
//! | `server.port`             | u16     | `8080`      | Port to bind |
//! | `server.shutdown_timeout` | seconds | `30`        | Connection drain limit |
//! | `proxy.timeout`           | seconds | `30`        | Wait for upstream headers |
//! | `proxy.connect_timeout`   | seconds | `10`        | Upstream TCP/TLS connect |
//! | `logging`                 | table   | –           | Traffic capture ([`CaptureConfig`]) |
//! | `routes`                  | list/map | –          | Route table ([`RouteConfig`]) |
//! | `diagnostics`             | table   | –           | Own logs ([`DiagnosticsConfig`]) |
//!
//! [`CaptureConfig`]: crate::sink::CaptureConfig
//! [`RouteConfig`]: crate::router::RouteConfig
//! [`DiagnosticsConfig`]: crate::logging::config::DiagnosticsConfig

mod env;
pub mod error;
mod file;


pub use env::EnvConfigProvider;
pub use error::ConfigError;
pub use file::{FileConfigProvider, FileFormat};

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

/// A source of configuration values.
///
/// Object-safe; typed access lives in [`ConfigProviderExt`].
pub trait ConfigProvider: Debug + Send + Sync {
    /// Check if the provider has a value for the given key.
    fn has(&self, key: &str) -> bool;

    /// Name of the provider, used in error messages.
    fn provider_name(&self) -> &str;

    /// Get a raw value by dot-separated key.
    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError>;
}

/// Typed access on top of [`ConfigProvider`].
pub trait ConfigProviderExt: ConfigProvider {
    /// Get a value by key and deserialize it to `T`.
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get_raw(key)? {
            Some(value) => deserialize(key, value).map(Some),
            None => Ok(None),
        }
    }
}

impl<T: ConfigProvider> ConfigProviderExt for T {}

fn deserialize<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, ConfigError> {
    serde_json::from_value(value)
        .map_err(|e| ConfigError::ParseError(format!("failed to deserialize '{key}': {e}")))
}

fn merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

/// Builder for the configuration system.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    providers: Vec<Arc<dyn ConfigProvider>>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider; it overrides every provider added before it.
    pub fn with_provider<P: ConfigProvider + 'static>(mut self, provider: P) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    pub fn with_shared_provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn build(self) -> Config {
        Config {
            providers: self.providers,
        }
    }
}

/// Layered configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    providers: Vec<Arc<dyn ConfigProvider>>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Later providers (higher index) override earlier ones. Objects are
    /// merged key by key so that one env var can override a single field of
    /// a section loaded from file.
    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        let mut merged: Option<Value> = None;
        for provider in &self.providers {
            if !provider.has(key) {
                continue;
            }
            if let Some(value) = provider.get_raw(key)? {
                merged = Some(match merged {
                    Some(base) => merge(base, value),
                    None => value,
                });
            }
        }
        Ok(merged)
    }

    /// Get a value by key from the highest-priority provider that has it.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get_raw(key)? {
            Some(value) => deserialize(key, value).map(Some),
            None => Ok(None),
        }
    }

    /// Get a value by key with a fallback.
    pub fn get_or_default<T: DeserializeOwned>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, ConfigError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Names of the providers, lowest priority first.
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.provider_name()).collect()
    }

    /// Configuration backed by a single file.
    pub fn default_file(file_path: &str) -> Result<Self, ConfigError> {
        let provider = FileConfigProvider::new(file_path)?;
        Ok(Self::builder().with_provider(provider).build())
    }
}
