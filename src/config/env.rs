// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Environment variable-based configuration provider implementation.
//!
//! `LOGGING_PROXY_SERVER__PORT=9000` becomes `server.port = 9000`. A double
//! underscore separates levels so that single underscores can stay inside
//! key names (`LOGGING_PROXY_LOGGING__TAP_CAPACITY`).

use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::env;

use super::ConfigError;
use super::ConfigProvider;

/// Default prefix for environment overrides.
pub const DEFAULT_ENV_PREFIX: &str = "LOGGING_PROXY_";

/// Configuration provider that retrieves values from environment variables.
#[derive(Debug)]
pub struct EnvConfigProvider {
    prefix: String,
    /// Dot-separated key -> raw string value
    cache: HashMap<String, String>,
}

impl EnvConfigProvider {
    /// Create a provider for every variable starting with `prefix`.
    pub fn new(prefix: &str) -> Self {
        let mut provider = Self {
            prefix: prefix.to_string(),
            cache: HashMap::new(),
        };
        provider.refresh_cache();
        provider
    }

    /// Re-read the process environment.
    pub fn refresh_cache(&mut self) {
        self.cache = env::vars()
            .filter_map(|(key, value)| {
                let rest = key.strip_prefix(&self.prefix)?;
                if rest.is_empty() {
                    return None;
                }
                Some((rest.to_lowercase().replace("__", "."), value))
            })
            .collect();
    }

    /// Parse a string value into a JSON value.
    fn parse_value(value: &str) -> Value {
        if let Ok(json_value) = serde_json::from_str(value) {
            return json_value;
        }
        if value.eq_ignore_ascii_case("true") {
            return json!(true);
        }
        if value.eq_ignore_ascii_case("false") {
            return json!(false);
        }
        json!(value)
    }

    /// Assemble every cached key below `key` into an object.
    fn collect_section(&self, key: &str) -> Option<Value> {
        let prefix = format!("{key}.");
        let mut root = Map::new();

        for (full_key, raw) in &self.cache {
            let Some(rest) = full_key.strip_prefix(&prefix) else {
                continue;
            };
            let mut parts = rest.split('.').peekable();
            let mut node = &mut root;
            while let Some(part) = parts.next() {
                if parts.peek().is_none() {
                    node.insert(part.to_string(), Self::parse_value(raw));
                    break;
                }
                let entry = node
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !entry.is_object() {
                    *entry = Value::Object(Map::new());
                }
                node = match entry {
                    Value::Object(map) => map,
                    _ => break,
                };
            }
        }

        (!root.is_empty()).then_some(Value::Object(root))
    }
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::new(DEFAULT_ENV_PREFIX)
    }
}

impl ConfigProvider for EnvConfigProvider {
    fn has(&self, key: &str) -> bool {
        let prefix = format!("{key}.");
        self.cache.contains_key(key) || self.cache.keys().any(|k| k.starts_with(&prefix))
    }

    fn provider_name(&self) -> &str {
        "env"
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        if let Some(value) = self.cache.get(key) {
            return Ok(Some(Self::parse_value(value)));
        }
        Ok(self.collect_section(key))
    }
}
