// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::tap::DEFAULT_TAP_CAPACITY;

/// The `logging` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Default policy for routes without their own flag and for unmatched
    /// requests
    #[serde(default)]
    pub enabled: bool,

    /// Write one access line per request
    #[serde(default)]
    pub console: bool,

    /// Bytes a tap may hold before its logging side is cut
    #[serde(default = "default_tap_capacity")]
    pub tap_capacity: usize,

    /// Seconds a capture may go without a body chunk before it is cut
    #[serde(default = "default_sink_timeout")]
    pub timeout: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink: Option<SinkConfig>,

    /// Shorthand for `sink: {type: file, dir: ...}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Shorthand for `sink: {type: server, url: ...}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
}

fn default_tap_capacity() -> usize {
    DEFAULT_TAP_CAPACITY
}

fn default_sink_timeout() -> u64 {
    60
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            console: false,
            tap_capacity: default_tap_capacity(),
            timeout: default_sink_timeout(),
            sink: None,
            log_dir: None,
            server_url: None,
        }
    }
}

impl CaptureConfig {
    /// The sink to build. An explicit `sink` wins over the shorthands, and
    /// `server_url` wins over `log_dir`.
    pub fn sink_config(&self) -> SinkConfig {
        if let Some(sink) = &self.sink {
            return sink.clone();
        }
        if let Some(url) = &self.server_url {
            return SinkConfig::Server {
                url: url.clone(),
                timeout: default_push_timeout(),
            };
        }
        if let Some(dir) = &self.log_dir {
            return SinkConfig::File { dir: dir.clone() };
        }
        SinkConfig::default()
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Which sink receives captured traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    File {
        #[serde(default = "default_log_dir")]
        dir: PathBuf,
    },
    Server {
        url: String,
        /// Seconds for connecting to the log server and for each read of its
        /// reply; the upload itself is unbounded
        #[serde(default = "default_push_timeout")]
        timeout: u64,
    },
    Console {
        #[serde(default = "default_preview_bytes")]
        preview_bytes: usize,
    },
    None,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::File {
            dir: default_log_dir(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_push_timeout() -> u64 {
    30
}

fn default_preview_bytes() -> usize {
    4096
}
