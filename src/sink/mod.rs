// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging sinks.
//!
//! A sink receives one [`RawMessage`] per captured request and one per
//! captured response. It owns the message and must read it to the end (or
//! drop it): the tee feeding the message only releases buffer space as the
//! sink consumes it.
//!
//! Sinks are chosen once at startup from the `logging.sink` section; see
//! [`CaptureConfig`].

mod config;
mod console;
mod file;
mod push;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::capture::{RawMessage, RequestMetadata, StreamKind};

pub use config::{CaptureConfig, SinkConfig};
pub use console::ConsoleSink;
pub use file::{FileRecord, FileSink};
pub use push::PushSink;

/// Errors raised while handing a message to a sink.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Reading the captured body failed (tap overflow, upstream read error)
    #[error("captured body unavailable: {0}")]
    Body(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("log server at {url} answered {status}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid sink configuration: {0}")]
    Config(String),
}

/// Destination for captured traffic.
#[async_trait]
pub trait LogSink: fmt::Debug + Send + Sync {
    /// Human-readable sink name for startup logs.
    fn name(&self) -> &str;

    /// Consume one captured message.
    async fn log_stream(
        &self,
        kind: StreamKind,
        metadata: &RequestMetadata,
        timestamp: DateTime<Utc>,
        message: RawMessage,
    ) -> Result<(), SinkError>;

    async fn log_request(
        &self,
        metadata: &RequestMetadata,
        timestamp: DateTime<Utc>,
        message: RawMessage,
    ) -> Result<(), SinkError> {
        self.log_stream(StreamKind::Request, metadata, timestamp, message).await
    }

    async fn log_response(
        &self,
        metadata: &RequestMetadata,
        timestamp: DateTime<Utc>,
        message: RawMessage,
    ) -> Result<(), SinkError> {
        self.log_stream(StreamKind::Response, metadata, timestamp, message).await
    }
}

/// Sink that drains and discards everything.
#[derive(Debug, Default, Clone)]
pub struct NoopSink;

#[async_trait]
impl LogSink for NoopSink {
    fn name(&self) -> &str {
        "none"
    }

    async fn log_stream(
        &self,
        _kind: StreamKind,
        _metadata: &RequestMetadata,
        _timestamp: DateTime<Utc>,
        message: RawMessage,
    ) -> Result<(), SinkError> {
        let mut stream = message.into_stream();
        while let Some(chunk) = stream.next().await {
            chunk.map_err(SinkError::Body)?;
        }
        Ok(())
    }
}

/// Build the sink described by `config`.
pub fn from_config(config: &SinkConfig) -> Result<Arc<dyn LogSink>, SinkError> {
    let sink: Arc<dyn LogSink> = match config {
        SinkConfig::None => Arc::new(NoopSink),
        SinkConfig::File { dir } => Arc::new(FileSink::new(dir)?),
        SinkConfig::Server { url, timeout } => {
            Arc::new(PushSink::new(url, std::time::Duration::from_secs(*timeout))?)
        }
        SinkConfig::Console { preview_bytes } => Arc::new(ConsoleSink::new(*preview_bytes)),
    };
    log::debug!("Created {} log sink", sink.name());
    Ok(sink)
}
