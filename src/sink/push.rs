// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sink that streams each captured message to a log server.
//!
//! Wire contract: `PUT {base}/{request id}/{request|response}` with the raw
//! message as an `application/octet-stream` body. `200` and `201` are
//! success.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

use super::{LogSink, SinkError};
use crate::capture::{RawMessage, RequestMetadata, StreamKind};

#[derive(Debug, Clone)]
pub struct PushSink {
    base_url: String,
    client: reqwest::Client,
}

impl PushSink {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SinkError> {
        let parsed = reqwest::Url::parse(base_url)
            .map_err(|e| SinkError::Config(format!("log server url '{base_url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SinkError::Config(format!(
                "log server url '{base_url}' must be http or https"
            )));
        }

        // No total timeout; an upload lasts as long as the captured stream.
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Target URL for one message.
    pub fn url_for(&self, id: &str, kind: StreamKind) -> String {
        format!("{}/{}/{}", self.base_url, id, kind)
    }
}

#[async_trait]
impl LogSink for PushSink {
    fn name(&self) -> &str {
        "server"
    }

    async fn log_stream(
        &self,
        kind: StreamKind,
        metadata: &RequestMetadata,
        _timestamp: DateTime<Utc>,
        message: RawMessage,
    ) -> Result<(), SinkError> {
        let url = self.url_for(&metadata.id, kind);
        let body = reqwest::Body::wrap_stream(message.into_stream());

        let response = self
            .client
            .put(&url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                debug_fmt!(metadata.short_id(), "Pushed {} to {}", kind, url);
                Ok(())
            }
            status => Err(SinkError::UnexpectedStatus {
                url,
                status: status.as_u16(),
            }),
        }
    }
}
