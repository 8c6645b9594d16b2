// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::io::Write;

use super::{LogSink, SinkError};
use crate::capture::{RawMessage, RequestMetadata, StreamKind};

/// Prints a preview of each captured message to stdout.
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    preview_bytes: usize,
}

impl ConsoleSink {
    pub fn new(preview_bytes: usize) -> Self {
        Self { preview_bytes }
    }

    /// Text printed for one message. `preview` holds at most
    /// `preview_bytes` of the `total` bytes seen.
    pub fn format_entry(
        &self,
        kind: StreamKind,
        metadata: &RequestMetadata,
        timestamp: &DateTime<Utc>,
        preview: &[u8],
        total: u64,
    ) -> String {
        let mut out = format!(
            "===== {} {} {} {} @ {} =====\n",
            kind,
            metadata.short_id(),
            metadata.method,
            metadata.source_url,
            timestamp.to_rfc3339()
        );
        out.push_str(&String::from_utf8_lossy(preview));
        if !out.ends_with('\n') {
            out.push('\n');
        }
        let hidden = total.saturating_sub(preview.len() as u64);
        if hidden > 0 {
            out.push_str(&format!("... ({hidden} more bytes)\n"));
        }
        out
    }
}

#[async_trait]
impl LogSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn log_stream(
        &self,
        kind: StreamKind,
        metadata: &RequestMetadata,
        timestamp: DateTime<Utc>,
        message: RawMessage,
    ) -> Result<(), SinkError> {
        let mut stream = message.into_stream();
        let mut preview = Vec::with_capacity(self.preview_bytes.min(64 * 1024));
        let mut total = 0u64;
        let mut outcome = Ok(());

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    let room = self.preview_bytes.saturating_sub(preview.len());
                    preview.extend_from_slice(&chunk[..room.min(chunk.len())]);
                    total += chunk.len() as u64;
                }
                Err(err) => {
                    outcome = Err(SinkError::Body(err));
                    break;
                }
            }
        }

        let entry = self.format_entry(kind, metadata, &timestamp, &preview, total);
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(entry.as_bytes())?;
        stdout.flush()?;
        outcome
    }
}
