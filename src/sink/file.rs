// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sink writing one `.bin` file per captured message plus a JSON sidecar.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::{LogSink, SinkError};
use crate::capture::{RawMessage, RequestMetadata, StreamKind};

/// Contents of a `*_metadata.json` sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub stream_type: StreamKind,
    pub metadata: RequestMetadata,
    pub timestamp: DateTime<Utc>,
    pub filename: String,
    pub byte_count: u64,
}

#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    /// Create the sink, creating `dir` if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, SinkError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stem(kind: StreamKind, metadata: &RequestMetadata, timestamp: &DateTime<Utc>) -> String {
        format!(
            "{}_{}_{}",
            timestamp.format("%Y-%m-%d_%H-%M-%S%.3f"),
            metadata.short_id(),
            kind
        )
    }
}

#[async_trait]
impl LogSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn log_stream(
        &self,
        kind: StreamKind,
        metadata: &RequestMetadata,
        timestamp: DateTime<Utc>,
        message: RawMessage,
    ) -> Result<(), SinkError> {
        let stem = Self::stem(kind, metadata, &timestamp);
        let filename = format!("{stem}.bin");
        let mut file = tokio::fs::File::create(self.dir.join(&filename)).await?;

        let mut stream = message.into_stream();
        let mut byte_count = 0u64;
        let mut outcome = Ok(());
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    file.write_all(&chunk).await?;
                    byte_count += chunk.len() as u64;
                }
                Err(err) => {
                    outcome = Err(SinkError::Body(err));
                    break;
                }
            }
        }
        drop(stream);
        file.flush().await?;

        // A truncated capture still gets its sidecar so the partial file is
        // traceable.
        let record = FileRecord {
            stream_type: kind,
            metadata: metadata.clone(),
            timestamp,
            filename: filename.clone(),
            byte_count,
        };
        let sidecar = self.dir.join(format!("{stem}_metadata.json"));
        let json = serde_json::to_vec_pretty(&record)?;
        if let Err(e) = tokio::fs::write(&sidecar, json).await {
            warn_fmt!(metadata.short_id(), "Failed to save metadata {}: {}", sidecar.display(), e);
        }

        info_fmt!(
            metadata.short_id(),
            "Saved {} ({} bytes) -> {}",
            kind,
            byte_count,
            filename
        );
        outcome
    }
}
