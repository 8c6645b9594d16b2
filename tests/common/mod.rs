// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared helpers for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};
use logging_proxy::config::{Config, FileConfigProvider, FileFormat};
use logging_proxy::sink::LogSink;
use logging_proxy::{LoggingProxy, RawMessage, RequestMetadata, SinkError, StreamKind};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// One message captured by [`RecordingSink`].
#[derive(Debug, Clone)]
pub struct Captured {
    pub kind: StreamKind,
    pub metadata: RequestMetadata,
    pub bytes: Vec<u8>,
}

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Bytes after the blank line that ends the head.
    pub fn body(&self) -> &[u8] {
        let at = self
            .bytes
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("message has no head terminator");
        &self.bytes[at + 4..]
    }

    pub fn head(&self) -> String {
        let len = self.bytes.len() - self.body().len();
        String::from_utf8_lossy(&self.bytes[..len]).into_owned()
    }
}

/// Sink that keeps every message in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    entries: Mutex<Vec<Captured>>,
    delay: Option<Duration>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A sink that sleeps between chunks, to simulate a slow consumer.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            delay: Some(delay),
        })
    }

    pub fn entries(&self) -> Vec<Captured> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Wait until at least `count` messages arrived.
    pub async fn wait_for(&self, count: usize) -> Vec<Captured> {
        for _ in 0..500 {
            let entries = self.entries();
            if entries.len() >= count {
                return entries;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} captured messages, got {}", self.count());
    }

    pub fn find(&self, kind: StreamKind) -> Captured {
        self.entries()
            .into_iter()
            .find(|c| c.kind == kind)
            .unwrap_or_else(|| panic!("no {kind} captured"))
    }
}

#[async_trait]
impl LogSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn log_stream(
        &self,
        kind: StreamKind,
        metadata: &RequestMetadata,
        _timestamp: DateTime<Utc>,
        message: RawMessage,
    ) -> Result<(), SinkError> {
        use futures_util::StreamExt;

        let mut stream = message.into_stream();
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            bytes.extend_from_slice(&chunk.map_err(SinkError::Body)?);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
        }

        self.entries.lock().unwrap().push(Captured {
            kind,
            metadata: metadata.clone(),
            bytes,
        });
        Ok(())
    }
}

/// A proxy serving on an ephemeral port.
pub struct TestProxy {
    pub addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestProxy {
    /// Build from YAML and serve with `sink`.
    pub async fn start(yaml: &str, sink: Arc<dyn LogSink>) -> Self {
        let provider = FileConfigProvider::from_content(yaml, FileFormat::Yaml).unwrap();
        let config = Config::builder().with_provider(provider).build();
        let proxy = LoggingProxy::loader()
            .with_config(config)
            .with_sink(sink)
            .build()
            .unwrap();
        Self::serve(proxy).await
    }

    /// Build from YAML with the sink described in the YAML.
    pub async fn start_configured(yaml: &str) -> Self {
        let provider = FileConfigProvider::from_content(yaml, FileFormat::Yaml).unwrap();
        let config = Config::builder().with_provider(provider).build();
        let proxy = LoggingProxy::loader().with_config(config).build().unwrap();
        Self::serve(proxy).await
    }

    async fn serve(proxy: LoggingProxy) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let shutdown = async {
                let _ = stopped.await;
            };
            proxy.serve(listener, shutdown).await.unwrap();
        });

        Self {
            addr,
            stop: Some(stop),
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut self.handle).await;
    }
}

/// HTTP client that talks to the proxy directly and leaves bodies alone.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn brotli(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
        writer.write_all(data).unwrap();
    }
    out
}
