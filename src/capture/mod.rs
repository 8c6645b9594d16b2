// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Captured-message model.
//!
//! A [`RawMessage`] is an HTTP/1.1-shaped byte stream rebuilt for a sink:
//!
//! ```text
//! POST https://backend/v1/chat HTTP/1.1\r\n
//! content-type: application/json\r\n
//! X-Proxy-Path: http://proxy:8080/api/v1/chat\r\n
//! \r\n
//! {"decoded":"body"}
//! ```
//!
//! The head is rendered up front; the body is streamed in as it flows
//! through the proxy and is decoded on the way if it was compressed.


use bytes::Bytes;
use futures_util::Stream;
use futures_util::stream::{self, StreamExt};
use hyper::header::{CONTENT_ENCODING, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::{HeaderMap, Method, StatusCode, Version};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::decode::{self, ByteStream, DECODE_ERROR_HEADER, DecodeError};

/// Header carrying the inbound URL on captured requests.
pub const PROXY_PATH_HEADER: &str = "X-Proxy-Path";

/// Per-request facts shared by the request and response captures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub id: String,
    pub matched_pattern: String,
    pub method: String,
    pub source_url: String,
    pub destination_url: String,
    pub request_content_encoding: String,
    pub response_content_encoding: String,
}

impl RequestMetadata {
    /// Fresh metadata with a random v4 id.
    pub fn new(method: &Method, source_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            matched_pattern: String::new(),
            method: method.to_string(),
            source_url: source_url.into(),
            destination_url: String::new(),
            request_content_encoding: String::new(),
            response_content_encoding: String::new(),
        }
    }

    /// First eight characters of the id, used in file names and log lines.
    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }
}

/// Which half of an exchange a message holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Request,
    Response,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Request => "request",
            StreamKind::Response => "response",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconstructed HTTP message handed to a sink.
///
/// Whoever receives it must drive it to the end (or drop it); the body side
/// of the tee only frees buffer space as this stream is read.
pub struct RawMessage {
    stream: ByteStream,
}

impl RawMessage {
    pub fn new(head: Bytes, body: Option<ByteStream>) -> Self {
        let head = stream::once(async move { Ok::<_, io::Error>(head) });
        let stream = match body {
            Some(body) => head.chain(body).boxed(),
            None => head.boxed(),
        };
        Self { stream }
    }

    /// A message whose body is already in memory.
    pub fn from_parts(head: Bytes, body: Bytes) -> Self {
        let body = stream::once(async move { Ok::<_, io::Error>(body) }).boxed();
        Self::new(head, Some(body))
    }

    pub fn into_stream(self) -> ByteStream {
        self.stream
    }

    /// End the message with a `TimedOut` error once no chunk has arrived
    /// for `limit`. Total duration is unbounded, so long-lived streams are
    /// captured in full as long as they keep moving.
    pub fn with_idle_timeout(self, limit: Duration) -> Self {
        let stream = stream::unfold(Some(self.stream), move |state| async move {
            let mut stream = state?;
            match tokio::time::timeout(limit, stream.next()).await {
                Ok(Some(item)) => Some((item, Some(stream))),
                Ok(None) => None,
                Err(_) => {
                    let err = io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no body data for {limit:?}; capture cut"),
                    );
                    Some((Err(err), None))
                }
            }
        })
        .boxed();
        Self { stream }
    }

    /// Read the whole message into memory.
    pub async fn collect(mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

impl fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMessage").finish_non_exhaustive()
    }
}

impl Stream for RawMessage {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.poll_next_unpin(cx)
    }
}

/// First line of a message.
#[derive(Debug, Clone)]
pub enum StartLine {
    Request {
        method: Method,
        /// Absolute-form target
        target: String,
        version: Version,
    },
    Response {
        version: Version,
        status: StatusCode,
    },
}

impl fmt::Display for StartLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartLine::Request {
                method,
                target,
                version,
            } => write!(f, "{method} {target} {version:?}"),
            StartLine::Response { version, status } => {
                let line = format!(
                    "{version:?} {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("")
                );
                f.write_str(line.trim_end())
            }
        }
    }
}

/// Builder for the head of a [`RawMessage`].
#[derive(Debug, Clone)]
pub struct MessageHead {
    start: StartLine,
    headers: HeaderMap,
    proxy_path: Option<String>,
}

impl MessageHead {
    pub fn request(
        method: Method,
        target: impl Into<String>,
        version: Version,
        headers: &HeaderMap,
    ) -> Self {
        Self {
            start: StartLine::Request {
                method,
                target: target.into(),
                version,
            },
            headers: headers.clone(),
            proxy_path: None,
        }
    }

    pub fn response(version: Version, status: StatusCode, headers: &HeaderMap) -> Self {
        Self {
            start: StartLine::Response { version, status },
            headers: headers.clone(),
            proxy_path: None,
        }
    }

    /// Record the inbound URL in an `X-Proxy-Path` header.
    pub fn with_proxy_path(mut self, source_url: impl Into<String>) -> Self {
        self.proxy_path = Some(source_url.into());
        self
    }

    /// Content coding declared by the headers, or empty.
    pub fn content_encoding(&self) -> String {
        header_text(&self.headers, CONTENT_ENCODING.as_str())
    }

    /// Render the head.
    ///
    /// `decoded` drops `Content-Encoding`; `resized` also drops
    /// `Content-Length` because the body that follows no longer matches it.
    pub fn render(
        &self,
        decoded: bool,
        resized: bool,
        decode_error: Option<&DecodeError>,
    ) -> Bytes {
        let is_request = matches!(self.start, StartLine::Request { .. });
        let mut out = String::with_capacity(256);
        let _ = write!(out, "{}\r\n", self.start);

        for (name, value) in &self.headers {
            let skip = (is_request && name == HOST)
                || name == TRANSFER_ENCODING
                || (decoded && name == CONTENT_ENCODING)
                || (resized && name == CONTENT_LENGTH);
            if skip {
                continue;
            }
            let _ = write!(out, "{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes()));
        }

        if let Some(path) = &self.proxy_path {
            let _ = write!(out, "{PROXY_PATH_HEADER}: {path}\r\n");
        }
        if let Some(err) = decode_error {
            let _ = write!(out, "{DECODE_ERROR_HEADER}: {err}\r\n");
        }

        out.push_str("\r\n");
        Bytes::from(out)
    }

    /// Build the message, decoding `body` according to the head's
    /// `Content-Encoding`. Encodings that cannot be decoded fall back to the
    /// raw body with a marker header.
    pub fn into_message(self, body: Option<ByteStream>) -> RawMessage {
        let encoding = self.content_encoding();
        let plan = decode::parse_encodings(&encoding).and_then(|encodings| {
            if encodings.is_empty() || body.is_none() {
                return Ok(None);
            }
            let handle = Handle::try_current().map_err(|_| DecodeError::NoRuntime)?;
            Ok(Some((encodings, handle)))
        });

        match (plan, body) {
            (Ok(Some((encodings, handle))), Some(body)) => {
                let decoded = decode::decode_stream(body, encodings, &handle);
                RawMessage::new(self.render(true, true, None), Some(decoded))
            }
            (Ok(_), body) => RawMessage::new(self.render(true, false, None), body),
            (Err(err), body) => {
                log::debug!("Capturing raw body: {}", err);
                RawMessage::new(self.render(false, false, Some(&err)), body)
            }
        }
    }
}

pub(crate) fn header_text(headers: &HeaderMap, name: &str) -> String {
    headers
        .get_all(name)
        .iter()
        .map(|v| String::from_utf8_lossy(v.as_bytes()).trim().to_string())
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}
