// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Proxy engine.
//!
//! [`ProxyCore::handle`] runs one inbound request end to end:
//!
//! 1. resolve the route (unmatched requests get a 404, see below)
//! 2. build the destination URL and decide whether to capture
//! 3. tee the request body; the copy goes to the sink in its own task
//! 4. send upstream and wait for response headers (502 on failure)
//! 5. hand the headers back at once and tee the response body the same way
//!
//! Bodies are never buffered. The sink reads its copy through a bounded tap
//! ([`crate::tap`]), so a slow or failing sink cannot hold up the client.
//!
//! Sink calls run in detached tasks. A capture whose body stalls for longer
//! than `logging.timeout` is cut; failures are logged and go nowhere else.

#[cfg(test)]
mod tests;

use bytes::Bytes;
use chrono::Utc;
use futures_util::{StreamExt, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::Frame;
use hyper::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderValue};
use hyper::{HeaderMap, Method, Request, StatusCode, Version};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::timeout;

use crate::capture::{MessageHead, RawMessage, RequestMetadata, StreamKind, header_text};
use crate::decode::ByteStream;
use crate::router::{RouteError, Router};
use crate::sink::{CaptureConfig, LogSink};
use crate::tap;

/// Body returned for requests that match no route.
pub const NOT_FOUND_BODY: &str = "404 page not found\n";

type UpstreamBody = UnsyncBoxBody<Bytes, io::Error>;
type UpstreamClient = Client<HttpsConnector<HttpConnector>, UpstreamBody>;

/// Errors that can occur while proxying.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Connecting to or talking to the upstream failed before headers arrived
    #[error("upstream unreachable")]
    Upstream(#[source] hyper_util::client::legacy::Error),

    #[error("no response from upstream within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Target(#[from] RouteError),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("failed to build response: {0}")]
    Response(String),

    #[error("{0}")]
    Other(String),
}

/// The `proxy` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Seconds to wait for upstream response headers
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

fn default_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// An inbound request as the engine sees it.
pub struct ProxyRequest {
    pub method: Method,
    /// Raw path, still percent-encoded
    pub path: String,
    /// Raw query without the leading `?`
    pub query: Option<String>,
    pub version: Version,
    pub headers: HeaderMap,
    /// `None` when the request has no body
    pub body: Option<ByteStream>,
    /// Absolute URL the client used to reach the proxy
    pub source_url: String,
}

impl std::fmt::Debug for ProxyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("version", &self.version)
            .field("has_body", &self.body.is_some())
            .finish_non_exhaustive()
    }
}

/// What goes back to the client.
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: reqwest::Body,
}

impl ProxyResponse {
    fn text(status: StatusCode, body: String) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        Self {
            status,
            headers,
            body: reqwest::Body::from(body),
        }
    }
}

/// The proxy engine. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct ProxyCore {
    router: Arc<Router>,
    client: UpstreamClient,
    sink: Arc<dyn LogSink>,
    default_logging: bool,
    access_log: bool,
    tap_capacity: usize,
    sink_timeout: Duration,
    upstream_timeout: Duration,
}

impl ProxyCore {
    pub fn new(
        router: Arc<Router>,
        sink: Arc<dyn LogSink>,
        proxy: &ProxyConfig,
        capture: &CaptureConfig,
    ) -> Result<Self, ProxyError> {
        // Only connecting has a client-level timeout. The target URI goes out
        // as built; the raw inbound path and query are never re-encoded.
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(proxy.connect_timeout)));
        let tls = tokio_native_tls::native_tls::TlsConnector::new()
            .map_err(|e| ProxyError::Tls(e.to_string()))?;
        let connector = HttpsConnector::from((http, tokio_native_tls::TlsConnector::from(tls)));
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            router,
            client,
            sink,
            default_logging: capture.enabled,
            access_log: capture.console,
            tap_capacity: capture.tap_capacity,
            sink_timeout: capture.sink_timeout(),
            upstream_timeout: Duration::from_secs(proxy.timeout),
        })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn default_logging(&self) -> bool {
        self.default_logging
    }

    /// Proxy one request. Never fails: every error becomes a response.
    pub async fn handle(&self, request: ProxyRequest) -> ProxyResponse {
        let started = Instant::now();
        let mut metadata = RequestMetadata::new(&request.method, request.source_url.clone());

        let Some(matched) = self.router.resolve(&request.method, &request.path) else {
            return self.not_found(request, metadata);
        };
        let route = matched.route;
        let capture = route.logging().is_enabled(self.default_logging);
        metadata.matched_pattern = route.pattern().to_string();

        let destination = match route.destination_url(matched.remainder, request.query.as_deref()) {
            Ok(destination) => destination,
            Err(e) => {
                return self.bad_gateway(&request.method, &request.path, &metadata, e.into());
            }
        };
        metadata.destination_url = destination.to_string();

        let ProxyRequest {
            method,
            path,
            version,
            mut headers,
            body,
            ..
        } = request;
        metadata.request_content_encoding = header_text(&headers, CONTENT_ENCODING.as_str());

        // The client derives Host from the destination URL.
        headers.remove(HOST);

        let outbound_body = if capture {
            let head = MessageHead::request(
                method.clone(),
                metadata.destination_url.clone(),
                version,
                &headers,
            )
            .with_proxy_path(metadata.source_url.clone());
            match body {
                Some(body) => {
                    let (wire, log) = tap::tee(body, self.tap_capacity);
                    let message = head.into_message(Some(log.boxed()));
                    self.dispatch(StreamKind::Request, metadata.clone(), message);
                    Some(wire.boxed())
                }
                None => {
                    self.dispatch(StreamKind::Request, metadata.clone(), head.into_message(None));
                    None
                }
            }
        } else {
            body
        };

        let mut outbound = Request::new(upstream_body(outbound_body));
        *outbound.method_mut() = method.clone();
        *outbound.uri_mut() = destination;
        *outbound.headers_mut() = headers;

        let upstream = match timeout(self.upstream_timeout, self.client.request(outbound)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return self.bad_gateway(&method, &path, &metadata, ProxyError::Upstream(e));
            }
            Err(_) => {
                let err = ProxyError::Timeout(self.upstream_timeout);
                return self.bad_gateway(&method, &path, &metadata, err);
            }
        };

        let (parts, response_body) = upstream.into_parts();
        let status = parts.status;
        let response_headers = parts.headers;
        let response_version = parts.version;
        metadata.response_content_encoding =
            header_text(&response_headers, CONTENT_ENCODING.as_str());

        debug_fmt!(
            metadata.short_id(),
            "{} {} -> {} answered {} after {:?}",
            method,
            path,
            metadata.destination_url,
            status,
            started.elapsed()
        );

        let stream: ByteStream =
            TryStreamExt::map_err(response_body.into_data_stream(), io::Error::other).boxed();
        let body = if capture {
            let (wire, log) = tap::tee(stream, self.tap_capacity);
            let head = MessageHead::response(response_version, status, &response_headers);
            let message = head.into_message(Some(log.boxed()));
            self.dispatch(StreamKind::Response, metadata.clone(), message);
            wire.boxed()
        } else {
            stream
        };

        self.access(&method, &path, status, &metadata);
        ProxyResponse {
            status,
            headers: response_headers,
            body: reqwest::Body::wrap_stream(body),
        }
    }

    fn not_found(&self, request: ProxyRequest, mut metadata: RequestMetadata) -> ProxyResponse {
        let response = ProxyResponse::text(StatusCode::NOT_FOUND, NOT_FOUND_BODY.to_string());

        if self.default_logging {
            metadata.request_content_encoding =
                header_text(&request.headers, CONTENT_ENCODING.as_str());

            let head = MessageHead::request(
                request.method.clone(),
                request.source_url.clone(),
                request.version,
                &request.headers,
            )
            .with_proxy_path(request.source_url.clone());
            self.dispatch(StreamKind::Request, metadata.clone(), head.into_message(request.body));

            let head =
                MessageHead::response(Version::HTTP_11, StatusCode::NOT_FOUND, &response.headers)
                    .render(true, false, None);
            self.dispatch(
                StreamKind::Response,
                metadata.clone(),
                RawMessage::from_parts(head, Bytes::from_static(NOT_FOUND_BODY.as_bytes())),
            );
        }

        self.access(&request.method, &request.path, StatusCode::NOT_FOUND, &metadata);
        response
    }

    fn bad_gateway(
        &self,
        method: &Method,
        path: &str,
        metadata: &RequestMetadata,
        err: ProxyError,
    ) -> ProxyResponse {
        let reason = error_chain(&err);
        warn_fmt!(
            metadata.short_id(),
            "Upstream {} failed: {}",
            metadata.destination_url,
            reason
        );

        self.access(method, path, StatusCode::BAD_GATEWAY, metadata);
        ProxyResponse::text(
            StatusCode::BAD_GATEWAY,
            format!("[{}] proxy request failed: {}\n", metadata.id, reason),
        )
    }

    /// Hand a captured message to the sink without waiting for it.
    ///
    /// `logging.timeout` bounds the gap between body chunks, not the call as
    /// a whole, so the sink always reaches its own end-of-capture handling.
    fn dispatch(&self, kind: StreamKind, metadata: RequestMetadata, message: RawMessage) {
        let sink = self.sink.clone();
        let message = message.with_idle_timeout(self.sink_timeout);
        let timestamp = Utc::now();

        tokio::spawn(async move {
            let result = match kind {
                StreamKind::Request => sink.log_request(&metadata, timestamp, message).await,
                StreamKind::Response => sink.log_response(&metadata, timestamp, message).await,
            };
            match result {
                Ok(()) => trace_fmt!(metadata.short_id(), "Logged {}", kind),
                Err(e) => warn_fmt!(metadata.short_id(), "Failed to log {}: {}", kind, e),
            }
        });
    }

    fn access(&self, method: &Method, path: &str, status: StatusCode, metadata: &RequestMetadata) {
        if self.access_log {
            log::info!(
                "{} {} -> {} [{}] ({})",
                method,
                path,
                status.as_u16(),
                metadata.matched_pattern,
                metadata.short_id()
            );
        }
    }
}

fn upstream_body(body: Option<ByteStream>) -> UpstreamBody {
    match body {
        Some(stream) => StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync(),
        None => Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync(),
    }
}

/// `err` followed by each of its sources, separated by `": "`.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.ends_with(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}
