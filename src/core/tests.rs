// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::*;
use crate::router::LoggingPolicy;
use crate::sink::{FileRecord, FileSink, SinkError};
use async_trait::async_trait;
use chrono::DateTime;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures_util::stream;
use http_body_util::BodyExt;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

type Entry = (StreamKind, RequestMetadata, Vec<u8>);

#[derive(Debug, Default)]
struct RecordingSink {
    entries: Mutex<Vec<Entry>>,
}

impl RecordingSink {
    async fn wait_for(&self, count: usize) -> Vec<Entry> {
        for _ in 0..500 {
            {
                let entries = self.entries.lock().unwrap();
                if entries.len() >= count {
                    return entries.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} log entries, got {}", self.entries.lock().unwrap().len());
    }

    fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
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
        let bytes = message.collect().await.map_err(SinkError::Body)?;
        self.entries.lock().unwrap().push((kind, metadata.clone(), bytes));
        Ok(())
    }
}

fn find(entries: &[Entry], kind: StreamKind) -> (RequestMetadata, String) {
    let (_, metadata, bytes) = entries
        .iter()
        .find(|(k, _, _)| *k == kind)
        .unwrap_or_else(|| panic!("no {kind} entry"));
    (metadata.clone(), String::from_utf8_lossy(bytes).into_owned())
}

fn build_core(
    router: Router,
    sink: Arc<RecordingSink>,
    enabled: bool,
    proxy: ProxyConfig,
) -> ProxyCore {
    let capture = CaptureConfig {
        enabled,
        ..CaptureConfig::default()
    };
    ProxyCore::new(Arc::new(router), sink, &proxy, &capture).unwrap()
}

fn request(
    method: Method,
    path: &str,
    query: Option<&str>,
    body: Option<&'static [u8]>,
) -> ProxyRequest {
    let mut headers = HeaderMap::new();
    headers.insert(HOST, HeaderValue::from_static("proxy.local"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let source_url = match query {
        Some(q) => format!("http://proxy.local{path}?{q}"),
        None => format!("http://proxy.local{path}"),
    };
    ProxyRequest {
        method,
        path: path.to_string(),
        query: query.map(str::to_string),
        version: Version::HTTP_11,
        headers,
        body: body.map(|b| stream::iter(vec![Ok(Bytes::from_static(b))]).boxed()),
        source_url,
    }
}

async fn read_body(response: ProxyResponse) -> Vec<u8> {
    response.body.collect().await.unwrap().to_bytes().to_vec()
}

#[tokio::test]
async fn test_proxies_and_captures_both_directions() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/echo"))
        .and(query_param("b", " "))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("pong")
                .insert_header("x-upstream", "yes"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut router = Router::new();
    router
        .register("/api/", &format!("{}/v1/", server.uri()), LoggingPolicy::Enabled)
        .unwrap();
    let sink = Arc::new(RecordingSink::default());
    let core = build_core(router, sink.clone(), false, ProxyConfig::default());

    let response = core
        .handle(request(Method::POST, "/api/echo", Some("a=1&b=%20"), Some(b"ping")))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers["x-upstream"], "yes");
    assert_eq!(read_body(response).await, b"pong");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received[0].body, b"ping");
    assert_eq!(received[0].url.query(), Some("a=1&b=%20"));
    let host = received[0].headers.get("host").unwrap().to_str().unwrap();
    assert_eq!(host, server.address().to_string());

    let entries = sink.wait_for(2).await;
    let (metadata, text) = find(&entries, StreamKind::Request);
    assert!(text.starts_with(&format!("POST {}/v1/echo?a=1&b=%20 HTTP/1.1\r\n", server.uri())));
    assert!(text.contains("X-Proxy-Path: http://proxy.local/api/echo?a=1&b=%20\r\n"));
    assert!(!text.to_ascii_lowercase().contains("host:"));
    assert!(text.ends_with("\r\n\r\nping"));
    assert_eq!(metadata.matched_pattern, "/api/");
    assert_eq!(metadata.destination_url, format!("{}/v1/echo?a=1&b=%20", server.uri()));

    let (response_metadata, text) = find(&entries, StreamKind::Response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("x-upstream: yes\r\n"));
    assert!(text.ends_with("pong"));
    assert_eq!(response_metadata.id, metadata.id);
}

#[tokio::test]
async fn test_compressed_response_passes_through_and_logs_plaintext() {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"data: hello\n\n").unwrap();
    let gz = encoder.finish().unwrap();

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(gz.clone())
                .insert_header("content-encoding", "gzip"),
        )
        .mount(&server)
        .await;

    let mut router = Router::new();
    router.register("/", &server.uri(), LoggingPolicy::Inherit).unwrap();
    let sink = Arc::new(RecordingSink::default());
    let core = build_core(router, sink.clone(), true, ProxyConfig::default());

    let response = core.handle(request(Method::GET, "/events", None, None)).await;
    assert_eq!(response.headers[CONTENT_ENCODING], "gzip");
    assert_eq!(read_body(response).await, gz);

    let entries = sink.wait_for(2).await;
    let (metadata, text) = find(&entries, StreamKind::Response);
    assert_eq!(metadata.response_content_encoding, "gzip");
    assert!(!text.contains("content-encoding"));
    assert!(!text.contains("content-length"));
    assert!(text.ends_with("\r\n\r\ndata: hello\n\n"));

    let (_, text) = find(&entries, StreamKind::Request);
    assert!(text.starts_with(&format!("GET {}/events HTTP/1.1\r\n", server.uri())));
}

#[tokio::test]
async fn test_route_without_logging_captures_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let mut router = Router::new();
    router.register("/quiet/", &server.uri(), LoggingPolicy::Disabled).unwrap();
    let sink = Arc::new(RecordingSink::default());
    let core = build_core(router, sink.clone(), true, ProxyConfig::default());

    let response = core.handle(request(Method::GET, "/quiet/x", None, None)).await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.count(), 0);
}

#[tokio::test]
async fn test_unmatched_request_is_logged_when_enabled() {
    let sink = Arc::new(RecordingSink::default());
    let core = build_core(Router::new(), sink.clone(), true, ProxyConfig::default());

    let response = core
        .handle(request(Method::POST, "/nowhere", Some("x=1"), Some(b"lost")))
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.headers[CONTENT_TYPE], "text/plain; charset=utf-8");
    assert_eq!(response.headers["x-content-type-options"], "nosniff");
    assert_eq!(read_body(response).await, NOT_FOUND_BODY.as_bytes());

    let entries = sink.wait_for(2).await;
    let (metadata, text) = find(&entries, StreamKind::Request);
    assert!(text.starts_with("POST http://proxy.local/nowhere?x=1 HTTP/1.1\r\n"));
    assert!(text.ends_with("lost"));
    assert_eq!(metadata.matched_pattern, "");
    assert_eq!(metadata.destination_url, "");

    let (_, text) = find(&entries, StreamKind::Response);
    assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(text.contains("x-content-type-options: nosniff\r\n"));
    assert!(text.ends_with("\r\n\r\n404 page not found\n"));
}

#[tokio::test]
async fn test_unmatched_request_is_silent_when_disabled() {
    let sink = Arc::new(RecordingSink::default());
    let core = build_core(Router::new(), sink.clone(), false, ProxyConfig::default());

    let response = core.handle(request(Method::GET, "/nowhere", None, None)).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.count(), 0);
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let mut router = Router::new();
    router.register("/", "http://127.0.0.1:1/", LoggingPolicy::Enabled).unwrap();
    let sink = Arc::new(RecordingSink::default());
    let core = build_core(router, sink.clone(), false, ProxyConfig::default());

    let response = core.handle(request(Method::POST, "/x", None, Some(b"body"))).await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    let body = String::from_utf8(read_body(response).await).unwrap();

    let entries = sink.wait_for(1).await;
    let (metadata, _) = find(&entries, StreamKind::Request);
    let expected = format!("[{}] proxy request failed: upstream unreachable", metadata.id);
    assert!(body.starts_with(&expected), "got {body:?}");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sink.entries.lock().unwrap().iter().all(|(k, _, _)| *k == StreamKind::Request));
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let mut router = Router::new();
    router.register("/", &server.uri(), LoggingPolicy::Disabled).unwrap();
    let proxy = ProxyConfig {
        timeout: 1,
        ..ProxyConfig::default()
    };
    let core = build_core(router, Arc::new(RecordingSink::default()), false, proxy);

    let response = core.handle(request(Method::GET, "/slow", None, None)).await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    let body = String::from_utf8(read_body(response).await).unwrap();
    assert!(body.contains("no response from upstream within 1s"));
}

/// Upstream that answers one request and reports its head verbatim.
async fn raw_backend() -> (String, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
            .await
            .unwrap();
        let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
    });

    (format!("http://{addr}"), rx)
}

#[tokio::test]
async fn test_raw_path_and_query_reach_upstream_unchanged() {
    let (backend, head) = raw_backend().await;

    let mut router = Router::new();
    router
        .register("/api/", &format!("{backend}/base/"), LoggingPolicy::Enabled)
        .unwrap();
    let sink = Arc::new(RecordingSink::default());
    let core = build_core(router, sink.clone(), false, ProxyConfig::default());

    let query = "r='y'&s={z}|^`&$filter=Name%20eq%20'x'";
    let response = core
        .handle(request(Method::GET, "/api/a{b}/c|d'e", Some(query), None))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(read_body(response).await, b"ok");

    let head = head.await.unwrap();
    let expected_target = format!("/base/a{{b}}/c|d'e?{query}");
    assert!(
        head.starts_with(&format!("GET {expected_target} HTTP/1.1\r\n")),
        "upstream saw {head:?}"
    );

    let entries = sink.wait_for(2).await;
    let (metadata, text) = find(&entries, StreamKind::Request);
    assert_eq!(metadata.destination_url, format!("{backend}{expected_target}"));
    assert!(text.starts_with(&format!("GET {backend}{expected_target} HTTP/1.1\r\n")));
}

#[tokio::test]
async fn test_unmatched_request_records_its_content_encoding() {
    let sink = Arc::new(RecordingSink::default());
    let core = build_core(Router::new(), sink.clone(), true, ProxyConfig::default());

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"lost and compressed").unwrap();
    let gz: &'static [u8] = Box::leak(encoder.finish().unwrap().into_boxed_slice());

    let mut req = request(Method::POST, "/nowhere", None, Some(gz));
    req.headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    let response = core.handle(req).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);

    let entries = sink.wait_for(2).await;
    let (metadata, text) = find(&entries, StreamKind::Request);
    assert_eq!(metadata.request_content_encoding, "gzip");
    assert!(text.ends_with("\r\n\r\nlost and compressed"));
}

/// `ticks` chunks `gap` apart, then either the end or a stall.
fn ticking_body(ticks: usize, gap: Duration, stall: bool) -> ByteStream {
    let ticking = stream::unfold(0usize, move |i| async move {
        if i == ticks {
            return None;
        }
        if i > 0 {
            tokio::time::sleep(gap).await;
        }
        Some((Ok(Bytes::from(format!("event{i}\n"))), i + 1))
    });
    if stall {
        ticking.chain(stream::pending()).boxed()
    } else {
        ticking.boxed()
    }
}

fn file_core(dir: &Path, timeout_secs: u64) -> ProxyCore {
    let capture = CaptureConfig {
        enabled: true,
        timeout: timeout_secs,
        ..CaptureConfig::default()
    };
    let sink = Arc::new(FileSink::new(dir).unwrap());
    ProxyCore::new(Arc::new(Router::new()), sink, &ProxyConfig::default(), &capture).unwrap()
}

/// Wait for a complete sidecar and return it with its `.bin` contents.
async fn wait_for_sidecar(dir: &Path) -> (FileRecord, Vec<u8>) {
    for _ in 0..100 {
        let sidecar = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.path())
            .find(|p| p.to_string_lossy().ends_with("_metadata.json"));
        if let Some(sidecar) = sidecar {
            let text = std::fs::read_to_string(&sidecar).unwrap_or_default();
            if let Ok(record) = serde_json::from_str::<FileRecord>(&text) {
                let bin = std::fs::read(dir.join(&record.filename)).unwrap();
                return (record, bin);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("no sidecar written in {}", dir.display());
}

#[tokio::test]
async fn test_capture_longer_than_sink_timeout_is_kept_whole() {
    let dir = tempfile::tempdir().unwrap();
    let core = file_core(dir.path(), 1);

    // Runs well past one second in total, but never idles that long
    let body = ticking_body(3, Duration::from_millis(700), false);
    let message = RawMessage::new(Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n"), Some(body));
    core.dispatch(StreamKind::Response, RequestMetadata::new(&Method::GET, "http://p/"), message);

    let (record, bin) = wait_for_sidecar(dir.path()).await;
    assert_eq!(bin, b"HTTP/1.1 200 OK\r\n\r\nevent0\nevent1\nevent2\n");
    assert_eq!(record.byte_count, bin.len() as u64);
    assert_eq!(record.stream_type, StreamKind::Response);
}

#[tokio::test]
async fn test_stalled_capture_is_cut_but_keeps_its_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let core = file_core(dir.path(), 1);

    let body = ticking_body(1, Duration::ZERO, true);
    let message = RawMessage::new(Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n"), Some(body));
    core.dispatch(StreamKind::Response, RequestMetadata::new(&Method::GET, "http://p/"), message);

    let (record, bin) = wait_for_sidecar(dir.path()).await;
    assert_eq!(bin, b"HTTP/1.1 200 OK\r\n\r\nevent0\n");
    assert_eq!(record.byte_count, bin.len() as u64);
}

#[test]
fn test_error_chain_skips_repeated_text() {
    let inner = io::Error::other("connection refused");
    let err = ProxyError::Other(format!("tcp connect error: {inner}"));
    assert_eq!(error_chain(&err), "tcp connect error: connection refused");

    #[derive(Debug, Error)]
    #[error("outer")]
    struct Outer(#[source] io::Error);
    assert_eq!(error_chain(&Outer(inner)), "outer: connection refused");
}

#[test]
fn test_proxy_config_defaults() {
    let config: ProxyConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(config.timeout, 30);
    assert_eq!(config.connect_timeout, 10);
}
