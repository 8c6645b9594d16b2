// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streaming behaviour: bodies are forwarded as they arrive and the capture
//! side never holds the client back.

mod common;

use common::{RecordingSink, TestProxy, client};
use futures_util::StreamExt;
use logging_proxy::StreamKind;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use warp::Filter;
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, ResponseTemplate};

const TICKS: usize = 5;
const TICK_INTERVAL: Duration = Duration::from_millis(300);

/// Backend emitting `TICKS` server-sent events, one per interval.
async fn start_sse_backend() -> SocketAddr {
    let events = warp::path("events").map(|| {
        let stream = futures_util::stream::iter(0..TICKS).then(|i| async move {
            tokio::time::sleep(TICK_INTERVAL).await;
            Ok::<_, Infallible>(warp::sse::Event::default().data(format!("tick {i}")))
        });
        warp::sse::reply(stream)
    });

    let (addr, server) = warp::serve(events).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

fn route_to(destination: &str, extra: &str) -> String {
    format!(
        "logging:\n  enabled: true\n{extra}routes:\n  - pattern: /\n    destination: \"{destination}\"\n"
    )
}

#[tokio::test]
async fn test_sse_chunks_are_not_buffered() {
    let backend = start_sse_backend().await;
    let sink = RecordingSink::new();
    let proxy = TestProxy::start(&route_to(&format!("http://{backend}"), ""), sink.clone()).await;

    let response = client().get(proxy.url("/events")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let mut arrivals = Vec::new();
    let mut received = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        arrivals.push(Instant::now());
        received.extend_from_slice(&chunk.unwrap());
    }

    let text = String::from_utf8(received).unwrap();
    for i in 0..TICKS {
        let tick =
            text.contains(&format!("data:tick {i}")) || text.contains(&format!("data: tick {i}"));
        assert!(tick, "missing tick {i}");
    }

    // Chunks trickle in with the backend's pacing instead of all at once.
    assert!(arrivals.len() >= 3, "only {} chunk(s) arrived", arrivals.len());
    let spread = arrivals[arrivals.len() - 1] - arrivals[0];
    assert!(spread >= TICK_INTERVAL * 2, "chunks arrived within {spread:?}");

    sink.wait_for(2).await;
    let captured = sink.find(StreamKind::Response);
    assert!(captured.head().starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(captured.body(), text.as_bytes());

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_slow_sink_does_not_slow_client() {
    let backend = MockServer::start().await;
    let body = vec![b'a'; 1024 * 1024];
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&backend)
        .await;

    let sink = RecordingSink::slow(Duration::from_millis(200));
    let proxy = TestProxy::start(&route_to(&backend.uri(), ""), sink.clone()).await;

    let started = Instant::now();
    let response = client().get(proxy.url("/big")).send().await.unwrap();
    let received = response.bytes().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(received.len(), body.len());
    assert!(elapsed < Duration::from_secs(2), "client took {elapsed:?}");

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_tap_overflow_cuts_only_the_capture() {
    let backend = MockServer::start().await;
    let body: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&backend)
        .await;

    let sink = RecordingSink::slow(Duration::from_millis(50));
    let yaml = route_to(&backend.uri(), "  tap_capacity: 1024\n");
    let proxy = TestProxy::start(&yaml, sink.clone()).await;

    let response = client().get(proxy.url("/huge")).send().await.unwrap();
    let received = response.bytes().await.unwrap();
    assert_eq!(received.to_vec(), body);

    // The request (no body) is captured; the response capture fails.
    sink.wait_for(1).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(sink.entries().iter().all(|c| c.kind == StreamKind::Request));

    proxy.shutdown().await;
}
