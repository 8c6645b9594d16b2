// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inbound HTTP listener.
//!
//! A thin wrapper around **hyper-util**: it owns the listening socket,
//! converts hyper requests into [`ProxyRequest`]s for the engine and turns
//! the engine's [`ProxyResponse`]s back into hyper responses.
//!
//! `hyper_util::server::conn::auto::Builder` serves HTTP/1.1 and HTTP/2 on
//! the same connection. Response headers go out as soon as the engine
//! returns; the body follows as it streams in from upstream.


use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use http_body_util::BodyExt;
use hyper::body::{Body as _, Incoming};
use hyper::header::HOST;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use log::{debug, error, info, warn};
use reqwest::Body;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::core::{ProxyCore, ProxyError, ProxyRequest, ProxyResponse};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// The `server` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds to wait for open connections after a shutdown signal
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// HTTP server for the proxy.
#[derive(Debug, Clone)]
pub struct ProxyServer {
    config: ServerConfig,
    core: Arc<ProxyCore>,
}

impl ProxyServer {
    pub fn new(config: ServerConfig, core: Arc<ProxyCore>) -> Self {
        Self { config, core }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn core(&self) -> &Arc<ProxyCore> {
        &self.core
    }

    /// Bind `server.host:server.port` and serve until Ctrl-C or SIGTERM.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let addr = format!("{}:{}", self.config.host, self.config.port)
            .parse::<SocketAddr>()
            .map_err(|e| ProxyError::Other(format!("Invalid server address: {}", e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::Other(format!("Failed to bind {}: {}", addr, e)))?;

        #[cfg(unix)]
        let mut term_stream = signal(SignalKind::terminate())
            .map_err(|e| ProxyError::Other(format!("Cannot install SIGTERM handler: {}", e)))?;

        let shutdown = async move {
            #[cfg(unix)]
            let sigterm = term_stream.recv();
            #[cfg(not(unix))]
            let sigterm = std::future::pending::<Option<()>>();

            tokio::select! {
                _ = signal::ctrl_c() => info!("Received Ctrl-C; initiating graceful shutdown"),
                _ = sigterm => info!("Received SIGTERM; initiating graceful shutdown"),
            }
        };

        self.serve(listener, shutdown).await
    }

    /// Serve connections from `listener` until `shutdown` resolves, then
    /// drain open connections for up to `server.shutdown_timeout`.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()> + Send,
    {
        let local_addr = listener
            .local_addr()
            .map_err(|e| ProxyError::Other(format!("Listener has no local address: {}", e)))?;
        info!("Logging proxy listening on http://{}", local_addr);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut join_set = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accept = listener.accept() => {
                    let (stream, remote_addr) = match accept {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Accept error: {}", e);
                            continue;
                        }
                    };

                    let core = self.core.clone();
                    let mut stop_rx = stop_rx.clone();
                    join_set.spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            handle_request(req, core.clone(), local_addr)
                        });

                        let builder = AutoBuilder::new(TokioExecutor::new());
                        let conn = builder.serve_connection(TokioIo::new(stream), service);
                        let mut conn = std::pin::pin!(conn);

                        tokio::select! {
                            res = &mut conn => log_connection_end(res, remote_addr),
                            _ = stop_rx.changed() => {
                                debug!("Connection from {} received shutdown signal", remote_addr);
                                conn.as_mut().graceful_shutdown();
                                log_connection_end(conn.await, remote_addr);
                            }
                        }
                    });
                }
            }

            // Reap finished connection tasks so the set does not grow forever.
            while join_set.try_join_next().is_some() {}
        }

        info!("Shutting down; waiting for {} connection(s)", join_set.len());
        let _ = stop_tx.send(true);
        drop(listener);

        let limit = Duration::from_secs(self.config.shutdown_timeout);
        let drain = async {
            while let Some(res) = join_set.join_next().await {
                if let Err(e) = res {
                    if !e.is_cancelled() {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        };

        match tokio::time::timeout(limit, drain).await {
            Ok(()) => info!("All connections drained"),
            Err(_) => {
                warn!(
                    "Shutdown timed out after {} seconds, closing remaining connections",
                    limit.as_secs()
                );
                join_set.shutdown().await;
            }
        }

        info!("Shutdown complete");
        Ok(())
    }
}

fn log_connection_end<E: std::fmt::Display>(res: Result<(), E>, remote_addr: SocketAddr) {
    match res {
        Ok(()) => debug!("Connection from {} closed", remote_addr),
        Err(e) => {
            let text = e.to_string();
            if !text.contains("connection closed") && !text.contains("connection reset") {
                error!("Connection error from {}: {}", remote_addr, e);
            }
        }
    }
}

/// Absolute URL the client used to reach the proxy.
pub fn source_url(uri: &Uri, headers: &HeaderMap, local_addr: SocketAddr) -> String {
    let scheme = uri.scheme_str().unwrap_or("http");
    let authority = uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| headers.get(HOST).and_then(|h| h.to_str().ok()).map(str::to_string))
        .unwrap_or_else(|| local_addr.to_string());
    let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    format!("{scheme}://{authority}{path_and_query}")
}

/// Convert a hyper request to a proxy request.
fn convert_hyper_request(req: Request<Incoming>, local_addr: SocketAddr) -> ProxyRequest {
    let source_url = source_url(req.uri(), req.headers(), local_addr);
    let (parts, body) = req.into_parts();

    let body = if body.is_end_stream() {
        None
    } else {
        let stream = body
            .into_data_stream()
            .map_ok(Bytes::from)
            .map_err(io::Error::other)
            .boxed();
        Some(stream)
    };

    ProxyRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        version: parts.version,
        headers: parts.headers,
        body,
        source_url,
    }
}

/// Convert a proxy response to a hyper response.
fn convert_proxy_response(resp: ProxyResponse) -> Response<Body> {
    let mut response = Response::new(resp.body);
    *response.status_mut() = resp.status;
    *response.headers_mut() = resp.headers;
    response
}

/// Bare 500 for the rare case where a response cannot be produced.
pub fn internal_error() -> Response<Body> {
    let mut response = Response::new(Body::from("internal proxy error\n"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

async fn handle_request(
    req: Request<Incoming>,
    core: Arc<ProxyCore>,
    local_addr: SocketAddr,
) -> Result<Response<Body>, Infallible> {
    debug!("Incoming {} {} over {:?}", req.method(), req.uri(), req.version());
    let request = convert_hyper_request(req, local_addr);

    // The engine runs in its own task so a panic inside it costs one
    // request, not the connection.
    let handled = tokio::spawn(async move { core.handle(request).await }).await;
    match handled {
        Ok(resp) => Ok(convert_proxy_response(resp)),
        Err(e) => {
            error!("Request handler failed: {}", e);
            Ok(internal_error())
        }
    }
}
