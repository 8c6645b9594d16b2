// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-level entry point.
//!
//! [`LoggingProxyLoader`] reads configuration, validates the route table,
//! builds the sink and returns a [`LoggingProxy`] ready to serve. Every
//! configuration problem surfaces here, before any socket is bound.


use log::{info, warn};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::config::{Config, ConfigError, ConfigProvider, EnvConfigProvider, FileConfigProvider};
use crate::core::{ProxyConfig, ProxyCore, ProxyError};
use crate::logging::{self, config::DiagnosticsConfig};
use crate::router::{MatchKind, RouteError, Router, RoutesConfig};
use crate::server::{ProxyServer, ServerConfig};
use crate::sink::{self, CaptureConfig, LogSink, SinkError};

/// Errors that can occur while building the proxy.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("route error: {0}")]
    RouteError(#[from] RouteError),

    #[error("sink error: {0}")]
    SinkError(#[from] SinkError),

    #[error("proxy error: {0}")]
    ProxyError(#[from] ProxyError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Builder for a [`LoggingProxy`].
#[derive(Debug, Default)]
pub struct LoggingProxyLoader {
    config: Option<Config>,
    config_file_path: Option<String>,
    use_env_vars: bool,
    env_prefix: Option<String>,
    providers: Vec<Arc<dyn ConfigProvider>>,
    sink: Option<Arc<dyn LogSink>>,
}

impl LoggingProxyLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a ready-made configuration; file and env settings are ignored.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set a configuration file to load.
    pub fn with_config_file(mut self, file_path: &str) -> Self {
        self.config_file_path = Some(file_path.to_string());
        self
    }

    /// Layer `LOGGING_PROXY_*` environment variables over the file.
    pub fn with_env_vars(mut self) -> Self {
        self.use_env_vars = true;
        self
    }

    /// Layer environment variables with a custom prefix over the file.
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_string());
        self.use_env_vars = true;
        self
    }

    /// Add a provider on top of the file and environment.
    pub fn with_provider<P: ConfigProvider + 'static>(mut self, provider: P) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Use `sink` instead of the one described by `logging.sink`.
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn assemble_config(&mut self) -> Result<Config, LoaderError> {
        if let Some(config) = self.config.take() {
            return Ok(config);
        }

        let mut builder = Config::builder();
        if let Some(file_path) = &self.config_file_path {
            builder = builder.with_provider(FileConfigProvider::new(file_path)?);
        }
        if self.use_env_vars {
            let env_provider = match &self.env_prefix {
                Some(prefix) => EnvConfigProvider::new(prefix),
                None => EnvConfigProvider::default(),
            };
            builder = builder.with_provider(env_provider);
        }

        for provider in self.providers.drain(..) {
            builder = builder.with_shared_provider(provider);
        }
        Ok(builder.build())
    }

    /// Validate configuration and build the proxy.
    pub fn build(mut self) -> Result<LoggingProxy, LoaderError> {
        let config = self.assemble_config()?;

        let diagnostics: DiagnosticsConfig =
            config.get_or_default("diagnostics", DiagnosticsConfig::default())?;
        logging::init_with_config(logging::parse_level(&diagnostics.level), &diagnostics);

        info!("Logging proxy starting up");

        let router = match config.get::<RoutesConfig>("routes")? {
            Some(routes) => Router::from_config(routes)?,
            None => Router::new(),
        };

        let capture: CaptureConfig = config.get_or_default("logging", CaptureConfig::default())?;
        for route in router.routes() {
            let enabled = route.logging().is_enabled(capture.enabled);
            info!(
                "[route] {} -> {} (logging {})",
                route.pattern(),
                route.destination(),
                if enabled { "enabled" } else { "disabled" }
            );
            if route.match_kind() == MatchKind::Exact {
                warn!(
                    "Pattern '{}' has no trailing '/'; it will not match subpaths",
                    route.pattern()
                );
            }
        }
        if router.is_empty() {
            warn!("No routes configured; every request will get 404");
        } else if !router.has_catch_all() {
            info!(
                "No catch-all route; unmatched requests get 404 (logging {})",
                if capture.enabled { "enabled" } else { "disabled" }
            );
        }

        let sink = match self.sink.take() {
            Some(sink) => sink,
            None => sink::from_config(&capture.sink_config())?,
        };
        info!("Captured traffic goes to the {} sink", sink.name());

        let proxy: ProxyConfig = config.get_or_default("proxy", ProxyConfig::default())?;
        let core = ProxyCore::new(Arc::new(router), sink, &proxy, &capture)?;

        let server_config: ServerConfig = config.get_or_default("server", ServerConfig::default())?;
        let server = ProxyServer::new(server_config, Arc::new(core));

        Ok(LoggingProxy {
            config: Arc::new(config),
            server,
        })
    }
}

/// A fully configured proxy.
#[derive(Debug, Clone)]
pub struct LoggingProxy {
    config: Arc<Config>,
    server: ProxyServer,
}

impl LoggingProxy {
    pub fn loader() -> LoggingProxyLoader {
        LoggingProxyLoader::new()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn server(&self) -> &ProxyServer {
        &self.server
    }

    /// Bind the configured address and serve until a shutdown signal.
    pub async fn start(&self) -> Result<(), LoaderError> {
        self.server.start().await.map_err(LoaderError::ProxyError)
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), LoaderError>
    where
        F: Future<Output = ()> + Send,
    {
        self.server
            .serve(listener, shutdown)
            .await
            .map_err(LoaderError::ProxyError)
    }
}
