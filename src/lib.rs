// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A streaming reverse proxy that records the traffic it forwards.
//!
//! Every request is matched against a fixed route table and forwarded to its
//! backend unchanged. When capture is on for the route, a copy of the request
//! and of the response is rebuilt as a raw HTTP/1.1-style message, with
//! compressed bodies decoded, and handed to a [`LogSink`]: a directory of
//! files, a remote log server, the console, or nowhere.
//!
//! Bodies are streamed, never buffered. The capture copy flows through a
//! bounded tap, so a slow sink can lose its copy but cannot slow the client.
//!
//! # Configuration
//!
//! ```yaml
//! server:
//!   port: 8080
//! logging:
//!   enabled: true
//!   sink:
//!     type: file
//!     dir: logs
//! routes:
//!   - pattern: /openai/
//!     destination: https://api.openai.com/
//!   - pattern: /health
//!     destination: http://localhost:3000/health
//!     logging: false
//! ```
//!
//! # Embedding
//!
//! ```rust,no_run
//! use logging_proxy::LoggingProxy;
//!
//! # async fn run() -> Result<(), logging_proxy::LoaderError> {
//! let proxy = LoggingProxy::loader()
//!     .with_config_file("config.yaml")
//!     .with_env_vars()
//!     .build()?;
//! proxy.start().await?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
pub mod logging;

pub mod capture;
pub mod config;
pub mod core;
pub mod decode;
pub mod loader;
pub mod router;
pub mod server;
pub mod sink;
pub mod tap;

pub use capture::{RawMessage, RequestMetadata, StreamKind};
pub use config::{Config, ConfigError, ConfigProvider, ConfigProviderExt};
pub use core::{ProxyConfig, ProxyCore, ProxyError, ProxyRequest, ProxyResponse};
pub use decode::{ByteStream, DecodeError, decompress};
pub use loader::{LoaderError, LoggingProxy, LoggingProxyLoader};
pub use router::{LoggingPolicy, Route, RouteError, Router};
pub use server::{ProxyServer, ServerConfig};
pub use sink::{CaptureConfig, LogSink, SinkConfig, SinkError};
