// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Route table.
//!
//! A [`Router`] owns every [`Route`] registered at startup and never changes
//! afterwards; it is shared behind an `Arc` and read without locking.
//!
//! ### Pattern syntax
//! | pattern          | matches                                   |
//! |------------------|-------------------------------------------|
//! | `/api/`          | `/api/` and everything below it           |
//! | `/health`        | exactly `/health`                         |
//! | `/`              | everything (catch-all)                    |
//! | `POST /upload/`  | as above, only for `POST`                 |
//!
//! Wildcard segments such as `{id}` or `{rest...}` are rejected.  When more
//! than one route matches, an exact match beats a prefix match, a longer
//! prefix beats a shorter one, and a method-qualified route beats an
//! unqualified one.

mod pattern;


pub use pattern::{MatchKind, RoutePattern};

use hyper::{Method, Uri};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Startup-time routing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("invalid route pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error(
        "route pattern '{pattern}' contains wildcard '{token}'; \
         only a trailing '/' prefix marker is supported"
    )]
    Wildcard { pattern: String, token: String },

    #[error("invalid destination '{destination}' for route '{pattern}': {reason}")]
    InvalidDestination {
        pattern: String,
        destination: String,
        reason: String,
    },

    #[error("route pattern '{0}' is registered more than once")]
    Duplicate(String),

    /// The joined upstream target is not a valid request URI.
    #[error("cannot build upstream target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },
}

/// Whether traffic through a route is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingPolicy {
    Enabled,
    Disabled,
    /// Use the global default
    #[default]
    Inherit,
}

impl LoggingPolicy {
    /// Map an optional per-route flag onto a policy.
    pub fn from_flag(flag: Option<bool>) -> Self {
        match flag {
            Some(true) => LoggingPolicy::Enabled,
            Some(false) => LoggingPolicy::Disabled,
            None => LoggingPolicy::Inherit,
        }
    }

    /// Effective decision given the global default.
    pub fn is_enabled(self, default: bool) -> bool {
        match self {
            LoggingPolicy::Enabled => true,
            LoggingPolicy::Disabled => false,
            LoggingPolicy::Inherit => default,
        }
    }
}

/// Configuration for a route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteConfig {
    /// Inbound pattern, see the module docs
    pub pattern: String,
    /// Base URL of the backend
    pub destination: String,
    /// Capture override; absent means "use `logging.enabled`"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<bool>,
}

/// The `routes` key accepts a list or a map of named routes.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RoutesConfig {
    List(Vec<RouteConfig>),
    Named(BTreeMap<String, RouteConfig>),
}

impl RoutesConfig {
    /// Flatten into `(name, route)` pairs.
    pub fn into_routes(self) -> Vec<(Option<String>, RouteConfig)> {
        match self {
            RoutesConfig::List(routes) => routes.into_iter().map(|r| (None, r)).collect(),
            RoutesConfig::Named(routes) => routes.into_iter().map(|(n, r)| (Some(n), r)).collect(),
        }
    }
}

/// A registered route.
#[derive(Debug, Clone)]
pub struct Route {
    pattern: RoutePattern,
    destination: Url,
    logging: LoggingPolicy,
    name: Option<String>,
}

impl Route {
    /// Pattern text as configured.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn match_kind(&self) -> MatchKind {
        self.pattern.kind()
    }

    pub fn destination(&self) -> &Url {
        &self.destination
    }

    pub fn logging(&self) -> LoggingPolicy {
        self.logging
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Build the upstream URI for a request that matched this route.
    ///
    /// `remainder` is the raw path past the matched prefix and `query` the
    /// raw inbound query. Both are copied byte for byte; only the configured
    /// destination went through URL normalisation.
    pub fn destination_url(
        &self,
        remainder: &str,
        query: Option<&str>,
    ) -> Result<Uri, RouteError> {
        let base = &self.destination;
        let mut target = format!("{}://{}", base.scheme(), base.host_str().unwrap_or_default());
        if let Some(port) = base.port() {
            target.push_str(&format!(":{port}"));
        }

        let remainder = remainder.trim_start_matches('/');
        if remainder.is_empty() {
            target.push_str(base.path());
        } else {
            target.push_str(base.path().trim_end_matches('/'));
            target.push('/');
            target.push_str(remainder);
        }

        match query.filter(|q| !q.is_empty()) {
            Some(query) => {
                target.push('?');
                target.push_str(query);
            }
            None => {
                if let Some(query) = base.query() {
                    target.push('?');
                    target.push_str(query);
                }
            }
        }

        Uri::try_from(target.as_str()).map_err(|e| RouteError::InvalidTarget {
            target,
            reason: e.to_string(),
        })
    }
}

/// Result of a successful lookup.
#[derive(Debug, Clone, Copy)]
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    /// Raw path past the matched prefix; empty for exact matches
    pub remainder: &'a str,
}

/// Immutable-after-startup route table.
#[derive(Debug, Default, Clone)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a router from configuration, failing on the first bad route.
    pub fn from_config(routes: RoutesConfig) -> Result<Self, RouteError> {
        let mut router = Self::new();
        for (name, route) in routes.into_routes() {
            router.register_named(
                name,
                &route.pattern,
                &route.destination,
                LoggingPolicy::from_flag(route.logging),
            )?;
        }
        Ok(router)
    }

    /// Register a route.
    pub fn register(
        &mut self,
        pattern: &str,
        destination: &str,
        logging: LoggingPolicy,
    ) -> Result<(), RouteError> {
        self.register_named(None, pattern, destination, logging)
    }

    fn register_named(
        &mut self,
        name: Option<String>,
        pattern: &str,
        destination: &str,
        logging: LoggingPolicy,
    ) -> Result<(), RouteError> {
        let parsed = RoutePattern::parse(pattern)?;

        if self.routes.iter().any(|r| r.pattern.same_key(&parsed)) {
            return Err(RouteError::Duplicate(pattern.to_string()));
        }

        let destination = parse_destination(pattern, destination)?;

        log::trace!(
            "Registered route {} ({:?}) -> {}",
            parsed.as_str(),
            parsed.kind(),
            destination
        );

        self.routes.push(Route {
            pattern: parsed,
            destination,
            logging,
            name,
        });
        Ok(())
    }

    /// Find the most specific route for a request.
    pub fn resolve<'a>(&'a self, method: &Method, path: &'a str) -> Option<RouteMatch<'a>> {
        let found = self
            .routes
            .iter()
            .filter_map(|route| {
                let remainder = route.pattern.match_path(path)?;
                let method_score = route.pattern.method_score(method)?;
                Some((route.pattern.specificity(), method_score, route, remainder))
            })
            .max_by_key(|(specificity, method_score, _, _)| (*specificity, *method_score));

        match found {
            Some((_, _, route, remainder)) => {
                log::trace!("{} {} matched route {}", method, path, route.pattern());
                Some(RouteMatch { route, remainder })
            }
            None => {
                log::trace!("{} {} matched no route", method, path);
                None
            }
        }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// True if a method-agnostic `/` route exists.
    pub fn has_catch_all(&self) -> bool {
        self.routes
            .iter()
            .any(|r| r.pattern.method().is_none() && r.pattern.path() == "/")
    }
}

fn parse_destination(pattern: &str, destination: &str) -> Result<Url, RouteError> {
    let invalid = |reason: String| RouteError::InvalidDestination {
        pattern: pattern.to_string(),
        destination: destination.to_string(),
        reason,
    };

    let url = Url::parse(destination).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}
