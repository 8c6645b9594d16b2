// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use hyper::Method;
use once_cell::sync::Lazy;
use regex::Regex;

use super::RouteError;

static WILDCARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{[A-Za-z0-9_.]*\}?").expect("wildcard regex is valid"));

/// How a pattern's path is compared with a request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Trailing `/`: the path itself and everything below it
    Prefix,
    /// Only the path itself
    Exact,
}

/// A validated route pattern, `[METHOD ]/path[/]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    method: Option<Method>,
    path: String,
    kind: MatchKind,
}

impl RoutePattern {
    pub fn parse(raw: &str) -> Result<Self, RouteError> {
        let invalid = |reason: &str| RouteError::InvalidPattern {
            pattern: raw.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("pattern is empty"));
        }

        let (method, path) = match trimmed.split_once(char::is_whitespace) {
            Some((method, path)) => {
                let method = parse_method(method).ok_or_else(|| invalid("unknown method"))?;
                (Some(method), path.trim())
            }
            None => (None, trimmed),
        };

        if !path.starts_with('/') {
            return Err(invalid("path must start with '/'"));
        }
        if path.contains(char::is_whitespace) {
            return Err(invalid("path must not contain whitespace"));
        }
        if let Some(token) = WILDCARD.find(path) {
            return Err(RouteError::Wildcard {
                pattern: raw.to_string(),
                token: token.as_str().to_string(),
            });
        }
        if path.contains(['{', '}', '?', '#']) {
            return Err(invalid("path contains a reserved character"));
        }

        let kind = if path.ends_with('/') {
            MatchKind::Prefix
        } else {
            MatchKind::Exact
        };

        Ok(Self {
            raw: trimmed.to_string(),
            method,
            path: path.to_string(),
            kind,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> MatchKind {
        self.kind
    }

    /// Two patterns collide when they have the same method and path.
    pub(super) fn same_key(&self, other: &RoutePattern) -> bool {
        self.method == other.method && self.path == other.path
    }

    /// Remainder of `path` past this pattern, if it matches.
    pub(super) fn match_path<'p>(&self, path: &'p str) -> Option<&'p str> {
        match self.kind {
            MatchKind::Exact => (path == self.path).then_some(""),
            MatchKind::Prefix => path.strip_prefix(self.path.as_str()),
        }
    }

    /// How well the request method fits, `None` if it does not.
    pub(super) fn method_score(&self, method: &Method) -> Option<u8> {
        match &self.method {
            None => Some(0),
            Some(m) if m == method => Some(2),
            Some(m) if *m == Method::GET && *method == Method::HEAD => Some(1),
            Some(_) => None,
        }
    }

    /// Exact beats prefix; then longer paths win.
    pub(super) fn specificity(&self) -> (bool, usize) {
        (self.kind == MatchKind::Exact, self.path.len())
    }
}

fn parse_method(token: &str) -> Option<Method> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_uppercase()) {
        return None;
    }
    Method::from_bytes(token.as_bytes()).ok()
}
