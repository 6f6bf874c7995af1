//! Routing proxy: first-match-wins host pattern table (C6)

use crate::common::error::{Error, Result};
use crate::upstream::Upstream;
use regex::RegexBuilder;

/// A single routing rule: `hostPattern` is matched case-insensitively,
/// unanchored (`test`-style containment), against the target host
/// authority (`hostname:port`), unless the pattern itself anchors with
/// `^`/`$`.
#[derive(Clone)]
pub struct Route {
    pub label: String,
    pub host_pattern: String,
    pub upstream: Option<Upstream>,
    compiled: regex::Regex,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("label", &self.label)
            .field("host_pattern", &self.host_pattern)
            .field("upstream", &self.upstream)
            .finish()
    }
}

impl Route {
    /// Compile `host_pattern`; invalid patterns are rejected here rather
    /// than at match time.
    pub fn new(
        label: impl Into<String>,
        host_pattern: impl Into<String>,
        upstream: Option<Upstream>,
    ) -> Result<Self> {
        let host_pattern = host_pattern.into();
        let compiled = RegexBuilder::new(&host_pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::route(format!("Invalid host pattern '{}': {}", host_pattern, e)))?;
        Ok(Route {
            label: label.into(),
            host_pattern,
            upstream,
            compiled,
        })
    }

    fn matches(&self, host: &str) -> bool {
        self.compiled.is_match(host)
    }
}

/// Ordered sequence of [`Route`]; the first matching route wins. Routes
/// may share a label; `remove_routes` removes every route with that label
/// in one call.
#[derive(Default)]
pub struct RoutingTable {
    routes: Vec<Route>,
    default_upstream: Option<Upstream>,
}

const DEFAULT_LABEL: &str = "default";

impl RoutingTable {
    pub fn new(default_upstream: Option<Upstream>) -> Self {
        RoutingTable {
            routes: Vec::new(),
            default_upstream,
        }
    }

    /// Insert `route` at `index` (front of the table by default, so the
    /// most recently inserted routes take priority over older ones).
    pub fn insert_route(&mut self, mut route: Route, index: Option<usize>) {
        if route.label.is_empty() {
            route.label = DEFAULT_LABEL.to_string();
        }
        let index = index.unwrap_or(0).min(self.routes.len());
        self.routes.insert(index, route);
    }

    pub fn clear_routes(&mut self) {
        self.routes.clear();
    }

    /// Remove every route carrying `label`. Returns the number removed.
    pub fn remove_routes(&mut self, label: &str) -> usize {
        let before = self.routes.len();
        self.routes.retain(|r| r.label != label);
        before - self.routes.len()
    }

    pub fn set_default_upstream(&mut self, upstream: Option<Upstream>) {
        self.default_upstream = upstream;
    }

    pub fn default_upstream(&self) -> Option<&Upstream> {
        self.default_upstream.as_ref()
    }

    /// First route whose pattern matches `host`; `defaultUpstream` if none
    /// match.
    pub fn match_route(&self, host: &str) -> Option<Upstream> {
        for route in &self.routes {
            if route.matches(host) {
                return route.upstream.clone();
            }
        }
        self.default_upstream.clone()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
