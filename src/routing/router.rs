//! Route lookup.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Look up the matching route for a request
//! - Return matched route or explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) scan (acceptable for typical route counts)
//! - Explicit `None` rather than silent default

use axum::body::Body;
use axum::http::Request;

use super::matcher::{AndMatcher, HostMatcher, Matcher, PathPrefixMatcher};
use crate::config::RouteConfig;

/// A compiled route.
#[derive(Debug)]
pub struct Route {
    pub name: String,
    pub pipeline: String,
    pub priority: u32,
    matcher: AndMatcher,
}

impl Route {
    pub fn compile(config: &RouteConfig) -> Self {
        let mut matchers: Vec<Box<dyn Matcher>> = Vec::new();
        if let Some(host) = config.host.as_deref().filter(|h| !h.is_empty()) {
            matchers.push(Box::new(HostMatcher::new(host)));
        }
        if let Some(prefix) = config.path_prefix.as_deref().filter(|p| !p.is_empty()) {
            matchers.push(Box::new(PathPrefixMatcher::new(prefix)));
        }
        Self {
            name: config.name.clone(),
            pipeline: config.pipeline.clone(),
            priority: config.priority,
            matcher: AndMatcher::new(matchers),
        }
    }

    pub fn matches(&self, req: &Request<Body>) -> bool {
        self.matcher.matches(req)
    }
}

/// Priority-ordered route list.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn from_config(configs: &[RouteConfig]) -> Self {
        let mut routes: Vec<Route> = configs.iter().map(Route::compile).collect();
        // Stable: equal priorities keep declaration order.
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { routes }
    }

    pub fn match_request(&self, req: &Request<Body>) -> Option<&Route> {
        self.routes.iter().find(|r| r.matches(req))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str, host: Option<&str>, prefix: Option<&str>, priority: u32) -> RouteConfig {
        RouteConfig {
            name: name.into(),
            host: host.map(Into::into),
            path_prefix: prefix.map(Into::into),
            pipeline: format!("{}-pipeline", name),
            priority,
        }
    }

    fn request(host: &str, path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header("host", host)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_priority_ordering() {
        let table = RouteTable::from_config(&[
            route("catch-all", None, None, 0),
            route("api", None, Some("/api"), 10),
            route("api-v2", Some("api.example.com"), Some("/api"), 20),
        ]);

        let hit = |host, path| table.match_request(&request(host, path)).map(|r| r.name.as_str());
        assert_eq!(hit("api.example.com", "/api/users"), Some("api-v2"));
        assert_eq!(hit("other.example.com", "/api/users"), Some("api"));
        assert_eq!(hit("other.example.com", "/static"), Some("catch-all"));
    }

    #[test]
    fn test_equal_priority_keeps_declaration_order() {
        let table = RouteTable::from_config(&[
            route("first", None, Some("/"), 1),
            route("second", None, Some("/"), 1),
        ]);
        let matched = table.match_request(&request("x", "/a")).unwrap();
        assert_eq!(matched.name, "first");
        assert_eq!(matched.pipeline, "first-pipeline");
    }

    #[test]
    fn test_no_match() {
        let table = RouteTable::from_config(&[route("api", None, Some("/api"), 0)]);
        assert!(table.match_request(&request("x", "/other")).is_none());
        assert!(RouteTable::default().match_request(&request("x", "/")).is_none());
    }
}
