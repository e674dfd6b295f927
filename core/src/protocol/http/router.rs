/*
 * router.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Locanda, an embeddable HTTP server library.
 *
 * Locanda is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Locanda is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Locanda.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Method + path → handler lookup. Patterns are `/`-separated segments:
//! literal, `:name` placeholder, or a trailing `*` capturing the remainder.
//! Literals win over placeholders, placeholders over wildcards; among
//! candidates the longer literal prefix wins. The table is immutable once
//! the server starts; registration is a build-time step.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::RouteConfig;
use crate::protocol::http::connection::ConnectionHandle;
use crate::protocol::http::request::{Method, Request};
use crate::protocol::http::response::Response;

/// Error a handler surfaces; the engine converts it to a 500.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Terminal handler: builds the response in place. Async; must not block.
pub type Handler = Arc<
    dyn for<'a> Fn(&'a mut Request, &'a mut Response, ConnectionHandle) -> HandlerFuture<'a>
        + Send
        + Sync,
>;

/// Wrap a boxing closure into a `Handler`. The closure usually just calls an
/// async fn: `handler_fn(|req, res, conn| Box::pin(my_handler(req, res, conn)))`.
pub fn handler_fn<F>(f: F) -> Handler
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response, ConnectionHandle) -> HandlerFuture<'a>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// Same (method, pattern) registered twice.
    DuplicateRoute(String),
    /// Pattern is not well-formed (e.g. `*` not in final position).
    InvalidPattern(String),
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterError::DuplicateRoute(p) => write!(f, "duplicate route: {}", p),
            RouterError::InvalidPattern(p) => write!(f, "invalid route pattern: {}", p),
        }
    }
}

impl std::error::Error for RouterError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    segments: Vec<Segment>,
    /// Trailing `*`: matches any remainder, captured as one value.
    wildcard: bool,
}

impl Pattern {
    fn parse(pattern: &str) -> Result<Pattern, RouterError> {
        let mut segments = Vec::new();
        let mut wildcard = false;
        let trimmed = pattern.strip_prefix('/').unwrap_or(pattern);
        let parts: Vec<&str> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split('/').collect()
        };
        for (i, part) in parts.iter().enumerate() {
            if *part == "*" {
                if i != parts.len() - 1 {
                    return Err(RouterError::InvalidPattern(pattern.to_string()));
                }
                wildcard = true;
            } else if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(RouterError::InvalidPattern(pattern.to_string()));
                }
                segments.push(Segment::Param(name.to_string()));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Ok(Pattern { segments, wildcard })
    }

    /// Match a decoded path. Returns captures (named placeholders in order,
    /// wildcard remainder keyed by empty string) and the literal-prefix
    /// length used for tie-breaking.
    fn matches(&self, path: &str) -> Option<(Vec<(String, String)>, usize)> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let parts: Vec<&str> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split('/').collect()
        };
        if self.wildcard {
            if parts.len() < self.segments.len() {
                return None;
            }
        } else if parts.len() != self.segments.len() {
            return None;
        }
        let mut captures = Vec::new();
        let mut literal_prefix = 0;
        let mut literal_ended = false;
        for (seg, part) in self.segments.iter().zip(parts.iter()) {
            match seg {
                Segment::Literal(lit) => {
                    if lit != part {
                        return None;
                    }
                    if !literal_ended {
                        literal_prefix += 1;
                    }
                }
                Segment::Param(name) => {
                    literal_ended = true;
                    captures.push((name.clone(), (*part).to_string()));
                }
            }
        }
        if self.wildcard {
            let remainder = parts[self.segments.len()..].join("/");
            captures.push((String::new(), remainder));
        }
        Some((captures, literal_prefix))
    }
}

/// One registered route: handler plus its per-route configuration.
pub struct Route {
    pub methods: Vec<Method>,
    pub pattern_text: String,
    pattern: Pattern,
    pub handler: Handler,
    pub config: RouteConfig,
}

/// Outcome of `resolve`.
pub enum Resolution {
    /// Matched; captures are appended to the request query by the engine.
    Found {
        route: Arc<Route>,
        captures: Vec<(String, String)>,
    },
    /// Path known, method not registered → 405 with Allow.
    MethodNotAllowed(Vec<Method>),
    /// OPTIONS with no explicit OPTIONS route → auto 200 with Allow.
    AutoOptions(Vec<Method>),
    NotFound,
}

#[derive(Default)]
pub struct Router {
    routes: Vec<Arc<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a method set and pattern. Registering the same
    /// (method, pattern) twice fails.
    pub fn register(
        &mut self,
        methods: &[Method],
        pattern: &str,
        handler: Handler,
        config: RouteConfig,
    ) -> Result<(), RouterError> {
        let parsed = Pattern::parse(pattern)?;
        for route in &self.routes {
            if route.pattern == parsed && route.methods.iter().any(|m| methods.contains(m)) {
                return Err(RouterError::DuplicateRoute(pattern.to_string()));
            }
        }
        self.routes.push(Arc::new(Route {
            methods: methods.to_vec(),
            pattern_text: pattern.to_string(),
            pattern: parsed,
            handler,
            config,
        }));
        Ok(())
    }

    /// Find the handler for (method, path). Deterministic: candidates are
    /// ranked non-wildcard first, then by longer literal prefix, then by
    /// fewer placeholders, then registration order.
    pub fn resolve(&self, method: Method, path: &str) -> Resolution {
        let mut best: Option<(usize, usize, usize, Arc<Route>, Vec<(String, String)>)> = None;
        let mut allowed: Vec<Method> = Vec::new();
        for route in &self.routes {
            let (captures, literal_prefix) = match route.pattern.matches(path) {
                Some(m) => m,
                None => continue,
            };
            for m in &route.methods {
                if !allowed.contains(m) {
                    allowed.push(*m);
                }
            }
            if !route.methods.contains(&method) {
                continue;
            }
            let wildcard_rank = route.pattern.wildcard as usize;
            let params = route
                .pattern
                .segments
                .iter()
                .filter(|s| matches!(s, Segment::Param(_)))
                .count();
            let better = match &best {
                None => true,
                Some((bw, bl, bp, _, _)) => {
                    (wildcard_rank, std::cmp::Reverse(literal_prefix), params)
                        < (*bw, std::cmp::Reverse(*bl), *bp)
                }
            };
            if better {
                best = Some((wildcard_rank, literal_prefix, params, route.clone(), captures));
            }
        }
        if let Some((_, _, _, route, captures)) = best {
            return Resolution::Found { route, captures };
        }
        if !allowed.is_empty() {
            if method == Method::Options {
                return Resolution::AutoOptions(allowed);
            }
            return Resolution::MethodNotAllowed(allowed);
        }
        Resolution::NotFound
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Format an Allow header value from a method list.
pub fn allow_header(methods: &[Method]) -> String {
    let mut out = String::new();
    for (i, m) in methods.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(m.as_str());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        Arc::new(|_req, _res, _conn| Box::pin(async { Ok(()) }))
    }

    fn router_with(patterns: &[(&[Method], &str)]) -> Router {
        let mut router = Router::new();
        for (methods, pattern) in patterns {
            router
                .register(methods, pattern, noop(), RouteConfig::default())
                .unwrap();
        }
        router
    }

    #[test]
    fn literal_beats_param_beats_wildcard() {
        let router = router_with(&[
            (&[Method::Get], "/a/b"),
            (&[Method::Get], "/a/:x"),
            (&[Method::Get], "/a/*"),
        ]);
        match router.resolve(Method::Get, "/a/b") {
            Resolution::Found { route, .. } => assert_eq!(route.pattern_text, "/a/b"),
            _ => panic!("expected match"),
        }
        match router.resolve(Method::Get, "/a/c") {
            Resolution::Found { route, captures } => {
                assert_eq!(route.pattern_text, "/a/:x");
                assert_eq!(captures, vec![("x".to_string(), "c".to_string())]);
            }
            _ => panic!("expected match"),
        }
        match router.resolve(Method::Get, "/a/c/d") {
            Resolution::Found { route, captures } => {
                assert_eq!(route.pattern_text, "/a/*");
                assert_eq!(captures, vec![(String::new(), "c/d".to_string())]);
            }
            _ => panic!("expected match"),
        }
    }

    #[test]
    fn longer_literal_prefix_wins() {
        let router = router_with(&[
            (&[Method::Get], "/a/:x/c"),
            (&[Method::Get], "/a/b/:y"),
        ]);
        match router.resolve(Method::Get, "/a/b/c") {
            Resolution::Found { route, .. } => assert_eq!(route.pattern_text, "/a/b/:y"),
            _ => panic!("expected match"),
        }
    }

    #[test]
    fn wildcard_captures_remainder_with_slashes() {
        let router = router_with(&[(&[Method::Get], "/pathinfo/*")]);
        match router.resolve(Method::Get, "/pathinfo/x/y/z") {
            Resolution::Found { captures, .. } => {
                assert_eq!(captures[0].1, "x/y/z");
            }
            _ => panic!("expected match"),
        }
    }

    #[test]
    fn method_not_allowed_lists_methods() {
        let router = router_with(&[(&[Method::Get, Method::Post], "/only")]);
        match router.resolve(Method::Put, "/only") {
            Resolution::MethodNotAllowed(allow) => {
                assert_eq!(allow_header(&allow), "GET, POST");
            }
            _ => panic!("expected 405"),
        }
    }

    #[test]
    fn auto_options() {
        let router = router_with(&[(&[Method::Get], "/r")]);
        assert!(matches!(
            router.resolve(Method::Options, "/r"),
            Resolution::AutoOptions(_)
        ));

        // An explicit OPTIONS registration takes over.
        let router = router_with(&[
            (&[Method::Get], "/r"),
            (&[Method::Options], "/r"),
        ]);
        assert!(matches!(
            router.resolve(Method::Options, "/r"),
            Resolution::Found { .. }
        ));
    }

    #[test]
    fn duplicate_route_rejected() {
        let mut router = router_with(&[(&[Method::Get], "/dup")]);
        let err = router
            .register(&[Method::Get], "/dup", noop(), RouteConfig::default())
            .unwrap_err();
        assert!(matches!(err, RouterError::DuplicateRoute(_)));
        // Same pattern, disjoint methods is fine.
        router
            .register(&[Method::Post], "/dup", noop(), RouteConfig::default())
            .unwrap();
    }

    #[test]
    fn not_found() {
        let router = router_with(&[(&[Method::Get], "/a")]);
        assert!(matches!(
            router.resolve(Method::Get, "/zzz"),
            Resolution::NotFound
        ));
    }

    #[test]
    fn wildcard_not_final_rejected() {
        let mut router = Router::new();
        let err = router
            .register(&[Method::Get], "/a/*/b", noop(), RouteConfig::default())
            .unwrap_err();
        assert!(matches!(err, RouterError::InvalidPattern(_)));
    }

    #[test]
    fn root_pattern() {
        let router = router_with(&[(&[Method::Get], "/")]);
        assert!(matches!(
            router.resolve(Method::Get, "/"),
            Resolution::Found { .. }
        ));
    }
}
