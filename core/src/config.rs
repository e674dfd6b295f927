/*
 * config.rs
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

//! Server and per-route configuration. Plain structs with defaults; the
//! server holds one `ServerConfig` for its whole lifetime, routes carry a
//! `RouteConfig` (cache opt-in/TTL plus middleware list).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::http::aspect::Aspect;

/// Whole-server configuration. Every limit and timeout of the connection
/// engine is set here; routes can only narrow caching behaviour.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address the acceptor binds to.
    pub listen_addr: SocketAddr,
    /// Worker threads for the runtime the caller builds. Informational to
    /// the engine itself; `HttpServer::run` documents the mapping.
    pub worker_threads: usize,

    /// TLS: when enabled, `cert_path` and `key_path` must both be set.
    pub enable_tls: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,

    /// Largest buffered request body (Content-Length or decoded chunked).
    pub max_body_bytes: usize,
    /// Largest request head (request line + headers).
    pub max_header_bytes: usize,
    /// Largest single multipart part.
    pub max_part_bytes: usize,
    /// Maximum number of multipart parts in one request.
    pub max_parts: usize,
    /// Total body limit for upload (multipart / octet-stream) requests.
    pub max_upload_bytes: usize,

    /// No bytes in IDLE/READING without a partial request head.
    pub idle_timeout: Duration,
    /// First byte of a request head to end of headers.
    pub header_timeout: Duration,
    /// No progress on the write side.
    pub write_timeout: Duration,
    /// stop(): drain in-flight handlers up to this long, then force-close.
    pub shutdown_grace: Duration,

    /// Global response-cache switch; `RouteConfig::enable_cache` narrows it.
    pub enable_response_cache: bool,
    /// Default TTL for cached responses, seconds. 0 disables writing.
    pub cache_max_age: u64,
    /// Cache-Control max-age for static resources, seconds.
    pub static_resource_max_age: u64,
    /// Soft upper bound on cache entries before LRU eviction.
    pub cache_max_entries: usize,

    /// Directory for upload temp files.
    pub upload_dir: PathBuf,
    /// Directory served for GET requests by prefix match, if set.
    pub static_dir: Option<PathBuf>,
    /// Static files larger than this are sent with chunked framing.
    pub static_chunk_threshold: u64,

    /// Optional error pages: status code → file served as the body.
    pub error_pages: HashMap<u16, PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            worker_threads: 1,
            enable_tls: false,
            cert_path: None,
            key_path: None,
            max_body_bytes: 3 * 1024 * 1024,
            max_header_bytes: 8 * 1024,
            max_part_bytes: 64 * 1024 * 1024,
            max_parts: 1024,
            max_upload_bytes: 100 * 1024 * 1024,
            idle_timeout: Duration::from_secs(30),
            header_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            enable_response_cache: false,
            cache_max_age: 5,
            static_resource_max_age: 86400,
            cache_max_entries: 1024,
            upload_dir: std::env::temp_dir(),
            static_dir: None,
            static_chunk_threshold: 5 * 1024 * 1024,
            error_pages: HashMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Self::default()
        }
    }

    /// Enable TLS with the given PEM certificate chain and private key.
    pub fn with_tls(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.enable_tls = true;
        self.cert_path = Some(cert_path.into());
        self.key_path = Some(key_path.into());
        self
    }

    /// Register a file to serve as the body for an error status (e.g. 404, 500).
    pub fn error_page(mut self, status: u16, path: impl Into<PathBuf>) -> Self {
        self.error_pages.insert(status, path.into());
        self
    }
}

/// Per-route configuration: cache opt-in and the aspect (middleware) list.
/// One value per registered route; dispatch walks the aspect list in order.
#[derive(Clone, Default)]
pub struct RouteConfig {
    /// None inherits the server-wide `enable_response_cache`.
    pub enable_cache: Option<bool>,
    /// None inherits the server-wide `cache_max_age`.
    pub cache_ttl: Option<Duration>,
    /// Aspects wrapping the terminal handler, in declaration order.
    pub middleware: Vec<Arc<dyn Aspect>>,
}

impl RouteConfig {
    pub fn cached(ttl: Option<Duration>) -> Self {
        Self {
            enable_cache: Some(true),
            cache_ttl: ttl,
            middleware: Vec::new(),
        }
    }

    pub fn uncached() -> Self {
        Self {
            enable_cache: Some(false),
            cache_ttl: None,
            middleware: Vec::new(),
        }
    }

    pub fn with_aspect(mut self, aspect: Arc<dyn Aspect>) -> Self {
        self.middleware.push(aspect);
        self
    }
}
