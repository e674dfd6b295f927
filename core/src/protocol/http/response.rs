/*
 * response.rs
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

//! HTTP response under construction by a handler. Mutable until the writer
//! takes it; headers are ordered and may repeat. The body is one of: empty,
//! inline bytes, a file, a chunk generator, or raw bytes written verbatim.

use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Status code plus canonical reason phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u16);

impl Default for StatusCode {
    fn default() -> Self {
        StatusCode::OK
    }
}

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const SWITCHING_PROTOCOLS: StatusCode = StatusCode(101);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);

    pub fn reason(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            411 => "Length Required",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            416 => "Range Not Satisfiable",
            431 => "Request Header Fields Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            503 => "Service Unavailable",
            505 => "HTTP Version Not Supported",
            _ => "Unknown",
        }
    }
}

/// Content coding applied to the body by the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    #[default]
    None,
    Gzip,
    Deflate,
    Brotli,
}

impl ContentEncoding {
    pub fn token(&self) -> Option<&'static str> {
        match self {
            ContentEncoding::None => None,
            ContentEncoding::Gzip => Some("gzip"),
            ContentEncoding::Deflate => Some("deflate"),
            ContentEncoding::Brotli => Some("br"),
        }
    }
}

/// Per-response cache directive, overriding the route's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Follow the route / server configuration.
    #[default]
    Inherit,
    ForceOn,
    ForceOff,
    /// Cache with this TTL regardless of configured default.
    MaxAge(Duration),
}

/// Generator for a chunked body: called repeatedly, returns the next chunk
/// or None when exhausted.
pub type ChunkGenerator = Box<dyn FnMut() -> Option<Bytes> + Send + Sync>;

/// Response body variant.
#[derive(Default)]
pub enum BodyKind {
    #[default]
    Empty,
    /// Inline bytes; Content-Length framing.
    Bytes(Bytes),
    /// File streamed from disk; Content-Length framing (chunked for large
    /// static files is decided by the static file layer).
    File(PathBuf),
    /// Chunk generator; Transfer-Encoding: chunked framing.
    Chunked(ChunkGenerator),
    /// Written verbatim after the header block, no framing added.
    Raw(Bytes),
}

impl std::fmt::Debug for BodyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodyKind::Empty => f.write_str("Empty"),
            BodyKind::Bytes(b) => write!(f, "Bytes({})", b.len()),
            BodyKind::File(p) => write!(f, "File({})", p.display()),
            BodyKind::Chunked(_) => f.write_str("Chunked(..)"),
            BodyKind::Raw(b) => write!(f, "Raw({})", b.len()),
        }
    }
}

/// Response being built by a handler. Frozen by the writer: once any byte is
/// on the wire the connection rejects further header mutation by taking the
/// response out of the handler's reach.
#[derive(Debug, Default)]
pub struct Response {
    pub status: Option<StatusCode>,
    headers: Vec<(String, String)>,
    pub body: BodyKind,
    pub content_encoding: ContentEncoding,
    /// Defer the send until `ConnectionHandle::response_now` fires.
    pub delay: bool,
    pub cache_policy: CachePolicy,
    /// Attribute bag for templating layers; values are free-form JSON.
    attrs: HashMap<String, serde_json::Value>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set status and inline body in one call.
    pub fn set_status_and_content(&mut self, status: StatusCode, content: impl Into<Bytes>) {
        self.status = Some(status);
        self.body = BodyKind::Bytes(content.into());
    }

    /// 200 with a text body.
    pub fn render_string(&mut self, content: impl Into<Bytes>) {
        self.set_status_and_content(StatusCode::OK, content);
        self.set_header_if_absent("Content-Type", "text/plain; charset=utf-8");
    }

    /// 200 with a JSON body.
    pub fn render_json(&mut self, value: &serde_json::Value) {
        self.set_status_and_content(StatusCode::OK, value.to_string());
        self.set_header_if_absent("Content-Type", "application/json");
    }

    /// 302 redirect.
    pub fn redirect(&mut self, location: impl Into<String>) {
        self.status = Some(StatusCode(302));
        self.set_header("Location", location.into());
        self.body = BodyKind::Empty;
    }

    /// Serve a file as the body (Content-Length framing).
    pub fn render_file(&mut self, path: impl Into<PathBuf>) {
        self.status = Some(StatusCode::OK);
        self.body = BodyKind::File(path.into());
    }

    /// Chunked body from a generator.
    pub fn render_chunked(&mut self, generator: ChunkGenerator) {
        self.status = Some(StatusCode::OK);
        self.body = BodyKind::Chunked(generator);
    }

    /// Append a header; duplicates are permitted and written in order.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Replace all values of `name` with one value.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    pub fn set_header_if_absent(&mut self, name: &str, value: &str) {
        if self.header(name).is_none() {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Defer the send; the connection waits for `response_now`.
    pub fn set_delay(&mut self, delay: bool) {
        self.delay = delay;
    }

    pub fn set_cache_policy(&mut self, policy: CachePolicy) {
        self.cache_policy = policy;
    }

    pub fn set_content_encoding(&mut self, encoding: ContentEncoding) {
        self.content_encoding = encoding;
    }

    /// Set a templating attribute.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.attrs.insert(name.into(), value.into());
    }

    pub fn attr(&self, name: &str) -> Option<&serde_json::Value> {
        self.attrs.get(name)
    }

    /// Reset for reuse on the next request of a keep-alive connection.
    pub fn reset(&mut self) {
        self.status = None;
        self.headers.clear();
        self.body = BodyKind::Empty;
        self.content_encoding = ContentEncoding::None;
        self.delay = false;
        self.cache_policy = CachePolicy::Inherit;
        self.attrs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons() {
        assert_eq!(StatusCode(200).reason(), "OK");
        assert_eq!(StatusCode(405).reason(), "Method Not Allowed");
        assert_eq!(StatusCode(431).reason(), "Request Header Fields Too Large");
        assert_eq!(StatusCode(299).reason(), "Unknown");
    }

    #[test]
    fn header_replace_vs_append() {
        let mut res = Response::new();
        res.add_header("X-A", "1");
        res.add_header("X-A", "2");
        assert_eq!(
            res.headers()
                .iter()
                .filter(|(n, _)| n == "X-A")
                .count(),
            2
        );
        res.set_header("x-a", "3");
        assert_eq!(res.header("X-A"), Some("3"));
        assert_eq!(
            res.headers()
                .iter()
                .filter(|(n, _)| n.eq_ignore_ascii_case("x-a"))
                .count(),
            1
        );
    }

    #[test]
    fn redirect_sets_location() {
        let mut res = Response::new();
        res.redirect("/json");
        assert_eq!(res.status, Some(StatusCode(302)));
        assert_eq!(res.header("Location"), Some("/json"));
    }

    #[test]
    fn attr_bag() {
        let mut res = Response::new();
        res.set_attr("number", 1024);
        res.set_attr("text", "hello");
        assert_eq!(res.attr("number"), Some(&serde_json::json!(1024)));
        assert_eq!(res.attr("text"), Some(&serde_json::json!("hello")));
    }
}
