/*
 * request.rs
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

//! HTTP request as seen by handlers: method, target, parsed path and query,
//! headers, cookies, body variant. Immutable once the parser has produced it;
//! header lookup is case-insensitive, storage order is preserved.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::protocol::http::upload::UploadPart;
use crate::urlcodec;

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Trace,
    Connect,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }

    /// Parse an uppercase method token. Unknown tokens are not represented;
    /// the parser maps them to 501.
    pub fn from_token(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "HEAD" => Some(Method::Head),
            "OPTIONS" => Some(Method::Options),
            "TRACE" => Some(Method::Trace),
            "CONNECT" => Some(Method::Connect),
            _ => None,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol version from the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// Body classification from Content-Type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    #[default]
    Unknown,
    String,
    Html,
    Json,
    UrlEncoded,
    Multipart,
    OctetStream,
    WebSocket,
}

impl ContentType {
    pub fn classify(content_type: Option<&str>, is_upgrade: bool) -> ContentType {
        if is_upgrade {
            return ContentType::WebSocket;
        }
        let ct = match content_type {
            Some(v) => v,
            None => return ContentType::Unknown,
        };
        let main = ct.split(';').next().unwrap_or("").trim();
        if main.eq_ignore_ascii_case("text/plain") {
            ContentType::String
        } else if main.eq_ignore_ascii_case("text/html") {
            ContentType::Html
        } else if main.eq_ignore_ascii_case("application/json") {
            ContentType::Json
        } else if main.eq_ignore_ascii_case("application/x-www-form-urlencoded") {
            ContentType::UrlEncoded
        } else if main.eq_ignore_ascii_case("multipart/form-data") {
            ContentType::Multipart
        } else if main.eq_ignore_ascii_case("application/octet-stream") {
            ContentType::OctetStream
        } else {
            ContentType::Unknown
        }
    }
}

/// Request body variant. Buffered bodies are capped by `max_body_bytes`;
/// upload bodies land in temp files owned by the handler.
#[derive(Debug, Default)]
pub enum Body {
    /// No body on the wire.
    #[default]
    None,
    /// Fully buffered (Content-Length or decoded chunked).
    Bytes(Bytes),
    /// Multipart or octet-stream body streamed to temp files.
    Uploads(Vec<UploadPart>),
    /// Connection upgraded; payloads arrive through the WebSocket engine.
    WebSocket,
}

/// One parsed request. Produced by the connection engine, handed to the
/// handler together with the mutable response; never mutated afterwards.
#[derive(Debug, Default)]
pub struct Request {
    pub method: Option<Method>,
    /// Raw request target as received (before decoding).
    pub target: String,
    /// Decoded path component.
    pub path: String,
    /// Ordered (key, value) pairs: query string first, then urlencoded form
    /// fields, then router captures (placeholders by name, wildcard by index).
    pub query: Vec<(String, String)>,
    pub version: Version,
    /// Ordered headers as received.
    pub headers: Vec<(String, String)>,
    pub body: Body,
    pub content_type: ContentType,
    pub cookies: HashMap<String, String>,
    /// Peer address, from the acceptor.
    pub remote_addr: Option<SocketAddr>,
}

impl Default for Version {
    fn default() -> Self {
        Version::Http11
    }
}

impl Request {
    /// First header value for `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in order.
    pub fn header_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Query or form value by key.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Indexed query value; wildcard captures land at the end of the list.
    pub fn query_value_at(&self, index: usize) -> Option<&str> {
        self.query.get(index).map(|(_, v)| v.as_str())
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(|v| v.as_str())
    }

    /// Buffered body bytes, empty for other variants.
    pub fn body_bytes(&self) -> &[u8] {
        match &self.body {
            Body::Bytes(b) => b,
            _ => &[],
        }
    }

    /// Upload parts for multipart/octet-stream requests.
    pub fn upload_parts(&self) -> &[UploadPart] {
        match &self.body {
            Body::Uploads(parts) => parts,
            _ => &[],
        }
    }

    /// Take ownership of the upload parts (and with it responsibility for
    /// deleting their temp files).
    pub fn take_upload_parts(&mut self) -> Vec<UploadPart> {
        match std::mem::take(&mut self.body) {
            Body::Uploads(parts) => parts,
            other => {
                self.body = other;
                Vec::new()
            }
        }
    }

    /// True when the client asked for connection close, or the protocol
    /// default (HTTP/1.0 without keep-alive) implies it.
    pub fn wants_close(&self) -> bool {
        match self.header("Connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => true,
            Some(v) if v.to_ascii_lowercase().contains("keep-alive") => false,
            Some(_) | None => self.version == Version::Http10,
        }
    }

    /// Split the raw target into decoded path and parsed query pairs.
    pub(crate) fn set_target(&mut self, target: String) {
        match target.find('?') {
            Some(q) => {
                self.path = urlcodec::url_decode(&target[..q]);
                self.query = urlcodec::parse_query(&target[q + 1..]);
            }
            None => {
                self.path = urlcodec::url_decode(&target);
                self.query = Vec::new();
            }
        }
        self.target = target;
    }

    /// Parse Cookie headers into the name → value map. Later duplicates win.
    pub(crate) fn parse_cookies(&mut self) {
        let mut cookies = HashMap::new();
        for value in self
            .headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("Cookie"))
            .map(|(_, v)| v.clone())
        {
            for pair in value.split(';') {
                let pair = pair.trim();
                if let Some(eq) = pair.find('=') {
                    cookies.insert(pair[..eq].to_string(), pair[eq + 1..].to_string());
                }
            }
        }
        self.cookies = cookies;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_split() {
        let mut req = Request::default();
        req.set_target("/a%20b?x=1&y=two+words".to_string());
        assert_eq!(req.path, "/a b");
        assert_eq!(req.query_value("x"), Some("1"));
        assert_eq!(req.query_value("y"), Some("two words"));
        assert_eq!(req.target, "/a%20b?x=1&y=two+words");
    }

    #[test]
    fn header_lookup_case_insensitive() {
        let req = Request {
            headers: vec![
                ("Content-Type".to_string(), "text/html".to_string()),
                ("X-Dup".to_string(), "1".to_string()),
                ("x-dup".to_string(), "2".to_string()),
            ],
            ..Default::default()
        };
        assert_eq!(req.header("content-type"), Some("text/html"));
        let all: Vec<_> = req.header_all("X-DUP").collect();
        assert_eq!(all, vec!["1", "2"]);
    }

    #[test]
    fn cookie_parsing() {
        let mut req = Request {
            headers: vec![(
                "Cookie".to_string(),
                "sid=abc123; theme=dark".to_string(),
            )],
            ..Default::default()
        };
        req.parse_cookies();
        assert_eq!(req.cookie("sid"), Some("abc123"));
        assert_eq!(req.cookie("theme"), Some("dark"));
    }

    #[test]
    fn close_semantics() {
        let mut req = Request::default();
        req.version = Version::Http10;
        assert!(req.wants_close());
        req.headers
            .push(("Connection".to_string(), "keep-alive".to_string()));
        assert!(!req.wants_close());

        let mut req = Request::default();
        assert!(!req.wants_close());
        req.headers
            .push(("Connection".to_string(), "close".to_string()));
        assert!(req.wants_close());
    }

    #[test]
    fn content_type_classification() {
        assert_eq!(
            ContentType::classify(Some("application/json; charset=utf-8"), false),
            ContentType::Json
        );
        assert_eq!(
            ContentType::classify(Some("multipart/form-data; boundary=xyz"), false),
            ContentType::Multipart
        );
        assert_eq!(ContentType::classify(None, true), ContentType::WebSocket);
        assert_eq!(ContentType::classify(None, false), ContentType::Unknown);
    }
}
