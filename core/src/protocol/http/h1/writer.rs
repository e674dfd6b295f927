/*
 * writer.rs
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

//! Response head serialization and chunked body framing. The head carries
//! status line plus canonicalized headers; Date, Server, framing and
//! Connection headers are supplied here when the handler did not set them.

use bytes::{BufMut, BytesMut};

use crate::protocol::http::response::StatusCode;

/// Identification sent in the Server header when the handler set none.
pub const SERVER_TOKEN: &str = "Locanda/0.1";

/// Wire framing decided for one response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFraming {
    /// Content-Length: N, exactly N body bytes follow.
    Length(u64),
    /// Transfer-Encoding: chunked.
    Chunked,
    /// No body and no framing headers (1xx, 204, 304, upgrade responses).
    None,
}

/// Response head under serialization: status plus ordered headers.
pub struct ResponseHead {
    pub status: StatusCode,
    headers: Vec<(String, String)>,
}

/// Canonical header-name form: each `-`-separated segment capitalized
/// (`content-length` → `Content-Length`). Keeps re-serialization stable.
fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, seg) in name.split('-').enumerate() {
        if i > 0 {
            out.push('-');
        }
        let mut chars = seg.chars();
        match chars.next() {
            Some(c) => {
                out.extend(c.to_uppercase());
                out.extend(chars.flat_map(|c| c.to_lowercase()));
            }
            None => {}
        }
    }
    out
}

/// Current time as RFC 7231 IMF-fixdate.
pub fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn with_headers(status: StatusCode, headers: Vec<(String, String)>) -> Self {
        Self { status, headers }
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    fn has(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Supply the automatic headers: Date, Server, framing, Connection.
    /// Handler-set values win; framing headers are authoritative here and
    /// replace whatever the handler set, keeping length and wire in step.
    pub fn finalize(&mut self, framing: WireFraming, close: bool) {
        if !self.has("Date") {
            self.headers.push(("Date".to_string(), http_date()));
        }
        if !self.has("Server") {
            self.headers
                .push(("Server".to_string(), SERVER_TOKEN.to_string()));
        }
        self.headers.retain(|(n, _)| {
            !n.eq_ignore_ascii_case("Content-Length")
                && !n.eq_ignore_ascii_case("Transfer-Encoding")
        });
        match framing {
            WireFraming::Length(n) => {
                self.headers
                    .push(("Content-Length".to_string(), n.to_string()));
            }
            WireFraming::Chunked => {
                self.headers
                    .push(("Transfer-Encoding".to_string(), "chunked".to_string()));
            }
            WireFraming::None => {}
        }
        if close && !self.has("Connection") {
            self.headers
                .push(("Connection".to_string(), "close".to_string()));
        }
    }

    /// Serialize `HTTP/1.1 CODE REASON CRLF` + headers + CRLF.
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_slice(b"HTTP/1.1 ");
        out.put_slice(self.status.0.to_string().as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.status.reason().as_bytes());
        out.put_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.put_slice(canonical_name(name).as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
    }
}

/// Frame one body piece as `SIZE_HEX CRLF DATA CRLF`. Empty pieces are
/// skipped: a zero-size chunk would terminate the body early.
pub fn encode_chunk(data: &[u8], out: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

/// Terminating `0 CRLF CRLF`.
pub fn encode_final_chunk(out: &mut BytesMut) {
    out.put_slice(b"0\r\n\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_names() {
        assert_eq!(canonical_name("content-length"), "Content-Length");
        assert_eq!(canonical_name("X-my-header"), "X-My-Header");
        assert_eq!(canonical_name("ETAG"), "Etag");
    }

    #[test]
    fn head_with_length() {
        let mut head = ResponseHead::new(StatusCode::OK);
        head.add("Content-Type", "text/plain");
        head.finalize(WireFraming::Length(2), false);
        let mut out = BytesMut::new();
        head.encode(&mut out);
        let s = String::from_utf8(out.to_vec()).unwrap();
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Type: text/plain\r\n"));
        assert!(s.contains("Content-Length: 2\r\n"));
        assert!(s.contains("Date: "));
        assert!(s.contains("Server: "));
        assert!(!s.contains("Transfer-Encoding"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn framing_headers_are_exclusive() {
        let mut head = ResponseHead::new(StatusCode::OK);
        // A handler-set Content-Length must not survive chunked framing.
        head.add("Content-Length", "999");
        head.finalize(WireFraming::Chunked, false);
        let mut out = BytesMut::new();
        head.encode(&mut out);
        let s = String::from_utf8(out.to_vec()).unwrap();
        assert!(!s.contains("Content-Length"));
        assert!(s.contains("Transfer-Encoding: chunked\r\n"));
    }

    #[test]
    fn close_header_on_request() {
        let mut head = ResponseHead::new(StatusCode::OK);
        head.finalize(WireFraming::Length(0), true);
        let mut out = BytesMut::new();
        head.encode(&mut out);
        let s = String::from_utf8(out.to_vec()).unwrap();
        assert!(s.contains("Connection: close\r\n"));
    }

    #[test]
    fn chunk_framing_shape() {
        let mut out = BytesMut::new();
        encode_chunk(b"Wikipedia", &mut out);
        encode_chunk(b"", &mut out);
        encode_final_chunk(&mut out);
        assert_eq!(&out[..], b"9\r\nWikipedia\r\n0\r\n\r\n".as_ref());
    }

    #[test]
    fn date_is_imf_fixdate_shaped() {
        let d = http_date();
        // e.g. "Tue, 15 Nov 1994 08:12:31 GMT"
        assert_eq!(d.len(), 29);
        assert!(d.ends_with(" GMT"));
        assert_eq!(&d[3..5], ", ");
    }
}
