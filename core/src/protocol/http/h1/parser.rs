/*
 * parser.rs
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

//! HTTP/1.x request push parser: request line, headers, body (Content-Length
//! or chunked with trailers). Feed bytes via `receive`; handler is invoked as
//! complete tokens are parsed, state survives partial reads. The connection
//! decides body framing after headers via `set_body_mode`.

use bytes::{Buf, BytesMut};

use crate::protocol::http::request::{Method, Version};

/// Largest accepted request target.
const MAX_TARGET_BYTES: usize = 8 * 1024;
/// Largest accepted method token.
const MAX_METHOD_BYTES: usize = 16;

/// Parse failure with its wire status code (spec: §7 error mapping).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Malformed bytes or conflicting framing headers → 400.
    BadRequest(&'static str),
    /// Request head over the header budget → 431.
    HeaderTooLarge,
    /// Body over the body budget → 413.
    BodyTooLarge,
    /// Request target over 8 KiB → 414.
    TargetTooLong,
    /// Method token is well-formed but unknown → 501.
    UnknownMethod,
    /// Version is not 1.0 or 1.1 → 505.
    VersionNotSupported,
}

impl ParseError {
    pub fn status(&self) -> u16 {
        match self {
            ParseError::BadRequest(_) => 400,
            ParseError::HeaderTooLarge => 431,
            ParseError::BodyTooLarge => 413,
            ParseError::TargetTooLong => 414,
            ParseError::UnknownMethod => 501,
            ParseError::VersionNotSupported => 505,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            ParseError::HeaderTooLarge => f.write_str("request head too large"),
            ParseError::BodyTooLarge => f.write_str("request body too large"),
            ParseError::TargetTooLong => f.write_str("request target too long"),
            ParseError::UnknownMethod => f.write_str("unknown method"),
            ParseError::VersionNotSupported => f.write_str("unsupported HTTP version"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Callback for request events. The connection implements this and builds
/// the `Request` as tokens arrive.
pub trait H1RequestHandler {
    fn request_line(&mut self, method: Method, target: &str, version: Version);
    fn header(&mut self, name: &str, value: &str);
    fn body_chunk(&mut self, data: &[u8]);
    fn trailer(&mut self, name: &str, value: &str);
    fn complete(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    /// Head done; connection must call `set_body_mode` before feeding more.
    HeadersComplete,
    Body,
    ChunkSize,
    ChunkData,
    /// CRLF after a chunk's data.
    ChunkDataEnd,
    ChunkTrailer,
    Complete,
}

/// Body framing derived from the header block. `Content-Length` and chunked
/// transfer are mutually exclusive; duplicate differing Content-Length values
/// are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    ContentLength(u64),
    Chunked,
}

impl BodyFraming {
    pub fn from_headers(headers: &[(String, String)]) -> Result<BodyFraming, ParseError> {
        let mut chunked = false;
        for v in headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("Transfer-Encoding"))
            .map(|(_, v)| v)
        {
            if v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")) {
                chunked = true;
            } else {
                return Err(ParseError::BadRequest("unsupported transfer coding"));
            }
        }
        let mut content_length: Option<u64> = None;
        for v in headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
            .map(|(_, v)| v)
        {
            let n = parse_decimal(v.trim())
                .ok_or(ParseError::BadRequest("invalid Content-Length"))?;
            match content_length {
                Some(prev) if prev != n => {
                    return Err(ParseError::BadRequest("conflicting Content-Length"));
                }
                _ => content_length = Some(n),
            }
        }
        match (chunked, content_length) {
            (true, Some(_)) => Err(ParseError::BadRequest(
                "Content-Length with chunked transfer",
            )),
            (true, None) => Ok(BodyFraming::Chunked),
            (false, Some(n)) => Ok(BodyFraming::ContentLength(n)),
            (false, None) => Ok(BodyFraming::None),
        }
    }
}

/// Strict decimal parse: digits only, no sign, no whitespace, ≤ 2^63−1.
fn parse_decimal(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u64 = s.parse().ok()?;
    if n > i64::MAX as u64 {
        return None;
    }
    Some(n)
}

/// Strict hex parse for chunk sizes: hex digits only, no sign, no
/// whitespace, ≤ 2^63−1.
fn parse_hex(s: &str) -> Option<u64> {
    if s.is_empty() || s.len() > 16 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let n = u64::from_str_radix(s, 16).ok()?;
    if n > i64::MAX as u64 {
        return None;
    }
    Some(n)
}

fn is_token_byte(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~')
        || b.is_ascii_alphanumeric()
}

/// Push parser for one HTTP/1.x request. Reusable across keep-alive requests
/// via `reset`.
pub struct RequestParser {
    state: ParseState,
    /// Bytes of head consumed so far (request line + headers).
    head_bytes: usize,
    /// Head budget (`max_header_bytes`).
    max_head_bytes: usize,
    /// Decoded-body budget for chunked transfer.
    max_body_bytes: usize,
    /// Remaining Content-Length body bytes, or current chunk remainder.
    remaining: u64,
    /// Total decoded chunked bytes so far.
    chunked_total: u64,
    /// Last delivered header, for obs-fold continuation lines.
    last_header: Option<(String, String)>,
}

impl RequestParser {
    pub fn new(max_head_bytes: usize, max_body_bytes: usize) -> Self {
        Self {
            state: ParseState::RequestLine,
            head_bytes: 0,
            max_head_bytes,
            max_body_bytes,
            remaining: 0,
            chunked_total: 0,
            last_header: None,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// True once any byte of a request head has been consumed; used to pick
    /// 408 versus silent close on timeout.
    pub fn head_started(&self) -> bool {
        self.head_bytes > 0 || self.state != ParseState::RequestLine
    }

    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.head_bytes = 0;
        self.remaining = 0;
        self.chunked_total = 0;
        self.last_header = None;
    }

    fn find_crlf(buf: &[u8]) -> Option<usize> {
        let mut i = 0;
        while i + 1 < buf.len() {
            if buf[i] == b'\r' && buf[i + 1] == b'\n' {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    /// Consume and parse as much as possible from buf. Partial data remains
    /// in buf for the next call. Stops in `HeadersComplete` until the
    /// connection calls `set_body_mode`, and in `Complete` until `reset`.
    pub fn receive<H: H1RequestHandler>(
        &mut self,
        buf: &mut BytesMut,
        handler: &mut H,
    ) -> Result<(), ParseError> {
        loop {
            match self.state {
                ParseState::RequestLine => {
                    // Tolerate stray CRLFs between pipelined requests.
                    while buf.len() >= 2 && buf[0] == b'\r' && buf[1] == b'\n' {
                        buf.advance(2);
                    }
                    if buf.is_empty() {
                        return Ok(());
                    }
                    let line_end = match Self::find_crlf(buf) {
                        Some(n) => n,
                        None => return self.check_head_budget(buf.len()),
                    };
                    self.head_bytes += line_end + 2;
                    if self.head_bytes > self.max_head_bytes {
                        return Err(ParseError::HeaderTooLarge);
                    }
                    let line = buf.split_to(line_end + 2);
                    let line = &line[..line_end];
                    self.parse_request_line(line, handler)?;
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let line_end = match Self::find_crlf(buf) {
                        Some(n) => n,
                        None => return self.check_head_budget(buf.len()),
                    };
                    self.head_bytes += line_end + 2;
                    if self.head_bytes > self.max_head_bytes {
                        return Err(ParseError::HeaderTooLarge);
                    }
                    if line_end == 0 {
                        buf.advance(2);
                        if let Some((name, value)) = self.last_header.take() {
                            handler.header(&name, &value);
                        }
                        self.state = ParseState::HeadersComplete;
                        return Ok(());
                    }
                    let line = buf.split_to(line_end + 2);
                    self.parse_header_line(&line[..line_end], handler)?;
                }
                ParseState::HeadersComplete => return Ok(()),
                ParseState::Body => {
                    let to_read = (self.remaining as usize).min(buf.len());
                    if to_read > 0 {
                        let chunk = buf.split_to(to_read);
                        handler.body_chunk(&chunk);
                        self.remaining -= to_read as u64;
                    }
                    if self.remaining == 0 {
                        handler.complete();
                        self.state = ParseState::Complete;
                        return Ok(());
                    }
                    return Ok(());
                }
                ParseState::ChunkSize => {
                    let line_end = match Self::find_crlf(buf) {
                        Some(n) => n,
                        None => {
                            // A chunk-size line cannot be longer than hex
                            // digits + extensions; bound it by the head budget.
                            if buf.len() > self.max_head_bytes {
                                return Err(ParseError::BadRequest("chunk size line too long"));
                            }
                            return Ok(());
                        }
                    };
                    let line = buf.split_to(line_end + 2);
                    let line = std::str::from_utf8(&line[..line_end])
                        .map_err(|_| ParseError::BadRequest("chunk size not ASCII"))?;
                    // Extensions after ';' are parsed off and ignored.
                    let hex_part = line.split(';').next().unwrap_or(line);
                    let size = parse_hex(hex_part)
                        .ok_or(ParseError::BadRequest("invalid chunk size"))?;
                    self.chunked_total = self
                        .chunked_total
                        .checked_add(size)
                        .ok_or(ParseError::BodyTooLarge)?;
                    if self.chunked_total > self.max_body_bytes as u64 {
                        return Err(ParseError::BodyTooLarge);
                    }
                    if size == 0 {
                        self.state = ParseState::ChunkTrailer;
                    } else {
                        self.remaining = size;
                        self.state = ParseState::ChunkData;
                    }
                }
                ParseState::ChunkData => {
                    let to_read = (self.remaining as usize).min(buf.len());
                    if to_read > 0 {
                        let chunk = buf.split_to(to_read);
                        handler.body_chunk(&chunk);
                        self.remaining -= to_read as u64;
                    }
                    if self.remaining == 0 {
                        self.state = ParseState::ChunkDataEnd;
                    } else {
                        return Ok(());
                    }
                }
                ParseState::ChunkDataEnd => {
                    if buf.len() < 2 {
                        return Ok(());
                    }
                    if buf[0] != b'\r' || buf[1] != b'\n' {
                        return Err(ParseError::BadRequest("missing CRLF after chunk data"));
                    }
                    buf.advance(2);
                    self.state = ParseState::ChunkSize;
                }
                ParseState::ChunkTrailer => {
                    let line_end = match Self::find_crlf(buf) {
                        Some(n) => n,
                        None => return Ok(()),
                    };
                    if line_end == 0 {
                        buf.advance(2);
                        handler.complete();
                        self.state = ParseState::Complete;
                        return Ok(());
                    }
                    let line = buf.split_to(line_end + 2);
                    let line = std::str::from_utf8(&line[..line_end])
                        .map_err(|_| ParseError::BadRequest("trailer not ASCII"))?;
                    if let Some(colon) = line.find(':') {
                        handler.trailer(line[..colon].trim(), line[colon + 1..].trim());
                    }
                }
                ParseState::Complete => return Ok(()),
            }
            if buf.is_empty() {
                return Ok(());
            }
        }
    }

    /// Called by the connection after `HeadersComplete`, once framing has
    /// been derived from the header block.
    pub fn set_body_mode(&mut self, framing: BodyFraming, handler: &mut impl H1RequestHandler) {
        if self.state != ParseState::HeadersComplete {
            return;
        }
        match framing {
            BodyFraming::None => {
                handler.complete();
                self.state = ParseState::Complete;
            }
            BodyFraming::ContentLength(0) => {
                handler.complete();
                self.state = ParseState::Complete;
            }
            BodyFraming::ContentLength(n) => {
                self.remaining = n;
                self.state = ParseState::Body;
            }
            BodyFraming::Chunked => {
                self.chunked_total = 0;
                self.state = ParseState::ChunkSize;
            }
        }
    }

    /// With no CRLF in sight, the buffered head still counts against the
    /// budget; otherwise a peer could grow the buffer without bound.
    fn check_head_budget(&self, buffered: usize) -> Result<(), ParseError> {
        if self.head_bytes + buffered > self.max_head_bytes {
            Err(ParseError::HeaderTooLarge)
        } else {
            Ok(())
        }
    }

    fn parse_request_line<H: H1RequestHandler>(
        &mut self,
        line: &[u8],
        handler: &mut H,
    ) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line)
            .map_err(|_| ParseError::BadRequest("request line not ASCII"))?;
        let mut parts = line.split(' ');
        let method_token = parts.next().unwrap_or("");
        let target = parts.next().ok_or(ParseError::BadRequest("missing target"))?;
        let version_token = parts
            .next()
            .ok_or(ParseError::BadRequest("missing version"))?;
        if parts.next().is_some() {
            return Err(ParseError::BadRequest("extra request line fields"));
        }
        if method_token.is_empty()
            || method_token.len() > MAX_METHOD_BYTES
            || !method_token.bytes().all(is_token_byte)
        {
            return Err(ParseError::BadRequest("malformed method"));
        }
        if !method_token.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(ParseError::BadRequest("method not uppercase"));
        }
        let method = Method::from_token(method_token).ok_or(ParseError::UnknownMethod)?;
        if target.is_empty() {
            return Err(ParseError::BadRequest("empty target"));
        }
        if target.len() > MAX_TARGET_BYTES {
            return Err(ParseError::TargetTooLong);
        }
        let version = match version_token {
            "HTTP/1.1" => Version::Http11,
            "HTTP/1.0" => Version::Http10,
            v if v.starts_with("HTTP/") => return Err(ParseError::VersionNotSupported),
            _ => return Err(ParseError::BadRequest("malformed version")),
        };
        handler.request_line(method, target, version);
        Ok(())
    }

    fn parse_header_line<H: H1RequestHandler>(
        &mut self,
        line: &[u8],
        handler: &mut H,
    ) -> Result<(), ParseError> {
        let line_str = std::str::from_utf8(line)
            .map_err(|_| ParseError::BadRequest("header line not ASCII"))?;
        // Obs-fold continuation: collapse onto the previous header value.
        if line_str.starts_with(' ') || line_str.starts_with('\t') {
            match self.last_header.as_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line_str.trim());
                    return Ok(());
                }
                None => return Err(ParseError::BadRequest("continuation before first header")),
            }
        }
        let colon = line_str
            .find(':')
            .ok_or(ParseError::BadRequest("header line without colon"))?;
        let name = &line_str[..colon];
        if name.is_empty() || !name.bytes().all(is_token_byte) {
            return Err(ParseError::BadRequest("malformed header name"));
        }
        let value = line_str[colon + 1..].trim_matches([' ', '\t']);
        if value.bytes().any(|b| b < 0x20 && b != b'\t') {
            return Err(ParseError::BadRequest("control byte in header value"));
        }
        if let Some((name, value)) = self.last_header.take() {
            handler.header(&name, &value);
        }
        self.last_header = Some((name.to_string(), value.to_string()));
        Ok(())
    }
}
