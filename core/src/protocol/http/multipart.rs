/*
 * multipart.rs
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

//! multipart/form-data body parser. Incremental: body bytes are fed into an
//! internal buffer and pulled back out as events (part start, data, part
//! end, finished), so the caller can stream part data to disk between
//! events. Boundary scanning holds back a potential partial delimiter across
//! reads.

use bytes::{Buf, Bytes, BytesMut};

/// Part-header budget, same bound as the request head.
const MAX_PART_HEADER_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartError {
    Malformed(&'static str),
    TooManyParts,
}

impl MultipartError {
    pub fn status(&self) -> u16 {
        match self {
            MultipartError::Malformed(_) => 400,
            MultipartError::TooManyParts => 413,
        }
    }
}

impl std::fmt::Display for MultipartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MultipartError::Malformed(msg) => write!(f, "malformed multipart body: {}", msg),
            MultipartError::TooManyParts => f.write_str("too many multipart parts"),
        }
    }
}

impl std::error::Error for MultipartError {}

/// Declared head of one part, from its Content-Disposition / Content-Type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartHead {
    pub field_name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
}

/// One parse step.
#[derive(Debug, PartialEq, Eq)]
pub enum MultipartEvent {
    PartStart(PartHead),
    Data(Bytes),
    PartEnd,
    /// Closing boundary seen; no further events.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    PartHeaders,
    PartData,
    /// After `--boundary`: decide next part / close / malformed.
    BoundaryTail,
    Done,
}

/// Extract the boundary parameter from a `multipart/form-data; boundary=...`
/// Content-Type value.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    for param in content_type.split(';').skip(1) {
        let param = param.trim();
        if let Some(rest) = param
            .strip_prefix("boundary=")
            .or_else(|| param.strip_prefix("BOUNDARY="))
        {
            let rest = rest.trim();
            let boundary = rest.strip_prefix('"')
                .and_then(|r| r.strip_suffix('"'))
                .unwrap_or(rest);
            if boundary.is_empty() || boundary.len() > 70 {
                return None;
            }
            return Some(boundary.to_string());
        }
    }
    None
}

/// Incremental multipart parser. `feed` appends body bytes; `next_event`
/// pulls the next completed event, or None when more bytes are needed.
pub struct MultipartParser {
    state: State,
    /// Full delimiter as it appears inside the body: CRLF `--` boundary.
    delimiter: Vec<u8>,
    buf: BytesMut,
    part_headers: Vec<(String, String)>,
    parts_seen: usize,
    max_parts: usize,
    /// Set once the caller signals end of body bytes.
    at_eof: bool,
}

impl MultipartParser {
    pub fn new(boundary: &str, max_parts: usize) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"\r\n--");
        delimiter.extend_from_slice(boundary.as_bytes());
        Self {
            state: State::Preamble,
            delimiter,
            buf: BytesMut::with_capacity(8 * 1024),
            part_headers: Vec::new(),
            parts_seen: 0,
            max_parts,
            at_eof: false,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The body producer has no more bytes. A parser not yet Done will
    /// report a missing closing boundary on the next `next_event`.
    pub fn end_of_body(&mut self) {
        self.at_eof = true;
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Done
    }

    /// `--boundary` without the leading CRLF, as it appears on the first line.
    fn bare_delimiter(&self) -> &[u8] {
        &self.delimiter[2..]
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        if needle.is_empty() || haystack.len() < needle.len() {
            return None;
        }
        for i in 0..=haystack.len() - needle.len() {
            if &haystack[i..i + needle.len()] == needle {
                return Some(i);
            }
        }
        None
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

    pub fn next_event(&mut self) -> Result<Option<MultipartEvent>, MultipartError> {
        loop {
            match self.state {
                State::Preamble => {
                    let line_end = match Self::find_crlf(&self.buf) {
                        Some(n) => n,
                        None => return self.need_more("no boundary before end of body"),
                    };
                    let line = self.buf.split_to(line_end + 2);
                    let line = &line[..line_end];
                    if line == self.bare_delimiter() {
                        self.state = State::PartHeaders;
                    } else if line.starts_with(self.bare_delimiter())
                        && &line[self.bare_delimiter().len()..] == b"--"
                    {
                        self.state = State::Done;
                        return Ok(Some(MultipartEvent::Finished));
                    }
                    // Other preamble lines are discarded.
                }
                State::PartHeaders => {
                    let line_end = match Self::find_crlf(&self.buf) {
                        Some(n) => n,
                        None => {
                            if self.buf.len() > MAX_PART_HEADER_BYTES {
                                return Err(MultipartError::Malformed("part header too large"));
                            }
                            return self.need_more("truncated part headers");
                        }
                    };
                    if line_end > MAX_PART_HEADER_BYTES {
                        return Err(MultipartError::Malformed("part header too large"));
                    }
                    let line = self.buf.split_to(line_end + 2);
                    let line = &line[..line_end];
                    if line.is_empty() {
                        self.parts_seen += 1;
                        if self.parts_seen > self.max_parts {
                            return Err(MultipartError::TooManyParts);
                        }
                        let head = self.build_part_head()?;
                        self.part_headers.clear();
                        self.state = State::PartData;
                        return Ok(Some(MultipartEvent::PartStart(head)));
                    }
                    let line = std::str::from_utf8(line)
                        .map_err(|_| MultipartError::Malformed("part header not UTF-8"))?;
                    let colon = line
                        .find(':')
                        .ok_or(MultipartError::Malformed("part header without colon"))?;
                    self.part_headers.push((
                        line[..colon].trim().to_string(),
                        line[colon + 1..].trim().to_string(),
                    ));
                }
                State::PartData => {
                    match Self::find(&self.buf, &self.delimiter) {
                        Some(pos) => {
                            let data = self.buf.split_to(pos).freeze();
                            self.buf.advance(self.delimiter.len());
                            self.state = State::BoundaryTail;
                            if !data.is_empty() {
                                return Ok(Some(MultipartEvent::Data(data)));
                            }
                        }
                        None => {
                            // Hold back bytes that could be the start of a
                            // delimiter split across reads.
                            if self.buf.len() > self.delimiter.len() {
                                let n = self.buf.len() - self.delimiter.len();
                                let data = self.buf.split_to(n).freeze();
                                return Ok(Some(MultipartEvent::Data(data)));
                            }
                            return self.need_more("missing closing boundary");
                        }
                    }
                }
                State::BoundaryTail => {
                    if self.buf.len() < 2 {
                        return self.need_more("truncated boundary");
                    }
                    if &self.buf[..2] == b"--" {
                        self.buf.advance(2);
                        self.state = State::Done;
                        // Final CRLF and any epilogue are ignored.
                        return Ok(Some(MultipartEvent::PartEnd));
                    }
                    if &self.buf[..2] == b"\r\n" {
                        self.buf.advance(2);
                        self.state = State::PartHeaders;
                        return Ok(Some(MultipartEvent::PartEnd));
                    }
                    return Err(MultipartError::Malformed("garbage after boundary"));
                }
                State::Done => return Ok(Some(MultipartEvent::Finished)),
            }
        }
    }

    fn need_more(
        &self,
        eof_reason: &'static str,
    ) -> Result<Option<MultipartEvent>, MultipartError> {
        if self.at_eof {
            Err(MultipartError::Malformed(eof_reason))
        } else {
            Ok(None)
        }
    }

    fn build_part_head(&self) -> Result<PartHead, MultipartError> {
        let disposition = self
            .part_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("Content-Disposition"))
            .map(|(_, v)| v.as_str())
            .ok_or(MultipartError::Malformed("part without Content-Disposition"))?;
        let mut head = PartHead::default();
        for param in disposition.split(';').skip(1) {
            let param = param.trim();
            if let Some(eq) = param.find('=') {
                let key = param[..eq].trim();
                let raw = param[eq + 1..].trim();
                let value = raw
                    .strip_prefix('"')
                    .and_then(|r| r.strip_suffix('"'))
                    .unwrap_or(raw);
                if key.eq_ignore_ascii_case("name") {
                    head.field_name = value.to_string();
                } else if key.eq_ignore_ascii_case("filename") {
                    head.file_name = Some(value.to_string());
                }
            }
        }
        head.content_type = self
            .part_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("Content-Type"))
            .map(|(_, v)| v.clone());
        Ok(head)
    }
}
