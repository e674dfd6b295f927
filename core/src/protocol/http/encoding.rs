/*
 * encoding.rs
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

//! Content codings: Accept-Encoding evaluation and body compression.
//! The writer asks whether the handler's chosen coding is acceptable to the
//! client and falls back to identity when it is not.

use std::io;
use std::io::Write;

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

use crate::protocol::http::response::ContentEncoding;

/// True when `Accept-Encoding` permits the coding token. Absent header means
/// identity only is known-safe for encoded bodies; a bare `*` accepts any.
/// `;q=0` excludes a coding.
pub fn accepts(accept_encoding: Option<&str>, token: &str) -> bool {
    let header = match accept_encoding {
        Some(h) => h,
        None => return false,
    };
    let mut wildcard_ok = false;
    let mut explicit: Option<bool> = None;
    for entry in header.split(',') {
        let mut parts = entry.split(';');
        let coding = parts.next().unwrap_or("").trim();
        let q_zero = parts.any(|p| {
            let p = p.trim();
            p.strip_prefix("q=")
                .map(|q| q.trim().parse::<f32>().map(|v| v == 0.0).unwrap_or(false))
                .unwrap_or(false)
        });
        if coding.eq_ignore_ascii_case(token) {
            explicit = Some(!q_zero);
        } else if coding == "*" {
            wildcard_ok = !q_zero;
        }
    }
    explicit.unwrap_or(wildcard_ok)
}

/// Resolve the coding actually applied: the handler's choice when the client
/// accepts it, identity otherwise.
pub fn negotiate(requested: ContentEncoding, accept_encoding: Option<&str>) -> ContentEncoding {
    match requested.token() {
        None => ContentEncoding::None,
        Some(token) => {
            if accepts(accept_encoding, token) {
                requested
            } else {
                ContentEncoding::None
            }
        }
    }
}

/// Compress a fully materialized body with the given coding.
pub fn encode(data: &[u8], encoding: ContentEncoding) -> io::Result<Vec<u8>> {
    match encoding {
        ContentEncoding::None => Ok(data.to_vec()),
        ContentEncoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        ContentEncoding::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        ContentEncoding::Brotli => {
            let mut out = Vec::new();
            {
                let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
                writer.write_all(data)?;
                writer.flush()?;
            }
            Ok(out)
        }
    }
}
