/*
 * handshake.rs
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

//! WebSocket opening handshake, accept side (RFC 6455 §4): recognize the
//! upgrade request, validate its headers, compute Sec-WebSocket-Accept for
//! the 101 response.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::protocol::http::request::Request;

/// Magic string for Sec-WebSocket-Accept (RFC 6455 §4.2.2).
const WS_ACCEPT_MAGIC: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A validated upgrade request: the key to answer with.
#[derive(Debug, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub accept: String,
}

/// True when the request announces a WebSocket upgrade at all (before
/// validation): `Upgrade: websocket` together with `Connection: Upgrade`.
pub fn is_upgrade_request(req: &Request) -> bool {
    let upgrade = req
        .header("Upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = req
        .header("Connection")
        .map(|v| {
            v.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    upgrade && connection
}

/// Validate the upgrade headers. Returns the computed accept value, or a
/// reason string for a 400 response.
pub fn validate_upgrade(req: &Request) -> Result<UpgradeRequest, &'static str> {
    if !is_upgrade_request(req) {
        return Err("not an upgrade request");
    }
    match req.header("Sec-WebSocket-Version") {
        Some("13") => {}
        Some(_) => return Err("unsupported Sec-WebSocket-Version"),
        None => return Err("missing Sec-WebSocket-Version"),
    }
    let key = match req.header("Sec-WebSocket-Key") {
        Some(k) => k.trim(),
        None => return Err("missing Sec-WebSocket-Key"),
    };
    // The key must be 16 bytes base64-encoded (24 chars with padding).
    match BASE64.decode(key) {
        Ok(raw) if raw.len() == 16 => {}
        _ => return Err("malformed Sec-WebSocket-Key"),
    }
    Ok(UpgradeRequest {
        accept: compute_accept(key.as_bytes()),
    })
}

/// Sec-WebSocket-Accept per RFC 6455 §4.2.2: base64(SHA-1(key ∥ magic)).
pub fn compute_accept(key_base64: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(key_base64);
    hasher.update(WS_ACCEPT_MAGIC);
    BASE64.encode(hasher.finalize())
}
