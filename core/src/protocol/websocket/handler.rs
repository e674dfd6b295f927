/*
 * handler.rs
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

//! WebSocket handler trait (callback-based, aligned with the HTTP handler
//! surface). The connection drives the callbacks as frames arrive; outgoing
//! frames are queued on the `WsOutbox` passed to each callback and flushed
//! by the connection between reads.

use crate::protocol::websocket::frame::{OP_BINARY, OP_CLOSE, OP_PING, OP_PONG, OP_TEXT};

/// Outgoing frame queue. Handlers enqueue; the connection encodes and
/// writes after the callback returns.
#[derive(Default)]
pub struct WsOutbox {
    pub(crate) frames: Vec<(u8, Vec<u8>)>,
    pub(crate) close_requested: bool,
}

impl WsOutbox {
    pub fn send_text(&mut self, text: impl AsRef<str>) {
        self.frames
            .push((OP_TEXT, text.as_ref().as_bytes().to_vec()));
    }

    pub fn send_binary(&mut self, data: impl Into<Vec<u8>>) {
        self.frames.push((OP_BINARY, data.into()));
    }

    pub fn send_ping(&mut self, payload: &[u8]) {
        self.frames.push((OP_PING, payload.to_vec()));
    }

    pub fn send_pong(&mut self, payload: &[u8]) {
        self.frames.push((OP_PONG, payload.to_vec()));
    }

    /// Initiate the closing handshake with a code and UTF-8 reason.
    pub fn send_close(&mut self, code: u16, reason: &str) {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        payload.truncate(125);
        self.frames.push((OP_CLOSE, payload));
        self.close_requested = true;
    }
}

/// Handler for one upgraded connection. Callbacks run on the connection's
/// task; they must not block.
pub trait WebSocketHandler: Send {
    /// Handshake done; the connection is in frame mode.
    fn on_open(&mut self, _out: &mut WsOutbox) {}

    /// One complete message (fragments already reassembled unless
    /// `streaming` is selected). Payload is valid for the call only.
    fn on_message(&mut self, out: &mut WsOutbox, payload: &[u8], is_binary: bool);

    /// Ping received. The engine already queued the echo pong.
    fn on_ping(&mut self, _out: &mut WsOutbox, _payload: &[u8]) {}

    /// Pong received (answer to our ping, or unsolicited heartbeat).
    fn on_pong(&mut self, _out: &mut WsOutbox, _payload: &[u8]) {}

    /// Close frame received. The engine mirrors the close and then drops
    /// the TCP connection.
    fn on_close(&mut self, _code: Option<u16>, _reason: &str) {}

    /// Transport or protocol failure; the connection is torn down after.
    fn on_error(&mut self, _error: &std::io::Error) {}

    /// When true, data fragments are delivered as they arrive instead of
    /// being reassembled into whole messages.
    fn streaming(&self) -> bool {
        false
    }
}
