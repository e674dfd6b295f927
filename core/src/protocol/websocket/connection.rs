/*
 * connection.rs
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

//! WebSocket connection after the 101 response: drives the frame parser,
//! reassembles fragmented messages, auto-answers pings, mirrors closes, and
//! pings idle peers (closing 1001 when the pong never comes). Once a close
//! frame has been written, nothing else goes on the wire.

use bytes::BytesMut;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::protocol::websocket::frame::{
    encode_frame, is_control, FrameHandler, FrameParser, OP_BINARY, OP_CLOSE, OP_CONTINUATION,
    OP_PING, OP_PONG, OP_TEXT,
};
use crate::protocol::websocket::handler::{WebSocketHandler, WsOutbox};

/// Going-away close code used when the idle ping is not answered.
const CLOSE_GOING_AWAY: u16 = 1001;

struct Collected {
    frames: Vec<(u8, bool, Vec<u8>)>,
}

impl FrameHandler for Collected {
    fn frame(&mut self, opcode: u8, fin: bool, data: &[u8]) {
        self.frames.push((opcode, fin, data.to_vec()));
    }
}

/// Per-connection WebSocket engine. Generic over the stream so the HTTP
/// engine can hand over its plain or TLS stream.
pub struct WsConnection<S> {
    stream: S,
    read_buf: BytesMut,
    parser: FrameParser,
    idle_timeout: Duration,
    max_message_bytes: usize,
    close_sent: bool,
    close_received: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> WsConnection<S> {
    /// Take over a stream after the 101. `leftover` carries bytes that
    /// arrived behind the upgrade request head.
    pub fn new(
        stream: S,
        leftover: BytesMut,
        idle_timeout: Duration,
        max_message_bytes: usize,
    ) -> Self {
        Self {
            stream,
            read_buf: leftover,
            parser: FrameParser::new(max_message_bytes),
            idle_timeout,
            max_message_bytes,
            close_sent: false,
            close_received: false,
        }
    }

    /// Drive the connection until close or failure. `on_error` has been
    /// called before any Err return.
    pub async fn run(mut self, handler: &mut dyn WebSocketHandler) -> io::Result<()> {
        let mut outbox = WsOutbox::default();
        handler.on_open(&mut outbox);
        self.flush(&mut outbox).await?;

        // Fragmented-message reassembly state.
        let mut frag_opcode: Option<u8> = None;
        let mut frag_buf: Vec<u8> = Vec::new();
        let mut awaiting_pong = false;

        loop {
            // Drain anything already buffered before touching the socket.
            let frames = match self.parse_buffered() {
                Ok(frames) => frames,
                Err(e) => {
                    handler.on_error(&e);
                    return Err(e);
                }
            };
            for (opcode, fin, data) in frames {
                self.dispatch(
                    handler,
                    &mut outbox,
                    &mut frag_opcode,
                    &mut frag_buf,
                    &mut awaiting_pong,
                    opcode,
                    fin,
                    data,
                )?;
            }
            self.flush(&mut outbox).await?;
            if self.close_sent && self.close_received {
                let _ = self.stream.shutdown().await;
                return Ok(());
            }

            let mut tmp = [0u8; 8 * 1024];
            match timeout(self.idle_timeout, self.stream.read(&mut tmp)).await {
                Err(_) => {
                    if awaiting_pong || self.close_sent {
                        // Ping unanswered, or our close unacknowledged.
                        let engine_close = !self.close_sent;
                        if engine_close {
                            outbox.send_close(CLOSE_GOING_AWAY, "idle timeout");
                            self.flush(&mut outbox).await?;
                        }
                        let _ = self.stream.shutdown().await;
                        if engine_close {
                            handler.on_close(Some(CLOSE_GOING_AWAY), "idle timeout");
                        }
                        return Ok(());
                    }
                    outbox.send_ping(b"");
                    awaiting_pong = true;
                    self.flush(&mut outbox).await?;
                }
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => self.read_buf.extend_from_slice(&tmp[..n]),
                Ok(Err(e)) => {
                    handler.on_error(&e);
                    return Err(e);
                }
            }
        }
    }

    fn parse_buffered(&mut self) -> io::Result<Vec<(u8, bool, Vec<u8>)>> {
        let mut collected = Collected { frames: Vec::new() };
        self.parser.receive(&mut self.read_buf, &mut collected)?;
        Ok(collected.frames)
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &mut self,
        handler: &mut dyn WebSocketHandler,
        outbox: &mut WsOutbox,
        frag_opcode: &mut Option<u8>,
        frag_buf: &mut Vec<u8>,
        awaiting_pong: &mut bool,
        opcode: u8,
        fin: bool,
        data: Vec<u8>,
    ) -> io::Result<()> {
        match opcode {
            OP_TEXT | OP_BINARY => {
                if frag_opcode.is_some() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "data frame inside fragmented message",
                    ));
                }
                if fin || handler.streaming() {
                    handler.on_message(outbox, &data, opcode == OP_BINARY);
                    if !fin {
                        *frag_opcode = Some(opcode);
                    }
                } else {
                    *frag_opcode = Some(opcode);
                    frag_buf.extend_from_slice(&data);
                    self.check_message_cap(frag_buf)?;
                }
            }
            OP_CONTINUATION => {
                let start = frag_opcode.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "continuation without start")
                })?;
                if handler.streaming() {
                    handler.on_message(outbox, &data, start == OP_BINARY);
                    if fin {
                        *frag_opcode = None;
                    }
                } else {
                    frag_buf.extend_from_slice(&data);
                    self.check_message_cap(frag_buf)?;
                    if fin {
                        let message = std::mem::take(frag_buf);
                        let is_binary = start == OP_BINARY;
                        *frag_opcode = None;
                        handler.on_message(outbox, &message, is_binary);
                    }
                }
            }
            OP_PING => {
                outbox.send_pong(&data);
                handler.on_ping(outbox, &data);
            }
            OP_PONG => {
                *awaiting_pong = false;
                handler.on_pong(outbox, &data);
            }
            OP_CLOSE => {
                let (code, reason) = if data.len() >= 2 {
                    (
                        Some(u16::from_be_bytes([data[0], data[1]])),
                        String::from_utf8_lossy(&data[2..]).into_owned(),
                    )
                } else {
                    (None, String::new())
                };
                self.close_received = true;
                handler.on_close(code, &reason);
                if !self.close_sent {
                    // Mirror the close with the peer's code.
                    outbox.send_close(code.unwrap_or(1000), "");
                }
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unknown opcode",
                ));
            }
        }
        Ok(())
    }

    fn check_message_cap(&self, frag_buf: &[u8]) -> io::Result<()> {
        if frag_buf.len() > self.max_message_bytes {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "fragmented message too long",
            ))
        } else {
            Ok(())
        }
    }

    /// Encode and write queued frames, in order, stopping at a close frame.
    /// After a close has been written nothing further is sent.
    async fn flush(&mut self, outbox: &mut WsOutbox) -> io::Result<()> {
        let frames = std::mem::take(&mut outbox.frames);
        outbox.close_requested = false;
        if self.close_sent {
            return Ok(());
        }
        let mut out = BytesMut::new();
        for (opcode, payload) in frames {
            if is_control(opcode) && payload.len() > 125 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "control frame payload too long",
                ));
            }
            encode_frame(opcode, true, &payload, &mut out);
            if opcode == OP_CLOSE {
                self.close_sent = true;
                break;
            }
        }
        if !out.is_empty() {
            self.stream.write_all(&out).await?;
            self.stream.flush().await?;
        }
        Ok(())
    }
}
