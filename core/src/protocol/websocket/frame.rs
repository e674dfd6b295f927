/*
 * frame.rs
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

//! WebSocket frame format (RFC 6455 §5), server direction: client frames
//! must be masked and are unmasked during parse; server frames are written
//! unmasked. Control frames are limited to 125 bytes and must not be
//! fragmented.

use bytes::{Buf, BufMut, BytesMut};
use std::io;

// Opcodes
pub const OP_CONTINUATION: u8 = 0;
pub const OP_TEXT: u8 = 1;
pub const OP_BINARY: u8 = 2;
pub const OP_CLOSE: u8 = 8;
pub const OP_PING: u8 = 9;
pub const OP_PONG: u8 = 10;

pub fn is_control(opcode: u8) -> bool {
    opcode == OP_CLOSE || opcode == OP_PING || opcode == OP_PONG
}

/// Callback for completed frames (receive path).
pub trait FrameHandler {
    fn frame(&mut self, opcode: u8, fin: bool, data: &[u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Header1,
    ExtendedLen2,
    ExtendedLen8,
    MaskKey,
    Payload,
}

/// Push parser for client → server frames.
pub struct FrameParser {
    state: FrameState,
    opcode: u8,
    fin: bool,
    payload_len: u64,
    mask_key: [u8; 4],
    /// Largest accepted data-frame payload.
    max_payload: usize,
}

impl FrameParser {
    pub fn new(max_payload: usize) -> Self {
        Self {
            state: FrameState::Header1,
            opcode: 0,
            fin: false,
            payload_len: 0,
            mask_key: [0; 4],
            max_payload,
        }
    }

    /// Feed bytes from the stream. Returns when more data is needed; frames
    /// are dispatched to the handler as they complete.
    pub fn receive<H: FrameHandler>(
        &mut self,
        buf: &mut BytesMut,
        handler: &mut H,
    ) -> Result<(), io::Error> {
        loop {
            match self.state {
                FrameState::Header1 => {
                    if buf.len() < 2 {
                        return Ok(());
                    }
                    let b0 = buf.get_u8();
                    let b1 = buf.get_u8();
                    self.fin = (b0 & 0x80) != 0;
                    if (b0 & 0x70) != 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "reserved bits set",
                        ));
                    }
                    self.opcode = b0 & 0x0f;
                    let masked = (b1 & 0x80) != 0;
                    if !masked {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "client frame must be masked",
                        ));
                    }
                    if is_control(self.opcode) && !self.fin {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "fragmented control frame",
                        ));
                    }
                    let len7 = b1 & 0x7f;
                    if len7 == 126 {
                        self.state = FrameState::ExtendedLen2;
                    } else if len7 == 127 {
                        self.state = FrameState::ExtendedLen8;
                    } else {
                        self.payload_len = len7 as u64;
                        self.state = FrameState::MaskKey;
                    }
                }
                FrameState::ExtendedLen2 => {
                    if buf.len() < 2 {
                        return Ok(());
                    }
                    self.payload_len = buf.get_u16() as u64;
                    self.state = FrameState::MaskKey;
                }
                FrameState::ExtendedLen8 => {
                    if buf.len() < 8 {
                        return Ok(());
                    }
                    self.payload_len = buf.get_u64();
                    self.state = FrameState::MaskKey;
                }
                FrameState::MaskKey => {
                    if is_control(self.opcode) && self.payload_len > 125 {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "control frame payload too long",
                        ));
                    }
                    if self.payload_len > self.max_payload as u64 {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "data frame payload too long",
                        ));
                    }
                    if buf.len() < 4 {
                        return Ok(());
                    }
                    self.mask_key = [buf[0], buf[1], buf[2], buf[3]];
                    buf.advance(4);
                    self.state = FrameState::Payload;
                }
                FrameState::Payload => {
                    let need = self.payload_len as usize;
                    if buf.len() < need {
                        return Ok(());
                    }
                    let mut payload = buf.split_to(need);
                    for (i, b) in payload.iter_mut().enumerate() {
                        *b ^= self.mask_key[i % 4];
                    }
                    handler.frame(self.opcode, self.fin, &payload);
                    self.state = FrameState::Header1;
                }
            }
        }
    }
}

/// Encode one server → client frame (unmasked).
pub fn encode_frame(opcode: u8, fin: bool, payload: &[u8], out: &mut BytesMut) {
    let fin_bit: u8 = if fin { 0x80 } else { 0 };
    out.put_u8(fin_bit | (opcode & 0x0f));
    let len = payload.len();
    if len < 126 {
        out.put_u8(len as u8);
    } else if len < 65536 {
        out.put_u8(126);
        out.put_u16(len as u16);
    } else {
        out.put_u8(127);
        out.put_u64(len as u64);
    }
    out.put_slice(payload);
}

/// Encode a masked client → server frame. Used by tests to play the client
/// side of the protocol.
pub fn encode_client_frame(opcode: u8, fin: bool, payload: &[u8], mask_key: &[u8; 4], out: &mut BytesMut) {
    let fin_bit: u8 = if fin { 0x80 } else { 0 };
    out.put_u8(fin_bit | (opcode & 0x0f));
    let len = payload.len();
    if len < 126 {
        out.put_u8(0x80 | (len as u8));
    } else if len < 65536 {
        out.put_u8(0x80 | 126);
        out.put_u16(len as u16);
    } else {
        out.put_u8(0x80 | 127);
        out.put_u64(len as u64);
    }
    out.put_slice(mask_key);
    for (i, &b) in payload.iter().enumerate() {
        out.put_u8(b ^ mask_key[i % 4]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect {
        frames: Vec<(u8, bool, Vec<u8>)>,
    }

    impl FrameHandler for Collect {
        fn frame(&mut self, opcode: u8, fin: bool, data: &[u8]) {
            self.frames.push((opcode, fin, data.to_vec()));
        }
    }

    #[test]
    fn client_frame_round_trip() {
        let mut wire = BytesMut::new();
        encode_client_frame(OP_TEXT, true, b"ping", &[1, 2, 3, 4], &mut wire);
        let mut parser = FrameParser::new(65536);
        let mut out = Collect::default();
        parser.receive(&mut wire, &mut out).unwrap();
        assert_eq!(out.frames, vec![(OP_TEXT, true, b"ping".to_vec())]);
    }

    #[test]
    fn extended_lengths() {
        for size in [126usize, 300, 70000] {
            let payload = vec![0xabu8; size];
            let mut wire = BytesMut::new();
            encode_client_frame(OP_BINARY, true, &payload, &[9, 8, 7, 6], &mut wire);
            let mut parser = FrameParser::new(1 << 20);
            let mut out = Collect::default();
            parser.receive(&mut wire, &mut out).unwrap();
            assert_eq!(out.frames.len(), 1, "size {}", size);
            assert_eq!(out.frames[0].2.len(), size);
            assert_eq!(out.frames[0].2, payload);
        }
    }

    #[test]
    fn byte_at_a_time() {
        let mut wire = BytesMut::new();
        encode_client_frame(OP_TEXT, true, b"fragmented read", &[5, 5, 5, 5], &mut wire);
        let mut parser = FrameParser::new(65536);
        let mut out = Collect::default();
        let mut buf = BytesMut::new();
        for &b in wire.iter() {
            buf.put_u8(b);
            parser.receive(&mut buf, &mut out).unwrap();
        }
        assert_eq!(out.frames, vec![(OP_TEXT, true, b"fragmented read".to_vec())]);
    }

    #[test]
    fn unmasked_client_frame_rejected() {
        let mut wire = BytesMut::new();
        encode_frame(OP_TEXT, true, b"nope", &mut wire);
        let mut parser = FrameParser::new(65536);
        let mut out = Collect::default();
        assert!(parser.receive(&mut wire, &mut out).is_err());
    }

    #[test]
    fn oversized_control_frame_rejected() {
        let payload = vec![0u8; 126];
        let mut wire = BytesMut::new();
        encode_client_frame(OP_PING, true, &payload, &[0, 0, 0, 0], &mut wire);
        let mut parser = FrameParser::new(65536);
        let mut out = Collect::default();
        assert!(parser.receive(&mut wire, &mut out).is_err());
    }

    #[test]
    fn fragmented_control_frame_rejected() {
        let mut wire = BytesMut::new();
        encode_client_frame(OP_PING, false, b"x", &[0, 0, 0, 0], &mut wire);
        let mut parser = FrameParser::new(65536);
        let mut out = Collect::default();
        assert!(parser.receive(&mut wire, &mut out).is_err());
    }

    #[test]
    fn server_frame_shape() {
        let mut out = BytesMut::new();
        encode_frame(OP_TEXT, true, b"pong", &mut out);
        // FIN + text opcode, unmasked length 4, then payload.
        assert_eq!(&out[..], &[0x81, 0x04, b'p', b'o', b'n', b'g']);
    }

    #[test]
    fn interleaved_control_between_fragments() {
        let mut wire = BytesMut::new();
        encode_client_frame(OP_TEXT, false, b"hel", &[1, 1, 1, 1], &mut wire);
        encode_client_frame(OP_PING, true, b"hb", &[2, 2, 2, 2], &mut wire);
        encode_client_frame(OP_CONTINUATION, true, b"lo", &[3, 3, 3, 3], &mut wire);
        let mut parser = FrameParser::new(65536);
        let mut out = Collect::default();
        parser.receive(&mut wire, &mut out).unwrap();
        assert_eq!(
            out.frames,
            vec![
                (OP_TEXT, false, b"hel".to_vec()),
                (OP_PING, true, b"hb".to_vec()),
                (OP_CONTINUATION, true, b"lo".to_vec()),
            ]
        );
    }
}
