// src/core/protocol/ws_frame.rs

//! Implements RFC6455 framing: a message-level `Decoder` for client traffic and
//! the server-side (never masked) frame builders.

use crate::core::RelayError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const OPCODE_BITS: u8 = 0x0F;
const LEN_BITS: u8 = 0x7F;
const LEN16_MARKER: u8 = 126;
const LEN64_MARKER: u8 = 127;
const MAX_INLINE_LEN: usize = 125;

/// Close status sent when a token outlives its lifetime.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close status sent when the control connection feeding a fragmented
/// message goes away mid-message.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// The frame opcode, taken from the low nibble of the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl From<u8> for OpCode {
    fn from(value: u8) -> Self {
        match value & OPCODE_BITS {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            other => OpCode::Reserved(other),
        }
    }
}

impl OpCode {
    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Reserved(b) => b & OPCODE_BITS,
        }
    }
}

/// One application-level message: the payloads of a run of frames ending in
/// a FIN frame, carrying the opcode of the first frame in the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsMessage {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

impl WsMessage {
    pub fn text(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode: OpCode::Text,
            payload: payload.into(),
        }
    }

    pub fn binary(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode: OpCode::Binary,
            payload: payload.into(),
        }
    }
}

/// The location of one physical frame inside the read buffer.
#[derive(Debug)]
struct FrameHeader {
    fin: bool,
    opcode: u8,
    mask: Option<u32>,
    header_len: usize,
    payload_len: usize,
}

/// A `tokio_util::codec` implementation for WebSocket messages.
///
/// Decoding never consumes a partial message: bytes stay in the buffer until a
/// whole run of frames through the closing FIN frame is present.
#[derive(Debug, Clone, Copy)]
pub struct WsFrameCodec {
    max_frame_len: usize,
}

impl Default for WsFrameCodec {
    fn default() -> Self {
        Self {
            max_frame_len: usize::MAX,
        }
    }
}

impl WsFrameCodec {
    /// Creates a codec that rejects any frame which could never fit into a
    /// read buffer of `max_frame_len` bytes.
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    fn parse_header(&self, buf: &[u8]) -> Result<Option<FrameHeader>, RelayError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let first = buf[0];
        let second = buf[1];
        let mut header_len = 2;

        let payload_len: u64 = match second & LEN_BITS {
            LEN16_MARKER => {
                header_len += 2;
                if buf.len() < header_len {
                    return Ok(None);
                }
                u16::from_be_bytes([buf[2], buf[3]]) as u64
            }
            LEN64_MARKER => {
                header_len += 8;
                if buf.len() < header_len {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                u64::from_be_bytes(raw)
            }
            short => short as u64,
        };

        let mask = if second & MASK_BIT != 0 {
            if buf.len() < header_len + 4 {
                return Ok(None);
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&buf[header_len..header_len + 4]);
            header_len += 4;
            Some(u32::from_be_bytes(key))
        } else {
            None
        };

        if payload_len.saturating_add(header_len as u64) >= self.max_frame_len as u64 {
            return Err(RelayError::FrameTooLarge {
                len: payload_len,
                limit: self.max_frame_len,
            });
        }

        Ok(Some(FrameHeader {
            fin: first & FIN_BIT != 0,
            opcode: first & OPCODE_BITS,
            mask,
            header_len,
            payload_len: payload_len as usize,
        }))
    }
}

impl Decoder for WsFrameCodec {
    type Item = WsMessage;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut offset = 0;
        let mut run: Vec<(usize, FrameHeader)> = Vec::new();

        loop {
            let Some(header) = self.parse_header(&src[offset..])? else {
                return Ok(None);
            };
            let frame_len = header.header_len + header.payload_len;
            if src.len() - offset < frame_len {
                return Ok(None);
            }
            let fin = header.fin;
            run.push((offset, header));
            offset += frame_len;
            if fin {
                break;
            }
        }

        let opcode = OpCode::from(run[0].1.opcode);
        let total: usize = run.iter().map(|(_, h)| h.payload_len).sum();
        let mut payload = Vec::with_capacity(total);
        for (start, header) in &run {
            let begin = start + header.header_len;
            unmask_into(&src[begin..begin + header.payload_len], header.mask, &mut payload);
        }

        src.advance(offset);
        Ok(Some(WsMessage { opcode, payload }))
    }
}

impl Encoder<WsMessage> for WsFrameCodec {
    type Error = RelayError;

    /// Encodes a message as a single, unmasked FIN frame.
    fn encode(&mut self, item: WsMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(FIN_BIT | item.opcode.as_u8(), &item.payload, dst);
        Ok(())
    }
}

/// XORs the payload word by word with the mask taken as one big-endian `u32`.
/// The payload starts in phase with the mask, so this matches the per-byte
/// `mask[i % 4]` rule; the final partial word is zero-padded and truncated.
fn unmask_into(data: &[u8], mask: Option<u32>, out: &mut Vec<u8>) {
    let Some(mask) = mask else {
        out.extend_from_slice(data);
        return;
    };
    for chunk in data.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        let plain = (u32::from_be_bytes(word) ^ mask).to_be_bytes();
        out.extend_from_slice(&plain[..chunk.len()]);
    }
}

/// Writes a frame header for `payload` with the given first byte, followed by
/// the payload itself. Server frames are never masked.
pub fn write_frame(first_byte: u8, payload: &[u8], dst: &mut BytesMut) {
    let len = payload.len();
    dst.reserve(len + 10);
    dst.put_u8(first_byte);
    if len <= MAX_INLINE_LEN {
        dst.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        dst.put_u8(LEN16_MARKER);
        dst.put_u16(len as u16);
    } else {
        dst.put_u8(LEN64_MARKER);
        dst.put_u64(len as u64);
    }
    dst.extend_from_slice(payload);
}

/// Builds one frame with an explicit first header byte.
pub fn encode_frame(first_byte: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    write_frame(first_byte, payload, &mut buf);
    buf.freeze()
}

/// A complete text or binary message in one FIN frame.
pub fn data_frame(payload: &[u8], binary: bool) -> Bytes {
    let opcode = if binary { OpCode::Binary } else { OpCode::Text };
    encode_frame(FIN_BIT | opcode.as_u8(), payload)
}

/// The empty keepalive ping the server sends on idle timeout.
pub fn ping_frame() -> Bytes {
    Bytes::from_static(&[FIN_BIT | 0x9, 0x00])
}

/// Echoes a client ping back as a pong with the same payload.
pub fn pong_frame(payload: &[u8]) -> Bytes {
    encode_frame(FIN_BIT | OpCode::Pong.as_u8(), payload)
}

/// A close frame carrying a status code and a reason.
pub fn close_frame(code: u16, reason: &str) -> Bytes {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    encode_frame(FIN_BIT | OpCode::Close.as_u8(), &payload)
}

/// The reply to a peer-initiated close: its status code echoed back, or an
/// empty close frame when the peer sent none.
pub fn close_echo_frame(peer_payload: &[u8]) -> Bytes {
    let echoed = if peer_payload.len() > 1 {
        &peer_payload[..2]
    } else {
        &[][..]
    };
    encode_frame(FIN_BIT | OpCode::Close.as_u8(), echoed)
}
