// src/core/protocol/control_frame.rs

//! Implements the control-plane wire format spoken by backend processes:
//! an ASCII decimal payload length, one command byte, then the payload.
//! Replies from the relay use the same framing.

use crate::core::RelayError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use strum_macros::IntoStaticStr;
use tokio_util::codec::{Decoder, Encoder};

/// Length of the client token carried by addressed and lock commands.
pub const AUTH_TOKEN_LEN: usize = 32;

// A length prefix longer than this can never describe a frame that fits any
// sane control buffer.
const MAX_LEN_DIGITS: usize = 10;

/// A single raw control-plane frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub code: u8,
    pub payload: Bytes,
}

impl ControlFrame {
    pub fn new(code: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    /// Encodes the frame into a `Vec<u8>`, as a backend would put it on the wire.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_frame(self.code, &self.payload, &mut buf);
        buf.to_vec()
    }
}

/// A reply the relay writes back on a control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    /// `32A<token>`: the addressed client took the message or the lock.
    Ack(Bytes),
    /// `32N<token>`: the addressed client is absent or not ready.
    Nack(Bytes),
    /// `0a`: a fragment was relayed to the locked client.
    FragmentAck,
    /// `0n`: there is no usable lock for a fragment.
    FragmentNack,
    /// `<len>M<domain>`: the least loaded listener.
    Domain(String),
    /// `0p`: keepalive probe.
    Ping,
    /// `0P`: answer to a backend's ping.
    Pong,
    /// `0E`: protocol error; the connection is closed afterwards.
    ProtocolError,
}

/// A `tokio_util::codec` implementation for control-plane frames.
#[derive(Debug, Clone, Copy)]
pub struct ControlCodec {
    max_buffer: usize,
}

impl ControlCodec {
    /// Creates a codec for a connection whose read buffer holds at most
    /// `max_buffer` bytes; frames that could never fit are rejected up front.
    pub fn new(max_buffer: usize) -> Self {
        Self { max_buffer }
    }
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self {
            max_buffer: usize::MAX,
        }
    }
}

impl Decoder for ControlCodec {
    type Item = ControlFrame;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let digits = src.iter().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            return Err(RelayError::InvalidControlFrame(
                "expected a decimal length prefix".to_string(),
            ));
        }
        if digits > MAX_LEN_DIGITS {
            return Err(RelayError::InvalidControlFrame(
                "length prefix too long".to_string(),
            ));
        }
        if digits > 1 && src[0] == b'0' {
            return Err(RelayError::InvalidControlFrame(
                "length prefix has a leading zero".to_string(),
            ));
        }
        if digits == src.len() {
            // The command byte has not arrived yet.
            return Ok(None);
        }

        let len = std::str::from_utf8(&src[..digits])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| {
                RelayError::InvalidControlFrame("unparsable length prefix".to_string())
            })?;

        let frame_len = digits + 1 + len;
        if frame_len >= self.max_buffer {
            return Err(RelayError::BufferOverflow(self.max_buffer));
        }
        if src.len() < frame_len {
            return Ok(None);
        }

        let code = src[digits];
        src.advance(digits + 1);
        let payload = src.split_to(len).freeze();
        Ok(Some(ControlFrame { code, payload }))
    }
}

impl Encoder<ControlFrame> for ControlCodec {
    type Error = RelayError;

    fn encode(&mut self, item: ControlFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        put_frame(item.code, &item.payload, dst);
        Ok(())
    }
}

impl Encoder<ControlReply> for ControlCodec {
    type Error = RelayError;

    fn encode(&mut self, item: ControlReply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            ControlReply::Ack(token) => put_frame(b'A', &token, dst),
            ControlReply::Nack(token) => put_frame(b'N', &token, dst),
            ControlReply::FragmentAck => put_frame(b'a', &[], dst),
            ControlReply::FragmentNack => put_frame(b'n', &[], dst),
            ControlReply::Domain(domain) => put_frame(b'M', domain.as_bytes(), dst),
            ControlReply::Ping => put_frame(b'p', &[], dst),
            ControlReply::Pong => put_frame(b'P', &[], dst),
            ControlReply::ProtocolError => put_frame(b'E', &[], dst),
        }
        Ok(())
    }
}

impl ControlReply {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        // Encoding a reply into memory cannot fail.
        let _ = ControlCodec::default().encode(self.clone(), &mut buf);
        buf.freeze()
    }
}

fn put_frame(code: u8, payload: &[u8], dst: &mut BytesMut) {
    let mut len = itoa::Buffer::new();
    let len = len.format(payload.len());
    dst.reserve(len.len() + 1 + payload.len());
    dst.extend_from_slice(len.as_bytes());
    dst.put_u8(code);
    dst.extend_from_slice(payload);
}

/// The position of a fragment inside a multi-frame message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    FirstText,
    FirstBinary,
    Intermediate,
    Last,
}

impl FragmentKind {
    /// The raw first header byte of the WebSocket frame carrying this fragment.
    pub fn first_byte(self) -> u8 {
        match self {
            FragmentKind::FirstText => 0x01,
            FragmentKind::FirstBinary => 0x02,
            FragmentKind::Intermediate => 0x00,
            FragmentKind::Last => 0x80,
        }
    }

    pub fn is_last(self) -> bool {
        self == FragmentKind::Last
    }
}

/// A parsed control-plane command.
#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ControlCommand {
    Broadcast {
        payload: Bytes,
        binary: bool,
    },
    Direct {
        token: Bytes,
        payload: Bytes,
        binary: bool,
        confirm: bool,
    },
    Lock {
        token: Bytes,
    },
    Fragment {
        kind: FragmentKind,
        payload: Bytes,
    },
    LeastLoaded,
    Ping,
    Pong,
    Quit,
    Unknown(u8),
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

impl TryFrom<ControlFrame> for ControlCommand {
    type Error = RelayError;

    fn try_from(frame: ControlFrame) -> Result<Self, Self::Error> {
        let ControlFrame { code, mut payload } = frame;
        let command = match code {
            b'b' | b'B' => ControlCommand::Broadcast {
                payload,
                binary: code == b'B',
            },
            b'c' | b'C' | b'd' | b'D' => {
                if payload.len() < AUTH_TOKEN_LEN {
                    return Err(RelayError::InvalidControlFrame(format!(
                        "'{}' needs a {AUTH_TOKEN_LEN} byte token, got {} bytes",
                        code as char,
                        payload.len()
                    )));
                }
                let token = payload.split_to(AUTH_TOKEN_LEN);
                ControlCommand::Direct {
                    token,
                    payload,
                    binary: code == b'C' || code == b'D',
                    confirm: code == b'c' || code == b'C',
                }
            }
            b'l' => {
                if payload.len() != AUTH_TOKEN_LEN {
                    return Err(RelayError::InvalidControlFrame(format!(
                        "'l' needs exactly {AUTH_TOKEN_LEN} bytes, got {}",
                        payload.len()
                    )));
                }
                ControlCommand::Lock { token: payload }
            }
            b'f' => ControlCommand::Fragment {
                kind: FragmentKind::FirstText,
                payload,
            },
            b'F' => ControlCommand::Fragment {
                kind: FragmentKind::FirstBinary,
                payload,
            },
            b'i' | b'I' => ControlCommand::Fragment {
                kind: FragmentKind::Intermediate,
                payload,
            },
            b's' | b'S' => ControlCommand::Fragment {
                kind: FragmentKind::Last,
                payload,
            },
            b'm' => ControlCommand::LeastLoaded,
            b'p' => ControlCommand::Ping,
            b'P' => ControlCommand::Pong,
            b'q' | b'Q' => ControlCommand::Quit,
            other => ControlCommand::Unknown(other),
        };
        Ok(command)
    }
}
