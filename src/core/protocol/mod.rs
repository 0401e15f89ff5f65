// src/core/protocol/mod.rs

//! Wire formats: the HTTP upgrade, WebSocket framing and the control plane.

pub mod control_frame;
pub mod handshake;
pub mod ws_frame;

pub use control_frame::{ControlCodec, ControlCommand, ControlFrame, ControlReply, FragmentKind};
pub use handshake::{HandshakeRejection, HandshakeRequest};
pub use ws_frame::{OpCode, WsFrameCodec, WsMessage};
