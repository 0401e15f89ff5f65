// tests/property/codec_test.rs

//! Property-based tests for the two wire codecs
//! Tests that decoding is independent of how bytes are split across reads

use crate::test_helpers::masked_frame;
use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use tokio_util::codec::Decoder;
use wsrelay::core::protocol::{ControlCodec, ControlFrame, OpCode, WsFrameCodec};

/// Feeds `wire` to a decoder in chunks of the given sizes, collecting output.
fn decode_in_chunks<D: Decoder>(codec: &mut D, wire: &[u8], chunks: &[usize]) -> Vec<D::Item>
where
    D::Error: std::fmt::Debug,
{
    let mut buf = BytesMut::new();
    let mut out = Vec::new();
    let mut offset = 0;
    let mut sizes = chunks.iter().cycle();
    while offset < wire.len() {
        let size = (*sizes.next().unwrap_or(&1)).max(1);
        let end = (offset + size).min(wire.len());
        buf.extend_from_slice(&wire[offset..end]);
        offset = end;
        while let Some(item) = codec.decode(&mut buf).unwrap() {
            out.push(item);
        }
    }
    assert!(buf.is_empty(), "{} bytes left undecoded", buf.len());
    out
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_masked_message_survives_any_split(
        payload in prop::collection::vec(any::<u8>(), 0..70_000),
        mask in any::<[u8; 4]>(),
        binary in any::<bool>(),
        chunks in prop::collection::vec(1usize..5000, 1..8)
    ) {
        let first = if binary { 0x82 } else { 0x81 };
        let wire = masked_frame(first, &payload, mask);
        let mut codec = WsFrameCodec::default();

        let messages = decode_in_chunks(&mut codec, &wire, &chunks);

        prop_assert_eq!(messages.len(), 1);
        let expected = if binary { OpCode::Binary } else { OpCode::Text };
        prop_assert_eq!(messages[0].opcode, expected);
        prop_assert_eq!(&messages[0].payload, &payload);
    }

    #[test]
    fn test_fragmented_message_concatenates(
        parts in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..6),
        mask in any::<[u8; 4]>()
    ) {
        let mut wire = Vec::new();
        let last = parts.len() - 1;
        for (i, part) in parts.iter().enumerate() {
            let opcode = if i == 0 { 0x02 } else { 0x00 };
            let fin = if i == last { 0x80 } else { 0x00 };
            wire.extend(masked_frame(fin | opcode, part, mask));
        }
        let mut codec = WsFrameCodec::default();

        let messages = decode_in_chunks(&mut codec, &wire, &[7]);

        prop_assert_eq!(messages.len(), 1);
        prop_assert_eq!(messages[0].opcode, OpCode::Binary);
        prop_assert_eq!(&messages[0].payload, &parts.concat());
    }

    #[test]
    fn test_control_stream_survives_any_split(
        frames in prop::collection::vec(
            (any::<u8>().prop_filter("code must not be a digit", |c| !c.is_ascii_digit()),
             prop::collection::vec(any::<u8>(), 0..500)),
            1..20
        ),
        chunks in prop::collection::vec(1usize..64, 1..8)
    ) {
        let frames: Vec<ControlFrame> = frames
            .into_iter()
            .map(|(code, payload)| ControlFrame::new(code, Bytes::from(payload)))
            .collect();
        let wire: Vec<u8> = frames.iter().flat_map(|f| f.encode_to_vec()).collect();
        let mut codec = ControlCodec::default();

        let decoded = decode_in_chunks(&mut codec, &wire, &chunks);

        prop_assert_eq!(decoded, frames);
    }
}
