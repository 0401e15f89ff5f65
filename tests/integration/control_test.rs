// tests/integration/control_test.rs

//! Integration tests for control-plane commands
//! Tests: c/C/d/D, l, f/F/i/s, m, p/P, q and protocol errors

use super::test_helpers::{TestContext, masked_frame, reply, text_frame, token};
use wsrelay::core::state::ConnFlags;

fn addressed(token: &str, payload: &[u8]) -> Vec<u8> {
    let mut bytes = token.as_bytes().to_vec();
    bytes.extend_from_slice(payload);
    bytes
}

// ===== Direct Send Tests =====

#[tokio::test]
async fn test_direct_send_with_confirmation() {
    let mut ctx = TestContext::new();
    let mut client = ctx.handshake(&token(1));
    let mut control = ctx.connect_control();

    ctx.send_command(&control, b'c', &addressed(&token(1), b"hello"));

    assert_eq!(client.take_bytes(), text_frame(b"hello"));
    assert_eq!(control.take_bytes(), reply(b'A', &token(1)));
}

#[tokio::test]
async fn test_direct_send_without_confirmation_still_acks_delivery() {
    let mut ctx = TestContext::new();
    let mut client = ctx.handshake(&token(1));
    let mut control = ctx.connect_control();

    ctx.send_command(&control, b'd', &addressed(&token(1), b"hello"));

    assert_eq!(client.take_bytes(), text_frame(b"hello"));
    assert_eq!(control.take_bytes(), reply(b'A', &token(1)));
}

#[tokio::test]
async fn test_direct_send_binary() {
    let mut ctx = TestContext::new();
    let mut client = ctx.handshake(&token(1));
    let mut control = ctx.connect_control();

    ctx.send_command(&control, b'C', &addressed(&token(1), &[1, 2, 3]));

    assert_eq!(client.take_bytes(), vec![0x82, 3, 1, 2, 3]);
    assert_eq!(control.take_bytes(), reply(b'A', &token(1)));
}

#[tokio::test]
async fn test_direct_send_unknown_token() {
    let mut ctx = TestContext::new();
    let mut control = ctx.connect_control();

    ctx.send_command(&control, b'c', &addressed(&token(9), b"hello"));
    assert_eq!(control.take_bytes(), reply(b'N', &token(9)));

    // Without confirmation nothing was attempted, so nothing is said.
    ctx.send_command(&control, b'd', &addressed(&token(9), b"hello"));
    assert!(control.take_writes().is_empty());
}

#[tokio::test]
async fn test_empty_direct_send_checks_presence() {
    let mut ctx = TestContext::new();
    let mut client = ctx.handshake(&token(1));
    let mut control = ctx.connect_control();

    ctx.send_command(&control, b'c', token(1).as_bytes());

    assert!(client.take_writes().is_empty());
    assert_eq!(control.take_bytes(), reply(b'A', &token(1)));
}

#[tokio::test]
async fn test_direct_send_to_closing_client_fails() {
    let mut ctx = TestContext::new();
    let mut client = ctx.handshake(&token(1));
    let mut control = ctx.connect_control();
    ctx.engine.on_readable(
        client.id,
        &masked_frame(0x88, &[0x03, 0xE8], [1, 2, 3, 4]),
    );
    client.take_writes();

    ctx.send_command(&control, b'c', &addressed(&token(1), b"too late"));

    assert!(client.take_writes().is_empty());
    assert_eq!(control.take_bytes(), reply(b'N', &token(1)));
}

#[tokio::test]
async fn test_direct_send_with_short_token_is_protocol_error() {
    let mut ctx = TestContext::new();
    let mut control = ctx.connect_control();

    ctx.send_command(&control, b'c', b"short");

    assert_eq!(control.take_bytes(), b"0E".to_vec());
    assert!(
        ctx.engine
            .control_flags(control.id)
            .unwrap()
            .contains(ConnFlags::CLOSED)
    );
    ctx.engine.on_writable(control.id, control.flushed);
    assert_eq!(ctx.engine.control_count(), 0);
}

// ===== Lock And Fragment Tests =====

#[tokio::test]
async fn test_lock_and_fragmented_send() {
    let mut ctx = TestContext::new();
    let mut client = ctx.handshake(&token(1));
    let mut control = ctx.connect_control();

    ctx.send_command(&control, b'l', token(1).as_bytes());
    assert_eq!(control.take_bytes(), reply(b'A', &token(1)));
    assert_eq!(ctx.engine.lock_target(control.id), Some(client.id));
    assert!(
        !ctx.engine
            .client_flags(client.id)
            .unwrap()
            .contains(ConnFlags::READY)
    );

    ctx.send_command(&control, b'f', b"Hel");
    ctx.send_command(&control, b'i', b"l");
    ctx.send_command(&control, b's', b"o");

    assert_eq!(
        client.take_bytes(),
        vec![0x01, 3, b'H', b'e', b'l', 0x00, 1, b'l', 0x80, 1, b'o']
    );
    assert_eq!(control.take_bytes(), b"0a0a0a".to_vec());
    assert_eq!(ctx.engine.lock_target(control.id), None);
    assert!(
        ctx.engine
            .client_flags(client.id)
            .unwrap()
            .contains(ConnFlags::READY)
    );
}

#[tokio::test]
async fn test_binary_fragment_header() {
    let mut ctx = TestContext::new();
    let mut client = ctx.handshake(&token(1));
    let control = ctx.connect_control();
    ctx.send_command(&control, b'l', token(1).as_bytes());

    ctx.send_command(&control, b'F', &[9, 9]);
    ctx.send_command(&control, b'S', &[]);

    assert_eq!(client.take_bytes(), vec![0x02, 2, 9, 9, 0x80, 0]);
}

#[tokio::test]
async fn test_locked_client_refuses_direct_sends() {
    let mut ctx = TestContext::new();
    let mut client = ctx.handshake(&token(1));
    let mut control = ctx.connect_control();
    let mut other = ctx.connect_control();
    ctx.send_command(&control, b'l', token(1).as_bytes());
    control.take_writes();

    ctx.send_command(&other, b'c', &addressed(&token(1), b"cut in"));
    ctx.send_command(&other, b'l', token(1).as_bytes());

    assert!(client.take_writes().is_empty());
    let mut expected = reply(b'N', &token(1));
    expected.extend(reply(b'N', &token(1)));
    assert_eq!(other.take_bytes(), expected);
}

#[tokio::test]
async fn test_second_lock_is_refused() {
    let mut ctx = TestContext::new();
    let _first = ctx.handshake(&token(1));
    let second = ctx.handshake(&token(2));
    let mut control = ctx.connect_control();

    ctx.send_command(&control, b'l', token(1).as_bytes());
    ctx.send_command(&control, b'l', token(2).as_bytes());

    let mut expected = reply(b'A', &token(1));
    expected.extend(reply(b'N', &token(2)));
    assert_eq!(control.take_bytes(), expected);
    assert!(
        ctx.engine
            .client_flags(second.id)
            .unwrap()
            .contains(ConnFlags::READY)
    );
}

#[tokio::test]
async fn test_fragment_without_lock_is_refused() {
    let mut ctx = TestContext::new();
    let mut control = ctx.connect_control();

    ctx.send_command(&control, b'f', b"orphan");

    assert_eq!(control.take_bytes(), b"0n".to_vec());
}

#[tokio::test]
async fn test_fragment_after_target_reconnected_is_refused() {
    let mut ctx = TestContext::new();
    let client = ctx.handshake(&token(1));
    let mut control = ctx.connect_control();
    ctx.send_command(&control, b'l', token(1).as_bytes());
    control.take_writes();

    // Same token, new connection: the old lock must not follow it.
    ctx.engine.on_error(client.id);
    let mut replacement = ctx.handshake(&token(1));

    ctx.send_command(&control, b'i', b"stale");

    assert_eq!(control.take_bytes(), b"0n".to_vec());
    assert!(replacement.take_writes().is_empty());
    assert_eq!(ctx.engine.lock_target(control.id), None);
}

#[tokio::test]
async fn test_lock_on_disconnected_client_does_not_block_relock() {
    let mut ctx = TestContext::new();
    let first = ctx.handshake(&token(1));
    let second = ctx.handshake(&token(2));
    let mut control = ctx.connect_control();
    ctx.send_command(&control, b'l', token(1).as_bytes());
    assert_eq!(control.take_bytes(), reply(b'A', &token(1)));

    ctx.engine.on_error(first.id);
    ctx.send_command(&control, b'l', token(2).as_bytes());

    assert_eq!(control.take_bytes(), reply(b'A', &token(2)));
    assert_eq!(ctx.engine.lock_target(control.id), Some(second.id));
    assert!(
        !ctx.engine
            .client_flags(second.id)
            .unwrap()
            .contains(ConnFlags::READY)
    );
}

#[tokio::test]
async fn test_relock_after_target_reconnected() {
    let mut ctx = TestContext::new();
    let client = ctx.handshake(&token(1));
    let mut control = ctx.connect_control();
    ctx.send_command(&control, b'l', token(1).as_bytes());
    control.take_writes();

    ctx.engine.on_error(client.id);
    let mut replacement = ctx.handshake(&token(1));
    ctx.send_command(&control, b'l', token(1).as_bytes());
    ctx.send_command(&control, b'f', b"fresh");

    let mut expected = reply(b'A', &token(1));
    expected.extend_from_slice(b"0a");
    assert_eq!(control.take_bytes(), expected);
    assert_eq!(
        replacement.take_bytes(),
        vec![0x01, 5, b'f', b'r', b'e', b's', b'h']
    );
}

#[tokio::test]
async fn test_control_loss_mid_message_closes_client() {
    let mut ctx = TestContext::new();
    let mut client = ctx.handshake(&token(1));
    let control = ctx.connect_control();
    ctx.send_command(&control, b'l', token(1).as_bytes());
    ctx.send_command(&control, b'f', b"part");
    client.take_writes();

    ctx.engine.on_error(control.id);

    let mut expected = vec![0x88, 18, 0x03, 0xF3];
    expected.extend_from_slice(b"framesource lost");
    assert_eq!(client.take_bytes(), expected);
    let flags = ctx.engine.client_flags(client.id).unwrap();
    assert!(flags.contains(ConnFlags::CLOSING));
    assert!(!flags.contains(ConnFlags::READY));
    assert_eq!(ctx.engine.control_count(), 0);
}

// ===== Discovery And Keepalive Commands =====

#[tokio::test]
async fn test_least_loaded_listener() {
    let mut ctx = TestContext::with_domains(vec![
        "ws1.example.com:8080".to_string(),
        "ws2.example.com:8081".to_string(),
    ]);
    let mut control = ctx.connect_control();

    ctx.send_command(&control, b'm', b"");
    assert_eq!(control.take_bytes(), b"20Mws1.example.com:8080".to_vec());

    let _busy = ctx.connect_client(0);
    ctx.send_command(&control, b'm', b"");
    assert_eq!(control.take_bytes(), b"20Mws2.example.com:8081".to_vec());
}

#[tokio::test]
async fn test_ping_is_answered() {
    let mut ctx = TestContext::new();
    let mut control = ctx.connect_control();

    ctx.send_command(&control, b'p', b"");

    assert_eq!(control.take_bytes(), b"0P".to_vec());
}

#[tokio::test]
async fn test_quit_closes_control() {
    let mut ctx = TestContext::new();
    let mut control = ctx.connect_control();

    ctx.engine.on_readable(control.id, b"0q0p");

    assert!(control.take_writes().is_empty());
    assert!(control.shut_down);
    assert_eq!(ctx.engine.control_count(), 0);
}

// ===== Framing Tests =====

#[tokio::test]
async fn test_commands_split_and_batched() {
    let mut ctx = TestContext::new();
    let mut client = ctx.handshake(&token(1));
    let mut control = ctx.connect_control();
    let mut wire = b"0p".to_vec();
    wire.extend(b"37d");
    wire.extend(addressed(&token(1), b"hello"));
    wire.extend(b"0p");

    ctx.engine.on_readable(control.id, &wire[..5]);
    assert_eq!(control.take_bytes(), b"0P".to_vec());

    ctx.engine.on_readable(control.id, &wire[5..]);
    let mut expected = reply(b'A', &token(1));
    expected.extend(b"0P");
    assert_eq!(control.take_bytes(), expected);
    assert_eq!(client.take_bytes(), text_frame(b"hello"));
}

#[tokio::test]
async fn test_unknown_command_is_skipped() {
    let mut ctx = TestContext::new();
    let mut control = ctx.connect_control();

    ctx.engine.on_readable(control.id, b"3zabc0p");

    assert_eq!(control.take_bytes(), b"0P".to_vec());
}

#[tokio::test]
async fn test_garbage_is_protocol_error() {
    let mut ctx = TestContext::new();
    let mut control = ctx.connect_control();

    ctx.engine.on_readable(control.id, b"x0p");

    assert_eq!(control.take_bytes(), b"0E".to_vec());

    // Nothing more is read once the error went out.
    ctx.engine.on_readable(control.id, b"0p");
    assert!(control.take_writes().is_empty());
}

#[tokio::test]
async fn test_control_buffer_overflow_is_protocol_error() {
    let mut ctx = TestContext::new();
    let mut control = ctx.connect_control();

    ctx.engine.on_readable(control.id, &vec![b'1'; 70_000]);

    assert_eq!(control.take_bytes(), b"0E".to_vec());
}
