#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge-case tests for framing, envelopes, addressing and session bookkeeping
//! Tests boundary conditions and malformed input from the wire

use bytes::{BufMut, BytesMut};
use cluster_link::core::address::{Address, AddressKind};
use cluster_link::core::codec::LinkCodec;
use cluster_link::core::message::{ApplicationData, Envelope, ErrorData, MessageKind};
use cluster_link::error::ProtocolError;
use cluster_link::protocol::registry::{MessageClass, PrepareDisconnect};
use cluster_link::transport::session::{generate_token, SendBuffer};
use cluster_link::transport::socket::{memory_pair, Socket};
use serde_json::json;
use std::time::Duration;
use tokio_util::codec::Decoder;

// ============================================================================
// FRAMING EDGE CASES
// ============================================================================

#[test]
fn test_oversized_frame_rejected() {
    let mut codec = LinkCodec::new(1024);
    let mut buf = BytesMut::new();
    buf.put_u32(4096);
    buf.extend_from_slice(&[b' '; 16]);

    let result = codec.decode(&mut buf);
    assert!(matches!(result, Err(ProtocolError::SchemaViolation(_))), "{result:?}");
}

#[test]
fn test_malformed_json_is_schema_violation() {
    let mut codec = LinkCodec::default();
    let mut buf = BytesMut::new();
    let body = b"{\"seq\": 1, \"type\": ";
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(body);

    let result = codec.decode(&mut buf);
    assert!(matches!(result, Err(ProtocolError::SchemaViolation(_))));
}

#[test]
fn test_empty_frame_is_schema_violation() {
    let mut codec = LinkCodec::default();
    let mut buf = BytesMut::new();
    buf.put_u32(0);

    let result = codec.decode(&mut buf);
    assert!(matches!(result, Err(ProtocolError::SchemaViolation(_))));
}

#[test]
fn test_envelope_without_data_defaults_to_null() {
    let envelope: Envelope =
        serde_json::from_value(json!({"seq": null, "type": "invalidate"})).unwrap();
    assert_eq!(envelope.kind, MessageKind::Invalidate);
    assert!(envelope.data.is_null());
}

#[test]
fn test_negative_seq_rejected() {
    let parsed = serde_json::from_value::<Envelope>(json!({"seq": -1, "type": "event", "data": {}}));
    assert!(parsed.is_err());
}

// ============================================================================
// APPLICATION BODY EDGE CASES
// ============================================================================

#[test]
fn test_body_without_request_id() {
    let body: ApplicationData = serde_json::from_value(json!({
        "src": {"kind": "host", "id": 1},
        "dst": {"kind": "controller", "id": 0},
        "name": "status",
    }))
    .unwrap();
    assert_eq!(body.request_id, None);
    assert!(body.data.is_null());

    let text = serde_json::to_string(&body).unwrap();
    assert!(!text.contains("request_id"));
}

#[test]
fn test_reply_error_swaps_addresses_and_keeps_request_id() {
    let request = ApplicationData {
        src: Address::control(2),
        dst: Address::host(3),
        name: "ping".to_string(),
        request_id: Some(17),
        data: json!({"n": 1}),
    };
    let reply = request.reply_error("host 3 is offline");
    assert_eq!(reply.src, Address::host(3));
    assert_eq!(reply.dst, Address::control(2));
    assert_eq!(reply.request_id, Some(17));

    let error: ErrorData = serde_json::from_value(reply.data).unwrap();
    assert_eq!(error.message, "host 3 is offline");
}

#[test]
fn test_body_with_unknown_address_kind_rejected() {
    let parsed = serde_json::from_value::<ApplicationData>(json!({
        "src": {"kind": "robot", "id": 1},
        "dst": {"kind": "controller", "id": 0},
        "name": "status",
    }));
    assert!(parsed.is_err());
}

// ============================================================================
// ADDRESSING EDGE CASES
// ============================================================================

#[test]
fn test_broadcast_with_invalid_target() {
    let nowhere = Address::new(AddressKind::Broadcast, 99);
    assert_eq!(nowhere.broadcast_target(), None);
    assert!(!nowhere.addresses(&Address::host(1)));
    assert_eq!(nowhere.to_string(), "broadcast(#99)");

    let recursive = Address::broadcast(AddressKind::Broadcast);
    assert_eq!(recursive.broadcast_target(), None);
}

#[test]
fn test_broadcast_to_invalid_target_never_allowed() {
    let class = MessageClass::request::<PrepareDisconnect>();
    assert!(!class.allows(
        MessageKind::Request,
        &Address::controller(),
        &Address::new(AddressKind::Broadcast, 99)
    ));
    assert!(!class.allows(
        MessageKind::Response,
        &Address::broadcast(AddressKind::Host),
        &Address::controller()
    ));
}

// ============================================================================
// SESSION EDGE CASES
// ============================================================================

#[test]
fn test_send_buffer_capacity_of_one() {
    let mut buffer = SendBuffer::new(1);
    buffer.push(MessageKind::Event, |_| Ok(json!({}))).unwrap();
    assert!(matches!(
        buffer.push(MessageKind::Event, |_| Ok(json!({}))),
        Err(ProtocolError::SendBufferOverflow(1))
    ));
    assert_eq!(buffer.acknowledge(1), 1);
    let next = buffer.push(MessageKind::Event, |_| Ok(json!({}))).unwrap();
    assert_eq!(next.seq, Some(2));
}

#[test]
fn test_reset_restarts_numbering() {
    let mut buffer = SendBuffer::new(8);
    for _ in 0..3 {
        buffer.push(MessageKind::Response, |_| Ok(json!({}))).unwrap();
    }
    buffer.reset();
    assert!(buffer.is_empty());
    assert_eq!(buffer.last_seq(), 0);
    let first = buffer.push(MessageKind::Request, |_| Ok(json!({}))).unwrap();
    assert_eq!(first.seq, Some(1));
}

#[test]
fn test_tokens_are_hex() {
    let token = generate_token().unwrap();
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
}

// ============================================================================
// SOCKET EDGE CASES
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_silent_peer_times_out_handshake() {
    let (_client, mut server) = memory_pair(1024 * 1024);
    let result = server.recv_timeout(Duration::from_secs(10)).await;
    assert!(matches!(result, Err(ProtocolError::Timeout)));
}

#[tokio::test]
async fn test_hangup_during_handshake() {
    let (client, mut server) = memory_pair(1024 * 1024);
    drop(client);
    let result = server.recv_timeout(Duration::from_secs(10)).await;
    assert!(matches!(result, Err(ProtocolError::HandshakeError(_))));
}

#[tokio::test]
async fn test_frame_above_peer_limit_fails_reader() {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let mut sender = Socket::new(left, 1024 * 1024);
    let mut receiver = Socket::new(right, 1024);

    let big = Envelope {
        seq: Some(1),
        kind: MessageKind::Event,
        data: json!({ "blob": "x".repeat(4096) }),
    };
    sender.send(big).await.unwrap();

    let result = receiver.recv().await.unwrap();
    assert!(matches!(result, Err(ProtocolError::SchemaViolation(_))), "{result:?}");
}
