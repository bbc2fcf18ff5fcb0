//! Property-based tests using proptest
//!
//! These tests check session and routing invariants across a wide range of randomly
//! generated inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use cluster_link::core::address::{Address, AddressKind};
use cluster_link::core::codec::LinkCodec;
use cluster_link::core::message::{ApplicationData, Envelope, MessageKind};
use cluster_link::transport::session::SendBuffer;
use cluster_link::utils::backoff::ExponentialBackoff;
use proptest::prelude::*;
use serde_json::json;
use std::time::Duration;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone)]
enum Op {
    Push,
    Ack(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![3 => Just(Op::Push), 1 => (0u64..64).prop_map(Op::Ack)]
}

fn point_kind() -> impl Strategy<Value = AddressKind> {
    prop_oneof![
        Just(AddressKind::Controller),
        Just(AddressKind::Host),
        Just(AddressKind::Instance),
        Just(AddressKind::Control),
    ]
}

// Property: the replay buffer always holds exactly the unacknowledged suffix, gap-free
proptest! {
    #[test]
    fn prop_send_buffer_holds_unacknowledged_suffix(ops in prop::collection::vec(op(), 0..200)) {
        let mut buffer = SendBuffer::new(1_000);
        let mut acked = 0u64;

        for op in ops {
            match op {
                Op::Push => {
                    let envelope = buffer.push(MessageKind::Event, |seq| Ok(json!({ "n": seq }))).unwrap();
                    prop_assert_eq!(envelope.seq, Some(buffer.last_seq()));
                }
                Op::Ack(seq) => {
                    buffer.acknowledge(seq);
                    acked = acked.max(seq.min(buffer.last_seq()));
                }
            }

            let pending: Vec<u64> = buffer.replay_after(0).filter_map(|e| e.seq).collect();
            let expected: Vec<u64> = (acked + 1..=buffer.last_seq()).collect();
            prop_assert_eq!(pending, expected);
            prop_assert_eq!(buffer.len() as u64, buffer.last_seq() - acked);
        }
    }
}

// Property: replay after any point yields the seqs above it, in order
proptest! {
    #[test]
    fn prop_replay_after_is_ordered_tail(count in 0u64..100, from in 0u64..120) {
        let mut buffer = SendBuffer::new(1_000);
        for _ in 0..count {
            buffer.push(MessageKind::Request, |seq| Ok(json!({ "request_id": seq }))).unwrap();
        }
        let replayed: Vec<u64> = buffer.replay_after(from).filter_map(|e| e.seq).collect();
        let expected: Vec<u64> = (from + 1..=count).collect();
        prop_assert_eq!(replayed, expected);
    }
}

// Property: backoff delays stay within the jitter band around the capped nominal delay
proptest! {
    #[test]
    fn prop_backoff_within_bounds(base_ms in 1u64..1_000, max_factor in 1u64..64, calls in 1usize..40) {
        let base = Duration::from_millis(base_ms);
        let max = base * max_factor as u32;
        let mut backoff = ExponentialBackoff::new(base, max, Duration::from_secs(3_600)).with_jitter();

        let mut previous_nominal = Duration::ZERO;
        for n in 1..=calls {
            let delay = backoff.delay();
            let nominal = backoff.nominal_delay(n as u32);
            prop_assert!(nominal <= max);
            prop_assert!(nominal >= previous_nominal);
            prop_assert!(delay >= nominal.mul_f64(0.5));
            prop_assert!(delay <= nominal.mul_f64(1.5));
            previous_nominal = nominal;
        }
        prop_assert_eq!(backoff.attempts(), calls as u32);
    }
}

// Property: a broadcast address reaches exactly the participants of its target kind
proptest! {
    #[test]
    fn prop_broadcast_addresses_target_kind(target in point_kind(), local_kind in point_kind(), id in 0u32..10_000) {
        let broadcast = Address::broadcast(target);
        let local = Address::new(local_kind, id);

        prop_assert_eq!(broadcast.broadcast_target(), Some(target));
        prop_assert_eq!(broadcast.addresses(&local), local_kind == target);
        prop_assert!(local.addresses(&local));
        prop_assert_eq!(broadcast.effective_kind(), target);
    }
}

// Property: frames decode the same however the byte stream is split
proptest! {
    #[test]
    fn prop_codec_independent_of_chunking(
        names in prop::collection::vec("[a-z_]{1,16}", 1..8),
        chunk in 1usize..64,
    ) {
        let mut codec = LinkCodec::default();
        let mut wire = BytesMut::new();
        let sent: Vec<Envelope> = names
            .iter()
            .enumerate()
            .map(|(i, name)| Envelope {
                seq: Some(i as u64 + 1),
                kind: MessageKind::Event,
                data: serde_json::to_value(ApplicationData {
                    src: Address::instance(i as u32),
                    dst: Address::broadcast(AddressKind::Instance),
                    name: name.clone(),
                    request_id: None,
                    data: json!({ "index": i }),
                })
                .unwrap(),
            })
            .collect();
        for envelope in &sent {
            codec.encode(envelope.clone(), &mut wire).unwrap();
        }

        let mut buffer = BytesMut::new();
        let mut received = Vec::new();
        for piece in wire.chunks(chunk) {
            buffer.extend_from_slice(piece);
            while let Some(envelope) = codec.decode(&mut buffer).unwrap() {
                received.push(envelope);
            }
        }
        prop_assert_eq!(received, sent);
    }
}
