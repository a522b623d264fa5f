//! Property tests for the receive buffer and frame decoder

use egunctl_communication::{FrameDecoder, OverflowPolicy, PushOutcome, RingBuffer};
use proptest::prelude::*;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
enum Op {
    Push(Vec<u8>),
    Pop,
    Discard(usize),
    Read(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..12).prop_map(Op::Push),
        Just(Op::Pop),
        (0usize..10).prop_map(Op::Discard),
        (0usize..10).prop_map(Op::Read),
    ]
}

proptest! {
    #[test]
    fn available_tracks_net_bytes(capacity in 2usize..40, ops in prop::collection::vec(op(), 0..60)) {
        let rb = RingBuffer::new(capacity);
        let mut model: VecDeque<u8> = VecDeque::new();

        for op in ops {
            match op {
                Op::Push(bytes) => {
                    let before = rb.available();
                    let fits = bytes.len() <= capacity - 1 - model.len();
                    let outcome = rb.push(&bytes).unwrap();
                    if fits {
                        prop_assert_eq!(outcome, PushOutcome::Stored { evicted: 0 });
                        model.extend(bytes);
                    } else {
                        prop_assert_eq!(outcome, PushOutcome::Dropped);
                        prop_assert_eq!(rb.available(), before);
                    }
                }
                Op::Pop => {
                    prop_assert_eq!(rb.pop(), model.pop_front());
                }
                Op::Discard(n) => {
                    rb.discard(n);
                    let n = n.min(model.len());
                    model.drain(..n);
                }
                Op::Read(n) => {
                    let got = rb.read(n);
                    if n <= model.len() {
                        let expected: Vec<u8> = model.drain(..n).collect();
                        prop_assert_eq!(got, Some(expected));
                    } else {
                        prop_assert_eq!(got, None);
                    }
                }
            }

            prop_assert_eq!(rb.available(), model.len());
            prop_assert_eq!(rb.remaining_capacity(), capacity - 1 - model.len());
            if let Some(last) = model.back() {
                prop_assert_eq!(rb.peek(rb.available() - 1), Some(*last));
            }
            prop_assert_eq!(rb.peek(model.len()), None);
        }
    }

    #[test]
    fn oversized_push_leaves_state_unchanged(
        prefix in prop::collection::vec(any::<u8>(), 0..8),
        extra in 1usize..20,
    ) {
        let rb = RingBuffer::with_policy(9, OverflowPolicy::Discard);
        rb.push(&prefix).unwrap();
        let batch = vec![0xAA; rb.remaining_capacity() + extra];

        prop_assert_eq!(rb.push(&batch).unwrap(), PushOutcome::Dropped);
        prop_assert_eq!(rb.read(prefix.len()), Some(prefix));
        prop_assert!(rb.is_empty());
    }

    #[test]
    fn framed_payloads_survive_leading_noise(
        noise in prop::collection::vec(b'a'..=b'z', 0..10),
        payloads in prop::collection::vec("[a-z0-9:]{1,20}", 1..5),
    ) {
        let mut stream = noise.clone();
        for p in &payloads {
            stream.extend_from_slice(b"$$$");
            stream.extend_from_slice(p.as_bytes());
            stream.push(b'\n');
        }

        let mut decoder = FrameDecoder::default();
        let frames: Vec<String> = decoder
            .feed(&stream)
            .into_iter()
            .map(|f| String::from_utf8(f).unwrap())
            .collect();
        prop_assert_eq!(frames, payloads);
    }
}
