//! Property-based tests for the wire codec and the lockstep engine.
//!
//! These tests use proptest against the exposed `__internal` module.
//!
//! # Properties Tested
//!
//! ## Codec
//! - A frame decodes back to the kind and payload it was encoded from
//! - Any strict prefix of a frame asks for more data
//! - Frames written back to back come off the buffer one by one
//! - Arbitrary bytes never panic, and a malformed prefix is always discarded
//!
//! ## SyncLayer
//! - Engines fed the same batches reach the same state and frame
//! - The state is the seed plus every delta, with wrapping arithmetic

use lockstep_mesh::__internal::{decode_frame, encode_frame, Decoded, SyncLayer, HEADER_SIZE};
use lockstep_mesh::telemetry::InvariantChecker;
use lockstep_mesh::{Frame, FrameAdvance, MessageKind, SyncConfig};
use proptest::prelude::*;
use web_time::Instant;

const MAX_PAYLOAD: usize = 4096;

// ============================================================================
// Strategies
// ============================================================================

fn kind_strategy() -> impl Strategy<Value = MessageKind> {
    prop::sample::select(MessageKind::ALL.to_vec())
}

fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

/// Per-frame deltas for each of `participants` engines.
fn frames_strategy(participants: usize) -> impl Strategy<Value = Vec<Vec<Vec<i32>>>> {
    prop::collection::vec(
        prop::collection::vec(prop::collection::vec(any::<i32>(), 0..4), participants),
        1..12,
    )
}

// ============================================================================
// Codec
// ============================================================================

proptest! {
    #[test]
    fn prop_frame_decodes_to_its_source(kind in kind_strategy(), payload in payload_strategy()) {
        let bytes = encode_frame(kind, &payload).unwrap();
        prop_assert_eq!(bytes.len(), HEADER_SIZE + payload.len());
        match decode_frame(&bytes, MAX_PAYLOAD) {
            Decoded::Frame { message, consumed } => {
                prop_assert_eq!(message.kind, kind);
                prop_assert_eq!(message.payload, payload);
                prop_assert_eq!(consumed, bytes.len());
            },
            other => prop_assert!(false, "unexpected {:?}", other),
        }
    }

    #[test]
    fn prop_truncated_frame_needs_more_data(
        kind in kind_strategy(),
        payload in payload_strategy(),
        cut in any::<prop::sample::Index>(),
    ) {
        let bytes = encode_frame(kind, &payload).unwrap();
        let prefix = &bytes[..cut.index(bytes.len())];
        prop_assert_eq!(decode_frame(prefix, MAX_PAYLOAD), Decoded::NeedMoreData);
    }

    #[test]
    fn prop_back_to_back_frames_decode_in_order(
        frames in prop::collection::vec((kind_strategy(), payload_strategy()), 1..8),
    ) {
        let mut stream = Vec::new();
        for (kind, payload) in &frames {
            stream.extend(encode_frame(*kind, payload).unwrap());
        }
        let mut offset = 0;
        for (kind, payload) in &frames {
            match decode_frame(&stream[offset..], MAX_PAYLOAD) {
                Decoded::Frame { message, consumed } => {
                    prop_assert_eq!(message.kind, *kind);
                    prop_assert_eq!(&message.payload, payload);
                    offset += consumed;
                },
                other => prop_assert!(false, "unexpected {:?} at offset {}", other, offset),
            }
        }
        prop_assert_eq!(offset, stream.len());
    }

    #[test]
    fn prop_garbage_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        match decode_frame(&bytes, 32) {
            Decoded::Frame { consumed, .. } => {
                prop_assert!(consumed >= HEADER_SIZE && consumed <= bytes.len());
            },
            Decoded::Malformed { consumed, .. } => {
                prop_assert!(consumed >= 1 && consumed <= bytes.len());
            },
            Decoded::NeedMoreData => {},
        }
    }
}

// ============================================================================
// SyncLayer
// ============================================================================

fn engines(seed: i32, participants: usize) -> (Vec<String>, Vec<SyncLayer>) {
    let names: Vec<String> = (0..participants).map(|i| format!("p{i}")).collect();
    let layers = names
        .iter()
        .map(|name| {
            let mut layer = SyncLayer::new(name.clone(), SyncConfig::default());
            layer.start(seed, names.iter().cloned());
            layer
        })
        .collect();
    (names, layers)
}

proptest! {
    #[test]
    fn prop_engines_agree(
        seed in any::<i32>(),
        (participants, frames) in (2usize..5).prop_flat_map(|n| (Just(n), frames_strategy(n))),
    ) {
        let (names, mut layers) = engines(seed, participants);
        let now = Instant::now();
        let mut expected = seed;

        for (index, deltas) in frames.iter().enumerate() {
            let batches: Vec<_> = layers
                .iter_mut()
                .zip(deltas)
                .map(|(layer, ticked)| layer.submit_local(ticked))
                .collect();
            for (receiver, layer) in layers.iter_mut().enumerate() {
                for (sender, batch) in batches.iter().enumerate() {
                    if sender != receiver {
                        prop_assert!(layer.enqueue(&names[sender], batch.clone()));
                    }
                }
            }
            for delta in deltas.iter().flatten() {
                expected = expected.wrapping_add(*delta);
            }

            let next = Frame::new(index as i32 + 1);
            for layer in &mut layers {
                let outcome = layer.try_advance(now);
                prop_assert!(outcome.diverged.is_empty(), "{:?}", outcome.diverged);
                prop_assert_eq!(
                    outcome.advance,
                    FrameAdvance::Advanced { frame: next, state: expected }
                );
                prop_assert!(layer.check_invariants().is_ok());
            }
        }
    }
}
