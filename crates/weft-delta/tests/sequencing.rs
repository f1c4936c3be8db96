//! Sequencing tests for delta connections
//!
//! These tests verify that channels see a consistent local numbering
//! no matter how old the document is or where the channel was anchored.

use parking_lot::Mutex;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::sync::Arc;
use weft_core::message::{ConnectionState, MessageType, SequenceNumber, SequencedMessage};
use weft_delta::{BaseMapping, DeltaConnection, DeltaError, DeltaHandler, SubmitFn};

/// Handler that records the local sequence numbers it was given.
#[derive(Default)]
struct LocalLog {
    sequence_numbers: Mutex<Vec<SequenceNumber>>,
    minimums: Mutex<Vec<SequenceNumber>>,
}

impl DeltaHandler for LocalLog {
    fn process(&self, message: &SequencedMessage, _local: bool) -> Result<(), DeltaError> {
        self.sequence_numbers.lock().push(message.sequence_number);
        Ok(())
    }

    fn min_sequence_number_changed(&self, msn: SequenceNumber) {
        self.minimums.lock().push(msn);
    }

    fn set_connection_state(&self, _state: ConnectionState) {}
}

fn connection() -> DeltaConnection {
    let submit: SubmitFn = Arc::new(|_| Ok(0));
    DeltaConnection::new("channel", ConnectionState::Connected, submit)
}

fn op(seq: SequenceNumber, msn: SequenceNumber) -> SequencedMessage {
    SequencedMessage {
        client_id: Some("remote".into()),
        sequence_number: seq,
        minimum_sequence_number: msn,
        client_sequence_number: seq,
        reference_sequence_number: seq.saturating_sub(1),
        message_type: MessageType::Operation,
        contents: json!({ "seq": seq }),
        origin: None,
        timestamp: 0,
    }
}

// ============================================================================
// Local Numbering
// ============================================================================

#[test]
fn test_local_numbering_starts_after_attach() {
    let conn = connection();
    let log = LocalLog::default();
    conn.set_base_mapping(BaseMapping::attach(100), 95).unwrap();

    for seq in 101..=105 {
        conn.process(&log, &op(seq, 96), false).unwrap();
    }

    assert_eq!(*log.sequence_numbers.lock(), vec![1, 2, 3, 4, 5]);
    assert_eq!(*log.minimums.lock(), vec![0]);
}

#[test]
fn test_loaded_channel_continues_local_numbering() {
    // A channel persisted at local seq 7 when the document was at 50.
    let conn = connection();
    let log = LocalLog::default();
    conn.set_base_mapping(BaseMapping::new(7, 50), 48).unwrap();

    conn.process(&log, &op(51, 49), false).unwrap();
    conn.process(&log, &op(60, 55), false).unwrap();

    assert_eq!(*log.sequence_numbers.lock(), vec![8, 17]);
    assert_eq!(*log.minimums.lock(), vec![7, 12]);
}

#[test]
fn test_routing_before_mapping_is_protocol_violation() {
    let conn = connection();
    let log = LocalLog::default();
    let err = conn.process(&log, &op(3, 1), false).unwrap_err();
    assert!(err.is_protocol_violation());
    assert!(log.sequence_numbers.lock().is_empty());
}

#[test]
fn test_random_gaps_keep_local_numbering_monotonic() {
    let mut rng = StdRng::seed_from_u64(7);
    let conn = connection();
    let log = LocalLog::default();
    conn.set_base_mapping(BaseMapping::attach(10), 10).unwrap();

    let mut seq = 10;
    for _ in 0..200 {
        seq += rng.gen_range(1..5);
        conn.process(&log, &op(seq, seq - 1), false).unwrap();
    }

    let locals = log.sequence_numbers.lock();
    assert!(locals.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(*locals.last().unwrap(), seq - 10);
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #[test]
    fn stale_msn_updates_have_no_effect(
        base in 0u64..1000,
        current in 0u64..1000,
        stale in 0u64..1000
    ) {
        prop_assume!(stale <= current);
        let conn = connection();
        let log = LocalLog::default();
        conn.set_base_mapping(BaseMapping::attach(base), 0).unwrap();
        conn.update_minimum_sequence_number(&log, current);
        let before = log.minimums.lock().clone();

        prop_assert!(!conn.update_minimum_sequence_number(&log, stale));
        prop_assert_eq!(conn.minimum_sequence_number(), current);
        prop_assert_eq!(&*log.minimums.lock(), &before);
    }

    #[test]
    fn translation_is_floored_and_monotonic(
        local in 0u64..100,
        document in 0u64..1000,
        a in 0u64..2000,
        b in 0u64..2000
    ) {
        let mapping = BaseMapping::new(local, document);
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(mapping.to_local(low) <= mapping.to_local(high));
        prop_assert!(mapping.to_local(low) >= local);
        if low <= document {
            prop_assert_eq!(mapping.to_local(low), local);
        }
    }
}
