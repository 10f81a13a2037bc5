//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random stream workloads that keep
//! the log's preconditions (non-zero Asns, bounded record sizes).

use proptest::prelude::*;
use ringlog_core::{Asn, StreamId, StreamType};

/// Strategy for generating stream ids.
pub fn stream_id_strategy() -> impl Strategy<Value = StreamId> {
    prop::array::uniform16(any::<u8>()).prop_map(StreamId::from_bytes)
}

/// Strategy for generating stream types.
pub fn stream_type_strategy() -> impl Strategy<Value = StreamType> {
    prop::array::uniform16(any::<u8>()).prop_map(StreamType::from_bytes)
}

/// Strategy for generating Asns in `1..=max`.
pub fn asn_strategy(max: u64) -> impl Strategy<Value = Asn> {
    (1..=max).prop_map(Asn::new)
}

/// Strategy for generating record payloads up to three blocks.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..12_000)
}

/// Strategy for generating caller metadata.
pub fn metadata_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

/// One step of a generated stream workload.
#[derive(Debug, Clone)]
pub enum StreamOp {
    /// Write the next version of `asn`.
    Write {
        /// Target Asn.
        asn: Asn,
        /// Caller metadata.
        metadata: Vec<u8>,
        /// Record payload.
        payload: Vec<u8>,
    },
    /// Truncate everything at or below `up_to`.
    Truncate {
        /// New truncation point.
        up_to: Asn,
    },
    /// Take a stream checkpoint.
    Checkpoint,
    /// Drop the log without closing it and recover.
    Crash,
}

/// Strategy for generating one workload step over Asns `1..=max_asn`.
pub fn stream_op_strategy(max_asn: u64) -> impl Strategy<Value = StreamOp> {
    prop_oneof![
        8 => (asn_strategy(max_asn), metadata_strategy(), payload_strategy())
            .prop_map(|(asn, metadata, payload)| StreamOp::Write { asn, metadata, payload }),
        1 => asn_strategy(max_asn).prop_map(|up_to| StreamOp::Truncate { up_to }),
        1 => Just(StreamOp::Checkpoint),
        1 => Just(StreamOp::Crash),
    ]
}

/// Strategy for generating a workload of up to `max_len` steps.
pub fn stream_ops_strategy(max_asn: u64, max_len: usize) -> impl Strategy<Value = Vec<StreamOp>> {
    prop::collection::vec(stream_op_strategy(max_asn), 1..=max_len)
}
