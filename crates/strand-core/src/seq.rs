//! Sequence numbers
//!
//! A [`Seq`] names a position in an append-only log. The first entry of a
//! log has seq 0. Two negative sentinels exist: [`SEQ_EMPTY`] for an empty
//! log and [`SEQ_ERRORED`] for a position that has not been established yet.

use serde::{Deserialize, Serialize};

/// Position of an entry in a log
pub type Seq = i64;

/// The log holds no entries
pub const SEQ_EMPTY: Seq = -1;

/// The position is unknown (uninitialized or errored), never a real entry
pub const SEQ_ERRORED: Seq = -2;

/// A value paired with the seq it was read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqWrapper<T> {
    /// Position of the value in its log
    pub seq: Seq,
    /// The value itself
    pub value: T,
}

impl<T> SeqWrapper<T> {
    /// Wrap a value with its seq
    pub fn new(seq: Seq, value: T) -> Self {
        Self { seq, value }
    }

    pub fn seq(&self) -> Seq {
        self.seq
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    /// Transform the wrapped value, keeping the seq
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> SeqWrapper<U> {
        SeqWrapper {
            seq: self.seq,
            value: f(self.value),
        }
    }
}

/// Encode a seq as the 8-byte big-endian marker stored next to indexes
pub fn encode_seq(seq: Seq) -> [u8; 8] {
    seq.to_be_bytes()
}

/// Decode an 8-byte big-endian seq marker
pub fn decode_seq(raw: &[u8]) -> Option<Seq> {
    let bytes: [u8; 8] = raw.try_into().ok()?;
    Some(Seq::from_be_bytes(bytes))
}
