//! # Strand Core
//!
//! Leaf types shared by every layer of the Strand log engine.
//!
//! ## Contents
//!
//! - **Seq**: positions in an append-only log, with the `SEQ_EMPTY` and
//!   `SEQ_ERRORED` sentinels and the [`SeqWrapper`] pairing
//! - **Addr**: opaque byte-string keys for indexes and multilogs
//! - **Codec**: pluggable value encodings (postcard, JSON, raw, seq)
//! - **SequenceObservable**: the tail counter with blocking `wait_for`
//! - **Observable**: reference-counted value holders used by index caches
//!
//! ## Example
//!
//! ```rust,ignore
//! use strand_core::SequenceObservable;
//!
//! let tail = SequenceObservable::new(0);
//! let wait = tail.wait_for(2);
//! tail.inc();
//! tail.inc();
//! wait.await;
//! ```

pub mod addr;
pub mod codec;
pub mod error;
pub mod observable;
pub mod seq;
pub mod seqobs;

pub use addr::Addr;
pub use codec::{Codec, JsonCodec, PostcardCodec, RawCodec, SeqCodec};
pub use error::LogError;
pub use observable::{Listener, Observable, ReadOnlyObservable, Registration};
pub use seq::{SEQ_EMPTY, SEQ_ERRORED, Seq, SeqWrapper, decode_seq, encode_seq};
pub use seqobs::{ReadOnlySequence, SequenceObservable, WaitFor};
