//! Per-call conversation context
//!
//! Every active call owns one [`CallContext`]: seeded identity/loan data,
//! the current dialogue node, extracted flags, counters, and the transcript.
//! The [`ContextStore`] keeps one context per call id and serializes all
//! mutation per call.

mod call;
mod store;

pub use call::{
    value_truthy, CallContext, ContextUpdate, Language, TranscriptEntry, TranscriptRole,
};
pub(crate) use call::is_sentinel;
pub use store::ContextStore;
