//! Storage layer.
//!
//! [`EntityStore`] is the single transactional store for everything the
//! engine persists: entities by kind, relationships, audit records,
//! snapshots and sources. All writes go through a [`Transaction`], which
//! checks the store invariants before it commits.
//!
//! With the `persistent` feature, [`persistent::open_store`] opens a store
//! whose commits are written to a checksummed write-ahead log.

mod filter;
mod memory;
mod state;
mod traits;
mod transaction;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use filter::EntityFilter;
pub use memory::EntityStore;
pub use state::{Mutation, SequenceKind};
pub use traits::{CommitLog, CommitRecord, NoopCommitLog, StorageError};
pub use transaction::{CommitSummary, Transaction};
