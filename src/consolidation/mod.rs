//! Duplicate detection and merging.
//!
//! The pieces, leaves first:
//!
//! - [`ClusterBuilder`] groups matched records transitively
//! - [`MergeResolver`] decides what a merged entity looks like
//! - [`RelationshipRewriter`] keeps edges on live endpoints
//! - [`AuditAndSnapshotManager`] records each merge and reverses it
//! - [`ConsolidationAgent`] drives a batch through all of the above

mod agent;
mod audit;
mod cluster;
mod locks;
mod merge;
mod rewrite;
mod stats;

pub use agent::ConsolidationAgent;
pub use audit::{AuditAndSnapshotManager, MergeRequest, RollbackOutcome};
pub use cluster::{Cluster, ClusterBuilder};
pub use locks::KindLocks;
pub use merge::{select_canonical, MergePlan, MergeResolver};
pub use rewrite::{RelationshipRewriter, RewriteReport};
pub use stats::{CancelToken, ClusterFailure, ConsolidationResult, ConsolidationStats, StatsBuilder};
