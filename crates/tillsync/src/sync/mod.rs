//! Pull-dominant replication: identity, checkpoint, audit, apply,
//! coordination.
//!
//! The flow per identity is: `Auditor` diffs remote and local ID sets,
//! `Coordinator` turns checkpoint + audit into paged fetches, `applier`
//! writes pages into the local store, `CheckpointStore` persists the
//! cursor so restarts resume instead of refetching.

pub mod applier;
pub mod audit;
pub mod checkpoint;
pub mod coordinator;
pub mod identity;
pub mod registry;

pub use audit::{AuditStatus, Auditor, Tombstone};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use coordinator::{Coordinator, CoordinatorState, PullOutcome, SyncStatus};
pub use identity::ReplicationIdentity;
pub use registry::CoordinatorRegistry;
