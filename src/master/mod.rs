//! Master-side replication
//!
//! - `BackupSelector`: where to put each replica
//! - `ReplicaManager`: keeps every open segment replicated
//! - `ReplicatedSegment`: per-segment replication state

pub mod backup_selector;
pub mod replica_manager;
pub mod replicated_segment;

pub use backup_selector::{
    BackupSelector, BackupStats, BackupTracker, ConflictPolicy, SameServerPolicy, SelectBackup,
};
pub use replica_manager::{ReplicaManager, SegmentHandle};
pub use replicated_segment::ReplicatedSegment;
