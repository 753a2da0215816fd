//! RPC seams to the rest of the cluster
//!
//! The wire protocol lives outside this crate. Components talk to peers and
//! to the coordinator through these traits; `memory::MemoryCluster` is an
//! in-process implementation used by the test suite.

pub mod memory;

use crate::common::{Result, ServerId};
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;

pub use memory::MemoryCluster;

/// Response to a liveness ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingReply {
    /// Echo of the request nonce.
    pub nonce: u64,
    /// Membership version of the responder's server list.
    pub server_list_version: u64,
}

/// Liveness pings to peers.
pub trait PingClient: Send + Sync + 'static {
    /// Ping the server at `locator`, failing with `Error::Timeout` if it does
    /// not answer within `timeout`.
    fn ping(
        &self,
        locator: &str,
        nonce: u64,
        timeout: Duration,
    ) -> impl Future<Output = Result<PingReply>> + Send;
}

/// Requests to the cluster coordinator.
pub trait CoordinatorClient: Send + Sync + 'static {
    /// Report that `server_id` did not answer a ping.
    fn hint_server_down(&self, server_id: ServerId) -> impl Future<Output = Result<()>> + Send;

    /// Ask the coordinator to push a complete server list to `server_id`.
    fn request_server_list(&self, server_id: ServerId)
        -> impl Future<Output = Result<()>> + Send;
}

/// One replica write to a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSegment {
    pub backup: ServerId,
    pub locator: String,
    pub master: ServerId,
    pub segment_id: u64,
    pub offset: u64,
    pub data: Bytes,
    /// First write of this replica; the backup allocates space for it.
    pub open: bool,
    /// Last write; the replica is complete after it.
    pub close: bool,
}

/// Replica writes and frees on backups.
pub trait BackupClient: Send + Sync + 'static {
    fn write_segment(&self, request: WriteSegment) -> impl Future<Output = Result<()>> + Send;

    fn free_segment(
        &self,
        backup: ServerId,
        locator: &str,
        master: ServerId,
        segment_id: u64,
    ) -> impl Future<Output = Result<()>> + Send;
}
