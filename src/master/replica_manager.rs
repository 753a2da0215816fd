//! Replica management for a master's segments
//!
//! The `ReplicaManager` owns the replication state of every segment this
//! master has open, drives it forward when the host calls `proceed()`, and
//! hides backup failures from its callers by rebuilding lost replicas on
//! other backups.

use crate::common::{MasterConfig, Result, ServerId};
use crate::master::backup_selector::{BackupSelector, BackupTracker};
use crate::master::replicated_segment::{Context, ReplicatedSegment};
use crate::membership::ServerList;
use crate::transport::BackupClient;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Pause between passes while waiting in `sync`.
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// State shared between the manager and its segment handles.
struct Inner {
    selector: BackupSelector,
    segments: Vec<Option<ReplicatedSegment>>,
    free_slots: Vec<usize>,
    write_rpcs_in_flight: u32,
}

impl Inner {
    fn segment_mut(&mut self, slot: usize) -> Option<&mut ReplicatedSegment> {
        self.segments.get_mut(slot).and_then(Option::as_mut)
    }

    fn insert(&mut self, segment: ReplicatedSegment) -> usize {
        match self.free_slots.pop() {
            Some(slot) => {
                self.segments[slot] = Some(segment);
                slot
            }
            None => {
                self.segments.push(Some(segment));
                self.segments.len() - 1
            }
        }
    }
}

/// Replicates a master's segments to `num_replicas` backups each.
pub struct ReplicaManager<B: BackupClient> {
    inner: Arc<Mutex<Inner>>,
    client: Arc<B>,
    master_id: ServerId,
    /// Replicas kept for each segment.
    pub num_replicas: u32,
    max_write_rpcs_in_flight: u32,
    backup_rpc_timeout: Duration,
}

impl<B: BackupClient> ReplicaManager<B> {
    /// Create a manager for `master_id`. Its backup tracker is registered
    /// with `server_list`, so backups already in the list are usable right
    /// away.
    pub fn new(server_list: &ServerList, master_id: ServerId, config: &MasterConfig, client: Arc<B>) -> Self {
        let mut tracker = BackupTracker::new();
        server_list.register_tracker(&mut tracker);
        let selector = BackupSelector::new(tracker, config.segment_size);

        Self {
            inner: Arc::new(Mutex::new(Inner {
                selector,
                segments: Vec::new(),
                free_slots: Vec::new(),
                write_rpcs_in_flight: 0,
            })),
            client,
            master_id,
            num_replicas: config.num_replicas,
            max_write_rpcs_in_flight: config.max_write_rpcs_in_flight,
            backup_rpc_timeout: config.backup_rpc_timeout(),
        }
    }

    pub fn master_id(&self) -> ServerId {
        self.master_id
    }

    /// Start replicating a new segment whose initial contents are `data`.
    /// Replication happens on later calls to `proceed` or `sync`.
    pub fn open_segment(&self, segment_id: u64, data: &[u8]) -> SegmentHandle {
        let segment = ReplicatedSegment::new(segment_id, data, self.num_replicas);
        let slot = self.inner.lock().unwrap().insert(segment);
        tracing::debug!("Opened segment {} ({} bytes)", segment_id, data.len());
        SegmentHandle {
            inner: self.inner.clone(),
            slot,
            segment_id,
        }
    }

    /// Advance replication as far as possible without waiting.
    pub fn proceed(&self) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        inner.selector.apply_tracker_changes();
        for backup in inner.selector.take_removed_backups() {
            tracing::warn!(server_id = %backup, "Backup left the cluster; re-replicating its segments");
            for segment in inner.segments.iter_mut().flatten() {
                segment.handle_backup_failure(backup, &mut inner.write_rpcs_in_flight);
            }
        }

        let mut ctx = Context {
            selector: &mut inner.selector,
            client: &self.client,
            master: self.master_id,
            write_rpcs_in_flight: &mut inner.write_rpcs_in_flight,
            max_write_rpcs_in_flight: self.max_write_rpcs_in_flight,
            rpc_timeout: self.backup_rpc_timeout,
        };
        for (slot, entry) in inner.segments.iter_mut().enumerate() {
            let reclaim = match entry {
                Some(segment) => segment.perform(&mut ctx),
                None => false,
            };
            if reclaim {
                tracing::debug!("Segment in slot {} freed", slot);
                *entry = None;
                inner.free_slots.push(slot);
            }
        }
    }

    /// Wait until every segment is fully replicated and every freed
    /// segment has been released. Segments that cannot find backups keep
    /// this waiting until backups join.
    pub async fn sync(&self) {
        loop {
            self.proceed();
            if self.is_synced() {
                return;
            }
            tokio::time::sleep(SYNC_POLL_INTERVAL).await;
        }
    }

    /// No replication work is outstanding.
    pub fn is_synced(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.segments.iter().flatten().all(ReplicatedSegment::is_synced)
    }

    /// Write RPCs currently outstanding across all segments.
    pub fn write_rpcs_in_flight(&self) -> u32 {
        self.inner.lock().unwrap().write_rpcs_in_flight
    }

    /// Segments open or still being freed.
    pub fn segment_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.segments.iter().flatten().count()
    }

    /// Backups holding (or being sent) replicas of `segment_id`.
    pub fn backups_for(&self, segment_id: u64) -> Vec<ServerId> {
        let inner = self.inner.lock().unwrap();
        inner
            .segments
            .iter()
            .flatten()
            .find(|s| s.segment_id() == segment_id)
            .map(ReplicatedSegment::backups)
            .unwrap_or_default()
    }
}

/// Caller's handle to one replicated segment.
pub struct SegmentHandle {
    inner: Arc<Mutex<Inner>>,
    slot: usize,
    segment_id: u64,
}

impl SegmentHandle {
    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    /// Append `data` to the segment; the new bytes are replicated on later
    /// passes.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.segment_mut(self.slot) {
            Some(segment) => segment.append(data),
            None => Ok(()),
        }
    }

    /// Mark the segment complete. Backups are told on the next write.
    pub fn close(&self) {
        if let Some(segment) = self.inner.lock().unwrap().segment_mut(self.slot) {
            segment.close();
        }
    }

    /// All replicas hold the current contents.
    pub fn is_synced(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .segments
            .get(self.slot)
            .and_then(Option::as_ref)
            .is_some_and(ReplicatedSegment::is_synced)
    }

    /// Release every replica of the segment. The segment is dropped once
    /// all backups have been told.
    pub fn free(self) {
        if let Some(segment) = self.inner.lock().unwrap().segment_mut(self.slot) {
            tracing::debug!("Freeing segment {}", self.segment_id);
            segment.free();
        }
    }
}
