//! Backup placement
//!
//! Chooses backups for the replicas of a master's segments while obeying
//! placement constraints and balancing the work each backup would have to
//! do during recovery. Recovery time after a crash is bounded by the backup
//! that has the most data to read back, so primaries are placed by
//! predicted read time rather than by raw replica count.

use crate::common::{Error, Result, ServerId, ServiceType};
use crate::membership::{ServerChangeEvent, ServerTracker};
use rand::seq::SliceRandom;

/// Replica distribution statistics for one backup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupStats {
    /// Number of primary replicas this master has placed on the backup.
    pub primary_replica_count: u32,
    /// Read bandwidth the backup advertised at enlistment.
    pub expected_read_bytes_per_sec: u32,
}

impl BackupStats {
    pub fn new(expected_read_bytes_per_sec: u32) -> Self {
        Self {
            primary_replica_count: 0,
            expected_read_bytes_per_sec,
        }
    }

    /// Milliseconds the backup would need to read back every primary
    /// replica placed on it. Backups that never reported a bandwidth are
    /// estimated at zero.
    pub fn expected_read_ms(&self, segment_size: u32) -> u64 {
        if self.expected_read_bytes_per_sec == 0 {
            return 0;
        }
        let ms = u128::from(self.primary_replica_count) * u128::from(segment_size) * 1000
            / u128::from(self.expected_read_bytes_per_sec);
        u64::try_from(ms).unwrap_or(u64::MAX)
    }
}

/// Tracks `BackupStats` for every backup in the cluster.
pub type BackupTracker = ServerTracker<BackupStats>;

/// Decides whether two backups may not both hold replicas of one segment.
pub trait ConflictPolicy: Send {
    fn conflict(&self, backup: ServerId, other: ServerId) -> bool;
}

/// Never place two replicas on the same backup.
#[derive(Debug, Clone, Copy, Default)]
pub struct SameServerPolicy;

impl ConflictPolicy for SameServerPolicy {
    fn conflict(&self, backup: ServerId, other: ServerId) -> bool {
        backup == other
    }
}

/// Backup selection as seen by the replication code; lets tests substitute
/// a scripted selector.
pub trait SelectBackup: Send {
    /// Choose the backup for a segment's primary replica, avoiding
    /// conflicts with `already_chosen`.
    fn select_primary(&mut self, already_chosen: &[ServerId]) -> Result<ServerId>;

    /// Choose a backup for a secondary replica, avoiding conflicts with
    /// `already_chosen`.
    fn select_secondary(&mut self, already_chosen: &[ServerId]) -> Result<ServerId>;

    /// Service locator of a selected backup.
    fn locate(&self, backup: ServerId) -> Result<String>;

    /// A primary replica placed by `select_primary` no longer lives on
    /// `backup`.
    fn release_primary(&mut self, backup: ServerId);
}

pub struct BackupSelector {
    /// Each tracked backup carries the `BackupStats` for it.
    tracker: BackupTracker,
    policy: Box<dyn ConflictPolicy>,
    segment_size: u32,
    /// Backups removed since the owner last called `take_removed_backups`.
    removed: Vec<ServerId>,
}

impl BackupSelector {
    pub fn new(tracker: BackupTracker, segment_size: u32) -> Self {
        Self::with_policy(tracker, segment_size, Box::new(SameServerPolicy))
    }

    pub fn with_policy(tracker: BackupTracker, segment_size: u32, policy: Box<dyn ConflictPolicy>) -> Self {
        Self {
            tracker,
            policy,
            segment_size,
            removed: Vec::new(),
        }
    }

    pub fn tracker(&self) -> &BackupTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut BackupTracker {
        &mut self.tracker
    }

    pub fn stats(&self, backup: ServerId) -> Option<&BackupStats> {
        self.tracker.get(backup).ok().flatten()
    }

    /// Bring the tracker up to date: set up stats for new backups and
    /// release them for departed ones.
    pub fn apply_tracker_changes(&mut self) {
        while let Some(change) = self.tracker.get_change() {
            let id = change.details.server_id;
            match change.event {
                ServerChangeEvent::Added => {
                    if !change.details.services.has(ServiceType::Backup) {
                        continue;
                    }
                    let stats = BackupStats::new(change.details.expected_read_bytes_per_sec);
                    if let Ok(slot) = self.tracker.get_mut(id) {
                        *slot = Some(Box::new(stats));
                    }
                    tracing::debug!(
                        "Backup {} at {} joined ({} bytes/s)",
                        id,
                        change.details.service_locator,
                        stats.expected_read_bytes_per_sec
                    );
                }
                ServerChangeEvent::Removed => {
                    let had_stats = self
                        .tracker
                        .get_mut(id)
                        .map(|slot| slot.take().is_some())
                        .unwrap_or(false);
                    if had_stats {
                        tracing::debug!("Backup {} left", id);
                        self.removed.push(id);
                    }
                }
            }
        }
    }

    /// Backups that left the cluster since the last call.
    pub fn take_removed_backups(&mut self) -> Vec<ServerId> {
        std::mem::take(&mut self.removed)
    }

    pub fn conflict(&self, backup: ServerId, other: ServerId) -> bool {
        self.policy.conflict(backup, other)
    }

    fn conflict_with_any(&self, backup: ServerId, others: &[ServerId]) -> bool {
        others.iter().any(|other| self.conflict(backup, *other))
    }

    /// Backups eligible for a new replica, with their stats.
    fn candidates(&self, already_chosen: &[ServerId]) -> Vec<(ServerId, BackupStats)> {
        self.tracker
            .iter()
            .filter(|(details, _)| details.services.has(ServiceType::Backup))
            .filter_map(|(details, stats)| stats.map(|s| (details.server_id, *s)))
            .filter(|(id, _)| !self.conflict_with_any(*id, already_chosen))
            .collect()
    }
}

impl SelectBackup for BackupSelector {
    fn select_primary(&mut self, already_chosen: &[ServerId]) -> Result<ServerId> {
        self.apply_tracker_changes();

        let candidates = self.candidates(already_chosen);
        let least = candidates
            .iter()
            .map(|(_, stats)| stats.expected_read_ms(self.segment_size))
            .min()
            .ok_or(Error::NoCandidate)?;
        let tied: Vec<ServerId> = candidates
            .iter()
            .filter(|(_, stats)| stats.expected_read_ms(self.segment_size) == least)
            .map(|(id, _)| *id)
            .collect();
        let chosen = *tied.choose(&mut rand::thread_rng()).ok_or(Error::NoCandidate)?;

        if let Ok(Some(stats)) = self.tracker.get_mut(chosen) {
            stats.primary_replica_count = stats.primary_replica_count.saturating_add(1);
        }
        tracing::trace!("Chose backup {} for primary replica ({}ms expected)", chosen, least);
        Ok(chosen)
    }

    fn select_secondary(&mut self, already_chosen: &[ServerId]) -> Result<ServerId> {
        self.apply_tracker_changes();

        let candidates = self.candidates(already_chosen);
        candidates
            .choose(&mut rand::thread_rng())
            .map(|(id, _)| *id)
            .ok_or(Error::NoCandidate)
    }

    fn locate(&self, backup: ServerId) -> Result<String> {
        self.tracker.get_locator(backup).map(str::to_string)
    }

    fn release_primary(&mut self, backup: ServerId) {
        if let Ok(Some(stats)) = self.tracker.get_mut(backup) {
            stats.primary_replica_count = stats.primary_replica_count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::ServerDetails;

    const SEGMENT_SIZE: u32 = 8 * 1024 * 1024;
    const MB: u32 = 1024 * 1024;

    fn selector_with(backups: &[(u32, u32)]) -> BackupSelector {
        let mut tracker = BackupTracker::new();
        for (index, speed_mb) in backups {
            tracker.enqueue_change(
                ServerDetails::new(ServerId::new(*index, 0), format!("mock:host=b{}", index), &[ServiceType::Backup])
                    .with_read_speed(speed_mb * MB),
                ServerChangeEvent::Added,
            );
        }
        BackupSelector::new(tracker, SEGMENT_SIZE)
    }

    fn counts(selector: &BackupSelector, ids: &[ServerId]) -> Vec<u32> {
        ids.iter()
            .map(|id| selector.stats(*id).unwrap().primary_replica_count)
            .collect()
    }

    #[test]
    fn test_expected_read_ms() {
        let mut stats = BackupStats::new(100 * MB);
        assert_eq!(stats.expected_read_ms(SEGMENT_SIZE), 0);
        stats.primary_replica_count = 25;
        // 25 * 8 MB at 100 MB/s
        assert_eq!(stats.expected_read_ms(SEGMENT_SIZE), 2000);
        assert_eq!(BackupStats::new(0).expected_read_ms(SEGMENT_SIZE), 0);
    }

    #[test]
    fn test_apply_tracker_changes() {
        let mut selector = selector_with(&[(1, 100), (2, 50)]);
        selector.apply_tracker_changes();

        assert_eq!(selector.stats(ServerId::new(1, 0)).unwrap().expected_read_bytes_per_sec, 100 * MB);
        assert_eq!(selector.stats(ServerId::new(2, 0)).unwrap().primary_replica_count, 0);

        selector.tracker_mut().enqueue_change(
            ServerDetails::with_id(ServerId::new(1, 0)),
            ServerChangeEvent::Removed,
        );
        selector.apply_tracker_changes();
        assert!(selector.stats(ServerId::new(1, 0)).is_none());
        assert_eq!(selector.take_removed_backups(), vec![ServerId::new(1, 0)]);
        assert!(selector.take_removed_backups().is_empty());

        // The next drain must not trip the release assertion.
        assert!(selector.tracker_mut().get_change().is_none());
    }

    #[test]
    fn test_non_backups_get_no_stats() {
        let mut tracker = BackupTracker::new();
        tracker.enqueue_change(
            ServerDetails::new(ServerId::new(1, 0), "mock:master", &[ServiceType::Master]),
            ServerChangeEvent::Added,
        );
        let mut selector = BackupSelector::new(tracker, SEGMENT_SIZE);
        assert!(matches!(selector.select_primary(&[]), Err(Error::NoCandidate)));
        assert!(selector.stats(ServerId::new(1, 0)).is_none());

        selector.tracker_mut().enqueue_change(
            ServerDetails::with_id(ServerId::new(1, 0)),
            ServerChangeEvent::Removed,
        );
        selector.apply_tracker_changes();
        assert!(selector.take_removed_backups().is_empty());
    }

    #[test]
    fn test_select_primary_avoids_already_chosen() {
        let mut selector = selector_with(&[(1, 100), (2, 100), (3, 100)]);
        let all = [ServerId::new(1, 0), ServerId::new(2, 0), ServerId::new(3, 0)];

        for _ in 0..50 {
            let chosen = selector.select_primary(&all[..2]).unwrap();
            assert_eq!(chosen, ServerId::new(3, 0));
        }
        assert!(matches!(selector.select_primary(&all), Err(Error::NoCandidate)));
    }

    #[test]
    fn test_select_primary_routes_to_least_loaded() {
        let mut selector = selector_with(&[(1, 100), (2, 100)]);
        selector.apply_tracker_changes();
        let a = ServerId::new(1, 0);
        let b = ServerId::new(2, 0);

        selector.tracker_mut().get_mut(a).unwrap().as_mut().unwrap().primary_replica_count = 3;
        for _ in 0..3 {
            assert_eq!(selector.select_primary(&[]).unwrap(), b);
        }
        assert_eq!(counts(&selector, &[a, b]), vec![3, 3]);
    }

    #[test]
    fn test_select_primary_weighs_bandwidth() {
        // A backup twice as fast should end up with about twice the primaries.
        let mut selector = selector_with(&[(1, 200), (2, 100)]);
        for _ in 0..30 {
            selector.select_primary(&[]).unwrap();
        }
        let c = counts(&selector, &[ServerId::new(1, 0), ServerId::new(2, 0)]);
        assert_eq!(c[0] + c[1], 30);
        assert!((19..=21).contains(&c[0]), "fast backup got {}", c[0]);
    }

    #[test]
    fn test_select_primary_balances_equal_backups() {
        let mut selector = selector_with(&[(1, 100), (2, 100), (3, 100)]);
        let ids = [ServerId::new(1, 0), ServerId::new(2, 0), ServerId::new(3, 0)];

        let mut chosen: Vec<ServerId> = Vec::new();
        for _ in 0..10 {
            if chosen.len() == ids.len() {
                chosen.clear();
            }
            let id = selector.select_primary(&chosen).unwrap();
            assert!(!chosen.contains(&id));
            chosen.push(id);
        }

        let c = counts(&selector, &ids);
        assert_eq!(c.iter().sum::<u32>(), 10);
        let max = *c.iter().max().unwrap();
        let min = *c.iter().min().unwrap();
        assert!(max - min <= 1, "unbalanced: {:?}", c);
    }

    #[test]
    fn test_release_primary() {
        let mut selector = selector_with(&[(1, 100), (2, 100)]);
        let a = ServerId::new(1, 0);
        let b = ServerId::new(2, 0);

        let first = selector.select_primary(&[]).unwrap();
        selector.release_primary(first);
        assert_eq!(counts(&selector, &[a, b]), vec![0, 0]);

        // Never goes below zero, and unknown backups are ignored.
        selector.release_primary(a);
        selector.release_primary(ServerId::new(9, 0));
        assert_eq!(counts(&selector, &[a, b]), vec![0, 0]);

        selector.tracker_mut().get_mut(a).unwrap().as_mut().unwrap().primary_replica_count = u32::MAX;
        selector.tracker_mut().get_mut(b).unwrap().as_mut().unwrap().primary_replica_count = u32::MAX;
        selector.select_primary(&[]).unwrap();
        assert_eq!(counts(&selector, &[a, b]), vec![u32::MAX, u32::MAX]);
    }

    #[test]
    fn test_select_secondary() {
        let mut selector = selector_with(&[(1, 100), (2, 100), (3, 100)]);
        let mut seen = [0u32; 4];
        for _ in 0..3000 {
            let id = selector.select_secondary(&[ServerId::new(2, 0)]).unwrap();
            seen[id.index() as usize] += 1;
        }
        assert_eq!(seen[2], 0);
        assert!(seen[1] > 1200 && seen[3] > 1200, "{:?}", seen);
        // Secondaries do not count as primary load.
        assert_eq!(counts(&selector, &[ServerId::new(1, 0), ServerId::new(3, 0)]), vec![0, 0]);

        let mut empty = selector_with(&[]);
        assert!(matches!(empty.select_secondary(&[]), Err(Error::NoCandidate)));
    }

    #[test]
    fn test_custom_conflict_policy() {
        /// Backups with indexes in the same decade share a rack.
        struct SameRack;
        impl ConflictPolicy for SameRack {
            fn conflict(&self, a: ServerId, b: ServerId) -> bool {
                a.index() / 10 == b.index() / 10
            }
        }

        let mut tracker = BackupTracker::new();
        for index in [11, 12, 21] {
            tracker.enqueue_change(
                ServerDetails::new(ServerId::new(index, 0), "", &[ServiceType::Backup]),
                ServerChangeEvent::Added,
            );
        }
        let mut selector = BackupSelector::with_policy(tracker, SEGMENT_SIZE, Box::new(SameRack));
        for _ in 0..20 {
            assert_eq!(selector.select_secondary(&[ServerId::new(11, 0)]).unwrap(), ServerId::new(21, 0));
        }
        assert!(selector.conflict(ServerId::new(11, 0), ServerId::new(12, 0)));
    }
}
