//! Per-consumer view of cluster membership
//!
//! A `ServerTracker` gives one component (the backup selector, the failure
//! detector, ...) its own copy of cluster membership that it updates at its
//! own pace. Changes are queued as they arrive and only become visible in
//! the tracker's dense slot array when the owner drains them with
//! [`ServerTracker::get_change`], so the owner always observes membership
//! one change at a time and in order.
//!
//! Each slot can carry an owner-defined payload (`T`), e.g. the selector's
//! per-backup statistics. The tracker never disposes of payloads itself: when
//! a server is removed the owner gets one drain cycle to take the payload
//! out, and the next drain asserts that it did.
//!
//! Trackers are not shared between threads. Changes pushed from other
//! threads (by a [`ServerList`](super::ServerList)) travel over a channel and
//! are moved into the queue the next time the owner touches it.

use crate::common::{Error, Result, ServerId, ServiceType};
use crate::membership::details::{ServerChange, ServerChangeEvent, ServerDetails};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Notified whenever a change is enqueued on a tracker; typically used to
/// wake the thread that owns it.
pub trait TrackerCallback: Send + Sync {
    fn tracker_changes_enqueued(&self);
}

/// Handle used to push changes into a tracker from another thread.
#[derive(Clone)]
pub struct ChangeSender {
    tx: mpsc::UnboundedSender<ServerChange>,
    callback: Option<Arc<dyn TrackerCallback>>,
}

impl ChangeSender {
    /// Queue a change. Returns `false` once the tracker has been dropped.
    pub fn send(&self, change: ServerChange) -> bool {
        if self.tx.send(change).is_err() {
            return false;
        }
        if let Some(callback) = &self.callback {
            callback.tracker_changes_enqueued();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct Slot<T> {
    details: ServerDetails,
    pointer: Option<Box<T>>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            details: ServerDetails::empty(),
            pointer: None,
        }
    }
}

pub struct ServerTracker<T> {
    /// Indexed by `ServerId::index()`; grown on enqueue, never shrunk.
    slots: Vec<Slot<T>>,
    changes: VecDeque<ServerChange>,
    inbox: mpsc::UnboundedReceiver<ServerChange>,
    inbox_tx: mpsc::UnboundedSender<ServerChange>,
    callback: Option<Arc<dyn TrackerCallback>>,
    /// Server removed by the previous `get_change`; its payload must be
    /// gone before the next one.
    last_removed: Option<ServerId>,
    testing_avoid_usage_assertion: bool,
}

impl<T> ServerTracker<T> {
    pub fn new() -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        Self {
            slots: Vec::new(),
            changes: VecDeque::new(),
            inbox,
            inbox_tx,
            callback: None,
            last_removed: None,
            testing_avoid_usage_assertion: false,
        }
    }

    pub fn with_callback(callback: Arc<dyn TrackerCallback>) -> Self {
        let mut tracker = Self::new();
        tracker.callback = Some(callback);
        tracker
    }

    /// Downgrade the release-before-reuse assertion in `get_change` to a
    /// warning, so tests can exercise that path.
    pub fn set_testing_avoid_usage_assertion(&mut self, avoid: bool) {
        self.testing_avoid_usage_assertion = avoid;
    }

    /// A handle other threads can use to feed this tracker.
    pub fn sender(&self) -> ChangeSender {
        ChangeSender {
            tx: self.inbox_tx.clone(),
            callback: self.callback.clone(),
        }
    }

    /// Queue a change. Nothing becomes visible until it is drained.
    pub fn enqueue_change(&mut self, details: ServerDetails, event: ServerChangeEvent) {
        self.pull_inbox();
        self.queue(ServerChange::new(details, event));
        if let Some(callback) = &self.callback {
            callback.tracker_changes_enqueued();
        }
    }

    pub fn are_changes_pending(&mut self) -> bool {
        self.pull_inbox();
        !self.changes.is_empty()
    }

    /// Apply the oldest queued change to the slot array and return it.
    ///
    /// # Panics
    ///
    /// If the previous call returned a removal and the owner left a payload
    /// in that server's slot (unless testing mode is on, in which case the
    /// payload is dropped with a warning).
    pub fn get_change(&mut self) -> Option<ServerChange> {
        self.pull_inbox();

        if let Some(removed) = self.last_removed.take() {
            let slot = &mut self.slots[removed.index() as usize];
            if slot.pointer.is_some() {
                let msg = format!(
                    "User of this ServerTracker did not clear previous payload for index {} (ServerId {})!",
                    removed.index(),
                    removed
                );
                if !self.testing_avoid_usage_assertion {
                    panic!("{}", msg);
                }
                tracing::warn!("{}", msg);
                slot.pointer = None;
            }
        }

        let change = self.changes.pop_front()?;
        let id = change.details.server_id;
        let slot = &mut self.slots[id.index() as usize];

        match change.event {
            ServerChangeEvent::Added => {
                if !slot.details.is_empty() {
                    // The removal of the previous occupant never arrived.
                    tracing::warn!(
                        "Server {} added over occupied slot (held {}); dropping stale payload",
                        id,
                        slot.details.server_id
                    );
                    slot.pointer = None;
                }
                slot.details = change.details.clone();
            }
            ServerChangeEvent::Removed => {
                if slot.details.server_id == id {
                    slot.details = ServerDetails::empty();
                    self.last_removed = Some(id);
                } else {
                    tracing::debug!("Ignoring removal of untracked server {}", id);
                }
            }
        }

        Some(change)
    }

    /// Number of servers currently visible (drained and not removed).
    pub fn size(&self) -> usize {
        self.slots.iter().filter(|s| !s.details.is_empty()).count()
    }

    /// Length of the slot array.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get_locator(&self, id: ServerId) -> Result<&str> {
        self.get_server_details(id).map(|d| d.service_locator.as_str())
    }

    pub fn get_server_details(&self, id: ServerId) -> Result<&ServerDetails> {
        self.tracked_slot(id)
            .map(|slot| &slot.details)
            .ok_or(Error::NotTracked(id))
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.tracked_slot(id).is_some()
    }

    /// Payload for `id`.
    ///
    /// Besides currently tracked servers, the server returned by the most
    /// recent removal stays addressable until the next `get_change`, which
    /// is the owner's window to release its payload.
    pub fn get(&self, id: ServerId) -> Result<Option<&T>> {
        let index = self.payload_index(id).ok_or(Error::NotTracked(id))?;
        Ok(self.slots[index].pointer.as_deref())
    }

    /// Mutable access to the payload slot for `id`; see [`get`](Self::get).
    pub fn get_mut(&mut self, id: ServerId) -> Result<&mut Option<Box<T>>> {
        let index = self.payload_index(id).ok_or(Error::NotTracked(id))?;
        Ok(&mut self.slots[index].pointer)
    }

    /// A uniformly random tracked server offering `service`, or `None`.
    pub fn get_random_server_id_with_service(&self, service: ServiceType) -> Option<ServerId> {
        let eligible = |slot: &&Slot<T>| !slot.details.is_empty() && slot.details.services.has(service);

        let count = self.slots.iter().filter(eligible).count();
        if count == 0 {
            return None;
        }

        let rank = rand::thread_rng().gen_range(0..count);
        self.slots
            .iter()
            .filter(eligible)
            .nth(rank)
            .map(|slot| slot.details.server_id)
    }

    /// Tracked servers with their payloads, in index order.
    pub fn iter(&self) -> impl Iterator<Item = (&ServerDetails, Option<&T>)> + '_ {
        self.slots
            .iter()
            .filter(|s| !s.details.is_empty())
            .map(|s| (&s.details, s.pointer.as_deref()))
    }

    fn tracked_slot(&self, id: ServerId) -> Option<&Slot<T>> {
        if !id.is_valid() {
            return None;
        }
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.details.server_id == id)
    }

    fn payload_index(&self, id: ServerId) -> Option<usize> {
        if self.tracked_slot(id).is_some() || (id.is_valid() && self.last_removed == Some(id)) {
            Some(id.index() as usize)
        } else {
            None
        }
    }

    fn pull_inbox(&mut self) {
        while let Ok(change) = self.inbox.try_recv() {
            self.queue(change);
        }
    }

    fn queue(&mut self, change: ServerChange) {
        let index = change.details.server_id.index() as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, Slot::empty);
        }
        self.changes.push_back(change);
    }
}

impl<T> Default for ServerTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}
