//! Process-wide cluster membership list
//!
//! The coordinator pushes membership to every server, either as incremental
//! updates or as a complete list. `ServerList` applies those pushes, keeps
//! the membership version used to detect missed updates, and forwards every
//! resulting change to the trackers registered with it.

use crate::common::ServerId;
use crate::membership::details::{ServerChange, ServerChangeEvent, ServerDetails};
use crate::membership::tracker::{ChangeSender, ServerTracker};
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    version: u64,
    /// Indexed by `ServerId::index()`.
    servers: Vec<Option<ServerDetails>>,
    trackers: Vec<ChangeSender>,
}

impl Inner {
    fn notify(&mut self, details: ServerDetails, event: ServerChangeEvent) {
        self.trackers
            .retain(|tracker| tracker.send(ServerChange::new(details.clone(), event)));
    }

    fn add(&mut self, details: ServerDetails) {
        let id = details.server_id;
        if !id.is_valid() {
            tracing::warn!("Ignoring attempt to add an invalid server id");
            return;
        }
        let index = id.index() as usize;
        if index >= self.servers.len() {
            self.servers.resize(index + 1, None);
        }

        match self.servers[index].as_ref().map(|d| d.server_id) {
            Some(existing) if existing == id => {
                tracing::debug!("Server {} already in the server list", id);
                return;
            }
            Some(existing) => {
                // A newer generation took over the slot; the old process is gone.
                tracing::info!("Server {} replaced by {}", existing, id);
                self.remove(existing);
            }
            None => {}
        }

        tracing::debug!(
            server_id = %id,
            locator = %details.service_locator,
            services = %details.services,
            "Server added"
        );
        self.servers[index] = Some(details.clone());
        self.notify(details, ServerChangeEvent::Added);
    }

    fn remove(&mut self, id: ServerId) {
        let slot = self.servers.get_mut(id.index() as usize);
        match slot {
            Some(slot) if slot.as_ref().map(|d| d.server_id) == Some(id) => {
                if let Some(details) = slot.take() {
                    tracing::debug!(server_id = %id, "Server removed");
                    self.notify(details, ServerChangeEvent::Removed);
                }
            }
            _ => tracing::debug!("Server {} not in the server list", id),
        }
    }
}

/// Thread-safe membership list shared by every component of a server.
#[derive(Default)]
pub struct ServerList {
    inner: Mutex<Inner>,
}

impl ServerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version of the last update applied.
    pub fn version(&self) -> u64 {
        self.inner.lock().unwrap().version
    }

    pub fn size(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.servers.iter().filter(|s| s.is_some()).count()
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.get_details(id).is_some()
    }

    pub fn get_details(&self, id: ServerId) -> Option<ServerDetails> {
        let inner = self.inner.lock().unwrap();
        inner
            .servers
            .get(id.index() as usize)
            .and_then(|s| s.as_ref())
            .filter(|d| d.server_id == id)
            .cloned()
    }

    pub fn get_locator(&self, id: ServerId) -> Option<String> {
        self.get_details(id).map(|d| d.service_locator)
    }

    /// Add one server outside of a versioned update.
    pub fn add(&self, details: ServerDetails) {
        self.inner.lock().unwrap().add(details);
    }

    /// Remove one server outside of a versioned update.
    pub fn remove(&self, id: ServerId) {
        self.inner.lock().unwrap().remove(id);
    }

    /// Apply an incremental update. Only the update immediately following
    /// the current version is accepted; returns whether it was applied.
    pub fn apply_update(&self, version: u64, changes: Vec<ServerChange>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if version <= inner.version {
            tracing::debug!(
                "Ignoring update {} (already at version {})",
                version,
                inner.version
            );
            return false;
        }
        if version != inner.version + 1 {
            tracing::warn!(
                "Missed server list update(s): at version {}, received {}",
                inner.version,
                version
            );
            return false;
        }

        for change in changes {
            match change.event {
                ServerChangeEvent::Added => inner.add(change.details),
                ServerChangeEvent::Removed => inner.remove(change.details.server_id),
            }
        }
        inner.version = version;
        true
    }

    /// Replace the whole view with a complete list from the coordinator.
    /// Ignored unless `version` is newer than the current one.
    pub fn apply_full_list(&self, version: u64, servers: Vec<ServerDetails>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if version <= inner.version {
            tracing::debug!(
                "Ignoring full list {} (already at version {})",
                version,
                inner.version
            );
            return false;
        }

        let stale: Vec<ServerId> = inner
            .servers
            .iter()
            .flatten()
            .map(|d| d.server_id)
            .filter(|id| !servers.iter().any(|s| s.server_id == *id))
            .collect();
        for id in stale {
            inner.remove(id);
        }
        for details in servers {
            inner.add(details);
        }

        tracing::info!("Applied full server list at version {}", version);
        inner.version = version;
        true
    }

    /// Subscribe `tracker` to future changes, replaying current membership
    /// into it as additions.
    pub fn register_tracker<T>(&self, tracker: &mut ServerTracker<T>) {
        let sender = tracker.sender();
        let mut inner = self.inner.lock().unwrap();
        for details in inner.servers.iter().flatten() {
            sender.send(ServerChange::new(details.clone(), ServerChangeEvent::Added));
        }
        inner.trackers.push(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ServiceType;

    fn server(index: u32, generation: u32) -> ServerDetails {
        ServerDetails::new(
            ServerId::new(index, generation),
            format!("mock:host=s{}", index),
            &[ServiceType::Backup, ServiceType::Ping],
        )
    }

    fn drain(tracker: &mut ServerTracker<()>) -> Vec<(ServerId, ServerChangeEvent)> {
        let mut out = Vec::new();
        while let Some(change) = tracker.get_change() {
            out.push((change.details.server_id, change.event));
        }
        out
    }

    #[test]
    fn test_add_remove_notify_trackers() {
        let list = ServerList::new();
        let mut tracker = ServerTracker::new();
        list.register_tracker(&mut tracker);

        list.add(server(1, 0));
        list.add(server(2, 0));
        list.remove(ServerId::new(1, 0));
        list.remove(ServerId::new(9, 0));

        assert_eq!(list.size(), 1);
        assert_eq!(list.get_locator(ServerId::new(2, 0)).unwrap(), "mock:host=s2");
        assert!(list.get_locator(ServerId::new(1, 0)).is_none());
        assert_eq!(
            drain(&mut tracker),
            vec![
                (ServerId::new(1, 0), ServerChangeEvent::Added),
                (ServerId::new(2, 0), ServerChangeEvent::Added),
                (ServerId::new(1, 0), ServerChangeEvent::Removed),
            ]
        );
        assert_eq!(tracker.size(), 1);
    }

    #[test]
    fn test_register_replays_membership() {
        let list = ServerList::new();
        list.add(server(1, 0));
        list.add(server(3, 0));

        let mut tracker = ServerTracker::new();
        list.register_tracker(&mut tracker);
        assert_eq!(drain(&mut tracker).len(), 2);
        assert_eq!(tracker.size(), 2);
    }

    #[test]
    fn test_new_generation_replaces_old() {
        let list = ServerList::new();
        let mut tracker = ServerTracker::new();
        list.register_tracker(&mut tracker);

        list.add(server(1, 0));
        list.add(server(1, 1));
        assert_eq!(
            drain(&mut tracker),
            vec![
                (ServerId::new(1, 0), ServerChangeEvent::Added),
                (ServerId::new(1, 0), ServerChangeEvent::Removed),
                (ServerId::new(1, 1), ServerChangeEvent::Added),
            ]
        );
        assert!(list.contains(ServerId::new(1, 1)));
        assert!(!list.contains(ServerId::new(1, 0)));
    }

    #[test]
    fn test_apply_update_requires_next_version() {
        let list = ServerList::new();
        assert!(list.apply_update(
            1,
            vec![ServerChange::new(server(1, 0), ServerChangeEvent::Added)]
        ));
        assert_eq!(list.version(), 1);

        // Gap: version 2 was missed.
        assert!(!list.apply_update(
            3,
            vec![ServerChange::new(server(2, 0), ServerChangeEvent::Added)]
        ));
        assert_eq!(list.version(), 1);
        assert!(!list.contains(ServerId::new(2, 0)));

        // Duplicate.
        assert!(!list.apply_update(1, vec![]));

        assert!(list.apply_update(
            2,
            vec![ServerChange::new(
                ServerDetails::with_id(ServerId::new(1, 0)),
                ServerChangeEvent::Removed
            )]
        ));
        assert_eq!(list.size(), 0);
    }

    #[test]
    fn test_apply_full_list_diffs() {
        let list = ServerList::new();
        let mut tracker = ServerTracker::new();
        list.register_tracker(&mut tracker);

        list.apply_full_list(5, vec![server(1, 0), server(2, 0)]);
        assert_eq!(list.version(), 5);
        drain(&mut tracker);

        assert!(!list.apply_full_list(4, vec![]));
        assert!(list.apply_full_list(7, vec![server(2, 0), server(3, 0)]));
        assert_eq!(list.version(), 7);
        assert_eq!(
            drain(&mut tracker),
            vec![
                (ServerId::new(1, 0), ServerChangeEvent::Removed),
                (ServerId::new(3, 0), ServerChangeEvent::Added),
            ]
        );
        assert_eq!(tracker.size(), 2);
    }

    #[test]
    fn test_dropped_tracker_is_unregistered() {
        let list = ServerList::new();
        let tracker: ServerTracker<()> = {
            let mut t = ServerTracker::new();
            list.register_tracker(&mut t);
            t
        };
        drop(tracker);
        list.add(server(1, 0));
        assert!(list.inner.lock().unwrap().trackers.is_empty());
    }
}
