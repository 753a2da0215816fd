//! Server list fan-out to trackers owned by different threads

use backline::membership::{ServerTracker, TrackerCallback};
use backline::{ServerChange, ServerChangeEvent, ServerDetails, ServerId, ServerList, ServiceType};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn details(index: u32, generation: u32) -> ServerDetails {
    ServerDetails::new(
        ServerId::new(index, generation),
        format!("mock:host=s{}", index),
        &[ServiceType::Backup, ServiceType::Ping],
    )
}

#[derive(Default)]
struct Counter(AtomicUsize);

impl TrackerCallback for Counter {
    fn tracker_changes_enqueued(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_updates_from_another_thread_arrive_in_order() {
    let list = Arc::new(ServerList::new());
    let counter = Arc::new(Counter::default());
    let mut tracker: ServerTracker<u32> = ServerTracker::with_callback(counter.clone());
    list.register_tracker(&mut tracker);

    let feeder = {
        let list = list.clone();
        thread::spawn(move || {
            for version in 1..=50u32 {
                let change = ServerChange::new(details(version, 0), ServerChangeEvent::Added);
                assert!(list.apply_update(u64::from(version), vec![change]));
            }
            for version in 51..=75u32 {
                let gone = ServerDetails::with_id(ServerId::new(version - 50, 0));
                let change = ServerChange::new(gone, ServerChangeEvent::Removed);
                assert!(list.apply_update(u64::from(version), vec![change]));
            }
        })
    };
    feeder.join().unwrap();
    assert_eq!(counter.0.load(Ordering::SeqCst), 75);

    let mut added = Vec::new();
    let mut removed = Vec::new();
    while let Some(change) = tracker.get_change() {
        let id = change.details.server_id;
        match change.event {
            ServerChangeEvent::Added => {
                *tracker.get_mut(id).unwrap() = Some(Box::new(id.index()));
                added.push(id.index());
            }
            ServerChangeEvent::Removed => {
                assert_eq!(tracker.get(id).unwrap(), Some(&id.index()));
                *tracker.get_mut(id).unwrap() = None;
                removed.push(id.index());
            }
        }
    }

    assert_eq!(added, (1..=50).collect::<Vec<_>>());
    assert_eq!(removed, (1..=25).collect::<Vec<_>>());
    assert_eq!(tracker.size(), 25);
    assert_eq!(list.size(), 25);
    assert_eq!(list.version(), 75);
}

#[test]
fn test_trackers_drain_independently() {
    let list = ServerList::new();
    list.add(details(1, 0));

    let mut early: ServerTracker<()> = ServerTracker::new();
    list.register_tracker(&mut early);
    list.add(details(2, 0));
    let mut late: ServerTracker<()> = ServerTracker::new();
    list.register_tracker(&mut late);

    // The late tracker gets current membership replayed as additions.
    assert!(late.get_change().is_some());
    assert!(late.get_change().is_some());
    assert!(late.get_change().is_none());
    assert_eq!(late.size(), 2);

    // The early one has not drained yet and still sees nothing.
    assert_eq!(early.size(), 0);
    assert!(early.are_changes_pending());
    assert!(early.get_change().is_some());
    assert_eq!(early.size(), 1);
}

#[test]
fn test_replacement_generation() {
    let list = ServerList::new();
    let mut tracker: ServerTracker<()> = ServerTracker::new();
    list.register_tracker(&mut tracker);

    assert!(list.apply_update(1, vec![ServerChange::new(details(4, 0), ServerChangeEvent::Added)]));
    assert!(list.apply_update(2, vec![ServerChange::new(details(4, 1), ServerChangeEvent::Added)]));

    let events: Vec<(ServerId, ServerChangeEvent)> = std::iter::from_fn(|| tracker.get_change())
        .map(|c| (c.details.server_id, c.event))
        .collect();
    assert_eq!(
        events,
        vec![
            (ServerId::new(4, 0), ServerChangeEvent::Added),
            (ServerId::new(4, 0), ServerChangeEvent::Removed),
            (ServerId::new(4, 1), ServerChangeEvent::Added),
        ]
    );
    assert!(tracker.contains(ServerId::new(4, 1)));
    assert!(!tracker.contains(ServerId::new(4, 0)));
    assert!(tracker.get_locator(ServerId::new(4, 0)).is_err());
}

#[test]
fn test_out_of_order_updates_are_rejected() {
    let list = ServerList::new();
    assert!(!list.apply_update(2, vec![ServerChange::new(details(1, 0), ServerChangeEvent::Added)]));
    assert_eq!(list.version(), 0);
    assert!(list.apply_update(1, vec![ServerChange::new(details(1, 0), ServerChangeEvent::Added)]));
    assert!(!list.apply_update(1, vec![]));
    assert_eq!(list.size(), 1);

    // A full list can jump ahead and drops servers missing from it.
    assert!(list.apply_full_list(7, vec![details(2, 0)]));
    assert_eq!(list.version(), 7);
    assert!(!list.contains(ServerId::new(1, 0)));
    assert!(list.contains(ServerId::new(2, 0)));
}
