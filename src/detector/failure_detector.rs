//! Randomized ping-based failure detection
//!
//! Every server runs one detector task. Each probe interval it pings one
//! random server that offers the ping service and, if the ping times out,
//! tells the coordinator that the server looks dead; the coordinator makes
//! the final call. Ping replies also carry the responder's server list
//! version, which is how a server notices that its own list has fallen
//! behind. A lagging list is only considered stale if it is still behind
//! after `stale_server_list_ms`, at which point a fresh list is requested.

use crate::common::{Error, FailureDetectorConfig, Result, ServerId, ServiceType};
use crate::membership::{ServerList, ServerTracker};
use crate::transport::{CoordinatorClient, PingClient};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Our server list looked older than a peer's at `since`.
#[derive(Debug, Clone, Copy)]
struct StaleSuspicion {
    /// Our version when the suspicion started.
    version: u64,
    since: Instant,
}

/// State owned by the probing task.
struct Detector<P, C> {
    our_id: ServerId,
    /// Only used to pick ping targets; carries no payload.
    tracker: ServerTracker<()>,
    server_list: Arc<ServerList>,
    ping: Arc<P>,
    coordinator: Arc<C>,
    probe_interval: Duration,
    ping_timeout: Duration,
    coordinator_timeout: Duration,
    stale_timeout: Duration,
    stale: Option<StaleSuspicion>,
}

impl<P: PingClient, C: CoordinatorClient> Detector<P, C> {
    async fn run(mut self, should_exit: Arc<AtomicBool>) -> Self {
        tracing::info!("Failure detector started");
        loop {
            if should_exit.load(Ordering::Acquire) {
                break;
            }
            self.run_cycle().await;
            tokio::time::sleep(self.probe_interval).await;
        }
        tracing::info!("Failure detector stopped");
        self
    }

    async fn run_cycle(&mut self) {
        while self.tracker.get_change().is_some() {}
        self.check_for_stale_server_list().await;
        self.ping_random_server().await;
    }

    /// Ping one random server; at most one ping is outstanding at a time.
    async fn ping_random_server(&mut self) {
        let Some(pingee) = self.tracker.get_random_server_id_with_service(ServiceType::Ping) else {
            return;
        };
        if pingee == self.our_id {
            // Try someone else next round.
            return;
        }

        // Our tracker may lag behind the server list.
        let Some(locator) = self.server_list.get_locator(pingee) else {
            tracing::debug!("Tried to ping server {}, but it is no longer in the server list", pingee);
            return;
        };

        let nonce: u64 = rand::random();
        let result = match tokio::time::timeout(
            self.ping_timeout,
            self.ping.ping(&locator, nonce, self.ping_timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("ping to {}", locator))),
        };
        let result = result.and_then(|reply| {
            if reply.nonce == nonce {
                Ok(reply)
            } else {
                Err(Error::NonceMismatch {
                    expected: nonce,
                    got: reply.nonce,
                })
            }
        });

        match result {
            Ok(reply) => {
                tracing::trace!("Ping succeeded to server {} at {}", pingee, locator);
                self.check_server_list_version(reply.server_list_version);
            }
            Err(e) if e.is_peer_failure() => {
                tracing::debug!("Ping to {} failed: {}", locator, e);
                self.alert_coordinator(pingee, &locator).await;
            }
            Err(e) => tracing::warn!("Ping to {} could not be sent: {}", locator, e),
        }
    }

    /// Tell the coordinator that `server_id` did not answer in time.
    async fn alert_coordinator(&mut self, server_id: ServerId, locator: &str) {
        tracing::warn!(
            server_id = %server_id,
            locator = %locator,
            "Ping timeout to server"
        );
        let hint = tokio::time::timeout(
            self.coordinator_timeout,
            self.coordinator.hint_server_down(server_id),
        )
        .await
        .unwrap_or_else(|_| Err(Error::Timeout("hint server down".into())));
        if let Err(e) = hint {
            tracing::warn!("Hint server down failed. Maybe the network is disconnected: {}", e);
        }
    }

    /// Start suspecting our list is stale if a peer has seen a newer one.
    /// An existing suspicion is left to run its course.
    fn check_server_list_version(&mut self, observed: u64) {
        if self.stale.is_some() {
            return;
        }
        let current = self.server_list.version();
        if observed <= current {
            return;
        }
        // Either an update was lost or it just hasn't reached us yet.
        tracing::debug!(
            "Peer has server list version {}, ours is {}; watching for staleness",
            observed,
            current
        );
        self.stale = Some(StaleSuspicion {
            version: current,
            since: Instant::now(),
        });
    }

    /// Request a new server list if a suspected lag has outlived the
    /// hysteresis window.
    async fn check_for_stale_server_list(&mut self) {
        let Some(suspicion) = self.stale else {
            return;
        };

        let current = self.server_list.version();
        if current > suspicion.version {
            tracing::debug!("Server list version advanced to {}; suspicion cleared", current);
            self.stale = None;
            return;
        }

        let elapsed = suspicion.since.elapsed();
        if elapsed < self.stale_timeout {
            return;
        }

        tracing::warn!(
            "Stale server list detected (still at version {} after {:?}). Requesting new list push",
            current,
            elapsed
        );
        let request = tokio::time::timeout(
            self.coordinator_timeout,
            self.coordinator.request_server_list(self.our_id),
        )
        .await
        .unwrap_or_else(|_| Err(Error::Timeout("server list request".into())));
        match request {
            // If the push doesn't help, a later ping raises suspicion again.
            Ok(()) => self.stale = None,
            Err(e) => tracing::warn!("Request to coordinator failed: {}", e),
        }
    }
}

/// Background failure detector for one server.
pub struct FailureDetector<P: PingClient, C: CoordinatorClient> {
    /// Present while the task is not running.
    detector: Option<Detector<P, C>>,
    task: Option<JoinHandle<Detector<P, C>>>,
    should_exit: Arc<AtomicBool>,
}

impl<P: PingClient, C: CoordinatorClient> FailureDetector<P, C> {
    /// `our_id` is only used to avoid pinging ourselves. The detector's
    /// tracker is registered with `server_list` so it learns about new
    /// servers to ping.
    pub fn new(
        our_id: ServerId,
        server_list: Arc<ServerList>,
        ping: Arc<P>,
        coordinator: Arc<C>,
        config: &FailureDetectorConfig,
    ) -> Self {
        let mut tracker = ServerTracker::new();
        server_list.register_tracker(&mut tracker);
        Self {
            detector: Some(Detector {
                our_id,
                tracker,
                server_list,
                ping,
                coordinator,
                probe_interval: config.probe_interval(),
                ping_timeout: config.ping_timeout(),
                coordinator_timeout: config.coordinator_timeout(),
                stale_timeout: config.stale_server_list_timeout(),
                stale: None,
            }),
            task: None,
            should_exit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the probing task. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let detector = self
            .detector
            .take()
            .ok_or_else(|| Error::Internal("failure detector state lost".into()))?;
        self.should_exit.store(false, Ordering::Release);
        self.task = Some(tokio::spawn(detector.run(self.should_exit.clone())));
        Ok(())
    }

    /// Stop the probing task and wait for it to exit. The current cycle is
    /// allowed to finish. No-op if the detector is not running.
    pub async fn halt(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        self.should_exit.store(true, Ordering::Release);
        match task.await {
            Ok(detector) => self.detector = Some(detector),
            Err(e) => tracing::error!("Failure detector task failed: {}", e),
        }
        self.should_exit.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }
}

impl<P: PingClient, C: CoordinatorClient> Drop for FailureDetector<P, C> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.should_exit.store(true, Ordering::Release);
            task.abort();
        }
    }
}
