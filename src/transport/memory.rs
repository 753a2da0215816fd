//! In-process cluster transport
//!
//! Every simulated server is keyed by its locator. Servers can be taken
//! down (they stop answering and their RPCs time out), slowed down, or made
//! to report a given server list version. Coordinator requests are recorded
//! so tests can assert on them.

use crate::common::{Error, Result, ServerId};
use crate::transport::{BackupClient, CoordinatorClient, PingClient, PingReply, WriteSegment};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Time a call to a down server takes to fail.
const DOWN_SERVER_TIMEOUT: Duration = Duration::from_millis(50);

/// A replica as stored on a simulated backup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredReplica {
    pub data: Vec<u8>,
    pub closed: bool,
}

#[derive(Default)]
struct Node {
    down: bool,
    latency: Duration,
    server_list_version: u64,
    scramble_nonce: bool,
    pings: u64,
    replicas: HashMap<(ServerId, u64), StoredReplica>,
}

struct State {
    nodes: HashMap<String, Node>,
    coordinator_up: bool,
    hints: Vec<ServerId>,
    server_list_requests: Vec<ServerId>,
    writes: u64,
}

enum Outcome<T> {
    Reply(Duration, T),
    Unreachable,
}

/// Shared handle to the simulated cluster; clones see the same state.
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<State>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                nodes: HashMap::new(),
                coordinator_up: true,
                hints: Vec::new(),
                server_list_requests: Vec::new(),
                writes: 0,
            })),
        }
    }

    pub fn add_server(&self, locator: &str) {
        self.state
            .lock()
            .unwrap()
            .nodes
            .entry(locator.to_string())
            .or_default();
    }

    /// Take a server down (`false`) or bring it back (`true`).
    pub fn set_up(&self, locator: &str, up: bool) {
        self.with_node(locator, |node| node.down = !up);
    }

    pub fn set_latency(&self, locator: &str, latency: Duration) {
        self.with_node(locator, |node| node.latency = latency);
    }

    /// Server list version the server reports in ping replies.
    pub fn set_server_list_version(&self, locator: &str, version: u64) {
        self.with_node(locator, |node| node.server_list_version = version);
    }

    /// Make the server answer pings with the wrong nonce.
    pub fn set_scramble_nonce(&self, locator: &str, scramble: bool) {
        self.with_node(locator, |node| node.scramble_nonce = scramble);
    }

    pub fn set_coordinator_up(&self, up: bool) {
        self.state.lock().unwrap().coordinator_up = up;
    }

    pub fn hints(&self) -> Vec<ServerId> {
        self.state.lock().unwrap().hints.clone()
    }

    pub fn server_list_requests(&self) -> Vec<ServerId> {
        self.state.lock().unwrap().server_list_requests.clone()
    }

    pub fn ping_count(&self, locator: &str) -> u64 {
        let state = self.state.lock().unwrap();
        state.nodes.get(locator).map_or(0, |n| n.pings)
    }

    /// Number of write RPCs that reached a live backup.
    pub fn write_count(&self) -> u64 {
        self.state.lock().unwrap().writes
    }

    pub fn replica(&self, locator: &str, master: ServerId, segment_id: u64) -> Option<StoredReplica> {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .get(locator)
            .and_then(|n| n.replicas.get(&(master, segment_id)))
            .cloned()
    }

    /// Number of replicas of `segment_id` stored across the cluster.
    pub fn replica_count(&self, master: ServerId, segment_id: u64) -> usize {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .values()
            .filter(|n| n.replicas.contains_key(&(master, segment_id)))
            .count()
    }

    fn with_node(&self, locator: &str, f: impl FnOnce(&mut Node)) {
        let mut state = self.state.lock().unwrap();
        f(state.nodes.entry(locator.to_string()).or_default());
    }

    /// Run `f` against a live server, returning its latency with the result.
    fn call<T>(&self, locator: &str, f: impl FnOnce(&mut Node) -> Result<T>) -> Outcome<Result<T>> {
        let mut state = self.state.lock().unwrap();
        match state.nodes.get_mut(locator) {
            Some(node) if !node.down => {
                let latency = node.latency;
                Outcome::Reply(latency, f(node))
            }
            _ => Outcome::Unreachable,
        }
    }

    async fn finish<T>(outcome: Outcome<Result<T>>, timeout: Duration, what: &str) -> Result<T> {
        match outcome {
            Outcome::Reply(latency, result) if latency < timeout => {
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                result
            }
            _ => {
                tokio::time::sleep(timeout).await;
                Err(Error::Timeout(what.to_string()))
            }
        }
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl PingClient for MemoryCluster {
    async fn ping(&self, locator: &str, nonce: u64, timeout: Duration) -> Result<PingReply> {
        let outcome = self.call(locator, |node| {
            node.pings += 1;
            Ok(PingReply {
                nonce: if node.scramble_nonce { !nonce } else { nonce },
                server_list_version: node.server_list_version,
            })
        });
        Self::finish(outcome, timeout, &format!("ping to {}", locator)).await
    }
}

impl CoordinatorClient for MemoryCluster {
    async fn hint_server_down(&self, server_id: ServerId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.coordinator_up {
            return Err(Error::Transport("coordinator unreachable".into()));
        }
        state.hints.push(server_id);
        Ok(())
    }

    async fn request_server_list(&self, server_id: ServerId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.coordinator_up {
            return Err(Error::Transport("coordinator unreachable".into()));
        }
        state.server_list_requests.push(server_id);
        Ok(())
    }
}

impl BackupClient for MemoryCluster {
    async fn write_segment(&self, request: WriteSegment) -> Result<()> {
        let what = format!("write of segment {} to {}", request.segment_id, request.locator);
        let outcome = self.call(&request.locator, |node| {
            let key = (request.master, request.segment_id);
            if request.open {
                node.replicas.insert(key, StoredReplica::default());
            }
            let replica = node
                .replicas
                .get_mut(&key)
                .ok_or_else(|| Error::Internal(format!("segment {} not open", request.segment_id)))?;
            if replica.data.len() as u64 != request.offset {
                return Err(Error::Internal(format!(
                    "write at offset {} but replica has {} bytes",
                    request.offset,
                    replica.data.len()
                )));
            }
            replica.data.extend_from_slice(&request.data);
            replica.closed |= request.close;
            Ok(())
        });
        if matches!(outcome, Outcome::Reply(..)) {
            self.state.lock().unwrap().writes += 1;
        }
        Self::finish(outcome, DOWN_SERVER_TIMEOUT, &what).await
    }

    async fn free_segment(
        &self,
        _backup: ServerId,
        locator: &str,
        master: ServerId,
        segment_id: u64,
    ) -> Result<()> {
        let outcome = self.call(locator, |node| {
            node.replicas.remove(&(master, segment_id));
            Ok(())
        });
        Self::finish(outcome, DOWN_SERVER_TIMEOUT, &format!("free on {}", locator)).await
    }
}
