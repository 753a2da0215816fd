//! # backline
//!
//! Cluster membership, replica placement and failure detection for a
//! log-structured storage server:
//! - Generation-tagged server ids and per-component membership trackers
//! - Backup selection balanced by predicted recovery read time
//! - Replication of a master's segments with automatic re-replication
//! - Randomized ping-based failure detection with stale list recovery
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!              coordinator
//!                  │ membership updates
//!          ┌───────▼────────┐
//!          │   ServerList   │
//!          └──┬──────────┬──┘
//!   ServerTracker    ServerTracker<BackupStats>
//!             │          │
//! ┌───────────▼─┐   ┌────▼────────────────────┐
//! │ Failure     │   │ ReplicaManager          │
//! │ Detector    │   │  + BackupSelector       │
//! │ (ping loop) │   │  + ReplicatedSegment(s) │
//! └─────────────┘   └─────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use backline::{FailureDetector, ReplicaManager, ServerConfig, ServerId, ServerList};
//! use backline::transport::MemoryCluster;
//! use std::sync::Arc;
//!
//! # async fn run() -> backline::Result<()> {
//! let config = ServerConfig::load("backline.toml")?;
//! let cluster = MemoryCluster::new();
//! let server_list = Arc::new(ServerList::new());
//! let me = ServerId::new(1, 0);
//!
//! let replicas = ReplicaManager::new(&server_list, me, &config.master, Arc::new(cluster.clone()));
//! let segment = replicas.open_segment(0, b"header");
//! segment.append(b"entries")?;
//! replicas.sync().await;
//!
//! let mut detector = FailureDetector::new(
//!     me,
//!     server_list.clone(),
//!     Arc::new(cluster.clone()),
//!     Arc::new(cluster),
//!     &config.failure_detector,
//! );
//! detector.start()?;
//! detector.halt().await;
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod detector;
pub mod master;
pub mod membership;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use common::{Error, Result, ServerConfig, ServerId, ServiceMask, ServiceType};
pub use detector::FailureDetector;
pub use master::{BackupSelector, ReplicaManager, SegmentHandle};
pub use membership::{ServerChange, ServerChangeEvent, ServerDetails, ServerList, ServerTracker};
pub use server::Server;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
