//! Server bootstrap
//!
//! Wires a `ServerConfig` to the components it enables: a `ReplicaManager`
//! when the server runs the master service and a `FailureDetector` when
//! failure detection is turned on.

use crate::common::{Result, ServerConfig, ServerId, ServiceType};
use crate::detector::FailureDetector;
use crate::master::ReplicaManager;
use crate::membership::{ServerDetails, ServerList};
use crate::transport::{BackupClient, CoordinatorClient, PingClient};
use std::sync::Arc;

pub struct Server<P: PingClient, C: CoordinatorClient, B: BackupClient> {
    config: ServerConfig,
    server_id: ServerId,
    replicas: Option<ReplicaManager<B>>,
    detector: Option<FailureDetector<P, C>>,
}

impl<P: PingClient, C: CoordinatorClient, B: BackupClient> Server<P, C, B> {
    pub fn new(
        config: ServerConfig,
        server_id: ServerId,
        server_list: Arc<ServerList>,
        ping: Arc<P>,
        coordinator: Arc<C>,
        backups: Arc<B>,
    ) -> Result<Self> {
        config.validate()?;

        tracing::info!("Starting server {} at {}", server_id, config.local_locator);
        tracing::info!("  Coordinator: {}", config.coordinator_locator);
        tracing::info!("  Services: {}", config.services);

        let replicas = config.services.has(ServiceType::Master).then(|| {
            tracing::info!("  Replicas: {}", config.master.num_replicas);
            ReplicaManager::new(&server_list, server_id, &config.master, backups)
        });

        let detector = config.detect_failures.then(|| {
            FailureDetector::new(
                server_id,
                server_list.clone(),
                ping,
                coordinator,
                &config.failure_detector,
            )
        });

        Ok(Self {
            config,
            server_id,
            replicas,
            detector,
        })
    }

    /// What this server enlists with: its locator, services and, if it
    /// runs a backup, the read bandwidth it advertises.
    pub fn details(&self) -> ServerDetails {
        let mut details = ServerDetails::with_id(self.server_id);
        details.service_locator = self.config.local_locator.clone();
        details.services = self.config.services;
        if self.config.services.has(ServiceType::Backup) {
            details.expected_read_bytes_per_sec = self.config.backup.advertised_read_bytes_per_sec();
        }
        details
    }

    /// Start background tasks. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if let Some(detector) = self.detector.as_mut() {
            detector.start()?;
        }
        tracing::info!("Server {} ready", self.server_id);
        Ok(())
    }

    pub async fn halt(&mut self) {
        if let Some(detector) = self.detector.as_mut() {
            detector.halt().await;
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn coordinator_locator(&self) -> &str {
        &self.config.coordinator_locator
    }

    pub fn replicas(&self) -> Option<&ReplicaManager<B>> {
        self.replicas.as_ref()
    }

    pub fn detector(&self) -> Option<&FailureDetector<P, C>> {
        self.detector.as_ref()
    }
}
