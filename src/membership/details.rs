//! Membership entries and change events

use crate::common::{ServerId, ServiceMask, ServiceType};
use serde::{Deserialize, Serialize};

/// What the cluster knows about one enlisted server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDetails {
    pub server_id: ServerId,
    pub service_locator: String,
    pub services: ServiceMask,
    /// Read bandwidth the server reported for its backup storage; 0 if it
    /// runs no backup or never measured it.
    #[serde(default)]
    pub expected_read_bytes_per_sec: u32,
}

impl ServerDetails {
    pub fn new(server_id: ServerId, service_locator: impl Into<String>, services: &[ServiceType]) -> Self {
        Self {
            server_id,
            service_locator: service_locator.into(),
            services: ServiceMask::new(services),
            expected_read_bytes_per_sec: 0,
        }
    }

    /// Details that carry only an id, as used for removals.
    pub fn with_id(server_id: ServerId) -> Self {
        Self {
            server_id,
            ..Self::default()
        }
    }

    /// An unoccupied tracker slot.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_read_speed(mut self, bytes_per_sec: u32) -> Self {
        self.expected_read_bytes_per_sec = bytes_per_sec;
        self
    }

    pub fn is_empty(&self) -> bool {
        !self.server_id.is_valid()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerChangeEvent {
    Added,
    Removed,
}

impl std::fmt::Display for ServerChangeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerChangeEvent::Added => write!(f, "added"),
            ServerChangeEvent::Removed => write!(f, "removed"),
        }
    }
}

/// One queued membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerChange {
    pub details: ServerDetails,
    pub event: ServerChangeEvent,
}

impl ServerChange {
    pub fn new(details: ServerDetails, event: ServerChangeEvent) -> Self {
        Self { details, event }
    }
}
