//! Services a server runs and advertises to the cluster

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Holds in-memory data and replicates it to backups.
    Master,
    /// Stores replicas of master segments.
    Backup,
    /// Answers liveness pings.
    Ping,
    /// Accepts cluster membership pushes from the coordinator.
    Membership,
}

impl ServiceType {
    pub const ALL: [ServiceType; 4] = [
        ServiceType::Master,
        ServiceType::Backup,
        ServiceType::Ping,
        ServiceType::Membership,
    ];

    fn bit(self) -> u32 {
        1 << self as u32
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::Master => write!(f, "master"),
            ServiceType::Backup => write!(f, "backup"),
            ServiceType::Ping => write!(f, "ping"),
            ServiceType::Membership => write!(f, "membership"),
        }
    }
}

/// Set of [`ServiceType`]s, serialized as a bit mask on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<ServiceType>", into = "Vec<ServiceType>")]
pub struct ServiceMask {
    mask: u32,
}

impl ServiceMask {
    pub fn new(services: &[ServiceType]) -> Self {
        services.iter().copied().collect()
    }

    pub fn has(&self, service: ServiceType) -> bool {
        self.mask & service.bit() != 0
    }

    pub fn insert(&mut self, service: ServiceType) {
        self.mask |= service.bit();
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = ServiceType> + '_ {
        ServiceType::ALL.into_iter().filter(|s| self.has(*s))
    }

    pub fn serialize(&self) -> u32 {
        self.mask
    }

    /// Bits that do not name a known service are dropped.
    pub fn deserialize(mask: u32) -> Self {
        ServiceType::ALL
            .into_iter()
            .filter(|s| mask & s.bit() != 0)
            .collect()
    }
}

impl FromIterator<ServiceType> for ServiceMask {
    fn from_iter<I: IntoIterator<Item = ServiceType>>(iter: I) -> Self {
        let mut mask = ServiceMask::default();
        for service in iter {
            mask.insert(service);
        }
        mask
    }
}

impl From<Vec<ServiceType>> for ServiceMask {
    fn from(services: Vec<ServiceType>) -> Self {
        services.into_iter().collect()
    }
}

impl From<ServiceMask> for Vec<ServiceType> {
    fn from(mask: ServiceMask) -> Self {
        mask.iter().collect()
    }
}

impl std::fmt::Display for ServiceMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", names.join(", "))
    }
}
