//! Configuration for backline servers
//!
//! Describes which coordinator to talk to, which services this server runs
//! and advertises, and the knobs of the replication and failure detection
//! machinery. `for_testing()` gives small, quiet defaults for unit tests.

use crate::common::{Result, ServiceMask, ServiceType};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variables with this prefix override file settings,
/// e.g. `BACKLINE_MASTER__NUM_REPLICAS=2`.
const ENV_PREFIX: &str = "BACKLINE";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Locator used to contact the cluster coordinator
    #[serde(default)]
    pub coordinator_locator: String,

    /// Locator this server listens on
    #[serde(default)]
    pub local_locator: String,

    /// Services to run and advertise
    #[serde(default = "default_services")]
    pub services: ServiceMask,

    /// Whether the failure detector should be started
    #[serde(default = "default_detect_failures")]
    pub detect_failures: bool,

    #[serde(default)]
    pub master: MasterConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub failure_detector: FailureDetectorConfig,
}

fn default_services() -> ServiceMask {
    ServiceMask::new(&[
        ServiceType::Master,
        ServiceType::Backup,
        ServiceType::Ping,
        ServiceType::Membership,
    ])
}
fn default_detect_failures() -> bool {
    true
}

/// Master (replication) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Number of replicas to keep per segment
    #[serde(default = "default_num_replicas")]
    pub num_replicas: u32,

    /// Segment size in bytes; also the unit of the backup read estimate
    #[serde(default = "default_segment_size")]
    pub segment_size: u32,

    /// Cap on write RPCs outstanding to all backups together
    #[serde(default = "default_max_write_rpcs_in_flight")]
    pub max_write_rpcs_in_flight: u32,

    /// How long a backup may take to answer a write or free
    #[serde(default = "default_backup_rpc_timeout")]
    pub backup_rpc_timeout_ms: u64,
}

fn default_num_replicas() -> u32 {
    3
}
fn default_segment_size() -> u32 {
    8 * 1024 * 1024
}
fn default_max_write_rpcs_in_flight() -> u32 {
    4
}
fn default_backup_rpc_timeout() -> u64 {
    1000
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            num_replicas: default_num_replicas(),
            segment_size: default_segment_size(),
            max_write_rpcs_in_flight: default_max_write_rpcs_in_flight(),
            backup_rpc_timeout_ms: default_backup_rpc_timeout(),
        }
    }
}

impl MasterConfig {
    pub fn backup_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.backup_rpc_timeout_ms)
    }
}

/// Backup configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupConfig {
    /// If non-zero, skip benchmarking storage and advertise this read
    /// bandwidth (MB/s) instead.
    #[serde(default)]
    pub mock_speed_mbps: u32,
}

impl BackupConfig {
    /// Advertised read bandwidth in bytes per second, saturating.
    pub fn advertised_read_bytes_per_sec(&self) -> u32 {
        self.mock_speed_mbps.saturating_mul(1024 * 1024)
    }
}

/// Failure detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetectorConfig {
    /// Pause between probes
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// How long to wait for a ping response
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,

    /// How long a suspected stale server list may stay stale before a new
    /// one is requested from the coordinator
    #[serde(default = "default_stale_server_list")]
    pub stale_server_list_ms: u64,

    /// How long to wait for the coordinator to take a failure hint or a
    /// server list request
    #[serde(default = "default_coordinator_timeout")]
    pub coordinator_timeout_ms: u64,
}

fn default_probe_interval() -> u64 {
    100
}
fn default_ping_timeout() -> u64 {
    50
}
fn default_stale_server_list() -> u64 {
    500
}
fn default_coordinator_timeout() -> u64 {
    250
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval(),
            ping_timeout_ms: default_ping_timeout(),
            stale_server_list_ms: default_stale_server_list(),
            coordinator_timeout_ms: default_coordinator_timeout(),
        }
    }
}

impl FailureDetectorConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn stale_server_list_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_server_list_ms)
    }

    pub fn coordinator_timeout(&self) -> Duration {
        Duration::from_millis(self.coordinator_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            coordinator_locator: String::new(),
            local_locator: String::new(),
            services: default_services(),
            detect_failures: default_detect_failures(),
            master: MasterConfig::default(),
            backup: BackupConfig::default(),
            failure_detector: FailureDetectorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults suited to unit tests: no failure detector, no replication,
    /// small segments and a fixed advertised backup speed.
    pub fn for_testing() -> Self {
        Self {
            services: ServiceMask::new(&[
                ServiceType::Master,
                ServiceType::Backup,
                ServiceType::Membership,
            ]),
            detect_failures: false,
            master: MasterConfig {
                num_replicas: 0,
                segment_size: 64 * 1024,
                ..MasterConfig::default()
            },
            backup: BackupConfig {
                mock_speed_mbps: 100,
            },
            ..Self::default()
        }
    }

    /// Load from a TOML file, then apply `BACKLINE_*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(crate::Error::InvalidConfig(msg.to_string()));

        if self.master.segment_size == 0 {
            return invalid("master.segment_size must be non-zero");
        }
        if self.master.max_write_rpcs_in_flight == 0 {
            return invalid("master.max_write_rpcs_in_flight must be non-zero");
        }
        if self.master.backup_rpc_timeout_ms == 0 {
            return invalid("master.backup_rpc_timeout_ms must be non-zero");
        }
        let fd = &self.failure_detector;
        if fd.probe_interval_ms == 0 {
            return invalid("failure_detector.probe_interval_ms must be non-zero");
        }
        if fd.ping_timeout_ms == 0 {
            return invalid("failure_detector.ping_timeout_ms must be non-zero");
        }
        if fd.coordinator_timeout_ms == 0 {
            return invalid("failure_detector.coordinator_timeout_ms must be non-zero");
        }
        if fd.ping_timeout_ms >= fd.probe_interval_ms {
            tracing::warn!(
                "Ping timeout ({}ms) is not shorter than the probe interval ({}ms)",
                fd.ping_timeout_ms,
                fd.probe_interval_ms
            );
        }
        Ok(())
    }
}
