//! Common types shared across backline

pub mod config;
pub mod error;
pub mod server_id;
pub mod service_mask;

pub use config::{BackupConfig, FailureDetectorConfig, MasterConfig, ServerConfig};
pub use error::{Error, Result};
pub use server_id::ServerId;
pub use service_mask::{ServiceMask, ServiceType};
