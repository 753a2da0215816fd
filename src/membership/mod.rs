//! Cluster membership
//!
//! - `ServerList`: the process-wide view fed by the coordinator
//! - `ServerTracker<T>`: per-component views drained at their own pace

pub mod details;
pub mod server_list;
pub mod tracker;

pub use details::{ServerChange, ServerChangeEvent, ServerDetails};
pub use server_list::ServerList;
pub use tracker::{ChangeSender, ServerTracker, TrackerCallback};
