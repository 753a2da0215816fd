//! Failure detection

pub mod failure_detector;

pub use failure_detector::FailureDetector;
