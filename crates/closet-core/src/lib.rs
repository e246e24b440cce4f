//! Closet Core — error taxonomy, configuration and data paths shared by every crate.

pub mod config;
pub mod error;

pub use config::{ClosetConfig, DataPaths, PipelineSettings, QueueSettings, RetrySettings};
pub use error::{Error, Result};

/// Current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
