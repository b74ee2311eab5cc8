//! Queue configuration.
//!
//! `QueueConfig` is plain data so it can be built in code or loaded from a
//! JSON file. [`QueueConfig::with_defaults`] fills unset fields and clamps the
//! rest into a consistent shape; the queue constructor always applies it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::segment::LEN_PREFIX;

/// Default number of requests combined into one vectored write.
pub const DEFAULT_WRITE_BATCH: usize = 1;

/// Default maximum payload length (512 MiB).
pub const DEFAULT_MAX_MSG_SIZE: usize = 512 * 1024 * 1024;

/// Default segment capacity (1 GiB, sparse on disk until written).
pub const DEFAULT_SEGMENT_SIZE: usize = 1024 * 1024 * 1024;

/// Smallest segment capacity accepted.
pub const MIN_SEGMENT_SIZE: usize = 64;

const DEFAULT_COMMIT_INTERVAL_MS: u64 = 1_000;
const DEFAULT_RETRY_INTERVAL_MS: u64 = 1_000;

/// Configuration for a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Root directory holding `queue.meta` and the `segments/` directory.
    pub directory: PathBuf,

    /// Max requests opportunistically combined per write.
    /// Default: 1
    pub write_batch: usize,

    /// Max payload length in bytes.
    /// Default: 512 MiB, capped so one framed record fits in a segment.
    pub max_msg_size: usize,

    /// Capacity of each newly created segment in bytes.
    /// Default: 1 GiB
    pub segment_size: usize,

    /// Run the commit ticker, which periodically schedules write-back of
    /// dirty pages.
    /// Default: false
    pub enable_write_buffer: bool,

    /// Commit ticker period.
    /// Default: 1000 ms
    pub commit_interval_ms: u64,

    /// Delay between attempts when a write or metadata flush fails.
    /// Default: 1000 ms
    pub retry_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::new(),
            write_batch: DEFAULT_WRITE_BATCH,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            segment_size: DEFAULT_SEGMENT_SIZE,
            enable_write_buffer: false,
            commit_interval_ms: DEFAULT_COMMIT_INTERVAL_MS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
        }
    }
}

impl QueueConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> std::io::Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(std::io::Error::from)
    }

    /// Fill zero values with defaults and clamp limits against each other.
    pub fn with_defaults(mut self) -> Self {
        if self.write_batch == 0 {
            self.write_batch = DEFAULT_WRITE_BATCH;
        }
        if self.segment_size == 0 {
            self.segment_size = DEFAULT_SEGMENT_SIZE;
        }
        self.segment_size = self.segment_size.max(MIN_SEGMENT_SIZE);
        if self.max_msg_size == 0 {
            self.max_msg_size = DEFAULT_MAX_MSG_SIZE;
        }
        // A record larger than an empty segment could never be written.
        let framed_limit = (self.segment_size - LEN_PREFIX).min(u32::MAX as usize);
        self.max_msg_size = self.max_msg_size.min(framed_limit);
        if self.commit_interval_ms == 0 {
            self.commit_interval_ms = DEFAULT_COMMIT_INTERVAL_MS;
        }
        if self.retry_interval_ms == 0 {
            self.retry_interval_ms = DEFAULT_RETRY_INTERVAL_MS;
        }
        self
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_values_take_defaults() {
        let config = QueueConfig {
            write_batch: 0,
            max_msg_size: 0,
            segment_size: 0,
            commit_interval_ms: 0,
            retry_interval_ms: 0,
            ..QueueConfig::new("/tmp/q")
        }
        .with_defaults();
        assert_eq!(config.write_batch, DEFAULT_WRITE_BATCH);
        assert_eq!(config.segment_size, DEFAULT_SEGMENT_SIZE);
        assert_eq!(config.max_msg_size, DEFAULT_MAX_MSG_SIZE);
        assert_eq!(config.commit_interval(), Duration::from_secs(1));
        assert_eq!(config.retry_interval(), Duration::from_secs(1));
    }

    #[test]
    fn max_msg_size_capped_by_segment() {
        let config = QueueConfig {
            segment_size: 100,
            max_msg_size: 1024,
            ..QueueConfig::new("/tmp/q")
        }
        .with_defaults();
        assert_eq!(config.max_msg_size, 100 - LEN_PREFIX);
    }

    #[test]
    fn tiny_segment_raised_to_minimum() {
        let config = QueueConfig {
            segment_size: 8,
            ..QueueConfig::new("/tmp/q")
        }
        .with_defaults();
        assert_eq!(config.segment_size, MIN_SEGMENT_SIZE);
        assert_eq!(config.max_msg_size, MIN_SEGMENT_SIZE - LEN_PREFIX);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"directory":"/data/q","write_batch":16}"#).expect("parse");
        assert_eq!(config.directory, PathBuf::from("/data/q"));
        assert_eq!(config.write_batch, 16);
        assert_eq!(config.max_msg_size, DEFAULT_MAX_MSG_SIZE);
        assert!(!config.enable_write_buffer);
    }
}
