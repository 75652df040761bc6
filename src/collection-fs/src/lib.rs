mod fs;
mod flush;
mod manifest;
mod node;
mod repack;
mod segment;


pub use fs::*;
pub use repack::RepackOptions;
pub use segment::StoredSegment;

pub use keep_lib::{BlockSegment, KeepBackend, KeepError, KeepResult};

#[macro_use]
extern crate log;

use serde::{Deserialize, Serialize};

/// Per-filesystem tuning, consumed from the embedding system's collection
/// metadata. Never process-global: tests shrink `max_block_size` without
/// affecting other filesystems.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionFsConfig {
    /// Upper bound on stored block size. The default is the protocol
    /// maximum; only tests should lower it.
    pub max_block_size: u64,
    /// Concurrent block uploads per filesystem.
    pub concurrent_writers: usize,
    /// Initial guess at the cluster's blob signing TTL, in seconds.
    pub guessed_signature_ttl_secs: u64,
    /// Storage classes passed through to every block write.
    pub storage_classes_desired: Vec<String>,
}

impl Default for CollectionFsConfig {
    fn default() -> Self {
        Self {
            max_block_size: keep_lib::MAX_BLOCK_SIZE,
            concurrent_writers: 4,
            guessed_signature_ttl_secs: 14 * 24 * 3600,
            storage_classes_desired: Vec::new(),
        }
    }
}

impl CollectionFsConfig {
    pub fn with_max_block_size(mut self, max_block_size: u64) -> Self {
        self.max_block_size = max_block_size;
        self
    }

    pub fn with_concurrent_writers(mut self, concurrent_writers: usize) -> Self {
        self.concurrent_writers = concurrent_writers;
        self
    }

    pub fn with_storage_classes(mut self, storage_classes: Vec<String>) -> Self {
        self.storage_classes_desired = storage_classes;
        self
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_json() {
        let cfg: CollectionFsConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_block_size, 1 << 26);
        assert_eq!(cfg.concurrent_writers, 4);
        assert!(cfg.storage_classes_desired.is_empty());

        let cfg: CollectionFsConfig =
            serde_json::from_str(r#"{"max_block_size": 1024, "storage_classes_desired": ["hot"]}"#)
                .unwrap();
        assert_eq!(cfg.max_block_size, 1024);
        assert_eq!(cfg.storage_classes_desired, vec!["hot".to_string()]);
    }
}
