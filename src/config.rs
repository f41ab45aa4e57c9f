use crate::utils::config_io::load_cfg;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chunk size for inputs whose length is not known up front.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;
/// Timeout for every blocking queue operation; hitting it means deadlock or starvation.
pub const DEFAULT_LONG_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// Number of key buckets used by `shuffle` and `distinct`.
pub const DEFAULT_BUCKETS: usize = 64;

/// Optional knobs; every unset field falls back to a default at start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StreamConfig {
    pub workers: Option<usize>,
    pub chunk_size: Option<usize>,
    pub long_timeout_ms: Option<u64>,
    pub buckets: Option<usize>,
    pub max_pending_chunks: Option<usize>,
    #[serde(default)]
    pub pin_cores: bool,
}

impl StreamConfig {
    /// Load from a TOML / JSON / YAML file.
    pub fn load(path: impl AsRef<str>) -> anyhow::Result<Self> {
        load_cfg(path)
    }

    pub fn buckets(&self) -> usize {
        self.buckets.unwrap_or(DEFAULT_BUCKETS).max(1)
    }

    pub fn long_timeout(&self) -> Duration {
        self.long_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_LONG_TIMEOUT)
    }

    /// Fills every default. `len_hint` is the input length when statically known.
    pub fn resolve(&self, len_hint: Option<usize>) -> Settings {
        let workers = self
            .workers
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1);

        let chunk_size = match (self.chunk_size, len_hint) {
            (Some(c), _) => c.max(1),
            (None, Some(len)) => (len / workers).max(1),
            (None, None) => DEFAULT_CHUNK_SIZE,
        };

        Settings {
            workers,
            chunk_size,
            long_timeout: self.long_timeout(),
            max_pending_chunks: self.max_pending_chunks.unwrap_or(workers * 2).max(1),
            pin_cores: self.pin_cores,
        }
    }
}

/// Fully resolved session settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub workers: usize,
    pub chunk_size: usize,
    pub long_timeout: Duration,
    pub max_pending_chunks: usize,
    pub pin_cores: bool,
}
