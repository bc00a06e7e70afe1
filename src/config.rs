//! Engine configuration
//!
//! All tunables for the packet pipeline in one serde-backed struct.
//! Timeouts are expressed in nanoseconds of packet time, never wall time.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How flow keys are derived from decoded packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKeyMode {
    /// Canonical direction-normalized 5-tuple
    FiveTuple,
    /// User-supplied key function (set via `Pipeline::with_key_fn`)
    Custom,
}

impl Default for FlowKeyMode {
    fn default() -> Self {
        FlowKeyMode::FiveTuple
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Total packet buffers owned by the pool
    pub pool_size: usize,
    /// Preallocated payload bytes per buffer
    pub prealloc_bytes: usize,
    /// Allow a buffer's payload to grow past `prealloc_bytes`
    pub grow_on_demand: bool,
    /// Packets per batch
    pub batch_size: usize,
    /// Batches per ring
    pub ring_depth: usize,
    /// Flow table shards (0 = one per CPU)
    pub workers: usize,
    /// Idle timeout in nanoseconds of packet time (0 disables)
    pub idle_timeout_ns: u64,
    /// Active timeout in nanoseconds of packet time (0 disables)
    pub active_timeout_ns: u64,
    /// Flow key derivation mode
    pub flow_key_mode: FlowKeyMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_size: 4096,
            prealloc_bytes: 2048,
            grow_on_demand: true,
            batch_size: 256,
            ring_depth: 8,
            workers: 0,
            idle_timeout_ns: 300_000_000_000,
            active_timeout_ns: 1_800_000_000_000,
            flow_key_mode: FlowKeyMode::FiveTuple,
        }
    }
}

impl Config {
    /// Get actual number of flow table shards
    pub fn actual_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }

    /// Validate the configuration before wiring the pipeline
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be nonzero".into()));
        }
        if self.ring_depth == 0 {
            return Err(Error::Config("ring_depth must be nonzero".into()));
        }
        if self.prealloc_bytes == 0 {
            return Err(Error::Config("prealloc_bytes must be nonzero".into()));
        }
        // The pool wakes a blocked pop only when the free count rises above
        // batch_size, so a pool no larger than one batch can never recover
        // from starvation.
        if self.pool_size <= self.batch_size {
            return Err(Error::Config(format!(
                "pool_size ({}) must exceed batch_size ({})",
                self.pool_size, self.batch_size
            )));
        }
        Ok(())
    }
}
