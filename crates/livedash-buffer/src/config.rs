//! Buffer store and memory governor configuration.

use crate::error::{BufferError, BufferResult};
use serde::{Deserialize, Serialize};

/// Limits for widget buffers and the global memory governor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Upper bound for a single buffer's capacity. Default: 10,000.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    /// Total message count that triggers a one-time warning. Default: 100,000.
    #[serde(default = "default_soft_threshold")]
    pub soft_threshold: usize,
    /// Total message count that puts the store under pressure. Default: 200,000.
    #[serde(default = "default_hard_cap")]
    pub hard_cap: usize,
    /// Buffers at or below this size are never pruned. Default: 100.
    #[serde(default = "default_prune_floor")]
    pub prune_floor: usize,
    /// Share of a buffer dropped per pruning pass. Default: 0.2.
    #[serde(default = "default_prune_fraction")]
    pub prune_fraction: f64,
    /// Batches at least this large may trigger a pruning pass. Default: 100.
    #[serde(default = "default_prune_batch_threshold")]
    pub prune_batch_threshold: usize,
}

fn default_max_buffer_size() -> usize {
    10_000
}

fn default_soft_threshold() -> usize {
    100_000
}

fn default_hard_cap() -> usize {
    200_000
}

fn default_prune_floor() -> usize {
    100
}

fn default_prune_fraction() -> f64 {
    0.2
}

fn default_prune_batch_threshold() -> usize {
    100
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: default_max_buffer_size(),
            soft_threshold: default_soft_threshold(),
            hard_cap: default_hard_cap(),
            prune_floor: default_prune_floor(),
            prune_fraction: default_prune_fraction(),
            prune_batch_threshold: default_prune_batch_threshold(),
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> BufferResult<()> {
        if self.max_buffer_size == 0 {
            return Err(BufferError::InvalidConfig(
                "max_buffer_size must be positive".to_string(),
            ));
        }
        if self.hard_cap == 0 || self.soft_threshold > self.hard_cap {
            return Err(BufferError::InvalidConfig(format!(
                "soft_threshold ({}) must not exceed a positive hard_cap ({})",
                self.soft_threshold, self.hard_cap
            )));
        }
        if !(self.prune_fraction > 0.0 && self.prune_fraction <= 1.0) {
            return Err(BufferError::InvalidConfig(format!(
                "prune_fraction must be in (0, 1], got {}",
                self.prune_fraction
            )));
        }
        Ok(())
    }

    /// Clamp a requested capacity into `[1, max_buffer_size]`.
    pub fn clamp_capacity(&self, requested: usize) -> usize {
        requested.clamp(1, self.max_buffer_size.max(1))
    }

    /// Total below which pressure clears (80% of the hard cap).
    pub fn pressure_release(&self) -> usize {
        self.hard_cap / 5 * 4
    }
}
