use crate::core::{IndexError, Result};
use crate::reduce::OverflowPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retry behavior for projections that fail unexpectedly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per change, including the first.
    pub max_attempts: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before retry number `attempt` (1-based).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }
}

/// When view indexes are written to disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointPolicy {
    /// Checkpoint directory; no checkpoints when unset.
    pub dir: Option<PathBuf>,
    /// Checkpoint a view after this many applied changes.
    pub every_changes: Option<usize>,
}

/// Background maintainer cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPolicy {
    /// Catch-up interval in milliseconds when no change notification arrives.
    pub poll_interval_ms: u64,
}

impl Default for WorkerPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Document field carrying the doctype discriminator.
    pub doctype_field: String,

    /// Wait budget of `require-fresh` queries that do not set one.
    pub fresh_timeout_ms: u64,

    /// Change-feed page size during catch-up.
    pub catch_up_batch_size: usize,

    pub retry: RetryPolicy,

    pub sum_overflow: OverflowPolicy,

    pub checkpoint: CheckpointPolicy,

    pub worker: WorkerPolicy,

    /// Failed changes kept per view for operators.
    pub failed_change_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            doctype_field: "doctype".to_string(),
            fresh_timeout_ms: 5_000,
            catch_up_batch_size: 256,
            retry: RetryPolicy::default(),
            sum_overflow: OverflowPolicy::default(),
            checkpoint: CheckpointPolicy::default(),
            worker: WorkerPolicy::default(),
            failed_change_capacity: 64,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON configuration file; missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            IndexError::Io(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            IndexError::Serialization(format!("Invalid config {}: {}", path.display(), e))
        })
    }

    /// Set the doctype field
    pub fn doctype_field(mut self, field: &str) -> Self {
        self.doctype_field = field.to_string();
        self
    }

    /// Replace the doctype field only when `field` is given.
    pub fn doctype_field_override(self, field: Option<&str>) -> Self {
        match field {
            Some(field) => self.doctype_field(field),
            None => self,
        }
    }

    /// Set the default require-fresh timeout
    pub fn fresh_timeout(mut self, timeout: Duration) -> Self {
        self.fresh_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the change-feed page size
    pub fn catch_up_batch_size(mut self, size: usize) -> Self {
        self.catch_up_batch_size = size.max(1);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn sum_overflow(mut self, policy: OverflowPolicy) -> Self {
        self.sum_overflow = policy;
        self
    }

    /// Enable checkpoints under `dir`
    pub fn checkpoint_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.checkpoint.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Checkpoint every `n` applied changes
    pub fn checkpoint_every(mut self, n: usize) -> Self {
        self.checkpoint.every_changes = Some(n.max(1));
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.worker.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn failed_change_capacity(mut self, capacity: usize) -> Self {
        self.failed_change_capacity = capacity;
        self
    }

    pub fn fresh_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.fresh_timeout_ms)
    }

    pub fn poll_interval_duration(&self) -> Duration {
        Duration::from_millis(self.worker.poll_interval_ms.max(10))
    }
}
