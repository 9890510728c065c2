//! Dispatcher configuration types.

use std::time::Duration;

/// Configuration parameters of a [`Dispatcher`](crate::dispatch::Dispatcher).
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Expected size of a single block, used to estimate the block count of a DAG from its root. Default: 256 KiB.
    pub block_size: u64,
    /// Initial batch width of a worker when the DAG is estimated to hold more than 20 blocks. Default: 10.
    pub initial_batch_width: usize,
    /// Pause between two provider discovery rounds. Default: 1 s.
    pub discovery_interval: Duration,
    /// Maximum number of providers asked to the routing layer per discovery round. Default: 10.
    pub provider_limit: usize,
    /// Maximum number of already claimed blocks a worker may request again in a single batch, at least 1.
    /// Default: none, only bounded by the batch width.
    pub pending_fallback_limit: Option<usize>,
    /// Capacity of the discovered peers channel. Default: 64.
    pub channel_capacity: usize,
    /// Per-worker batch width controller configuration.
    pub adjust: AdjustConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            block_size: 256 * 1_024,
            initial_batch_width: 10,
            discovery_interval: Duration::from_secs(1),
            provider_limit: 10,
            pending_fallback_limit: None,
            channel_capacity: 64,
            adjust: AdjustConfig::default(),
        }
    }
}

impl DispatchConfig {
    #[inline]
    pub fn with_discovery_interval(self, discovery_interval: Duration) -> Self {
        Self {
            discovery_interval,
            ..self
        }
    }

    #[inline]
    pub fn with_pending_fallback_limit(self, limit: usize) -> Self {
        Self {
            pending_fallback_limit: Some(limit.max(1)),
            ..self
        }
    }

    #[inline]
    pub fn with_adjust(self, adjust: AdjustConfig) -> Self {
        Self { adjust, ..self }
    }

    /// Batch width a new worker starts with, from the estimated number of blocks of the DAG.
    pub fn initial_width(&self, estimated_blocks: u64) -> usize {
        match estimated_blocks {
            0..=1 => 1,
            2..=20 => (estimated_blocks / 2) as usize,
            _ => self.initial_batch_width.max(1),
        }
    }
}

/// Configuration parameters of a [`DynamicAdjuster`](crate::adjust::DynamicAdjuster).
#[derive(Debug, Clone)]
pub struct AdjustConfig {
    /// Hit ratio from which a round is considered successful. Default: 0.75.
    pub hit_ratio_threshold: f64,
    /// Idle timeout of a batch while waiting for blocks. Default: 5 s.
    pub base_tolerate: Duration,
    /// Upper bound of the idle timeout when it keeps growing on missed rounds. Default: 60 s.
    pub max_tolerate: Duration,
    /// Number of consecutive fully missed rounds before the idle timeout is doubled. Default: 3.
    pub miss_bound: u32,
    /// Efficiency drop ratio from the previous round which halves the batch width. Default: 1.5.
    pub collapse_factor: f64,
    /// Efficiency gain ratio a historical batch width must show to be jumped to. Default: 1.2.
    pub improvement_factor: f64,
    /// Number of consecutive successful rounds before a peer is considered a full provider. Default: 3.
    pub full_provider_rounds: u32,
}

impl Default for AdjustConfig {
    fn default() -> Self {
        Self {
            hit_ratio_threshold: 0.75,
            base_tolerate: Duration::from_secs(5),
            max_tolerate: Duration::from_secs(60),
            miss_bound: 3,
            collapse_factor: 1.5,
            improvement_factor: 1.2,
            full_provider_rounds: 3,
        }
    }
}

impl AdjustConfig {
    #[inline]
    pub fn with_base_tolerate(self, base_tolerate: Duration) -> Self {
        Self { base_tolerate, ..self }
    }
}
