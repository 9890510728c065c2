//! This module provides the per-worker batch width controller.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::config::AdjustConfig;

/// Number of rounds kept in the rolling request time history.
const HISTORY_WINDOW: usize = 3;

/// Coarse classification of a peer, from its recent responsiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderRole {
    /// The peer has been serving every batch for several rounds in a row.
    FullProvider,
    /// The peer is (still) only known to serve part of the content.
    CoWorker,
}

#[derive(Debug, Default, Clone, Copy)]
struct Average {
    total: f64,
    count: u32,
}

impl Average {
    fn record(&mut self, value: f64) {
        self.total += value;
        self.count += 1;
    }

    fn get(&self) -> f64 {
        if self.count > 0 {
            self.total / f64::from(self.count)
        } else {
            0.
        }
    }
}

/// A hill-climbing controller picking the batch width `L` and the idle timeout of a worker's next round.
///
/// After every round, the worker feeds the hit ratio (obtained / requested blocks), the elapsed time and the number of
/// obtained blocks:
/// - on a successful round (hit ratio at or above the threshold), the miss streak and the idle timeout are reset and
///   the block efficiency (blocks per second) drives `L`:
///   - when efficiency collapsed compared to the previous round, `L` is halved,
///   - when a batch width used before achieved a significantly better average efficiency, `L` jumps back to it,
///   - otherwise `L` grows by one to explore,
/// - on a partially successful round, nothing changes,
/// - on a fully missed round, the miss streak grows and past a few misses the idle timeout is doubled, as the peer may
///   well be congested rather than gone.
///
/// `L` never goes below 1, so that a worker always makes progress.
#[derive(Debug)]
pub struct DynamicAdjuster {
    config: AdjustConfig,
    role: ProviderRole,

    /// Current batch width.
    width: usize,
    /// Current idle timeout.
    tolerate: Duration,

    /// Observed time per block of the last successful rounds, in seconds.
    history: VecDeque<f64>,
    min_request_time: f64,

    consecutive_hits: u32,
    consecutive_misses: u32,

    last_efficiency: Option<f64>,
    /// Average efficiency observed for each batch width.
    efficiency: HashMap<usize, Average>,
}

impl DynamicAdjuster {
    pub fn new(config: AdjustConfig, width: usize) -> Self {
        Self {
            role: ProviderRole::CoWorker,
            width: width.max(1),
            tolerate: config.base_tolerate,
            history: VecDeque::with_capacity(HISTORY_WINDOW),
            min_request_time: f64::INFINITY,
            consecutive_hits: 0,
            consecutive_misses: 0,
            last_efficiency: None,
            efficiency: HashMap::new(),
            config,
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn tolerate(&self) -> Duration {
        self.tolerate
    }

    #[inline]
    pub fn role(&self) -> ProviderRole {
        self.role
    }

    /// Average time per block over the last successful rounds, in seconds.
    pub fn average_request_time(&self) -> Option<f64> {
        (!self.history.is_empty()).then(|| self.history.iter().sum::<f64>() / self.history.len() as f64)
    }

    /// Lowest time per block ever observed, in seconds.
    pub fn min_request_time(&self) -> Option<f64> {
        self.min_request_time.is_finite().then_some(self.min_request_time)
    }

    /// Account for a finished round and return the batch width of the next one.
    pub fn adjust(&mut self, hit_ratio: f64, elapsed: Duration, obtained: usize) -> usize {
        if hit_ratio < self.config.hit_ratio_threshold || obtained == 0 {
            self.consecutive_hits = 0;
            self.role = ProviderRole::CoWorker;

            if hit_ratio <= 0. {
                self.consecutive_misses += 1;

                if self.consecutive_misses >= self.config.miss_bound {
                    self.tolerate = self.tolerate.saturating_mul(2).min(self.config.max_tolerate);
                    tracing::trace!("{} missed rounds in a row, tolerating {:?}", self.consecutive_misses, self.tolerate);
                }
            }

            return self.width;
        }

        self.consecutive_misses = 0;
        self.tolerate = self.config.base_tolerate;

        self.consecutive_hits += 1;
        if self.consecutive_hits >= self.config.full_provider_rounds {
            self.role = ProviderRole::FullProvider;
        }

        let elapsed = elapsed.as_secs_f64().max(f64::EPSILON);

        let request_time = elapsed / obtained as f64;
        if self.history.len() == HISTORY_WINDOW {
            self.history.pop_front();
        }
        self.history.push_back(request_time);
        self.min_request_time = self.min_request_time.min(request_time);

        let current = obtained as f64 / elapsed;
        self.efficiency.entry(self.width).or_default().record(current);

        match self.last_efficiency {
            Some(last) if last > current * self.config.collapse_factor => {
                self.width = (self.width / 2).max(1);
            }
            _ => {
                let better = self
                    .efficiency
                    .iter()
                    .map(|(&width, average)| (width, average.get()))
                    .filter(|&(_, average)| average > current * self.config.improvement_factor)
                    .max_by(|(_, a), (_, b)| a.total_cmp(b));

                self.width = match better {
                    Some((width, _)) => width,
                    None => self.width + 1,
                };
            }
        }

        self.last_efficiency = Some(current);

        self.width
    }
}
