//! Passive dispatch statistics, for offline fairness and efficiency analysis.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::PeerId;

/// Counters fed by workers as they go. Reading them never affects the fetch itself.
#[derive(Debug, Default)]
pub struct DispatchMonitor {
    redundant: AtomicUsize,
    collected: AtomicUsize,
    /// Effective blocks contributed by each peer, as of its worker's last retirement.
    effects: Mutex<HashMap<PeerId, usize>>,
}

/// A snapshot of the [`DispatchMonitor`] counters.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorReport {
    /// Blocks received after another peer had already delivered them.
    pub redundant: usize,
    /// Blocks delivered to the visitor.
    pub collected: usize,
    /// Population variance of the effective blocks contributed per peer.
    pub variance: f64,
    pub effects: HashMap<PeerId, usize>,
}

impl DispatchMonitor {
    pub fn record_redundant(&self) {
        self.redundant.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_collected(&self) {
        self.collected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_effects(&self, peer: PeerId, effective: usize) {
        self.effects.lock().unwrap().insert(peer, effective);
    }

    pub fn redundant(&self) -> usize {
        self.redundant.load(Ordering::Relaxed)
    }

    pub fn collected(&self) -> usize {
        self.collected.load(Ordering::Relaxed)
    }

    pub fn effects_variance(&self) -> f64 {
        variance(self.effects.lock().unwrap().values().copied())
    }

    pub fn report(&self) -> MonitorReport {
        let effects = self.effects.lock().unwrap().clone();

        MonitorReport {
            redundant: self.redundant(),
            collected: self.collected(),
            variance: variance(effects.values().copied()),
            effects,
        }
    }
}

fn variance(values: impl Iterator<Item = usize> + Clone) -> f64 {
    let count = values.clone().count();
    if count == 0 {
        return 0.;
    }

    let mean = values.clone().sum::<usize>() as f64 / count as f64;

    values.map(|value| (value as f64 - mean).powi(2)).sum::<f64>() / count as f64
}
