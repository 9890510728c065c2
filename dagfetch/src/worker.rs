//! This module provides the per-peer fetch workers.

use std::collections::hash_map::{Entry, HashMap};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::adjust::{DynamicAdjuster, ProviderRole};
use crate::dispatch::{Delivery, Shared};
use crate::error::Error;
use crate::{BlockId, PeerId};

/// Notification sent by a worker to the dispatcher when it stops working.
#[derive(Debug)]
pub(crate) enum WorkerExit {
    /// No wanted block is left for this peer, or the peer could not be reached.
    Finished(PeerId),
    /// The whole fetch cannot go on.
    Failed(PeerId, Error),
}

/// Candidate blocks of a peer, sorted by ascending distance.
#[derive(Debug, Default)]
pub(crate) struct Sequence {
    ids: Vec<BlockId>,
    distances: HashMap<BlockId, u128>,
}

impl Sequence {
    /// Build the sequence of `peer` from scratch.
    pub fn sorted(peer: &PeerId, local: &PeerId, ids: &[BlockId]) -> Self {
        let mut sequence = Self::default();
        sequence.absorb(peer, local, ids);
        sequence
    }

    /// Merge newly discovered blocks into the sequence, keeping it sorted, and return how many were actually new.
    ///
    /// Only the new ids get sorted, then both sorted runs are merged in a single pass.
    pub fn absorb(&mut self, peer: &PeerId, local: &PeerId, ids: &[BlockId]) -> usize {
        let mut delta: Vec<_> = ids
            .iter()
            .filter_map(|id| match self.distances.entry(*id) {
                Entry::Occupied(_) => None,
                Entry::Vacant(entry) => Some((*id, *entry.insert(peer.blended_distance(local, id)))),
            })
            .collect();

        if delta.is_empty() {
            return 0;
        }

        delta.sort_by_key(|&(_, distance)| distance);

        let old = std::mem::take(&mut self.ids);
        let mut merged = Vec::with_capacity(old.len() + delta.len());
        let mut old = old.into_iter().peekable();
        let mut new = delta.iter().peekable();

        loop {
            let take_old = match (old.peek(), new.peek()) {
                (Some(id), Some((_, distance))) => self.distances[id] <= *distance,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };

            if take_old {
                merged.extend(old.next());
            } else {
                merged.extend(new.next().map(|&(id, _)| id));
            }
        }

        self.ids = merged;

        delta.len()
    }

    #[inline]
    pub fn ids(&self) -> &[BlockId] {
        &self.ids
    }

    #[cfg(test)]
    fn distance(&self, id: &BlockId) -> Option<u128> {
        self.distances.get(id).copied()
    }
}

/// The state of a peer worker shared with the dispatcher.
///
/// It outlives a single worker run, so that a peer rediscovered later on resumes with its sequence and its controller.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    peer: PeerId,
    local: PeerId,
    sequence: Mutex<Sequence>,
    adjuster: Mutex<DynamicAdjuster>,
    /// Whether a worker task is currently running for this peer.
    working: AtomicBool,
    /// Blocks this peer delivered first.
    effective: AtomicUsize,
}

impl WorkerHandle {
    pub fn new(peer: PeerId, local: PeerId, ids: &[BlockId], adjuster: DynamicAdjuster) -> Self {
        Self {
            sequence: Mutex::new(Sequence::sorted(&peer, &local, ids)),
            adjuster: Mutex::new(adjuster),
            working: AtomicBool::new(false),
            effective: AtomicUsize::new(0),
            peer,
            local,
        }
    }

    #[inline]
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Flag this worker as working, returning `false` if it already was.
    pub fn try_start(&self) -> bool {
        self.working.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    #[inline]
    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::Acquire)
    }

    pub fn role(&self) -> ProviderRole {
        self.adjuster.lock().unwrap().role()
    }

    pub fn width(&self) -> usize {
        self.adjuster.lock().unwrap().width()
    }

    #[inline]
    pub fn effective(&self) -> usize {
        self.effective.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn record_effective(&self) {
        self.effective.fetch_add(1, Ordering::Relaxed);
    }

    pub fn absorb(&self, ids: &[BlockId]) -> usize {
        self.sequence.lock().unwrap().absorb(&self.peer, &self.local, ids)
    }

    /// Run `f` on the current sequence.
    pub fn with_sequence<T>(&self, f: impl FnOnce(&[BlockId]) -> T) -> T {
        f(self.sequence.lock().unwrap().ids())
    }
}

/// A worker driving the whole conversation with one peer.
///
/// Each round, it asks the dispatcher for a batch of blocks, requests them from its peer, hands every received block
/// over to the dispatcher and finally lets its controller pick the next batch width. It stops on the first round for
/// which nothing is left to request.
pub(crate) struct PeerWorker {
    handle: Arc<WorkerHandle>,
    shared: Arc<Shared>,
    exits: mpsc::UnboundedSender<WorkerExit>,
}

impl PeerWorker {
    pub fn new(handle: Arc<WorkerHandle>, shared: Arc<Shared>, exits: mpsc::UnboundedSender<WorkerExit>) -> Self {
        Self { handle, shared, exits }
    }

    pub async fn run(self) {
        let peer = self.handle.peer;

        tracing::debug!("Worker {peer} start working");

        let exit = self.work().await;

        let effective = self.handle.effective();
        tracing::debug!("Worker {peer} has done, effectiveness: {effective}");

        self.shared.monitor.update_effects(peer, effective);
        self.handle.working.store(false, Ordering::Release);

        // the dispatcher may be gone already
        let _ = self.exits.send(exit);
    }

    async fn work(&self) -> WorkerExit {
        let peer = self.handle.peer;

        if let Err(err) = self.shared.network.transport.connect(peer).await {
            tracing::warn!("Worker {peer} cannot connect: {err}");
            return WorkerExit::Finished(peer);
        }

        loop {
            if self.shared.scope.is_cancelled() {
                return WorkerExit::Failed(peer, Error::Cancelled);
            }

            let batch = match self.shared.allocate(&self.handle) {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::error!("Worker {peer} aborts its round: {err}");
                    return WorkerExit::Finished(peer);
                }
            };

            if batch.is_empty() {
                return WorkerExit::Finished(peer);
            }

            if let Err(err) = self.round(batch).await {
                return WorkerExit::Failed(peer, err);
            }
        }
    }

    async fn round(&self, batch: Vec<BlockId>) -> Result<(), Error> {
        let peer = self.handle.peer;
        let requested = batch.len();
        let tolerate = self.handle.adjuster.lock().unwrap().tolerate();

        tracing::debug!(
            "Worker {peer}, request {requested} blks, already totally collected {}",
            self.shared.monitor.collected()
        );

        let mut wanted: HashSet<_> = batch.iter().copied().collect();
        let mut obtained = 0;

        let start = Instant::now();
        let mut blocks = self.shared.network.transport.get_blocks_from(batch, peer);

        let idle = tokio::time::sleep(tolerate);
        tokio::pin!(idle);
        let cancelled = self.shared.scope.cancelled();
        tokio::pin!(cancelled);

        // once the peer is done sending, the round still lasts until the idle timer fires
        let mut drained = false;

        while !wanted.is_empty() {
            tokio::select! {
                biased;
                _ = &mut cancelled => return Err(Error::Cancelled),
                item = blocks.next(), if !drained => match item {
                    None => drained = true,
                    Some(Err(err)) => {
                        tracing::warn!("Worker {peer}, batch interrupted: {err}");
                        drained = true;
                    }
                    Some(Ok(block)) => {
                        if !wanted.remove(&block.id()) {
                            tracing::trace!("Worker {peer}, ignoring unrequested block {}", block.id());
                            continue;
                        }

                        match self.shared.deliver(&self.handle, block)? {
                            Delivery::Useful => {
                                obtained += 1;
                                idle.as_mut().reset(Instant::now() + tolerate);
                            }
                            Delivery::Redundant => obtained += 1,
                            Delivery::Rejected => {}
                        }
                    }
                },
                _ = &mut idle => {
                    tracing::debug!("Worker {peer}, current batch request has exceeded the timeout threshold {tolerate:?}");
                    break;
                }
            }
        }

        let width = self.handle.adjuster.lock().unwrap().adjust(obtained as f64 / requested as f64, start.elapsed(), obtained);

        tracing::debug!("Worker {peer}, finish current round, left blk: {}, next batch: {width}", wanted.len());

        Ok(())
    }
}
