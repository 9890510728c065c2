//! This module provides the parallel block fetch dispatcher.
//!
//! A [`Dispatcher`] fetches a whole DAG from as many peers as it can find at once, rather than from a single source:
//! - the root node is visited, its children are registered as wanted blocks,
//! - provider discovery runs in the background, feeding a single stream of peers,
//! - each newly discovered peer gets its own worker, which repeatedly claims a batch of wanted blocks (nearest first,
//!   according to a per-peer distance), requests them and hands them back over,
//! - every block is visited exactly once, no matter how many peers deliver it, and its children are registered and
//!   broadcast to all workers before any of them may claim them,
//! - the fetch completes when no registered block is left to be filled.
//!
//! Every task of a fetch runs within a single [`Scope`], cancelled on completion, on failure or by the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;

use crate::adjust::{DynamicAdjuster, ProviderRole};
use crate::config::DispatchConfig;
use crate::error::{AllocateError, Error};
use crate::monitor::DispatchMonitor;
use crate::net::{Network, Visitor};
use crate::task::Scope;
use crate::worker::{PeerWorker, WorkerExit, WorkerHandle};
use crate::{Block, BlockId, BlockRegistry, BlockState, Fill, Node, PeerId};

/// Fetch a whole DAG from the network with a default configuration.
///
/// Returns once every block of the DAG has been visited, [`Error::EndOfDag`] if the root node has no children.
pub async fn fetch(network: Network, root: Node, visitor: impl Visitor) -> Result<(), Error> {
    Dispatcher::new(network, root, visitor).dispatch().await
}

/// Outcome of a block delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// The block has been visited.
    Useful,
    /// Another peer delivered the block first.
    Redundant,
    /// The block could not be decoded.
    Rejected,
}

/// The state shared between a dispatcher and its tasks.
pub(crate) struct Shared {
    pub root: Node,
    pub local: PeerId,
    pub config: DispatchConfig,
    pub network: Network,
    pub registry: BlockRegistry,
    /// Every peer ever discovered, working or not.
    pub workers: RwLock<HashMap<PeerId, Arc<WorkerHandle>>>,
    pub monitor: DispatchMonitor,
    /// The visitor, also acting as the single writer lock deliveries are serialized behind.
    pub visitor: Mutex<Box<dyn Visitor>>,
    pub scope: Scope,
}

impl Shared {
    /// Register newly discovered blocks and broadcast the accepted ones to every worker.
    ///
    /// Workers are kept locked out of the worker set for the whole operation, so that a worker created concurrently
    /// either gets seeded with these blocks or receives them through the broadcast.
    pub fn register_blocks(&self, ids: impl IntoIterator<Item = BlockId>) -> Vec<BlockId> {
        let workers = self.workers.read().unwrap();

        let accepted = self.registry.register(ids);

        if !accepted.is_empty() {
            tracing::trace!("Registered {} new blocks, broadcasting to {} workers", accepted.len(), workers.len());

            for handle in workers.values() {
                handle.absorb(&accepted);
            }
        }

        accepted
    }

    /// Select the next batch of `worker`, from its own sequence and at its own width.
    pub fn allocate(&self, worker: &WorkerHandle) -> Result<Vec<BlockId>, AllocateError> {
        let width = worker.width();

        worker.with_sequence(|sequence| self.registry.allocate(sequence, width, self.config.pending_fallback_limit))
    }

    /// Hand a received block over, visiting it if no other peer delivered it first.
    ///
    /// Decoding happens concurrently, but the rest of the delivery is serialized behind the visitor lock: the block
    /// state is checked again, the node visited, its children registered, and only then the block is marked as filled.
    /// This way the outstanding block counter cannot drop to zero while children are still to be registered, nor while
    /// a node is still being visited.
    pub fn deliver(&self, worker: &WorkerHandle, block: Block) -> Result<Delivery, Error> {
        let id = block.id();

        if self.registry.state(&id) == Some(BlockState::Filled) {
            return Ok(self.redundant(worker, id));
        }

        let node = match self.network.codec.decode(&block) {
            Ok(node) => node,
            Err(err) => {
                tracing::warn!("Worker {}, dropping block: {err}", worker.peer());
                return Ok(Delivery::Rejected);
            }
        };

        let mut visitor = self.visitor.lock().unwrap();

        if self.registry.state(&id) == Some(BlockState::Filled) {
            return Ok(self.redundant(worker, id));
        }

        visitor.visit(&node).map_err(|source| Error::Visit { id, source })?;

        if !node.children().is_empty() {
            self.register_blocks(node.children().iter().copied());
        }

        match self.registry.mark_filled(id) {
            Ok(Fill::Filled { outstanding }) => {
                tracing::trace!("Worker {} filled block {id}, {outstanding} left", worker.peer());
            }
            Ok(Fill::Redundant) => return Ok(self.redundant(worker, id)),
            Err(err) => {
                tracing::error!("Worker {}, delivered block cannot be filled: {err}", worker.peer());
                return Ok(Delivery::Rejected);
            }
        }

        drop(visitor);

        self.monitor.record_collected();
        worker.record_effective();

        Ok(Delivery::Useful)
    }

    fn redundant(&self, worker: &WorkerHandle, id: BlockId) -> Delivery {
        tracing::trace!("Worker {}, block {id} has already been delivered", worker.peer());

        self.monitor.record_redundant();

        Delivery::Redundant
    }

    /// Return the handle of `peer`'s worker, creating it on first discovery.
    fn worker(&self, peer: PeerId) -> Arc<WorkerHandle> {
        let mut workers = self.workers.write().unwrap();

        let handle = workers.entry(peer).or_insert_with(|| {
            let estimate = self.root.size() / self.config.block_size.max(1);
            let adjuster = DynamicAdjuster::new(self.config.adjust.clone(), self.config.initial_width(estimate));

            tracing::debug!("New worker for peer {peer}, initial batch: {}", adjuster.width());

            Arc::new(WorkerHandle::new(peer, self.local, &self.registry.ids(), adjuster))
        });

        Arc::clone(handle)
    }

    /// Peers with a running worker, full providers first.
    pub fn active_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self
            .workers
            .read()
            .unwrap()
            .values()
            .filter(|handle| handle.is_working())
            .map(|handle| (handle.peer(), handle.role()))
            .collect();

        peers.sort_by_key(|&(_, role)| role != ProviderRole::FullProvider);

        peers.into_iter().map(|(peer, _)| peer).collect()
    }

    /// Start a worker for a discovered peer, unless it is the local peer or its worker is already running.
    fn on_provider(self: &Arc<Self>, peer: PeerId, exits: &mpsc::UnboundedSender<WorkerExit>) {
        if peer == self.local {
            return;
        }

        let handle = self.worker(peer);

        if !handle.try_start() {
            return;
        }

        self.scope.spawn(PeerWorker::new(handle, Arc::clone(self), exits.clone()).run());

        let routing = Arc::clone(&self.network.routing);
        let root = self.root.id();
        self.scope.spawn(async move {
            if let Err(err) = routing.provide_to(root, peer).await {
                tracing::debug!("Cannot announce co-provider to peer {peer}: {err}");
            }
        });
    }
}

/// A parallel block fetch dispatcher, fetching a whole DAG from its root node.
///
/// # Example
/// ```no_run
/// # async fn run(network: dagfetch::net::Network, root: dagfetch::Node) -> Result<(), dagfetch::Error> {
/// use dagfetch::dispatch::Dispatcher;
///
/// let dispatcher = Dispatcher::new(
///     network,
///     root,
///     dagfetch::net::visit_fn(|node| {
///         println!("Visiting block {}", node.id());
///         Ok(())
///     }),
/// );
///
/// dispatcher.dispatch().await?;
///
/// println!("{} redundant deliveries", dispatcher.monitor().redundant());
/// # Ok(())
/// # }
/// ```
pub struct Dispatcher {
    shared: Arc<Shared>,
    started: AtomicBool,
}

impl Dispatcher {
    pub fn new(network: Network, root: Node, visitor: impl Visitor) -> Self {
        Self::with_config(network, root, visitor, DispatchConfig::default())
    }

    pub fn with_config(network: Network, root: Node, visitor: impl Visitor, config: DispatchConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                local: network.routing.self_id(),
                root,
                config,
                network,
                registry: BlockRegistry::new(),
                workers: Default::default(),
                monitor: DispatchMonitor::default(),
                visitor: Mutex::new(Box::new(visitor)),
                scope: Scope::new(),
            }),
            started: AtomicBool::new(false),
        }
    }

    /// The lifetime scope of this fetch, which can be cancelled from the outside.
    pub fn scope(&self) -> Scope {
        self.shared.scope.clone()
    }

    #[inline]
    pub fn monitor(&self) -> &DispatchMonitor {
        &self.shared.monitor
    }

    /// Number of registered blocks not filled yet.
    pub fn outstanding(&self) -> usize {
        self.shared.registry.outstanding()
    }

    pub fn state(&self, id: &BlockId) -> Option<BlockState> {
        self.shared.registry.state(id)
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Register wanted blocks, returning the ones which were not known yet.
    ///
    /// Accepted blocks are broadcast to every worker.
    pub fn register_blocks(&self, ids: impl IntoIterator<Item = BlockId>) -> Vec<BlockId> {
        self.shared.register_blocks(ids)
    }

    /// Mark a block as filled, see [`BlockRegistry::mark_filled()`].
    pub fn mark_filled(&self, id: BlockId) -> Result<Fill, AllocateError> {
        self.shared.registry.mark_filled(id)
    }

    /// Claim up to `width` blocks from a distance-sorted sequence, see [`BlockRegistry::allocate()`].
    pub fn allocate(&self, sequence: &[BlockId], width: usize) -> Result<Vec<BlockId>, AllocateError> {
        self.shared.registry.allocate(sequence, width, self.shared.config.pending_fallback_limit)
    }

    /// Fetch the whole DAG.
    ///
    /// Returns `Ok(())` once every registered block has been filled, [`Error::EndOfDag`] if the root node has no
    /// children, or the error which interrupted the fetch. Can only be called once.
    pub async fn dispatch(&self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyDispatched);
        }

        let shared = &self.shared;
        let root = &shared.root;

        tracing::debug!("Dispatching {} from local peer {}", root.id(), shared.local);

        shared.visitor.lock().unwrap().visit(root).map_err(|source| Error::Visit { id: root.id(), source })?;

        if root.children().is_empty() {
            return Err(Error::EndOfDag);
        }

        shared.register_blocks(root.children().iter().copied());

        let (providers_sender, mut providers) = mpsc::channel(shared.config.channel_capacity.max(1));
        let (exits_sender, mut exits) = mpsc::unbounded_channel();

        crate::discovery::spawn(shared, providers_sender);

        let result = loop {
            tokio::select! {
                biased;
                _ = shared.scope.cancelled() => break Err(Error::Cancelled),
                Some(exit) = exits.recv() => match exit {
                    WorkerExit::Finished(peer) => {
                        let outstanding = shared.registry.outstanding();

                        tracing::trace!("Worker {peer} finished, {outstanding} blocks outstanding");

                        if outstanding == 0 {
                            break Ok(());
                        }
                    }
                    WorkerExit::Failed(peer, err) => {
                        tracing::debug!("Worker {peer} failed: {err}");
                        break Err(err);
                    }
                },
                provider = providers.recv() => match provider {
                    Some(peer) => shared.on_provider(peer, &exits_sender),
                    None => break Err(Error::DiscoveryClosed),
                },
            }
        };

        shared.scope.cancel();

        let report = shared.monitor.report();
        tracing::info!(
            "Dispatch of {} done: {} blocks collected from {} peers, {} redundant, variance {}",
            root.id(),
            report.collected,
            report.effects.len(),
            report.redundant,
            report.variance
        );

        result
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shared.scope.cancel();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("root", &self.shared.root.id())
            .field("local", &self.shared.local)
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
