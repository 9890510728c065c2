//! An in-memory swarm, standing in for a real network stack.
//!
//! [`MemSwarm`] implements both [`Routing`] and [`Transport`] over a set of simulated peers, each holding some blocks,
//! optionally slow or unreachable. Blocks are encoded with [`LinkCodec`], a minimal DAG node format:
//!
//! ```text
//!     - cumulative size (u64, big-endian)
//!     - number of children (u32, big-endian)
//!     - child block ids (32 bytes each)
//!     - payload (remaining bytes)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::{DecodeError, NetError};
use crate::net::{Codec, Network, Routing, Transport};
use crate::{Block, BlockId, Node, PeerId};

const HEADER_LEN: usize = size_of::<u64>() + size_of::<u32>();

/// The minimal node format used by [`MemSwarm`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkCodec;

impl LinkCodec {
    pub fn encode(node: &Node) -> Block {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + node.children().len() * 32 + node.payload().len());

        buf.put_u64(node.size());
        buf.put_u32(node.children().len() as u32);
        node.children().iter().for_each(|child| buf.put_slice(child.as_bytes()));
        buf.put_slice(node.payload());

        Block::new(node.id(), buf.freeze())
    }
}

impl Codec for LinkCodec {
    fn decode(&self, block: &Block) -> Result<Node, DecodeError> {
        let error = |reason: &str| DecodeError {
            id: block.id(),
            reason: reason.to_owned(),
        };

        let mut data = block.data().clone();

        if data.len() < HEADER_LEN {
            return Err(error("truncated header"));
        }

        let size = data.get_u64();
        let count = data.get_u32() as usize;

        match count.checked_mul(32) {
            Some(len) if len <= data.len() => {}
            _ => return Err(error("truncated links")),
        }

        let children: Vec<_> = (0..count)
            .map(|_| {
                let mut id = [0u8; 32];
                data.copy_to_slice(&mut id);
                BlockId::new(id)
            })
            .collect();

        Ok(Node::new(block.id(), data).with_children(children).with_size(size))
    }
}

#[derive(Debug, Default)]
struct MemPeer {
    blocks: HashMap<BlockId, Block>,
    /// Delay before each block is sent.
    latency: Duration,
    unreachable: bool,
    /// Other providers this peer knows about.
    known: Vec<PeerId>,
}

/// A simulated swarm of peers, as seen from a local peer.
#[derive(Debug)]
pub struct MemSwarm {
    local: PeerId,
    peers: RwLock<HashMap<PeerId, MemPeer>>,
    /// Providers returned by network-wide discovery, in order.
    providers: RwLock<Vec<PeerId>>,
    requests: Mutex<Vec<(PeerId, Vec<BlockId>)>>,
    announcements: Mutex<Vec<PeerId>>,
}

impl MemSwarm {
    pub fn new(local: PeerId) -> Arc<Self> {
        Arc::new(Self {
            local,
            peers: Default::default(),
            providers: Default::default(),
            requests: Default::default(),
            announcements: Default::default(),
        })
    }

    /// Bundle this swarm into a [`Network`], using [`LinkCodec`].
    pub fn network(self: &Arc<Self>) -> Network {
        Network::new(Arc::clone(self) as _, Arc::clone(self) as _, Arc::new(LinkCodec))
    }

    /// Add a peer holding the given nodes, without advertising it network-wide.
    pub fn add_peer<'a>(&self, peer: PeerId, nodes: impl IntoIterator<Item = &'a Node>) {
        let mut peers = self.peers.write().unwrap();
        let blocks = &mut peers.entry(peer).or_default().blocks;

        blocks.extend(nodes.into_iter().map(|node| (node.id(), LinkCodec::encode(node))));
    }

    /// Add a peer holding the given nodes and advertise it network-wide.
    pub fn add_provider<'a>(&self, peer: PeerId, nodes: impl IntoIterator<Item = &'a Node>) {
        self.add_peer(peer, nodes);
        self.providers.write().unwrap().push(peer);
    }

    pub fn set_latency(&self, peer: PeerId, latency: Duration) {
        self.peers.write().unwrap().entry(peer).or_default().latency = latency;
    }

    pub fn set_unreachable(&self, peer: PeerId, unreachable: bool) {
        self.peers.write().unwrap().entry(peer).or_default().unreachable = unreachable;
    }

    /// Let `peer` know about other providers, to be returned by co-worker discovery.
    pub fn set_known(&self, peer: PeerId, known: impl IntoIterator<Item = PeerId>) {
        self.peers.write().unwrap().entry(peer).or_default().known = known.into_iter().collect();
    }

    /// All block requests received so far, in order.
    pub fn requests(&self) -> Vec<(PeerId, Vec<BlockId>)> {
        self.requests.lock().unwrap().clone()
    }

    /// Peers the local peer announced itself to as a co-provider.
    pub fn announcements(&self) -> Vec<PeerId> {
        self.announcements.lock().unwrap().clone()
    }

    fn is_reachable(&self, peer: &PeerId) -> bool {
        self.peers.read().unwrap().get(peer).is_some_and(|state| !state.unreachable)
    }
}

impl Routing for MemSwarm {
    fn self_id(&self) -> PeerId {
        self.local
    }

    fn find_providers(&self, _root: BlockId, limit: usize) -> BoxStream<'static, PeerId> {
        let providers: Vec<_> = self.providers.read().unwrap().iter().copied().take(limit).collect();

        stream::iter(providers).boxed()
    }

    fn find_providers_from(&self, _root: BlockId, peer: PeerId) -> BoxFuture<'static, Result<Vec<PeerId>, NetError>> {
        let result = match self.peers.read().unwrap().get(&peer) {
            Some(state) if !state.unreachable => Ok(state.known.clone()),
            _ => Err(NetError::Unreachable(peer)),
        };

        future::ready(result).boxed()
    }

    fn provide_to(&self, _root: BlockId, peer: PeerId) -> BoxFuture<'static, Result<(), NetError>> {
        let result = if self.is_reachable(&peer) {
            self.announcements.lock().unwrap().push(peer);
            Ok(())
        } else {
            Err(NetError::Unreachable(peer))
        };

        future::ready(result).boxed()
    }
}

impl Transport for MemSwarm {
    fn connect(&self, peer: PeerId) -> BoxFuture<'static, Result<(), NetError>> {
        let result = if self.is_reachable(&peer) { Ok(()) } else { Err(NetError::Unreachable(peer)) };

        future::ready(result).boxed()
    }

    fn get_blocks_from(&self, ids: Vec<BlockId>, peer: PeerId) -> BoxStream<'static, Result<Block, NetError>> {
        let (blocks, latency) = match self.peers.read().unwrap().get(&peer) {
            Some(state) if !state.unreachable => {
                let blocks: Vec<_> = ids.iter().filter_map(|id| state.blocks.get(id).cloned()).collect();
                (blocks, state.latency)
            }
            _ => return stream::once(future::ready(Err(NetError::Unreachable(peer)))).boxed(),
        };

        self.requests.lock().unwrap().push((peer, ids));

        stream::iter(blocks)
            .then(move |block| async move {
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                Ok(block)
            })
            .boxed()
    }
}
