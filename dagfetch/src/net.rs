//! Collaborator interfaces consumed by the dispatcher.
//!
//! Provider discovery, block exchange and DAG decoding are not implemented by this crate: they are expressed as narrow
//! capability traits that both a real network stack and a test double (see [`mem`](crate::mem)) can implement.
//!
//! Cancellation is not part of these interfaces: a pending future or stream is simply dropped when its fetch scope is
//! cancelled, so implementors must release their resources on drop.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::{BoxError, DecodeError, NetError};
use crate::{Block, BlockId, Node, PeerId};

pub type DynRouting = Arc<dyn Routing>;
pub type DynTransport = Arc<dyn Transport>;
pub type DynCodec = Arc<dyn Codec>;

/// Content routing: who provides what.
pub trait Routing: Send + Sync + 'static {
    /// Identity of the local peer.
    fn self_id(&self) -> PeerId;

    /// Query the network for at most `limit` providers of `root`.
    ///
    /// The stream ends when the query is exhausted.
    fn find_providers(&self, root: BlockId, limit: usize) -> BoxStream<'static, PeerId>;

    /// Ask `peer` directly which other peers it knows to be providing `root`.
    fn find_providers_from(&self, root: BlockId, peer: PeerId) -> BoxFuture<'static, Result<Vec<PeerId>, NetError>>;

    /// Announce the local peer to `peer` as a (partial) provider of `root`.
    fn provide_to(&self, root: BlockId, peer: PeerId) -> BoxFuture<'static, Result<(), NetError>>;
}

/// Block exchange with a single peer.
pub trait Transport: Send + Sync + 'static {
    /// Establish a connection to `peer`.
    fn connect(&self, peer: PeerId) -> BoxFuture<'static, Result<(), NetError>>;

    /// Request a batch of blocks from `peer`.
    ///
    /// Blocks are streamed back as they arrive, in any order. The stream may end before every requested block has been
    /// sent, namely when the peer does not have some of them, and it may also yield blocks that were not requested.
    fn get_blocks_from(&self, ids: Vec<BlockId>, peer: PeerId) -> BoxStream<'static, Result<Block, NetError>>;
}

/// DAG node decoding.
pub trait Codec: Send + Sync + 'static {
    fn decode(&self, block: &Block) -> Result<Node, DecodeError>;
}

/// Caller-supplied consumer of fetched nodes.
///
/// Nodes are visited exactly once each and never concurrently, though in no particular order.
pub trait Visitor: Send + 'static {
    fn visit(&mut self, node: &Node) -> Result<(), BoxError>;
}

impl<F> Visitor for F
where
    F: FnMut(&Node) -> Result<(), BoxError> + Send + 'static,
{
    #[inline]
    fn visit(&mut self, node: &Node) -> Result<(), BoxError> {
        self(node)
    }
}

/// Turn a closure into a [`Visitor`].
///
/// ```
/// # use dagfetch::net::{visit_fn, Visitor};
/// # use dagfetch::{BlockId, Node};
/// let mut count = 0;
/// let mut visitor = visit_fn(move |_| {
///     count += 1;
///     Ok(())
/// });
///
/// assert!(visitor.visit(&Node::new(BlockId::new([0; 32]), "data")).is_ok());
/// ```
#[inline]
pub fn visit_fn<F>(f: F) -> F
where
    F: FnMut(&Node) -> Result<(), BoxError> + Send + 'static,
{
    f
}

/// A network stack, bundling all collaborators a dispatcher relies on.
#[derive(Clone)]
pub struct Network {
    pub routing: DynRouting,
    pub transport: DynTransport,
    pub codec: DynCodec,
}

impl Network {
    pub fn new(routing: DynRouting, transport: DynTransport, codec: DynCodec) -> Self {
        Self { routing, transport, codec }
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network").field("self_id", &self.routing.self_id()).finish_non_exhaustive()
    }
}
