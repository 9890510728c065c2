use thiserror::Error;

use crate::{BlockId, PeerId};

/// Error type returned by visitors and accepted from foreign collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a whole fetch.
#[derive(Debug, Error)]
pub enum Error {
    /// The root node has no children, there is nothing more to fetch.
    #[error("end of dag")]
    EndOfDag,
    /// The peer discovery stream has been closed before the fetch completed.
    #[error("provider discovery stream closed")]
    DiscoveryClosed,
    /// The fetch scope has been cancelled before the fetch completed.
    #[error("fetch cancelled")]
    Cancelled,
    /// The fetch has already been dispatched once.
    #[error("fetch already dispatched")]
    AlreadyDispatched,
    /// The visitor rejected a node.
    #[error("visitor failed on block {id}: {source}")]
    Visit { id: BlockId, source: BoxError },
}

/// Transient failure while talking to a peer or to the routing layer.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),
    #[error("request to peer {peer} failed: {reason}")]
    Request { peer: PeerId, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Malformed block bytes.
#[derive(Debug, Error)]
#[error("cannot decode block {id}: {reason}")]
pub struct DecodeError {
    pub id: BlockId,
    pub reason: String,
}

/// Broken registry invariant, fatal to the current round of the worker which triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocateError {
    #[error("block {0} has never been registered")]
    UnknownBlock(BlockId),
}
