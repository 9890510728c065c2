use std::fmt;

use bytes::Bytes;

mod registry;
pub use registry::*;

pub(crate) mod utils;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Create a new id from its raw bytes.
            #[inline]
            pub const fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            #[inline]
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            #[inline]
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                utils::encode_id(&self.0, f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(", stringify!($name))?;
                utils::encode_id(&self.0, f)?;
                write!(f, ")")
            }
        }
    };
}

id_type! {
    /// An immutable, content-derived identifier of a single block.
    BlockId
}

id_type! {
    /// The identity of a peer on the network.
    PeerId
}

impl PeerId {
    /// Distance between this peer and a block, a smaller distance meaning a higher request priority.
    #[inline]
    pub fn distance(&self, block: &BlockId) -> u64 {
        utils::short_xor_distance(&self.0, &block.0)
    }

    /// Distance between this peer and a block, blended with the local identity.
    ///
    /// Blending decorrelates the request order of two workers fetching from different peers, so that they rather
    /// start from different ends of the wanted set.
    #[inline]
    pub fn blended_distance(&self, local: &PeerId, block: &BlockId) -> u128 {
        u128::from(self.distance(block)) + u128::from(local.distance(block))
    }
}

/// Raw block bytes, as received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    id: BlockId,
    data: Bytes,
}

impl Block {
    pub fn new(id: BlockId, data: impl Into<Bytes>) -> Self {
        Self { id, data: data.into() }
    }

    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// A decoded DAG node.
///
/// Nodes are handed to the caller's [`Visitor`](crate::net::Visitor) exactly once each, whatever the number of peers
/// that delivered the underlying block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Id of the block this node was decoded from.
    id: BlockId,

    /// Cumulative size of the sub-DAG rooted at this node, in bytes.
    ///
    /// For the root node, it gives an estimate of the whole content size.
    size: u64,

    /// Links to child blocks, in DAG order.
    children: Vec<BlockId>,

    /// Data carried by the node itself.
    payload: Bytes,
}

impl Node {
    /// Create a new leaf `Node`, sized after its own payload.
    pub fn new(id: BlockId, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();

        Self {
            id,
            size: payload.len() as u64,
            children: Default::default(),
            payload,
        }
    }

    /// Build a new `Node` linking to the given child blocks.
    #[inline]
    pub fn with_children<I: IntoIterator<Item = BlockId>>(self, iter: I) -> Self {
        Self {
            children: FromIterator::from_iter(iter),
            ..self
        }
    }

    /// Build a new `Node` with a given cumulative size.
    #[inline]
    pub fn with_size(self, size: u64) -> Self {
        Self { size, ..self }
    }

    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn children(&self) -> &[BlockId] {
        &self.children
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// Global state of a wanted block.
///
/// Transitions are monotonic: `Empty` → `Pending` → `Filled`, and `Filled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockState {
    /// Wanted, not claimed by any worker yet.
    Empty,
    /// Claimed by at least one worker, not delivered yet.
    Pending,
    /// Delivered to the visitor.
    Filled,
}
