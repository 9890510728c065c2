use std::collections::hash_map::{Entry, HashMap};
use std::sync::RwLock;

use super::{BlockId, BlockState};
use crate::error::AllocateError;

const DEFAULT_CAPACITY: usize = 1_024;

/// Outcome of [`BlockRegistry::mark_filled()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// This call won the race and filled the block, leaving `outstanding` blocks to be filled.
    Filled { outstanding: usize },
    /// The block had already been filled, the delivery is redundant.
    Redundant,
}

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<BlockId, BlockState>,
    /// Registered ids, in registration order.
    ids: Vec<BlockId>,
    /// Number of registered blocks not filled yet.
    outstanding: usize,
}

/// The global block state store of a fetch.
///
/// Every mutation happens while holding the write side of a single `RwLock`, so that each per-block transition is
/// linearizable and the winner of any race on a block is well-defined:
/// - [`register()`](Self::register) only ever inserts new `Empty` entries,
/// - [`allocate()`](Self::allocate) reads and claims entries (`Empty` → `Pending`) atomically,
/// - [`mark_filled()`](Self::mark_filled) moves an entry to `Filled` at most once and decrements the outstanding
///   counter accordingly.
///
/// No transition ever goes backward.
#[derive(Debug)]
pub struct BlockRegistry {
    inner: RwLock<Inner>,
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                states: HashMap::with_capacity(DEFAULT_CAPACITY),
                ids: Vec::with_capacity(DEFAULT_CAPACITY),
                outstanding: 0,
            }),
        }
    }

    /// Register wanted blocks as `Empty`, returning the accepted delta in the given order.
    ///
    /// Already known ids (including duplicates within `ids`) are silently skipped.
    pub fn register(&self, ids: impl IntoIterator<Item = BlockId>) -> Vec<BlockId> {
        let mut inner = self.inner.write().unwrap();
        let inner = &mut *inner;

        let accepted: Vec<_> = ids
            .into_iter()
            .filter(|id| match inner.states.entry(*id) {
                Entry::Occupied(_) => false,
                Entry::Vacant(entry) => {
                    entry.insert(BlockState::Empty);
                    true
                }
            })
            .collect();

        inner.ids.extend_from_slice(&accepted);
        inner.outstanding += accepted.len();

        accepted
    }

    /// Move a block to `Filled`.
    ///
    /// Only the first call for a given block fills it and decrements the outstanding counter, any later call returns
    /// [`Fill::Redundant`] and leaves the registry untouched.
    pub fn mark_filled(&self, id: BlockId) -> Result<Fill, AllocateError> {
        let mut inner = self.inner.write().unwrap();
        let inner = &mut *inner;

        match inner.states.get_mut(&id) {
            None => Err(AllocateError::UnknownBlock(id)),
            Some(BlockState::Filled) => Ok(Fill::Redundant),
            Some(state) => {
                *state = BlockState::Filled;
                inner.outstanding -= 1;

                Ok(Fill::Filled {
                    outstanding: inner.outstanding,
                })
            }
        }
    }

    /// Select up to `width` blocks to request, walking `sequence` in order.
    ///
    /// `Empty` entries are collected first and claimed (moved to `Pending`) in the same critical section, so that no
    /// two callers can claim the same `Empty` block. When fewer than `width` were found, a second pass collects entries
    /// already `Pending` (claimed by someone else but not delivered yet), at most `pending_limit` of them when given.
    /// The limit is clamped to 1, since `Pending` blocks claimed by a peer lacking them are only reachable this way.
    ///
    /// An id of `sequence` which has never been registered aborts the whole selection without claiming anything.
    pub fn allocate(&self, sequence: &[BlockId], width: usize, pending_limit: Option<usize>) -> Result<Vec<BlockId>, AllocateError> {
        let width = width.max(1);
        let mut inner = self.inner.write().unwrap();

        let mut empties = Vec::with_capacity(width.min(sequence.len()));
        for id in sequence {
            match inner.states.get(id) {
                None => return Err(AllocateError::UnknownBlock(*id)),
                Some(BlockState::Empty) => {
                    empties.push(*id);
                    if empties.len() == width {
                        break;
                    }
                }
                Some(_) => {}
            }
        }

        let mut pendings = vec![];
        let wanted = (width - empties.len()).min(pending_limit.unwrap_or(usize::MAX).max(1));
        if wanted > 0 {
            for id in sequence {
                match inner.states.get(id) {
                    None => return Err(AllocateError::UnknownBlock(*id)),
                    Some(BlockState::Pending) => {
                        pendings.push(*id);
                        if pendings.len() == wanted {
                            break;
                        }
                    }
                    Some(_) => {}
                }
            }
        }

        for id in &empties {
            if let Some(state) = inner.states.get_mut(id) {
                *state = BlockState::Pending;
            }
        }

        empties.extend(pendings);

        Ok(empties)
    }

    /// Current state of a block, `None` if it has never been registered.
    pub fn state(&self, id: &BlockId) -> Option<BlockState> {
        self.inner.read().unwrap().states.get(id).copied()
    }

    /// Number of registered blocks not filled yet.
    pub fn outstanding(&self) -> usize {
        self.inner.read().unwrap().outstanding
    }

    /// Number of registered blocks.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All registered ids, in registration order.
    pub fn ids(&self) -> Vec<BlockId> {
        self.inner.read().unwrap().ids.clone()
    }
}
