//! A crate fetching whole content-addressed DAGs from a peer-to-peer network, from many peers at once.
//!
//! Starting from an already known root node, a fetch spreads the wanted blocks over every peer found to provide the
//! root, each peer getting its own worker:
//! - blocks are claimed through a shared registry, keeping `Empty` → `Pending` → `Filled` block states, so that
//!   peers rather request disjoint batches,
//! - each worker orders its candidates by an XOR distance specific to its peer, so that concurrent workers start from
//!   different ends of the wanted set,
//! - each worker tunes its own batch width and timeout from the hit ratio and the efficiency of its past rounds,
//! - providers are discovered both network-wide and from the peers already worked with.
//!
//! Every decoded node is handed to a caller-supplied [`Visitor`](net::Visitor) exactly once, however many peers
//! delivered its block. It obviously makes use of both synchronous and asynchronous synchronization primitives:
//! `RwLock`s over the block and worker sets, `atomic` flags and counters, _multi-producer single-consumer_ channels
//! for provider discovery and worker notifications, and a cancellable task scope holding every task of a fetch.
//!
//! As a **strong hypothesis**, we can assume that:
//! - the root node is **already fetched** and decoded by the caller;
//! - block ids are **content-derived**, a given id always designating the same bytes.
//!
//! Network collaborators (routing, block transport and node decoding) are expressed as traits in the [`net`] module;
//! an in-memory implementation is provided by the [`mem`] module.

mod data;
pub use data::*;

pub mod adjust;
pub mod config;
pub mod dispatch;
pub mod mem;
pub mod monitor;
pub mod net;
pub mod task;

mod discovery;
mod error;
mod worker;

pub use dispatch::{fetch, Dispatcher};
pub use error::{AllocateError, BoxError, DecodeError, Error, NetError};
