//! Mirra store: indexed cache, coalescing delta FIFO and the reconciliation
//! loop that replays one into the other.

#![forbid(unsafe_code)]

pub mod cache;
pub mod controller;
pub mod fifo;
pub mod index;
pub mod reflector;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{Cache, KnownObjects};
pub use controller::{new_indexer_informer, process_deltas, Controller};
pub use fifo::{DeltaFifo, DeltaFifoOptions};
pub use index::ThreadSafeStore;
pub use reflector::Reflector;
