//! Chunk records, the dense chunk-ID allocator, the chunk store, and the
//! free-set histogram: the bookkeeping layer the page allocator sits on
//! top of.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod chunk;
mod chunk_id;
mod free_set;
mod store;

pub use chunk::{Chunk, ChunkMapping};
pub use chunk_id::ChunkIdAllocator;
pub use free_set::{FreeSet, Pool};
pub use store::ChunkStore;
