//! Transactional disk B+tree storage.
//!
//! Layers, bottom to top:
//!
//! - [`BlockStore`]: fixed-size buffers after a short header in any
//!   [`ByteStream`]
//! - [`ChunkHeap`]: variable-length byte strings as chains of buffers
//! - [`IndexTree`]: a B+tree from string keys to 64-bit values
//! - [`KeyedChunkStore`]: an index tree whose values are heap chunks
//!
//! Nothing is rewritten in place until commit, so the last committed state
//! always survives a crash. `recover` on the upper layers reclaims space a
//! crashed transaction left behind.
//!
//! # Usage
//!
//! ```
//! use bplus::storage::{KeyedChunkStore, MemoryStream, StoreOptions};
//!
//! let mut store = KeyedChunkStore::initialize(
//!     MemoryStream::new(),
//!     MemoryStream::new(),
//!     &StoreOptions::default(),
//! )?;
//! store.set("greeting", b"hello")?;
//! store.commit()?;
//! assert_eq!(store.get("greeting")?, Some(b"hello".to_vec()));
//! # Ok::<(), bplus::storage::StoreError>(())
//! ```

pub mod block_store;
pub mod btree;
pub mod chunk_heap;
mod codec;
mod io;
mod keyed;
mod kv;
mod memory;

pub use block_store::{BlockStore, BlockStoreError};
pub use btree::{Collation, IndexTree, TreeError, TreeRecovery};
pub use chunk_heap::{ChunkHeap, ChunkHeapError, HeapRecovery};
pub use codec::{BufferNumber, NULL_BUFFER};
pub use io::ByteStream;
pub use keyed::{
    DEFAULT_KEY_LENGTH, DEFAULT_NODE_SIZE, DEFAULT_PAYLOAD_SIZE, KeyedChunkStore, StoreError,
    StoreOptions, StoreRecovery,
};
pub use kv::KeyValueIndex;
pub use memory::{FaultConfig, MemoryStream, MemoryStreamStats};
