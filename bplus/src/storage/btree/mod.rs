//! Disk-resident B+tree mapping string keys to 64-bit values.
//!
//! Nodes live in fixed-size buffers of a [`BlockStore`](super::BlockStore)
//! and are loaded on demand into an arena. Changes are shadow-paged: a
//! modified node is always written to a fresh buffer, and the header is
//! rewritten only on commit, so a crash leaves the last committed tree
//! intact.
//!
//! # Usage
//!
//! ```
//! use bplus::storage::MemoryStream;
//! use bplus::storage::btree::{Collation, IndexTree};
//!
//! let mut tree = IndexTree::create(MemoryStream::new(), 0, 32, 8, Collation::Ordinal)?;
//! tree.set("apple", 1)?;
//! tree.set("banana", 2)?;
//! tree.commit()?;
//!
//! assert_eq!(tree.get("apple")?, Some(1));
//! assert_eq!(tree.next_key("apple")?, Some("banana".to_string()));
//! # Ok::<(), bplus::storage::btree::TreeError>(())
//! ```

mod arena;
mod collation;
mod node;
mod ops;
mod recovery;
mod tree;

pub use collation::Collation;
pub use node::NodeTag;
pub use recovery::TreeRecovery;
pub use tree::{
    DEFAULT_FOOTPRINT_LIMIT, IndexTree, MAX_KEY_LENGTH, MIN_FOOTPRINT_LIMIT, MIN_KEY_LENGTH,
    MIN_NODE_SIZE, TreeError,
};
