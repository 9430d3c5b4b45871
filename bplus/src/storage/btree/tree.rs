//! The index tree: string keys mapped to 64-bit values.
//!
//! # File Format
//!
//! ```text
//! seek_start
//! +-------+---------+-----------+-------------+-----------+------+-----------+---------+
//! | Magic | Version | Node Size | Key Storage | Collation | Root | Free Head | Buffers |
//! | (5)   | (1)     | (i32)     | (i32)       | (i32)     | (i64)| (i64)     | ...     |
//! +-------+---------+-----------+-------------+-----------+------+-----------+---------+
//! ```
//!
//! Key storage is the maximum key length plus its 2-byte length prefix.
//! Buffers follow in a block store whose block size is fixed by the node
//! layout (see [`node`](super::node)).
//!
//! # Transactions
//!
//! Nodes are never rewritten in place. A mutated node is written to a fresh
//! buffer and its old buffer is parked in one of two sets:
//!
//! - `free_on_commit`: buffers that were durable before this transaction and
//!   can be reused once the header points at the new root.
//! - `free_on_abort`: buffers allocated by this transaction, reclaimed if it
//!   is rolled back.
//!
//! A buffer allocated and then superseded within the same transaction is
//! freed immediately, so the two sets never overlap.

use std::collections::BTreeSet;

use super::arena::{NodeArena, NodeId, TerminalFifo};
use super::collation::Collation;
use super::node::{KEY_LENGTH_PREFIX, Node, NodeLayout, NodeTag};
use crate::storage::block_store::{BlockStore, BlockStoreError};
use crate::storage::codec::{Block, BufferNumber};
use crate::storage::io::ByteStream;

/// Magic prefix identifying a tree header: "bpNbp".
pub const MAGIC: [u8; 5] = *b"bpNbp";

/// Current format version.
pub const FORMAT_VERSION: u8 = 0;

/// Size of the tree header in bytes.
pub const HEADER_SIZE: usize = offsets::END;

/// Smallest fan-out accepted.
pub const MIN_NODE_SIZE: usize = 2;

/// Shortest maximum key length accepted.
pub const MIN_KEY_LENGTH: usize = 3;

/// Longest maximum key length representable by the slot length prefix.
pub const MAX_KEY_LENGTH: usize = 32_767;

/// Default cap on materialized terminal nodes.
pub const DEFAULT_FOOTPRINT_LIMIT: usize = 100;

/// Smallest footprint limit accepted.
pub const MIN_FOOTPRINT_LIMIT: usize = 5;

mod offsets {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 5;
    pub const NODE_SIZE: usize = 6;
    pub const KEY_STORAGE: usize = 10;
    pub const COLLATION: usize = 14;
    pub const ROOT: usize = 18;
    pub const FREE_LIST_HEAD: usize = 26;
    pub const END: usize = 34;
}

/// Decoded tree header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    layout: NodeLayout,
    collation: Collation,
    root: Option<BufferNumber>,
    free_head: Option<BufferNumber>,
}

impl Header {
    fn encode(&self) -> Result<Block, TreeError> {
        let node_size = i32::try_from(self.layout.node_size)
            .map_err(|_| TreeError::InvalidConfig("node size too large".to_string()))?;
        let key_storage = i32::try_from(self.layout.key_storage)
            .map_err(|_| TreeError::InvalidConfig("key length too large".to_string()))?;
        let mut block = Block::zeroed(HEADER_SIZE);
        block.write_bytes(offsets::MAGIC, &MAGIC);
        block.write_u8(offsets::VERSION, FORMAT_VERSION);
        block.write_i32(offsets::NODE_SIZE, node_size);
        block.write_i32(offsets::KEY_STORAGE, key_storage);
        block.write_i32(offsets::COLLATION, self.collation.id());
        block.write_pointer(offsets::ROOT, self.root);
        block.write_pointer(offsets::FREE_LIST_HEAD, self.free_head);
        Ok(block)
    }

    fn decode(block: &Block) -> Result<Self, TreeError> {
        if block.read_bytes(offsets::MAGIC, MAGIC.len()) != MAGIC {
            return Err(TreeError::InvalidHeader("bad magic prefix".to_string()));
        }
        let version = block.read_u8(offsets::VERSION);
        if version != FORMAT_VERSION {
            return Err(TreeError::InvalidHeader(format!("unsupported version {version}")));
        }
        let raw_node_size = block.read_i32(offsets::NODE_SIZE);
        let raw_key_storage = block.read_i32(offsets::KEY_STORAGE);
        let raw_collation = block.read_i32(offsets::COLLATION);
        let node_size = usize::try_from(raw_node_size).unwrap_or(0);
        let key_storage = usize::try_from(raw_key_storage).unwrap_or(0);
        if node_size < MIN_NODE_SIZE {
            return Err(TreeError::InvalidHeader(format!("node size {raw_node_size} too small")));
        }
        if key_storage < MIN_KEY_LENGTH + KEY_LENGTH_PREFIX
            || key_storage > MAX_KEY_LENGTH + KEY_LENGTH_PREFIX
        {
            return Err(TreeError::InvalidHeader(format!(
                "key storage {raw_key_storage} out of range"
            )));
        }
        let collation = Collation::try_from(raw_collation)
            .map_err(|id| TreeError::InvalidHeader(format!("unknown collation id {id}")))?;

        Ok(Self {
            layout: NodeLayout {
                node_size,
                key_storage,
            },
            collation,
            root: block.read_pointer(offsets::ROOT),
            free_head: block.read_pointer(offsets::FREE_LIST_HEAD),
        })
    }
}

/// A disk-resident B+tree with shadow-paged transactions.
#[derive(Debug)]
pub struct IndexTree<S> {
    pub(super) blocks: BlockStore<S>,
    seek_start: u64,
    pub(super) layout: NodeLayout,
    pub(super) collation: Collation,
    pub(super) arena: NodeArena,
    pub(super) terminals: TerminalFifo,
    pub(super) root: Option<NodeId>,
    pub(super) root_buffer: Option<BufferNumber>,
    pub(super) free_head: Option<BufferNumber>,
    pub(super) free_on_commit: BTreeSet<BufferNumber>,
    pub(super) free_on_abort: BTreeSet<BufferNumber>,
    footprint_limit: usize,
}

impl<S: ByteStream> IndexTree<S> {
    /// Create an empty tree at `seek_start` in `stream`.
    pub fn create(
        mut stream: S,
        seek_start: u64,
        max_key_length: usize,
        node_size: usize,
        collation: Collation,
    ) -> Result<Self, TreeError> {
        if node_size < MIN_NODE_SIZE {
            return Err(TreeError::InvalidConfig(format!(
                "node size {node_size} below minimum {MIN_NODE_SIZE}"
            )));
        }
        if !(MIN_KEY_LENGTH..=MAX_KEY_LENGTH).contains(&max_key_length) {
            return Err(TreeError::InvalidConfig(format!(
                "key length {max_key_length} outside {MIN_KEY_LENGTH}..={MAX_KEY_LENGTH}"
            )));
        }
        let header = Header {
            layout: NodeLayout {
                node_size,
                key_storage: max_key_length + KEY_LENGTH_PREFIX,
            },
            collation,
            root: None,
            free_head: None,
        };
        stream
            .write_at(seek_start, header.encode()?.as_bytes())
            .map_err(|e| TreeError::Block(BlockStoreError::Io(e)))?;
        let blocks = BlockStore::initialize(
            stream,
            header.layout.buffer_size(),
            seek_start + HEADER_SIZE as u64,
        )?;
        Ok(Self::assemble(blocks, seek_start, header))
    }

    /// Open an existing tree at `seek_start` in `stream`.
    pub fn open(mut stream: S, seek_start: u64) -> Result<Self, TreeError> {
        let mut block = Block::zeroed(HEADER_SIZE);
        let read = stream
            .read_at(seek_start, block.as_bytes_mut())
            .map_err(|e| TreeError::Block(BlockStoreError::Io(e)))?;
        if read < HEADER_SIZE {
            return Err(TreeError::InvalidHeader(format!(
                "stream too short for header ({read} bytes)"
            )));
        }
        let header = Header::decode(&block)?;
        let blocks = BlockStore::open(stream, seek_start + HEADER_SIZE as u64)?;
        if blocks.block_size() != header.layout.buffer_size() {
            return Err(TreeError::InvalidHeader(format!(
                "block size {} does not match node layout ({} expected)",
                blocks.block_size(),
                header.layout.buffer_size()
            )));
        }

        let mut tree = Self::assemble(blocks, seek_start, header);
        tree.load_root()?;
        Ok(tree)
    }

    fn assemble(blocks: BlockStore<S>, seek_start: u64, header: Header) -> Self {
        Self {
            blocks,
            seek_start,
            layout: header.layout,
            collation: header.collation,
            arena: NodeArena::default(),
            terminals: TerminalFifo::default(),
            root: None,
            root_buffer: header.root,
            free_head: header.free_head,
            free_on_commit: BTreeSet::new(),
            free_on_abort: BTreeSet::new(),
            footprint_limit: DEFAULT_FOOTPRINT_LIMIT,
        }
    }

    fn header(&self) -> Header {
        Header {
            layout: self.layout,
            collation: self.collation,
            root: self.root_buffer,
            free_head: self.free_head,
        }
    }

    fn write_header(&mut self) -> Result<(), TreeError> {
        let block = self.header().encode()?;
        let seek_start = self.seek_start;
        self.blocks
            .stream_mut()
            .write_at(seek_start, block.as_bytes())
            .map_err(|e| TreeError::Block(BlockStoreError::Io(e)))
    }

    fn read_header(&mut self) -> Result<Header, TreeError> {
        let mut block = Block::zeroed(HEADER_SIZE);
        let seek_start = self.seek_start;
        self.blocks
            .stream_mut()
            .read_padded(seek_start, block.as_bytes_mut())
            .map_err(|e| TreeError::Block(BlockStoreError::Io(e)))?;
        Header::decode(&block)
    }

    /// Drop every materialized node and reload the root from `root_buffer`.
    fn load_root(&mut self) -> Result<(), TreeError> {
        self.arena.clear();
        self.terminals.clear();
        self.root = None;
        if let Some(buffer) = self.root_buffer {
            let root = self.arena.insert(Node::new(self.layout.node_size, true));
            self.root = Some(root);
            self.load_node(root, buffer)?;
        }
        Ok(())
    }

    /// Longest key accepted, in UTF-8 bytes.
    #[must_use]
    pub const fn max_key_length(&self) -> usize {
        self.layout.max_key_length()
    }

    #[must_use]
    pub const fn node_size(&self) -> usize {
        self.layout.node_size
    }

    #[must_use]
    pub const fn collation(&self) -> Collation {
        self.collation
    }

    /// Compare two keys under this tree's collation.
    #[must_use]
    pub fn compare(&self, a: &str, b: &str) -> std::cmp::Ordering {
        self.collation.compare(a, b)
    }

    #[must_use]
    pub const fn footprint_limit(&self) -> usize {
        self.footprint_limit
    }

    /// Number of materialized nodes without materialized children.
    #[must_use]
    pub fn materialized_terminals(&self) -> usize {
        self.terminals.len()
    }

    /// Number of nodes currently held in memory.
    #[must_use]
    pub fn materialized_nodes(&self) -> usize {
        self.arena.len()
    }

    #[must_use]
    pub const fn free_list_head(&self) -> Option<BufferNumber> {
        self.free_head
    }

    /// Buffer of the root as of the last structural change.
    #[must_use]
    pub const fn root_buffer(&self) -> Option<BufferNumber> {
        self.root_buffer
    }

    /// First buffer number not yet backed by the stream.
    pub fn next_buffer_number(&mut self) -> Result<BufferNumber, TreeError> {
        Ok(self.blocks.next_buffer_number()?)
    }

    /// Cap the number of materialized terminal nodes.
    pub fn set_footprint_limit(&mut self, limit: usize) -> Result<(), TreeError> {
        if limit < MIN_FOOTPRINT_LIMIT {
            return Err(TreeError::InvalidConfig(format!(
                "footprint limit {limit} below minimum {MIN_FOOTPRINT_LIMIT}"
            )));
        }
        self.footprint_limit = limit;
        self.shrink_footprint()
    }

    pub(super) fn check_key(&self, key: &str) -> Result<(), TreeError> {
        if self.layout.key_fits(key) {
            Ok(())
        } else {
            Err(TreeError::BadKeyValue(format!(
                "key of {} bytes exceeds maximum {}",
                key.len(),
                self.max_key_length()
            )))
        }
    }

    /// Value stored under `key`, if any.
    pub fn get(&mut self, key: &str) -> Result<Option<u64>, TreeError> {
        let found = self.find_match(key)?;
        self.shrink_footprint()?;
        Ok(found)
    }

    /// Value stored under `key`, or `default`.
    pub fn get_or(&mut self, key: &str, default: u64) -> Result<u64, TreeError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Value stored under `key`, failing if it is absent.
    pub fn value(&mut self, key: &str) -> Result<u64, TreeError> {
        self.get(key)?
            .ok_or_else(|| TreeError::KeyMissing(key.to_string()))
    }

    pub fn contains_key(&mut self, key: &str) -> Result<bool, TreeError> {
        Ok(self.get(key)?.is_some())
    }

    /// Map `key` to `value`, replacing any previous value.
    pub fn set(&mut self, key: &str, value: u64) -> Result<(), TreeError> {
        self.check_key(key)?;
        let mut new_root = false;
        let root = match self.root {
            Some(root) => root,
            None => {
                new_root = true;
                let root = self.arena.insert(Node::new(self.layout.node_size, true));
                self.root = Some(root);
                root
            }
        };

        if let Some((split_key, split_node)) = self.insert(root, key, value)? {
            new_root = true;
            self.binary_root(root, split_key, split_node);
        }
        if new_root {
            let root = self.root_id()?;
            self.root_buffer = Some(self.dump_to_fresh_buffer(root)?);
        }
        self.shrink_footprint()
    }

    /// Remove `key`, failing if it is absent.
    pub fn remove_key(&mut self, key: &str) -> Result<(), TreeError> {
        let Some(root) = self.root else {
            return Err(TreeError::KeyMissing(key.to_string()));
        };
        let (_, merge_root) = self.delete(root, key)?;
        if merge_root && !self.arena[root].is_leaf && self.arena[root].size_in_use() == 0 {
            let child = self.materialize_child(root, 0)?;
            self.make_root(child)?;
            self.free_node(root)?;
        }
        self.shrink_footprint()
    }

    /// Smallest key in the tree.
    pub fn first_key(&mut self) -> Result<Option<String>, TreeError> {
        if self.root.is_none() {
            return Ok(None);
        }
        let first = if self.find_match("")?.is_some() {
            Some(String::new())
        } else {
            self.find_next_key("")?
        };
        self.shrink_footprint()?;
        Ok(first)
    }

    /// Smallest key strictly after `after`.
    pub fn next_key(&mut self, after: &str) -> Result<Option<String>, TreeError> {
        if self.root.is_none() {
            return Ok(None);
        }
        let next = self.find_next_key(after)?;
        self.shrink_footprint()?;
        Ok(next)
    }

    /// Make every change since the last commit durable.
    pub fn commit(&mut self) -> Result<(), TreeError> {
        if let Some(root) = self.root {
            self.root_buffer = Some(self.invalidate(root, false)?);
        }
        self.blocks.flush()?;
        self.write_header()?;
        self.blocks.flush()?;

        let reclaimed = self.free_on_commit.len();
        for buffer in std::mem::take(&mut self.free_on_commit).into_iter().rev() {
            self.deallocate_buffer(buffer)?;
        }
        self.write_header()?;
        self.blocks.flush()?;
        self.reset_bookkeeping();
        tracing::debug!(
            "tree committed: root {:?}, {reclaimed} buffers reclaimed",
            self.root_buffer
        );
        Ok(())
    }

    /// Discard every change since the last commit.
    pub fn abort(&mut self) -> Result<(), TreeError> {
        let reclaimed = self.free_on_abort.len();
        for buffer in std::mem::take(&mut self.free_on_abort).into_iter().rev() {
            self.deallocate_buffer(buffer)?;
        }
        let free_head = self.free_head;
        let header = self.read_header()?;
        self.root_buffer = header.root;
        self.load_root()?;
        self.reset_bookkeeping();
        self.free_head = free_head;
        self.write_header()?;
        self.blocks.flush()?;
        tracing::debug!("tree aborted: {reclaimed} buffers reclaimed");
        Ok(())
    }

    /// Flush and hand back the underlying stream.
    ///
    /// Uncommitted changes are not written.
    pub fn shutdown(mut self) -> Result<S, TreeError> {
        self.blocks.flush()?;
        Ok(self.blocks.into_inner())
    }

    fn reset_bookkeeping(&mut self) {
        self.free_on_commit.clear();
        self.free_on_abort.clear();
        self.terminals.clear();
    }

    pub(super) fn root_id(&self) -> Result<NodeId, TreeError> {
        self.root
            .ok_or_else(|| TreeError::Corruption("tree has no root".to_string()))
    }

    // Buffer allocation.

    pub(super) fn allocate_buffer(&mut self) -> Result<BufferNumber, TreeError> {
        match self.free_head {
            Some(head) => {
                self.free_head = self.parse_free_buffer(head)?;
                Ok(head)
            }
            None => Ok(self.blocks.next_buffer_number()?),
        }
    }

    /// Next pointer of a free buffer, failing if it is not marked free.
    pub(super) fn parse_free_buffer(
        &mut self,
        buffer: BufferNumber,
    ) -> Result<Option<BufferNumber>, TreeError> {
        let mut block = Block::zeroed(9);
        self.blocks.read(buffer, block.as_bytes_mut())?;
        if block.read_u8(0) != NodeTag::Free as u8 {
            return Err(TreeError::Corruption(format!(
                "free list buffer {buffer} is not marked free"
            )));
        }
        Ok(block.read_pointer(1))
    }

    pub(super) fn deallocate_buffer(&mut self, buffer: BufferNumber) -> Result<(), TreeError> {
        let mut tag = [0u8; 1];
        self.blocks.read(buffer, &mut tag)?;
        if tag[0] == NodeTag::Free as u8 {
            return Err(TreeError::Corruption(format!(
                "attempt to free buffer {buffer} twice"
            )));
        }
        self.push_free_buffer(buffer)
    }

    /// Put `buffer` at the head of the free list without checking its tag.
    pub(super) fn push_free_buffer(&mut self, buffer: BufferNumber) -> Result<(), TreeError> {
        let mut block = Block::zeroed(9);
        block.write_u8(0, NodeTag::Free as u8);
        block.write_pointer(1, self.free_head);
        self.blocks.write(buffer, block.as_bytes())?;
        self.free_head = Some(buffer);
        Ok(())
    }

    /// Retire a buffer superseded in this transaction.
    pub(super) fn defer_release(&mut self, buffer: BufferNumber) -> Result<(), TreeError> {
        if self.free_on_abort.remove(&buffer) {
            self.deallocate_buffer(buffer)
        } else {
            self.free_on_commit.insert(buffer);
            Ok(())
        }
    }

    // Node I/O.

    /// Replace the contents of `id` with the node stored in `buffer`.
    pub(super) fn load_node(&mut self, id: NodeId, buffer: BufferNumber) -> Result<(), TreeError> {
        let mut block = Block::zeroed(self.layout.buffer_size());
        self.blocks.read(buffer, block.as_bytes_mut())?;
        let layout = self.layout;
        let node = &mut self.arena[id];
        layout.decode(&block, node)?;
        node.dirty = false;
        node.buffer = Some(buffer);
        self.record_terminal(id);
        Ok(())
    }

    pub(super) fn dump_to_buffer(
        &mut self,
        id: NodeId,
        buffer: BufferNumber,
    ) -> Result<(), TreeError> {
        let block = self.layout.encode(&self.arena[id])?;
        self.blocks.write(buffer, block.as_bytes())?;
        let node = &mut self.arena[id];
        node.dirty = false;
        node.buffer = Some(buffer);
        if let (Some(parent), Some(index)) = (node.parent, node.index_in_parent) {
            if self.arena[parent].pointers[index] != buffer {
                if self.arena[parent].children[index] != Some(id) {
                    return Err(TreeError::Corruption(format!(
                        "node at buffer {buffer} is not child {index} of its parent"
                    )));
                }
                self.arena[parent].pointers[index] = buffer;
                self.soil(parent);
            }
        }
        Ok(())
    }

    /// Write `id` to a newly allocated buffer and retire its old one.
    pub(super) fn dump_to_fresh_buffer(&mut self, id: NodeId) -> Result<BufferNumber, TreeError> {
        let old = self.arena[id].buffer;
        let fresh = self.allocate_buffer()?;
        self.dump_to_buffer(id, fresh)?;
        if let Some(old) = old {
            self.defer_release(old)?;
        }
        self.free_on_abort.insert(fresh);
        Ok(fresh)
    }

    // Footprint.

    pub(super) fn record_terminal(&mut self, id: NodeId) {
        if self.root != Some(id) {
            self.terminals.record(id);
        }
    }

    pub(super) fn forget_terminal(&mut self, id: NodeId) {
        self.terminals.forget(id);
    }

    /// Evict the oldest terminal nodes until the limit holds.
    pub(super) fn shrink_footprint(&mut self) -> Result<(), TreeError> {
        while self.terminals.len() > self.footprint_limit {
            let Some(victim) = self.terminals.pop_oldest() else {
                break;
            };
            if self.arena[victim].buffer.is_some() {
                self.invalidate(victim, true)?;
            }
        }
        Ok(())
    }
}

/// Errors from index tree operations.
#[derive(Debug)]
pub enum TreeError {
    /// Error from the underlying block store.
    Block(BlockStoreError),
    /// Header is missing or malformed.
    InvalidHeader(String),
    /// Creation or tuning parameter out of range.
    InvalidConfig(String),
    /// Key is not in the tree.
    KeyMissing(String),
    /// Key cannot be stored in this tree.
    BadKeyValue(String),
    /// Structural inconsistency in the tree.
    Corruption(String),
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block(e) => write!(f, "block store error: {e}"),
            Self::InvalidHeader(msg) => write!(f, "invalid tree header: {msg}"),
            Self::InvalidConfig(msg) => write!(f, "invalid tree configuration: {msg}"),
            Self::KeyMissing(key) => write!(f, "key not found: {key:?}"),
            Self::BadKeyValue(msg) => write!(f, "bad key: {msg}"),
            Self::Corruption(msg) => write!(f, "tree corruption: {msg}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Block(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BlockStoreError> for TreeError {
    fn from(e: BlockStoreError) -> Self {
        Self::Block(e)
    }
}
