//! String-keyed byte-string store.
//!
//! An [`IndexTree`] maps each key to the head buffer of a chunk in a
//! [`ChunkHeap`]. A chunk is never rewritten: setting a key stores a new
//! chunk and retires the old one with the same commit/abort bookkeeping
//! the tree uses for its buffers.
//!
//! On commit the heap is flushed before the tree header is rewritten, so a
//! committed key never points at a chunk that is not yet durable. Chunks
//! superseded by the transaction are released only after the tree commit.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::path::Path;

use crate::storage::btree::{Collation, IndexTree, TreeError, TreeRecovery};
use crate::storage::chunk_heap::{ChunkHeap, ChunkHeapError, HeapRecovery};
use crate::storage::codec::BufferNumber;
use crate::storage::io::ByteStream;

/// Default tree fan-out.
pub const DEFAULT_NODE_SIZE: usize = 32;

/// Default heap payload size per buffer.
pub const DEFAULT_PAYLOAD_SIZE: usize = 1024;

/// Default maximum key length in UTF-8 bytes.
pub const DEFAULT_KEY_LENGTH: usize = 64;

/// Parameters fixed when a store is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub max_key_length: usize,
    pub node_size: usize,
    pub payload_size: usize,
    pub collation: Collation,
}

impl StoreOptions {
    /// Defaults with the given maximum key length.
    #[must_use]
    pub fn with_key_length(max_key_length: usize) -> Self {
        Self {
            max_key_length,
            ..Self::default()
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_key_length: DEFAULT_KEY_LENGTH,
            node_size: DEFAULT_NODE_SIZE,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            collation: Collation::default(),
        }
    }
}

/// Combined result of checking both halves of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRecovery {
    pub tree: TreeRecovery,
    pub heap: HeapRecovery,
    /// Keys found in the tree.
    pub keys: usize,
}

/// A transactional map from strings to byte strings.
#[derive(Debug)]
pub struct KeyedChunkStore<S> {
    tree: IndexTree<S>,
    heap: ChunkHeap<S>,
    free_on_commit: BTreeSet<BufferNumber>,
    free_on_abort: BTreeSet<BufferNumber>,
}

impl<S: ByteStream> KeyedChunkStore<S> {
    /// Create an empty store over two fresh streams.
    pub fn initialize(
        index_stream: S,
        heap_stream: S,
        options: &StoreOptions,
    ) -> Result<Self, StoreError> {
        let tree = IndexTree::create(
            index_stream,
            0,
            options.max_key_length,
            options.node_size,
            options.collation,
        )?;
        let heap = ChunkHeap::initialize(heap_stream, options.payload_size, 0)?;
        Ok(Self::from_parts(tree, heap))
    }

    /// Open a store previously created with [`initialize`](Self::initialize).
    pub fn open(index_stream: S, heap_stream: S) -> Result<Self, StoreError> {
        let tree = IndexTree::open(index_stream, 0)?;
        let heap = ChunkHeap::open(heap_stream, 0)?;
        Ok(Self::from_parts(tree, heap))
    }

    const fn from_parts(tree: IndexTree<S>, heap: ChunkHeap<S>) -> Self {
        Self {
            tree,
            heap,
            free_on_commit: BTreeSet::new(),
            free_on_abort: BTreeSet::new(),
        }
    }

    #[must_use]
    pub const fn max_key_length(&self) -> usize {
        self.tree.max_key_length()
    }

    #[must_use]
    pub fn compare(&self, a: &str, b: &str) -> std::cmp::Ordering {
        self.tree.compare(a, b)
    }

    #[must_use]
    pub const fn collation(&self) -> Collation {
        self.tree.collation()
    }

    pub fn set_footprint_limit(&mut self, limit: usize) -> Result<(), StoreError> {
        Ok(self.tree.set_footprint_limit(limit)?)
    }

    /// Bytes stored under `key`, if any.
    pub fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.tree.get(key)? {
            Some(chunk) => Ok(Some(self.heap.get_chunk(chunk)?)),
            None => Ok(None),
        }
    }

    /// Bytes stored under `key`, failing if it is absent.
    pub fn value(&mut self, key: &str) -> Result<Vec<u8>, StoreError> {
        let chunk = self.tree.value(key)?;
        Ok(self.heap.get_chunk(chunk)?)
    }

    pub fn contains_key(&mut self, key: &str) -> Result<bool, StoreError> {
        Ok(self.tree.contains_key(key)?)
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if key.len() > self.max_key_length() {
            return Err(StoreError::Tree(TreeError::BadKeyValue(format!(
                "key of {} bytes exceeds maximum {}",
                key.len(),
                self.max_key_length()
            ))));
        }
        let chunk = self.heap.store_new_chunk(value)?;
        self.free_on_abort.insert(chunk);
        if let Some(previous) = self.tree.get(key)? {
            self.retire_chunk(previous)?;
        }
        self.tree.set(key, chunk)?;
        Ok(())
    }

    /// Remove `key`, failing if it is absent.
    pub fn remove_key(&mut self, key: &str) -> Result<(), StoreError> {
        let chunk = self.tree.value(key)?;
        self.retire_chunk(chunk)?;
        self.tree.remove_key(key)?;
        Ok(())
    }

    pub fn first_key(&mut self) -> Result<Option<String>, StoreError> {
        Ok(self.tree.first_key()?)
    }

    pub fn next_key(&mut self, after: &str) -> Result<Option<String>, StoreError> {
        Ok(self.tree.next_key(after)?)
    }

    /// Release a superseded chunk now if this transaction created it,
    /// otherwise once the transaction commits.
    fn retire_chunk(&mut self, chunk: BufferNumber) -> Result<(), StoreError> {
        if self.free_on_abort.remove(&chunk) {
            self.heap.release_buffers(chunk)?;
        } else {
            self.free_on_commit.insert(chunk);
        }
        Ok(())
    }

    /// Make every change since the last commit durable.
    pub fn commit(&mut self) -> Result<(), StoreError> {
        self.heap.flush()?;
        self.tree.commit()?;
        let released = self.free_on_commit.len();
        for chunk in std::mem::take(&mut self.free_on_commit).into_iter().rev() {
            self.heap.release_buffers(chunk)?;
        }
        self.heap.flush()?;
        self.free_on_abort.clear();
        tracing::debug!("store committed: {released} chunks released");
        Ok(())
    }

    /// Discard every change since the last commit.
    pub fn abort(&mut self) -> Result<(), StoreError> {
        let released = self.free_on_abort.len();
        for chunk in std::mem::take(&mut self.free_on_abort).into_iter().rev() {
            self.heap.release_buffers(chunk)?;
        }
        self.tree.abort()?;
        self.heap.flush()?;
        self.free_on_commit.clear();
        tracing::debug!("store aborted: {released} chunks released");
        Ok(())
    }

    /// Check the tree, then check the heap against the chunks the tree uses.
    ///
    /// With `fix_errors` set, unreachable tree buffers and unreferenced
    /// chunks are reclaimed. Every key must own a distinct chunk that the
    /// heap can produce; that is never repaired.
    pub fn recover(&mut self, fix_errors: bool) -> Result<StoreRecovery, StoreError> {
        let tree = self.tree.recover(fix_errors)?;

        let mut in_use: HashMap<BufferNumber, String> = HashMap::new();
        let mut keys = 0;
        let mut cursor = self.tree.first_key()?;
        while let Some(key) = cursor {
            let chunk = self.tree.value(&key)?;
            if let Some(other) = in_use.get(&chunk) {
                return Err(StoreError::Corruption(format!(
                    "chunk {chunk} shared by keys {other:?} and {key:?}"
                )));
            }
            cursor = self.tree.next_key(&key)?;
            in_use.insert(chunk, key);
            keys += 1;
        }
        for &chunk in &self.free_on_commit {
            in_use.insert(chunk, "awaiting commit".to_string());
        }

        let heap = self.heap.recover(Some(&in_use), fix_errors)?;
        tracing::info!(
            keys,
            chunks = heap.chunks,
            released = heap.released_chunks.len(),
            "store check complete"
        );
        Ok(StoreRecovery { tree, heap, keys })
    }

    /// Flush both halves and hand back `(index_stream, heap_stream)`.
    ///
    /// Uncommitted changes are not made durable.
    pub fn shutdown(self) -> Result<(S, S), StoreError> {
        let index = self.tree.shutdown()?;
        let heap = self.heap.shutdown()?;
        Ok((index, heap))
    }
}

impl KeyedChunkStore<File> {
    /// Create both files; fails if either already exists.
    pub fn create(
        index_path: &Path,
        heap_path: &Path,
        options: &StoreOptions,
    ) -> Result<Self, StoreError> {
        let index = File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(index_path)?;
        let heap = File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(heap_path)?;
        Self::initialize(index, heap, options)
    }

    /// Open both files for reading and writing.
    pub fn open_files(index_path: &Path, heap_path: &Path) -> Result<Self, StoreError> {
        let index = File::options().read(true).write(true).open(index_path)?;
        let heap = File::options().read(true).write(true).open(heap_path)?;
        Self::open(index, heap)
    }

    /// Open both files without write access. Any mutation fails with an
    /// I/O error.
    pub fn open_read_only(index_path: &Path, heap_path: &Path) -> Result<Self, StoreError> {
        Self::open(File::open(index_path)?, File::open(heap_path)?)
    }

    /// Open the pair, creating it when the index file does not exist yet.
    pub fn open_or_create(
        index_path: &Path,
        heap_path: &Path,
        options: &StoreOptions,
    ) -> Result<Self, StoreError> {
        if index_path.exists() {
            Self::open_files(index_path, heap_path)
        } else {
            Self::create(index_path, heap_path, options)
        }
    }
}

/// Errors from keyed store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Error opening the backing files.
    Io(std::io::Error),
    /// Error from the index tree.
    Tree(TreeError),
    /// Error from the chunk heap.
    Heap(ChunkHeapError),
    /// The tree and heap disagree.
    Corruption(String),
}

impl StoreError {
    /// Whether this is a lookup or removal of an absent key.
    #[must_use]
    pub const fn is_key_missing(&self) -> bool {
        matches!(self, Self::Tree(TreeError::KeyMissing(_)))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Tree(e) => write!(f, "index error: {e}"),
            Self::Heap(e) => write!(f, "heap error: {e}"),
            Self::Corruption(msg) => write!(f, "store corruption: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Tree(e) => Some(e),
            Self::Heap(e) => Some(e),
            Self::Corruption(_) => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<TreeError> for StoreError {
    fn from(e: TreeError) -> Self {
        Self::Tree(e)
    }
}

impl From<ChunkHeapError> for StoreError {
    fn from(e: ChunkHeapError) -> Self {
        Self::Heap(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::MIN_FOOTPRINT_LIMIT;
    use crate::storage::memory::{FaultConfig, MemoryStream};
    use tempfile::tempdir;

    fn small_options() -> StoreOptions {
        StoreOptions {
            max_key_length: 16,
            node_size: 4,
            payload_size: 32,
            collation: Collation::Ordinal,
        }
    }

    fn memory_store() -> KeyedChunkStore<MemoryStream> {
        KeyedChunkStore::initialize(MemoryStream::new(), MemoryStream::new(), &small_options())
            .expect("initialize store")
    }

    fn payload(i: usize) -> Vec<u8> {
        format!("value-{i}-").repeat(i % 12 + 1).into_bytes()
    }

    #[test]
    fn test_set_get_remove() {
        let mut store = memory_store();
        store.set("alpha", b"first").expect("set");
        store.set("beta", &payload(11)).expect("set");
        store.set("empty", b"").expect("set");

        assert_eq!(store.get("alpha").expect("get"), Some(b"first".to_vec()));
        assert_eq!(store.value("beta").expect("value"), payload(11));
        assert_eq!(store.get("empty").expect("get"), Some(Vec::new()));
        assert_eq!(store.get("gamma").expect("get"), None);
        assert!(store.value("gamma").expect_err("missing").is_key_missing());

        store.remove_key("alpha").expect("remove");
        assert!(!store.contains_key("alpha").expect("contains"));
        assert!(store.remove_key("alpha").expect_err("missing").is_key_missing());
        assert_eq!(store.first_key().expect("first key"), Some("beta".to_string()));
        assert_eq!(store.next_key("beta").expect("next"), Some("empty".to_string()));
    }

    #[test]
    fn test_rejected_key_leaves_heap_untouched() {
        let mut store = memory_store();
        store.set("k", b"v").expect("set");
        store.commit().expect("commit");
        let before = store.heap.next_buffer_number().expect("next buffer");

        let result = store.set(&"x".repeat(17), &payload(5));
        assert!(matches!(
            result,
            Err(StoreError::Tree(TreeError::BadKeyValue(_)))
        ));
        assert_eq!(store.heap.next_buffer_number().expect("next buffer"), before);
        store.recover(false).expect("recover");
    }

    #[test]
    fn test_overwrite_within_transaction_releases_immediately() {
        let mut store = memory_store();
        store.set("k", &payload(3)).expect("set");
        let first_chunk = store.tree.value("k").expect("chunk");
        store.set("k", &payload(4)).expect("overwrite");

        assert!(!store.free_on_abort.contains(&first_chunk));
        assert!(store.free_on_commit.is_empty());
        assert_eq!(store.value("k").expect("value"), payload(4));
        store.commit().expect("commit");
        store.recover(false).expect("recover");
    }

    #[test]
    fn test_commit_then_abort() {
        let mut store = memory_store();
        for i in 0..30 {
            store.set(&format!("key{i:02}"), &payload(i)).expect("set");
        }
        store.commit().expect("commit");

        store.set("key05", b"changed").expect("set");
        store.remove_key("key06").expect("remove");
        store.set("extra", &payload(40)).expect("set");
        store.abort().expect("abort");

        assert_eq!(store.value("key05").expect("value"), payload(5));
        assert_eq!(store.value("key06").expect("value"), payload(6));
        assert!(!store.contains_key("extra").expect("contains"));
        let report = store.recover(false).expect("recover");
        assert_eq!(report.keys, 30);
    }

    #[test]
    fn test_superseded_chunks_are_reused_after_commit() {
        let mut store = memory_store();
        for i in 0..10 {
            store.set(&format!("key{i}"), &payload(i)).expect("set");
        }
        store.commit().expect("commit");

        let mut sizes = Vec::new();
        for _ in 0..4 {
            for i in 0..10 {
                store.set(&format!("key{i}"), &payload(i + 12)).expect("overwrite");
            }
            store.commit().expect("commit");
            sizes.push(store.heap.next_buffer_number().expect("next buffer"));
        }
        // Once a full round has been released, later rounds fit in it.
        assert_eq!(sizes[1], sizes[2]);
        assert_eq!(sizes[2], sizes[3]);
        store.recover(false).expect("recover");
    }

    #[test]
    fn test_recover_releases_chunks_of_crashed_transaction() {
        let mut store = memory_store();
        for i in 0..20 {
            store.set(&format!("key{i:02}"), &payload(i)).expect("set");
        }
        store.commit().expect("commit");
        for i in 20..40 {
            store.set(&format!("key{i:02}"), &payload(i)).expect("set");
        }
        let (index, heap) = store.shutdown().expect("shutdown");

        let mut store = KeyedChunkStore::open(index, heap).expect("reopen");
        assert!(store.recover(false).is_err());
        let report = store.recover(true).expect("repair");
        assert_eq!(report.keys, 20);
        assert!(!report.heap.released_chunks.is_empty());
        store.commit().expect("commit");
        store.recover(false).expect("clean after repair");
        for i in 0..20 {
            assert_eq!(store.value(&format!("key{i:02}")).expect("value"), payload(i));
        }
    }

    #[test]
    fn test_torn_writes_before_commit_are_repaired() {
        let mut store = memory_store();
        for i in 0..20 {
            store.set(&format!("key{i:02}"), &payload(i)).expect("set");
        }
        store.commit().expect("commit");
        let (mut index, mut heap) = store.shutdown().expect("shutdown");

        let torn = FaultConfig {
            torn_write_rate: 0.2,
            ..FaultConfig::none()
        };
        index.set_fault_config(torn.clone());
        heap.set_fault_config(torn);
        let mut store = KeyedChunkStore::open(index, heap).expect("reopen");
        store
            .set_footprint_limit(MIN_FOOTPRINT_LIMIT)
            .expect("set limit");
        // A torn buffer read back mid-transaction may fail; the process
        // is considered dead at that point.
        for i in 0..60 {
            let result = if i % 3 == 0 {
                store.set(&format!("key{:02}", i % 20), &payload(i + 20))
            } else {
                store.set(&format!("new{i:02}"), &payload(i))
            };
            if result.is_err() {
                break;
            }
        }
        let (index, heap) = store.shutdown().expect("shutdown");

        let mut store =
            KeyedChunkStore::open(index.snapshot(), heap.snapshot()).expect("reopen after crash");
        let report = store.recover(true).expect("repair");
        assert_eq!(report.keys, 20);
        store.commit().expect("commit");
        store.recover(false).expect("clean after repair");
        for i in 0..20 {
            assert_eq!(store.value(&format!("key{i:02}")).expect("value"), payload(i));
        }
        assert_eq!(store.get("new01").expect("get"), None);

        store.set("after", b"crash").expect("set");
        store.commit().expect("commit");
        let (index, heap) = store.shutdown().expect("shutdown");
        let mut store = KeyedChunkStore::open(index, heap).expect("reopen");
        store.recover(false).expect("clean after reopen");
        assert_eq!(store.value("after").expect("value"), b"crash");
    }

    #[test]
    fn test_file_backed_round_trip() {
        let dir = tempdir().expect("create temp dir");
        let index_path = dir.path().join("index.bpt");
        let heap_path = dir.path().join("heap.bpt");

        {
            let mut store =
                KeyedChunkStore::create(&index_path, &heap_path, &StoreOptions::default())
                    .expect("create store");
            store.set("hello", b"world").expect("set");
            store.set("Hello", b"again").expect("set");
            store.commit().expect("commit");
            store.shutdown().expect("shutdown");
        }
        assert!(matches!(
            KeyedChunkStore::create(&index_path, &heap_path, &StoreOptions::default()),
            Err(StoreError::Io(_))
        ));

        {
            let mut store =
                KeyedChunkStore::open_files(&index_path, &heap_path).expect("open store");
            assert_eq!(store.collation(), Collation::Invariant);
            assert_eq!(store.value("hello").expect("value"), b"world");
            assert_eq!(store.first_key().expect("first key"), Some("Hello".to_string()));
            store.recover(false).expect("recover");
        }

        let mut store =
            KeyedChunkStore::open_read_only(&index_path, &heap_path).expect("open read-only");
        assert_eq!(store.value("Hello").expect("value"), b"again");
        store.set("new", b"value").expect_err("read-only store rejects writes");
    }
}
