//! Variable-length chunk storage as linked buffer chains.
//!
//! A chunk is an opaque byte string spread over a HEAD buffer and zero or
//! more BODY buffers. Released buffers go onto a LIFO free list whose head
//! lives in the heap header.
//!
//! # File Format
//!
//! ```text
//! seek_start
//! +-----------+---------+--------------+----------------+--------------------+
//! | Magic     | Version | Payload Size | Free List Head | Block store ...    |
//! | (5 bytes) | (1)     | (i32)        | (i64, -1=none) | (block = payload+9) |
//! +-----------+---------+--------------+----------------+--------------------+
//! ```
//!
//! Each buffer:
//!
//! ```text
//! +-----------+----------------+----------------------------------+
//! | Kind (1)  | Next (i64)     | Payload (payload size bytes)     |
//! +-----------+----------------+----------------------------------+
//! ```
//!
//! A HEAD payload starts with the chunk's total length as an i32.

use std::collections::{HashMap, HashSet};

use crate::storage::block_store::{BlockStore, BlockStoreError};
use crate::storage::codec::{Block, BufferNumber};
use crate::storage::io::ByteStream;

/// Magic prefix identifying a chunk heap header: "bpNlf".
pub const MAGIC: [u8; 5] = *b"bpNlf";

/// Current format version.
pub const FORMAT_VERSION: u8 = 0;

/// Smallest payload size accepted.
pub const MIN_PAYLOAD_SIZE: usize = 20;

/// Bytes each buffer spends on its kind tag and next pointer.
pub const BUFFER_OVERHEAD: usize = 9;

/// Size of the heap header in bytes.
pub const HEADER_SIZE: usize = offsets::END;

/// Size of the total-length prefix in a HEAD payload.
const LENGTH_PREFIX: usize = 4;

mod offsets {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 5;
    pub const PAYLOAD_SIZE: usize = 6;
    pub const FREE_LIST_HEAD: usize = 10;
    pub const END: usize = 18;
}

mod buffer_offsets {
    pub const KIND: usize = 0;
    pub const NEXT: usize = 1;
    pub const PAYLOAD: usize = 9;
}

/// Role of a heap buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferKind {
    Free = 0,
    Head = 1,
    Body = 2,
}

impl TryFrom<u8> for BufferKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Free),
            1 => Ok(Self::Head),
            2 => Ok(Self::Body),
            _ => Err(value),
        }
    }
}

/// Outcome of a structural scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapRecovery {
    /// Buffers present in the file.
    pub buffers: u64,
    /// Well-formed chunks that are kept.
    pub chunks: usize,
    /// Chunks released because nobody references them.
    pub released_chunks: Vec<BufferNumber>,
    /// Whether the free list had to be rebuilt from scratch.
    pub rebuilt_free_list: bool,
}

/// Per-buffer facts gathered by a scan.
#[derive(Debug, Clone, Copy)]
struct ScanEntry {
    kind: Option<BufferKind>,
    next: Option<BufferNumber>,
    length: i32,
}

/// Everything a scan learned about the heap.
struct HeapScan {
    problems: Vec<String>,
    live: Vec<bool>,
    chunks: Vec<(BufferNumber, Vec<BufferNumber>)>,
    orphans: Vec<BufferNumber>,
    missing: Vec<String>,
}

/// A heap of variable-length chunks.
#[derive(Debug)]
pub struct ChunkHeap<S> {
    blocks: BlockStore<S>,
    payload_size: usize,
    seek_start: u64,
    free_head: Option<BufferNumber>,
    /// Last buffer handed out past the end of the file but not yet written.
    recent_new: Option<BufferNumber>,
    header_dirty: bool,
}

impl<S: ByteStream> ChunkHeap<S> {
    /// Create a new heap at `seek_start` in `stream`.
    pub fn initialize(
        mut stream: S,
        payload_size: usize,
        seek_start: u64,
    ) -> Result<Self, ChunkHeapError> {
        if payload_size < MIN_PAYLOAD_SIZE || i32::try_from(payload_size).is_err() {
            return Err(ChunkHeapError::InvalidPayloadSize(payload_size));
        }
        let header = Self::encode_header(payload_size, None)?;
        stream
            .write_at(seek_start, header.as_bytes())
            .map_err(|e| ChunkHeapError::Block(BlockStoreError::Io(e)))?;
        let blocks = BlockStore::initialize(
            stream,
            payload_size + BUFFER_OVERHEAD,
            seek_start + HEADER_SIZE as u64,
        )?;

        Ok(Self {
            blocks,
            payload_size,
            seek_start,
            free_head: None,
            recent_new: None,
            header_dirty: false,
        })
    }

    /// Open an existing heap at `seek_start` in `stream`.
    pub fn open(mut stream: S, seek_start: u64) -> Result<Self, ChunkHeapError> {
        let mut header = Block::zeroed(HEADER_SIZE);
        let read = stream
            .read_at(seek_start, header.as_bytes_mut())
            .map_err(|e| ChunkHeapError::Block(BlockStoreError::Io(e)))?;
        if read < HEADER_SIZE {
            return Err(ChunkHeapError::InvalidHeader(format!(
                "stream too short for header ({read} bytes)"
            )));
        }
        if header.read_bytes(offsets::MAGIC, MAGIC.len()) != MAGIC {
            return Err(ChunkHeapError::InvalidHeader("bad magic prefix".to_string()));
        }
        let version = header.read_u8(offsets::VERSION);
        if version != FORMAT_VERSION {
            return Err(ChunkHeapError::InvalidHeader(format!(
                "unsupported version {version}"
            )));
        }
        let raw_size = header.read_i32(offsets::PAYLOAD_SIZE);
        let payload_size = usize::try_from(raw_size)
            .ok()
            .filter(|&size| size >= MIN_PAYLOAD_SIZE)
            .ok_or_else(|| {
                ChunkHeapError::InvalidHeader(format!("payload size {raw_size} out of range"))
            })?;
        let free_head = header.read_pointer(offsets::FREE_LIST_HEAD);

        let blocks = BlockStore::open(stream, seek_start + HEADER_SIZE as u64)?;
        if blocks.block_size() != payload_size + BUFFER_OVERHEAD {
            return Err(ChunkHeapError::InvalidHeader(format!(
                "block size {} does not match payload size {payload_size}",
                blocks.block_size()
            )));
        }

        Ok(Self {
            blocks,
            payload_size,
            seek_start,
            free_head,
            recent_new: None,
            header_dirty: false,
        })
    }

    fn encode_header(
        payload_size: usize,
        free_head: Option<BufferNumber>,
    ) -> Result<Block, ChunkHeapError> {
        let encoded_size = i32::try_from(payload_size)
            .map_err(|_| ChunkHeapError::InvalidPayloadSize(payload_size))?;
        let mut header = Block::zeroed(HEADER_SIZE);
        header.write_bytes(offsets::MAGIC, &MAGIC);
        header.write_u8(offsets::VERSION, FORMAT_VERSION);
        header.write_i32(offsets::PAYLOAD_SIZE, encoded_size);
        header.write_pointer(offsets::FREE_LIST_HEAD, free_head);
        Ok(header)
    }

    fn write_header(&mut self) -> Result<(), ChunkHeapError> {
        let header = Self::encode_header(self.payload_size, self.free_head)?;
        let seek_start = self.seek_start;
        self.blocks
            .stream_mut()
            .write_at(seek_start, header.as_bytes())
            .map_err(|e| ChunkHeapError::Block(BlockStoreError::Io(e)))?;
        self.header_dirty = false;
        Ok(())
    }

    #[must_use]
    pub const fn payload_size(&self) -> usize {
        self.payload_size
    }

    #[must_use]
    pub const fn free_list_head(&self) -> Option<BufferNumber> {
        self.free_head
    }

    /// First buffer number not yet backed by the stream.
    pub fn next_buffer_number(&mut self) -> Result<BufferNumber, ChunkHeapError> {
        Ok(self.blocks.next_buffer_number()?)
    }

    /// Write the header if it changed and flush the stream.
    pub fn flush(&mut self) -> Result<(), ChunkHeapError> {
        if self.header_dirty {
            self.write_header()?;
        }
        self.blocks.flush()?;
        Ok(())
    }

    /// Flush and hand back the underlying stream.
    pub fn shutdown(mut self) -> Result<S, ChunkHeapError> {
        self.flush()?;
        Ok(self.blocks.into_inner())
    }

    fn read_prefix(
        &mut self,
        buffer: BufferNumber,
    ) -> Result<(BufferKind, Option<BufferNumber>), ChunkHeapError> {
        let mut prefix = Block::zeroed(BUFFER_OVERHEAD);
        self.blocks.read(buffer, prefix.as_bytes_mut())?;
        let kind = BufferKind::try_from(prefix.read_u8(buffer_offsets::KIND)).map_err(|raw| {
            ChunkHeapError::Corruption(format!("buffer {buffer} has unknown kind {raw}"))
        })?;
        Ok((kind, prefix.read_pointer(buffer_offsets::NEXT)))
    }

    fn read_full(
        &mut self,
        buffer: BufferNumber,
    ) -> Result<(BufferKind, Option<BufferNumber>, Block), ChunkHeapError> {
        let mut block = Block::zeroed(self.payload_size + BUFFER_OVERHEAD);
        self.blocks.read(buffer, block.as_bytes_mut())?;
        let kind = BufferKind::try_from(block.read_u8(buffer_offsets::KIND)).map_err(|raw| {
            ChunkHeapError::Corruption(format!("buffer {buffer} has unknown kind {raw}"))
        })?;
        let next = block.read_pointer(buffer_offsets::NEXT);
        Ok((kind, next, block))
    }

    fn write_buffer(
        &mut self,
        buffer: BufferNumber,
        kind: BufferKind,
        payload: &[u8],
        next: Option<BufferNumber>,
    ) -> Result<(), ChunkHeapError> {
        let mut block = Block::zeroed(BUFFER_OVERHEAD + payload.len());
        block.write_u8(buffer_offsets::KIND, kind as u8);
        block.write_pointer(buffer_offsets::NEXT, next);
        block.write_bytes(buffer_offsets::PAYLOAD, payload);
        self.blocks.write(buffer, block.as_bytes())?;
        Ok(())
    }

    /// Hand out a buffer, preferring the most recently freed one.
    fn allocate_buffer(&mut self) -> Result<BufferNumber, ChunkHeapError> {
        if let Some(head) = self.free_head {
            let (kind, next) = self.read_prefix(head)?;
            if kind != BufferKind::Free {
                return Err(ChunkHeapError::Corruption(format!(
                    "free list head {head} is marked {kind:?}"
                )));
            }
            self.free_head = next;
            self.header_dirty = true;
            self.recent_new = None;
            return Ok(head);
        }

        let mut next = self.blocks.next_buffer_number()?;
        if self.recent_new == Some(next) {
            // The previous new buffer has not been written yet.
            next += 1;
        }
        self.recent_new = Some(next);
        Ok(next)
    }

    fn deallocate_buffer(&mut self, buffer: BufferNumber) -> Result<(), ChunkHeapError> {
        self.write_buffer(buffer, BufferKind::Free, &[], self.free_head)?;
        self.free_head = Some(buffer);
        self.header_dirty = true;
        Ok(())
    }

    /// Store `data` as a new chunk and return its HEAD buffer number.
    pub fn store_new_chunk(&mut self, data: &[u8]) -> Result<BufferNumber, ChunkHeapError> {
        let length =
            i32::try_from(data.len()).map_err(|_| ChunkHeapError::ChunkTooLarge(data.len()))?;

        let head = self.allocate_buffer()?;
        let mut current = head;
        let mut kind = BufferKind::Head;
        let mut stored = 0;
        loop {
            let mut payload = vec![0u8; self.payload_size];
            let mut offset = 0;
            if kind == BufferKind::Head {
                payload[..LENGTH_PREFIX].copy_from_slice(&length.to_le_bytes());
                offset = LENGTH_PREFIX;
            }
            let take = (self.payload_size - offset).min(data.len() - stored);
            payload[offset..offset + take].copy_from_slice(&data[stored..stored + take]);
            stored += take;

            if stored >= data.len() {
                self.write_buffer(current, kind, &payload, None)?;
                break;
            }
            let next = self.allocate_buffer()?;
            self.write_buffer(current, kind, &payload, Some(next))?;
            current = next;
            kind = BufferKind::Body;
        }
        Ok(head)
    }

    /// Read back the chunk whose HEAD is `head`.
    pub fn get_chunk(&mut self, head: BufferNumber) -> Result<Vec<u8>, ChunkHeapError> {
        let (kind, mut next, block) = self.read_full(head)?;
        if kind != BufferKind::Head {
            return Err(ChunkHeapError::Corruption(format!(
                "buffer {head} is marked {kind:?}, expected Head"
            )));
        }
        let raw_length = block.read_i32(buffer_offsets::PAYLOAD);
        let length = usize::try_from(raw_length).map_err(|_| {
            ChunkHeapError::Corruption(format!("chunk {head} has negative length {raw_length}"))
        })?;

        let mut data = Vec::new();
        let take = length.min(self.payload_size - LENGTH_PREFIX);
        data.extend_from_slice(block.read_bytes(buffer_offsets::PAYLOAD + LENGTH_PREFIX, take));
        while data.len() < length {
            let Some(buffer) = next else {
                return Err(ChunkHeapError::Corruption(format!(
                    "chunk {head} ends after {} of {length} bytes",
                    data.len()
                )));
            };
            let (kind, following, block) = self.read_full(buffer)?;
            if kind != BufferKind::Body {
                return Err(ChunkHeapError::Corruption(format!(
                    "buffer {buffer} in chunk {head} is marked {kind:?}, expected Body"
                )));
            }
            let take = (length - data.len()).min(self.payload_size);
            data.extend_from_slice(block.read_bytes(buffer_offsets::PAYLOAD, take));
            next = following;
        }
        Ok(data)
    }

    /// Return every buffer of the chunk at `head` to the free list.
    pub fn release_buffers(&mut self, head: BufferNumber) -> Result<(), ChunkHeapError> {
        let mut cursor = Some(head);
        let mut expected = BufferKind::Head;
        while let Some(buffer) = cursor {
            let (kind, next) = self.read_prefix(buffer)?;
            if kind != expected {
                return Err(ChunkHeapError::Corruption(format!(
                    "releasing chunk {head}: buffer {buffer} is marked {kind:?}, expected {expected:?}"
                )));
            }
            self.deallocate_buffer(buffer)?;
            cursor = next;
            expected = BufferKind::Body;
        }
        Ok(())
    }

    /// Verify the heap without changing it.
    pub fn check_structure(&mut self) -> Result<HeapRecovery, ChunkHeapError> {
        self.recover(None, false)
    }

    /// Scan every buffer and reconcile the heap against `chunks_in_use`.
    ///
    /// `chunks_in_use` maps live HEAD buffers to a description (usually the
    /// owning key) used in error messages. When given, well-formed chunks
    /// absent from it are released if `fix_errors` is set and reported as
    /// corruption otherwise. A chunk listed as in use but missing from the
    /// heap is always fatal.
    ///
    /// With `fix_errors`, any other inconsistency (broken free list, torn
    /// chains, unaccounted buffers) is repaired by rebuilding the free list
    /// from every buffer not held by a live chunk.
    pub fn recover(
        &mut self,
        chunks_in_use: Option<&HashMap<BufferNumber, String>>,
        fix_errors: bool,
    ) -> Result<HeapRecovery, ChunkHeapError> {
        let buffers = self.blocks.next_buffer_number()?;
        let scan = self.scan(buffers, chunks_in_use)?;

        if !scan.missing.is_empty() {
            return Err(ChunkHeapError::Corruption(format!(
                "chunks in use not found: {}",
                scan.missing.join(", ")
            )));
        }
        if !fix_errors {
            if let Some(problem) = scan.problems.first() {
                return Err(ChunkHeapError::Corruption(format!(
                    "{problem} ({} problems total)",
                    scan.problems.len()
                )));
            }
            if !scan.orphans.is_empty() {
                return Err(ChunkHeapError::Corruption(format!(
                    "{} chunks not in use: {:?}",
                    scan.orphans.len(),
                    scan.orphans
                )));
            }
        }

        let mut orphans = scan.orphans;
        orphans.sort_unstable_by(|a, b| b.cmp(a));
        let mut report = HeapRecovery {
            buffers,
            chunks: scan.chunks.len() - orphans.len(),
            released_chunks: orphans.clone(),
            rebuilt_free_list: false,
        };

        if scan.problems.is_empty() {
            for head in orphans {
                tracing::warn!("releasing unreferenced chunk {head}");
                self.release_buffers(head)?;
            }
        } else {
            for problem in &scan.problems {
                tracing::warn!("chunk heap: {problem}");
            }
            self.rebuild_free_list(&scan.live)?;
            report.rebuilt_free_list = true;
        }

        if report.rebuilt_free_list || !report.released_chunks.is_empty() {
            self.flush()?;
        }
        tracing::info!(
            "chunk heap recovered: {} buffers, {} chunks, {} released",
            report.buffers,
            report.chunks,
            report.released_chunks.len()
        );
        Ok(report)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn scan(
        &mut self,
        buffers: u64,
        chunks_in_use: Option<&HashMap<BufferNumber, String>>,
    ) -> Result<HeapScan, ChunkHeapError> {
        let mut entries = Vec::new();
        for buffer in 0..buffers {
            let mut prefix = Block::zeroed(BUFFER_OVERHEAD + LENGTH_PREFIX);
            self.blocks.read(buffer, prefix.as_bytes_mut())?;
            entries.push(ScanEntry {
                kind: BufferKind::try_from(prefix.read_u8(buffer_offsets::KIND)).ok(),
                next: prefix.read_pointer(buffer_offsets::NEXT),
                length: prefix.read_i32(buffer_offsets::PAYLOAD),
            });
        }
        let count = entries.len();
        let mut visited = vec![false; count];
        let mut problems = Vec::new();

        let mut cursor = self.free_head;
        while let Some(buffer) = cursor {
            let index = buffer as usize;
            let Some(entry) = entries.get(index) else {
                problems.push(format!("free list points past the end at {buffer}"));
                break;
            };
            if visited[index] {
                problems.push(format!("cycle in free list at {buffer}"));
                break;
            }
            if entry.kind != Some(BufferKind::Free) {
                problems.push(format!("free list entry {buffer} is marked {:?}", entry.kind));
                break;
            }
            visited[index] = true;
            cursor = entry.next;
        }

        let mut chunks = Vec::new();
        for head in 0..count {
            if entries[head].kind != Some(BufferKind::Head) {
                continue;
            }
            match self.trace_chain(head as u64, &entries, &visited) {
                Ok(chain) => {
                    for &buffer in &chain {
                        visited[buffer as usize] = true;
                    }
                    chunks.push((head as u64, chain));
                }
                Err(problem) => problems.push(problem),
            }
        }

        for (buffer, seen) in visited.iter().enumerate() {
            if !seen {
                problems.push(format!("buffer {buffer} is neither free nor part of a chunk"));
            }
        }

        let mut missing = Vec::new();
        let mut orphans = Vec::new();
        if let Some(in_use) = chunks_in_use {
            let heads: HashSet<BufferNumber> = chunks.iter().map(|(head, _)| *head).collect();
            let mut listed: Vec<_> = in_use.iter().collect();
            listed.sort_unstable();
            for (chunk, description) in listed {
                if !heads.contains(chunk) {
                    missing.push(format!("{chunk} ({description})"));
                }
            }
            orphans = heads
                .into_iter()
                .filter(|head| !in_use.contains_key(head))
                .collect();
        }

        let mut live = vec![false; count];
        for (head, chain) in &chunks {
            if orphans.contains(head) {
                continue;
            }
            for &buffer in chain {
                live[buffer as usize] = true;
            }
        }

        Ok(HeapScan {
            problems,
            live,
            chunks,
            orphans,
            missing,
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn trace_chain(
        &self,
        head: BufferNumber,
        entries: &[ScanEntry],
        visited: &[bool],
    ) -> Result<Vec<BufferNumber>, String> {
        let raw_length = entries[head as usize].length;
        let length = usize::try_from(raw_length)
            .map_err(|_| format!("chunk {head} has negative length {raw_length}"))?;

        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut capacity = 0;
        let mut cursor = Some(head);
        let mut expected = BufferKind::Head;
        while let Some(buffer) = cursor {
            let Some(entry) = entries.get(buffer as usize) else {
                return Err(format!("chunk {head} points past the end at {buffer}"));
            };
            if visited[buffer as usize] || !seen.insert(buffer) {
                return Err(format!("buffer {buffer} reached twice (chunk {head})"));
            }
            if entry.kind != Some(expected) {
                return Err(format!(
                    "buffer {buffer} in chunk {head} is marked {:?}, expected {expected:?}",
                    entry.kind
                ));
            }
            chain.push(buffer);
            capacity += if expected == BufferKind::Head {
                self.payload_size - LENGTH_PREFIX
            } else {
                self.payload_size
            };
            cursor = entry.next;
            expected = BufferKind::Body;
        }
        if capacity < length {
            return Err(format!(
                "chunk {head} holds {capacity} of {length} bytes"
            ));
        }
        Ok(chain)
    }

    /// Rewrite the free list as every buffer not in `live`, lowest first.
    fn rebuild_free_list(&mut self, live: &[bool]) -> Result<(), ChunkHeapError> {
        self.free_head = None;
        self.header_dirty = true;
        for (buffer, &is_live) in live.iter().enumerate().rev() {
            if !is_live {
                self.deallocate_buffer(buffer as u64)?;
            }
        }
        Ok(())
    }
}

/// Errors from chunk heap operations.
#[derive(Debug)]
pub enum ChunkHeapError {
    /// Error from the underlying block store.
    Block(BlockStoreError),
    /// Header is missing or malformed.
    InvalidHeader(String),
    /// Payload size below the minimum or not representable on disk.
    InvalidPayloadSize(usize),
    /// Chunk longer than the 32-bit length prefix allows.
    ChunkTooLarge(usize),
    /// Structural inconsistency in the heap.
    Corruption(String),
}

impl std::fmt::Display for ChunkHeapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block(e) => write!(f, "block store error: {e}"),
            Self::InvalidHeader(msg) => write!(f, "invalid chunk heap header: {msg}"),
            Self::InvalidPayloadSize(size) => write!(
                f,
                "payload size {size} out of range (minimum {MIN_PAYLOAD_SIZE})"
            ),
            Self::ChunkTooLarge(len) => write!(f, "chunk of {len} bytes is too large"),
            Self::Corruption(msg) => write!(f, "chunk heap corruption: {msg}"),
        }
    }
}

impl std::error::Error for ChunkHeapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Block(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BlockStoreError> for ChunkHeapError {
    fn from(e: BlockStoreError) -> Self {
        Self::Block(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStream;

    fn new_heap() -> ChunkHeap<MemoryStream> {
        ChunkHeap::initialize(MemoryStream::new(), 20, 0).expect("initialize heap")
    }

    #[allow(clippy::cast_possible_truncation)]
    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_store_and_get_small_chunk() {
        let mut heap = new_heap();
        let head = heap.store_new_chunk(b"hello").expect("store");
        assert_eq!(heap.get_chunk(head).expect("get"), b"hello");
        assert_eq!(heap.next_buffer_number().expect("next"), 1);
    }

    #[test]
    fn test_store_empty_chunk() {
        let mut heap = new_heap();
        let head = heap.store_new_chunk(&[]).expect("store");
        assert!(heap.get_chunk(head).expect("get").is_empty());
    }

    #[test]
    fn test_multi_buffer_chunk() {
        let mut heap = new_heap();
        // 16 bytes fit in the head, then 20 per body buffer.
        let data = pattern(100);
        let head = heap.store_new_chunk(&data).expect("store");
        assert_eq!(heap.get_chunk(head).expect("get"), data);
        assert_eq!(heap.next_buffer_number().expect("next"), 6);
    }

    #[test]
    fn test_exact_boundary_chunk() {
        let mut heap = new_heap();
        let data = pattern(16 + 20);
        let head = heap.store_new_chunk(&data).expect("store");
        assert_eq!(heap.get_chunk(head).expect("get"), data);
        assert_eq!(heap.next_buffer_number().expect("next"), 2);
    }

    #[test]
    fn test_release_reuses_buffers_lifo() {
        let mut heap = new_heap();
        let first = heap.store_new_chunk(&pattern(50)).expect("store first");
        let second = heap.store_new_chunk(b"second").expect("store second");
        let before = heap.next_buffer_number().expect("next");

        heap.release_buffers(first).expect("release");
        let reused = heap.store_new_chunk(b"third").expect("store third");
        // The last buffer released is the last body buffer of `first`.
        assert_ne!(reused, second);
        assert_eq!(heap.next_buffer_number().expect("next"), before);
        assert_eq!(heap.get_chunk(reused).expect("get"), b"third");
        assert_eq!(heap.get_chunk(second).expect("get"), b"second");
    }

    #[test]
    fn test_get_chunk_rejects_body_buffer() {
        let mut heap = new_heap();
        let head = heap.store_new_chunk(&pattern(60)).expect("store");
        let result = heap.get_chunk(head + 1);
        assert!(matches!(result, Err(ChunkHeapError::Corruption(_))));
    }

    #[test]
    fn test_release_rejects_free_buffer() {
        let mut heap = new_heap();
        let head = heap.store_new_chunk(b"gone").expect("store");
        heap.release_buffers(head).expect("release");
        let result = heap.release_buffers(head);
        assert!(matches!(result, Err(ChunkHeapError::Corruption(_))));
    }

    #[test]
    fn test_reopen_preserves_free_list() {
        let mut heap = new_heap();
        let keep = heap.store_new_chunk(b"keep").expect("store keep");
        let drop_me = heap.store_new_chunk(&pattern(40)).expect("store drop");
        heap.release_buffers(drop_me).expect("release");
        let free_head = heap.free_list_head();
        let stream = heap.shutdown().expect("shutdown");

        let mut heap = ChunkHeap::open(stream, 0).expect("open");
        assert_eq!(heap.payload_size(), 20);
        assert_eq!(heap.free_list_head(), free_head);
        assert_eq!(heap.get_chunk(keep).expect("get"), b"keep");
        heap.check_structure().expect("structure is sound");
    }

    #[test]
    fn test_payload_size_too_small() {
        let result = ChunkHeap::initialize(MemoryStream::new(), 19, 0);
        assert!(matches!(result, Err(ChunkHeapError::InvalidPayloadSize(19))));
    }

    #[test]
    fn test_recover_releases_unreferenced_chunks() {
        let mut heap = new_heap();
        let live = heap.store_new_chunk(b"live").expect("store live");
        let orphan = heap.store_new_chunk(&pattern(45)).expect("store orphan");

        let in_use = HashMap::from([(live, "key".to_string())]);
        let strict = heap.recover(Some(&in_use), false);
        assert!(matches!(strict, Err(ChunkHeapError::Corruption(_))));

        let report = heap.recover(Some(&in_use), true).expect("recover");
        assert_eq!(report.released_chunks, vec![orphan]);
        assert_eq!(report.chunks, 1);
        assert!(!report.rebuilt_free_list);
        heap.recover(Some(&in_use), false).expect("clean after fix");
    }

    #[test]
    fn test_recover_missing_chunk_is_fatal() {
        let mut heap = new_heap();
        heap.store_new_chunk(b"only").expect("store");
        let in_use = HashMap::from([(0, "a".to_string()), (7, "b".to_string())]);
        let result = heap.recover(Some(&in_use), true);
        assert!(matches!(result, Err(ChunkHeapError::Corruption(msg)) if msg.contains('7')));
    }

    #[test]
    fn test_recover_rebuilds_stale_free_list() {
        let mut heap = new_heap();
        let committed = heap.store_new_chunk(b"committed").expect("store");
        let released = heap.store_new_chunk(&pattern(30)).expect("store");
        heap.release_buffers(released).expect("release");
        heap.flush().expect("flush");

        // Reuse the free list without flushing the header, then "crash".
        heap.store_new_chunk(&pattern(30)).expect("store over free list");
        let crashed = heap.blocks.stream().snapshot();

        let mut heap = ChunkHeap::open(crashed, 0).expect("open");
        let in_use = HashMap::from([(committed, "committed".to_string())]);
        assert!(heap.recover(Some(&in_use), false).is_err());

        let report = heap.recover(Some(&in_use), true).expect("recover");
        assert!(report.rebuilt_free_list);
        assert_eq!(report.chunks, 1);
        heap.recover(Some(&in_use), false).expect("clean after rebuild");
        assert_eq!(heap.get_chunk(committed).expect("get"), b"committed");
    }

    #[test]
    fn test_recover_detects_torn_chain() {
        let mut heap = new_heap();
        let head = heap.store_new_chunk(&pattern(80)).expect("store");
        let mut stream = heap.shutdown().expect("shutdown");
        // Drop the last body buffer.
        let len = stream.as_bytes().len();
        stream.truncate(len - (20 + BUFFER_OVERHEAD));

        let mut heap = ChunkHeap::open(stream, 0).expect("open");
        assert!(matches!(
            heap.check_structure(),
            Err(ChunkHeapError::Corruption(_))
        ));
        assert!(heap.get_chunk(head).is_err());

        let report = heap.recover(Some(&HashMap::new()), true).expect("recover");
        assert!(report.rebuilt_free_list);
        assert_eq!(report.chunks, 0);
        heap.recover(Some(&HashMap::new()), false).expect("clean after rebuild");
    }
}
