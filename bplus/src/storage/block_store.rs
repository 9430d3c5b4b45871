//! Fixed-size buffer storage over a byte stream.
//!
//! A block store maps a buffer number to a fixed-size byte range of the
//! underlying stream. It performs no caching: every call reaches the stream.
//!
//! # File Format
//!
//! ```text
//! seek_start
//! +-----------+---------+----------------+----------+----------+-----
//! | Magic     | Version | Block Size     | Buffer 0 | Buffer 1 | ...
//! | (5 bytes) | (1)     | (i32, 4 bytes) |          |          |
//! +-----------+---------+----------------+----------+----------+-----
//! ```
//!
//! The number of buffers is derived from the stream length. A partially
//! written trailing buffer counts as present; reads past the end of the
//! stream come back zeroed.

use crate::storage::codec::{Block, BufferNumber};
use crate::storage::io::ByteStream;

/// Magic prefix identifying a block store header: "bpNbf".
pub const MAGIC: [u8; 5] = *b"bpNbf";

/// Current format version.
pub const FORMAT_VERSION: u8 = 0;

/// Smallest block size accepted.
pub const MIN_BLOCK_SIZE: usize = 16;

/// Size of the header in bytes.
pub const HEADER_SIZE: usize = offsets::END;

/// Header field offsets relative to `seek_start`.
mod offsets {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 5;
    pub const BLOCK_SIZE: usize = 6;
    pub const END: usize = 10;
}

/// A buffer-numbered view over a byte stream.
#[derive(Debug)]
pub struct BlockStore<S> {
    stream: S,
    block_size: usize,
    seek_start: u64,
}

impl<S: ByteStream> BlockStore<S> {
    /// Write a fresh header at `seek_start` and return the store.
    ///
    /// Existing buffers past the header are left in place; callers
    /// initializing a new store should hand over an empty stream.
    pub fn initialize(
        mut stream: S,
        block_size: usize,
        seek_start: u64,
    ) -> Result<Self, BlockStoreError> {
        let encoded_size = Self::check_block_size(block_size)?;

        let mut header = Block::zeroed(HEADER_SIZE);
        header.write_bytes(offsets::MAGIC, &MAGIC);
        header.write_u8(offsets::VERSION, FORMAT_VERSION);
        header.write_i32(offsets::BLOCK_SIZE, encoded_size);
        stream
            .write_at(seek_start, header.as_bytes())
            .map_err(BlockStoreError::Io)?;

        Ok(Self {
            stream,
            block_size,
            seek_start,
        })
    }

    /// Read and validate the header at `seek_start`.
    pub fn open(mut stream: S, seek_start: u64) -> Result<Self, BlockStoreError> {
        let mut header = Block::zeroed(HEADER_SIZE);
        let read = stream
            .read_at(seek_start, header.as_bytes_mut())
            .map_err(BlockStoreError::Io)?;
        if read < HEADER_SIZE {
            return Err(BlockStoreError::InvalidHeader(format!(
                "stream too short for header ({read} bytes)"
            )));
        }
        if header.read_bytes(offsets::MAGIC, MAGIC.len()) != MAGIC {
            return Err(BlockStoreError::InvalidHeader("bad magic prefix".to_string()));
        }
        let version = header.read_u8(offsets::VERSION);
        if version != FORMAT_VERSION {
            return Err(BlockStoreError::InvalidHeader(format!(
                "unsupported version {version}"
            )));
        }
        let raw_size = header.read_i32(offsets::BLOCK_SIZE);
        let block_size = usize::try_from(raw_size)
            .map_err(|_| BlockStoreError::InvalidHeader(format!("negative block size {raw_size}")))?;
        Self::check_block_size(block_size)?;

        Ok(Self {
            stream,
            block_size,
            seek_start,
        })
    }

    fn check_block_size(block_size: usize) -> Result<i32, BlockStoreError> {
        if block_size < MIN_BLOCK_SIZE {
            return Err(BlockStoreError::InvalidBlockSize(block_size));
        }
        i32::try_from(block_size).map_err(|_| BlockStoreError::InvalidBlockSize(block_size))
    }

    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub const fn stream(&self) -> &S {
        &self.stream
    }

    /// Direct access to the stream, for owners that keep their own header
    /// in front of this store.
    pub const fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    #[must_use]
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// First buffer number not backed by the stream.
    pub fn next_buffer_number(&mut self) -> Result<BufferNumber, BlockStoreError> {
        let len = self.stream.stream_len().map_err(BlockStoreError::Io)?;
        let data_start = self.seek_start + HEADER_SIZE as u64;
        let data_len = len.saturating_sub(data_start);
        Ok(data_len.div_ceil(self.block_size as u64))
    }

    /// Fill `into` from the start of `buffer`.
    ///
    /// Fails if `buffer` is not below [`next_buffer_number`](Self::next_buffer_number)
    /// or `into` is longer than a block.
    pub fn read(&mut self, buffer: BufferNumber, into: &mut [u8]) -> Result<(), BlockStoreError> {
        self.check_length(into.len())?;
        let next = self.next_buffer_number()?;
        if buffer >= next {
            return Err(BlockStoreError::BufferOutOfRange { buffer, next });
        }
        let offset = self.buffer_offset(buffer);
        self.stream
            .read_padded(offset, into)
            .map_err(BlockStoreError::Io)
    }

    /// Write `from` at the start of `buffer`.
    ///
    /// `buffer` may be at most one past the last existing buffer.
    pub fn write(&mut self, buffer: BufferNumber, from: &[u8]) -> Result<(), BlockStoreError> {
        self.check_length(from.len())?;
        let next = self.next_buffer_number()?;
        if buffer > next {
            return Err(BlockStoreError::BufferGap { buffer, next });
        }
        let offset = self.buffer_offset(buffer);
        self.stream.write_at(offset, from).map_err(BlockStoreError::Io)
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<(), BlockStoreError> {
        self.stream.flush().map_err(BlockStoreError::Io)
    }

    const fn check_length(&self, length: usize) -> Result<(), BlockStoreError> {
        if length > self.block_size {
            return Err(BlockStoreError::Oversized {
                length,
                block_size: self.block_size,
            });
        }
        Ok(())
    }

    const fn buffer_offset(&self, buffer: BufferNumber) -> u64 {
        self.seek_start + HEADER_SIZE as u64 + buffer * self.block_size as u64
    }
}

/// Errors from block store operations.
#[derive(Debug)]
pub enum BlockStoreError {
    /// I/O error from the underlying stream.
    Io(std::io::Error),
    /// Header is missing or malformed.
    InvalidHeader(String),
    /// Block size below the minimum or not representable on disk.
    InvalidBlockSize(usize),
    /// Read of a buffer that does not exist yet.
    BufferOutOfRange { buffer: BufferNumber, next: BufferNumber },
    /// Write that would leave a hole in the stream.
    BufferGap { buffer: BufferNumber, next: BufferNumber },
    /// Transfer longer than a block.
    Oversized { length: usize, block_size: usize },
}

impl std::fmt::Display for BlockStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::InvalidHeader(msg) => write!(f, "invalid block store header: {msg}"),
            Self::InvalidBlockSize(size) => {
                write!(f, "block size {size} out of range (minimum {MIN_BLOCK_SIZE})")
            }
            Self::BufferOutOfRange { buffer, next } => {
                write!(f, "buffer {buffer} not allocated (next buffer: {next})")
            }
            Self::BufferGap { buffer, next } => {
                write!(f, "write to buffer {buffer} would skip past next buffer {next}")
            }
            Self::Oversized { length, block_size } => {
                write!(f, "transfer of {length} bytes exceeds block size {block_size}")
            }
        }
    }
}

impl std::error::Error for BlockStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStream;
    use tempfile::tempdir;

    #[test]
    fn test_initialize_and_open() {
        let store = BlockStore::initialize(MemoryStream::new(), 32, 0).expect("initialize");
        let stream = store.into_inner();
        assert_eq!(&stream.as_bytes()[..5], b"bpNbf");
        assert_eq!(stream.as_bytes().len(), 10);

        let mut reopened = BlockStore::open(stream, 0).expect("open");
        assert_eq!(reopened.block_size(), 32);
        assert_eq!(reopened.next_buffer_number().expect("next"), 0);
    }

    #[test]
    fn test_block_size_too_small() {
        let result = BlockStore::initialize(MemoryStream::new(), 8, 0);
        assert!(matches!(result, Err(BlockStoreError::InvalidBlockSize(8))));
    }

    #[test]
    fn test_write_then_read() {
        let mut store = BlockStore::initialize(MemoryStream::new(), 16, 0).expect("initialize");
        store.write(0, b"first").expect("write 0");
        store.write(1, b"second").expect("write 1");
        assert_eq!(store.next_buffer_number().expect("next"), 2);

        let mut buf = [0u8; 6];
        store.read(1, &mut buf).expect("read");
        assert_eq!(&buf, b"second");
    }

    #[test]
    fn test_read_beyond_count_fails() {
        let mut store = BlockStore::initialize(MemoryStream::new(), 16, 0).expect("initialize");
        let mut buf = [0u8; 4];
        let result = store.read(0, &mut buf);
        assert!(matches!(
            result,
            Err(BlockStoreError::BufferOutOfRange { buffer: 0, next: 0 })
        ));
    }

    #[test]
    fn test_write_gap_fails() {
        let mut store = BlockStore::initialize(MemoryStream::new(), 16, 0).expect("initialize");
        store.write(0, b"zero").expect("write");
        let result = store.write(2, b"two");
        assert!(matches!(
            result,
            Err(BlockStoreError::BufferGap { buffer: 2, next: 1 })
        ));
    }

    #[test]
    fn test_oversized_transfer_fails() {
        let mut store = BlockStore::initialize(MemoryStream::new(), 16, 0).expect("initialize");
        let result = store.write(0, &[1u8; 17]);
        assert!(matches!(
            result,
            Err(BlockStoreError::Oversized {
                length: 17,
                block_size: 16
            })
        ));
    }

    #[test]
    fn test_partial_trailing_buffer_counts() {
        let mut store = BlockStore::initialize(MemoryStream::new(), 16, 0).expect("initialize");
        store.write(0, &[7u8; 16]).expect("write full");
        store.write(1, &[9u8; 3]).expect("write partial");
        assert_eq!(store.next_buffer_number().expect("next"), 2);

        let mut buf = [0xFFu8; 16];
        store.read(1, &mut buf).expect("read partial");
        assert_eq!(&buf[..3], &[9, 9, 9]);
        assert!(buf[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_seek_start_offset() {
        let mut stream = MemoryStream::new();
        stream.write_at(0, b"prefix").expect("write prefix");
        let mut store = BlockStore::initialize(stream, 16, 6).expect("initialize");
        store.write(0, b"payload").expect("write");

        let stream = store.into_inner();
        assert_eq!(&stream.as_bytes()[..6], b"prefix");
        assert_eq!(&stream.as_bytes()[6..11], b"bpNbf");
        assert_eq!(&stream.as_bytes()[16..23], b"payload");

        let mut reopened = BlockStore::open(stream, 6).expect("open");
        let mut buf = [0u8; 7];
        reopened.read(0, &mut buf).expect("read");
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn test_bad_magic_rejected() {
        let stream = MemoryStream::from_bytes(vec![0u8; 10]);
        assert!(matches!(
            BlockStore::open(stream, 0),
            Err(BlockStoreError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_file_backed_store() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("blocks.bpt");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .expect("create file");

        let mut store = BlockStore::initialize(file, 24, 0).expect("initialize");
        store.write(0, b"durable").expect("write");
        store.flush().expect("flush");
        drop(store);

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .expect("reopen file");
        let mut store = BlockStore::open(file, 0).expect("open");
        let mut buf = [0u8; 7];
        store.read(0, &mut buf).expect("read");
        assert_eq!(&buf, b"durable");
    }
}
