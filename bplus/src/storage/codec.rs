//! Fixed-width integer encoding for headers and buffers.
//!
//! Every multi-byte integer written by the engine is little-endian. Buffer
//! pointers are stored as 64-bit values where `-1` (all bits set) marks the
//! absence of a buffer.

/// Index of a fixed-size buffer within a block store.
pub type BufferNumber = u64;

/// On-disk encoding of a missing buffer pointer (`-1` as int64).
pub const NULL_BUFFER: u64 = u64::MAX;

/// Encode an optional buffer pointer.
#[must_use]
pub const fn encode_pointer(pointer: Option<BufferNumber>) -> u64 {
    match pointer {
        Some(buffer) => buffer,
        None => NULL_BUFFER,
    }
}

/// Decode a buffer pointer, mapping the null sentinel to `None`.
#[must_use]
pub const fn decode_pointer(raw: u64) -> Option<BufferNumber> {
    if raw == NULL_BUFFER { None } else { Some(raw) }
}

/// A heap-allocated byte block with positional integer accessors.
///
/// Blocks are sized by the owning store, so unlike a page they carry no
/// compile-time length.
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    data: Vec<u8>,
}

impl Block {
    /// Create a zeroed block of `len` bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            data: vec![0u8; len],
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Read bytes at a specific offset.
    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Write bytes at a specific offset.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    /// Read an i16 (little-endian) at the given offset.
    #[must_use]
    pub fn read_i16(&self, offset: usize) -> i16 {
        i16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    /// Write an i16 (little-endian) at the given offset.
    pub fn write_i16(&mut self, offset: usize, value: i16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Read an i32 (little-endian) at the given offset.
    #[must_use]
    pub fn read_i32(&self, offset: usize) -> i32 {
        i32::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    /// Write an i32 (little-endian) at the given offset.
    pub fn write_i32(&mut self, offset: usize, value: i32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u64 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
            self.data[offset + 4],
            self.data[offset + 5],
            self.data[offset + 6],
            self.data[offset + 7],
        ])
    }

    /// Write a u64 (little-endian) at the given offset.
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a buffer pointer at the given offset.
    #[must_use]
    pub fn read_pointer(&self, offset: usize) -> Option<BufferNumber> {
        decode_pointer(self.read_u64(offset))
    }

    /// Write a buffer pointer at the given offset.
    pub fn write_pointer(&mut self, offset: usize, pointer: Option<BufferNumber>) {
        self.write_u64(offset, encode_pointer(pointer));
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let preview = &self.data[..self.data.len().min(16)];
        f.debug_struct("Block")
            .field("len", &self.data.len())
            .field("first_16_bytes", &preview)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_read_write() {
        let mut block = Block::zeroed(64);

        block.write_u8(0, 0xFF);
        assert_eq!(block.read_u8(0), 0xFF);

        block.write_i16(2, -1);
        assert_eq!(block.read_i16(2), -1);

        block.write_i32(4, 0x1234_5678);
        assert_eq!(block.read_i32(4), 0x1234_5678);

        block.write_u64(8, 0x0102_0304_0506_0708);
        assert_eq!(block.read_u64(8), 0x0102_0304_0506_0708);
        assert_eq!(block.read_bytes(8, 1), &[0x08]);

        block.write_bytes(40, b"hello");
        assert_eq!(block.read_bytes(40, 5), b"hello");
    }

    #[test]
    fn test_null_pointer_is_minus_one() {
        let mut block = Block::zeroed(8);
        block.write_pointer(0, None);
        assert_eq!(block.as_bytes(), &(-1i64).to_le_bytes());
        assert_eq!(block.read_pointer(0), None);

        block.write_pointer(0, Some(42));
        assert_eq!(block.read_pointer(0), Some(42));
    }
}
