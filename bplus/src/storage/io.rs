//! Byte stream abstraction underneath every store.
//!
//! The engine only needs positional reads and writes, the current length,
//! and a durability barrier. Production code runs on `std::fs::File`; tests
//! run on [`MemoryStream`](crate::storage::MemoryStream), which can inject
//! faults and simulate torn writes.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Random-access byte stream.
pub trait ByteStream {
    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes read, which is short only when the stream
    /// ends first.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `buf` at `offset`, extending the stream if needed.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Current length of the stream in bytes.
    fn stream_len(&mut self) -> io::Result<u64>;

    /// Make every previous write durable.
    fn flush(&mut self) -> io::Result<()>;

    /// Fill `buf` from `offset`, zeroing whatever lies past the end of the
    /// stream.
    fn read_padded(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let read = self.read_at(offset, buf)?;
        buf[read..].fill(0);
        Ok(())
    }
}

impl ByteStream for File {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match self.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(buf)
    }

    fn stream_len(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(self)?;
        self.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_positional_io() {
        let dir = tempdir().expect("create temp dir");
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(dir.path().join("stream.bin"))
            .expect("create file");

        file.write_at(4, b"abcd").expect("write");
        assert_eq!(file.stream_len().expect("len"), 8);

        let mut buf = [0xAAu8; 6];
        file.read_padded(2, &mut buf).expect("read");
        assert_eq!(&buf, &[0, 0, b'a', b'b', b'c', b'd']);

        let mut past_end = [0xAAu8; 4];
        file.read_padded(6, &mut past_end).expect("read past end");
        assert_eq!(&past_end, &[b'c', b'd', 0, 0]);
    }
}
