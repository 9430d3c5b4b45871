//! In-memory byte stream with deterministic fault injection.
//!
//! Used to test the stores without touching the filesystem and to simulate
//! crashes: a [`MemoryStream::snapshot`] taken before a commit is exactly the
//! state a process would find after dying at that point.
//!
//! Faults are driven by a seeded `StdRng`, so a given seed always produces
//! the same sequence of failures.

use std::io;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::io::ByteStream;

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a read failing (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write failing (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a flush failing (0.0 - 1.0).
    pub flush_error_rate: f64,
    /// Probability of a write silently persisting only a prefix (0.0 - 1.0).
    pub torn_write_rate: f64,
}

impl FaultConfig {
    /// Configuration with no faults.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            read_error_rate: 0.0,
            write_error_rate: 0.0,
            flush_error_rate: 0.0,
            torn_write_rate: 0.0,
        }
    }

    /// Every write fails.
    #[must_use]
    pub const fn failing_writes() -> Self {
        Self {
            read_error_rate: 0.0,
            write_error_rate: 1.0,
            flush_error_rate: 0.0,
            torn_write_rate: 0.0,
        }
    }
}

/// Statistics about stream operations.
#[derive(Debug, Default, Clone)]
pub struct MemoryStreamStats {
    pub reads: u64,
    pub writes: u64,
    pub flushes: u64,
    pub injected_errors: u64,
    pub torn_writes: u64,
}

/// A growable in-memory stream.
#[derive(Debug, Clone)]
pub struct MemoryStream {
    data: Vec<u8>,
    fault_config: FaultConfig,
    rng: StdRng,
    stats: MemoryStreamStats,
}

impl MemoryStream {
    /// Create an empty stream with no faults.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(0, FaultConfig::none())
    }

    /// Create an empty stream with the given fault configuration.
    #[must_use]
    pub fn with_config(seed: u64, fault_config: FaultConfig) -> Self {
        Self {
            data: Vec::new(),
            fault_config,
            rng: StdRng::seed_from_u64(seed),
            stats: MemoryStreamStats::default(),
        }
    }

    /// Wrap existing bytes.
    #[must_use]
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::new()
        }
    }

    /// A fault-free copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self::from_bytes(self.data.clone())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    #[must_use]
    pub const fn stats(&self) -> &MemoryStreamStats {
        &self.stats
    }

    pub fn set_fault_config(&mut self, config: FaultConfig) {
        self.fault_config = config;
    }

    /// Overwrite `len` bytes at `offset` with zeroes.
    pub fn zero_range(&mut self, offset: usize, len: usize) {
        let end = (offset + len).min(self.data.len());
        if offset < end {
            self.data[offset..end].fill(0);
        }
    }

    /// Cut the stream down to `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }

    fn injected(&mut self, what: &str) -> io::Error {
        self.stats.injected_errors += 1;
        io::Error::other(format!("injected {what} fault"))
    }
}

impl Default for MemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteStream for MemoryStream {
    #[allow(clippy::cast_possible_truncation)]
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.stats.reads += 1;
        if self.should_inject_fault(self.fault_config.read_error_rate) {
            return Err(self.injected("read"));
        }

        let start = offset as usize;
        if start >= self.data.len() {
            return Ok(0);
        }
        let available = (self.data.len() - start).min(buf.len());
        buf[..available].copy_from_slice(&self.data[start..start + available]);
        Ok(available)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.stats.writes += 1;
        if self.should_inject_fault(self.fault_config.write_error_rate) {
            return Err(self.injected("write"));
        }

        let mut len = buf.len();
        if len > 0 && self.should_inject_fault(self.fault_config.torn_write_rate) {
            self.stats.torn_writes += 1;
            len = self.rng.random_range(0..len);
        }

        let start = offset as usize;
        let end = start + len;
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(&buf[..len]);
        Ok(())
    }

    fn stream_len(&mut self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stats.flushes += 1;
        if self.should_inject_fault(self.fault_config.flush_error_rate) {
            return Err(self.injected("flush"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_extends_stream() {
        let mut stream = MemoryStream::new();
        stream.write_at(3, b"xy").expect("write");
        assert_eq!(stream.as_bytes(), &[0, 0, 0, b'x', b'y']);
        assert_eq!(stream.stream_len().expect("len"), 5);
    }

    #[test]
    fn test_read_past_end_is_short() {
        let mut stream = MemoryStream::from_bytes(b"hello".to_vec());
        let mut buf = [0u8; 4];
        assert_eq!(stream.read_at(3, &mut buf).expect("read"), 2);
        assert_eq!(stream.read_at(10, &mut buf).expect("read"), 0);
    }

    #[test]
    fn test_failing_writes() {
        let mut stream = MemoryStream::with_config(7, FaultConfig::failing_writes());
        assert!(stream.write_at(0, b"data").is_err());
        assert_eq!(stream.stats().injected_errors, 1);
        assert!(stream.as_bytes().is_empty());
    }

    #[test]
    fn test_torn_writes_are_deterministic() {
        let config = FaultConfig {
            torn_write_rate: 1.0,
            ..FaultConfig::none()
        };
        let mut first = MemoryStream::with_config(42, config.clone());
        let mut second = MemoryStream::with_config(42, config);
        first.write_at(0, &[0xAB; 64]).expect("write");
        second.write_at(0, &[0xAB; 64]).expect("write");

        assert_eq!(first.as_bytes(), second.as_bytes());
        assert!(first.as_bytes().len() < 64);
        assert_eq!(first.stats().torn_writes, 1);
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut stream = MemoryStream::new();
        stream.write_at(0, b"before").expect("write");
        let snapshot = stream.snapshot();
        stream.write_at(0, b"after!").expect("write");

        assert_eq!(snapshot.as_bytes(), b"before");
        assert_eq!(stream.as_bytes(), b"after!");
    }
}
