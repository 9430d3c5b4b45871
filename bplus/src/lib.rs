//! Transactional string-keyed storage on a disk-resident B+tree.
//!
//! [`storage::IndexTree`] maps keys to 64-bit values and
//! [`storage::KeyedChunkStore`] maps keys to byte strings. Both commit
//! atomically through shadow paging and can repair the space a crashed
//! transaction leaves behind.

pub mod config;
pub mod storage;
