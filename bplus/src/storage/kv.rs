//! Common interface over the two transactional maps.
//!
//! [`IndexTree`] maps keys to 64-bit values and [`KeyedChunkStore`] maps
//! keys to byte strings. Code that only walks, reads, or rewrites entries
//! can be written once against [`KeyValueIndex`].

use crate::storage::btree::{IndexTree, TreeError};
use crate::storage::io::ByteStream;
use crate::storage::keyed::{KeyedChunkStore, StoreError};

/// An ordered, transactional map keyed by strings.
///
/// Changes become durable on [`commit`](Self::commit) and are discarded by
/// [`abort`](Self::abort).
pub trait KeyValueIndex {
    type Value;
    type Error: std::error::Error;

    fn get(&mut self, key: &str) -> Result<Option<Self::Value>, Self::Error>;
    fn set(&mut self, key: &str, value: Self::Value) -> Result<(), Self::Error>;
    fn remove_key(&mut self, key: &str) -> Result<(), Self::Error>;
    fn first_key(&mut self) -> Result<Option<String>, Self::Error>;
    fn next_key(&mut self, after: &str) -> Result<Option<String>, Self::Error>;
    fn commit(&mut self) -> Result<(), Self::Error>;
    fn abort(&mut self) -> Result<(), Self::Error>;

    fn contains_key(&mut self, key: &str) -> Result<bool, Self::Error> {
        Ok(self.get(key)?.is_some())
    }

    /// Every key in collation order.
    fn keys(&mut self) -> Result<Vec<String>, Self::Error> {
        let mut keys = Vec::new();
        let mut cursor = self.first_key()?;
        while let Some(key) = cursor {
            cursor = self.next_key(&key)?;
            keys.push(key);
        }
        Ok(keys)
    }
}

impl<S: ByteStream> KeyValueIndex for IndexTree<S> {
    type Value = u64;
    type Error = TreeError;

    fn get(&mut self, key: &str) -> Result<Option<u64>, TreeError> {
        Self::get(self, key)
    }

    fn set(&mut self, key: &str, value: u64) -> Result<(), TreeError> {
        Self::set(self, key, value)
    }

    fn remove_key(&mut self, key: &str) -> Result<(), TreeError> {
        Self::remove_key(self, key)
    }

    fn first_key(&mut self) -> Result<Option<String>, TreeError> {
        Self::first_key(self)
    }

    fn next_key(&mut self, after: &str) -> Result<Option<String>, TreeError> {
        Self::next_key(self, after)
    }

    fn commit(&mut self) -> Result<(), TreeError> {
        Self::commit(self)
    }

    fn abort(&mut self) -> Result<(), TreeError> {
        Self::abort(self)
    }

    fn contains_key(&mut self, key: &str) -> Result<bool, TreeError> {
        Self::contains_key(self, key)
    }
}

impl<S: ByteStream> KeyValueIndex for KeyedChunkStore<S> {
    type Value = Vec<u8>;
    type Error = StoreError;

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Self::get(self, key)
    }

    fn set(&mut self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        Self::set(self, key, &value)
    }

    fn remove_key(&mut self, key: &str) -> Result<(), StoreError> {
        Self::remove_key(self, key)
    }

    fn first_key(&mut self) -> Result<Option<String>, StoreError> {
        Self::first_key(self)
    }

    fn next_key(&mut self, after: &str) -> Result<Option<String>, StoreError> {
        Self::next_key(self, after)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        Self::commit(self)
    }

    fn abort(&mut self) -> Result<(), StoreError> {
        Self::abort(self)
    }

    fn contains_key(&mut self, key: &str) -> Result<bool, StoreError> {
        Self::contains_key(self, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::Collation;
    use crate::storage::keyed::StoreOptions;
    use crate::storage::memory::MemoryStream;

    /// Write `count` entries, drop one, abort a stray write, and return the
    /// surviving keys.
    fn exercise<I: KeyValueIndex>(
        index: &mut I,
        count: usize,
        value: impl Fn(usize) -> I::Value,
    ) -> Vec<String> {
        for i in 0..count {
            index.set(&format!("k{i:03}"), value(i)).expect("set");
        }
        index.commit().expect("commit");
        index.remove_key("k001").expect("remove");
        index.commit().expect("commit");

        index.set("zzz", value(0)).expect("set");
        index.abort().expect("abort");
        assert!(!index.contains_key("zzz").expect("contains"));
        assert!(!index.contains_key("k001").expect("contains"));
        index.keys().expect("keys")
    }

    #[test]
    fn test_index_tree_through_trait() {
        let mut tree = IndexTree::create(MemoryStream::new(), 0, 8, 4, Collation::Ordinal)
            .expect("create tree");
        let keys = exercise(&mut tree, 20, |i| i as u64);

        assert_eq!(keys.len(), 19);
        assert_eq!(keys.first().map(String::as_str), Some("k000"));
        assert_eq!(keys.get(1).map(String::as_str), Some("k002"));
        assert_eq!(KeyValueIndex::get(&mut tree, "k019").expect("get"), Some(19));
    }

    #[test]
    fn test_keyed_store_through_trait() {
        let options = StoreOptions {
            payload_size: 32,
            ..StoreOptions::with_key_length(8)
        };
        let mut store =
            KeyedChunkStore::initialize(MemoryStream::new(), MemoryStream::new(), &options)
                .expect("create store");
        let keys = exercise(&mut store, 12, |i| vec![b'x'; i * 7]);

        assert_eq!(keys.len(), 11);
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(
            KeyValueIndex::get(&mut store, "k011").expect("get"),
            Some(vec![b'x'; 77])
        );
    }
}
