//! Tree node records and their buffer layout.
//!
//! # Node Format
//!
//! ```text
//! +-----+-------------------+--------------------------------------------------+
//! | Tag | First Pointer     | Slot x node_size                                 |
//! | (1) | (i64)             | Key Len (i16) | Key Bytes (max key) | Ptr (i64)  |
//! +-----+-------------------+--------------------------------------------------+
//! ```
//!
//! A key length of `-1` marks an empty slot. Pointer `i` is the first
//! pointer for `i == 0` and the pointer of slot `i - 1` otherwise. In a leaf,
//! key `i` maps to pointer `i` and the last pointer is unused. In a non-leaf,
//! pointer `i` is child `i`, and child `i + 1` holds keys at or above key `i`.
//! The buffer ends with two spare bytes per slot so its size matches older
//! files.
//!
//! A released buffer is rewritten as `Tag (2) | Next Free (i64)`.

use std::cmp::Ordering;

use super::arena::NodeId;
use super::collation::Collation;
use super::tree::TreeError;
use crate::storage::codec::{Block, BufferNumber, NULL_BUFFER, decode_pointer};

/// Length prefix in front of every key.
pub const KEY_LENGTH_PREFIX: usize = 2;

/// Spare bytes per slot at the end of each buffer.
const SLOT_PADDING: usize = 2;

const POINTER_SIZE: usize = 8;

/// Type tag in the first byte of every tree buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeTag {
    NonLeaf = 0,
    Leaf = 1,
    Free = 2,
}

impl TryFrom<u8> for NodeTag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::NonLeaf),
            1 => Ok(Self::Leaf),
            2 => Ok(Self::Free),
            _ => Err(value),
        }
    }
}

/// Shape shared by every node of one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    pub node_size: usize,
    /// Key storage per slot, including the length prefix.
    pub key_storage: usize,
}

impl NodeLayout {
    #[must_use]
    pub const fn max_key_length(&self) -> usize {
        self.key_storage - KEY_LENGTH_PREFIX
    }

    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        1 + POINTER_SIZE + (self.key_storage + SLOT_PADDING + POINTER_SIZE) * self.node_size
    }

    /// Whether `key` fits in a slot.
    #[must_use]
    pub const fn key_fits(&self, key: &str) -> bool {
        key.len() <= self.max_key_length()
    }

    /// Serialize `node` into a full buffer.
    pub fn encode(&self, node: &Node) -> Result<Block, TreeError> {
        let mut block = Block::zeroed(self.buffer_size());
        block.write_u8(
            0,
            if node.is_leaf {
                NodeTag::Leaf as u8
            } else {
                NodeTag::NonLeaf as u8
            },
        );
        block.write_u64(1, node.pointers[0]);

        let max_key = self.max_key_length();
        let mut offset = 1 + POINTER_SIZE;
        let mut previous_present = true;
        for slot in 0..self.node_size {
            let key = node.keys[slot].as_deref();
            let pointer = node.pointers[slot + 1];
            match key {
                Some(key) => {
                    if !self.key_fits(key) {
                        return Err(TreeError::BadKeyValue(format!(
                            "key of {} bytes exceeds maximum {max_key}",
                            key.len()
                        )));
                    }
                    if !previous_present {
                        return Err(TreeError::Corruption(format!(
                            "empty slot followed by key at slot {slot}"
                        )));
                    }
                    let length = i16::try_from(key.len()).map_err(|_| {
                        TreeError::BadKeyValue(format!("key of {} bytes is too long", key.len()))
                    })?;
                    block.write_i16(offset, length);
                    block.write_bytes(offset + KEY_LENGTH_PREFIX, key.as_bytes());
                }
                None => {
                    if !node.is_leaf && pointer != NULL_BUFFER {
                        return Err(TreeError::Corruption(format!(
                            "empty slot {slot} paired with child pointer {pointer}"
                        )));
                    }
                    block.write_i16(offset, -1);
                }
            }
            previous_present = key.is_some();
            offset += self.key_storage;
            block.write_u64(offset, pointer);
            offset += POINTER_SIZE;
        }
        Ok(block)
    }

    /// Deserialize a buffer into `node`, replacing its contents.
    pub fn decode(&self, block: &Block, node: &mut Node) -> Result<(), TreeError> {
        if block.len() != self.buffer_size() {
            return Err(TreeError::Corruption(format!(
                "buffer of {} bytes, expected {}",
                block.len(),
                self.buffer_size()
            )));
        }
        node.clear(self.node_size);
        node.is_leaf = match NodeTag::try_from(block.read_u8(0)) {
            Ok(NodeTag::Leaf) => true,
            Ok(NodeTag::NonLeaf) => false,
            Ok(NodeTag::Free) => {
                return Err(TreeError::Corruption(
                    "node buffer is marked free".to_string(),
                ));
            }
            Err(tag) => {
                return Err(TreeError::Corruption(format!("unknown node tag {tag}")));
            }
        };
        node.pointers[0] = block.read_u64(1);

        let max_key = self.max_key_length();
        let mut offset = 1 + POINTER_SIZE;
        let mut previous_present = true;
        for slot in 0..self.node_size {
            let raw_length = block.read_i16(offset);
            let key = match usize::try_from(raw_length) {
                Err(_) if raw_length == -1 => None,
                Ok(length) if length <= max_key => {
                    let bytes = block.read_bytes(offset + KEY_LENGTH_PREFIX, length);
                    let key = std::str::from_utf8(bytes).map_err(|_| {
                        TreeError::Corruption(format!("key at slot {slot} is not valid UTF-8"))
                    })?;
                    Some(key.to_string())
                }
                _ => {
                    return Err(TreeError::Corruption(format!(
                        "invalid key length {raw_length} at slot {slot}"
                    )));
                }
            };
            offset += self.key_storage;
            let pointer = block.read_u64(offset);
            offset += POINTER_SIZE;

            if !node.is_leaf {
                if key.is_none() && pointer != NULL_BUFFER {
                    return Err(TreeError::Corruption(format!(
                        "empty slot {slot} paired with child pointer {pointer}"
                    )));
                }
                if !previous_present && key.is_some() {
                    return Err(TreeError::Corruption(format!(
                        "empty slot followed by key at slot {slot}"
                    )));
                }
            }
            previous_present = key.is_some();
            node.keys[slot] = key;
            node.pointers[slot + 1] = pointer;
        }
        Ok(())
    }
}

/// A materialized tree node.
///
/// `keys` has `node_size` slots and `pointers`/`children` one more, except
/// while a split is in progress when each carries one extra slot.
#[derive(Debug, Clone)]
pub struct Node {
    pub is_leaf: bool,
    pub dirty: bool,
    pub parent: Option<NodeId>,
    pub index_in_parent: Option<usize>,
    pub buffer: Option<BufferNumber>,
    pub keys: Vec<Option<String>>,
    /// Child buffer numbers (non-leaf) or values (leaf), raw on-disk form.
    pub pointers: Vec<u64>,
    pub children: Vec<Option<NodeId>>,
}

impl Node {
    #[must_use]
    pub fn new(node_size: usize, is_leaf: bool) -> Self {
        let mut node = Self {
            is_leaf,
            dirty: true,
            parent: None,
            index_in_parent: None,
            buffer: None,
            keys: Vec::new(),
            pointers: Vec::new(),
            children: Vec::new(),
        };
        node.clear(node_size);
        node
    }

    /// Empty every slot.
    pub fn clear(&mut self, node_size: usize) {
        self.keys = vec![None; node_size];
        self.pointers = vec![NULL_BUFFER; node_size + 1];
        self.children = vec![None; node_size + 1];
    }

    /// Grow every array by one slot ahead of a split.
    pub fn prepare_for_split(&mut self) {
        self.keys.push(None);
        self.pointers.push(NULL_BUFFER);
        self.children.push(None);
    }

    /// Number of leading populated key slots.
    #[must_use]
    pub fn size_in_use(&self) -> usize {
        self.keys.iter().take_while(|key| key.is_some()).count()
    }

    #[must_use]
    pub fn child_buffer(&self, position: usize) -> Option<BufferNumber> {
        decode_pointer(self.pointers[position])
    }

    #[must_use]
    pub fn has_materialized_children(&self) -> bool {
        self.children.iter().any(Option::is_some)
    }

    /// First slot whose key is above `key`, or at or above it when
    /// searching a leaf for an exact match.
    ///
    /// In a non-leaf this is the child that may hold `key`. In a leaf with
    /// `look_past_only` set it is the first key strictly after `key`.
    #[must_use]
    pub fn find_at_or_next_position(
        &self,
        collation: Collation,
        key: &str,
        look_past_only: bool,
    ) -> usize {
        let stop_at_equal = self.is_leaf && !look_past_only;
        self.keys
            .iter()
            .position(|slot| match slot {
                None => true,
                Some(existing) => {
                    let order = collation.compare(existing, key);
                    if stop_at_equal {
                        order != Ordering::Less
                    } else {
                        order == Ordering::Greater
                    }
                }
            })
            .unwrap_or(self.keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: NodeLayout = NodeLayout {
        node_size: 3,
        key_storage: 8,
    };

    #[test]
    fn test_buffer_size() {
        // 1 tag + 8 first pointer + 3 * (8 key + 8 pointer) + 3 * 2 spare
        assert_eq!(LAYOUT.buffer_size(), 63);
        assert_eq!(LAYOUT.max_key_length(), 6);
    }

    #[test]
    fn test_leaf_encode_decode() {
        let mut leaf = Node::new(3, true);
        leaf.keys[0] = Some("alpha".to_string());
        leaf.pointers[0] = 11;
        leaf.keys[1] = Some("beta".to_string());
        leaf.pointers[1] = 22;

        let block = LAYOUT.encode(&leaf).expect("encode");
        assert_eq!(block.read_u8(0), NodeTag::Leaf as u8);
        assert_eq!(block.read_i16(9), 5);

        let mut decoded = Node::new(3, false);
        LAYOUT.decode(&block, &mut decoded).expect("decode");
        assert!(decoded.is_leaf);
        assert_eq!(decoded.keys, leaf.keys);
        assert_eq!(decoded.pointers, leaf.pointers);
        assert_eq!(decoded.size_in_use(), 2);
    }

    #[test]
    fn test_empty_key_is_distinct_from_absent() {
        let mut leaf = Node::new(3, true);
        leaf.keys[0] = Some(String::new());
        let block = LAYOUT.encode(&leaf).expect("encode");

        let mut decoded = Node::new(3, true);
        LAYOUT.decode(&block, &mut decoded).expect("decode");
        assert_eq!(decoded.keys[0].as_deref(), Some(""));
        assert_eq!(decoded.keys[1], None);
    }

    #[test]
    fn test_oversized_key_rejected() {
        let mut leaf = Node::new(3, true);
        leaf.keys[0] = Some("toolong!".to_string());
        assert!(matches!(
            LAYOUT.encode(&leaf),
            Err(TreeError::BadKeyValue(_))
        ));
    }

    #[test]
    fn test_non_leaf_rejects_orphan_pointer() {
        let mut node = Node::new(3, false);
        node.pointers[0] = 1;
        node.keys[0] = Some("m".to_string());
        node.pointers[1] = 2;
        node.pointers[2] = 3;
        assert!(matches!(LAYOUT.encode(&node), Err(TreeError::Corruption(_))));
    }

    #[test]
    fn test_decode_rejects_free_buffer() {
        let mut block = Block::zeroed(LAYOUT.buffer_size());
        block.write_u8(0, NodeTag::Free as u8);
        let mut node = Node::new(3, true);
        assert!(matches!(
            LAYOUT.decode(&block, &mut node),
            Err(TreeError::Corruption(_))
        ));
    }

    #[test]
    fn test_find_position() {
        let mut leaf = Node::new(3, true);
        leaf.keys[0] = Some("b".to_string());
        leaf.keys[1] = Some("d".to_string());
        let c = Collation::Ordinal;
        assert_eq!(leaf.find_at_or_next_position(c, "a", false), 0);
        assert_eq!(leaf.find_at_or_next_position(c, "b", false), 0);
        assert_eq!(leaf.find_at_or_next_position(c, "b", true), 1);
        assert_eq!(leaf.find_at_or_next_position(c, "z", false), 2);

        let mut inner = Node::new(3, false);
        inner.keys[0] = Some("m".to_string());
        assert_eq!(inner.find_at_or_next_position(c, "a", false), 0);
        assert_eq!(inner.find_at_or_next_position(c, "m", false), 1);
    }
}
