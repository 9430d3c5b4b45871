//! Structural operations: search, insertion with splits, deletion with
//! merges, and writing materialized nodes back out.
//!
//! Every operation works on [`NodeId`]s in the tree's arena. A node's
//! `dirty` flag implies every ancestor is dirty too, which lets
//! [`IndexTree::soil`] stop at the first dirty ancestor.

use std::cmp::Ordering;

use super::arena::NodeId;
use super::node::Node;
use super::tree::{IndexTree, TreeError};
use crate::storage::codec::{BufferNumber, NULL_BUFFER, encode_pointer};
use crate::storage::io::ByteStream;

/// Result of merging two siblings.
enum MergeOutcome {
    /// Everything fit in the left node; the right one must be freed.
    Absorbed,
    /// Entries were split between both nodes; carries the new least key of
    /// the right node.
    Rebalanced(String),
}

impl<S: ByteStream> IndexTree<S> {
    // Navigation.

    /// Child `position` of `id`, loading it from disk if needed.
    pub(super) fn materialize_child(
        &mut self,
        id: NodeId,
        position: usize,
    ) -> Result<NodeId, TreeError> {
        let node = &self.arena[id];
        if node.is_leaf {
            return Err(TreeError::Corruption(
                "cannot materialize a child of a leaf".to_string(),
            ));
        }
        let Some(buffer) = node.child_buffer(position) else {
            return Err(TreeError::Corruption(format!(
                "null subtree at position {position} of buffer {:?}",
                node.buffer
            )));
        };
        if let Some(child) = node.children[position] {
            return Ok(child);
        }

        let mut child = Node::new(self.layout.node_size, true);
        child.parent = Some(id);
        child.index_in_parent = Some(position);
        child.buffer = Some(buffer);
        let child = self.arena.insert(child);
        self.arena[id].children[position] = Some(child);
        if let Err(e) = self.load_node(child, buffer) {
            self.arena[id].children[position] = None;
            self.forget_terminal(child);
            self.arena.remove(child);
            return Err(e);
        }
        self.forget_terminal(id);
        Ok(child)
    }

    /// Descend to the leaf that holds or would hold `key`.
    fn find_leaf(&mut self, key: &str, look_past_only: bool) -> Result<(NodeId, usize), TreeError> {
        let mut id = self.root_id()?;
        loop {
            let position =
                self.arena[id].find_at_or_next_position(self.collation, key, look_past_only);
            if self.arena[id].is_leaf {
                return Ok((id, position));
            }
            id = self.materialize_child(id, position)?;
        }
    }

    pub(super) fn find_match(&mut self, key: &str) -> Result<Option<u64>, TreeError> {
        if self.root.is_none() {
            return Ok(None);
        }
        let (leaf, position) = self.find_leaf(key, false)?;
        let node = &self.arena[leaf];
        Ok(match node.keys.get(position) {
            Some(Some(found)) if self.collation.compare(found, key) == Ordering::Equal => {
                Some(node.pointers[position])
            }
            _ => None,
        })
    }

    pub(super) fn find_next_key(&mut self, after: &str) -> Result<Option<String>, TreeError> {
        let (leaf, position) = self.find_leaf(after, true)?;
        match self.arena[leaf].keys.get(position) {
            Some(Some(found)) => Ok(Some(found.clone())),
            _ => {
                let end = self.arena[leaf].keys.len();
                self.traverse_to_following_key(leaf, end)
            }
        }
    }

    /// First key at or after slot `at` of `id`, climbing to the next
    /// sibling subtree when this node is exhausted.
    fn traverse_to_following_key(
        &mut self,
        mut id: NodeId,
        mut at: usize,
    ) -> Result<Option<String>, TreeError> {
        loop {
            let node = &self.arena[id];
            let exhausted = if node.is_leaf {
                at >= node.keys.len() || node.keys[at].is_none()
            } else {
                at > node.keys.len() || (at > 0 && node.keys[at - 1].is_none())
            };
            if exhausted {
                match (node.parent, node.index_in_parent) {
                    (Some(parent), Some(index)) => {
                        id = parent;
                        at = index + 1;
                        continue;
                    }
                    _ => return Ok(None),
                }
            }
            if node.is_leaf {
                return Ok(node.keys[at].clone());
            }
            id = self.materialize_child(id, at)?;
            at = 0;
        }
    }

    // Bookkeeping.

    /// Mark `id` and its ancestors dirty.
    pub(super) fn soil(&mut self, mut id: NodeId) {
        loop {
            let node = &mut self.arena[id];
            if node.dirty {
                return;
            }
            node.dirty = true;
            match node.parent {
                Some(parent) => id = parent,
                None => return,
            }
        }
    }

    pub(super) fn check_if_terminal(&mut self, id: NodeId) {
        let node = &self.arena[id];
        if !node.is_leaf && node.has_materialized_children() {
            self.forget_terminal(id);
        } else {
            self.record_terminal(id);
        }
    }

    fn reparent(&mut self, child: NodeId, parent: NodeId, index: usize) {
        let node = &mut self.arena[child];
        node.parent = Some(parent);
        node.index_in_parent = Some(index);
        let pointer = encode_pointer(node.buffer);
        let parent_node = &mut self.arena[parent];
        parent_node.pointers[index] = pointer;
        parent_node.children[index] = Some(child);
        self.forget_terminal(parent);
    }

    fn reparent_all_children(&mut self, id: NodeId) {
        for index in 0..self.arena[id].children.len() {
            if let Some(child) = self.arena[id].children[index] {
                self.reparent(child, id, index);
            }
        }
    }

    /// Release the buffer of `id` and drop it from memory.
    pub(super) fn free_node(&mut self, id: NodeId) -> Result<(), TreeError> {
        if let Some(buffer) = self.arena[id].buffer {
            self.defer_release(buffer)?;
        }
        self.forget_terminal(id);
        self.arena.remove(id);
        Ok(())
    }

    pub(super) fn binary_root(&mut self, left: NodeId, key: String, right: NodeId) {
        let mut root = Node::new(self.layout.node_size, false);
        root.keys[0] = Some(key);
        let root = self.arena.insert(root);
        self.root = Some(root);
        self.reparent(left, root, 0);
        self.reparent(right, root, 1);
        self.check_if_terminal(left);
    }

    pub(super) fn make_root(&mut self, id: NodeId) -> Result<(), TreeError> {
        let node = &mut self.arena[id];
        node.parent = None;
        node.index_in_parent = None;
        let buffer = node
            .buffer
            .ok_or_else(|| TreeError::Corruption("new root has no buffer".to_string()))?;
        self.forget_terminal(id);
        self.root = Some(id);
        self.root_buffer = Some(buffer);
        Ok(())
    }

    /// Write `id` and its materialized descendants back to disk and detach
    /// them from memory. Returns the buffer now holding `id`.
    ///
    /// The node itself is dropped from the arena only when `destroy` is set.
    pub(super) fn invalidate(&mut self, id: NodeId, destroy: bool) -> Result<BufferNumber, TreeError> {
        if !self.arena[id].is_leaf {
            for index in 0..self.arena[id].children.len() {
                if let Some(child) = self.arena[id].children[index] {
                    let buffer = self.invalidate(child, true)?;
                    self.arena[id].pointers[index] = buffer;
                }
            }
        }
        let (buffer, dirty) = (self.arena[id].buffer, self.arena[id].dirty);
        let buffer = match buffer {
            Some(buffer) if !dirty => buffer,
            _ => self.dump_to_fresh_buffer(id)?,
        };
        self.forget_terminal(id);

        let parent = self.arena[id].parent;
        let index = self.arena[id].index_in_parent.take();
        if let (Some(parent), Some(index)) = (parent, index) {
            let parent_node = &mut self.arena[parent];
            parent_node.children[index] = None;
            parent_node.pointers[index] = buffer;
            self.check_if_terminal(parent);
        }
        if destroy {
            self.arena.remove(id);
        }
        Ok(buffer)
    }

    // Insertion.

    /// Insert under `id`. Returns the separator key and new right sibling
    /// when `id` had to split.
    pub(super) fn insert(
        &mut self,
        id: NodeId,
        key: &str,
        value: u64,
    ) -> Result<Option<(String, NodeId)>, TreeError> {
        if self.arena[id].is_leaf {
            return self.insert_leaf(id, key, value);
        }
        let position = self.arena[id].find_at_or_next_position(self.collation, key, false);
        if self.arena[id].child_buffer(position).is_none() {
            return Err(TreeError::Corruption(
                "key not followed by child pointer in non-leaf".to_string(),
            ));
        }
        let child = self.materialize_child(id, position)?;
        let Some((child_split_key, child_split)) = self.insert(child, key, value)? else {
            return Ok(None);
        };

        self.soil(id);
        let node_size = self.layout.node_size;
        let new_position = position + 1;
        let node = &mut self.arena[id];
        let split = node.pointers[node_size] != NULL_BUFFER;
        if split {
            node.prepare_for_split();
        }
        node.keys.insert(position, Some(child_split_key));
        node.keys.pop();
        node.pointers.insert(new_position, NULL_BUFFER);
        node.pointers.pop();
        node.children.insert(new_position, None);
        node.children.pop();
        self.reparent(child_split, id, new_position);

        if !split {
            self.reparent_all_children(id);
            return Ok(None);
        }

        let node = &mut self.arena[id];
        let split_point = node.children.len() / 2 - 1;
        let split_key = node.keys[split_point]
            .clone()
            .ok_or_else(|| TreeError::Corruption("empty split key in non-leaf".to_string()))?;
        let tail_keys = node.keys.split_off(split_point + 1);
        node.keys.truncate(split_point);
        node.keys.resize(node_size, None);
        let tail_pointers = node.pointers.split_off(split_point + 1);
        node.pointers.resize(node_size + 1, NULL_BUFFER);
        let tail_children = node.children.split_off(split_point + 1);
        node.children.resize(node_size + 1, None);

        let mut right = Node::new(node_size, false);
        right.parent = node.parent;
        for (slot, key) in right.keys.iter_mut().zip(tail_keys) {
            *slot = key;
        }
        for (slot, pointer) in right.pointers.iter_mut().zip(tail_pointers) {
            *slot = pointer;
        }
        for (slot, child) in right.children.iter_mut().zip(tail_children) {
            *slot = child;
        }
        let right = self.arena.insert(right);
        self.reparent_all_children(right);
        self.dump_to_fresh_buffer(right)?;
        self.check_if_terminal(right);
        self.soil(right);
        self.check_if_terminal(id);
        self.reparent_all_children(id);
        Ok(Some((split_key, right)))
    }

    fn insert_leaf(
        &mut self,
        id: NodeId,
        key: &str,
        value: u64,
    ) -> Result<Option<(String, NodeId)>, TreeError> {
        self.soil(id);
        let collation = self.collation;
        let node_size = self.layout.node_size;
        let node = &mut self.arena[id];
        let position = node.find_at_or_next_position(collation, key, false);

        let mut split = false;
        if position >= node_size {
            split = true;
            node.prepare_for_split();
        } else if node.keys[position]
            .as_deref()
            .is_none_or(|existing| collation.compare(existing, key) == Ordering::Equal)
        {
            node.keys[position] = Some(key.to_string());
            node.pointers[position] = value;
            return Ok(None);
        }

        let null_index = match node.keys[position..].iter().position(Option::is_none) {
            Some(offset) => position + offset,
            None if split => {
                return Err(TreeError::Corruption("leaf cannot split twice".to_string()));
            }
            None => {
                split = true;
                node.prepare_for_split();
                node.keys.len() - 1
            }
        };
        node.keys.remove(null_index);
        node.keys.insert(position, Some(key.to_string()));
        node.pointers.remove(null_index);
        node.pointers.insert(position, value);
        if !split {
            return Ok(None);
        }

        let split_point = node.keys.len() / 2;
        let tail_keys = node.keys.split_off(split_point);
        node.keys.resize(node_size, None);
        let tail_pointers = node.pointers.split_off(split_point);
        node.pointers.resize(node_size + 1, NULL_BUFFER);
        node.children.truncate(node_size + 1);

        let mut right = Node::new(node_size, true);
        right.parent = node.parent;
        for (slot, key) in right.keys.iter_mut().zip(tail_keys) {
            *slot = key;
        }
        for (slot, pointer) in right.pointers.iter_mut().zip(tail_pointers) {
            *slot = pointer;
        }
        let split_key = right.keys[0]
            .clone()
            .ok_or_else(|| TreeError::Corruption("empty split key in leaf".to_string()))?;
        let right = self.arena.insert(right);
        self.dump_to_fresh_buffer(right)?;
        self.record_terminal(right);
        self.soil(right);
        Ok(Some((split_key, right)))
    }

    // Deletion.

    /// Delete `key` under `id`.
    ///
    /// Returns the new least key of the subtree when it changed, and whether
    /// `id` fell below half full. A leaf that emptied out reports the deleted
    /// key itself as its least key.
    pub(super) fn delete(
        &mut self,
        id: NodeId,
        key: &str,
    ) -> Result<(Option<String>, bool), TreeError> {
        if self.arena[id].is_leaf {
            return self.delete_leaf(id, key);
        }
        let collation = self.collation;
        let node_size = self.layout.node_size;
        let position = self.arena[id].find_at_or_next_position(collation, key, false);
        if self.arena[id].child_buffer(position).is_none() {
            return Err(TreeError::Corruption(
                "key not followed by child pointer in non-leaf".to_string(),
            ));
        }
        let child = self.materialize_child(id, position)?;
        let (child_least, merge_child) = self.delete(child, key)?;
        self.soil(id);

        if child_least
            .as_deref()
            .is_some_and(|least| collation.compare(least, key) == Ordering::Equal)
        {
            // Only reachable with tiny nodes, where a leaf can empty out.
            if node_size > 3 {
                return Err(TreeError::Corruption(format!(
                    "leaf emptied out in tree of node size {node_size}"
                )));
            }
            let node = &mut self.arena[id];
            let least = if position == 0 {
                node.keys.remove(0)
            } else {
                node.keys.remove(position - 1);
                None
            };
            node.keys.push(None);
            node.pointers.remove(position);
            node.pointers.push(NULL_BUFFER);
            node.children.remove(position);
            node.children.push(None);
            let merge = node.size_in_use() < node_size / 2;
            self.free_node(child)?;
            self.reparent_all_children(id);
            return Ok((least, merge));
        }

        let least = if position == 0 {
            child_least
        } else {
            if let Some(child_least) = child_least {
                self.arena[id].keys[position - 1] = Some(child_least);
            }
            None
        };
        if !merge_child {
            return Ok((least, false));
        }

        let (left, right, right_index) = if position == 0 {
            (child, self.materialize_child(id, 1)?, 1)
        } else {
            (self.materialize_child(id, position - 1)?, child, position)
        };
        let key_between = self.arena[id].keys[right_index - 1]
            .clone()
            .ok_or_else(|| TreeError::Corruption("missing separator for merge".to_string()))?;

        let mut merge = false;
        match self.merge(left, key_between, right)? {
            MergeOutcome::Absorbed => {
                let node = &mut self.arena[id];
                node.keys.remove(right_index - 1);
                node.keys.push(None);
                node.pointers.remove(right_index);
                node.pointers.push(NULL_BUFFER);
                node.children.remove(right_index);
                node.children.push(None);
                merge = node.size_in_use() < node_size / 2;
                self.reparent_all_children(id);
                self.free_node(right)?;
            }
            MergeOutcome::Rebalanced(right_least) => {
                self.arena[id].keys[right_index - 1] = Some(right_least);
            }
        }
        Ok((least, merge))
    }

    fn delete_leaf(&mut self, id: NodeId, key: &str) -> Result<(Option<String>, bool), TreeError> {
        let collation = self.collation;
        let node_size = self.layout.node_size;
        let Some(location) = self.arena[id].keys.iter().position(|slot| {
            slot.as_deref()
                .is_some_and(|existing| collation.compare(existing, key) == Ordering::Equal)
        }) else {
            return Err(TreeError::KeyMissing(key.to_string()));
        };

        self.soil(id);
        let node = &mut self.arena[id];
        node.keys.remove(location);
        node.keys.push(None);
        node.pointers.remove(location);
        node.pointers.insert(node_size - 1, NULL_BUFFER);
        let merge = node.size_in_use() < node_size / 2;
        let least = if location == 0 {
            Some(node.keys[0].clone().unwrap_or_else(|| key.to_string()))
        } else {
            None
        };
        Ok((least, merge))
    }

    fn merge(
        &mut self,
        left: NodeId,
        key_between: String,
        right: NodeId,
    ) -> Result<MergeOutcome, TreeError> {
        match (self.arena[left].is_leaf, self.arena[right].is_leaf) {
            (true, true) => return Ok(self.merge_leaves(left, right)),
            (false, false) => {}
            _ => {
                return Err(TreeError::Corruption(
                    "cannot merge a leaf with a non-leaf".to_string(),
                ));
            }
        }
        if self.arena[left].pointers[0] == NULL_BUFFER || self.arena[right].pointers[0] == NULL_BUFFER
        {
            return Err(TreeError::Corruption(
                "cannot merge an empty non-leaf".to_string(),
            ));
        }

        let mut keys = Vec::new();
        let mut pointers = Vec::new();
        let mut children = Vec::new();
        for (id, separator) in [(left, Some(key_between)), (right, None)] {
            let node = &self.arena[id];
            let used = node.size_in_use();
            pointers.extend_from_slice(&node.pointers[..=used]);
            children.extend_from_slice(&node.children[..=used]);
            keys.extend(node.keys[..used].iter().flatten().cloned());
            keys.extend(separator);
        }

        let node_size = self.layout.node_size;
        let total = keys.len();
        if total <= node_size {
            fill_node(&mut self.arena[left], node_size, keys, &pointers, &children);
            self.reparent_all_children(left);
            self.check_if_terminal(left);
            self.soil(left);
            return Ok(MergeOutcome::Absorbed);
        }

        let left_count = total / 2;
        let right_keys = keys.split_off(left_count + 1);
        let right_least = keys.pop().ok_or_else(|| {
            TreeError::Corruption("no key left to separate merged nodes".to_string())
        })?;
        fill_node(
            &mut self.arena[left],
            node_size,
            keys,
            &pointers[..=left_count],
            &children[..=left_count],
        );
        fill_node(
            &mut self.arena[right],
            node_size,
            right_keys,
            &pointers[left_count + 1..],
            &children[left_count + 1..],
        );
        for id in [left, right] {
            self.soil(id);
            self.reparent_all_children(id);
            self.check_if_terminal(id);
        }
        Ok(MergeOutcome::Rebalanced(right_least))
    }

    fn merge_leaves(&mut self, left: NodeId, right: NodeId) -> MergeOutcome {
        let mut keys = Vec::new();
        let mut values = Vec::new();
        for id in [left, right] {
            let node = &self.arena[id];
            let used = node.size_in_use();
            keys.extend(node.keys[..used].iter().flatten().cloned());
            values.extend_from_slice(&node.pointers[..used]);
        }

        let node_size = self.layout.node_size;
        let total = keys.len();
        if total <= node_size {
            fill_leaf(&mut self.arena[left], node_size, keys, &values);
            self.soil(left);
            return MergeOutcome::Absorbed;
        }

        let left_count = total - total / 2;
        let right_keys = keys.split_off(left_count);
        let right_least = right_keys[0].clone();
        fill_leaf(&mut self.arena[left], node_size, keys, &values[..left_count]);
        fill_leaf(&mut self.arena[right], node_size, right_keys, &values[left_count..]);
        self.soil(left);
        self.soil(right);
        MergeOutcome::Rebalanced(right_least)
    }
}

fn fill_leaf(node: &mut Node, node_size: usize, keys: Vec<String>, values: &[u64]) {
    node.clear(node_size);
    for (slot, key) in node.keys.iter_mut().zip(keys) {
        *slot = Some(key);
    }
    node.pointers[..values.len()].copy_from_slice(values);
}

fn fill_node(
    node: &mut Node,
    node_size: usize,
    keys: Vec<String>,
    pointers: &[u64],
    children: &[Option<NodeId>],
) {
    node.clear(node_size);
    for (slot, key) in node.keys.iter_mut().zip(keys) {
        *slot = Some(key);
    }
    node.pointers[..pointers.len()].copy_from_slice(pointers);
    node.children[..children.len()].copy_from_slice(children);
}
