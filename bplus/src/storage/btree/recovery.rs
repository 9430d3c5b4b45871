//! Structural checks and repair.
//!
//! A crash between writing fresh node buffers and rewriting the header
//! leaves buffers that neither the committed tree nor the free list reach.
//! If the crashed transaction had taken buffers off the free list, the
//! committed free list head may also point at a buffer that now holds node
//! data. Repair mode handles both: unreachable buffers go back on the free
//! list, and a broken free list is rebuilt from everything the tree does
//! not use.
//!
//! A node that cannot be read or fails its checks is dropped with its
//! whole subtree. The entries of every sound leaf are then reinserted into
//! a fresh tree, and the old node buffers are released on the next commit.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

use super::arena::NodeId;
use super::node::NodeTag;
use super::tree::{IndexTree, TreeError};
use crate::storage::block_store::BlockStoreError;
use crate::storage::codec::BufferNumber;
use crate::storage::io::ByteStream;

/// Summary of a structural check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeRecovery {
    /// Buffers holding live nodes.
    pub nodes_visited: usize,
    /// Buffers on the free list after the check.
    pub free_buffers: usize,
    /// Unreachable buffers put back on the free list.
    pub reclaimed: usize,
    /// Whether the free list had to be rebuilt from scratch.
    pub rebuilt_free_list: bool,
    /// Damaged subtrees dropped from the tree.
    pub pruned_subtrees: usize,
    /// Whether the tree was rebuilt from the entries of its sound leaves.
    pub rebuilt_tree: bool,
}

/// What survives of a damaged tree.
#[derive(Debug, Default)]
struct Salvage {
    entries: Vec<(String, u64)>,
    buffers: BTreeSet<BufferNumber>,
    pruned: usize,
}

/// Errors that mean a node's buffer holds something other than a node.
const fn is_damage(error: &TreeError) -> bool {
    matches!(
        error,
        TreeError::Corruption(_) | TreeError::Block(BlockStoreError::BufferOutOfRange { .. })
    )
}

impl<S: ByteStream> IndexTree<S> {
    /// Check every node and the free list.
    ///
    /// With `fix_errors` unset any anomaly is an error. With it set,
    /// damaged subtrees are dropped, unreachable buffers are reclaimed and
    /// a broken free list is rebuilt. Repairs live in memory until the next
    /// commit.
    pub fn recover(&mut self, fix_errors: bool) -> Result<TreeRecovery, TreeError> {
        let mut report = TreeRecovery::default();
        let mut live = HashSet::new();
        let mut salvaged = Vec::new();
        if let Some(root) = self.root {
            match self.check_subtree(root, &mut live) {
                Ok(_) => report.nodes_visited = live.len(),
                Err(e) if fix_errors && is_damage(&e) => {
                    tracing::warn!("rebuilding damaged tree: {e}");
                    let salvage = self.salvage()?;
                    report.nodes_visited = salvage.buffers.len();
                    report.pruned_subtrees = salvage.pruned;
                    report.rebuilt_tree = true;
                    live.clear();
                    salvaged = self.detach_tree(salvage)?;
                }
                Err(e) => return Err(e),
            }
        }
        let next = self.next_buffer_number()?;

        let mut free = HashSet::new();
        let mut broken = None;
        let mut cursor = self.free_head;
        while let Some(buffer) = cursor {
            if live.contains(&buffer) || free.contains(&buffer) {
                broken = Some(format!("free buffer {buffer} reachable twice"));
                break;
            }
            if buffer >= next {
                broken = Some(format!("free buffer {buffer} beyond end ({next})"));
                break;
            }
            match self.parse_free_buffer(buffer) {
                Ok(following) => {
                    free.insert(buffer);
                    cursor = following;
                }
                Err(e) => {
                    broken = Some(e.to_string());
                    break;
                }
            }
        }

        if let Some(problem) = broken {
            if !fix_errors {
                return Err(TreeError::Corruption(problem));
            }
            tracing::warn!("rebuilding tree free list: {problem}");
            self.free_head = None;
            free.clear();
            report.rebuilt_free_list = true;
        }

        let mut missing: Vec<BufferNumber> = (0..next)
            .filter(|buffer| {
                !live.contains(buffer)
                    && !free.contains(buffer)
                    && !self.free_on_commit.contains(buffer)
            })
            .collect();
        if !missing.is_empty() && !report.rebuilt_free_list {
            if !fix_errors {
                return Err(TreeError::Corruption(format!(
                    "{} unreachable buffers: {missing:?}",
                    missing.len()
                )));
            }
            tracing::warn!("reclaiming {} unreachable tree buffers", missing.len());
        }

        missing.sort_unstable_by(|a, b| b.cmp(a));
        for &buffer in &missing {
            self.push_free_buffer(buffer)?;
        }
        if !report.rebuilt_free_list {
            report.reclaimed = missing.len();
        }
        report.free_buffers = free.len() + missing.len();

        if report.rebuilt_tree {
            tracing::warn!(
                "reinserting {} salvaged entries, {} subtrees dropped",
                salvaged.len(),
                report.pruned_subtrees
            );
        }
        for (key, value) in salvaged {
            self.set(&key, value)?;
        }
        self.shrink_footprint()?;

        tracing::info!(
            nodes = report.nodes_visited,
            free = report.free_buffers,
            reclaimed = report.reclaimed,
            rebuilt = report.rebuilt_free_list,
            pruned = report.pruned_subtrees,
            "tree check complete"
        );
        Ok(report)
    }

    /// Collect the entries of every sound leaf, skipping subtrees whose
    /// root cannot be read or fails its checks.
    fn salvage(&mut self) -> Result<Salvage, TreeError> {
        let mut salvage = Salvage::default();
        let mut pending: Vec<NodeId> = self.root.into_iter().collect();
        while let Some(id) = pending.pop() {
            if let Some(problem) = self.node_problem(id, &salvage.buffers) {
                tracing::warn!(
                    "dropping subtree at buffer {:?}: {problem}",
                    self.arena[id].buffer
                );
                salvage.pruned += 1;
                continue;
            }
            let node = &self.arena[id];
            let used = node.size_in_use();
            if let Some(buffer) = node.buffer {
                salvage.buffers.insert(buffer);
            }
            if node.is_leaf {
                salvage.entries.extend(
                    node.keys[..used]
                        .iter()
                        .flatten()
                        .cloned()
                        .zip(node.pointers[..used].iter().copied()),
                );
                continue;
            }
            for position in 0..=used {
                match self.materialize_child(id, position) {
                    Ok(child) => pending.push(child),
                    Err(e) if is_damage(&e) => {
                        tracing::warn!(
                            "dropping child {position} of buffer {:?}: {e}",
                            self.arena[id].buffer
                        );
                        salvage.pruned += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(salvage)
    }

    /// Local checks that do not depend on the rest of the tree.
    fn node_problem(&self, id: NodeId, seen: &BTreeSet<BufferNumber>) -> Option<String> {
        let node = &self.arena[id];
        if let Some(buffer) = node.buffer {
            if seen.contains(&buffer) {
                return Some(format!("buffer {buffer} reachable twice"));
            }
        }
        let used = node.size_in_use();
        if node.keys[used..].iter().any(Option::is_some) {
            return Some("key after an empty slot".to_string());
        }
        node.keys[..used].windows(2).find_map(|pair| match pair {
            [Some(a), Some(b)] if self.collation.compare(a, b) != Ordering::Less => {
                Some(format!("keys out of order: {a:?} before {b:?}"))
            }
            _ => None,
        })
    }

    /// Drop the materialized tree and retire the buffers it was read from.
    ///
    /// Buffers of the committed tree stay intact until the next commit.
    fn detach_tree(&mut self, salvage: Salvage) -> Result<Vec<(String, u64)>, TreeError> {
        let next = self.next_buffer_number()?;
        self.arena.clear();
        self.terminals.clear();
        self.root = None;
        self.root_buffer = None;
        for &buffer in salvage.buffers.iter().rev() {
            if buffer < next {
                self.defer_release(buffer)?;
            }
        }
        // Anything else this transaction wrote is now unreachable and is
        // reclaimed with the other missing buffers.
        self.free_on_abort.clear();
        Ok(salvage.entries)
    }

    /// Strict check: [`recover`](Self::recover) without repairs, plus no
    /// buffer pending release is already marked free.
    pub fn verify(&mut self) -> Result<TreeRecovery, TreeError> {
        let report = self.recover(false)?;
        let pending: Vec<BufferNumber> = self
            .free_on_commit
            .iter()
            .chain(&self.free_on_abort)
            .copied()
            .collect();
        for buffer in pending {
            let mut tag = [0u8; 1];
            self.blocks.read(buffer, &mut tag)?;
            if tag[0] == NodeTag::Free as u8 {
                return Err(TreeError::Corruption(format!(
                    "buffer {buffer} pending release is already marked free"
                )));
            }
        }
        Ok(report)
    }

    /// Validate the subtree under `id` and return its least key.
    fn check_subtree(
        &mut self,
        id: NodeId,
        live: &mut HashSet<BufferNumber>,
    ) -> Result<Option<String>, TreeError> {
        let node = &self.arena[id];
        if let Some(buffer) = node.buffer {
            if !live.insert(buffer) {
                return Err(TreeError::Corruption(format!(
                    "buffer {buffer} reachable twice"
                )));
            }
        }
        if let Some(parent) = node.parent {
            let index = node.index_in_parent.ok_or_else(|| {
                TreeError::Corruption("child node without an index in its parent".to_string())
            })?;
            let parent_node = &self.arena[parent];
            if parent_node.is_leaf {
                return Err(TreeError::Corruption("parent node is a leaf".to_string()));
            }
            if parent_node.children[index] != Some(id) {
                return Err(TreeError::Corruption(format!(
                    "node is not child {index} of its parent"
                )));
            }
            let required = (self.layout.node_size / 2).saturating_sub(usize::from(node.is_leaf));
            if node.keys[..required].iter().any(Option::is_none) {
                return Err(TreeError::Corruption(format!(
                    "node at buffer {:?} is less than half full",
                    node.buffer
                )));
            }
        }

        let keys: Vec<String> = node.keys.iter().map_while(Clone::clone).collect();
        for pair in keys.windows(2) {
            if self.collation.compare(&pair[0], &pair[1]) != Ordering::Less {
                return Err(TreeError::Corruption(format!(
                    "keys out of order in node: {:?} before {:?}",
                    pair[0], pair[1]
                )));
            }
        }
        if node.is_leaf {
            return Ok(keys.into_iter().next());
        }

        let first = self.materialize_child(id, 0)?;
        let least = self.check_subtree(first, live)?;
        for (index, separator) in keys.iter().enumerate() {
            let child = self.materialize_child(id, index + 1)?;
            let child_least = self.check_subtree(child, live)?;
            if child_least.as_deref() != Some(separator.as_str()) {
                return Err(TreeError::Corruption(format!(
                    "least key {child_least:?} of child {} does not match separator {separator:?}",
                    index + 1
                )));
            }
        }
        Ok(least)
    }
}
