//! Slot arena for materialized nodes and the terminal-node FIFO.
//!
//! Parent and child links are `NodeId`s into the arena. A slot is vacated
//! only when its node is discarded, and every discarded node is forgotten
//! by the FIFO first, so a live id never refers to a recycled slot.

use std::collections::{HashMap, VecDeque};
use std::ops::{Index, IndexMut};

use super::node::Node;

/// Handle to a materialized node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Default)]
pub struct NodeArena {
    slots: Vec<Option<Node>>,
    vacant: Vec<usize>,
}

impl NodeArena {
    pub fn insert(&mut self, node: Node) -> NodeId {
        if let Some(slot) = self.vacant.pop() {
            self.slots[slot] = Some(node);
            NodeId(slot)
        } else {
            self.slots.push(Some(node));
            NodeId(self.slots.len() - 1)
        }
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        let node = self.slots.get_mut(id.0)?.take()?;
        self.vacant.push(id.0);
        Some(node)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.vacant.clear();
    }

    /// Number of materialized nodes.
    pub fn len(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }
}

impl Index<NodeId> for NodeArena {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        match self.slots.get(id.0) {
            Some(Some(node)) => node,
            _ => panic!("node {} is not materialized", id.0),
        }
    }
}

impl IndexMut<NodeId> for NodeArena {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        match self.slots.get_mut(id.0) {
            Some(Some(node)) => node,
            _ => panic!("node {} is not materialized", id.0),
        }
    }
}

/// Materialized nodes without materialized children, oldest first.
///
/// Eviction order is insertion order. Forgetting a node only drops its
/// id from the map; the stale queue entry is skipped when it surfaces.
#[derive(Debug, Default)]
pub struct TerminalFifo {
    order: VecDeque<(u64, NodeId)>,
    ids: HashMap<NodeId, u64>,
    next_id: u64,
}

impl TerminalFifo {
    pub fn record(&mut self, node: NodeId) {
        if self.ids.contains_key(&node) {
            return;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ids.insert(node, id);
        self.order.push_back((id, node));
        if self.order.len() > 2 * self.ids.len() + 16 {
            let ids = &self.ids;
            self.order.retain(|(id, node)| ids.get(node) == Some(id));
        }
    }

    pub fn forget(&mut self, node: NodeId) {
        self.ids.remove(&node);
    }

    /// Remove and return the oldest recorded node.
    pub fn pop_oldest(&mut self) -> Option<NodeId> {
        while let Some((id, node)) = self.order.pop_front() {
            if self.ids.get(&node) == Some(&id) {
                self.ids.remove(&node);
                return Some(node);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_reuses_slots() {
        let mut arena = NodeArena::default();
        let a = arena.insert(Node::new(4, true));
        let b = arena.insert(Node::new(4, false));
        assert_eq!(arena.len(), 2);

        assert!(arena.remove(a).is_some());
        assert!(arena.remove(a).is_none());
        let c = arena.insert(Node::new(4, true));
        assert_eq!(c, a);
        assert!(!arena[b].is_leaf);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_fifo_evicts_in_insertion_order() {
        let mut arena = NodeArena::default();
        let ids: Vec<NodeId> = (0..4).map(|_| arena.insert(Node::new(2, true))).collect();
        let mut fifo = TerminalFifo::default();
        for &id in &ids {
            fifo.record(id);
        }
        // Re-recording does not refresh the position.
        fifo.record(ids[0]);
        fifo.forget(ids[1]);

        assert_eq!(fifo.len(), 3);
        assert_eq!(fifo.pop_oldest(), Some(ids[0]));
        assert_eq!(fifo.pop_oldest(), Some(ids[2]));

        // A forgotten node recorded again goes to the back.
        fifo.record(ids[1]);
        assert_eq!(fifo.pop_oldest(), Some(ids[3]));
        assert_eq!(fifo.pop_oldest(), Some(ids[1]));
        assert_eq!(fifo.pop_oldest(), None);
    }
}
