// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Region tree for packing rectangles into an atlas.
//!
//! Each node covers a rectangle and is either available, occupied by one
//! owner, or divided into up to four children. Allocating from an available
//! node splits off the requested corner when the leftover is larger than the
//! minimum size; freeing a node merges siblings back together once they are
//! all available again.
//!
//! Nodes carry two clocks. `pin` is the epoch of the last batch that used the
//! node: the node cannot be evicted until that epoch has retired. `stamp` is
//! a use counter that orders eviction among unpinned nodes. Both propagate to
//! ancestors so a subtree can be judged from its root.

use drmsurf_common::RectInt;

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Available,
    Occupied,
    Divided,
}

#[derive(Debug)]
struct Node<T> {
    state: NodeState,
    parent: Option<NodeId>,
    children: [Option<NodeId>; 4],
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    pin: u64,
    stamp: u64,
    owner: Option<T>,
}

impl<T> Node<T> {
    fn child_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.iter().flatten().copied()
    }
}

pub struct RTree<T> {
    nodes: Vec<Option<Node<T>>>,
    free: Vec<NodeId>,
    root: NodeId,
    min_size: u32,
    retired: u64,
    clock: u64,
}

impl<T> RTree<T> {
    pub fn new(width: u32, height: u32, min_size: u32) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: 0,
            min_size,
            retired: 0,
            clock: 0,
        };
        tree.root = tree.new_node(None, 0, 0, width, height);
        tree
    }

    fn new_node(&mut self, parent: Option<NodeId>, x: u32, y: u32, width: u32, height: u32) -> NodeId {
        let node = Node {
            state: NodeState::Available,
            parent,
            children: [None; 4],
            x,
            y,
            width,
            height,
            pin: 0,
            stamp: 0,
            owner: None,
        };
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn node(&self, id: NodeId) -> Option<&Node<T>> {
        self.nodes.get(id).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node<T>> {
        self.nodes.get_mut(id).and_then(Option::as_mut)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn width(&self) -> u32 {
        self.node(self.root).map_or(0, |n| n.width)
    }

    pub fn height(&self) -> u32 {
        self.node(self.root).map_or(0, |n| n.height)
    }

    pub fn state(&self, id: NodeId) -> Option<NodeState> {
        self.node(id).map(|n| n.state)
    }

    pub fn rect(&self, id: NodeId) -> Option<RectInt> {
        self.node(id)
            .map(|n| RectInt::new(n.x as i32, n.y as i32, n.width, n.height))
    }

    pub fn owner(&self, id: NodeId) -> Option<&T> {
        self.node(id).and_then(|n| n.owner.as_ref())
    }

    pub fn set_owner(&mut self, id: NodeId, owner: T) {
        if let Some(node) = self.node_mut(id) {
            node.owner = Some(owner);
        }
    }

    /// Detach the owner of `id`, leaving the node allocated.
    pub fn take_owner(&mut self, id: NodeId) -> Option<T> {
        self.node_mut(id).and_then(|n| n.owner.take())
    }

    /// Number of occupied nodes.
    pub fn occupied(&self) -> usize {
        self.nodes
            .iter()
            .flatten()
            .filter(|n| n.state == NodeState::Occupied)
            .count()
    }

    /// Epoch up to which pins no longer protect a node.
    pub fn retired(&self) -> u64 {
        self.retired
    }

    pub fn is_pinned(&self, id: NodeId) -> bool {
        self.node(id).is_some_and(|n| n.pin > self.retired)
    }

    /// Protect `id` until batch `epoch` retires.
    pub fn pin(&mut self, id: NodeId, epoch: u64) {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.node_mut(current) else { break };
            node.pin = node.pin.max(epoch);
            cursor = node.parent;
        }
    }

    /// Mark `id` as just used.
    pub fn touch(&mut self, id: NodeId) {
        self.clock += 1;
        let stamp = self.clock;
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.node_mut(current) else { break };
            node.stamp = stamp;
            cursor = node.parent;
        }
    }

    /// Every batch up to `retired` has completed; their pins lapse.
    pub fn unpin_all(&mut self, retired: u64) {
        self.retired = self.retired.max(retired);
    }

    fn find_available(&self, id: NodeId, width: u32, height: u32) -> Option<NodeId> {
        let node = self.node(id)?;
        if node.width < width || node.height < height {
            return None;
        }
        match node.state {
            NodeState::Available => Some(id),
            NodeState::Occupied => None,
            NodeState::Divided => node
                .child_ids()
                .find_map(|child| self.find_available(child, width, height)),
        }
    }

    /// Carve `width`x`height` out of the available node `id`.
    fn allocate(&mut self, id: NodeId, width: u32, height: u32) -> Option<NodeId> {
        let (x, y, w, h) = {
            let node = self.node(id)?;
            (node.x, node.y, node.width, node.height)
        };
        let rest_w = w - width;
        let rest_h = h - height;

        if rest_w <= self.min_size && rest_h <= self.min_size {
            let node = self.node_mut(id)?;
            node.state = NodeState::Occupied;
            return Some(id);
        }

        let mut children = [None; 4];
        let first = self.new_node(Some(id), x, y, width, height);
        children[0] = Some(first);
        if rest_w > self.min_size {
            children[1] = Some(self.new_node(Some(id), x + width, y, rest_w, height));
        }
        if rest_h > self.min_size {
            children[2] = Some(self.new_node(Some(id), x, y + height, width, rest_h));
        }
        if rest_w > self.min_size && rest_h > self.min_size {
            children[3] = Some(self.new_node(Some(id), x + width, y + height, rest_w, rest_h));
        }

        let node = self.node_mut(id)?;
        node.state = NodeState::Divided;
        node.children = children;
        self.node_mut(first)?.state = NodeState::Occupied;
        Some(first)
    }

    /// Allocate a `width`x`height` region without evicting anything.
    pub fn insert(&mut self, width: u32, height: u32) -> Option<NodeId> {
        let id = self.find_available(self.root, width, height)?;
        let allocated = self.allocate(id, width, height)?;
        self.touch(allocated);
        Some(allocated)
    }

    /// Free the least recently used unpinned subtree large enough for
    /// `width`x`height` and allocate from it.
    ///
    /// Returns the new node and the owners that were evicted, or `None` when
    /// every candidate is pinned.
    pub fn evict(&mut self, width: u32, height: u32) -> Option<(NodeId, Vec<T>)> {
        let victim = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(id, node)| node.as_ref().map(|n| (id, n)))
            .filter(|(_, n)| n.width >= width && n.height >= height)
            .filter(|(_, n)| n.pin <= self.retired)
            .min_by_key(|(_, n)| n.stamp)
            .map(|(id, _)| id)?;

        let mut evicted = Vec::new();
        self.release_subtree(victim, &mut evicted);
        if let Some(node) = self.node_mut(victim) {
            node.state = NodeState::Available;
            node.children = [None; 4];
        }
        log::debug!(
            "rtree: evicted node {} ({} owners) for {}x{}",
            victim,
            evicted.len(),
            width,
            height
        );
        let allocated = self.allocate(victim, width, height)?;
        self.touch(allocated);
        Some((allocated, evicted))
    }

    /// Take the owners of `id` and its descendants and free the descendants.
    fn release_subtree(&mut self, id: NodeId, owners: &mut Vec<T>) {
        let children: Vec<NodeId> = match self.node_mut(id) {
            Some(node) => {
                if let Some(owner) = node.owner.take() {
                    owners.push(owner);
                }
                node.child_ids().collect()
            }
            None => return,
        };
        for child in children {
            self.release_subtree(child, owners);
            self.nodes[child] = None;
            self.free.push(child);
        }
    }

    /// Free an occupied node, merging emptied parents. Returns its owner.
    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        let node = self.node_mut(id)?;
        if node.state != NodeState::Occupied {
            return None;
        }
        node.state = NodeState::Available;
        let owner = node.owner.take();
        let mut parent = node.parent;

        while let Some(pid) = parent {
            let Some(p) = self.node(pid) else { break };
            let children: Vec<NodeId> = p.child_ids().collect();
            let all_free = children
                .iter()
                .all(|&c| self.state(c) == Some(NodeState::Available));
            if !all_free {
                break;
            }
            for child in children {
                self.nodes[child] = None;
                self.free.push(child);
            }
            let Some(p) = self.node_mut(pid) else { break };
            p.state = NodeState::Available;
            p.children = [None; 4];
            parent = p.parent;
        }
        owner
    }

    /// Drop every allocation.
    pub fn reset(&mut self) -> Vec<T> {
        let mut owners = Vec::new();
        let root = self.root;
        self.release_subtree(root, &mut owners);
        if let Some(node) = self.node_mut(root) {
            node.state = NodeState::Available;
            node.children = [None; 4];
            node.pin = 0;
        }
        owners
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_splits_corner() {
        let mut tree: RTree<u32> = RTree::new(256, 256, 4);
        let a = tree.insert(16, 16).unwrap();
        assert_eq!(tree.rect(a), Some(RectInt::new(0, 0, 16, 16)));
        assert_eq!(tree.state(tree.root()), Some(NodeState::Divided));
        let b = tree.insert(16, 16).unwrap();
        assert_ne!(tree.rect(a), tree.rect(b));
        assert_eq!(tree.occupied(), 2);
    }

    #[test]
    fn test_small_leftover_not_split() {
        let mut tree: RTree<u32> = RTree::new(20, 20, 8);
        let a = tree.insert(16, 16).unwrap();
        assert_eq!(a, tree.root());
        assert!(tree.insert(1, 1).is_none());
    }

    #[test]
    fn test_remove_coalesces() {
        let mut tree = RTree::new(64, 64, 2);
        let ids: Vec<_> = (0..4).map(|i| {
            let id = tree.insert(8, 8).unwrap();
            tree.set_owner(id, i);
            id
        }).collect();
        for (i, id) in ids.into_iter().enumerate() {
            assert_eq!(tree.remove(id), Some(i));
        }
        assert_eq!(tree.state(tree.root()), Some(NodeState::Available));
        assert_eq!(tree.occupied(), 0);
        // The whole area is usable again.
        assert_eq!(tree.insert(64, 64), Some(tree.root()));
    }

    #[test]
    fn test_evict_prefers_least_recent() {
        let mut tree = RTree::new(32, 16, 0);
        let a = tree.insert(16, 16).unwrap();
        tree.set_owner(a, "a");
        let b = tree.insert(16, 16).unwrap();
        tree.set_owner(b, "b");
        assert!(tree.insert(16, 16).is_none());

        tree.touch(a);
        let (node, evicted) = tree.evict(16, 16).unwrap();
        assert_eq!(evicted, vec!["b"]);
        assert_eq!(tree.rect(node), tree.rect(b));
        assert_eq!(tree.owner(a), Some(&"a"));
    }

    #[test]
    fn test_pinned_nodes_survive_until_retired() {
        let mut tree = RTree::new(16, 16, 0);
        let a = tree.insert(16, 16).unwrap();
        tree.set_owner(a, 1u32);
        tree.pin(a, 3);

        assert!(tree.is_pinned(a));
        assert!(tree.evict(16, 16).is_none());
        tree.unpin_all(2);
        assert!(tree.evict(16, 16).is_none());
        assert_eq!(tree.owner(a), Some(&1));

        tree.unpin_all(3);
        assert!(!tree.is_pinned(a));
        let (_, evicted) = tree.evict(16, 16).unwrap();
        assert_eq!(evicted, vec![1]);
    }

    #[test]
    fn test_take_owner_keeps_node() {
        let mut tree = RTree::new(16, 16, 0);
        let a = tree.insert(16, 16).unwrap();
        tree.set_owner(a, 5u32);
        assert_eq!(tree.take_owner(a), Some(5));
        assert_eq!(tree.state(a), Some(NodeState::Occupied));
        let (_, evicted) = tree.evict(16, 16).unwrap();
        assert!(evicted.is_empty());
    }

    #[test]
    fn test_reset_returns_owners() {
        let mut tree = RTree::new(64, 64, 0);
        for i in 0..3 {
            let id = tree.insert(8, 8).unwrap();
            tree.set_owner(id, i);
        }
        let mut owners = tree.reset();
        owners.sort();
        assert_eq!(owners, vec![0, 1, 2]);
        assert_eq!(tree.occupied(), 0);
    }
}
