//! Fork index: the in-memory tree of blocks that are not yet irreversible.
//!
//! The root is the solid block (the durable head). Every other node links to
//! a parent that is either another node or the root, so there are never
//! dangling branches. Chain selection is longest chain, ties broken in favour
//! of the current chain.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use agora_common::{Block, BlockHash, BlockId};
use tracing::debug;

pub mod fork_error;
pub mod fork_node;

pub use fork_error::ForkIndexError;
pub use fork_node::ForkNode;

/// Holds every block above the solid block, across all known branches.
///
/// Operations are single-threaded; the chain coordinator owns the index.
pub struct ForkIndex {
    /// All nodes keyed by hash, root included.
    nodes: HashMap<BlockHash, ForkNode>,
    /// Root of the tree: the solid block.
    root: BlockHash,
    /// Upper bound on how far a common-ancestor walk may go.
    max_branch_length: u64,
}

impl ForkIndex {
    /// Create an index rooted at the solid block.
    pub fn new(root: Arc<Block>, max_branch_length: u64) -> Self {
        let node = ForkNode::new(root, None);
        let root = node.id.hash;
        let mut nodes = HashMap::new();
        nodes.insert(root, node);
        Self {
            nodes,
            root,
            max_branch_length,
        }
    }

    pub fn root(&self) -> BlockId {
        self.nodes[&self.root].id
    }

    pub fn root_block(&self) -> Arc<Block> {
        self.nodes[&self.root].block.clone()
    }

    pub fn max_branch_length(&self) -> u64 {
        self.max_branch_length
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Never true: the root is always present.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.nodes.contains_key(&id.hash)
    }

    pub fn get(&self, id: &BlockId) -> Option<&ForkNode> {
        self.nodes.get(&id.hash)
    }

    pub fn get_by_hash(&self, hash: &BlockHash) -> Option<&ForkNode> {
        self.nodes.get(hash)
    }

    /// Add a block whose parent is already a node.
    ///
    /// Returns `Ok(false)` without change if the block is already known.
    /// On error the index is untouched.
    pub fn insert(&mut self, block: Arc<Block>) -> Result<bool, ForkIndexError> {
        let id = block.id();
        if self.nodes.contains_key(&id.hash) {
            return Ok(false);
        }

        let parent = block.parent();
        let Some(parent_node) = self.nodes.get_mut(&parent.hash) else {
            return Err(ForkIndexError::UnlinkedBlock { parent });
        };
        if id.number != parent_node.number() + 1 {
            return Err(ForkIndexError::InvalidBlockNumber {
                expected: parent_node.number() + 1,
                got: id.number,
            });
        }

        parent_node.children.push(id.hash);
        self.nodes.insert(id.hash, ForkNode::new(block, Some(parent.hash)));
        Ok(true)
    }

    /// Deepest block that is an ancestor of (or equal to) both `a` and `b`.
    ///
    /// Walks the higher one down to the lower one's number, then both up
    /// together. Reaching the root yields the root. More than
    /// `max_branch_length` steps without meeting is a hard fork.
    pub fn common_ancestor(&self, a: &BlockId, b: &BlockId) -> Result<BlockId, ForkIndexError> {
        let mut na = self.node(a)?;
        let mut nb = self.node(b)?;
        let mut steps = 0u64;

        while na.number() > nb.number() {
            let Some(parent) = self.parent_of(na) else {
                return Ok(self.root());
            };
            na = parent;
            steps += 1;
        }
        while nb.number() > na.number() {
            let Some(parent) = self.parent_of(nb) else {
                return Ok(self.root());
            };
            nb = parent;
            steps += 1;
        }

        while na.id != nb.id {
            if steps > self.max_branch_length {
                return Err(ForkIndexError::HardFork {
                    max_branch_length: self.max_branch_length,
                });
            }
            match (self.parent_of(na), self.parent_of(nb)) {
                (Some(pa), Some(pb)) => {
                    na = pa;
                    nb = pb;
                }
                _ => return Ok(self.root()),
            }
            steps += 1;
        }

        Ok(na.id)
    }

    /// Ids from `leaf` down to `ancestor`, leaf first, ancestor excluded.
    pub fn path_to_ancestor(
        &self,
        leaf: &BlockId,
        ancestor: &BlockId,
    ) -> Result<Vec<BlockId>, ForkIndexError> {
        let mut path = Vec::new();
        let mut current = self.node(leaf)?;
        while current.id != *ancestor {
            if current.number() <= ancestor.number {
                return Err(ForkIndexError::NotAncestor {
                    ancestor: *ancestor,
                    leaf: *leaf,
                });
            }
            path.push(current.id);
            current = self.parent_of(current).ok_or(ForkIndexError::NotAncestor {
                ancestor: *ancestor,
                leaf: *leaf,
            })?;
        }
        Ok(path)
    }

    /// Is `block` on the chain ending at `tip`?
    pub fn chain_contains(&self, block: &BlockId, tip: &BlockId) -> bool {
        let mut current = self.nodes.get(&tip.hash);
        while let Some(node) = current {
            if node.id == *block {
                return true;
            }
            if node.number() < block.number {
                return false;
            }
            current = self.parent_of(node);
        }
        false
    }

    /// How many blocks of `head`'s chain would be rolled back to switch to
    /// the chain through `block`.
    pub fn fork_depth(&self, block: &BlockId, head: &BlockId) -> Result<u64, ForkIndexError> {
        let ancestor = self.common_ancestor(block, head)?;
        Ok(head.number - ancestor.number)
    }

    /// The block on `tip`'s chain at `number`, if the chain reaches that far
    /// down inside the index.
    pub fn ancestor_at(&self, tip: &BlockId, number: u64) -> Option<BlockId> {
        let mut current = self.nodes.get(&tip.hash)?;
        while current.number() > number {
            current = self.parent_of(current)?;
        }
        (current.number() == number).then_some(current.id)
    }

    /// Ids on `tip`'s chain above the root, ascending.
    pub fn chain_from_root(&self, tip: &BlockId) -> Result<Vec<BlockId>, ForkIndexError> {
        let root = self.root();
        let mut chain = self.path_to_ancestor(tip, &root)?;
        chain.reverse();
        Ok(chain)
    }

    /// Tip of the preferred chain: the longest, with ties kept on `current`.
    pub fn preferred_tip(&self, current: &BlockId) -> BlockId {
        let best = self
            .nodes
            .values()
            .filter(|node| node.children.is_empty())
            .map(|node| node.id)
            .max_by(|a, b| a.number.cmp(&b.number).then_with(|| b.hash.cmp(&a.hash)))
            .unwrap_or_else(|| self.root());

        match self.nodes.get(&current.hash) {
            Some(node) if node.number() >= best.number => node.id,
            _ => best,
        }
    }

    /// Leaves of every branch.
    pub fn tips(&self) -> Vec<BlockId> {
        let mut tips: Vec<BlockId> = self
            .nodes
            .values()
            .filter(|node| node.children.is_empty())
            .map(|node| node.id)
            .collect();
        tips.sort();
        tips
    }

    /// Remove a block and all its descendants, returning what was removed.
    pub fn remove_branch(&mut self, id: &BlockId) -> Result<Vec<BlockId>, ForkIndexError> {
        let node = self.node(id)?;
        if node.id.hash == self.root {
            return Err(ForkIndexError::RemoveRoot { id: node.id });
        }

        if let Some(parent_hash) = node.parent {
            if let Some(parent) = self.nodes.get_mut(&parent_hash) {
                parent.children.retain(|h| *h != id.hash);
            }
        }

        let removed: Vec<BlockId> = self
            .collect_all_from(id.hash)
            .into_iter()
            .filter_map(|hash| self.nodes.remove(&hash).map(|node| node.id))
            .collect();
        debug!(block = %id, removed = removed.len(), "Removed branch");
        Ok(removed)
    }

    /// Advance the root to the block at `number` on `head`'s chain.
    ///
    /// The spine from just above the current root up to `number` is handed
    /// to `flush` in ascending order. Only if it succeeds are the spine and
    /// every node not descending from the new root dropped. Returns the
    /// number of nodes removed; a `number` at or below the root is a no-op.
    pub fn prune_below<F>(
        &mut self,
        number: u64,
        head: &BlockId,
        flush: F,
    ) -> Result<usize, ForkIndexError>
    where
        F: FnOnce(&[Arc<Block>]) -> anyhow::Result<()>,
    {
        if number <= self.root().number {
            return Ok(0);
        }
        let new_root =
            self.ancestor_at(head, number).ok_or(ForkIndexError::BlockNotInIndex { id: *head })?;

        let spine: Vec<Arc<Block>> = self
            .chain_from_root(&new_root)?
            .iter()
            .filter_map(|id| self.nodes.get(&id.hash).map(|node| node.block.clone()))
            .collect();
        flush(&spine).map_err(ForkIndexError::Flush)?;

        let keep: HashSet<BlockHash> = self.collect_all_from(new_root.hash).into_iter().collect();
        let before = self.nodes.len();
        self.nodes.retain(|hash, _| keep.contains(hash));
        if let Some(node) = self.nodes.get_mut(&new_root.hash) {
            node.parent = None;
        }
        self.root = new_root.hash;

        let removed = before - self.nodes.len();
        debug!(root = %new_root, removed, remaining = self.nodes.len(), "Pruned fork index");
        Ok(removed)
    }

    fn node(&self, id: &BlockId) -> Result<&ForkNode, ForkIndexError> {
        self.nodes.get(&id.hash).ok_or(ForkIndexError::BlockNotInIndex { id: *id })
    }

    fn parent_of(&self, node: &ForkNode) -> Option<&ForkNode> {
        node.parent.and_then(|hash| self.nodes.get(&hash))
    }

    /// `hash` and every hash reachable below it.
    fn collect_all_from(&self, hash: BlockHash) -> Vec<BlockHash> {
        let mut result = vec![hash];
        let mut stack = vec![hash];
        while let Some(h) = stack.pop() {
            if let Some(node) = self.nodes.get(&h) {
                for &child in &node.children {
                    result.push(child);
                    stack.push(child);
                }
            }
        }
        result
    }
}
