// Recursive insert and delete over index nodes
//
// Every step reports a TreeOutcome to its parent. A node that outgrows its
// block divides and promotes its middle entry; a root that outgrows the
// record moves its entries into a new block (depose). On delete, internal
// matches are swapped for their predecessor, empty leaves are freed, and
// single-child nodes are lifted out of the tree.

use super::entry::{IndexEntry, IndexNode};
use super::{Index, NodeId};
use log::{debug, trace};
use ntfsrw_core::{NtfsError, Result};
use std::cmp::Ordering;

// A volume never holds an index this deep; reaching it means a cycle
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeOutcome {
    NoChange,
    /// The child divided; its parent must insert this entry in front of
    /// the entry it descended through.
    Promote(IndexEntry),
    Replaced,
}

pub(super) fn check_depth(depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(NtfsError::FormatCorruption(format!(
            "index deeper than {} levels; the tree has a cycle",
            MAX_DEPTH
        )));
    }
    Ok(())
}

impl<'a> Index<'a> {
    /// Position of the first entry not less than `key`, and whether it is equal.
    fn position(&self, node: &IndexNode, key: &[u8]) -> (usize, bool) {
        let upcase = self.volume.upcase();
        for (i, entry) in node.entries.iter().enumerate() {
            if entry.is_end {
                return (i, false);
            }
            match self.rule.compare(key, &entry.key, upcase) {
                Ordering::Greater => continue,
                Ordering::Equal => return (i, true),
                Ordering::Less => return (i, false),
            }
        }
        (node.entries.len().saturating_sub(1), false)
    }

    pub(super) fn lookup(&mut self, key: &[u8]) -> Result<Option<IndexEntry>> {
        let mut id = NodeId::Root;
        for _ in 0..=MAX_DEPTH {
            let node = self.load(id)?;
            let (i, found) = self.position(&node, key);
            if found {
                return Ok(Some(IndexEntry { child: None, ..node.entries[i].clone() }));
            }
            match node.entries[i].child {
                Some(child) => id = NodeId::Block(child),
                None => return Ok(None),
            }
        }
        Err(NtfsError::FormatCorruption(format!(
            "index lookup passed {} levels; the tree has a cycle",
            MAX_DEPTH
        )))
    }

    // Insert

    pub(super) fn insert_into(&mut self, id: NodeId, entry: IndexEntry, depth: usize) -> Result<TreeOutcome> {
        check_depth(depth)?;
        let mut node = self.load(id)?;
        let (i, found) = self.position(&node, &entry.key);
        if found {
            let existing = &mut node.entries[i];
            if existing.value.len() != entry.value.len() {
                return Err(NtfsError::LogicalMisuse(format!(
                    "replacing an index value of {} bytes with {} bytes",
                    existing.value.len(),
                    entry.value.len()
                )));
            }
            if existing.value != entry.value {
                existing.value = entry.value;
                self.store(id, &node)?;
            }
            return Ok(TreeOutcome::Replaced);
        }
        match node.entries[i].child {
            Some(child) => match self.insert_into(NodeId::Block(child), entry, depth + 1)? {
                TreeOutcome::Promote(up) => {
                    node.entries.insert(i, up);
                    self.settle(id, node)
                }
                other => Ok(other),
            },
            None => {
                node.entries.insert(i, entry);
                self.settle(id, node)
            }
        }
    }

    /// Store a modified node, restructuring it if it no longer fits.
    fn settle(&mut self, id: NodeId, node: IndexNode) -> Result<TreeOutcome> {
        if self.fits(id, &node) {
            self.store(id, &node)?;
            return Ok(TreeOutcome::NoChange);
        }
        match id {
            NodeId::Root => {
                self.depose(node)?;
                Ok(TreeOutcome::NoChange)
            }
            NodeId::Block(vcn) => Ok(TreeOutcome::Promote(self.divide(vcn, node)?)),
        }
    }

    /// Split an overfull block at its byte midpoint. The lower half moves
    /// to a new block; the returned entry points at it and must go to the
    /// parent.
    fn divide(&mut self, vcn: u64, node: IndexNode) -> Result<IndexEntry> {
        let real = node.real_len();
        if real < 3 {
            return Err(NtfsError::CapacityExhausted(format!(
                "{} index entries of {} bytes overflow a {}-byte block",
                real,
                node.entries_len(self.format),
                self.block_size
            )));
        }
        let sizes: Vec<usize> = node.entries[..real].iter().map(|e| e.encoded_len(self.format)).collect();
        let total: usize = sizes.iter().sum();
        let mut acc = 0;
        let mut mid = real / 2;
        for (i, size) in sizes.iter().enumerate() {
            acc += size;
            if acc * 2 >= total {
                mid = i;
                break;
            }
        }
        let mid = mid.clamp(1, real - 2);

        let mut right = node.entries;
        let mut left: Vec<IndexEntry> = right.drain(..mid).collect();
        let mut up = right.remove(0);
        left.push(IndexEntry::end(up.child));

        let left_vcn = self.allocate_block()?;
        self.store(NodeId::Block(left_vcn), &IndexNode { entries: left })?;
        self.store(NodeId::Block(vcn), &IndexNode { entries: right })?;
        up.child = Some(left_vcn);
        self.stats.divides += 1;
        trace!("Divided index block VCN {} at entry {}; lower half now VCN {}", vcn, mid, left_vcn);
        Ok(up)
    }

    /// Move the root's entries into a new block, dividing it if needed, and
    /// leave the root pointing down at the result.
    pub(super) fn depose(&mut self, root: IndexNode) -> Result<()> {
        let vcn = self.allocate_block()?;
        let child = IndexNode { entries: root.entries };
        let mut new_root = IndexNode { entries: vec![IndexEntry::end(Some(vcn))] };
        if self.fits(NodeId::Block(vcn), &child) {
            self.store(NodeId::Block(vcn), &child)?;
        } else {
            let up = self.divide(vcn, child)?;
            new_root.entries.insert(0, up);
        }
        self.store(NodeId::Root, &new_root)?;
        self.stats.deposes += 1;
        debug!(
            "Deposed root of index {} into VCN {} ({} root entries remain)",
            crate::structures::from_utf16(&self.name),
            vcn,
            new_root.real_len()
        );
        Ok(())
    }

    // Delete

    /// Remove `key` below `id`. Entries displaced while repairing the tree
    /// are pushed to `pending` for reinsertion from the root.
    pub(super) fn remove_from(
        &mut self,
        id: NodeId,
        key: &[u8],
        pending: &mut Vec<IndexEntry>,
        depth: usize,
    ) -> Result<(Option<IndexEntry>, TreeOutcome)> {
        check_depth(depth)?;
        let mut node = self.load(id)?;
        let (i, found) = self.position(&node, key);

        if found {
            let Some(child) = node.entries[i].child else {
                let removed = node.entries.remove(i);
                self.store(id, &node)?;
                return Ok((Some(removed), TreeOutcome::NoChange));
            };
            // The predecessor (largest key of the left subtree) takes its place
            let (predecessor, outcome) = self.remove_largest(NodeId::Block(child), pending, depth + 1)?;
            let original = std::mem::replace(
                &mut node.entries[i],
                IndexEntry { child: Some(child), ..predecessor },
            );
            self.absorb(&mut node, i, outcome, pending)?;
            let outcome = self.settle(id, node)?;
            return Ok((Some(IndexEntry { child: None, ..original }), outcome));
        }

        let Some(child) = node.entries[i].child else {
            return Ok((None, TreeOutcome::NoChange));
        };
        let (removed, outcome) = self.remove_from(NodeId::Block(child), key, pending, depth + 1)?;
        if removed.is_none() {
            return Ok((None, TreeOutcome::NoChange));
        }
        self.absorb(&mut node, i, outcome, pending)?;
        Ok((removed, self.settle(id, node)?))
    }

    /// Detach the largest entry below `id`.
    fn remove_largest(
        &mut self,
        id: NodeId,
        pending: &mut Vec<IndexEntry>,
        depth: usize,
    ) -> Result<(IndexEntry, TreeOutcome)> {
        check_depth(depth)?;
        let mut node = self.load(id)?;
        let last = node.entries.len() - 1;
        match node.entries[last].child {
            Some(child) => {
                let (entry, outcome) = self.remove_largest(NodeId::Block(child), pending, depth + 1)?;
                self.absorb(&mut node, last, outcome, pending)?;
                Ok((entry, self.settle(id, node)?))
            }
            None => {
                if last == 0 {
                    return Err(NtfsError::FormatCorruption(format!(
                        "empty index leaf {:?} inside the tree",
                        id
                    )));
                }
                let entry = node.entries.remove(last - 1);
                self.store(id, &node)?;
                Ok((entry, TreeOutcome::NoChange))
            }
        }
    }

    /// Apply a child's outcome to the entry at `i` that leads to it.
    fn absorb(
        &mut self,
        node: &mut IndexNode,
        i: usize,
        outcome: TreeOutcome,
        pending: &mut Vec<IndexEntry>,
    ) -> Result<()> {
        match outcome {
            TreeOutcome::Promote(up) => {
                node.entries.insert(i, up);
                Ok(())
            }
            _ => self.fix_child(node, i, pending),
        }
    }

    /// Repair the subtree under entry `i` after a removal beneath it.
    fn fix_child(&mut self, node: &mut IndexNode, i: usize, pending: &mut Vec<IndexEntry>) -> Result<()> {
        let Some(child) = node.entries[i].child else {
            return Ok(());
        };
        let child_node = self.load(NodeId::Block(child))?;

        if child_node.is_empty_leaf() {
            self.free_block(child)?;
            if !node.entries[i].is_end {
                let mut orphan = node.entries.remove(i);
                orphan.child = None;
                pending.push(orphan);
            } else if i > 0 {
                // Populate: End adopts the left neighbour's subtree and the
                // neighbour goes back in from the top
                let mut left = node.entries.remove(i - 1);
                node.entries[i - 1].child = left.child.take();
                pending.push(left);
            } else {
                node.entries[i].child = None;
            }
            trace!("Freed empty index leaf VCN {}", child);
        } else if let Some(grandchild) = child_node.lone_child() {
            node.entries[i].child = Some(grandchild);
            self.free_block(child)?;
            self.stats.lifts += 1;
            trace!("Lifted VCN {} over its lone parent VCN {}", grandchild, child);
        }
        Ok(())
    }
}
