//! A binary range tree over the guest's virtual address space.
//!
//! Leaves split lazily: only when an inserted object partially covers a
//! leaf's interval. Both halves of a split inherit copies of the entries
//! that intersect them, so a range query is the union of all intersecting
//! leaves. Internal nodes cache a property summary that is refreshed on
//! insertion only; overlapping inserts may inflate its object count.

use hashbrown::HashSet;

use crate::symbols::RealTypeSet;

use super::node::NodeId;

/// What the tree stores per object: a snapshot taken at insert time, so
/// sanity checks against existing coverage need no other lock.
#[derive(Debug, Clone, Copy)]
pub struct RangeEntry {
    pub node: NodeId,
    pub start: u64,
    pub end: u64,
    pub probability: f32,
    pub rtype: RealTypeSet,
    pub type_hash: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RangeProperties {
    pub min_probability: f32,
    pub max_probability: f32,
    pub object_count: usize,
    pub type_mask: RealTypeSet,
}

impl Default for RangeProperties {
    fn default() -> Self {
        RangeProperties {
            min_probability: 1.0,
            max_probability: 0.0,
            object_count: 0,
            type_mask: RealTypeSet::empty(),
        }
    }
}

impl RangeProperties {
    pub fn is_empty(&self) -> bool {
        self.object_count == 0
    }

    fn update(&mut self, e: &RangeEntry) {
        self.min_probability = self.min_probability.min(e.probability);
        self.max_probability = self.max_probability.max(e.probability);
        self.object_count += 1;
        self.type_mask |= e.rtype;
    }

    pub fn unite(&mut self, other: &RangeProperties) {
        if other.object_count == 0 {
            return;
        }
        if self.object_count == 0 {
            *self = *other;
            return;
        }
        self.min_probability = self.min_probability.min(other.min_probability);
        self.max_probability = self.max_probability.max(other.max_probability);
        self.object_count += other.object_count;
        self.type_mask |= other.type_mask;
    }
}

#[derive(Debug)]
struct TreeNode {
    start: u64,
    end: u64,
    properties: RangeProperties,
    left: Option<Box<TreeNode>>,
    right: Option<Box<TreeNode>>,
    /// Populated on leaves only.
    entries: Vec<RangeEntry>,
}

impl TreeNode {
    fn new(start: u64, end: u64) -> TreeNode {
        TreeNode {
            start,
            end,
            properties: RangeProperties::default(),
            left: None,
            right: None,
            entries: Vec::new(),
        }
    }

    fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }

    fn split_addr(&self) -> u64 {
        self.start + ((self.end - self.start) >> 1)
    }

    fn insert(&mut self, e: RangeEntry) {
        self.properties.update(&e);
        if self.is_leaf() {
            // Full coverage (or an unsplittable single byte) stays here.
            if (e.start <= self.start && e.end >= self.end) || self.start == self.end {
                self.entries.push(e);
                return;
            }
            self.split();
        }
        let mid = self.split_addr();
        if e.start <= mid {
            self.left.as_mut().unwrap().insert(e);
        }
        if e.end > mid {
            self.right.as_mut().unwrap().insert(e);
        }
    }

    /// Turns this leaf into an interior node; existing entries are copied
    /// into every intersecting half.
    fn split(&mut self) {
        let mid = self.split_addr();
        let mut left = Box::new(TreeNode::new(self.start, mid));
        let mut right = Box::new(TreeNode::new(mid + 1, self.end));
        for e in self.entries.drain(..) {
            if e.start <= mid {
                left.properties.update(&e);
                left.entries.push(e);
            }
            if e.end > mid {
                right.properties.update(&e);
                right.entries.push(e);
            }
        }
        self.left = Some(left);
        self.right = Some(right);
    }

    fn query(&self, start: u64, end: u64, seen: &mut HashSet<NodeId>, out: &mut Vec<RangeEntry>) {
        if end < self.start || start > self.end {
            return;
        }
        if self.is_leaf() {
            for e in &self.entries {
                if e.end >= start && e.start <= end && seen.insert(e.node) {
                    out.push(*e);
                }
            }
            return;
        }
        if let Some(l) = &self.left {
            l.query(start, end, seen, out);
        }
        if let Some(r) = &self.right {
            r.query(start, end, seen, out);
        }
    }

    fn properties_of(&self, start: u64, end: u64, out: &mut RangeProperties) {
        if end < self.start || start > self.end {
            return;
        }
        if start <= self.start && end >= self.end {
            out.unite(&self.properties);
            return;
        }
        if self.is_leaf() {
            let mut props = RangeProperties::default();
            for e in &self.entries {
                if e.end >= start && e.start <= end {
                    props.update(e);
                }
            }
            out.unite(&props);
            return;
        }
        if let Some(l) = &self.left {
            l.properties_of(start, end, out);
        }
        if let Some(r) = &self.right {
            r.properties_of(start, end, out);
        }
    }

    fn remove(&mut self, node: NodeId, start: u64, end: u64) -> usize {
        if end < self.start || start > self.end {
            return 0;
        }
        if self.is_leaf() {
            let before = self.entries.len();
            self.entries.retain(|e| e.node != node);
            return before - self.entries.len();
        }
        let mut removed = 0;
        if let Some(l) = &mut self.left {
            removed += l.remove(node, start, end);
        }
        if let Some(r) = &mut self.right {
            removed += r.remove(node, start, end);
        }
        removed
    }
}

#[derive(Debug)]
pub struct MemoryRangeTree {
    root: Option<Box<TreeNode>>,
    addr_space_end: u64,
    objects: usize,
}

impl MemoryRangeTree {
    /// `addr_space_end` is the address of the last byte, e.g. `0xffffffff`.
    pub fn new(addr_space_end: u64) -> MemoryRangeTree {
        MemoryRangeTree {
            root: None,
            addr_space_end,
            objects: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.objects == 0
    }

    /// Unique objects inserted and not removed.
    pub fn object_count(&self) -> usize {
        self.objects
    }

    pub fn addr_space_end(&self) -> u64 {
        self.addr_space_end
    }

    pub fn clear(&mut self) {
        self.root = None;
        self.objects = 0;
    }

    pub fn insert(&mut self, mut e: RangeEntry) {
        if e.end > self.addr_space_end {
            e.end = self.addr_space_end;
        }
        if e.end < e.start {
            e.end = e.start;
        }
        self.root
            .get_or_insert_with(|| Box::new(TreeNode::new(0, self.addr_space_end)))
            .insert(e);
        self.objects += 1;
    }

    /// All objects whose range intersects `[start, end]`, deduplicated.
    pub fn objects_in_range(&self, start: u64, end: u64) -> Vec<RangeEntry> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        if let Some(root) = &self.root {
            root.query(start, end.min(self.addr_space_end), &mut seen, &mut out);
        }
        out
    }

    pub fn objects_at(&self, address: u64) -> Vec<RangeEntry> {
        self.objects_in_range(address, address)
    }

    /// Best-effort property summary of `[start, end]`.
    pub fn properties_of_range(&self, start: u64, end: u64) -> RangeProperties {
        let mut props = RangeProperties::default();
        if let Some(root) = &self.root {
            root.properties_of(start, end.min(self.addr_space_end), &mut props);
        }
        props
    }

    /// Removes every copy of `node` within its recorded range.
    pub fn remove(&mut self, node: NodeId, start: u64, end: u64) {
        if let Some(root) = &mut self.root {
            if root.remove(node, start, end.min(self.addr_space_end)) > 0 {
                self.objects = self.objects.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::RealType;

    fn entry(node: NodeId, start: u64, end: u64, prob: f32) -> RangeEntry {
        RangeEntry {
            node,
            start,
            end,
            probability: prob,
            rtype: RealType::Struct.bit(),
            type_hash: node as u32,
        }
    }

    #[test]
    fn insert_covers_itself() {
        let mut t = MemoryRangeTree::new(u64::MAX);
        t.insert(entry(1, 0x1000, 0x1fff, 0.9));
        let hits = t.objects_in_range(0x1000, 0x1fff);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].node, 1);
    }

    #[test]
    fn overlapping_entries_both_reported() {
        let mut t = MemoryRangeTree::new(u64::MAX);
        t.insert(entry(1, 0x1000, 0x17ff, 0.9));
        t.insert(entry(2, 0x1400, 0x1fff, 0.5));
        // Any query intersecting either interval covers both where they overlap.
        let hits = t.objects_in_range(0x1500, 0x1500);
        assert_eq!(hits.len(), 2);
        let hits = t.objects_in_range(0x1800, 0x1900);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].node, 2);
        assert_eq!(t.object_count(), 2);
    }

    #[test]
    fn query_deduplicates_across_leaves() {
        let mut t = MemoryRangeTree::new(u64::MAX);
        // Force splits around a large object.
        t.insert(entry(1, 0x0, 0xffff, 1.0));
        t.insert(entry(2, 0x100, 0x1ff, 0.8));
        t.insert(entry(3, 0xf000, 0xf0ff, 0.7));
        let hits = t.objects_in_range(0, 0xffff);
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn properties_summarize() {
        let mut t = MemoryRangeTree::new(u64::MAX);
        t.insert(entry(1, 0x1000, 0x1fff, 0.9));
        t.insert(entry(2, 0x3000, 0x3fff, 0.4));
        let p = t.properties_of_range(0, u64::MAX);
        assert_eq!(p.object_count, 2);
        assert_eq!(p.min_probability, 0.4);
        assert_eq!(p.max_probability, 0.9);
        assert!(p.type_mask.contains(RealType::Struct.bit()));
        let p = t.properties_of_range(0x3000, 0x3fff);
        assert_eq!(p.max_probability, 0.4);
    }

    #[test]
    fn remove_drops_all_copies() {
        let mut t = MemoryRangeTree::new(u64::MAX);
        t.insert(entry(1, 0x1000, 0x8fff, 0.9));
        t.insert(entry(2, 0x2000, 0x2fff, 0.8));
        t.remove(1, 0x1000, 0x8fff);
        let hits = t.objects_in_range(0, u64::MAX);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].node, 2);
        assert_eq!(t.object_count(), 1);
    }
}
