//! The global ordered index: a splay tree holding every segment in document
//! order. Two aggregates ride on each subtree: the total *visible* extent
//! (so linear positions resolve in amortized log time) and the segment count
//! (so segments have stable integer ranks for the integration ordering rule).

use crate::error::{Error, Result};
use crate::point::Point;
use crate::segment::{Segment, SegmentIdx, SegmentPool};
use crate::splay::{self, Links, SplaySpace};

pub(crate) enum DocSpace {}

impl SplaySpace for DocSpace {
    #[inline]
    fn links(segment: &Segment) -> &Links {
        &segment.doc_links
    }

    #[inline]
    fn links_mut(segment: &mut Segment) -> &mut Links {
        &mut segment.doc_links
    }

    fn update_aggregate<V: Fn(&Segment) -> bool>(
        pool: &mut SegmentPool,
        vis: &V,
        segment: SegmentIdx,
    ) {
        let mut extent = Point::zero();
        let mut size = 1;
        if let Some(l) = pool[segment].doc_links.left {
            extent = extent.traverse(pool[l].doc_subtree_extent);
            size += pool[l].doc_subtree_size;
        }
        if vis(&pool[segment]) {
            extent = extent.traverse(pool[segment].extent);
        }
        if let Some(r) = pool[segment].doc_links.right {
            extent = extent.traverse(pool[r].doc_subtree_extent);
            size += pool[r].doc_subtree_size;
        }
        let seg = &mut pool[segment];
        seg.doc_subtree_extent = extent;
        seg.doc_subtree_size = size;
    }
}

#[derive(Debug)]
pub(crate) struct DocumentTree {
    root: SegmentIdx,
    first: SegmentIdx,
}

impl DocumentTree {
    /// Builds the initial tree holding just the two boundary sentinels.
    pub fn new(pool: &mut SegmentPool, first: SegmentIdx, last: SegmentIdx) -> DocumentTree {
        pool[first].doc_links.right = Some(last);
        pool[last].doc_links.parent = Some(first);
        pool[first].doc_subtree_size = 2;
        DocumentTree { root: first, first }
    }

    /// Visible extent of the whole document.
    pub fn extent(&self, pool: &SegmentPool) -> Point {
        pool[self.root].doc_subtree_extent
    }

    pub fn splay<V: Fn(&Segment) -> bool>(
        &mut self,
        pool: &mut SegmentPool,
        vis: &V,
        idx: SegmentIdx,
    ) {
        splay::splay::<DocSpace, V>(pool, vis, idx);
        self.root = idx;
    }

    /// Recomputes `idx`'s subtree aggregate. Callers use this after a
    /// visibility change on a segment they have already splayed to the root.
    pub fn update_aggregate<V: Fn(&Segment) -> bool>(
        &self,
        pool: &mut SegmentPool,
        vis: &V,
        idx: SegmentIdx,
    ) {
        DocSpace::update_aggregate(pool, vis, idx);
    }

    /// Finds the segment whose visible span contains `position` and returns
    /// it with its `[start, end)` span. Boundary positions resolve to the
    /// segment *ending* there, except at position zero where the start
    /// sentinel is produced so callers can bracket the document head.
    pub fn find_segment_containing_position<V: Fn(&Segment) -> bool>(
        &self,
        pool: &SegmentPool,
        vis: &V,
        position: Point,
    ) -> Result<(SegmentIdx, Point, Point)> {
        let mut current = Some(self.root);
        let mut left_ancestor_end = Point::zero();
        while let Some(idx) = current {
            let segment = &pool[idx];
            let mut start = left_ancestor_end;
            if let Some(l) = segment.doc_links.left {
                start = start.traverse(pool[l].doc_subtree_extent);
            }
            let end = if vis(segment) { start.traverse(segment.extent) } else { start };
            if position <= start && idx != self.first {
                current = segment.doc_links.left;
            } else if position > end {
                left_ancestor_end = end;
                current = segment.doc_links.right;
            } else {
                return Ok((idx, start, end));
            }
        }
        Err(Error::PositionOutOfRange)
    }

    /// Inserts `new` between two adjacent segments. Splaying `prev` and then
    /// `next` leaves `next` at the root with `prev` as its left child and no
    /// segments between them, so `new` can take the root with `prev`'s
    /// subtree on its left and `next`'s on its right.
    pub fn insert_between<V: Fn(&Segment) -> bool>(
        &mut self,
        pool: &mut SegmentPool,
        vis: &V,
        prev: SegmentIdx,
        next: SegmentIdx,
        new: SegmentIdx,
    ) {
        self.splay(pool, vis, prev);
        self.splay(pool, vis, next);
        debug_assert_eq!(pool[next].doc_links.left, Some(prev));
        debug_assert_eq!(pool[prev].doc_links.right, None);

        pool[new].doc_links.left = Some(prev);
        pool[prev].doc_links.parent = Some(new);
        pool[new].doc_links.right = Some(next);
        pool[next].doc_links.parent = Some(new);
        pool[next].doc_links.left = None;
        pool[new].doc_links.parent = None;
        self.root = new;

        DocSpace::update_aggregate(pool, vis, next);
        DocSpace::update_aggregate(pool, vis, new);
    }

    /// Wires an already-carved `suffix` in directly after `prefix`. The
    /// suffix takes the root with the prefix as its left child; the prefix's
    /// old right subtree transfers to the suffix.
    pub fn split_segment<V: Fn(&Segment) -> bool>(
        &mut self,
        pool: &mut SegmentPool,
        vis: &V,
        prefix: SegmentIdx,
        suffix: SegmentIdx,
    ) {
        self.splay(pool, vis, prefix);

        let prefix_right = pool[prefix].doc_links.right;
        pool[suffix].doc_links.left = Some(prefix);
        pool[suffix].doc_links.right = prefix_right;
        if let Some(r) = prefix_right {
            pool[r].doc_links.parent = Some(suffix);
        }
        pool[prefix].doc_links.right = None;
        pool[prefix].doc_links.parent = Some(suffix);
        pool[suffix].doc_links.parent = None;
        self.root = suffix;

        DocSpace::update_aggregate(pool, vis, prefix);
        DocSpace::update_aggregate(pool, vis, suffix);
    }

    /// Rank of `idx` in document order, by left-subtree sizes up to the root.
    pub fn index_of(&self, pool: &SegmentPool, idx: SegmentIdx) -> u32 {
        let left_size =
            |i: Option<SegmentIdx>| i.map(|l| pool[l].doc_subtree_size).unwrap_or(0);
        let mut index = left_size(pool[idx].doc_links.left);
        let mut current = idx;
        while let Some(p) = pool[current].doc_links.parent {
            if pool[p].doc_links.right == Some(current) {
                index += 1 + left_size(pool[p].doc_links.left);
            }
            current = p;
        }
        index
    }

    /// Linear position of `idx`: splays it and reads the left subtree's
    /// visible extent. For an invisible segment this is the position of the
    /// gap it would occupy.
    pub fn position_of<V: Fn(&Segment) -> bool>(
        &mut self,
        pool: &mut SegmentPool,
        vis: &V,
        idx: SegmentIdx,
    ) -> Point {
        self.splay(pool, vis, idx);
        pool[idx]
            .doc_links
            .left
            .map(|l| pool[l].doc_subtree_extent)
            .unwrap_or_default()
    }

    pub fn successor(&self, pool: &SegmentPool, idx: SegmentIdx) -> Option<SegmentIdx> {
        splay::successor::<DocSpace>(pool, idx)
    }

    pub fn predecessor(&self, pool: &SegmentPool, idx: SegmentIdx) -> Option<SegmentIdx> {
        splay::predecessor::<DocSpace>(pool, idx)
    }

    /// All segments in document order, via a non-recursive in-order walk.
    pub fn segments(&self, pool: &SegmentPool) -> Vec<SegmentIdx> {
        let mut result = Vec::with_capacity(pool[self.root].doc_subtree_size as usize);
        let mut stack = Vec::new();
        let mut current = Some(self.root);
        loop {
            while let Some(idx) = current {
                stack.push(idx);
                current = pool[idx].doc_links.left;
            }
            let Some(idx) = stack.pop() else { break };
            result.push(idx);
            current = pool[idx].doc_links.right;
        }
        result
    }
}
