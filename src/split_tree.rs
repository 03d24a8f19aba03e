//! Per-splice piece index: a splay tree over one splice's segments keyed by
//! their offset within the original inserted text. The aggregate is the raw
//! (visibility-agnostic) extent, so offsets from remote operations resolve
//! against the text as it was inserted, not as it is currently visible.
//! A `next_split` chain through the arena gives O(1) in-order walks when no
//! offset lookup is needed.

use crate::error::{Error, Result};
use crate::point::{byte_index_for_point, Point};
use crate::segment::{Segment, SegmentIdx, SegmentPool};
use crate::splay::{self, Links, SplaySpace};

pub(crate) enum SplitSpace {}

impl SplaySpace for SplitSpace {
    #[inline]
    fn links(segment: &Segment) -> &Links {
        &segment.split_links
    }

    #[inline]
    fn links_mut(segment: &mut Segment) -> &mut Links {
        &mut segment.split_links
    }

    fn update_aggregate<V: Fn(&Segment) -> bool>(
        pool: &mut SegmentPool,
        _vis: &V,
        segment: SegmentIdx,
    ) {
        let mut extent = Point::zero();
        if let Some(l) = pool[segment].split_links.left {
            extent = extent.traverse(pool[l].split_subtree_extent);
        }
        extent = extent.traverse(pool[segment].extent);
        if let Some(r) = pool[segment].split_links.right {
            extent = extent.traverse(pool[r].split_subtree_extent);
        }
        pool[segment].split_subtree_extent = extent;
    }
}

fn any_segment(_segment: &Segment) -> bool {
    true
}

#[derive(Debug)]
pub(crate) struct SplitTree {
    root: SegmentIdx,
    /// The piece at offset zero. Splits always keep the prefix's identity,
    /// so this never changes.
    start: SegmentIdx,
}

impl SplitTree {
    pub fn new(pool: &mut SegmentPool, segment: SegmentIdx) -> SplitTree {
        pool[segment].split_subtree_extent = pool[segment].extent;
        SplitTree { root: segment, start: segment }
    }

    #[inline]
    pub fn start(&self) -> SegmentIdx {
        self.start
    }

    fn splay(&mut self, pool: &mut SegmentPool, idx: SegmentIdx) {
        splay::splay::<SplitSpace, _>(pool, &any_segment, idx);
        self.root = idx;
    }

    /// Finds the piece containing `offset`. A boundary offset resolves to
    /// the piece ending there, except offset zero which resolves to the
    /// first piece. Splays the hit.
    pub fn find_segment_containing_offset(
        &mut self,
        pool: &mut SegmentPool,
        offset: Point,
    ) -> Result<SegmentIdx> {
        let mut current = Some(self.root);
        let mut left_ancestor_end = Point::zero();
        while let Some(idx) = current {
            let segment = &pool[idx];
            let mut start = left_ancestor_end;
            if let Some(l) = segment.split_links.left {
                start = start.traverse(pool[l].split_subtree_extent);
            }
            let end = start.traverse(segment.extent);
            if offset <= start && segment.split_links.left.is_some() {
                current = segment.split_links.left;
            } else if offset > end {
                left_ancestor_end = end;
                current = segment.split_links.right;
            } else {
                self.splay(pool, idx);
                return Ok(idx);
            }
        }
        Err(Error::SegmentNotFound)
    }

    /// Carves `segment` in two at `offset` (an extent strictly inside it).
    /// The prefix keeps the segment's identity; the returned suffix inherits
    /// the deletions, the dependency back-references and the tail of the
    /// `next_split` chain, and takes over the split-tree root with the
    /// prefix as its left child. The caller must mirror the split into the
    /// document tree.
    pub fn split_segment(
        &mut self,
        pool: &mut SegmentPool,
        segment: SegmentIdx,
        offset: Point,
    ) -> SegmentIdx {
        debug_assert!(!offset.is_zero() && offset < pool[segment].extent);

        let suffix = {
            let seg = &pool[segment];
            let byte = byte_index_for_point(&seg.text, offset);
            let mut suffix = Segment::new(
                seg.splice_id,
                seg.offset.traverse(offset),
                &seg.text[byte..],
            );
            suffix.deletions = seg.deletions.clone();
            suffix.left_dependency = seg.left_dependency;
            suffix.right_dependency = seg.right_dependency;
            suffix.next_split = seg.next_split;
            suffix
        };
        let suffix = pool.insert(suffix);

        {
            let seg = &mut pool[segment];
            let byte = byte_index_for_point(&seg.text, offset);
            seg.text.truncate(byte);
            seg.extent = offset;
            seg.next_split = Some(suffix);
        }

        self.splay(pool, segment);
        let prefix_right = pool[segment].split_links.right;
        pool[suffix].split_links.left = Some(segment);
        pool[suffix].split_links.right = prefix_right;
        if let Some(r) = prefix_right {
            pool[r].split_links.parent = Some(suffix);
        }
        pool[segment].split_links.right = None;
        pool[segment].split_links.parent = Some(suffix);
        pool[suffix].split_links.parent = None;
        self.root = suffix;

        SplitSpace::update_aggregate(pool, &any_segment, segment);
        SplitSpace::update_aggregate(pool, &any_segment, suffix);

        suffix
    }
}
