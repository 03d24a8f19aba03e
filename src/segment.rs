//! The segment arena. Every piece of text ever inserted lives here for the
//! life of the replica; deletion and undo only toggle visibility. Segments
//! are addressed by stable arena indices, which also serve as the
//! parent/child pointers of the two tree embeddings and as the causal
//! dependency back-references.

use std::collections::{HashMap, HashSet};
use std::ops::{Index, IndexMut};

use smartstring::alias::String as SmartString;

use crate::operation::SpliceId;
use crate::point::{extent_for_text, Point};
use crate::splay::Links;

/// Handle into the segment arena. Segments are never deallocated, so a
/// handle stays valid for the life of the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SegmentIdx(u32);

/// A contiguous run of text from a single splice, possibly narrowed by later
/// splits. Carries both tree embeddings: the document tree orders all
/// segments by document position, the split tree orders one splice's pieces
/// by offset.
#[derive(Debug, Clone)]
pub(crate) struct Segment {
    pub splice_id: SpliceId,
    /// Where this piece starts within its originating splice's text.
    pub offset: Point,
    pub text: SmartString,
    pub extent: Point,
    /// Ids of deletion splices currently covering this piece.
    pub deletions: HashSet<SpliceId>,
    /// The segments bracketing the insertion point when the splice was made.
    /// `None` only on the two boundary sentinels.
    pub left_dependency: Option<SegmentIdx>,
    pub right_dependency: Option<SegmentIdx>,
    /// The next piece of the same splice, in offset order.
    pub next_split: Option<SegmentIdx>,

    pub doc_links: Links,
    /// Total visible extent of this piece's document subtree.
    pub doc_subtree_extent: Point,
    /// Segment count of this piece's document subtree.
    pub doc_subtree_size: u32,

    pub split_links: Links,
    /// Raw extent of this piece's split subtree, visibility-agnostic.
    pub split_subtree_extent: Point,
}

impl Segment {
    pub fn new(splice_id: SpliceId, offset: Point, text: &str) -> Segment {
        let extent = extent_for_text(text);
        Segment {
            splice_id,
            offset,
            text: text.into(),
            extent,
            deletions: HashSet::new(),
            left_dependency: None,
            right_dependency: None,
            next_split: None,
            doc_links: Links::default(),
            doc_subtree_extent: extent,
            doc_subtree_size: 1,
            split_links: Links::default(),
            split_subtree_extent: extent,
        }
    }

    pub fn sentinel(splice_id: SpliceId) -> Segment {
        Segment::new(splice_id, Point::zero(), "")
    }

    /// Offset just past this piece within its splice.
    #[inline]
    pub fn end_offset(&self) -> Point {
        self.offset.traverse(self.extent)
    }
}

#[derive(Debug, Default)]
pub(crate) struct SegmentPool {
    segments: Vec<Segment>,
}

impl SegmentPool {
    pub fn insert(&mut self, segment: Segment) -> SegmentIdx {
        let idx = SegmentIdx(self.segments.len() as u32);
        self.segments.push(segment);
        idx
    }
}

impl Index<SegmentIdx> for SegmentPool {
    type Output = Segment;

    #[inline]
    fn index(&self, idx: SegmentIdx) -> &Segment {
        &self.segments[idx.0 as usize]
    }
}

impl IndexMut<SegmentIdx> for SegmentPool {
    #[inline]
    fn index_mut(&mut self, idx: SegmentIdx) -> &mut Segment {
        &mut self.segments[idx.0 as usize]
    }
}

pub(crate) type UndoCounts = HashMap<SpliceId, u32>;

fn undo_count(
    counts: &UndoCounts,
    overrides: Option<&UndoCounts>,
    splice_id: SpliceId,
) -> u32 {
    if let Some(overrides) = overrides {
        if let Some(count) = overrides.get(&splice_id) {
            return *count;
        }
    }
    counts.get(&splice_id).copied().unwrap_or(0)
}

/// A segment is visible iff its own splice is live (even undo count) and
/// every deletion covering it has been undone (odd count).
///
/// `overrides` substitutes undo counts to reconstruct an earlier state;
/// `ignore` treats the named splices as never applied, both for the
/// segment's own splice and for deletions covering it.
pub(crate) fn segment_visible(
    segment: &Segment,
    counts: &UndoCounts,
    overrides: Option<&UndoCounts>,
    ignore: Option<&HashSet<SpliceId>>,
) -> bool {
    if let Some(ignore) = ignore {
        if ignore.contains(&segment.splice_id) {
            return false;
        }
    }
    if undo_count(counts, overrides, segment.splice_id) % 2 == 1 {
        return false;
    }
    !segment.deletions.iter().any(|deletion| {
        if let Some(ignore) = ignore {
            if ignore.contains(deletion) {
                return false;
            }
        }
        undo_count(counts, overrides, *deletion) % 2 == 0
    })
}
