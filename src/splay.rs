//! Shared splay-tree machinery. The document tree and the split tree are two
//! independent embeddings over the same segment arena; each implements
//! [`SplaySpace`] with accessors for its own link and aggregate fields, and
//! the functions here monomorphize per embedding. Rotations keep subtree
//! aggregates current through the embedding's `update_aggregate` hook.

use crate::segment::{Segment, SegmentIdx, SegmentPool};

/// Child and parent pointers for one tree embedding of a segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Links {
    pub parent: Option<SegmentIdx>,
    pub left: Option<SegmentIdx>,
    pub right: Option<SegmentIdx>,
}

/// One tree embedding over the segment arena.
///
/// `update_aggregate` receives the visibility predicate because the document
/// tree folds visible extents; the split tree ignores it and folds raw
/// extents.
pub(crate) trait SplaySpace {
    fn links(segment: &Segment) -> &Links;
    fn links_mut(segment: &mut Segment) -> &mut Links;
    /// Recompute `segment`'s subtree aggregate from its children.
    fn update_aggregate<V: Fn(&Segment) -> bool>(
        pool: &mut SegmentPool,
        vis: &V,
        segment: SegmentIdx,
    );
}

#[inline]
pub(crate) fn parent<S: SplaySpace>(pool: &SegmentPool, idx: SegmentIdx) -> Option<SegmentIdx> {
    S::links(&pool[idx]).parent
}

#[inline]
pub(crate) fn left<S: SplaySpace>(pool: &SegmentPool, idx: SegmentIdx) -> Option<SegmentIdx> {
    S::links(&pool[idx]).left
}

#[inline]
pub(crate) fn right<S: SplaySpace>(pool: &SegmentPool, idx: SegmentIdx) -> Option<SegmentIdx> {
    S::links(&pool[idx]).right
}

/// Lifts `pivot` over its parent. `pivot` must be a left child.
fn rotate_right<S: SplaySpace, V: Fn(&Segment) -> bool>(
    pool: &mut SegmentPool,
    vis: &V,
    pivot: SegmentIdx,
) {
    let root = parent::<S>(pool, pivot).unwrap();
    debug_assert_eq!(left::<S>(pool, root), Some(pivot));
    let root_parent = parent::<S>(pool, root);
    let pivot_right = right::<S>(pool, pivot);

    if let Some(rp) = root_parent {
        let links = S::links_mut(&mut pool[rp]);
        if links.left == Some(root) {
            links.left = Some(pivot);
        } else {
            links.right = Some(pivot);
        }
    }
    {
        let links = S::links_mut(&mut pool[pivot]);
        links.parent = root_parent;
        links.right = Some(root);
    }
    {
        let links = S::links_mut(&mut pool[root]);
        links.parent = Some(pivot);
        links.left = pivot_right;
    }
    if let Some(r) = pivot_right {
        S::links_mut(&mut pool[r]).parent = Some(root);
    }

    S::update_aggregate(pool, vis, root);
    S::update_aggregate(pool, vis, pivot);
}

/// Lifts `pivot` over its parent. `pivot` must be a right child.
fn rotate_left<S: SplaySpace, V: Fn(&Segment) -> bool>(
    pool: &mut SegmentPool,
    vis: &V,
    pivot: SegmentIdx,
) {
    let root = parent::<S>(pool, pivot).unwrap();
    debug_assert_eq!(right::<S>(pool, root), Some(pivot));
    let root_parent = parent::<S>(pool, root);
    let pivot_left = left::<S>(pool, pivot);

    if let Some(rp) = root_parent {
        let links = S::links_mut(&mut pool[rp]);
        if links.left == Some(root) {
            links.left = Some(pivot);
        } else {
            links.right = Some(pivot);
        }
    }
    {
        let links = S::links_mut(&mut pool[pivot]);
        links.parent = root_parent;
        links.left = Some(root);
    }
    {
        let links = S::links_mut(&mut pool[root]);
        links.parent = Some(pivot);
        links.right = pivot_left;
    }
    if let Some(l) = pivot_left {
        S::links_mut(&mut pool[l]).parent = Some(root);
    }

    S::update_aggregate(pool, vis, root);
    S::update_aggregate(pool, vis, pivot);
}

/// Rotates `node` to the root of its embedding.
pub(crate) fn splay<S: SplaySpace, V: Fn(&Segment) -> bool>(
    pool: &mut SegmentPool,
    vis: &V,
    node: SegmentIdx,
) {
    while let Some(p) = parent::<S>(pool, node) {
        let node_is_left = left::<S>(pool, p) == Some(node);
        match parent::<S>(pool, p) {
            Some(g) => {
                let parent_is_left = left::<S>(pool, g) == Some(p);
                match (node_is_left, parent_is_left) {
                    (true, true) => {
                        rotate_right::<S, V>(pool, vis, p);
                        rotate_right::<S, V>(pool, vis, node);
                    }
                    (false, false) => {
                        rotate_left::<S, V>(pool, vis, p);
                        rotate_left::<S, V>(pool, vis, node);
                    }
                    (true, false) => {
                        rotate_right::<S, V>(pool, vis, node);
                        rotate_left::<S, V>(pool, vis, node);
                    }
                    (false, true) => {
                        rotate_left::<S, V>(pool, vis, node);
                        rotate_right::<S, V>(pool, vis, node);
                    }
                }
            }
            None => {
                if node_is_left {
                    rotate_right::<S, V>(pool, vis, node);
                } else {
                    rotate_left::<S, V>(pool, vis, node);
                }
            }
        }
    }
}

pub(crate) fn leftmost<S: SplaySpace>(pool: &SegmentPool, mut idx: SegmentIdx) -> SegmentIdx {
    while let Some(l) = left::<S>(pool, idx) {
        idx = l;
    }
    idx
}

pub(crate) fn rightmost<S: SplaySpace>(pool: &SegmentPool, mut idx: SegmentIdx) -> SegmentIdx {
    while let Some(r) = right::<S>(pool, idx) {
        idx = r;
    }
    idx
}

/// In-order successor, without restructuring.
pub(crate) fn successor<S: SplaySpace>(
    pool: &SegmentPool,
    idx: SegmentIdx,
) -> Option<SegmentIdx> {
    if let Some(r) = right::<S>(pool, idx) {
        return Some(leftmost::<S>(pool, r));
    }
    let mut current = idx;
    while let Some(p) = parent::<S>(pool, current) {
        if left::<S>(pool, p) == Some(current) {
            return Some(p);
        }
        current = p;
    }
    None
}

/// In-order predecessor, without restructuring.
pub(crate) fn predecessor<S: SplaySpace>(
    pool: &SegmentPool,
    idx: SegmentIdx,
) -> Option<SegmentIdx> {
    if let Some(l) = left::<S>(pool, idx) {
        return Some(rightmost::<S>(pool, l));
    }
    let mut current = idx;
    while let Some(p) = parent::<S>(pool, current) {
        if right::<S>(pool, p) == Some(current) {
            return Some(p);
        }
        current = p;
    }
    None
}
