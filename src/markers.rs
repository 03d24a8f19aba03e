//! Marker (selection / annotation range) data model. Markers are stored
//! inside the replica in *logical* form, anchored to offsets within splices,
//! so they keep their meaning while remote edits land around them. They are
//! resolved back to linear ranges at the API boundary.

use std::collections::HashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::operation::{LayerId, MarkerId, SiteId, SpliceId};
use crate::point::Point;

/// A linear range in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Range {
    pub start: Point,
    pub end: Point,
}

impl Range {
    #[inline]
    pub const fn new(start: Point, end: Point) -> Self {
        Range { start, end }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// An edit-stable range: each endpoint anchors to an offset within an
/// integrated splice instead of a linear position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LogicalRange {
    pub start_dependency_id: SpliceId,
    pub offset_in_start_dependency: Point,
    pub end_dependency_id: SpliceId,
    pub offset_in_end_dependency: Point,
}

impl LogicalRange {
    pub fn is_empty(&self) -> bool {
        self.start_dependency_id == self.end_dependency_id
            && self.offset_in_start_dependency == self.offset_in_end_dependency
    }
}

/// A selection or annotation range, generic over the range representation:
/// [`Range`] at the API boundary, [`LogicalRange`] in storage and on the
/// wire.
///
/// `exclusive` controls which side of each endpoint insertions land on,
/// `reversed` and `tailed` are carried for the host editor and have no
/// effect inside the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Marker<R> {
    pub exclusive: bool,
    pub reversed: bool,
    pub tailed: bool,
    pub range: R,
}

impl<R> Marker<R> {
    /// The same marker with a different range representation.
    pub(crate) fn with_range<T>(&self, range: T) -> Marker<T> {
        Marker {
            exclusive: self.exclusive,
            reversed: self.reversed,
            tailed: self.tailed,
            range,
        }
    }
}

/// One site's resolved markers: layer id to marker id to marker.
pub type LocalMarkers = HashMap<LayerId, HashMap<MarkerId, Marker<Range>>>;

/// Resolved markers for every site.
pub type ResolvedMarkers = HashMap<SiteId, LocalMarkers>;

/// Local marker edits handed to `Document::update_markers`. A `None` layer
/// removes the layer, a `None` marker removes the marker.
pub type LocalMarkerUpdates = HashMap<LayerId, Option<HashMap<MarkerId, Option<Marker<Range>>>>>;

/// Marker deltas reported from integration, resolved to linear ranges.
/// Mirrors the wire shape: `None` layers and markers are removals.
pub type ResolvedMarkerUpdates =
    HashMap<SiteId, HashMap<LayerId, Option<HashMap<MarkerId, Option<Marker<Range>>>>>>;

/// Markers in stored (logical) form, for one site.
pub(crate) type MarkerSnapshot = HashMap<LayerId, HashMap<MarkerId, Marker<LogicalRange>>>;
