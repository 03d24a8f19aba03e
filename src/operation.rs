//! The replicated operation records. These are the values a transport ships
//! between sites; two operations compare equal iff their fields compare
//! equal, and the wire representation is entirely the transport's business.

use std::collections::HashMap;

use smartstring::alias::String as SmartString;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::markers::{LocalMarkers, LogicalRange, Marker, ResolvedMarkerUpdates};
use crate::point::Point;

pub type SiteId = u32;
pub type SeqNumber = u32;
pub type LayerId = u32;
pub type MarkerId = u32;

/// Identity of a single local edit: the site that produced it plus that
/// site's edit counter. Sequence numbers start at 1 and increase by one per
/// local edit; the deletion and insertion halves of one edit share an id.
///
/// Site 0 is reserved for the two boundary sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpliceId {
    pub site: SiteId,
    pub seq: SeqNumber,
}

impl SpliceId {
    #[inline]
    pub const fn new(site: SiteId, seq: SeqNumber) -> Self {
        SpliceId { site, seq }
    }
}

pub(crate) const START_SPLICE_ID: SpliceId = SpliceId::new(0, 0);
pub(crate) const END_SPLICE_ID: SpliceId = SpliceId::new(0, 1);

/// One replicated operation. A closed sum: integration dispatches
/// exhaustively on the variant, so an unknown kind cannot exist past the
/// transport boundary.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Operation {
    Splice(SpliceOperation),
    Undo(UndoOperation),
    MarkersUpdate(MarkersUpdateOperation),
}

/// One local edit: an optional deletion and an optional insertion sharing a
/// splice id.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpliceOperation {
    pub splice_id: SpliceId,
    pub deletion: Option<TextDeletion>,
    pub insertion: Option<TextInsertion>,
}

/// The insertion half of a splice. The dependencies name the segments that
/// bounded the insertion point when the edit was made; they anchor the
/// insertion's position on every replica regardless of concurrent edits.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TextInsertion {
    pub text: SmartString,
    pub left_dependency_id: SpliceId,
    pub offset_in_left_dependency: Point,
    pub right_dependency_id: SpliceId,
    pub offset_in_right_dependency: Point,
}

/// The deletion half of a splice. `max_seqs_by_site` is the causal frontier
/// the deleting site had observed; on integration it decides exactly which
/// segments between the dependencies the deletion covers.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TextDeletion {
    pub max_seqs_by_site: HashMap<SiteId, SeqNumber>,
    pub left_dependency_id: SpliceId,
    pub offset_in_left_dependency: Point,
    pub right_dependency_id: SpliceId,
    pub offset_in_right_dependency: Point,
}

/// Sets the absolute undo count of a splice. Integration is max-wins, so
/// redelivery and races between concurrent undoes resolve deterministically.
/// Odd counts mean the splice is currently undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UndoOperation {
    pub splice_id: SpliceId,
    pub undo_count: u32,
}

/// Replicates one site's marker state. A `None` layer removes the layer, a
/// `None` marker removes the marker, absent keys are unchanged.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MarkersUpdateOperation {
    pub site_id: SiteId,
    pub updates: HashMap<LayerId, Option<HashMap<MarkerId, Option<Marker<LogicalRange>>>>>,
}

/// One step of the linear transform from the pre-change document to the
/// post-change document. Consumers apply a batch back-to-front so earlier
/// coordinates stay valid.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TextUpdate {
    pub old_start: Point,
    pub old_end: Point,
    pub old_text: SmartString,
    pub new_start: Point,
    pub new_end: Point,
    pub new_text: SmartString,
}

/// What integrating a batch of operations did to the visible document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentStateUpdate {
    pub text_updates: Vec<TextUpdate>,
    pub marker_updates: ResolvedMarkerUpdates,
}

impl DocumentStateUpdate {
    pub fn is_empty(&self) -> bool {
        self.text_updates.is_empty() && self.marker_updates.is_empty()
    }
}

/// Result of an undo, redo or revert: the counter operations to broadcast,
/// the linear updates they caused locally, and the local marker state
/// captured on the side of the transaction now in effect.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoRedoResult {
    pub operations: Vec<Operation>,
    pub text_updates: Vec<TextUpdate>,
    pub markers: Option<LocalMarkers>,
}
