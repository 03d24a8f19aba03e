//! A replicated core for real-time collaborative text editing.
//!
//! Every site holds a full [`Document`] replica. Local edits return
//! [`Operation`]s for broadcast; [`Document::integrate_operations`] applies
//! remote operations in whatever order the transport delivers them, parking
//! the ones whose causal dependencies have not arrived. Replicas that have
//! seen the same operation set converge to the same text and the same
//! resolved marker ranges.
//!
//! The replica also keeps a per-site linear undo history with checkpoints,
//! barriers and transaction grouping, replicated as per-splice undo
//! counters, plus a serializable history snapshot
//! ([`Document::get_history`] / [`Document::with_history`]).

pub use clock::{Clock, SystemClock, Timestamp};
pub use document::Document;
pub use error::{Error, Result};
pub use history::{CheckpointId, History, HistoryEntry, HistoryTransaction};
pub use markers::{
    LocalMarkerUpdates, LocalMarkers, LogicalRange, Marker, Range, ResolvedMarkerUpdates,
    ResolvedMarkers,
};
pub use operation::{
    DocumentStateUpdate, LayerId, MarkerId, MarkersUpdateOperation, Operation, SeqNumber, SiteId,
    SpliceId, SpliceOperation, TextDeletion, TextInsertion, TextUpdate, UndoOperation,
    UndoRedoResult,
};
pub use point::{extent_for_text, Point};

mod clock;
mod document;
mod document_tree;
mod error;
mod history;
mod markers;
mod operation;
mod point;
mod segment;
mod splay;
mod split_tree;

#[cfg(test)]
mod tests {
    // As per smartstring's documentation.
    #[test]
    fn validate_smartstring() {
        smartstring::validate();
    }
}
