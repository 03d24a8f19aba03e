//! Undo-stack records and the serializable history snapshot.
//!
//! The replica's own stacks hold [`UndoRecord`]s whose marker snapshots are
//! in logical form so they survive later edits. [`History`] is the external
//! snapshot produced by `Document::get_history`: transactions there carry
//! *linear* change lists and *resolved* markers, ready for a host editor to
//! persist and replay.

use smallvec::SmallVec;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use smartstring::alias::String as SmartString;

use crate::clock::Timestamp;
use crate::markers::{LocalMarkers, MarkerSnapshot};
use crate::operation::{Operation, TextUpdate};

pub type CheckpointId = u32;

/// One undo-stack entry.
#[derive(Debug, Clone)]
pub(crate) enum UndoRecord {
    Transaction(Transaction),
    Checkpoint(Checkpoint),
}

/// A group of operations undone and redone as a unit.
#[derive(Debug, Clone)]
pub(crate) struct Transaction {
    pub timestamp: Timestamp,
    pub grouping_interval: Option<u64>,
    pub operations: SmallVec<[Operation; 1]>,
    pub markers_before: Option<MarkerSnapshot>,
    pub markers_after: Option<MarkerSnapshot>,
}

/// An addressable stack position. A barrier checkpoint refuses undo, revert
/// and grouping across it.
#[derive(Debug, Clone)]
pub(crate) struct Checkpoint {
    pub id: CheckpointId,
    pub is_barrier: bool,
    pub markers: Option<MarkerSnapshot>,
}

/// Serializable snapshot of a replica's undo and redo stacks. Both stacks
/// are ordered bottom-to-top, matching the replica's internal orientation.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct History {
    pub base_text: Option<SmartString>,
    pub next_checkpoint_id: CheckpointId,
    pub undo_stack: Vec<HistoryEntry>,
    pub redo_stack: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum HistoryEntry {
    Transaction(HistoryTransaction),
    Checkpoint {
        id: CheckpointId,
        markers: Option<LocalMarkers>,
    },
}

/// A transaction materialized as linear changes: `changes` replays the
/// transaction forward when applied back-to-front.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HistoryTransaction {
    pub changes: Vec<TextUpdate>,
    pub markers_before: Option<LocalMarkers>,
    pub markers_after: Option<LocalMarkers>,
}

/// Swaps the old and new sides of each update, turning a list that undoes a
/// transaction into one that redoes it.
pub(crate) fn invert_text_updates(updates: Vec<TextUpdate>) -> Vec<TextUpdate> {
    updates
        .into_iter()
        .map(|u| TextUpdate {
            old_start: u.new_start,
            old_end: u.new_end,
            old_text: u.new_text,
            new_start: u.old_start,
            new_end: u.old_end,
            new_text: u.old_text,
        })
        .collect()
}
