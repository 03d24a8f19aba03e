//! The document replica. Each site owns one `Document`; local edits produce
//! operations for broadcast, remote operations integrate in any delivery
//! order, and replicas that have seen the same operation set converge to the
//! same text and the same marker ranges.
//!
//! Inserted text lives in segments that are only ever split or hidden, never
//! removed, so every operation and marker anchor a peer can still send keeps
//! meaning forever. Undo is replicated as a per-splice counter rather than
//! as inverse edits, which makes it commute with everything else.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use smallvec::SmallVec;

use crate::clock::{Clock, SystemClock, Timestamp};
use crate::document_tree::DocumentTree;
use crate::error::{Error, Result};
use crate::history::{
    invert_text_updates, Checkpoint, CheckpointId, History, HistoryEntry, HistoryTransaction,
    Transaction, UndoRecord,
};
use crate::markers::{
    LocalMarkerUpdates, LocalMarkers, LogicalRange, Marker, MarkerSnapshot, Range,
    ResolvedMarkerUpdates, ResolvedMarkers,
};
use crate::operation::{
    DocumentStateUpdate, LayerId, MarkerId, MarkersUpdateOperation, Operation, SeqNumber, SiteId,
    SpliceId, SpliceOperation, TextDeletion, TextInsertion, TextUpdate, UndoOperation,
    UndoRedoResult, END_SPLICE_ID, START_SPLICE_ID,
};
use crate::point::Point;
use crate::segment::{segment_visible, Segment, SegmentIdx, SegmentPool, UndoCounts};
use crate::split_tree::SplitTree;

/// The current-state visibility predicate used for tree aggregates.
fn visible(counts: &UndoCounts) -> impl Fn(&Segment) -> bool + '_ {
    move |segment| segment_visible(segment, counts, None, None)
}

#[derive(Debug)]
pub struct Document {
    site_id: SiteId,
    next_sequence_number: SeqNumber,

    pool: SegmentPool,
    document_tree: DocumentTree,
    /// Split tree per insertion splice, keyed by splice id.
    split_trees: HashMap<SpliceId, SplitTree>,
    /// Deletion record per deletion splice, keyed by splice id.
    deletions: HashMap<SpliceId, TextDeletion>,
    undo_counts: UndoCounts,
    /// Highest sequence number applied per site. Deciding readiness and
    /// stamping local deletions both read this.
    max_seqs_by_site: HashMap<SiteId, SeqNumber>,
    /// Operations parked until a dependency arrives, filed under every
    /// splice id they are still missing.
    deferred_operations: HashMap<SpliceId, Vec<Operation>>,

    marker_layers: HashMap<SiteId, MarkerSnapshot>,
    deferred_marker_updates: HashMap<SiteId, MarkerSnapshot>,
    deferred_marker_updates_by_dependency: HashMap<SpliceId, HashSet<(SiteId, LayerId, MarkerId)>>,

    /// Append-only log of every splice and undo applied here, local and
    /// remote, in application order.
    operations: Vec<Operation>,

    undo_stack: Vec<UndoRecord>,
    redo_stack: Vec<UndoRecord>,
    next_checkpoint_id: CheckpointId,

    clock: Box<dyn Clock>,
}

impl Document {
    /// Creates an empty replica. `site_id` 0 is reserved for the boundary
    /// sentinels and refused.
    pub fn new(site_id: SiteId) -> Result<Document> {
        if site_id == 0 {
            return Err(Error::ReservedSiteId);
        }

        let mut pool = SegmentPool::default();
        let first = pool.insert(Segment::sentinel(START_SPLICE_ID));
        let last = pool.insert(Segment::sentinel(END_SPLICE_ID));
        let document_tree = DocumentTree::new(&mut pool, first, last);

        let mut split_trees = HashMap::new();
        split_trees.insert(START_SPLICE_ID, SplitTree::new(&mut pool, first));
        split_trees.insert(END_SPLICE_ID, SplitTree::new(&mut pool, last));

        let mut marker_layers = HashMap::new();
        marker_layers.insert(site_id, MarkerSnapshot::new());

        Ok(Document {
            site_id,
            next_sequence_number: 1,
            pool,
            document_tree,
            split_trees,
            deletions: HashMap::new(),
            undo_counts: UndoCounts::new(),
            max_seqs_by_site: HashMap::new(),
            deferred_operations: HashMap::new(),
            marker_layers,
            deferred_marker_updates: HashMap::new(),
            deferred_marker_updates_by_dependency: HashMap::new(),
            operations: Vec::new(),
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            next_checkpoint_id: 1,
            clock: Box::new(SystemClock),
        })
    }

    /// Creates a replica seeded with `text` as its first splice. The seeding
    /// edit is not undoable.
    pub fn with_text(site_id: SiteId, text: &str) -> Result<Document> {
        let mut doc = Document::new(site_id)?;
        doc.set_text_in_range(Point::zero(), Point::zero(), text)?;
        doc.undo_stack.clear();
        Ok(doc)
    }

    /// Restores a replica from a serialized history snapshot.
    pub fn with_history(site_id: SiteId, history: &History) -> Result<Document> {
        let mut doc = Document::new(site_id)?;
        doc.populate_history(history)?;
        Ok(doc)
    }

    #[inline]
    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    /// Swaps the timestamp source used for undo grouping.
    pub fn set_clock(&mut self, clock: Box<dyn Clock>) {
        self.clock = clock;
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Visible extent of the document.
    pub fn extent(&self) -> Point {
        self.document_tree.extent(&self.pool)
    }

    pub fn is_empty(&self) -> bool {
        self.extent().is_zero()
    }

    /// The visible text, concatenated in document order.
    pub fn get_text(&self) -> String {
        let mut text = String::new();
        for idx in self.document_tree.segments(&self.pool) {
            let segment = &self.pool[idx];
            if segment_visible(segment, &self.undo_counts, None, None) {
                text.push_str(&segment.text);
            }
        }
        text
    }

    // ------------------------------------------------------------------
    // Local editing
    // ------------------------------------------------------------------

    /// Applies a local edit: deletes `start..end` (if non-empty), inserts
    /// `text` at `start` (if non-empty), pushes a single-operation
    /// transaction and clears the redo stack. Returns the operation to
    /// broadcast.
    pub fn set_text_in_range(
        &mut self,
        start: Point,
        end: Point,
        text: &str,
    ) -> Result<Operation> {
        if end < start {
            return Err(Error::PositionOutOfRange);
        }
        let splice_id = SpliceId::new(self.site_id, self.next_sequence_number);
        let deletion = if end > start {
            Some(self.delete(splice_id, start, end)?)
        } else {
            None
        };
        let insertion = if !text.is_empty() {
            Some(self.insert(splice_id, start, text)?)
        } else {
            None
        };
        self.update_max_seqs(splice_id)?;

        let op = Operation::Splice(SpliceOperation { splice_id, deletion, insertion });
        self.operations.push(op.clone());
        let timestamp = self.now();
        self.undo_stack.push(UndoRecord::Transaction(Transaction {
            timestamp,
            grouping_interval: None,
            operations: SmallVec::from_elem(op.clone(), 1),
            markers_before: None,
            markers_after: None,
        }));
        self.redo_stack.clear();
        Ok(op)
    }

    /// Covers `start..end` with `splice_id` and records the causal frontier
    /// seen while walking the covered segments.
    fn delete(&mut self, splice_id: SpliceId, start: Point, end: Point) -> Result<TextDeletion> {
        let (_, left) = self.find_local_segment_boundary(start)?;
        let (right, _) = self.find_local_segment_boundary(end)?;

        let mut max_seqs_by_site: HashMap<SiteId, SeqNumber> = HashMap::new();
        let mut segment = left;
        loop {
            let id = self.pool[segment].splice_id;
            let entry = max_seqs_by_site.entry(id.site).or_insert(0);
            if id.seq > *entry {
                *entry = id.seq;
            }
            self.pool[segment].deletions.insert(splice_id);
            let vis = visible(&self.undo_counts);
            self.document_tree.splay(&mut self.pool, &vis, segment);
            self.document_tree.update_aggregate(&mut self.pool, &vis, segment);
            if segment == right {
                break;
            }
            segment = self
                .document_tree
                .successor(&self.pool, segment)
                .ok_or(Error::SegmentNotFound)?;
        }

        let deletion = TextDeletion {
            max_seqs_by_site,
            left_dependency_id: self.pool[left].splice_id,
            offset_in_left_dependency: self.pool[left].offset,
            right_dependency_id: self.pool[right].splice_id,
            offset_in_right_dependency: self.pool[right].end_offset(),
        };
        self.deletions.insert(splice_id, deletion.clone());
        Ok(deletion)
    }

    /// Inserts `text` at `position` as a fresh segment bracketed by the
    /// current boundary segments.
    fn insert(&mut self, splice_id: SpliceId, position: Point, text: &str) -> Result<TextInsertion> {
        let (left, right) = self.find_local_segment_boundary(position)?;

        let mut segment = Segment::new(splice_id, Point::zero(), text);
        segment.left_dependency = Some(left);
        segment.right_dependency = Some(right);
        let new_idx = self.pool.insert(segment);

        let vis = visible(&self.undo_counts);
        self.document_tree.insert_between(&mut self.pool, &vis, left, right, new_idx);
        self.split_trees.insert(splice_id, SplitTree::new(&mut self.pool, new_idx));

        Ok(TextInsertion {
            text: text.into(),
            left_dependency_id: self.pool[left].splice_id,
            offset_in_left_dependency: self.pool[left].end_offset(),
            right_dependency_id: self.pool[right].splice_id,
            offset_in_right_dependency: self.pool[right].offset,
        })
    }

    /// The pair of segments bracketing a linear position, splitting a
    /// segment when the position falls strictly inside it.
    fn find_local_segment_boundary(&mut self, position: Point) -> Result<(SegmentIdx, SegmentIdx)> {
        let (segment, start, _end) = {
            let vis = visible(&self.undo_counts);
            self.document_tree
                .find_segment_containing_position(&self.pool, &vis, position)?
        };
        let offset = position.traversal(start);
        self.segment_boundary(segment, offset)
    }

    fn segment_boundary(
        &mut self,
        segment: SegmentIdx,
        offset: Point,
    ) -> Result<(SegmentIdx, SegmentIdx)> {
        // Extent first: on the zero-extent sentinels both boundary checks
        // hold and the successor side is the meaningful one.
        if offset == self.pool[segment].extent {
            let next = self
                .document_tree
                .successor(&self.pool, segment)
                .ok_or(Error::SegmentNotFound)?;
            Ok((segment, next))
        } else if offset.is_zero() {
            let prev = self
                .document_tree
                .predecessor(&self.pool, segment)
                .ok_or(Error::SegmentNotFound)?;
            Ok((prev, segment))
        } else {
            let suffix = self.split_segment(segment, offset)?;
            Ok((segment, suffix))
        }
    }

    /// Splits `segment` at `offset` (relative to the segment) in both trees.
    fn split_segment(&mut self, segment: SegmentIdx, offset: Point) -> Result<SegmentIdx> {
        let splice_id = self.pool[segment].splice_id;
        let split_tree = self
            .split_trees
            .get_mut(&splice_id)
            .ok_or(Error::SegmentNotFound)?;
        let suffix = split_tree.split_segment(&mut self.pool, segment, offset);
        let vis = visible(&self.undo_counts);
        self.document_tree.split_segment(&mut self.pool, &vis, segment, suffix);
        Ok(suffix)
    }

    /// The piece of `splice_id` starting exactly at `offset`, splitting as
    /// needed.
    fn find_segment_start(&mut self, splice_id: SpliceId, offset: Point) -> Result<SegmentIdx> {
        let split_tree = self
            .split_trees
            .get_mut(&splice_id)
            .ok_or(Error::SegmentNotFound)?;
        let segment = split_tree.find_segment_containing_offset(&mut self.pool, offset)?;
        let (seg_offset, seg_end) = {
            let seg = &self.pool[segment];
            (seg.offset, seg.end_offset())
        };
        if seg_offset == offset {
            Ok(segment)
        } else if seg_end == offset {
            self.pool[segment].next_split.ok_or(Error::SegmentNotFound)
        } else {
            self.split_segment(segment, offset.traversal(seg_offset))
        }
    }

    /// The piece of `splice_id` ending exactly at `offset`, splitting as
    /// needed.
    fn find_segment_end(&mut self, splice_id: SpliceId, offset: Point) -> Result<SegmentIdx> {
        let split_tree = self
            .split_trees
            .get_mut(&splice_id)
            .ok_or(Error::SegmentNotFound)?;
        let segment = split_tree.find_segment_containing_offset(&mut self.pool, offset)?;
        let (seg_offset, seg_end) = {
            let seg = &self.pool[segment];
            (seg.offset, seg.end_offset())
        };
        if seg_end == offset {
            Ok(segment)
        } else {
            self.split_segment(segment, offset.traversal(seg_offset))?;
            Ok(segment)
        }
    }

    // ------------------------------------------------------------------
    // Integration
    // ------------------------------------------------------------------

    /// Integrates a batch of remote operations. Operations whose causal
    /// dependencies are missing are parked and picked back up when the
    /// dependency lands; redelivered operations are silent no-ops. Returns
    /// the linear text updates and resolved marker deltas the batch caused.
    pub fn integrate_operations(
        &mut self,
        operations: Vec<Operation>,
    ) -> Result<DocumentStateUpdate> {
        let mut queue: VecDeque<Operation> = operations.into();
        let mut integrated: Vec<Operation> = Vec::new();
        let mut old_undo_counts = UndoCounts::new();
        let mut marker_updates = ResolvedMarkerUpdates::new();

        while let Some(op) = queue.pop_front() {
            if let Operation::Splice(splice) = &op {
                if self.has_applied_splice(splice.splice_id) {
                    continue;
                }
            }
            if !self.can_integrate_operation(&op) {
                self.defer_operation(op);
                continue;
            }
            match op {
                Operation::Splice(splice) => {
                    let splice_id = splice.splice_id;
                    if let Some(deletion) = &splice.deletion {
                        self.integrate_deletion(splice_id, deletion)?;
                    }
                    if let Some(insertion) = &splice.insertion {
                        self.integrate_insertion(splice_id, insertion)?;
                    }
                    self.update_max_seqs(splice_id)?;
                    let op = Operation::Splice(splice);
                    self.operations.push(op.clone());
                    integrated.push(op);
                    self.collect_deferred_operations(splice_id, &mut queue);
                    self.collect_deferred_marker_updates(&mut marker_updates, splice_id)?;
                }
                Operation::Undo(undo) => {
                    if self.integrate_undo(&undo, &mut old_undo_counts)? {
                        let op = Operation::Undo(undo);
                        self.operations.push(op.clone());
                        integrated.push(op);
                    }
                }
                Operation::MarkersUpdate(update) => {
                    self.integrate_marker_updates(&mut marker_updates, update)?;
                }
            }
        }

        let text_updates =
            self.text_updates_for_operations(&integrated, Some(&old_undo_counts))?;
        Ok(DocumentStateUpdate { text_updates, marker_updates })
    }

    fn max_seq_for(&self, site: SiteId) -> SeqNumber {
        self.max_seqs_by_site.get(&site).copied().unwrap_or(0)
    }

    /// A splice counts as applied once its insertion or deletion record is
    /// present.
    fn has_applied_splice(&self, splice_id: SpliceId) -> bool {
        self.split_trees.contains_key(&splice_id) || self.deletions.contains_key(&splice_id)
    }

    fn can_integrate_operation(&self, op: &Operation) -> bool {
        match op {
            Operation::Splice(splice) => {
                let id = splice.splice_id;
                if id.seq == 0 || self.max_seq_for(id.site) != id.seq - 1 {
                    return false;
                }
                if let Some(deletion) = &splice.deletion {
                    if !self.has_applied_splice(deletion.left_dependency_id)
                        || !self.has_applied_splice(deletion.right_dependency_id)
                    {
                        return false;
                    }
                    for (&site, &seq) in &deletion.max_seqs_by_site {
                        if self.max_seq_for(site) < seq {
                            return false;
                        }
                    }
                }
                if let Some(insertion) = &splice.insertion {
                    if !self.has_applied_splice(insertion.left_dependency_id)
                        || !self.has_applied_splice(insertion.right_dependency_id)
                    {
                        return false;
                    }
                }
                true
            }
            Operation::Undo(undo) => self.has_applied_splice(undo.splice_id),
            Operation::MarkersUpdate(_) => true,
        }
    }

    /// Files `op` under every splice id it is still waiting on, plus the
    /// previous-sequence key when it arrived out of per-site order.
    fn defer_operation(&mut self, op: Operation) {
        let mut keys: SmallVec<[SpliceId; 4]> = SmallVec::new();
        match &op {
            Operation::Splice(splice) => {
                let id = splice.splice_id;
                if id.seq > 0 && self.max_seq_for(id.site) != id.seq - 1 {
                    keys.push(SpliceId::new(id.site, id.seq - 1));
                }
                if let Some(deletion) = &splice.deletion {
                    for dep in [deletion.left_dependency_id, deletion.right_dependency_id] {
                        if !self.has_applied_splice(dep) {
                            keys.push(dep);
                        }
                    }
                    for (&site, &seq) in &deletion.max_seqs_by_site {
                        if self.max_seq_for(site) < seq {
                            keys.push(SpliceId::new(site, seq));
                        }
                    }
                }
                if let Some(insertion) = &splice.insertion {
                    for dep in [insertion.left_dependency_id, insertion.right_dependency_id] {
                        if !self.has_applied_splice(dep) {
                            keys.push(dep);
                        }
                    }
                }
            }
            Operation::Undo(undo) => keys.push(undo.splice_id),
            Operation::MarkersUpdate(_) => return,
        }
        keys.sort_unstable();
        keys.dedup();
        for key in keys {
            let entry = self.deferred_operations.entry(key).or_default();
            if !entry.contains(&op) {
                entry.push(op.clone());
            }
        }
    }

    /// Requeues everything parked on `splice_id`. Whatever is still not
    /// ready will be re-deferred with freshly computed missing keys.
    fn collect_deferred_operations(&mut self, splice_id: SpliceId, queue: &mut VecDeque<Operation>) {
        if let Some(ops) = self.deferred_operations.remove(&splice_id) {
            queue.extend(ops);
        }
    }

    fn update_max_seqs(&mut self, splice_id: SpliceId) -> Result<()> {
        if self.max_seq_for(splice_id.site) != splice_id.seq - 1 {
            return Err(Error::OutOfOrderOperation);
        }
        self.max_seqs_by_site.insert(splice_id.site, splice_id.seq);
        if splice_id.site == self.site_id {
            self.next_sequence_number = splice_id.seq + 1;
        }
        Ok(())
    }

    /// Places a remote insertion. Segments sitting between the original
    /// dependencies are concurrent siblings whose order against this
    /// insertion is unresolved; the site id breaks those ties, everything
    /// else keeps its place.
    fn integrate_insertion(&mut self, splice_id: SpliceId, insertion: &TextInsertion) -> Result<()> {
        let original_left = self.find_segment_end(
            insertion.left_dependency_id,
            insertion.offset_in_left_dependency,
        )?;
        let original_right = self.find_segment_start(
            insertion.right_dependency_id,
            insertion.offset_in_right_dependency,
        )?;

        let original_left_index = self.document_tree.index_of(&self.pool, original_left);
        let original_right_index = self.document_tree.index_of(&self.pool, original_right);

        let mut left = original_left;
        let mut right = original_right;
        let mut current = self
            .document_tree
            .successor(&self.pool, left)
            .ok_or(Error::SegmentNotFound)?;
        while current != right {
            let current_left_dep =
                self.pool[current].left_dependency.ok_or(Error::SegmentNotFound)?;
            let current_right_dep =
                self.pool[current].right_dependency.ok_or(Error::SegmentNotFound)?;
            let left_dep_index = self.document_tree.index_of(&self.pool, current_left_dep);
            let right_dep_index = self.document_tree.index_of(&self.pool, current_right_dep);

            if left_dep_index <= original_left_index && right_dep_index >= original_right_index {
                if splice_id.site < self.pool[current].splice_id.site {
                    right = current;
                } else {
                    left = current;
                }
                current = self
                    .document_tree
                    .successor(&self.pool, left)
                    .ok_or(Error::SegmentNotFound)?;
            } else {
                current = self
                    .document_tree
                    .successor(&self.pool, current)
                    .ok_or(Error::SegmentNotFound)?;
            }
        }

        let mut segment = Segment::new(splice_id, Point::zero(), &insertion.text);
        segment.left_dependency = Some(original_left);
        segment.right_dependency = Some(original_right);
        let new_idx = self.pool.insert(segment);

        let vis = visible(&self.undo_counts);
        self.document_tree.insert_between(&mut self.pool, &vis, left, right, new_idx);
        self.split_trees.insert(splice_id, SplitTree::new(&mut self.pool, new_idx));
        Ok(())
    }

    /// Applies a remote deletion to exactly the segments its issuer had
    /// seen: anything newer than the recorded per-site frontier survives.
    fn integrate_deletion(&mut self, splice_id: SpliceId, deletion: &TextDeletion) -> Result<()> {
        let left = self.find_segment_start(
            deletion.left_dependency_id,
            deletion.offset_in_left_dependency,
        )?;
        let right = self.find_segment_end(
            deletion.right_dependency_id,
            deletion.offset_in_right_dependency,
        )?;

        let mut segment = left;
        loop {
            let id = self.pool[segment].splice_id;
            let max_seq = deletion.max_seqs_by_site.get(&id.site).copied().unwrap_or(0);
            if id.seq <= max_seq {
                self.pool[segment].deletions.insert(splice_id);
                let vis = visible(&self.undo_counts);
                self.document_tree.splay(&mut self.pool, &vis, segment);
                self.document_tree.update_aggregate(&mut self.pool, &vis, segment);
            }
            if segment == right {
                break;
            }
            segment = self
                .document_tree
                .successor(&self.pool, segment)
                .ok_or(Error::SegmentNotFound)?;
        }
        self.deletions.insert(splice_id, deletion.clone());
        Ok(())
    }

    fn integrate_undo(
        &mut self,
        undo: &UndoOperation,
        old_undo_counts: &mut UndoCounts,
    ) -> Result<bool> {
        self.update_undo_count(undo.splice_id, undo.undo_count, old_undo_counts)
    }

    /// Max-wins update of a splice's undo count. On increase, refreshes the
    /// aggregates of every segment whose visibility hinges on the splice.
    fn update_undo_count(
        &mut self,
        splice_id: SpliceId,
        new_count: u32,
        old_undo_counts: &mut UndoCounts,
    ) -> Result<bool> {
        let previous = self.undo_counts.get(&splice_id).copied().unwrap_or(0);
        if new_count <= previous {
            return Ok(false);
        }
        old_undo_counts.entry(splice_id).or_insert(previous);
        self.undo_counts.insert(splice_id, new_count);

        let segments = self.collect_segments(splice_id)?;
        for segment in segments {
            let vis = visible(&self.undo_counts);
            self.document_tree.splay(&mut self.pool, &vis, segment);
            self.document_tree.update_aggregate(&mut self.pool, &vis, segment);
        }
        Ok(true)
    }

    /// All segments affected by a splice: its own pieces (insertion side)
    /// and the segments its deletion currently covers.
    fn collect_segments(&mut self, splice_id: SpliceId) -> Result<Vec<SegmentIdx>> {
        let mut result = Vec::new();
        if let Some(tree) = self.split_trees.get(&splice_id) {
            let mut segment = Some(tree.start());
            while let Some(idx) = segment {
                result.push(idx);
                segment = self.pool[idx].next_split;
            }
        }
        if let Some(deletion) = self.deletions.get(&splice_id).cloned() {
            let left = self.find_segment_start(
                deletion.left_dependency_id,
                deletion.offset_in_left_dependency,
            )?;
            let right = self.find_segment_end(
                deletion.right_dependency_id,
                deletion.offset_in_right_dependency,
            )?;
            let mut segment = left;
            loop {
                if self.pool[segment].deletions.contains(&splice_id) {
                    result.push(segment);
                }
                if segment == right {
                    break;
                }
                segment = self
                    .document_tree
                    .successor(&self.pool, segment)
                    .ok_or(Error::SegmentNotFound)?;
            }
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Linear text updates
    // ------------------------------------------------------------------

    /// Computes the linear transform a set of just-applied operations
    /// caused. `old_undo_counts` holds pre-change counts for splices whose
    /// counters moved; splices introduced by the set itself are treated as
    /// nonexistent on the old side.
    fn text_updates_for_operations(
        &mut self,
        operations: &[Operation],
        old_undo_counts: Option<&UndoCounts>,
    ) -> Result<Vec<TextUpdate>> {
        let mut new_splice_ids: HashSet<SpliceId> = HashSet::new();
        let mut segments: HashSet<SegmentIdx> = HashSet::new();
        for op in operations {
            let splice_id = match op {
                Operation::Splice(splice) => {
                    new_splice_ids.insert(splice.splice_id);
                    splice.splice_id
                }
                Operation::Undo(undo) => undo.splice_id,
                Operation::MarkersUpdate(_) => continue,
            };
            segments.extend(self.collect_segments(splice_id)?);
        }
        self.compute_changes_for_segments(segments, old_undo_counts, &new_splice_ids)
    }

    fn compute_changes_for_segments(
        &mut self,
        segments: HashSet<SegmentIdx>,
        old_undo_counts: Option<&UndoCounts>,
        new_splice_ids: &HashSet<SpliceId>,
    ) -> Result<Vec<TextUpdate>> {
        let mut ordered: Vec<SegmentIdx> = segments.into_iter().collect();
        ordered.sort_by_key(|&segment| self.document_tree.index_of(&self.pool, segment));

        let mut changes: Vec<TextUpdate> = Vec::new();
        for segment in ordered {
            let visible_before = segment_visible(
                &self.pool[segment],
                &self.undo_counts,
                old_undo_counts,
                Some(new_splice_ids),
            );
            let visible_after =
                segment_visible(&self.pool[segment], &self.undo_counts, None, None);
            if visible_before == visible_after {
                continue;
            }

            let new_start = {
                let vis = visible(&self.undo_counts);
                self.document_tree.position_of(&mut self.pool, &vis, segment)
            };
            let (extent, text) = {
                let seg = &self.pool[segment];
                (seg.extent, seg.text.clone())
            };
            // Positions before the first change are identical in both
            // coordinate spaces; after that, old positions trail the last
            // change's old end by the unchanged gap.
            let old_start = match changes.last() {
                Some(last) => last.old_end.traverse(new_start.traversal(last.new_end)),
                None => new_start,
            };

            match changes.last_mut() {
                Some(last) if last.new_end == new_start => {
                    if visible_after {
                        last.new_end = last.new_end.traverse(extent);
                        last.new_text.push_str(&text);
                    } else {
                        last.old_end = last.old_end.traverse(extent);
                        last.old_text.push_str(&text);
                    }
                }
                _ => {
                    if visible_after {
                        changes.push(TextUpdate {
                            old_start,
                            old_end: old_start,
                            old_text: "".into(),
                            new_start,
                            new_end: new_start.traverse(extent),
                            new_text: text,
                        });
                    } else {
                        changes.push(TextUpdate {
                            old_start,
                            old_end: old_start.traverse(extent),
                            old_text: text,
                            new_start,
                            new_end: new_start,
                            new_text: "".into(),
                        });
                    }
                }
            }
        }
        Ok(changes)
    }

    // ------------------------------------------------------------------
    // Undo / redo / checkpoints
    // ------------------------------------------------------------------

    /// Flips the undo counter of every splice in `operations` and returns
    /// the counter operations for broadcast plus the resulting text updates.
    /// The caller decides whether the counter operations enter the log.
    fn undo_or_redo_operations(
        &mut self,
        operations: &[Operation],
    ) -> Result<(Vec<Operation>, Vec<TextUpdate>)> {
        let mut counter_ops: Vec<Operation> = Vec::with_capacity(operations.len());
        let mut old_undo_counts = UndoCounts::new();
        for op in operations {
            let splice_id = match op {
                Operation::Splice(splice) => splice.splice_id,
                Operation::Undo(undo) => undo.splice_id,
                Operation::MarkersUpdate(_) => continue,
            };
            let new_count = self.undo_counts.get(&splice_id).copied().unwrap_or(0) + 1;
            self.update_undo_count(splice_id, new_count, &mut old_undo_counts)?;
            counter_ops.push(Operation::Undo(UndoOperation { splice_id, undo_count: new_count }));
        }
        let text_updates =
            self.text_updates_for_operations(&counter_ops, Some(&old_undo_counts))?;
        Ok((counter_ops, text_updates))
    }

    /// Undoes the topmost transaction, unless a barrier checkpoint sits
    /// above it. The transaction and any checkpoints above it move to the
    /// redo stack.
    pub fn undo(&mut self) -> Result<Option<UndoRedoResult>> {
        let mut target = None;
        for i in (0..self.undo_stack.len()).rev() {
            match &self.undo_stack[i] {
                UndoRecord::Checkpoint(c) if c.is_barrier => return Ok(None),
                UndoRecord::Checkpoint(_) => {}
                UndoRecord::Transaction(_) => {
                    target = Some(i);
                    break;
                }
            }
        }
        let Some(index) = target else { return Ok(None) };

        let (ops, markers_before) = match &self.undo_stack[index] {
            UndoRecord::Transaction(t) => (t.operations.clone(), t.markers_before.clone()),
            UndoRecord::Checkpoint(_) => unreachable!(),
        };
        let (operations, text_updates) = self.undo_or_redo_operations(&ops)?;
        self.operations.extend(operations.iter().cloned());

        let moved = self.undo_stack.split_off(index);
        self.redo_stack.extend(moved.into_iter().rev());

        let markers = match markers_before {
            Some(snapshot) => Some(self.markers_from_snapshot(&snapshot)?),
            None => None,
        };
        Ok(Some(UndoRedoResult { operations, text_updates, markers }))
    }

    /// Redoes the topmost undone transaction. Checkpoints that sat above it
    /// on the undo stack follow it back.
    pub fn redo(&mut self) -> Result<Option<UndoRedoResult>> {
        let mut target = None;
        for i in (0..self.redo_stack.len()).rev() {
            if let UndoRecord::Transaction(_) = &self.redo_stack[i] {
                target = Some(i);
                break;
            }
        }
        let Some(index) = target else { return Ok(None) };

        let (ops, markers_after) = match &self.redo_stack[index] {
            UndoRecord::Transaction(t) => (t.operations.clone(), t.markers_after.clone()),
            UndoRecord::Checkpoint(_) => unreachable!(),
        };
        let (operations, text_updates) = self.undo_or_redo_operations(&ops)?;
        self.operations.extend(operations.iter().cloned());

        let moved = self.redo_stack.split_off(index);
        self.undo_stack.extend(moved.into_iter().rev());
        while let Some(UndoRecord::Checkpoint(_)) = self.redo_stack.last() {
            let checkpoint = self.redo_stack.pop().unwrap();
            self.undo_stack.push(checkpoint);
        }

        let markers = match markers_after {
            Some(snapshot) => Some(self.markers_from_snapshot(&snapshot)?),
            None => None,
        };
        Ok(Some(UndoRedoResult { operations, text_updates, markers }))
    }

    /// Pushes a checkpoint and returns its id. A barrier checkpoint refuses
    /// undo, revert and grouping across it.
    pub fn create_checkpoint(
        &mut self,
        is_barrier: bool,
        markers: Option<&LocalMarkers>,
    ) -> Result<CheckpointId> {
        let id = self.next_checkpoint_id;
        self.next_checkpoint_id += 1;
        let markers = match markers {
            Some(m) => Some(self.snapshot_from_markers(m)?),
            None => None,
        };
        self.undo_stack.push(UndoRecord::Checkpoint(Checkpoint { id, is_barrier, markers }));
        Ok(id)
    }

    /// Stack index of `checkpoint_id`, or `None` when it is missing or a
    /// barrier lies above it.
    fn find_checkpoint(&self, checkpoint_id: CheckpointId) -> Option<usize> {
        for i in (0..self.undo_stack.len()).rev() {
            if let UndoRecord::Checkpoint(c) = &self.undo_stack[i] {
                if c.id == checkpoint_id {
                    return Some(i);
                }
                if c.is_barrier {
                    return None;
                }
            }
        }
        None
    }

    /// Operations of every transaction above stack index `index`, in
    /// chronological order.
    fn operations_since(&self, index: usize) -> Vec<Operation> {
        let mut ops = Vec::new();
        for record in &self.undo_stack[index + 1..] {
            if let UndoRecord::Transaction(t) = record {
                ops.extend(t.operations.iter().cloned());
            }
        }
        ops
    }

    /// The combined text updates of everything since the checkpoint, or
    /// `None` if the checkpoint is missing or blocked by a barrier.
    pub fn get_changes_since_checkpoint(
        &mut self,
        checkpoint_id: CheckpointId,
    ) -> Result<Option<Vec<TextUpdate>>> {
        let Some(index) = self.find_checkpoint(checkpoint_id) else {
            return Ok(None);
        };
        let ops = self.operations_since(index);
        Ok(Some(self.text_updates_for_operations(&ops, None)?))
    }

    /// Collapses everything since the checkpoint into one transaction whose
    /// marker snapshots span from the checkpoint's markers to `markers`.
    /// Returns the collapsed updates, or `None` when refused.
    pub fn group_changes_since_checkpoint(
        &mut self,
        checkpoint_id: CheckpointId,
        delete_checkpoint: bool,
        markers: Option<&LocalMarkers>,
    ) -> Result<Option<Vec<TextUpdate>>> {
        let Some(index) = self.find_checkpoint(checkpoint_id) else {
            return Ok(None);
        };
        let checkpoint_markers = match &self.undo_stack[index] {
            UndoRecord::Checkpoint(c) => c.markers.clone(),
            UndoRecord::Transaction(_) => unreachable!(),
        };
        let ops = self.operations_since(index);
        let text_updates = self.text_updates_for_operations(&ops, None)?;

        self.undo_stack.truncate(index + 1);
        if !ops.is_empty() {
            let markers_after = match markers {
                Some(m) => Some(self.snapshot_from_markers(m)?),
                None => None,
            };
            let timestamp = self.now();
            self.undo_stack.push(UndoRecord::Transaction(Transaction {
                timestamp,
                grouping_interval: None,
                operations: ops.into(),
                markers_before: checkpoint_markers,
                markers_after,
            }));
        }
        if delete_checkpoint {
            self.undo_stack.remove(index);
        }
        Ok(Some(text_updates))
    }

    /// Undoes everything since the checkpoint and drops those records from
    /// the stack. Returns `None` when refused.
    pub fn revert_to_checkpoint(
        &mut self,
        checkpoint_id: CheckpointId,
        delete_checkpoint: bool,
    ) -> Result<Option<UndoRedoResult>> {
        let Some(index) = self.find_checkpoint(checkpoint_id) else {
            return Ok(None);
        };
        let checkpoint_markers = match &self.undo_stack[index] {
            UndoRecord::Checkpoint(c) => c.markers.clone(),
            UndoRecord::Transaction(_) => unreachable!(),
        };
        let ops = self.operations_since(index);
        let (operations, text_updates) = self.undo_or_redo_operations(&ops)?;
        self.operations.extend(operations.iter().cloned());

        self.undo_stack.truncate(index + 1);
        if delete_checkpoint {
            self.undo_stack.pop();
        }
        let markers = match checkpoint_markers {
            Some(snapshot) => Some(self.markers_from_snapshot(&snapshot)?),
            None => None,
        };
        Ok(Some(UndoRedoResult { operations, text_updates, markers }))
    }

    /// Tags the top transaction with a grouping interval and merges it into
    /// the previous transaction when they landed close enough together.
    pub fn apply_grouping_interval(&mut self, grouping_interval: u64) {
        let len = self.undo_stack.len();
        match self.undo_stack.last_mut() {
            Some(UndoRecord::Transaction(top)) => {
                top.grouping_interval = Some(grouping_interval);
            }
            _ => return,
        }
        if len < 2 {
            return;
        }
        let (head, tail) = self.undo_stack.split_at_mut(len - 1);
        let UndoRecord::Transaction(top) = &mut tail[0] else { return };
        let Some(UndoRecord::Transaction(previous)) = head.last_mut() else { return };

        let time_between = top.timestamp.saturating_sub(previous.timestamp);
        let min_interval = previous.grouping_interval.unwrap_or(u64::MAX).min(grouping_interval);
        if time_between < min_interval {
            previous.timestamp = top.timestamp;
            previous.grouping_interval = Some(grouping_interval);
            let ops = std::mem::take(&mut top.operations);
            previous.operations.extend(ops);
            previous.markers_after = top.markers_after.take();
            self.undo_stack.pop();
        }
    }

    /// Merges the two topmost transactions into one, provided no barrier
    /// sits between or above them. Returns whether a merge happened.
    pub fn group_last_changes(&mut self) -> bool {
        let mut later: Option<usize> = None;
        for i in (0..self.undo_stack.len()).rev() {
            match &self.undo_stack[i] {
                UndoRecord::Checkpoint(c) if c.is_barrier => return false,
                UndoRecord::Checkpoint(_) => {}
                UndoRecord::Transaction(_) => {
                    if let Some(later_index) = later {
                        let UndoRecord::Transaction(later_txn) =
                            self.undo_stack.remove(later_index)
                        else {
                            unreachable!()
                        };
                        let UndoRecord::Transaction(earlier) = &mut self.undo_stack[i] else {
                            unreachable!()
                        };
                        earlier.timestamp = later_txn.timestamp;
                        earlier.grouping_interval = later_txn.grouping_interval;
                        earlier.operations.extend(later_txn.operations);
                        earlier.markers_after = later_txn.markers_after;
                        return true;
                    }
                    later = Some(i);
                }
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Markers
    // ------------------------------------------------------------------

    /// Applies local marker edits, storing them in logical form, and returns
    /// the operation that replicates them.
    pub fn update_markers(&mut self, layer_updates: LocalMarkerUpdates) -> Result<Operation> {
        let mut updates: HashMap<LayerId, Option<HashMap<MarkerId, Option<Marker<LogicalRange>>>>> =
            HashMap::new();
        for (layer_id, layer_update) in layer_updates {
            match layer_update {
                None => {
                    let layers = self.marker_layers.entry(self.site_id).or_default();
                    if layers.remove(&layer_id).is_some() {
                        updates.insert(layer_id, None);
                    }
                }
                Some(markers) => {
                    let mut layer_out: HashMap<MarkerId, Option<Marker<LogicalRange>>> =
                        HashMap::new();
                    self.marker_layers
                        .entry(self.site_id)
                        .or_default()
                        .entry(layer_id)
                        .or_default();
                    for (marker_id, marker) in markers {
                        match marker {
                            Some(marker) => {
                                let logical =
                                    self.get_logical_range(&marker.range, marker.exclusive)?;
                                let stored = marker.with_range(logical);
                                self.marker_layers
                                    .entry(self.site_id)
                                    .or_default()
                                    .entry(layer_id)
                                    .or_default()
                                    .insert(marker_id, stored.clone());
                                layer_out.insert(marker_id, Some(stored));
                            }
                            None => {
                                let removed = self
                                    .marker_layers
                                    .get_mut(&self.site_id)
                                    .and_then(|layers| layers.get_mut(&layer_id))
                                    .map_or(false, |layer| layer.remove(&marker_id).is_some());
                                if removed {
                                    layer_out.insert(marker_id, None);
                                }
                            }
                        }
                    }
                    updates.insert(layer_id, Some(layer_out));
                }
            }
        }
        Ok(Operation::MarkersUpdate(MarkersUpdateOperation { site_id: self.site_id, updates }))
    }

    /// Every site's markers, resolved to linear ranges.
    pub fn get_markers(&mut self) -> Result<ResolvedMarkers> {
        let layers_by_site = self.marker_layers.clone();
        let mut result = ResolvedMarkers::new();
        for (site_id, layers) in layers_by_site {
            if layers.is_empty() {
                continue;
            }
            let mut site_out = LocalMarkers::new();
            for (layer_id, markers) in layers {
                let mut layer_out = HashMap::new();
                for (marker_id, marker) in markers {
                    let range = self.resolve_logical_range(&marker.range, marker.exclusive)?;
                    layer_out.insert(marker_id, marker.with_range(range));
                }
                site_out.insert(layer_id, layer_out);
            }
            result.insert(site_id, site_out);
        }
        Ok(result)
    }

    fn record_marker_update(
        acc: &mut ResolvedMarkerUpdates,
        site_id: SiteId,
        layer_id: LayerId,
        marker_id: MarkerId,
        marker: Option<Marker<Range>>,
    ) {
        let layer = acc
            .entry(site_id)
            .or_default()
            .entry(layer_id)
            .or_insert_with(|| Some(HashMap::new()));
        layer.get_or_insert_with(HashMap::new).insert(marker_id, marker);
    }

    /// Applies one site's marker operation. Updates whose anchors are not
    /// applied yet are parked; a later update or removal for the same marker
    /// supersedes a parked one.
    fn integrate_marker_updates(
        &mut self,
        acc: &mut ResolvedMarkerUpdates,
        op: MarkersUpdateOperation,
    ) -> Result<()> {
        let MarkersUpdateOperation { site_id, updates } = op;
        for (layer_id, layer_update) in updates {
            match layer_update {
                None => {
                    if let Some(deferred) = self.deferred_marker_updates.get_mut(&site_id) {
                        deferred.remove(&layer_id);
                    }
                    let removed = self
                        .marker_layers
                        .get_mut(&site_id)
                        .map_or(false, |layers| layers.remove(&layer_id).is_some());
                    if removed {
                        acc.entry(site_id).or_default().insert(layer_id, None);
                    }
                }
                Some(markers) => {
                    self.marker_layers.entry(site_id).or_default().entry(layer_id).or_default();
                    for (marker_id, update) in markers {
                        match update {
                            Some(marker) => {
                                self.remove_deferred_marker_update(site_id, layer_id, marker_id);
                                if self.can_resolve_logical_range(&marker.range) {
                                    self.integrate_marker_update(
                                        acc, site_id, layer_id, marker_id, marker,
                                    )?;
                                } else {
                                    self.defer_marker_update(site_id, layer_id, marker_id, marker);
                                }
                            }
                            None => {
                                self.remove_deferred_marker_update(site_id, layer_id, marker_id);
                                let removed = self
                                    .marker_layers
                                    .get_mut(&site_id)
                                    .and_then(|layers| layers.get_mut(&layer_id))
                                    .map_or(false, |layer| layer.remove(&marker_id).is_some());
                                if removed {
                                    Self::record_marker_update(
                                        acc, site_id, layer_id, marker_id, None,
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn integrate_marker_update(
        &mut self,
        acc: &mut ResolvedMarkerUpdates,
        site_id: SiteId,
        layer_id: LayerId,
        marker_id: MarkerId,
        marker: Marker<LogicalRange>,
    ) -> Result<()> {
        let range = self.resolve_logical_range(&marker.range, marker.exclusive)?;
        self.marker_layers
            .entry(site_id)
            .or_default()
            .entry(layer_id)
            .or_default()
            .insert(marker_id, marker.clone());
        Self::record_marker_update(acc, site_id, layer_id, marker_id, Some(marker.with_range(range)));
        Ok(())
    }

    fn defer_marker_update(
        &mut self,
        site_id: SiteId,
        layer_id: LayerId,
        marker_id: MarkerId,
        marker: Marker<LogicalRange>,
    ) {
        for dep in [marker.range.start_dependency_id, marker.range.end_dependency_id] {
            self.deferred_marker_updates_by_dependency
                .entry(dep)
                .or_default()
                .insert((site_id, layer_id, marker_id));
        }
        self.deferred_marker_updates
            .entry(site_id)
            .or_default()
            .entry(layer_id)
            .or_default()
            .insert(marker_id, marker);
    }

    fn remove_deferred_marker_update(
        &mut self,
        site_id: SiteId,
        layer_id: LayerId,
        marker_id: MarkerId,
    ) {
        // Stale dependency-index entries are tolerated; the collection pass
        // checks for the update's continued existence before integrating.
        if let Some(layers) = self.deferred_marker_updates.get_mut(&site_id) {
            if let Some(layer) = layers.get_mut(&layer_id) {
                layer.remove(&marker_id);
            }
        }
    }

    /// Re-examines marker updates parked on `splice_id`; those whose anchors
    /// are now all applied materialize.
    fn collect_deferred_marker_updates(
        &mut self,
        acc: &mut ResolvedMarkerUpdates,
        splice_id: SpliceId,
    ) -> Result<()> {
        let Some(keys) = self.deferred_marker_updates_by_dependency.remove(&splice_id) else {
            return Ok(());
        };
        for (site_id, layer_id, marker_id) in keys {
            let marker = self
                .deferred_marker_updates
                .get(&site_id)
                .and_then(|layers| layers.get(&layer_id))
                .and_then(|layer| layer.get(&marker_id))
                .cloned();
            let Some(marker) = marker else { continue };
            if self.can_resolve_logical_range(&marker.range) {
                self.remove_deferred_marker_update(site_id, layer_id, marker_id);
                self.integrate_marker_update(acc, site_id, layer_id, marker_id, marker)?;
            }
        }
        Ok(())
    }

    fn can_resolve_logical_range(&self, range: &LogicalRange) -> bool {
        self.split_trees.contains_key(&range.start_dependency_id)
            && self.split_trees.contains_key(&range.end_dependency_id)
    }

    /// Anchors a linear position: the containing segment plus the offset
    /// within its splice. With `prefer_start`, a position on a segment
    /// boundary anchors to the start of the following segment instead.
    fn find_segment_for_position(
        &mut self,
        position: Point,
        prefer_start: bool,
    ) -> Result<(SegmentIdx, Point)> {
        let (segment, start, end) = {
            let vis = visible(&self.undo_counts);
            self.document_tree
                .find_segment_containing_position(&self.pool, &vis, position)?
        };
        if prefer_start && position == end {
            let next = self
                .document_tree
                .successor(&self.pool, segment)
                .ok_or(Error::SegmentNotFound)?;
            Ok((next, self.pool[next].offset))
        } else {
            let offset = self.pool[segment].offset.traverse(position.traversal(start));
            Ok((segment, offset))
        }
    }

    /// Converts a linear range to anchored form. An exclusive marker anchors
    /// its start rightward and its end leftward so text inserted at either
    /// edge stays outside it; an inclusive marker does the opposite.
    fn get_logical_range(&mut self, range: &Range, exclusive: bool) -> Result<LogicalRange> {
        let empty = range.start == range.end;
        let (start_segment, start_offset) = self.find_segment_for_position(range.start, exclusive)?;
        let (end_segment, end_offset) =
            self.find_segment_for_position(range.end, !exclusive || empty)?;
        Ok(LogicalRange {
            start_dependency_id: self.pool[start_segment].splice_id,
            offset_in_start_dependency: start_offset,
            end_dependency_id: self.pool[end_segment].splice_id,
            offset_in_end_dependency: end_offset,
        })
    }

    /// Resolves one anchor back to a linear position. Anchors inside
    /// invisible segments collapse to the segment's position.
    fn resolve_logical_position(
        &mut self,
        splice_id: SpliceId,
        offset: Point,
        prefer_start: bool,
    ) -> Result<Point> {
        let split_tree = self
            .split_trees
            .get_mut(&splice_id)
            .ok_or(Error::SegmentNotFound)?;
        let mut segment = split_tree.find_segment_containing_offset(&mut self.pool, offset)?;
        if prefer_start && offset == self.pool[segment].end_offset() {
            if let Some(next) = self.pool[segment].next_split {
                segment = next;
            }
        }
        let start = {
            let vis = visible(&self.undo_counts);
            self.document_tree.position_of(&mut self.pool, &vis, segment)
        };
        let seg = &self.pool[segment];
        if segment_visible(seg, &self.undo_counts, None, None) {
            Ok(start.traverse(offset.traversal(seg.offset)))
        } else {
            Ok(start)
        }
    }

    fn resolve_logical_range(&mut self, range: &LogicalRange, exclusive: bool) -> Result<Range> {
        let empty = range.is_empty();
        let start = self.resolve_logical_position(
            range.start_dependency_id,
            range.offset_in_start_dependency,
            exclusive,
        )?;
        let end = self.resolve_logical_position(
            range.end_dependency_id,
            range.offset_in_end_dependency,
            !exclusive || empty,
        )?;
        Ok(Range { start, end })
    }

    fn snapshot_from_markers(&mut self, markers: &LocalMarkers) -> Result<MarkerSnapshot> {
        let mut snapshot = MarkerSnapshot::new();
        for (layer_id, layer) in markers {
            let mut layer_out = HashMap::new();
            for (marker_id, marker) in layer {
                let logical = self.get_logical_range(&marker.range, marker.exclusive)?;
                layer_out.insert(*marker_id, marker.with_range(logical));
            }
            snapshot.insert(*layer_id, layer_out);
        }
        Ok(snapshot)
    }

    fn markers_from_snapshot(&mut self, snapshot: &MarkerSnapshot) -> Result<LocalMarkers> {
        let mut markers = LocalMarkers::new();
        for (layer_id, layer) in snapshot {
            let mut layer_out = HashMap::new();
            for (marker_id, marker) in layer {
                let range = self.resolve_logical_range(&marker.range, marker.exclusive)?;
                layer_out.insert(*marker_id, marker.with_range(range));
            }
            markers.insert(*layer_id, layer_out);
        }
        Ok(markers)
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    /// Every splice and undo ever applied here, plus one marker operation
    /// per site carrying its live (and still-deferred) marker state.
    /// Integrating the result into a fresh replica reproduces this one.
    pub fn get_operations(&self) -> Vec<Operation> {
        let mut ops = self.operations.clone();
        let mut sites: BTreeSet<SiteId> = self.marker_layers.keys().copied().collect();
        sites.extend(self.deferred_marker_updates.keys().copied());
        for site_id in sites {
            let mut updates: HashMap<
                LayerId,
                Option<HashMap<MarkerId, Option<Marker<LogicalRange>>>>,
            > = HashMap::new();
            if let Some(layers) = self.marker_layers.get(&site_id) {
                for (layer_id, layer) in layers {
                    let map = updates.entry(*layer_id).or_insert_with(|| Some(HashMap::new()));
                    let map = map.get_or_insert_with(HashMap::new);
                    for (marker_id, marker) in layer {
                        map.insert(*marker_id, Some(marker.clone()));
                    }
                }
            }
            if let Some(layers) = self.deferred_marker_updates.get(&site_id) {
                for (layer_id, layer) in layers {
                    let map = updates.entry(*layer_id).or_insert_with(|| Some(HashMap::new()));
                    let map = map.get_or_insert_with(HashMap::new);
                    for (marker_id, marker) in layer {
                        map.insert(*marker_id, Some(marker.clone()));
                    }
                }
            }
            if !updates.is_empty() {
                ops.push(Operation::MarkersUpdate(MarkersUpdateOperation { site_id, updates }));
            }
        }
        ops
    }

    /// A new replica for `site_id` seeded with everything this one has seen.
    pub fn replicate(&self, site_id: SiteId) -> Result<Document> {
        let mut replica = Document::new(site_id)?;
        replica.integrate_operations(self.get_operations())?;
        Ok(replica)
    }

    // ------------------------------------------------------------------
    // History snapshot / restore
    // ------------------------------------------------------------------

    /// Materializes the undo and redo stacks as linear change lists by
    /// actually redoing and undoing against the live tree, rolling every
    /// mutation back before returning, on the error path too. The redo
    /// stack is reconstructed first, newest-first; the undo stack fills the
    /// entries left under the cap. The counter flips performed here never enter
    /// the operation log: peers must only see counts the restored local
    /// counters can catch up with.
    pub fn get_history(&mut self, max_entries: usize) -> Result<History> {
        let saved_undo_counts = self.undo_counts.clone();
        let mut flips: Vec<SmallVec<[Operation; 1]>> = Vec::new();
        let mut first_error: Option<Error> = None;

        // Redo walk, then revert its flips before touching the undo stack:
        // undo-stack transactions must be undone from the document's real
        // state or ones superseded by a redone transaction lose their
        // changes.
        let mut redo_entries = match self.walk_stack_for_history(true, max_entries, &mut flips) {
            Ok(entries) => entries,
            Err(e) => {
                first_error = Some(e);
                Vec::new()
            }
        };
        if let Err(e) = self.revert_flips(&mut flips) {
            first_error.get_or_insert(e);
        }

        let mut undo_entries = Vec::new();
        if first_error.is_none() {
            let remaining = max_entries.saturating_sub(redo_entries.len());
            match self.walk_stack_for_history(false, remaining, &mut flips) {
                Ok(entries) => undo_entries = entries,
                Err(e) => {
                    first_error = Some(e);
                }
            }
            if let Err(e) = self.revert_flips(&mut flips) {
                first_error.get_or_insert(e);
            }
        }

        self.undo_counts = saved_undo_counts;
        if let Some(e) = first_error {
            return Err(e);
        }

        undo_entries.reverse();
        redo_entries.reverse();
        Ok(History {
            base_text: None,
            next_checkpoint_id: self.next_checkpoint_id,
            undo_stack: undo_entries,
            redo_stack: redo_entries,
        })
    }

    /// Walks one stack newest-first, flipping each transaction to capture
    /// its changes. On the redo side the flip *redoes* the transaction and
    /// the changes are stored as-is; on the undo side the flip undoes it and
    /// the changes are stored inverted so consumers replay them forward.
    /// Marker snapshots resolve against whichever state matches them, which
    /// is why each one is resolved on its own side of the flip.
    fn walk_stack_for_history(
        &mut self,
        redo_side: bool,
        max_entries: usize,
        flips: &mut Vec<SmallVec<[Operation; 1]>>,
    ) -> Result<Vec<HistoryEntry>> {
        let records: Vec<UndoRecord> = if redo_side {
            self.redo_stack.clone()
        } else {
            self.undo_stack.clone()
        };

        let mut entries = Vec::new();
        for record in records.iter().rev() {
            if entries.len() >= max_entries {
                break;
            }
            match record {
                UndoRecord::Transaction(t) => {
                    let snapshot = if redo_side { &t.markers_before } else { &t.markers_after };
                    let near_side = match snapshot {
                        Some(s) => Some(self.markers_from_snapshot(s)?),
                        None => None,
                    };
                    let (_, changes) = self.undo_or_redo_operations(&t.operations)?;
                    flips.push(t.operations.clone());
                    let snapshot = if redo_side { &t.markers_after } else { &t.markers_before };
                    let far_side = match snapshot {
                        Some(s) => Some(self.markers_from_snapshot(s)?),
                        None => None,
                    };
                    let (changes, markers_before, markers_after) = if redo_side {
                        (changes, near_side, far_side)
                    } else {
                        (invert_text_updates(changes), far_side, near_side)
                    };
                    entries.push(HistoryEntry::Transaction(HistoryTransaction {
                        changes,
                        markers_before,
                        markers_after,
                    }));
                }
                UndoRecord::Checkpoint(c) => {
                    let markers = match &c.markers {
                        Some(s) => Some(self.markers_from_snapshot(s)?),
                        None => None,
                    };
                    entries.push(HistoryEntry::Checkpoint { id: c.id, markers });
                }
            }
        }
        Ok(entries)
    }

    /// Flips back everything in `flips`, newest first, and drains the list.
    fn revert_flips(&mut self, flips: &mut Vec<SmallVec<[Operation; 1]>>) -> Result<()> {
        let mut result = Ok(());
        for ops in flips.iter().rev() {
            if let Err(e) = self.undo_or_redo_operations(ops) {
                result = Err(e);
                break;
            }
        }
        flips.clear();
        result
    }

    /// Replays a history snapshot into this (fresh) replica: base text, then
    /// every transaction and checkpoint in chronological order, then enough
    /// undos to push the redo-stack transactions back where they belong.
    fn populate_history(&mut self, history: &History) -> Result<()> {
        if let Some(base_text) = &history.base_text {
            self.set_text_in_range(Point::zero(), Point::zero(), base_text)?;
            self.undo_stack.clear();
        }
        self.next_checkpoint_id = history.next_checkpoint_id;

        let redo_transactions = history
            .redo_stack
            .iter()
            .filter(|e| matches!(e, HistoryEntry::Transaction(_)))
            .count();

        for entry in history.undo_stack.iter().chain(history.redo_stack.iter().rev()) {
            match entry {
                HistoryEntry::Transaction(t) => {
                    let markers_before = match &t.markers_before {
                        Some(m) => Some(self.snapshot_from_markers(m)?),
                        None => None,
                    };
                    // Back-to-front so each change's old coordinates stay
                    // valid while the earlier ones are still unapplied.
                    let mut operations: SmallVec<[Operation; 1]> = SmallVec::new();
                    for change in t.changes.iter().rev() {
                        operations.push(self.set_text_in_range(
                            change.old_start,
                            change.old_end,
                            &change.new_text,
                        )?);
                    }
                    let markers_after = match &t.markers_after {
                        Some(m) => Some(self.snapshot_from_markers(m)?),
                        None => None,
                    };
                    // Collapse the per-change records the replay pushed.
                    let new_len = self.undo_stack.len() - t.changes.len();
                    self.undo_stack.truncate(new_len);
                    let timestamp = self.now();
                    self.undo_stack.push(UndoRecord::Transaction(Transaction {
                        timestamp,
                        grouping_interval: None,
                        operations,
                        markers_before,
                        markers_after,
                    }));
                }
                HistoryEntry::Checkpoint { id, markers } => {
                    let markers = match markers {
                        Some(m) => Some(self.snapshot_from_markers(m)?),
                        None => None,
                    };
                    self.undo_stack.push(UndoRecord::Checkpoint(Checkpoint {
                        id: *id,
                        is_barrier: false,
                        markers,
                    }));
                }
            }
        }

        for _ in 0..redo_transactions {
            self.undo()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::point::byte_index_for_point;

    fn p(row: u32, column: u32) -> Point {
        Point::new(row, column)
    }

    /// Replays a batch of text updates onto a plain buffer, back-to-front,
    /// checking the old text along the way. Keeping this oracle in sync with
    /// `get_text` is the linear-equivalence guarantee host editors rely on.
    fn apply_updates(buffer: &mut String, updates: &[TextUpdate]) {
        for update in updates.iter().rev() {
            let start = byte_index_for_point(buffer, update.old_start);
            let end = byte_index_for_point(buffer, update.old_end);
            assert_eq!(&buffer[start..end], update.old_text.as_str());
            buffer.replace_range(start..end, &update.new_text);
        }
    }

    fn marker(exclusive: bool, start: Point, end: Point) -> Marker<Range> {
        Marker { exclusive, reversed: false, tailed: true, range: Range::new(start, end) }
    }

    fn single_marker_update(
        layer_id: LayerId,
        marker_id: MarkerId,
        marker: Marker<Range>,
    ) -> LocalMarkerUpdates {
        let mut markers = HashMap::new();
        markers.insert(marker_id, Some(marker));
        let mut layers = HashMap::new();
        layers.insert(layer_id, Some(markers));
        layers
    }

    #[derive(Debug, Clone)]
    struct ManualClock(Rc<Cell<Timestamp>>);

    impl ManualClock {
        fn new() -> (ManualClock, Rc<Cell<Timestamp>>) {
            let cell = Rc::new(Cell::new(0));
            (ManualClock(cell.clone()), cell)
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Timestamp {
            self.0.get()
        }
    }

    #[test]
    fn site_id_zero_is_reserved() {
        assert_eq!(Document::new(0).unwrap_err(), Error::ReservedSiteId);
        assert!(Document::new(1).is_ok());
    }

    #[test]
    fn local_editing() {
        let mut doc = Document::new(1).unwrap();
        doc.set_text_in_range(p(0, 0), p(0, 0), "hello world").unwrap();
        assert_eq!(doc.get_text(), "hello world");
        doc.set_text_in_range(p(0, 5), p(0, 5), ",").unwrap();
        assert_eq!(doc.get_text(), "hello, world");
        doc.set_text_in_range(p(0, 7), p(0, 12), "there").unwrap();
        assert_eq!(doc.get_text(), "hello, there");
        doc.set_text_in_range(p(0, 12), p(0, 12), "\nsecond line").unwrap();
        assert_eq!(doc.get_text(), "hello, there\nsecond line");
        assert_eq!(doc.extent(), p(1, 11));
        doc.set_text_in_range(p(0, 5), p(1, 0), " ").unwrap();
        assert_eq!(doc.get_text(), "hello second line");
    }

    #[test]
    fn rejects_positions_outside_the_document() {
        let mut doc = Document::with_text(1, "abc").unwrap();
        assert_eq!(
            doc.set_text_in_range(p(0, 4), p(0, 4), "x").unwrap_err(),
            Error::PositionOutOfRange
        );
        assert_eq!(
            doc.set_text_in_range(p(1, 0), p(1, 0), "x").unwrap_err(),
            Error::PositionOutOfRange
        );
        assert_eq!(
            doc.set_text_in_range(p(0, 2), p(0, 1), "x").unwrap_err(),
            Error::PositionOutOfRange
        );
        assert_eq!(doc.get_text(), "abc");
    }

    #[test]
    fn concurrent_inserts_at_the_document_start() {
        let mut a = Document::new(1).unwrap();
        let mut b = Document::new(2).unwrap();
        let op_a = a.set_text_in_range(p(0, 0), p(0, 0), "a").unwrap();
        let op_b = b.set_text_in_range(p(0, 0), p(0, 0), "b").unwrap();

        let mut mirror_a = String::from("a");
        let update = a.integrate_operations(vec![op_b]).unwrap();
        apply_updates(&mut mirror_a, &update.text_updates);
        let mut mirror_b = String::from("b");
        let update = b.integrate_operations(vec![op_a]).unwrap();
        apply_updates(&mut mirror_b, &update.text_updates);

        assert_eq!(a.get_text(), "ab");
        assert_eq!(b.get_text(), "ab");
        assert_eq!(mirror_a, "ab");
        assert_eq!(mirror_b, "ab");
    }

    #[test]
    fn concurrent_inserts_inside_shared_text() {
        let mut a = Document::new(1).unwrap();
        let mut b = Document::new(2).unwrap();
        let base = a.set_text_in_range(p(0, 0), p(0, 0), "ABCDEFG").unwrap();
        b.integrate_operations(vec![base]).unwrap();

        let op_a = a.set_text_in_range(p(0, 6), p(0, 6), "+++").unwrap();
        let op_b = b.set_text_in_range(p(0, 2), p(0, 2), "***").unwrap();
        a.integrate_operations(vec![op_b]).unwrap();
        b.integrate_operations(vec![op_a]).unwrap();

        assert_eq!(a.get_text(), "AB***CDEF+++G");
        assert_eq!(b.get_text(), "AB***CDEF+++G");
    }

    #[test]
    fn overlapping_deletions_converge() {
        let mut a = Document::new(1).unwrap();
        let mut b = Document::new(2).unwrap();
        let base = a.set_text_in_range(p(0, 0), p(0, 0), "ABCDEFG").unwrap();
        b.integrate_operations(vec![base]).unwrap();

        let op_a = a.set_text_in_range(p(0, 2), p(0, 5), "").unwrap();
        let op_b = b.set_text_in_range(p(0, 4), p(0, 6), "").unwrap();
        let mut mirror_a = String::from("ABFG");
        let update = a.integrate_operations(vec![op_b]).unwrap();
        apply_updates(&mut mirror_a, &update.text_updates);
        b.integrate_operations(vec![op_a]).unwrap();

        assert_eq!(a.get_text(), "ABG");
        assert_eq!(b.get_text(), "ABG");
        assert_eq!(mirror_a, "ABG");
    }

    #[test]
    fn undo_of_an_enclosing_insertion_leaves_nested_text() {
        let mut a = Document::new(1).unwrap();
        let mut b = Document::new(2).unwrap();
        let base = a.set_text_in_range(p(0, 0), p(0, 0), "ABCDEFG").unwrap();
        b.integrate_operations(vec![base]).unwrap();
        let inner = a.set_text_in_range(p(0, 3), p(0, 3), "***").unwrap();
        b.integrate_operations(vec![inner]).unwrap();

        let undo_op =
            Operation::Undo(UndoOperation { splice_id: SpliceId::new(1, 1), undo_count: 1 });
        let mut mirror = String::from("ABC***DEFG");
        let update = a.integrate_operations(vec![undo_op.clone()]).unwrap();
        apply_updates(&mut mirror, &update.text_updates);
        b.integrate_operations(vec![undo_op]).unwrap();

        assert_eq!(a.get_text(), "***");
        assert_eq!(b.get_text(), "***");
        assert_eq!(mirror, "***");
    }

    #[test]
    fn out_of_order_operations_are_deferred() {
        let mut a = Document::new(1).unwrap();
        let op1 = a.set_text_in_range(p(0, 0), p(0, 0), "hello").unwrap();
        let op2 = a.set_text_in_range(p(0, 5), p(0, 5), " world").unwrap();

        let mut b = Document::new(2).unwrap();
        let update = b.integrate_operations(vec![op2]).unwrap();
        assert!(update.is_empty());
        assert_eq!(b.get_text(), "");

        let update = b.integrate_operations(vec![op1]).unwrap();
        assert_eq!(b.get_text(), "hello world");
        let mut mirror = String::new();
        apply_updates(&mut mirror, &update.text_updates);
        assert_eq!(mirror, "hello world");
    }

    #[test]
    fn redelivered_operations_are_no_ops() {
        let mut a = Document::new(1).unwrap();
        let op = a.set_text_in_range(p(0, 0), p(0, 0), "abc").unwrap();
        let mut b = Document::new(2).unwrap();
        b.integrate_operations(vec![op.clone()]).unwrap();
        let update = b.integrate_operations(vec![op]).unwrap();
        assert!(update.is_empty());
        assert_eq!(b.get_text(), "abc");

        let undo_ops = a.undo().unwrap().unwrap().operations;
        b.integrate_operations(undo_ops.clone()).unwrap();
        let update = b.integrate_operations(undo_ops).unwrap();
        assert!(update.is_empty());
        assert_eq!(b.get_text(), "");
    }

    #[test]
    fn undo_redo_round_trips() {
        let mut doc = Document::new(1).unwrap();
        doc.set_text_in_range(p(0, 0), p(0, 0), "hello").unwrap();
        doc.set_text_in_range(p(0, 5), p(0, 5), " world").unwrap();

        assert!(doc.undo().unwrap().is_some());
        assert_eq!(doc.get_text(), "hello");
        assert!(doc.undo().unwrap().is_some());
        assert_eq!(doc.get_text(), "");
        assert!(doc.undo().unwrap().is_none());

        assert!(doc.redo().unwrap().is_some());
        assert_eq!(doc.get_text(), "hello");
        assert!(doc.redo().unwrap().is_some());
        assert_eq!(doc.get_text(), "hello world");
        assert!(doc.redo().unwrap().is_none());
    }

    #[test]
    fn barrier_checkpoint_blocks_undo() {
        let mut doc = Document::new(1).unwrap();
        doc.set_text_in_range(p(0, 0), p(0, 0), "a").unwrap();
        doc.set_text_in_range(p(0, 1), p(0, 1), "b").unwrap();
        doc.create_checkpoint(true, None).unwrap();
        doc.set_text_in_range(p(0, 2), p(0, 2), "c").unwrap();

        let result = doc.undo().unwrap().unwrap();
        assert!(!result.text_updates.is_empty());
        assert_eq!(doc.get_text(), "ab");
        assert!(doc.undo().unwrap().is_none());
        assert_eq!(doc.get_text(), "ab");
    }

    #[test]
    fn checkpoints_report_group_and_revert() {
        let mut doc = Document::new(1).unwrap();
        doc.set_text_in_range(p(0, 0), p(0, 0), "base").unwrap();
        let checkpoint = doc.create_checkpoint(false, None).unwrap();
        assert_eq!(
            doc.get_changes_since_checkpoint(checkpoint).unwrap().unwrap(),
            vec![]
        );

        doc.set_text_in_range(p(0, 4), p(0, 4), " one").unwrap();
        doc.set_text_in_range(p(0, 8), p(0, 8), " two").unwrap();

        let changes = doc.get_changes_since_checkpoint(checkpoint).unwrap().unwrap();
        let mut buffer = String::from("base");
        apply_updates(&mut buffer, &changes);
        assert_eq!(buffer, "base one two");

        let grouped = doc
            .group_changes_since_checkpoint(checkpoint, false, None)
            .unwrap()
            .unwrap();
        assert!(!grouped.is_empty());
        doc.undo().unwrap().unwrap();
        assert_eq!(doc.get_text(), "base");
        doc.redo().unwrap().unwrap();
        assert_eq!(doc.get_text(), "base one two");

        let result = doc.revert_to_checkpoint(checkpoint, false).unwrap().unwrap();
        assert!(!result.operations.is_empty());
        assert_eq!(doc.get_text(), "base");

        assert!(doc.get_changes_since_checkpoint(999).unwrap().is_none());
        assert!(doc.revert_to_checkpoint(999, false).unwrap().is_none());
    }

    #[test]
    fn barrier_blocks_grouping_and_revert() {
        let mut doc = Document::new(1).unwrap();
        doc.set_text_in_range(p(0, 0), p(0, 0), "a").unwrap();
        let checkpoint = doc.create_checkpoint(false, None).unwrap();
        doc.set_text_in_range(p(0, 1), p(0, 1), "b").unwrap();
        doc.create_checkpoint(true, None).unwrap();
        doc.set_text_in_range(p(0, 2), p(0, 2), "c").unwrap();

        assert!(doc
            .group_changes_since_checkpoint(checkpoint, false, None)
            .unwrap()
            .is_none());
        assert!(doc.revert_to_checkpoint(checkpoint, false).unwrap().is_none());
        assert!(doc.get_changes_since_checkpoint(checkpoint).unwrap().is_none());
        assert_eq!(doc.get_text(), "abc");
    }

    #[test]
    fn grouping_interval_merges_adjacent_transactions() {
        let (clock, time) = ManualClock::new();
        let mut doc = Document::new(1).unwrap();
        doc.set_clock(Box::new(clock));

        doc.set_text_in_range(p(0, 0), p(0, 0), "a").unwrap();
        doc.apply_grouping_interval(100);
        time.set(50);
        doc.set_text_in_range(p(0, 1), p(0, 1), "b").unwrap();
        doc.apply_grouping_interval(100);
        time.set(300);
        doc.set_text_in_range(p(0, 2), p(0, 2), "c").unwrap();
        doc.apply_grouping_interval(100);

        doc.undo().unwrap().unwrap();
        assert_eq!(doc.get_text(), "ab");
        doc.undo().unwrap().unwrap();
        assert_eq!(doc.get_text(), "");
    }

    #[test]
    fn group_last_changes_merges_two_topmost_transactions() {
        let mut doc = Document::new(1).unwrap();
        assert!(!doc.group_last_changes());
        doc.set_text_in_range(p(0, 0), p(0, 0), "a").unwrap();
        assert!(!doc.group_last_changes());
        doc.set_text_in_range(p(0, 1), p(0, 1), "b").unwrap();
        assert!(doc.group_last_changes());
        doc.undo().unwrap().unwrap();
        assert_eq!(doc.get_text(), "");
    }

    #[test]
    fn markers_resolve_and_replicate() {
        let mut a = Document::new(1).unwrap();
        let base = a.set_text_in_range(p(0, 0), p(0, 0), "hello world").unwrap();
        let marker_op = a
            .update_markers(single_marker_update(1, 1, marker(false, p(0, 0), p(0, 5))))
            .unwrap();
        let markers = a.get_markers().unwrap();
        assert_eq!(markers[&1][&1][&1].range, Range::new(p(0, 0), p(0, 5)));

        let mut b = Document::new(2).unwrap();
        let update = b.integrate_operations(vec![base, marker_op]).unwrap();
        let layer = update
            .marker_updates
            .get(&1)
            .and_then(|layers| layers.get(&1))
            .cloned()
            .flatten()
            .unwrap();
        let resolved = layer.get(&1).copied().flatten().unwrap();
        assert_eq!(resolved.range, Range::new(p(0, 0), p(0, 5)));
        assert_eq!(b.get_markers().unwrap(), a.get_markers().unwrap());

        let mut removal: LocalMarkerUpdates = HashMap::new();
        let mut layer = HashMap::new();
        layer.insert(1, None);
        removal.insert(1, Some(layer));
        let removal_op = a.update_markers(removal).unwrap();
        b.integrate_operations(vec![removal_op]).unwrap();
        assert_eq!(b.get_markers().unwrap(), a.get_markers().unwrap());
    }

    #[test]
    fn marker_updates_defer_until_anchors_arrive() {
        let mut a = Document::new(1).unwrap();
        let op1 = a.set_text_in_range(p(0, 0), p(0, 0), "ABCDEFG").unwrap();
        let op2 = a.set_text_in_range(p(0, 3), p(0, 3), "xyz").unwrap();
        let marker_op = a
            .update_markers(single_marker_update(1, 1, marker(false, p(0, 4), p(0, 5))))
            .unwrap();

        let mut b = Document::new(2).unwrap();
        b.integrate_operations(vec![op1]).unwrap();
        let update = b.integrate_operations(vec![marker_op]).unwrap();
        assert!(update.marker_updates.is_empty());
        let markers = b.get_markers().unwrap();
        assert!(markers
            .get(&1)
            .map_or(true, |layers| layers.values().all(|layer| layer.is_empty())));

        let update = b.integrate_operations(vec![op2]).unwrap();
        let layer = update
            .marker_updates
            .get(&1)
            .and_then(|layers| layers.get(&1))
            .cloned()
            .flatten()
            .unwrap();
        let resolved = layer.get(&1).copied().flatten().unwrap();
        assert_eq!(resolved.range, Range::new(p(0, 4), p(0, 5)));
        assert_eq!(
            b.get_markers().unwrap()[&1][&1][&1].range,
            Range::new(p(0, 4), p(0, 5))
        );
    }

    #[test]
    fn marker_exclusivity_controls_edge_insertions() {
        let mut a = Document::new(1).unwrap();
        let base = a.set_text_in_range(p(0, 0), p(0, 0), "ABCD").unwrap();
        a.update_markers(single_marker_update(1, 1, marker(false, p(0, 1), p(0, 3))))
            .unwrap();
        a.update_markers(single_marker_update(2, 1, marker(true, p(0, 1), p(0, 3))))
            .unwrap();

        let mut b = Document::new(2).unwrap();
        b.integrate_operations(vec![base]).unwrap();
        let edit = b.set_text_in_range(p(0, 1), p(0, 1), "xx").unwrap();
        a.integrate_operations(vec![edit]).unwrap();

        let markers = a.get_markers().unwrap();
        // Inclusive: text inserted at the start edge grows the marker.
        assert_eq!(markers[&1][&1][&1].range, Range::new(p(0, 1), p(0, 5)));
        // Exclusive: it stays outside.
        assert_eq!(markers[&1][&2][&1].range, Range::new(p(0, 3), p(0, 5)));
    }

    #[test]
    fn history_round_trips_through_a_fresh_replica() {
        let mut a = Document::new(1).unwrap();
        a.set_text_in_range(p(0, 0), p(0, 0), "hello").unwrap();
        a.create_checkpoint(false, None).unwrap();
        a.set_text_in_range(p(0, 5), p(0, 5), " world").unwrap();
        a.set_text_in_range(p(0, 0), p(0, 5), "goodbye").unwrap();
        a.undo().unwrap().unwrap();
        assert_eq!(a.get_text(), "hello world");

        let history = a.get_history(usize::MAX).unwrap();
        assert_eq!(a.get_text(), "hello world");

        let mut b = Document::with_history(1, &history).unwrap();
        assert_eq!(b.get_text(), "hello world");

        loop {
            let ra = a.redo().unwrap();
            let rb = b.redo().unwrap();
            assert_eq!(ra.is_some(), rb.is_some());
            assert_eq!(a.get_text(), b.get_text());
            if ra.is_none() {
                break;
            }
        }
        loop {
            let ra = a.undo().unwrap();
            let rb = b.undo().unwrap();
            assert_eq!(ra.is_some(), rb.is_some());
            assert_eq!(a.get_text(), b.get_text());
            if ra.is_none() {
                break;
            }
        }
        assert_eq!(a.get_text(), "");
    }

    #[test]
    fn history_respects_the_entry_cap() {
        let mut a = Document::new(1).unwrap();
        a.set_text_in_range(p(0, 0), p(0, 0), "a").unwrap();
        a.set_text_in_range(p(0, 1), p(0, 1), "b").unwrap();
        a.set_text_in_range(p(0, 2), p(0, 2), "c").unwrap();

        let mut history = a.get_history(2).unwrap();
        assert_eq!(history.undo_stack.len(), 2);
        // A capped history needs the elided prefix as base text.
        history.base_text = Some("a".into());

        let mut b = Document::with_history(1, &history).unwrap();
        assert_eq!(b.get_text(), "abc");
        b.undo().unwrap().unwrap();
        assert_eq!(b.get_text(), "ab");
        b.undo().unwrap().unwrap();
        assert_eq!(b.get_text(), "a");
        assert!(b.undo().unwrap().is_none());
    }

    #[test]
    fn replicate_reproduces_text_and_markers() {
        let mut a = Document::new(1).unwrap();
        a.set_text_in_range(p(0, 0), p(0, 0), "one\ntwo\nthree").unwrap();
        a.set_text_in_range(p(1, 0), p(1, 3), "TWO").unwrap();
        a.set_text_in_range(p(2, 0), p(2, 5), "").unwrap();
        a.undo().unwrap().unwrap();
        a.update_markers(single_marker_update(1, 1, marker(false, p(1, 0), p(1, 3))))
            .unwrap();
        assert_eq!(a.get_text(), "one\nTWO\nthree");

        let mut b = a.replicate(2).unwrap();
        assert_eq!(b.get_text(), a.get_text());
        assert_eq!(b.get_markers().unwrap(), a.get_markers().unwrap());
    }

    #[test]
    fn integration_order_does_not_matter() {
        let mut a = Document::new(1).unwrap();
        let mut b = Document::new(2).unwrap();
        let base = a.set_text_in_range(p(0, 0), p(0, 0), "ABCDEFG").unwrap();
        b.integrate_operations(vec![base.clone()]).unwrap();
        let a1 = a.set_text_in_range(p(0, 6), p(0, 6), "+++").unwrap();
        let a2 = a.set_text_in_range(p(0, 2), p(0, 4), "").unwrap();
        let b1 = b.set_text_in_range(p(0, 2), p(0, 2), "***").unwrap();

        a.integrate_operations(vec![b1.clone()]).unwrap();
        b.integrate_operations(vec![a1.clone(), a2.clone()]).unwrap();

        let mut c = Document::new(3).unwrap();
        c.integrate_operations(vec![base.clone(), a1.clone(), a2.clone(), b1.clone()])
            .unwrap();
        let mut d = Document::new(4).unwrap();
        d.integrate_operations(vec![b1, a2, a1, base]).unwrap();

        assert_eq!(a.get_text(), b.get_text());
        assert_eq!(b.get_text(), c.get_text());
        assert_eq!(c.get_text(), d.get_text());
        assert_eq!(a.get_text(), "AB***EF+++G");
    }
}
