// Copyright 2023 The Arbor Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Changeset algebra for ordered-sequence fields.
//!
//! A sequence changeset is a mark list over a virtual list of cells. Each
//! mark covers `count` adjacent cells; marks with a `cell_id` target cells
//! that are empty (detached) in the input context and therefore have zero
//! width in the live sequence. The summed live width of a mark list equals
//! the cell count of the field in the input context (trailing skips are
//! implicit).

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::cross_field::CrossFieldManager;
use crate::delta::{DeltaContext, DeltaMark, FieldDelta};
use crate::field_kind::{
    is_own_atom, ChangeError, ChangeResult, FieldChangeset, FieldKind, FieldKindId,
    FieldKindRegistry, RevisionInfo,
};
use crate::modular::{self, NodeChangeset};
use crate::revision::{ChangeAtomId, RevisionTag};
use crate::tree::TreeNode;

#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub enum MarkEffect {
    /// Leaves cell occupancy unchanged.
    Skip,
    /// Fills new cells with `content`, addressable under `id`.
    Insert {
        id: ChangeAtomId,
        content: Vec<TreeNode>,
    },
    /// Empties cells, tracking the content under `id`.
    Remove { id: ChangeAtomId },
    /// Empties cells, sending the content to the matching [`MarkEffect::MoveIn`].
    MoveOut { id: ChangeAtomId },
    /// Fills cells with the content of the matching [`MarkEffect::MoveOut`].
    MoveIn { id: ChangeAtomId },
    /// Restores the content detached under `id`.
    Revive { id: ChangeAtomId },
}

/// One mark of a sequence changeset.
///
/// `cell_id` is present when the mark targets detached cells (a muted mark);
/// such marks have zero width in the live sequence of both contexts, except
/// that a muted mark never changes occupancy. `changes` requires `count == 1`.
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct Mark {
    pub count: u64,
    pub cell_id: Option<ChangeAtomId>,
    pub revision: Option<RevisionTag>,
    pub effect: MarkEffect,
    pub changes: Option<NodeChangeset>,
}

impl Mark {
    pub fn skip(count: u64) -> Self {
        Mark {
            count,
            cell_id: None,
            revision: None,
            effect: MarkEffect::Skip,
            changes: None,
        }
    }

    pub fn insert(id: ChangeAtomId, content: Vec<TreeNode>) -> Self {
        Mark {
            count: content.len() as u64,
            cell_id: None,
            revision: None,
            effect: MarkEffect::Insert { id, content },
            changes: None,
        }
    }

    pub fn remove(id: ChangeAtomId, count: u64) -> Self {
        Mark {
            count,
            cell_id: None,
            revision: None,
            effect: MarkEffect::Remove { id },
            changes: None,
        }
    }

    pub fn move_out(id: ChangeAtomId, count: u64) -> Self {
        Mark {
            count,
            cell_id: None,
            revision: None,
            effect: MarkEffect::MoveOut { id },
            changes: None,
        }
    }

    pub fn move_in(id: ChangeAtomId, count: u64) -> Self {
        Mark {
            count,
            cell_id: None,
            revision: None,
            effect: MarkEffect::MoveIn { id },
            changes: None,
        }
    }

    pub fn revive(id: ChangeAtomId, count: u64) -> Self {
        Mark {
            count,
            cell_id: None,
            revision: None,
            effect: MarkEffect::Revive { id },
            changes: None,
        }
    }

    pub fn modify(changes: NodeChangeset) -> Self {
        Mark {
            count: 1,
            cell_id: None,
            revision: None,
            effect: MarkEffect::Skip,
            changes: Some(changes),
        }
    }

    fn muted(mut self, cell_id: ChangeAtomId) -> Self {
        self.cell_id = Some(cell_id);
        self
    }

    /// Cells this mark consumes from the live sequence of the input context.
    pub fn input_len(&self) -> u64 {
        if self.cell_id.is_some() {
            return 0;
        }
        match self.effect {
            MarkEffect::Skip | MarkEffect::Remove { .. } | MarkEffect::MoveOut { .. } => self.count,
            MarkEffect::Insert { .. } | MarkEffect::MoveIn { .. } | MarkEffect::Revive { .. } => 0,
        }
    }

    /// Cells this mark contributes to the live sequence of the output
    /// context.
    pub fn output_len(&self) -> u64 {
        if self.cell_id.is_some() {
            return 0;
        }
        match self.effect {
            MarkEffect::Skip
            | MarkEffect::Insert { .. }
            | MarkEffect::MoveIn { .. }
            | MarkEffect::Revive { .. } => self.count,
            MarkEffect::Remove { .. } | MarkEffect::MoveOut { .. } => 0,
        }
    }

    fn is_attach(&self) -> bool {
        self.cell_id.is_none() && self.input_len() == 0 && self.output_len() > 0
    }

    fn is_plain_skip(&self) -> bool {
        self.cell_id.is_none()
            && matches!(self.effect, MarkEffect::Skip)
            && self.changes.is_none()
    }

    /// Splits the mark so the first part covers `at` cells.
    fn split(self, at: u64) -> (Mark, Mark) {
        assert!(at > 0 && at < self.count, "split point must be interior");
        let tail_count = self.count - at;
        let (head_effect, tail_effect) = match self.effect {
            MarkEffect::Skip => (MarkEffect::Skip, MarkEffect::Skip),
            MarkEffect::Insert { id, mut content } => {
                let tail_content = content.split_off(at as usize);
                (
                    MarkEffect::Insert {
                        id: id.clone(),
                        content,
                    },
                    MarkEffect::Insert {
                        id: id.offset(at as u32),
                        content: tail_content,
                    },
                )
            }
            MarkEffect::Remove { id } => (
                MarkEffect::Remove { id: id.clone() },
                MarkEffect::Remove {
                    id: id.offset(at as u32),
                },
            ),
            MarkEffect::MoveOut { id } => (
                MarkEffect::MoveOut { id: id.clone() },
                MarkEffect::MoveOut {
                    id: id.offset(at as u32),
                },
            ),
            MarkEffect::MoveIn { id } => (
                MarkEffect::MoveIn { id: id.clone() },
                MarkEffect::MoveIn {
                    id: id.offset(at as u32),
                },
            ),
            MarkEffect::Revive { id } => (
                MarkEffect::Revive { id: id.clone() },
                MarkEffect::Revive {
                    id: id.offset(at as u32),
                },
            ),
        };
        let head = Mark {
            count: at,
            cell_id: self.cell_id.clone(),
            revision: self.revision.clone(),
            effect: head_effect,
            changes: None,
        };
        let tail = Mark {
            count: tail_count,
            cell_id: self.cell_id.map(|id| id.offset(at as u32)),
            revision: self.revision,
            effect: tail_effect,
            changes: self.changes,
        };
        (head, tail)
    }
}

/// An ordered mark list over one sequence field.
#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct SequenceChangeset {
    pub marks: Vec<Mark>,
}

impl SequenceChangeset {
    pub fn noop() -> Self {
        SequenceChangeset::default()
    }

    pub fn new(marks: Vec<Mark>) -> Self {
        SequenceChangeset { marks }.normalized()
    }

    pub fn insert_at(index: u64, id: ChangeAtomId, content: Vec<TreeNode>) -> Self {
        SequenceChangeset::new(vec![Mark::skip(index), Mark::insert(id, content)])
    }

    pub fn remove_at(index: u64, count: u64, id: ChangeAtomId) -> Self {
        SequenceChangeset::new(vec![Mark::skip(index), Mark::remove(id, count)])
    }

    pub fn modify_at(index: u64, changes: NodeChangeset) -> Self {
        SequenceChangeset::new(vec![Mark::skip(index), Mark::modify(changes)])
    }

    pub fn revive_at(index: u64, id: ChangeAtomId, count: u64) -> Self {
        SequenceChangeset::new(vec![Mark::skip(index), Mark::revive(id, count)])
    }

    /// Moves `count` cells from `src_index` to `dst_index` (both in the
    /// input context; `dst_index` must not fall inside the moved range).
    pub fn move_within(src_index: u64, count: u64, dst_index: u64, id: ChangeAtomId) -> Self {
        if dst_index <= src_index {
            SequenceChangeset::new(vec![
                Mark::skip(dst_index),
                Mark::move_in(id.clone(), count),
                Mark::skip(src_index - dst_index),
                Mark::move_out(id, count),
            ])
        } else {
            SequenceChangeset::new(vec![
                Mark::skip(src_index),
                Mark::move_out(id.clone(), count),
                Mark::skip(dst_index - src_index - count),
                Mark::move_in(id, count),
            ])
        }
    }

    pub fn input_len(&self) -> u64 {
        self.marks.iter().map(Mark::input_len).sum()
    }

    pub fn output_len(&self) -> u64 {
        self.marks.iter().map(Mark::output_len).sum()
    }

    /// Checks well-formedness against the field's live cell count.
    pub fn validate(&self, field_len: u64) -> ChangeResult<()> {
        if self.input_len() > field_len {
            return Err(ChangeError::InvalidChangeset(format!(
                "mark list covers {} cells but the field has {field_len}",
                self.input_len()
            )));
        }
        for mark in &self.marks {
            if mark.changes.is_some() && mark.count != 1 {
                return Err(ChangeError::InvalidChangeset(
                    "nested changes require a single-cell mark".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Merges adjacent compatible marks, drops zero-width noise and trailing
    /// skips, so structurally equal changesets compare equal.
    pub fn normalized(mut self) -> Self {
        let mut marks: Vec<Mark> = vec![];
        for mark in self.marks.drain(..) {
            if mark.count == 0 {
                continue;
            }
            if let Some(last) = marks.last_mut() {
                if mergeable(last, &mark) {
                    merge_into(last, mark);
                    continue;
                }
            }
            marks.push(mark);
        }
        while marks.last().is_some_and(Mark::is_plain_skip) {
            marks.pop();
        }
        SequenceChangeset { marks }
    }
}

/// Whether `next` is the direct continuation of `last` (same effect, atom
/// ids running on) so the two can collapse into one mark.
fn mergeable(last: &Mark, next: &Mark) -> bool {
    if last.cell_id.is_some() || next.cell_id.is_some() {
        return false;
    }
    if last.changes.is_some() || next.changes.is_some() {
        return false;
    }
    if last.revision != next.revision {
        return false;
    }
    let offset = last.count as u32;
    match (&last.effect, &next.effect) {
        (MarkEffect::Skip, MarkEffect::Skip) => true,
        (MarkEffect::Insert { id: a, .. }, MarkEffect::Insert { id: b, .. })
        | (MarkEffect::Remove { id: a }, MarkEffect::Remove { id: b })
        | (MarkEffect::MoveOut { id: a }, MarkEffect::MoveOut { id: b })
        | (MarkEffect::MoveIn { id: a }, MarkEffect::MoveIn { id: b })
        | (MarkEffect::Revive { id: a }, MarkEffect::Revive { id: b }) => *b == a.offset(offset),
        _ => false,
    }
}

fn merge_into(last: &mut Mark, next: Mark) {
    if let (
        MarkEffect::Insert { content, .. },
        MarkEffect::Insert {
            content: next_content,
            ..
        },
    ) = (&mut last.effect, next.effect)
    {
        content.extend(next_content);
    }
    last.count += next.count;
}

/// Queue of marks consumed front-to-back, splitting as needed.
struct MarkQueue {
    marks: VecDeque<Mark>,
}

impl MarkQueue {
    fn new(marks: &[Mark]) -> Self {
        MarkQueue {
            marks: marks.iter().cloned().collect(),
        }
    }

    fn peek(&self) -> Option<&Mark> {
        self.marks.front()
    }

    fn pop(&mut self) -> Option<Mark> {
        self.marks.pop_front()
    }

    /// Pops a mark consuming at most `max` input cells, splitting if needed.
    fn pop_input(&mut self, max: u64) -> Option<Mark> {
        let mark = self.marks.pop_front()?;
        if mark.input_len() <= max || mark.count <= max {
            return Some(mark);
        }
        let (head, tail) = mark.split(max);
        self.marks.push_front(tail);
        Some(head)
    }
}

fn stamp(mut mark: Mark, rev: &RevisionInfo) -> Mark {
    if mark.revision.is_none() {
        mark.revision.clone_from(&rev.tag);
    }
    mark
}

fn compose(
    registry: &FieldKindRegistry,
    a: &SequenceChangeset,
    a_rev: &RevisionInfo,
    b: &SequenceChangeset,
    b_rev: &RevisionInfo,
    manager: &mut CrossFieldManager,
) -> ChangeResult<SequenceChangeset> {
    let mut out: Vec<Mark> = vec![];
    let mut qa = MarkQueue::new(&a.marks);
    let mut qb = MarkQueue::new(&b.marks);
    // Content that a inserted and b moved away: delivered at b's move-in.
    let mut moved_inserts: HashMap<ChangeAtomId, Mark> = HashMap::new();
    // Moves of a whose destination b moved again: a's move-out is renamed to
    // pair with b's move-in.
    let mut chained_moves: HashMap<ChangeAtomId, ChangeAtomId> = HashMap::new();

    loop {
        // Marks of a with no output are invisible to b.
        if qa.peek().is_some_and(|mark| mark.output_len() == 0) {
            let mark = qa.pop().unwrap();
            out.push(stamp(mark, a_rev));
            continue;
        }
        // Marks of b with no input act on cells a did not produce.
        if qb.peek().is_some_and(|mark| mark.input_len() == 0) {
            let mark = qb.pop().unwrap();
            out.push(stamp(mark, b_rev));
            continue;
        }
        let (Some(_), Some(_)) = (qa.peek(), qb.peek()) else {
            break;
        };
        // Both sides cover live cells of the shared context.
        let n = qa
            .peek()
            .unwrap()
            .output_len()
            .min(qb.peek().unwrap().input_len());
        let ma = {
            let mark = qa.pop().unwrap();
            if mark.output_len() > n {
                let (head, tail) = mark.split(n);
                qa.marks.push_front(tail);
                head
            } else {
                mark
            }
        };
        let mb = qb.pop_input(n).unwrap();
        let reduced = reduce_pair(
            registry,
            ma,
            a_rev,
            mb,
            b_rev,
            manager,
            &mut moved_inserts,
            &mut chained_moves,
        )?;
        out.extend(reduced);
    }
    while let Some(mark) = qa.pop() {
        out.push(stamp(mark, a_rev));
    }
    while let Some(mark) = qb.pop() {
        out.push(stamp(mark, b_rev));
    }

    // Late reductions that need the whole list. First rewire moves whose
    // destination was moved again and land inserts at their final position,
    // then cancel detach/attach pairs that net out.
    for mark in &mut out {
        if mark.cell_id.is_some() {
            continue;
        }
        match mark.effect.clone() {
            MarkEffect::MoveOut { id } => {
                if let Some(new_id) = chained_moves.get(&id) {
                    mark.effect = MarkEffect::MoveOut { id: new_id.clone() };
                }
            }
            MarkEffect::MoveIn { id } => {
                if let Some(insert) = moved_inserts.remove(&id) {
                    // Content a inserted lands at b's move destination.
                    *mark = insert;
                }
            }
            _ => {}
        }
    }
    let mut remove_positions: HashMap<ChangeAtomId, usize> = HashMap::new();
    let mut move_out_positions: HashMap<ChangeAtomId, usize> = HashMap::new();
    for (i, mark) in out.iter().enumerate() {
        if mark.cell_id.is_some() {
            continue;
        }
        match &mark.effect {
            MarkEffect::Remove { id } => {
                remove_positions.insert(id.clone(), i);
            }
            MarkEffect::MoveOut { id } => {
                move_out_positions.insert(id.clone(), i);
            }
            _ => {}
        }
    }
    let mut dropped = vec![false; out.len()];
    for i in 0..out.len() {
        if out[i].cell_id.is_some() {
            continue;
        }
        match out[i].effect.clone() {
            MarkEffect::Revive { id } => {
                if let Some(&j) = remove_positions.get(&id) {
                    if out[j].count == out[i].count && !dropped[j] {
                        // Remove then revive of the same cells: the cells
                        // never leave the live sequence.
                        manager.compose_detach_attach(id.clone());
                        let changes = out[j].changes.take();
                        out[j] = Mark {
                            changes,
                            ..Mark::skip(out[j].count)
                        };
                        dropped[i] = true;
                    }
                }
            }
            MarkEffect::MoveIn { id } => {
                if let Some(&j) = move_out_positions.get(&id) {
                    if out[j].count == out[i].count && !dropped[j] {
                        // Move-out then matching move-in: the cells stay.
                        let changes = out[j].changes.take();
                        out[j] = Mark {
                            changes,
                            ..Mark::skip(out[j].count)
                        };
                        dropped[i] = true;
                    }
                }
            }
            _ => {}
        }
    }
    let mut marks: Vec<Mark> = out
        .into_iter()
        .zip(dropped)
        .filter(|(_, dropped)| !dropped)
        .map(|(mark, _)| mark)
        .collect();
    // Nested changes on a move-in whose move-out lives in another field are
    // addressed to the field owning the source cells; the second pass
    // delivers them there.
    let move_out_ranges: Vec<(ChangeAtomId, u64)> = marks
        .iter()
        .filter(|mark| mark.cell_id.is_none())
        .filter_map(|mark| match &mark.effect {
            MarkEffect::MoveOut { id } => Some((id.clone(), mark.count)),
            _ => None,
        })
        .collect();
    for mark in &mut marks {
        if mark.cell_id.is_some() || mark.changes.is_none() {
            continue;
        }
        if let MarkEffect::MoveIn { id } = &mark.effect {
            let local = move_out_ranges.iter().any(|(first, count)| {
                first.revision == id.revision
                    && id.local_id >= first.local_id
                    && u64::from(id.local_id - first.local_id) < *count
            });
            if !local {
                let changes = mark.changes.take().expect("checked above");
                manager.send_new_changes_to_base_source_location(id.clone(), changes);
            }
        }
    }
    Ok(SequenceChangeset { marks }.normalized())
}

#[allow(clippy::too_many_arguments)]
fn reduce_pair(
    registry: &FieldKindRegistry,
    ma: Mark,
    a_rev: &RevisionInfo,
    mb: Mark,
    b_rev: &RevisionInfo,
    manager: &mut CrossFieldManager,
    moved_inserts: &mut HashMap<ChangeAtomId, Mark>,
    chained_moves: &mut HashMap<ChangeAtomId, ChangeAtomId>,
) -> ChangeResult<Vec<Mark>> {
    let compose_changes = |a_changes: &Option<NodeChangeset>,
                           b_changes: &Option<NodeChangeset>,
                           manager: &mut CrossFieldManager|
     -> ChangeResult<Option<NodeChangeset>> {
        match (a_changes, b_changes) {
            (None, None) => Ok(None),
            (Some(changes), None) | (None, Some(changes)) => Ok(Some(changes.clone())),
            (Some(a_changes), Some(b_changes)) => Ok(Some(modular::compose_node(
                registry, a_changes, a_rev, b_changes, b_rev, manager,
            )?)),
        }
    };

    let result = match (ma.effect.clone(), mb.effect.clone()) {
        (MarkEffect::Skip, _) => {
            // b acts on pre-existing cells; a contributed at most a modify.
            let changes = compose_changes(&ma.changes, &mb.changes, manager)?;
            vec![Mark {
                changes,
                ..stamp(mb, b_rev)
            }]
        }
        (_, MarkEffect::Skip) => {
            let changes = compose_changes(&ma.changes, &mb.changes, manager)?;
            vec![Mark {
                changes,
                ..stamp(ma, a_rev)
            }]
        }
        (MarkEffect::Insert { id, content }, MarkEffect::Remove { id: remove_id }) => {
            // Inserted then removed: the content comes to rest detached
            // under the remove's id.
            manager.compose_attach_detach(id.clone(), remove_id.clone());
            let changes = compose_changes(&ma.changes, &mb.changes, manager)?;
            vec![Mark {
                changes,
                ..stamp(Mark::insert(id, content), a_rev).muted(remove_id)
            }]
        }
        (MarkEffect::Insert { .. }, MarkEffect::MoveOut { id: dst }) => {
            // Inserted then moved: deliver the insert at b's move-in.
            let changes = compose_changes(&ma.changes, &mb.changes, manager)?;
            moved_inserts.insert(
                dst,
                Mark {
                    changes,
                    ..stamp(ma, a_rev)
                },
            );
            vec![]
        }
        (MarkEffect::Revive { id: revived }, MarkEffect::Remove { id: remove_id }) => {
            if revived == remove_id {
                // Revived then re-removed under the same id: nothing happens.
                vec![]
            } else {
                // Revived then re-removed: a rename of detached cells. The
                // content keeps its original atom id through the cycle.
                manager.compose_attach_detach(revived.clone(), remove_id.clone());
                let changes = compose_changes(&ma.changes, &mb.changes, manager)?;
                vec![Mark {
                    changes,
                    ..stamp(Mark::remove(remove_id, ma.count), b_rev).muted(revived)
                }]
            }
        }
        (MarkEffect::Revive { id: revived }, MarkEffect::MoveOut { id: dst }) => {
            let changes = compose_changes(&ma.changes, &mb.changes, manager)?;
            vec![Mark {
                changes,
                ..stamp(Mark::move_out(dst, ma.count), b_rev).muted(revived)
            }]
        }
        (MarkEffect::MoveIn { id }, MarkEffect::Remove { id: remove_id }) => {
            // Arrived then removed: the content goes straight to rest.
            let changes = compose_changes(&ma.changes, &mb.changes, manager)?;
            vec![Mark {
                changes,
                ..stamp(Mark::move_in(id, ma.count), a_rev).muted(remove_id)
            }]
        }
        (MarkEffect::MoveIn { id }, MarkEffect::MoveOut { id: dst }) => {
            // Moved and moved again: rewire a's move-out to b's destination.
            chained_moves.insert(id, dst);
            vec![]
        }
        (MarkEffect::Remove { .. } | MarkEffect::MoveOut { .. }, _) => {
            unreachable!("marks without output never reach pair reduction")
        }
        (_, MarkEffect::Insert { .. } | MarkEffect::MoveIn { .. } | MarkEffect::Revive { .. }) => {
            unreachable!("marks without input never reach pair reduction")
        }
    };
    Ok(result)
}

fn invert(
    registry: &FieldKindRegistry,
    a: &SequenceChangeset,
    a_rev: &RevisionInfo,
    manager: &mut CrossFieldManager,
) -> ChangeResult<SequenceChangeset> {
    let mut marks = vec![];
    for mark in &a.marks {
        let changes = match &mark.changes {
            Some(changes) => Some(modular::invert_node(registry, changes, a_rev, manager)?),
            None => None,
        };
        let inverted = match mark.effect.clone() {
            MarkEffect::Skip => Mark {
                changes,
                ..Mark::skip(mark.count)
            },
            MarkEffect::Insert { id, .. } => {
                manager.invert_attach(id.clone());
                Mark {
                    changes,
                    revision: mark.revision.clone().or_else(|| a_rev.tag.clone()),
                    cell_id: mark.cell_id.clone(),
                    ..Mark::remove(id, mark.count)
                }
            }
            MarkEffect::Remove { id } => {
                manager.invert_detach(id.clone());
                Mark {
                    changes,
                    revision: mark.revision.clone().or_else(|| a_rev.tag.clone()),
                    cell_id: mark.cell_id.clone(),
                    ..Mark::revive(id, mark.count)
                }
            }
            MarkEffect::Revive { id } => Mark {
                changes,
                cell_id: mark.cell_id.clone(),
                ..Mark::remove(id, mark.count)
            },
            MarkEffect::MoveOut { id } => Mark {
                changes,
                cell_id: mark.cell_id.clone(),
                ..Mark::move_in(id, mark.count)
            },
            MarkEffect::MoveIn { id } => Mark {
                changes,
                cell_id: mark.cell_id.clone(),
                ..Mark::move_out(id, mark.count)
            },
        };
        marks.push(inverted);
    }
    Ok(SequenceChangeset { marks }.normalized())
}

fn rebase(
    registry: &FieldKindRegistry,
    a: &SequenceChangeset,
    a_rev: &RevisionInfo,
    base: &SequenceChangeset,
    base_rev: &RevisionInfo,
    manager: &mut CrossFieldManager,
) -> ChangeResult<SequenceChangeset> {
    let mut out: Vec<Mark> = vec![];
    let mut qa = MarkQueue::new(&a.marks);
    let mut qb = MarkQueue::new(&base.marks);
    // While the walk sits strictly inside a base-removed run, this names the
    // detached cell at the current boundary.
    let mut in_base_detach: Option<ChangeAtomId> = None;

    loop {
        // A base revive brings detached cells back into the live sequence;
        // muted marks aimed at those cells come back to life with them.
        if let Some(Mark {
            effect: MarkEffect::Revive { id },
            count,
            cell_id: None,
            ..
        }) = qb.peek()
        {
            let id = id.clone();
            let count = *count;
            let mut revived = extract_muted_in_range(&mut qa, &id, count);
            if !revived.is_empty() {
                qb.pop();
                revived.sort_by_key(|mark| {
                    mark.cell_id.as_ref().map_or(0, |cell| cell.local_id)
                });
                let mut cursor = id.local_id;
                for mut mark in revived {
                    let cell = mark.cell_id.take().expect("extracted marks are muted");
                    if cell.local_id > cursor {
                        out.push(Mark::skip(u64::from(cell.local_id - cursor)));
                    }
                    cursor = cell.local_id + mark.count as u32;
                    out.push(mark);
                }
                let end = id.local_id + count as u32;
                if end > cursor {
                    out.push(Mark::skip(u64::from(end - cursor)));
                }
                continue;
            }
        }
        let a_attach = qa.peek().is_some_and(Mark::is_attach);
        let b_attach = qb.peek().is_some_and(Mark::is_attach);
        if a_attach && b_attach {
            // Concurrent content at the same position: the change with the
            // smaller order key goes first, deterministically on every
            // replica.
            if a_rev.order <= base_rev.order {
                out.push(qa.pop().unwrap());
            } else {
                let skipped = qb.pop().unwrap().output_len();
                out.push(Mark::skip(skipped));
            }
            continue;
        }
        if a_attach {
            let mark = qa.pop().unwrap();
            match &in_base_detach {
                // New content aimed strictly inside a base-removed range is
                // muted, preserved for a later revive.
                Some(cell) => out.push(mark.muted(cell.clone())),
                None => out.push(mark),
            }
            continue;
        }
        if qa.peek().is_some_and(|mark| mark.cell_id.is_some()) {
            // Muted marks target detached cells the base cannot see.
            out.push(qa.pop().unwrap());
            continue;
        }
        if b_attach {
            // Cells the base added: the rebased change skips over them.
            let skipped = qb.pop().unwrap().output_len();
            out.push(Mark::skip(skipped));
            continue;
        }
        if qb.peek().is_some_and(|mark| mark.cell_id.is_some()) {
            qb.pop();
            continue;
        }
        let (Some(_), Some(_)) = (qa.peek(), qb.peek()) else {
            break;
        };
        let n = qa
            .peek()
            .unwrap()
            .input_len()
            .min(qb.peek().unwrap().input_len());
        let ma = qa.pop_input(n).unwrap();
        let mb = qb.pop_input(n).unwrap();
        match mb.effect.clone() {
            MarkEffect::Skip => {
                let mark = match (&ma.changes, &mb.changes) {
                    (Some(a_changes), Some(b_changes)) => {
                        let rebased = modular::rebase_node(
                            registry, a_changes, a_rev, b_changes, base_rev, manager,
                        )?;
                        Mark {
                            changes: Some(rebased),
                            ..ma
                        }
                    }
                    _ => ma,
                };
                out.push(mark);
            }
            MarkEffect::Remove { id: base_id } => {
                // The cells are gone from the rebased change's input
                // context; what targeted them becomes muted.
                match ma.effect.clone() {
                    MarkEffect::Skip => {
                        if let Some(changes) = ma.changes {
                            out.push(Mark::modify(changes).muted(base_id));
                        }
                    }
                    MarkEffect::Remove { id } => {
                        manager.rebase_over_detach(id.clone(), base_id.clone());
                        out.push(Mark::remove(id, ma.count).muted(base_id));
                    }
                    MarkEffect::MoveOut { id } => {
                        // A move of cells the base removed: a no-op move
                        // sourced at the detached cells.
                        manager.rebase_over_detach(id.clone(), base_id.clone());
                        out.push(Mark::move_out(id, ma.count).muted(base_id));
                    }
                    _ => {}
                }
            }
            MarkEffect::MoveOut { id: base_id } => match ma.effect.clone() {
                MarkEffect::Skip => {
                    if let Some(changes) = ma.changes {
                        // The node went with the base's move; so do its
                        // changes. Whatever field holds the base's move-in
                        // picks them up in the second pass.
                        manager.send_changes_to_base_attach(base_id, changes);
                    }
                }
                MarkEffect::Remove { id } => {
                    out.push(Mark::remove(id, ma.count).muted(base_id));
                }
                MarkEffect::MoveOut { id } => {
                    out.push(Mark::move_out(id, ma.count).muted(base_id));
                }
                _ => {}
            },
            _ => unreachable!("attach marks of the base are handled before pairing"),
        }
        in_base_detach = match &mb.effect {
            MarkEffect::Remove { id } | MarkEffect::MoveOut { id } => {
                let continuation = id.offset(n as u32);
                let continues = qb.peek().is_some_and(|next| {
                    next.cell_id.is_none()
                        && matches!(
                            &next.effect,
                            MarkEffect::Remove { id: next_id }
                                | MarkEffect::MoveOut { id: next_id }
                                    if *next_id == continuation
                        )
                });
                continues.then_some(continuation)
            }
            _ => None,
        };
    }
    while let Some(mark) = qa.pop() {
        out.push(mark);
    }
    Ok(SequenceChangeset { marks: out }.normalized())
}

/// Places the nested changes queued for the base's move-ins in this field at
/// the positions the base attached the nodes at.
fn deliver_base_attaches(
    registry: &FieldKindRegistry,
    change: &mut SequenceChangeset,
    base: &SequenceChangeset,
    manager: &mut CrossFieldManager,
) -> ChangeResult<()> {
    let mut offset = 0;
    for mark in &base.marks {
        if mark.cell_id.is_none() {
            if let MarkEffect::MoveIn { id } = &mark.effect {
                if let Some(changes) = manager.get_new_changes_for_base_attach(id) {
                    set_changes_at(&mut change.marks, offset, changes, registry, manager)?;
                }
            }
        }
        offset += mark.output_len();
    }
    Ok(())
}

/// Pulls out of the queue every muted mark fully contained in the detached
/// cell range `id .. id + count`. Muted marks are zero-width, so removing
/// them does not disturb the queue's alignment.
fn extract_muted_in_range(queue: &mut MarkQueue, id: &ChangeAtomId, count: u64) -> Vec<Mark> {
    let mut kept = VecDeque::new();
    let mut extracted = vec![];
    while let Some(mark) = queue.marks.pop_front() {
        let contained = mark.cell_id.as_ref().is_some_and(|cell| {
            cell.revision == id.revision
                && cell.local_id >= id.local_id
                && u64::from(cell.local_id - id.local_id) + mark.count <= count
        });
        if contained {
            extracted.push(mark);
        } else {
            kept.push_back(mark);
        }
    }
    queue.marks = kept;
    extracted
}

/// Attaches nested changes to the cell at `offset` (in the mark list's input
/// context), splitting skips as needed.
fn set_changes_at(
    marks: &mut Vec<Mark>,
    offset: u64,
    changes: NodeChangeset,
    registry: &FieldKindRegistry,
    manager: &mut CrossFieldManager,
) -> ChangeResult<()> {
    let mut walked = 0;
    let mut index = 0;
    while index < marks.len() {
        let len = marks[index].input_len();
        if len > 0 && walked + len > offset {
            let inner = offset - walked;
            if inner > 0 {
                let mark = marks.remove(index);
                let (head, tail) = mark.split(inner);
                marks.insert(index, head);
                marks.insert(index + 1, tail);
                index += 1;
            }
            if marks[index].count > 1 {
                let mark = marks.remove(index);
                let (head, tail) = mark.split(1);
                marks.insert(index, head);
                marks.insert(index + 1, tail);
            }
            let existing = marks[index].changes.take();
            marks[index].changes = match existing {
                Some(existing) => Some(modular::compose_node(
                    registry,
                    &existing,
                    &RevisionInfo::untagged(),
                    &changes,
                    &RevisionInfo::untagged(),
                    manager,
                )?),
                None => Some(changes),
            };
            return Ok(());
        }
        walked += len;
        index += 1;
    }
    // Past the explicit marks: the cell is in the implicit trailing skip.
    if offset > walked {
        marks.push(Mark::skip(offset - walked));
    }
    marks.push(Mark::modify(changes));
    Ok(())
}

fn into_delta(
    registry: &FieldKindRegistry,
    change: &SequenceChangeset,
    context: &mut DeltaContext<'_>,
) -> ChangeResult<FieldDelta> {
    let mut marks = vec![];
    for mark in &change.marks {
        if let Some(cell) = &mark.cell_id {
            // Muted marks only shuffle detached state.
            match &mark.effect {
                MarkEffect::Insert { content, .. } => {
                    let root = context.allocate(cell, mark.count)?;
                    context.add_build(root, content.clone());
                }
                MarkEffect::Remove { id } | MarkEffect::MoveOut { id } => {
                    if let Some(rename) = context.alias(cell, id, mark.count)? {
                        marks.push(rename);
                    }
                }
                MarkEffect::MoveIn { id } => {
                    if let Some(rename) = context.alias(id, cell, mark.count)? {
                        marks.push(rename);
                    }
                }
                MarkEffect::Skip | MarkEffect::Revive { .. } => {}
            }
            if let Some(changes) = &mark.changes {
                let root = context.allocate(cell, 1)?;
                let node_delta = modular::node_into_delta(registry, changes, context)?;
                context.add_detached_edit(root, node_delta);
            }
            continue;
        }
        match &mark.effect {
            MarkEffect::Skip => match &mark.changes {
                Some(changes) => {
                    let node_delta = modular::node_into_delta(registry, changes, context)?;
                    marks.push(DeltaMark::Modify(Box::new(node_delta)));
                    if mark.count > 1 {
                        marks.push(DeltaMark::Skip(mark.count - 1));
                    }
                }
                None => marks.push(DeltaMark::Skip(mark.count)),
            },
            MarkEffect::Insert { id, content } => {
                let root = context.allocate(id, mark.count)?;
                context.add_build(root, content.clone());
                changes_as_detached_edit(registry, mark, root, context)?;
                marks.push(DeltaMark::Attach {
                    id: root,
                    count: mark.count,
                });
            }
            MarkEffect::Remove { id } | MarkEffect::MoveOut { id } => {
                let root = context.allocate(id, mark.count)?;
                changes_as_detached_edit(registry, mark, root, context)?;
                marks.push(DeltaMark::Detach {
                    id: root,
                    count: mark.count,
                });
            }
            MarkEffect::MoveIn { id } => {
                let root = context.allocate(id, mark.count)?;
                changes_as_detached_edit(registry, mark, root, context)?;
                marks.push(DeltaMark::Attach {
                    id: root,
                    count: mark.count,
                });
            }
            MarkEffect::Revive { id } => {
                let root = context
                    .existing(id, mark.count)
                    .ok_or_else(|| ChangeError::MissingRefresher(id.clone()))?;
                changes_as_detached_edit(registry, mark, root, context)?;
                marks.push(DeltaMark::Attach {
                    id: root,
                    count: mark.count,
                });
            }
        }
    }
    Ok(FieldDelta { marks })
}

/// Nested changes riding on a detach or attach mark edit the content while
/// it sits (or comes to sit) under its detached root.
fn changes_as_detached_edit(
    registry: &FieldKindRegistry,
    mark: &Mark,
    root: crate::detached::ForestRootId,
    context: &mut DeltaContext<'_>,
) -> ChangeResult<()> {
    if let Some(changes) = &mark.changes {
        let node_delta = modular::node_into_delta(registry, changes, context)?;
        if !node_delta.is_empty() {
            context.add_detached_edit(root, node_delta);
        }
    }
    Ok(())
}

/// The registered algebra for sequence fields.
#[derive(Debug)]
pub struct SequenceFieldKind;

impl FieldKind for SequenceFieldKind {
    fn id(&self) -> FieldKindId {
        FieldKindId::sequence()
    }

    fn noop(&self) -> FieldChangeset {
        FieldChangeset::Sequence(SequenceChangeset::noop())
    }

    fn is_noop(&self, change: &FieldChangeset) -> bool {
        match change {
            FieldChangeset::Sequence(change) => change
                .marks
                .iter()
                .all(|mark| mark.is_plain_skip() || mark.count == 0),
            _ => false,
        }
    }

    fn compose(
        &self,
        registry: &FieldKindRegistry,
        a: &FieldChangeset,
        a_rev: &RevisionInfo,
        b: &FieldChangeset,
        b_rev: &RevisionInfo,
        manager: &mut CrossFieldManager,
    ) -> ChangeResult<FieldChangeset> {
        let composed = compose(
            registry,
            a.as_sequence()?,
            a_rev,
            b.as_sequence()?,
            b_rev,
            manager,
        )?;
        Ok(FieldChangeset::Sequence(composed))
    }

    fn invert(
        &self,
        registry: &FieldKindRegistry,
        a: &FieldChangeset,
        a_rev: &RevisionInfo,
        manager: &mut CrossFieldManager,
    ) -> ChangeResult<FieldChangeset> {
        Ok(FieldChangeset::Sequence(invert(
            registry,
            a.as_sequence()?,
            a_rev,
            manager,
        )?))
    }

    fn rebase(
        &self,
        registry: &FieldKindRegistry,
        a: &FieldChangeset,
        a_rev: &RevisionInfo,
        base: &FieldChangeset,
        base_rev: &RevisionInfo,
        manager: &mut CrossFieldManager,
    ) -> ChangeResult<FieldChangeset> {
        let rebased = rebase(
            registry,
            a.as_sequence()?,
            a_rev,
            base.as_sequence()?,
            base_rev,
            manager,
        )?;
        Ok(FieldChangeset::Sequence(rebased))
    }

    fn consume_cross_field(
        &self,
        registry: &FieldKindRegistry,
        change: &mut FieldChangeset,
        manager: &mut CrossFieldManager,
    ) -> ChangeResult<()> {
        let change = change.as_sequence_mut()?;
        for mark in &mut change.marks {
            if let Some(cell) = &mut mark.cell_id {
                if let Some(renamed) = manager.rename_for(cell) {
                    *cell = renamed.clone();
                }
            }
            let claimed = match &mark.effect {
                // Detaches own the source cells of cross-field moves; they
                // claim the changes other fields addressed there.
                MarkEffect::Remove { id } | MarkEffect::MoveOut { id } => {
                    manager.take_moved_changes(id)
                }
                MarkEffect::Insert { id, .. }
                | MarkEffect::MoveIn { id }
                | MarkEffect::Revive { id } => {
                    let mut changes = manager.get_new_changes_for_base_attach(id);
                    if changes.is_none() && manager.is_reclaim_phase() {
                        changes = manager.take_moved_changes(id);
                    }
                    changes
                }
                MarkEffect::Skip => None,
            };
            if let Some(changes) = claimed {
                let merged = match mark.changes.take() {
                    Some(existing) => modular::compose_node(
                        registry,
                        &existing,
                        &RevisionInfo::untagged(),
                        &changes,
                        &RevisionInfo::untagged(),
                        manager,
                    )?,
                    None => changes,
                };
                mark.changes = Some(merged);
            }
        }
        Ok(())
    }

    fn deliver_base_attach_changes(
        &self,
        registry: &FieldKindRegistry,
        change: &mut FieldChangeset,
        base: &FieldChangeset,
        manager: &mut CrossFieldManager,
    ) -> ChangeResult<()> {
        deliver_base_attaches(registry, change.as_sequence_mut()?, base.as_sequence()?, manager)
    }

    fn update_revision(
        &self,
        registry: &FieldKindRegistry,
        change: &mut FieldChangeset,
        old: Option<&RevisionTag>,
        new: &RevisionTag,
    ) {
        let Ok(change) = change.as_sequence_mut() else {
            return;
        };
        let update_id = |id: &mut ChangeAtomId| {
            if is_own_atom(id, old) {
                id.revision = Some(new.clone());
            }
        };
        for mark in &mut change.marks {
            match mark.revision.as_ref() {
                None => mark.revision = Some(new.clone()),
                Some(revision) if Some(revision) == old => mark.revision = Some(new.clone()),
                Some(_) => {}
            }
            if let Some(cell) = &mut mark.cell_id {
                update_id(cell);
            }
            match &mut mark.effect {
                MarkEffect::Skip => {}
                MarkEffect::Insert { id, .. }
                | MarkEffect::Remove { id }
                | MarkEffect::MoveOut { id }
                | MarkEffect::MoveIn { id }
                | MarkEffect::Revive { id } => update_id(id),
            }
            if let Some(changes) = &mut mark.changes {
                modular::update_revision_node(registry, changes, old, new);
            }
        }
    }

    fn into_delta(
        &self,
        registry: &FieldKindRegistry,
        change: &FieldChangeset,
        context: &mut DeltaContext<'_>,
    ) -> ChangeResult<FieldDelta> {
        into_delta(registry, change.as_sequence()?, context)
    }

    fn referenced_detached(
        &self,
        registry: &FieldKindRegistry,
        change: &FieldChangeset,
        own_revision: Option<&RevisionTag>,
        out: &mut Vec<ChangeAtomId>,
    ) {
        let Ok(change) = change.as_sequence() else {
            return;
        };
        for mark in &change.marks {
            if let Some(cell) = &mark.cell_id {
                if !is_own_atom(cell, own_revision) {
                    out.push(cell.clone());
                }
            }
            if let MarkEffect::Revive { id } = &mark.effect {
                if !is_own_atom(id, own_revision) {
                    out.push(id.clone());
                }
            }
            if let Some(changes) = &mark.changes {
                modular::referenced_detached_node(registry, changes, own_revision, out);
            }
        }
    }
}
