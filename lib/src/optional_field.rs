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

//! Changeset algebra for fields holding at most one child node.
//!
//! The state of an optional field is either empty or a single node. A
//! changeset expresses the intended transition as a set of moves between the
//! field slot and detached cells, plus nested changes to the node at a given
//! location.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

use crate::cross_field::CrossFieldManager;
use crate::delta::{DeltaContext, DeltaMark, FieldDelta};
use crate::field_kind::{
    is_own_atom, ChangeResult, FieldChangeset, FieldKind, FieldKindId, FieldKindRegistry,
    RevisionInfo,
};
use crate::modular::{self, NodeChangeset};
use crate::revision::{ChangeAtomId, RevisionTag};

/// One endpoint of an optional-field move: the field slot itself, or a
/// detached cell.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Debug, Serialize, Deserialize)]
pub enum Place {
    Field,
    Detached(ChangeAtomId),
}

/// How a move behaves when the content it targets was concurrently moved.
///
/// A node-targeting move follows the node to wherever it ended up; a
/// cell-targeting move stays with the original cell even if it became empty.
#[derive(PartialEq, Eq, Clone, Copy, Hash, Debug, Serialize, Deserialize)]
pub enum MoveKind {
    NodeTargeting,
    CellTargeting,
}

#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct OptionalMove {
    pub src: Place,
    pub dst: Place,
    pub kind: MoveKind,
}

impl OptionalMove {
    pub fn new(src: Place, dst: Place, kind: MoveKind) -> Self {
        OptionalMove { src, dst, kind }
    }
}

/// A field sees at most a detach, an attach, and the occasional restore.
pub type MoveList = SmallVec<[OptionalMove; 2]>;

/// Changeset over an optional field.
///
/// `reserved_detach_id` names the cell the pre-change content (if any) is
/// detached into when the change overwrites the field; it is a conditional
/// detach, active only when the field is occupied in the input context. At
/// most one move has `dst == Place::Field`.
#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct OptionalChangeset {
    pub reserved_detach_id: Option<ChangeAtomId>,
    pub moves: MoveList,
    pub child_changes: Vec<(Place, NodeChangeset)>,
}

impl OptionalChangeset {
    pub fn noop() -> Self {
        OptionalChangeset::default()
    }

    /// Sets the field from the detached cell `source` (a build or an earlier
    /// detach), reserving `reserved` for content the fill overwrites.
    pub fn fill(source: ChangeAtomId, reserved: ChangeAtomId) -> Self {
        OptionalChangeset {
            reserved_detach_id: Some(reserved),
            moves: smallvec![OptionalMove::new(
                Place::Detached(source),
                Place::Field,
                MoveKind::NodeTargeting,
            )],
            child_changes: vec![],
        }
    }

    /// Clears the field, detaching the current content under `detach_id`.
    pub fn clear(detach_id: ChangeAtomId) -> Self {
        OptionalChangeset {
            reserved_detach_id: None,
            moves: smallvec![OptionalMove::new(
                Place::Field,
                Place::Detached(detach_id),
                MoveKind::NodeTargeting,
            )],
            child_changes: vec![],
        }
    }

    /// Applies nested changes to the node currently in the field.
    pub fn child(changes: NodeChangeset) -> Self {
        OptionalChangeset {
            reserved_detach_id: None,
            moves: smallvec![],
            child_changes: vec![(Place::Field, changes)],
        }
    }

    pub fn fills(&self) -> bool {
        self.moves.iter().any(|m| m.dst == Place::Field)
    }

    pub fn clears(&self) -> bool {
        self.moves.iter().any(|m| m.src == Place::Field)
            || (self.reserved_detach_id.is_some() && self.fills())
    }

    /// The id the current content is detached under if this change clears
    /// the field: the explicit clear destination, or the reservation.
    pub fn detach_destination(&self) -> Option<&ChangeAtomId> {
        for m in &self.moves {
            if m.src == Place::Field {
                if let Place::Detached(id) = &m.dst {
                    return Some(id);
                }
            }
        }
        if self.fills() {
            self.reserved_detach_id.as_ref()
        } else {
            None
        }
    }

    /// Maps a location in the input context through this change's moves.
    fn apply_moves(&self, place: &Place) -> Place {
        for m in &self.moves {
            if &m.src == place {
                return m.dst.clone();
            }
        }
        if *place == Place::Field {
            if let Some(dst) = self.detach_destination() {
                return Place::Detached(dst.clone());
            }
        }
        place.clone()
    }

    /// Maps a location in the output context back to the input context.
    fn unapply_moves(&self, place: &Place) -> Place {
        for m in &self.moves {
            if &m.dst == place {
                return m.src.clone();
            }
        }
        if let Place::Detached(id) = place {
            if self.fills() && self.reserved_detach_id.as_ref() == Some(id) {
                return Place::Field;
            }
        }
        place.clone()
    }

    /// Rewrites an explicit clear-plus-fill pair into the reservation form so
    /// equivalent changesets compare equal.
    fn canonical(mut self) -> Self {
        self.moves.retain(|m| m.src != m.dst);
        if self.reserved_detach_id.is_none() && self.fills() {
            let clear_index = self.moves.iter().position(|m| {
                m.src == Place::Field
                    && matches!(m.dst, Place::Detached(_))
                    && m.kind == MoveKind::NodeTargeting
            });
            if let Some(index) = clear_index {
                let clear = self.moves.remove(index);
                if let Place::Detached(id) = clear.dst {
                    self.reserved_detach_id = Some(id);
                }
            }
        }
        self
    }
}

fn compose(
    registry: &FieldKindRegistry,
    a: &OptionalChangeset,
    a_rev: &RevisionInfo,
    b: &OptionalChangeset,
    b_rev: &RevisionInfo,
    manager: &mut CrossFieldManager,
) -> ChangeResult<OptionalChangeset> {
    let mut moves = MoveList::new();
    let mut used_b: HashSet<usize> = HashSet::new();
    // When b overwrites the field, its reservation behaves like a move from
    // the field slot into the reserved cell.
    let b_conditional = if b.fills() {
        b.reserved_detach_id.as_ref()
    } else {
        None
    };
    let mut b_conditional_used = false;

    for m in &a.moves {
        let mut chained = m.clone();
        if let Some((j, m2)) = b
            .moves
            .iter()
            .enumerate()
            .find(|(j, m2)| m2.src == chained.dst && !used_b.contains(j))
        {
            used_b.insert(j);
            chained.dst = m2.dst.clone();
        } else if chained.dst == Place::Field {
            if let Some(reserved) = b_conditional {
                b_conditional_used = true;
                if let Place::Detached(src_id) = &chained.src {
                    manager.compose_attach_detach(src_id.clone(), reserved.clone());
                }
                chained.dst = Place::Detached(reserved.clone());
            }
        }
        if chained.src == chained.dst {
            if let Place::Detached(id) = &chained.src {
                manager.compose_detach_attach(id.clone());
            }
        } else {
            moves.push(chained);
        }
    }

    // Chain a's conditional detach through b's moves out of the reserved
    // cell. A restore back into the field cancels the reservation.
    let mut reserved_from_a = a.reserved_detach_id.clone();
    if let Some(reserved) = &a.reserved_detach_id {
        let reserved_place = Place::Detached(reserved.clone());
        if let Some((j, m2)) = b
            .moves
            .iter()
            .enumerate()
            .find(|(j, m2)| m2.src == reserved_place && !used_b.contains(j))
        {
            used_b.insert(j);
            reserved_from_a = match &m2.dst {
                Place::Field => None,
                Place::Detached(renamed) => Some(renamed.clone()),
            };
        }
    }

    for (j, m2) in b.moves.iter().enumerate() {
        if !used_b.contains(&j) {
            moves.push(m2.clone());
        }
    }

    let reserved_detach_id = if a.clears() {
        reserved_from_a
    } else if b_conditional_used {
        None
    } else {
        b.reserved_detach_id.clone()
    };

    // Nested changes keyed in the composite's input context: b's locations
    // map back through a's moves.
    let mut child_changes: Vec<(Place, NodeChangeset)> = vec![];
    for (place, changes) in &a.child_changes {
        child_changes.push((place.clone(), changes.clone()));
    }
    for (place, changes) in &b.child_changes {
        let mapped = a.unapply_moves(place);
        if let Some(existing) = child_changes.iter_mut().find(|(p, _)| *p == mapped) {
            existing.1 =
                modular::compose_node(registry, &existing.1, a_rev, changes, b_rev, manager)?;
        } else if *place == Place::Field && matches!(mapped, Place::Detached(_)) {
            // The node arrived through a's attach; its source cell may be
            // owned by another field, which claims these changes in the
            // second pass. If nothing does, this field reclaims them.
            if let Place::Detached(source) = mapped {
                manager.send_new_changes_to_base_source_location(source, changes.clone());
            }
        } else {
            child_changes.push((mapped, changes.clone()));
        }
    }
    child_changes.retain(|(_, changes)| !changes.is_noop());

    Ok(OptionalChangeset {
        reserved_detach_id,
        moves,
        child_changes,
    }
    .canonical())
}

fn invert(
    registry: &FieldKindRegistry,
    a: &OptionalChangeset,
    a_rev: &RevisionInfo,
    manager: &mut CrossFieldManager,
) -> ChangeResult<OptionalChangeset> {
    let mut moves = MoveList::new();
    for m in &a.moves {
        if m.dst == Place::Field {
            if let Place::Detached(id) = &m.src {
                manager.invert_attach(id.clone());
            }
        }
        if m.src == Place::Field {
            if let Place::Detached(id) = &m.dst {
                manager.invert_detach(id.clone());
            }
        }
        moves.push(OptionalMove::new(m.dst.clone(), m.src.clone(), m.kind));
    }
    // The conditional detach inverts to a restore from the reserved cell.
    if a.fills() {
        if let Some(reserved) = &a.reserved_detach_id {
            moves.push(OptionalMove::new(
                Place::Detached(reserved.clone()),
                Place::Field,
                MoveKind::NodeTargeting,
            ));
        }
    }

    let mut child_changes = vec![];
    for (place, changes) in &a.child_changes {
        let inverted = modular::invert_node(registry, changes, a_rev, manager)?;
        child_changes.push((a.apply_moves(place), inverted));
    }

    Ok(OptionalChangeset {
        reserved_detach_id: None,
        moves,
        child_changes,
    }
    .canonical())
}

fn rebase(
    registry: &FieldKindRegistry,
    a: &OptionalChangeset,
    a_rev: &RevisionInfo,
    base: &OptionalChangeset,
    base_rev: &RevisionInfo,
    manager: &mut CrossFieldManager,
) -> ChangeResult<OptionalChangeset> {
    let mut moves = MoveList::new();
    for m in &a.moves {
        let mut rebased = m.clone();
        match m.kind {
            MoveKind::NodeTargeting => {
                // Follow the node to wherever the base put it.
                let new_src = base.apply_moves(&m.src);
                if new_src != m.src {
                    if m.src == Place::Field {
                        if let (Some(own), Place::Detached(base_id)) =
                            (a.detach_destination(), &new_src)
                        {
                            manager.rebase_over_detach(own.clone(), base_id.clone());
                        }
                    }
                    rebased.src = new_src;
                }
            }
            MoveKind::CellTargeting => {}
        }
        if rebased.src == rebased.dst {
            continue;
        }
        moves.push(rebased);
    }

    let mut child_changes = vec![];
    for (place, changes) in &a.child_changes {
        // A nested change whose cell the base detached follows the content to
        // the base's detach id.
        let new_place = base.apply_moves(place);
        let base_child = base
            .child_changes
            .iter()
            .find(|(p, _)| p == place)
            .map(|(_, c)| c);
        let rebased = match base_child {
            Some(base_changes) => modular::rebase_node(
                registry,
                changes,
                a_rev,
                base_changes,
                base_rev,
                manager,
            )?,
            None => changes.clone(),
        };
        if !rebased.is_noop() {
            child_changes.push((new_place, rebased));
        }
    }

    Ok(OptionalChangeset {
        reserved_detach_id: a.reserved_detach_id.clone(),
        moves,
        child_changes,
    }
    .canonical())
}

fn into_delta(
    registry: &FieldKindRegistry,
    change: &OptionalChangeset,
    context: &mut DeltaContext<'_>,
) -> ChangeResult<FieldDelta> {
    let mut marks = vec![];
    // Detach the current content first, then attach the new content, then
    // apply nested changes to the occupant.
    if change.clears() {
        if let Some(detach_id) = change.detach_destination() {
            let root = context.allocate(detach_id, 1)?;
            marks.push(DeltaMark::Detach { id: root, count: 1 });
        }
    }
    for m in &change.moves {
        match (&m.src, &m.dst) {
            (Place::Detached(src), Place::Field) => {
                let root = context.allocate(src, 1)?;
                marks.push(DeltaMark::Attach { id: root, count: 1 });
            }
            (Place::Detached(src), Place::Detached(dst)) => {
                // Detached-to-detached moves keep the content's forest root
                // where possible; otherwise the forest rehomes it.
                if let Some(rename) = context.alias(src, dst, 1)? {
                    marks.push(rename);
                }
            }
            _ => {}
        }
    }
    for (place, changes) in &change.child_changes {
        let node_delta = modular::node_into_delta(registry, changes, context)?;
        if node_delta.is_empty() {
            continue;
        }
        match place {
            // A nested change on the pre-change occupant travels with it
            // when the change detaches it.
            Place::Field => match change.detach_destination() {
                Some(detach_id) => {
                    let root = context.allocate(detach_id, 1)?;
                    context.add_detached_edit(root, node_delta);
                }
                None => marks.push(DeltaMark::Modify(Box::new(node_delta))),
            },
            Place::Detached(id) => {
                let root = context.allocate(id, 1)?;
                context.add_detached_edit(root, node_delta);
            }
        }
    }
    Ok(FieldDelta { marks })
}

/// The registered algebra for optional fields.
#[derive(Debug)]
pub struct OptionalFieldKind;

impl FieldKind for OptionalFieldKind {
    fn id(&self) -> FieldKindId {
        FieldKindId::optional()
    }

    fn noop(&self) -> FieldChangeset {
        FieldChangeset::Optional(OptionalChangeset::noop())
    }

    fn is_noop(&self, change: &FieldChangeset) -> bool {
        match change {
            FieldChangeset::Optional(change) => {
                change.moves.is_empty()
                    && change
                        .child_changes
                        .iter()
                        .all(|(_, changes)| changes.is_noop())
            }
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
            a.as_optional()?,
            a_rev,
            b.as_optional()?,
            b_rev,
            manager,
        )?;
        Ok(FieldChangeset::Optional(composed))
    }

    fn invert(
        &self,
        registry: &FieldKindRegistry,
        a: &FieldChangeset,
        a_rev: &RevisionInfo,
        manager: &mut CrossFieldManager,
    ) -> ChangeResult<FieldChangeset> {
        Ok(FieldChangeset::Optional(invert(
            registry,
            a.as_optional()?,
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
            a.as_optional()?,
            a_rev,
            base.as_optional()?,
            base_rev,
            manager,
        )?;
        Ok(FieldChangeset::Optional(rebased))
    }

    fn consume_cross_field(
        &self,
        registry: &FieldKindRegistry,
        change: &mut FieldChangeset,
        manager: &mut CrossFieldManager,
    ) -> ChangeResult<()> {
        let change = change.as_optional_mut()?;
        // Renames of detached cells this field refers to.
        for m in &mut change.moves {
            if let Place::Detached(id) = &m.src {
                if let Some(renamed) = manager.rename_for(id) {
                    m.src = Place::Detached(renamed.clone());
                }
            }
        }
        // Claim messages addressed to cells this field owns: its detach
        // destinations always; its attach sources only once the reclaim
        // round starts (the real owner had its chance by then).
        let mut claims: Vec<(Place, NodeChangeset)> = vec![];
        let mut detach_ids: Vec<ChangeAtomId> = change
            .moves
            .iter()
            .filter(|m| m.src == Place::Field)
            .filter_map(|m| match &m.dst {
                Place::Detached(id) => Some(id.clone()),
                Place::Field => None,
            })
            .collect();
        if change.fills() {
            if let Some(reserved) = &change.reserved_detach_id {
                detach_ids.push(reserved.clone());
            }
        }
        for id in detach_ids {
            if let Some(changes) = manager.take_moved_changes(&id) {
                claims.push((Place::Detached(id), changes));
            }
        }
        for m in &change.moves {
            if m.dst != Place::Field {
                continue;
            }
            if let Place::Detached(id) = &m.src {
                if let Some(changes) = manager.get_new_changes_for_base_attach(id) {
                    claims.push((Place::Detached(id.clone()), changes));
                } else if manager.is_reclaim_phase() {
                    if let Some(changes) = manager.take_moved_changes(id) {
                        claims.push((Place::Detached(id.clone()), changes));
                    }
                }
            }
        }
        for (place, _) in &change.child_changes {
            if let Place::Detached(id) = place {
                if let Some(changes) = manager.take_moved_changes(id) {
                    claims.push((place.clone(), changes));
                }
            }
        }
        for (place, changes) in claims {
            if let Some(existing) = change.child_changes.iter_mut().find(|(p, _)| *p == place) {
                existing.1 = modular::compose_node(
                    registry,
                    &existing.1,
                    &RevisionInfo::untagged(),
                    &changes,
                    &RevisionInfo::untagged(),
                    manager,
                )?;
            } else {
                change.child_changes.push((place, changes));
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
        let change = change.as_optional_mut()?;
        let base = base.as_optional()?;
        // The base filled this field from a detached cell; changes queued
        // for that attach now apply to the field's occupant.
        for m in &base.moves {
            if m.dst != Place::Field {
                continue;
            }
            if let Place::Detached(id) = &m.src {
                if let Some(changes) = manager.get_new_changes_for_base_attach(id) {
                    if let Some(existing) = change
                        .child_changes
                        .iter_mut()
                        .find(|(p, _)| *p == Place::Field)
                    {
                        existing.1 = modular::compose_node(
                            registry,
                            &existing.1,
                            &RevisionInfo::untagged(),
                            &changes,
                            &RevisionInfo::untagged(),
                            manager,
                        )?;
                    } else {
                        change.child_changes.push((Place::Field, changes));
                    }
                }
            }
        }
        Ok(())
    }

    fn update_revision(
        &self,
        registry: &FieldKindRegistry,
        change: &mut FieldChangeset,
        old: Option<&RevisionTag>,
        new: &RevisionTag,
    ) {
        let Ok(change) = change.as_optional_mut() else {
            return;
        };
        let update_id = |id: &mut ChangeAtomId| {
            if is_own_atom(id, old) {
                id.revision = Some(new.clone());
            }
        };
        let update_place = |place: &mut Place| {
            if let Place::Detached(id) = place {
                if is_own_atom(id, old) {
                    id.revision = Some(new.clone());
                }
            }
        };
        if let Some(id) = &mut change.reserved_detach_id {
            update_id(id);
        }
        for m in &mut change.moves {
            update_place(&mut m.src);
            update_place(&mut m.dst);
        }
        for (place, changes) in &mut change.child_changes {
            update_place(place);
            modular::update_revision_node(registry, changes, old, new);
        }
    }

    fn into_delta(
        &self,
        registry: &FieldKindRegistry,
        change: &FieldChangeset,
        context: &mut DeltaContext<'_>,
    ) -> ChangeResult<FieldDelta> {
        into_delta(registry, change.as_optional()?, context)
    }

    fn referenced_detached(
        &self,
        registry: &FieldKindRegistry,
        change: &FieldChangeset,
        own_revision: Option<&RevisionTag>,
        out: &mut Vec<ChangeAtomId>,
    ) {
        let Ok(change) = change.as_optional() else {
            return;
        };
        for m in &change.moves {
            if let Place::Detached(id) = &m.src {
                if !is_own_atom(id, own_revision) {
                    out.push(id.clone());
                }
            }
        }
        for (place, changes) in &change.child_changes {
            if let Place::Detached(id) = place {
                if !is_own_atom(id, own_revision) {
                    out.push(id.clone());
                }
            }
            modular::referenced_detached_node(registry, changes, own_revision, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_kind::default_registry;
    use crate::revision::{RevisionTag, SeqNumber, SessionId};

    fn atom(local_id: u32) -> ChangeAtomId {
        ChangeAtomId::anonymous(local_id)
    }

    fn untagged() -> RevisionInfo {
        RevisionInfo::untagged()
    }

    fn run_compose(a: &OptionalChangeset, b: &OptionalChangeset) -> OptionalChangeset {
        let mut manager = CrossFieldManager::new();
        compose(
            default_registry(),
            a,
            &untagged(),
            b,
            &untagged(),
            &mut manager,
        )
        .unwrap()
    }

    fn run_invert(a: &OptionalChangeset) -> OptionalChangeset {
        let mut manager = CrossFieldManager::new();
        invert(default_registry(), a, &untagged(), &mut manager).unwrap()
    }

    #[test]
    fn test_fill_from_empty_round_trip() {
        // Set from empty: fill from cell 41, reserving cell 1 for content the
        // fill would overwrite.
        let change = OptionalChangeset::fill(atom(41), atom(1));
        assert_eq!(change.moves.len(), 1);
        assert_eq!(change.moves[0].src, Place::Detached(atom(41)));
        assert_eq!(change.moves[0].dst, Place::Field);
        assert_eq!(change.reserved_detach_id, Some(atom(1)));

        // The inverse clears back into cell 41 and restores from cell 1.
        let inverse = run_invert(&change);
        assert_eq!(inverse.reserved_detach_id, Some(atom(41)));
        assert_eq!(
            inverse.moves.as_slice(),
            [OptionalMove::new(
                Place::Detached(atom(1)),
                Place::Field,
                MoveKind::NodeTargeting
            )]
        );

        // Composing the change with its inverse is a no-op.
        let round_trip = run_compose(&change, &inverse);
        assert_eq!(round_trip, OptionalChangeset::noop());
    }

    #[test]
    fn test_invert_is_an_involution() {
        let change = OptionalChangeset::fill(atom(41), atom(1));
        assert_eq!(run_invert(&run_invert(&change)), change);

        let clear = OptionalChangeset::clear(atom(7));
        assert_eq!(run_invert(&run_invert(&clear)), clear);
    }

    #[test]
    fn test_compose_with_noop_is_identity() {
        let change = OptionalChangeset::fill(atom(41), atom(1));
        let noop = OptionalChangeset::noop();
        assert_eq!(run_compose(&change, &noop), change);
        assert_eq!(run_compose(&noop, &change), change);
    }

    #[test]
    fn test_compose_chains_moves() {
        // a clears into cell 5, b restores from cell 5: the content never
        // leaves the field.
        let a = OptionalChangeset::clear(atom(5));
        let b = OptionalChangeset {
            reserved_detach_id: None,
            moves: smallvec![OptionalMove::new(
                Place::Detached(atom(5)),
                Place::Field,
                MoveKind::NodeTargeting,
            )],
            child_changes: vec![],
        };
        assert_eq!(run_compose(&a, &b), OptionalChangeset::noop());
    }

    #[test]
    fn test_rebase_node_targeting_follows_base_detach() {
        let session = SessionId::new(1);
        // Base (sequenced) clears the field into its own cell 9.
        let base = OptionalChangeset::clear(ChangeAtomId::new(
            RevisionTag::sequenced(SeqNumber(1)),
            9,
        ));
        // Our change clears the field too, node-targeting.
        let ours = OptionalChangeset::clear(atom(2));
        let mut manager = CrossFieldManager::new();
        let rebased = rebase(
            default_registry(),
            &ours,
            &RevisionInfo::anonymous(session, 0),
            &base,
            &RevisionInfo::new(
                RevisionTag::sequenced(SeqNumber(1)),
                crate::id_compressor::OrderKey::new(SessionId::new(2), 0),
            ),
            &mut manager,
        )
        .unwrap();
        // The node already lives in the base's detached cell; our clear
        // becomes a rename of that cell.
        assert_eq!(rebased.moves.len(), 1);
        assert_eq!(
            rebased.moves[0].src,
            Place::Detached(ChangeAtomId::new(RevisionTag::sequenced(SeqNumber(1)), 9))
        );
        assert_eq!(rebased.moves[0].dst, Place::Detached(atom(2)));
    }

    #[test]
    fn test_rebase_cell_targeting_stays_at_cell() {
        let base = OptionalChangeset::clear(ChangeAtomId::new(
            RevisionTag::sequenced(SeqNumber(1)),
            9,
        ));
        let ours = OptionalChangeset {
            reserved_detach_id: None,
            moves: smallvec![OptionalMove::new(
                Place::Field,
                Place::Detached(atom(2)),
                MoveKind::CellTargeting,
            )],
            child_changes: vec![],
        };
        let mut manager = CrossFieldManager::new();
        let rebased = rebase(
            default_registry(),
            &ours,
            &untagged(),
            &base,
            &untagged(),
            &mut manager,
        )
        .unwrap();
        assert_eq!(rebased.moves[0].src, Place::Field);
    }

    #[test]
    fn test_child_change_follows_detach() {
        let detach_id = ChangeAtomId::new(RevisionTag::sequenced(SeqNumber(3)), 0);
        let base = OptionalChangeset::clear(detach_id.clone());
        let ours = OptionalChangeset::child(NodeChangeset::default());
        let mut manager = CrossFieldManager::new();
        let rebased = rebase(
            default_registry(),
            &ours,
            &untagged(),
            &base,
            &untagged(),
            &mut manager,
        )
        .unwrap();
        // The nested change was a no-op, so nothing survives; a non-empty
        // change would be keyed by the base's detach id.
        assert!(rebased.child_changes.is_empty());
    }
}
