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

//! Modular changesets: per-field changesets aggregated over tree paths,
//! with cross-field coordination for moves.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cross_field::CrossFieldManager;
use crate::delta::DeltaContext;
use crate::field_kind::{
    is_own_atom, ChangeError, ChangeResult, FieldChangeset, FieldKindId, FieldKindRegistry,
    RevisionInfo,
};
use crate::revision::{ChangeAtomId, RevisionTag};
use crate::sequence_field::MarkEffect;
use crate::tree::{FieldKey, TreeNode, TreeValue};

/// Replaces a node's leaf value. Carrying the pre-change value keeps the
/// change invertible and feeds the repair data recorded at apply time.
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct ValueChange {
    pub old: Option<TreeValue>,
    pub new: Option<TreeValue>,
}

impl ValueChange {
    pub fn set(old: Option<TreeValue>, new: TreeValue) -> Self {
        ValueChange {
            old,
            new: Some(new),
        }
    }

    pub fn clear(old: Option<TreeValue>) -> Self {
        ValueChange { old, new: None }
    }

    fn inverted(&self) -> Self {
        ValueChange {
            old: self.new.clone(),
            new: self.old.clone(),
        }
    }
}

/// A per-field changeset together with its kind id, as stored in a node
/// changeset.
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct FieldChange {
    pub kind: FieldKindId,
    pub change: FieldChangeset,
}

impl FieldChange {
    pub fn new(kind: FieldKindId, change: FieldChangeset) -> Self {
        FieldChange { kind, change }
    }

    pub fn optional(change: crate::optional_field::OptionalChangeset) -> Self {
        FieldChange::new(FieldKindId::optional(), FieldChangeset::Optional(change))
    }

    pub fn sequence(change: crate::sequence_field::SequenceChangeset) -> Self {
        FieldChange::new(FieldKindId::sequence(), FieldChangeset::Sequence(change))
    }
}

/// Changes to one node: a mapping from field key to per-field changeset,
/// plus an optional leaf-value replacement.
#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeChangeset {
    pub fields: BTreeMap<FieldKey, FieldChange>,
    pub value_change: Option<ValueChange>,
}

impl NodeChangeset {
    pub fn new() -> Self {
        NodeChangeset::default()
    }

    pub fn with_field(mut self, key: FieldKey, change: FieldChange) -> Self {
        self.fields.insert(key, change);
        self
    }

    pub fn with_value_change(mut self, change: ValueChange) -> Self {
        self.value_change = Some(change);
        self
    }

    pub fn is_noop(&self) -> bool {
        self.value_change.is_none() && self.fields.values().all(|fc| fc.change.is_noop())
    }
}

impl FieldChangeset {
    /// Whether the changeset leaves its field untouched.
    pub fn is_noop(&self) -> bool {
        match self {
            FieldChangeset::Optional(change) => {
                change.moves.is_empty()
                    && change.child_changes.iter().all(|(_, c)| c.is_noop())
            }
            FieldChangeset::Sequence(change) => change.marks.iter().all(|mark| {
                mark.cell_id.is_none()
                    && matches!(mark.effect, MarkEffect::Skip)
                    && mark.changes.as_ref().map_or(true, NodeChangeset::is_noop)
            }),
            FieldChangeset::Schema(change) => change.is_noop(),
        }
    }
}

/// A precondition of a commit, re-checked whenever the commit is rebased.
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub enum Constraint {
    /// The node detached under the given id must still be attached.
    NodeExists(ChangeAtomId),
}

#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct ConstraintState {
    pub constraint: Constraint,
    pub violated: bool,
}

impl ConstraintState {
    pub fn new(constraint: Constraint) -> Self {
        ConstraintState {
            constraint,
            violated: false,
        }
    }
}

/// A changeset over the whole tree: a node changeset for the root, new
/// subtrees introduced by the change, snapshots of detached subtrees the
/// change may need on replicas that evicted them, and preconditions.
#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModularChangeset {
    pub change: NodeChangeset,
    pub builds: Vec<(ChangeAtomId, Vec<TreeNode>)>,
    pub refreshers: Vec<(ChangeAtomId, Vec<TreeNode>)>,
    pub constraints: Vec<ConstraintState>,
}

impl ModularChangeset {
    pub fn new(change: NodeChangeset) -> Self {
        ModularChangeset {
            change,
            ..ModularChangeset::default()
        }
    }

    pub fn noop() -> Self {
        ModularChangeset::default()
    }

    pub fn with_build(mut self, id: ChangeAtomId, content: Vec<TreeNode>) -> Self {
        self.builds.push((id, content));
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(ConstraintState::new(constraint));
        self
    }

    pub fn build_content(&self, id: &ChangeAtomId) -> Option<&[TreeNode]> {
        self.builds
            .iter()
            .find(|(build_id, _)| build_id == id)
            .map(|(_, content)| content.as_slice())
    }

    pub fn refresher_content(&self, id: &ChangeAtomId) -> Option<&[TreeNode]> {
        self.refreshers
            .iter()
            .find(|(refresher_id, _)| refresher_id == id)
            .map(|(_, content)| content.as_slice())
    }

    pub fn is_noop(&self) -> bool {
        self.change.is_noop() && self.builds.is_empty()
    }

    /// Whether any precondition was found violated during rebasing. A
    /// violated commit applies as a no-op.
    pub fn is_violated(&self) -> bool {
        self.constraints.iter().any(|state| state.violated)
    }
}

/// A changeset tagged with the revision it was committed under.
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct TaggedChange {
    pub revision: RevisionTag,
    pub change: ModularChangeset,
}

impl TaggedChange {
    pub fn new(revision: RevisionTag, change: ModularChangeset) -> Self {
        TaggedChange { revision, change }
    }
}

// --- node-level operations, recursed into by the field algebras ---

pub fn compose_node(
    registry: &FieldKindRegistry,
    a: &NodeChangeset,
    a_rev: &RevisionInfo,
    b: &NodeChangeset,
    b_rev: &RevisionInfo,
    manager: &mut CrossFieldManager,
) -> ChangeResult<NodeChangeset> {
    let mut fields = a.fields.clone();
    for (key, b_change) in &b.fields {
        match fields.get_mut(key) {
            Some(a_change) => {
                if a_change.kind != b_change.kind {
                    return Err(ChangeError::InvalidChangeset(format!(
                        "field {key:?} changes kind from {:?} to {:?}",
                        a_change.kind, b_change.kind
                    )));
                }
                let kind = registry.get(&a_change.kind)?;
                a_change.change = kind.compose(
                    registry,
                    &a_change.change,
                    a_rev,
                    &b_change.change,
                    b_rev,
                    manager,
                )?;
            }
            None => {
                fields.insert(key.clone(), b_change.clone());
            }
        }
    }
    fields.retain(|_, fc| !fc.change.is_noop());
    let value_change = match (&a.value_change, &b.value_change) {
        (None, None) => None,
        (Some(change), None) | (None, Some(change)) => Some(change.clone()),
        (Some(a_change), Some(b_change)) => Some(ValueChange {
            old: a_change.old.clone(),
            new: b_change.new.clone(),
        }),
    };
    Ok(NodeChangeset {
        fields,
        value_change,
    })
}

pub fn invert_node(
    registry: &FieldKindRegistry,
    a: &NodeChangeset,
    a_rev: &RevisionInfo,
    manager: &mut CrossFieldManager,
) -> ChangeResult<NodeChangeset> {
    let mut fields = BTreeMap::new();
    for (key, fc) in &a.fields {
        let kind = registry.get(&fc.kind)?;
        let inverted = kind.invert(registry, &fc.change, a_rev, manager)?;
        fields.insert(key.clone(), FieldChange::new(fc.kind.clone(), inverted));
    }
    Ok(NodeChangeset {
        fields,
        value_change: a.value_change.as_ref().map(ValueChange::inverted),
    })
}

pub fn rebase_node(
    registry: &FieldKindRegistry,
    a: &NodeChangeset,
    a_rev: &RevisionInfo,
    base: &NodeChangeset,
    base_rev: &RevisionInfo,
    manager: &mut CrossFieldManager,
) -> ChangeResult<NodeChangeset> {
    let mut fields = BTreeMap::new();
    for (key, fc) in &a.fields {
        let rebased = match base.fields.get(key) {
            Some(base_fc) => {
                if fc.kind != base_fc.kind {
                    return Err(ChangeError::InvalidChangeset(format!(
                        "field {key:?} changes kind from {:?} to {:?}",
                        base_fc.kind, fc.kind
                    )));
                }
                let kind = registry.get(&fc.kind)?;
                kind.rebase(
                    registry,
                    &fc.change,
                    a_rev,
                    &base_fc.change,
                    base_rev,
                    manager,
                )?
            }
            None => fc.change.clone(),
        };
        if !rebased.is_noop() {
            fields.insert(key.clone(), FieldChange::new(fc.kind.clone(), rebased));
        }
    }
    // Concurrent value replacements: the rebased change wins, but its
    // recorded pre-change value is now what the base wrote.
    let value_change = match (&a.value_change, &base.value_change) {
        (Some(a_change), Some(base_change)) => Some(ValueChange {
            old: base_change.new.clone(),
            new: a_change.new.clone(),
        }),
        (Some(a_change), None) => Some(a_change.clone()),
        (None, _) => None,
    };
    Ok(NodeChangeset {
        fields,
        value_change,
    })
}

pub fn consume_node(
    registry: &FieldKindRegistry,
    change: &mut NodeChangeset,
    manager: &mut CrossFieldManager,
) -> ChangeResult<()> {
    // First round: the fields owning the addressed cells claim their
    // messages. Second round: senders reclaim what no owner took (an attach
    // whose source was a build, not another field's detach).
    for fc in change.fields.values_mut() {
        let kind = registry.get(&fc.kind)?;
        kind.consume_cross_field(registry, &mut fc.change, manager)?;
    }
    manager.begin_reclaim();
    for fc in change.fields.values_mut() {
        let kind = registry.get(&fc.kind)?;
        kind.consume_cross_field(registry, &mut fc.change, manager)?;
    }
    Ok(())
}

/// Rebase second pass: hands each field the base's changeset for that field
/// so it can place nested changes queued for the base's attaches. Fields the
/// rebased changeset did not touch are materialized on demand.
fn deliver_base_attaches(
    registry: &FieldKindRegistry,
    change: &mut NodeChangeset,
    base: &NodeChangeset,
    manager: &mut CrossFieldManager,
) -> ChangeResult<()> {
    for (key, base_fc) in &base.fields {
        let kind = registry.get(&base_fc.kind)?;
        let entry = change
            .fields
            .entry(key.clone())
            .or_insert_with(|| FieldChange::new(base_fc.kind.clone(), kind.noop()));
        if entry.kind != base_fc.kind {
            return Err(ChangeError::InvalidChangeset(format!(
                "field {key:?} changes kind from {:?} to {:?}",
                base_fc.kind, entry.kind
            )));
        }
        kind.deliver_base_attach_changes(registry, &mut entry.change, &base_fc.change, manager)?;
    }
    change.fields.retain(|_, fc| !fc.change.is_noop());
    Ok(())
}

pub fn update_revision_node(
    registry: &FieldKindRegistry,
    change: &mut NodeChangeset,
    old: Option<&RevisionTag>,
    new: &RevisionTag,
) {
    for fc in change.fields.values_mut() {
        if let Ok(kind) = registry.get(&fc.kind) {
            kind.update_revision(registry, &mut fc.change, old, new);
        }
    }
}

pub fn node_into_delta(
    registry: &FieldKindRegistry,
    change: &NodeChangeset,
    context: &mut DeltaContext<'_>,
) -> ChangeResult<crate::delta::NodeDelta> {
    let mut fields = BTreeMap::new();
    for (key, fc) in &change.fields {
        let kind = registry.get(&fc.kind)?;
        let field_delta = kind.into_delta(registry, &fc.change, context)?;
        if !field_delta.marks.is_empty() {
            fields.insert(key.clone(), field_delta);
        }
    }
    Ok(crate::delta::NodeDelta {
        value: change
            .value_change
            .as_ref()
            .filter(|vc| vc.old != vc.new)
            .map(|vc| crate::delta::ValueReplace {
                old: vc.old.clone(),
                new: vc.new.clone(),
            }),
        fields,
    })
}

pub fn referenced_detached_node(
    registry: &FieldKindRegistry,
    change: &NodeChangeset,
    own_revision: Option<&RevisionTag>,
    out: &mut Vec<ChangeAtomId>,
) {
    for fc in change.fields.values() {
        if let Ok(kind) = registry.get(&fc.kind) {
            kind.referenced_detached(registry, &fc.change, own_revision, out);
        }
    }
}

// --- modular operations ---

/// Composes `a` then `b` into a single changeset. Two passes: the field
/// algebras run first, posting cross-field messages; each field then consumes
/// the messages addressed to it.
pub fn compose_modular(
    registry: &FieldKindRegistry,
    a: &ModularChangeset,
    a_rev: &RevisionInfo,
    b: &ModularChangeset,
    b_rev: &RevisionInfo,
) -> ChangeResult<ModularChangeset> {
    let mut manager = CrossFieldManager::new();
    let mut change = compose_node(registry, &a.change, a_rev, &b.change, b_rev, &mut manager)?;
    consume_node(registry, &mut change, &mut manager)?;

    let mut builds = a.builds.clone();
    for (id, content) in &b.builds {
        if a.builds.iter().any(|(a_id, _)| a_id == id) {
            return Err(ChangeError::InvalidChangeset(format!(
                "both changesets build {id:?}"
            )));
        }
        builds.push((id.clone(), content.clone()));
    }
    let mut refreshers = a.refreshers.clone();
    for (id, content) in &b.refreshers {
        if !refreshers.iter().any(|(r_id, _)| r_id == id) {
            refreshers.push((id.clone(), content.clone()));
        }
    }
    let mut constraints = a.constraints.clone();
    constraints.extend(b.constraints.iter().cloned());
    Ok(ModularChangeset {
        change,
        builds,
        refreshers,
        constraints,
    })
}

/// Inverts a changeset. The inverse introduces no new subtrees; everything
/// it may revive is carried as refreshers.
pub fn invert_modular(
    registry: &FieldKindRegistry,
    a: &ModularChangeset,
    a_rev: &RevisionInfo,
) -> ChangeResult<ModularChangeset> {
    let mut manager = CrossFieldManager::new();
    let mut change = invert_node(registry, &a.change, a_rev, &mut manager)?;
    consume_node(registry, &mut change, &mut manager)?;
    let mut refreshers = a.refreshers.clone();
    for (id, content) in &a.builds {
        if !refreshers.iter().any(|(r_id, _)| r_id == id) {
            refreshers.push((id.clone(), content.clone()));
        }
    }
    Ok(ModularChangeset {
        change,
        builds: vec![],
        refreshers,
        constraints: a.constraints.clone(),
    })
}

/// Rebases `a` from its base context over `base`, re-checking constraints.
pub fn rebase_modular(
    registry: &FieldKindRegistry,
    a: &ModularChangeset,
    a_rev: &RevisionInfo,
    base: &ModularChangeset,
    base_rev: &RevisionInfo,
) -> ChangeResult<ModularChangeset> {
    let mut manager = CrossFieldManager::new();
    let mut change = rebase_node(registry, &a.change, a_rev, &base.change, base_rev, &mut manager)?;
    deliver_base_attaches(registry, &mut change, &base.change, &mut manager)?;
    consume_node(registry, &mut change, &mut manager)?;

    let base_detaches = collect_detach_ranges(&base.change);
    let constraints = a
        .constraints
        .iter()
        .map(|state| {
            let violated = state.violated
                || match &state.constraint {
                    Constraint::NodeExists(id) => range_contains(&base_detaches, id),
                };
            ConstraintState {
                constraint: state.constraint.clone(),
                violated,
            }
        })
        .collect();
    Ok(ModularChangeset {
        change,
        builds: a.builds.clone(),
        refreshers: a.refreshers.clone(),
        constraints,
    })
}

/// Rewrites the changeset so every atom id minted under `old` (or still
/// anonymous) carries `new`. Operates on a clone; idempotent when the ids
/// already carry `new`.
pub fn change_revision(
    registry: &FieldKindRegistry,
    change: &ModularChangeset,
    old: Option<&RevisionTag>,
    new: &RevisionTag,
) -> ModularChangeset {
    let mut result = change.clone();
    update_revision_node(registry, &mut result.change, old, new);
    let update_id = |id: &mut ChangeAtomId| {
        if is_own_atom(id, old) {
            id.revision = Some(new.clone());
        }
    };
    for (id, _) in &mut result.builds {
        update_id(id);
    }
    for (id, _) in &mut result.refreshers {
        update_id(id);
    }
    for state in &mut result.constraints {
        match &mut state.constraint {
            Constraint::NodeExists(id) => update_id(id),
        }
    }
    result
}

/// Detach id ranges `(first id, count)` introduced by a node changeset.
fn collect_detach_ranges(change: &NodeChangeset) -> Vec<(ChangeAtomId, u64)> {
    let mut out = vec![];
    collect_detach_ranges_into(change, &mut out);
    out
}

fn collect_detach_ranges_into(change: &NodeChangeset, out: &mut Vec<(ChangeAtomId, u64)>) {
    for fc in change.fields.values() {
        match &fc.change {
            FieldChangeset::Optional(change) => {
                if let Some(id) = change.detach_destination() {
                    out.push((id.clone(), 1));
                }
                for (_, child) in &change.child_changes {
                    collect_detach_ranges_into(child, out);
                }
            }
            FieldChangeset::Sequence(change) => {
                for mark in &change.marks {
                    if mark.cell_id.is_none() {
                        match &mark.effect {
                            MarkEffect::Remove { id } | MarkEffect::MoveOut { id } => {
                                out.push((id.clone(), mark.count));
                            }
                            _ => {}
                        }
                    }
                    if let Some(changes) = &mark.changes {
                        collect_detach_ranges_into(changes, out);
                    }
                }
            }
            FieldChangeset::Schema(_) => {}
        }
    }
}

fn range_contains(ranges: &[(ChangeAtomId, u64)], id: &ChangeAtomId) -> bool {
    ranges.iter().any(|(first, count)| {
        first.revision == id.revision
            && id.local_id >= first.local_id
            && u64::from(id.local_id - first.local_id) < *count
    })
}

/// A modular changeset touching a single field of the root node.
pub fn single_field(key: FieldKey, change: FieldChange) -> ModularChangeset {
    ModularChangeset::new(NodeChangeset::new().with_field(key, change))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_kind::default_registry;
    use crate::revision::{SeqNumber, SessionId};
    use crate::sequence_field::Mark;
    use crate::sequence_field::SequenceChangeset;
    use crate::tree::TreeNodeType;

    fn atom(local_id: u32) -> ChangeAtomId {
        ChangeAtomId::anonymous(local_id)
    }

    fn leaf(value: i64) -> TreeNode {
        TreeNode::leaf(TreeNodeType::new("number"), TreeValue::Int(value))
    }

    fn untagged() -> RevisionInfo {
        RevisionInfo::untagged()
    }

    #[test]
    fn test_compose_disjoint_fields_unions() {
        let registry = default_registry();
        let a = single_field(
            FieldKey::new("foo"),
            FieldChange::sequence(SequenceChangeset::insert_at(0, atom(0), vec![leaf(1)])),
        );
        let b = single_field(
            FieldKey::new("bar"),
            FieldChange::sequence(SequenceChangeset::insert_at(0, atom(0), vec![leaf(2)])),
        );
        let composed = compose_modular(registry, &a, &untagged(), &b, &untagged()).unwrap();
        assert_eq!(composed.change.fields.len(), 2);
    }

    #[test]
    fn test_compose_rejects_duplicate_builds() {
        let registry = default_registry();
        let a = ModularChangeset::noop().with_build(atom(1), vec![leaf(1)]);
        let b = ModularChangeset::noop().with_build(atom(1), vec![leaf(2)]);
        assert_matches::assert_matches!(
            compose_modular(registry, &a, &untagged(), &b, &untagged()),
            Err(ChangeError::InvalidChangeset(_))
        );
    }

    #[test]
    fn test_invert_carries_builds_as_refreshers() {
        let registry = default_registry();
        let change = single_field(
            FieldKey::new("foo"),
            FieldChange::sequence(SequenceChangeset::insert_at(0, atom(0), vec![leaf(1)])),
        )
        .with_build(atom(0), vec![leaf(1)]);
        let inverse = invert_modular(registry, &change, &untagged()).unwrap();
        assert!(inverse.builds.is_empty());
        assert_eq!(inverse.refresher_content(&atom(0)), Some(&[leaf(1)][..]));
    }

    #[test]
    fn test_value_change_composes_end_to_end() {
        let registry = default_registry();
        let a = ModularChangeset::new(
            NodeChangeset::new()
                .with_value_change(ValueChange::set(Some(TreeValue::Int(1)), TreeValue::Int(2))),
        );
        let b = ModularChangeset::new(
            NodeChangeset::new()
                .with_value_change(ValueChange::set(Some(TreeValue::Int(2)), TreeValue::Int(3))),
        );
        let composed = compose_modular(registry, &a, &untagged(), &b, &untagged()).unwrap();
        assert_eq!(
            composed.change.value_change,
            Some(ValueChange {
                old: Some(TreeValue::Int(1)),
                new: Some(TreeValue::Int(3)),
            })
        );
    }

    #[test]
    fn test_rebase_violates_constraint_when_base_detaches_target() {
        let registry = default_registry();
        let base_rev_tag = RevisionTag::sequenced(SeqNumber(1));
        let base = single_field(
            FieldKey::new("foo"),
            FieldChange::sequence(SequenceChangeset::remove_at(
                0,
                2,
                ChangeAtomId::new(base_rev_tag.clone(), 4),
            )),
        );
        let ours = single_field(
            FieldKey::new("bar"),
            FieldChange::sequence(SequenceChangeset::new(vec![
                Mark::skip(0),
                Mark::insert(atom(0), vec![leaf(1)]),
            ])),
        )
        .with_constraint(Constraint::NodeExists(ChangeAtomId::new(
            base_rev_tag.clone(),
            5,
        )));
        let base_rev = RevisionInfo::new(
            base_rev_tag,
            crate::id_compressor::OrderKey::new(SessionId::new(1), 0),
        );
        let rebased = rebase_modular(registry, &ours, &untagged(), &base, &base_rev).unwrap();
        assert!(rebased.is_violated());
    }

    #[test]
    fn test_change_revision_is_idempotent() {
        let registry = default_registry();
        let change = single_field(
            FieldKey::new("foo"),
            FieldChange::sequence(SequenceChangeset::remove_at(0, 1, atom(7))),
        );
        let new_tag = RevisionTag::sequenced(SeqNumber(3));
        let once = change_revision(registry, &change, None, &new_tag);
        let twice = change_revision(registry, &once, Some(&new_tag), &new_tag);
        assert_eq!(once, twice);
        let FieldChangeset::Sequence(seq) =
            &once.change.fields[&FieldKey::new("foo")].change
        else {
            panic!("expected sequence change");
        };
        assert_eq!(
            seq.marks.last().unwrap().effect,
            MarkEffect::Remove {
                id: ChangeAtomId::new(new_tag.clone(), 7)
            }
        );
    }
}
