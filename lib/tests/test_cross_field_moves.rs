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

//! Moves whose source and destination are different fields of the same
//! node, coordinated through the cross-field manager.

use arbor_lib::field_kind::{default_registry, FieldChangeset, RevisionInfo};
use arbor_lib::id_compressor::OrderKey;
use arbor_lib::modular::{
    change_revision, compose_modular, rebase_modular, FieldChange, ModularChangeset,
    NodeChangeset, TaggedChange, ValueChange,
};
use arbor_lib::revision::{RevisionTag, SeqNumber, SessionId};
use arbor_lib::sequence_field::{MarkEffect, SequenceChangeset};
use arbor_lib::tree::{FieldKey, TreeValue};
use testutils::{cross_field_move, new_manager, number_leaf, object_node, TestForest};

fn value_edit(old: i64, new: i64) -> NodeChangeset {
    NodeChangeset::new().with_value_change(ValueChange {
        old: Some(TreeValue::Int(old)),
        new: Some(TreeValue::Int(new)),
    })
}

fn modify_field(key: &FieldKey, index: u64, edit: NodeChangeset) -> ModularChangeset {
    ModularChangeset::new(NodeChangeset::new().with_field(
        key.clone(),
        FieldChange::sequence(SequenceChangeset::modify_at(index, edit)),
    ))
}

fn as_sequence(change: &FieldChangeset) -> &SequenceChangeset {
    match change {
        FieldChangeset::Sequence(change) => change,
        other => panic!("expected a sequence changeset, got {other:?}"),
    }
}

#[test]
fn test_compose_routes_child_changes_to_move_source_field() {
    let registry = default_registry();
    let left = FieldKey::new("left");
    let right = FieldKey::new("right");
    // a moves a node from `left` to `right`; b edits it at its new home.
    let a = cross_field_move(&left, 0, &right, 0);
    let b = modify_field(&right, 0, value_edit(7, 8));
    let composed = compose_modular(
        registry,
        &a,
        &RevisionInfo::untagged(),
        &b,
        &RevisionInfo::untagged(),
    )
    .unwrap();

    // The nested change ends up with the field that owns the source cells,
    // riding on the move-out.
    let source = as_sequence(&composed.change.fields[&left].change);
    let move_out = &source.marks[0];
    assert!(matches!(move_out.effect, MarkEffect::MoveOut { .. }));
    assert_eq!(
        move_out.changes.as_ref().and_then(|c| c.value_change.clone()),
        Some(ValueChange {
            old: Some(TreeValue::Int(7)),
            new: Some(TreeValue::Int(8)),
        })
    );
    // The destination side keeps the attach but not a second copy of the
    // changes.
    let destination = as_sequence(&composed.change.fields[&right].change);
    let move_in = &destination.marks[0];
    assert!(matches!(move_in.effect, MarkEffect::MoveIn { .. }));
    assert_eq!(move_in.changes, None);
}

#[test]
fn test_rebase_delivers_changes_at_base_cross_field_attach() {
    let registry = default_registry();
    let left = FieldKey::new("left");
    let right = FieldKey::new("right");
    // The base (sequenced) moved the node from `left` to `right`; our
    // unsequenced change edits it at its old home.
    let base_tag = RevisionTag::sequenced(SeqNumber(1));
    let base = change_revision(
        registry,
        &cross_field_move(&left, 0, &right, 0),
        None,
        &base_tag,
    );
    let ours = modify_field(&left, 0, value_edit(7, 8));
    let rebased = rebase_modular(
        registry,
        &ours,
        &RevisionInfo::anonymous(SessionId::new(9), 0),
        &base,
        &RevisionInfo::new(base_tag, OrderKey::new(SessionId::new(1), 0)),
    )
    .unwrap();

    // The edit followed the node into the destination field.
    assert!(!rebased.change.fields.contains_key(&left));
    let destination = as_sequence(&rebased.change.fields[&right].change);
    assert_eq!(destination.marks.len(), 1);
    let mark = &destination.marks[0];
    assert!(matches!(mark.effect, MarkEffect::Skip));
    assert_eq!(
        mark.changes.as_ref().and_then(|c| c.value_change.clone()),
        Some(ValueChange {
            old: Some(TreeValue::Int(7)),
            new: Some(TreeValue::Int(8)),
        })
    );
}

#[test]
fn test_local_edit_survives_inbound_cross_field_move() {
    let left = FieldKey::new("left");
    let right = FieldKey::new("right");
    let root = object_node()
        .with_field(left.clone(), vec![number_leaf(7)])
        .with_field(right.clone(), vec![]);
    let mut manager = new_manager(1, TestForest::new(root));
    let peer = SessionId::new(2);

    // Local edit of the node while a peer concurrently moves it to the
    // sibling field.
    manager
        .add_local_change(testutils::set_value_change(
            &left,
            0,
            Some(TreeValue::Int(7)),
            Some(TreeValue::Int(8)),
        ))
        .unwrap();
    assert_eq!(
        manager.forest().field_values(&left),
        vec![TreeValue::Int(8)]
    );

    let inbound = TaggedChange::new(
        RevisionTag::anonymous(peer, 0),
        cross_field_move(&left, 0, &right, 0),
    );
    manager
        .add_sequenced_change(&inbound, peer, SeqNumber(1), SeqNumber(0))
        .unwrap();

    // The node lives in the destination field and kept the local edit.
    assert!(manager.forest().field(&left).is_empty());
    assert_eq!(
        manager.forest().field_values(&right),
        vec![TreeValue::Int(8)]
    );
    assert_eq!(manager.local_len(), 1);
}
