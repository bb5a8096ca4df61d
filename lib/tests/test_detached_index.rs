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

use arbor_lib::delta::derive_delta;
use arbor_lib::detached::DetachedFieldIndex;
use arbor_lib::field_kind::default_registry;
use arbor_lib::forest::Forest as _;
use arbor_lib::modular::{
    single_field, FieldChange, ModularChangeset, NodeChangeset, ValueChange,
};
use arbor_lib::revision::{ChangeAtomId, RevisionTag, SeqNumber};
use arbor_lib::sequence_field::{Mark, SequenceChangeset};
use arbor_lib::tree::{FieldKey, TreeNode, TreeNodeType, TreeValue};
use testutils::{number_leaf, object_node, TestForest};

fn sequenced(seq: u64) -> RevisionTag {
    RevisionTag::sequenced(SeqNumber(seq))
}

fn remove_tagged(field: &FieldKey, index: u64, count: u64, rev: &RevisionTag) -> ModularChangeset {
    single_field(
        field.clone(),
        FieldChange::sequence(SequenceChangeset::remove_at(
            index,
            count,
            ChangeAtomId::new(rev.clone(), 0),
        )),
    )
}

#[test]
fn test_captures_deleted_nodes() {
    let foo = FieldKey::new("foo");
    let bar = FieldKey::new("bar");
    // foo = [0, 1, {bar: 2}, 3]
    let object_child = object_node().with_field(bar.clone(), vec![number_leaf(2)]);
    let root = object_node().with_field(
        foo.clone(),
        vec![number_leaf(0), number_leaf(1), object_child.clone(), number_leaf(3)],
    );
    let mut forest = TestForest::new(root);
    let mut index = DetachedFieldIndex::new();
    let registry = default_registry();

    // Delete indices 1..3 under revision R1.
    let r1 = sequenced(1);
    let change = remove_tagged(&foo, 1, 2, &r1);
    let delta = derive_delta(registry, &change, Some(&r1), &mut index).unwrap();
    forest.apply_delta(&delta).unwrap();
    assert_eq!(
        forest.field_values(&foo),
        vec![TreeValue::Int(0), TreeValue::Int(3)]
    );

    // The two detached subtrees are queryable in order.
    let detached = forest.detached_nodes(&r1, &foo, 1, 2);
    assert_eq!(detached, vec![number_leaf(1), object_child]);
    // The index resolves both atom ids.
    assert!(index.get(&ChangeAtomId::new(r1.clone(), 0)).is_some());
    assert!(index.get(&ChangeAtomId::new(r1.clone(), 1)).is_some());

    // A second delete on the updated tree, under R2.
    let r2 = sequenced(2);
    let change = remove_tagged(&foo, 1, 1, &r2);
    let delta = derive_delta(registry, &change, Some(&r2), &mut index).unwrap();
    forest.apply_delta(&delta).unwrap();
    assert_eq!(forest.field_values(&foo), vec![TreeValue::Int(0)]);

    // Queries against each revision return the snapshot as-of that revision.
    assert_eq!(forest.detached_nodes(&r2, &foo, 1, 1), vec![number_leaf(3)]);
    assert_eq!(
        forest.detached_nodes(&r1, &foo, 1, 2),
        vec![number_leaf(1), object_node().with_field(bar, vec![number_leaf(2)])]
    );
}

#[test]
fn test_overwritten_values() {
    let foo = FieldKey::new("foo");
    // foo = [undefined, 1, 2, 3]: the first node carries no value.
    let root = object_node().with_field(
        foo.clone(),
        vec![
            TreeNode::new(TreeNodeType::new("number")),
            number_leaf(1),
            number_leaf(2),
            number_leaf(3),
        ],
    );
    let mut forest = TestForest::new(root);
    let mut index = DetachedFieldIndex::new();
    let registry = default_registry();

    // One change setting 0 -> 40, 2 -> 42, 3 -> undefined, under R1.
    let r1 = sequenced(1);
    let modify = |old: Option<i64>, new: Option<i64>| {
        Mark::modify(NodeChangeset::new().with_value_change(ValueChange {
            old: old.map(TreeValue::Int),
            new: new.map(TreeValue::Int),
        }))
    };
    let change = single_field(
        foo.clone(),
        FieldChange::sequence(SequenceChangeset::new(vec![
            modify(None, Some(40)),
            Mark::skip(1),
            modify(Some(2), Some(42)),
            modify(Some(3), None),
        ])),
    );
    let delta = derive_delta(registry, &change, Some(&r1), &mut index).unwrap();
    forest.apply_delta(&delta).unwrap();

    assert_eq!(forest.field(&foo)[0].value, Some(TreeValue::Int(40)));
    assert_eq!(forest.field(&foo)[2].value, Some(TreeValue::Int(42)));
    assert_eq!(forest.field(&foo)[3].value, None);

    // Pre-change values are queryable per revision.
    assert_eq!(forest.saved_value(&r1, &foo, 0), Some(None));
    assert_eq!(
        forest.saved_value(&r1, &foo, 2),
        Some(Some(TreeValue::Int(2)))
    );
    assert_eq!(
        forest.saved_value(&r1, &foo, 3),
        Some(Some(TreeValue::Int(3)))
    );
    // The untouched cell recorded nothing.
    assert_eq!(forest.saved_value(&r1, &foo, 1), None);
}

#[test]
fn test_revive_restores_deleted_nodes() {
    let foo = FieldKey::new("foo");
    let root = object_node().with_field(foo.clone(), vec![number_leaf(7), number_leaf(8)]);
    let mut forest = TestForest::new(root.clone());
    let mut index = DetachedFieldIndex::new();
    let registry = default_registry();

    let r1 = sequenced(1);
    let change = remove_tagged(&foo, 0, 2, &r1);
    let delta = derive_delta(registry, &change, Some(&r1), &mut index).unwrap();
    forest.apply_delta(&delta).unwrap();
    assert_eq!(forest.field_values(&foo), vec![]);

    let r2 = sequenced(2);
    let change = single_field(
        foo.clone(),
        FieldChange::sequence(SequenceChangeset::revive_at(
            0,
            ChangeAtomId::new(r1.clone(), 0),
            2,
        )),
    );
    let delta = derive_delta(registry, &change, Some(&r2), &mut index).unwrap();
    forest.apply_delta(&delta).unwrap();
    assert_eq!(forest.root(), &root);
}
