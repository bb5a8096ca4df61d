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
use arbor_lib::enricher::ChangeEnricher;
use arbor_lib::field_kind::default_registry;
use arbor_lib::forest::Forest as _;
use arbor_lib::modular::{single_field, FieldChange, ModularChangeset};
use arbor_lib::revision::{ChangeAtomId, RevisionTag, SeqNumber, SessionId};
use arbor_lib::sequence_field::SequenceChangeset;
use arbor_lib::tree::FieldKey;
use testutils::{int_forest, number_leaf};

#[test]
fn test_enricher_attaches_refreshers_for_revives() {
    let foo = FieldKey::new("foo");
    let mut forest = int_forest(&foo, &[7]);
    let mut index = DetachedFieldIndex::new();
    let registry = default_registry();

    // An earlier sequenced commit removed the node.
    let r1 = RevisionTag::sequenced(SeqNumber(1));
    let removed_atom = ChangeAtomId::new(r1.clone(), 0);
    let remove = single_field(
        foo.clone(),
        FieldChange::sequence(SequenceChangeset::remove_at(0, 1, removed_atom.clone())),
    );
    let delta = derive_delta(registry, &remove, Some(&r1), &mut index).unwrap();
    forest.apply_delta(&delta).unwrap();

    // An outbound local commit revives it; the enricher must make the commit
    // self-contained.
    let own = RevisionTag::anonymous(SessionId::new(1), 0);
    let mut revive = single_field(
        foo.clone(),
        FieldChange::sequence(SequenceChangeset::revive_at(0, removed_atom.clone(), 1)),
    );
    let enricher = ChangeEnricher::new(&forest, &index);
    enricher
        .enrich(registry, &mut revive, Some(&own))
        .unwrap();
    assert_eq!(
        revive.refresher_content(&removed_atom),
        Some(&[number_leaf(7)][..])
    );
}

#[test]
fn test_enricher_skips_content_the_changeset_builds() {
    let foo = FieldKey::new("foo");
    let forest = int_forest(&foo, &[]);
    let index = DetachedFieldIndex::new();
    let registry = default_registry();

    let own = RevisionTag::anonymous(SessionId::new(1), 0);
    let built = ChangeAtomId::new(own.clone(), 0);
    let mut change = single_field(
        foo.clone(),
        FieldChange::sequence(SequenceChangeset::insert_at(
            0,
            built.clone(),
            vec![number_leaf(1)],
        )),
    )
    .with_build(built, vec![number_leaf(1)]);
    let enricher = ChangeEnricher::new(&forest, &index);
    enricher.enrich(registry, &mut change, Some(&own)).unwrap();
    assert!(change.refreshers.is_empty());
}

#[test]
fn test_mutable_enricher_sees_speculative_tip_content() {
    let foo = FieldKey::new("foo");
    let forest = int_forest(&foo, &[]);
    let index = DetachedFieldIndex::new();
    let registry = default_registry();

    // A transaction tip built a subtree the forest has not seen yet.
    let tip_rev = RevisionTag::anonymous(SessionId::new(1), 0);
    let built = ChangeAtomId::new(tip_rev.clone(), 0);
    let tip_change = ModularChangeset::noop().with_build(built.clone(), vec![number_leaf(9)]);

    let enricher = ChangeEnricher::new(&forest, &index);
    let mut fork = enricher.fork();
    fork.apply_tip_change(&tip_change);

    // A later change in the same transaction references that subtree.
    let own = RevisionTag::anonymous(SessionId::new(1), 1);
    let mut change = single_field(
        foo.clone(),
        FieldChange::sequence(SequenceChangeset::revive_at(0, built.clone(), 1)),
    );
    fork.enrich(registry, &mut change, Some(&own)).unwrap();
    assert_eq!(
        change.refresher_content(&built),
        Some(&[number_leaf(9)][..])
    );
}
