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

use arbor_lib::edit_manager::EditManagerError;
use arbor_lib::modular::TaggedChange;
use arbor_lib::revision::{ChangeAtomId, RevisionTag, SeqNumber, SessionId};
use arbor_lib::tree::{FieldKey, TreeValue};
use assert_matches::assert_matches;
use itertools::Itertools as _;
use testutils::{insert_change, int_forest, new_manager, remove_change, TestForest};

fn strings(forest: &TestForest, key: &FieldKey) -> Vec<String> {
    forest
        .field_values(key)
        .into_iter()
        .filter_map(|value| match value {
            TreeValue::String(s) => Some(s),
            _ => None,
        })
        .collect_vec()
}

fn string_forest(key: &FieldKey) -> TestForest {
    int_forest(key, &[])
}

#[test]
fn test_sandwich_rebase_converges_to_trunk_plus_local() {
    let foo = FieldKey::new("foo");
    let mut manager = new_manager(1, string_forest(&foo));
    let peer = SessionId::new(2);

    // Local edit before seeing anything from the peer.
    manager
        .add_local_change(insert_change(&foo, 0, &["z"]))
        .unwrap();
    assert_eq!(strings(manager.forest(), &foo), ["z"]);

    // The peer inserted "x" at 0 and then "y" at 1, sequenced as 1 and 2.
    let c1 = TaggedChange::new(
        RevisionTag::anonymous(peer, 0),
        insert_change(&foo, 0, &["x"]),
    );
    manager
        .add_sequenced_change(&c1, peer, SeqNumber(1), SeqNumber(0))
        .unwrap();
    assert_eq!(strings(manager.forest(), &foo), ["z", "x"]);

    let c2 = TaggedChange::new(
        RevisionTag::anonymous(peer, 1),
        insert_change(&foo, 1, &["y"]),
    );
    manager
        .add_sequenced_change(&c2, peer, SeqNumber(2), SeqNumber(1))
        .unwrap();
    assert_eq!(strings(manager.forest(), &foo), ["z", "x", "y"]);
    assert_eq!(manager.trunk_len(), 2);
    assert_eq!(manager.local_len(), 1);
}

#[test]
fn test_own_echo_is_an_empty_delta() {
    let foo = FieldKey::new("foo");
    let mut manager = new_manager(1, string_forest(&foo));
    let tagged = manager
        .add_local_change(insert_change(&foo, 0, &["a"]))
        .unwrap();
    let delta = manager
        .add_sequenced_change(&tagged, manager.session(), SeqNumber(1), SeqNumber(0))
        .unwrap();
    assert!(delta.root.is_empty());
    assert_eq!(manager.trunk_len(), 1);
    assert_eq!(manager.local_len(), 0);
    assert_eq!(strings(manager.forest(), &foo), ["a"]);
}

#[test]
fn test_concurrent_inserts_converge_across_replicas() {
    let foo = FieldKey::new("foo");
    let mut replica_a = new_manager(1, string_forest(&foo));
    let mut replica_b = new_manager(2, string_forest(&foo));

    let a1 = replica_a
        .add_local_change(insert_change(&foo, 0, &["a1"]))
        .unwrap();
    let b1 = replica_b
        .add_local_change(insert_change(&foo, 0, &["b1"]))
        .unwrap();

    // The sequencer orders a1 before b1; both replicas ingest both.
    replica_a
        .add_sequenced_change(&a1, replica_a.session(), SeqNumber(1), SeqNumber(0))
        .unwrap();
    replica_a
        .add_sequenced_change(&b1, SessionId::new(2), SeqNumber(2), SeqNumber(0))
        .unwrap();
    replica_b
        .add_sequenced_change(&a1, SessionId::new(1), SeqNumber(1), SeqNumber(0))
        .unwrap();
    replica_b
        .add_sequenced_change(&b1, replica_b.session(), SeqNumber(2), SeqNumber(0))
        .unwrap();

    // The final order is decided by the revision-tag comparison, the same on
    // both replicas.
    assert_eq!(strings(replica_a.forest(), &foo), ["a1", "b1"]);
    assert_eq!(
        strings(replica_a.forest(), &foo),
        strings(replica_b.forest(), &foo)
    );
}

#[test]
fn test_undo_restores_the_forest() {
    let foo = FieldKey::new("foo");
    let mut manager = new_manager(1, string_forest(&foo));
    let edit = manager
        .add_local_change(insert_change(&foo, 0, &["n"]))
        .unwrap();
    assert_eq!(strings(manager.forest(), &foo), ["n"]);

    manager.undo(&edit.revision).unwrap();
    assert_eq!(strings(manager.forest(), &foo), Vec::<String>::new());
    assert!(manager.has_rollback(&edit.revision));
    assert_eq!(manager.local_len(), 2);
}

#[test]
fn test_out_of_order_sequencing_is_rejected() {
    let foo = FieldKey::new("foo");
    let mut manager = new_manager(1, string_forest(&foo));
    let peer = SessionId::new(2);
    let change = TaggedChange::new(
        RevisionTag::anonymous(peer, 0),
        insert_change(&foo, 0, &["x"]),
    );
    assert_matches!(
        manager.add_sequenced_change(&change, peer, SeqNumber(5), SeqNumber(0)),
        Err(EditManagerError::UnexpectedSeqNum { .. })
    );
}

#[test]
fn test_transaction_commit_squashes_into_one_commit() {
    let foo = FieldKey::new("foo");
    let mut manager = new_manager(1, string_forest(&foo));
    manager.start_transaction();
    manager
        .add_local_change(insert_change(&foo, 0, &["a"]))
        .unwrap();
    manager
        .add_local_change(insert_change(&foo, 1, &["b"]))
        .unwrap();
    let squashed = manager.commit_transaction().unwrap().unwrap();
    assert_eq!(manager.local_len(), 1);
    assert_eq!(strings(manager.forest(), &foo), ["a", "b"]);

    // The squashed commit sequences like any other local commit.
    let delta = manager
        .add_sequenced_change(&squashed, manager.session(), SeqNumber(1), SeqNumber(0))
        .unwrap();
    assert!(delta.root.is_empty());
    assert_eq!(manager.local_len(), 0);
}

#[test]
fn test_transaction_abort_rolls_the_forest_back() {
    let foo = FieldKey::new("foo");
    let mut manager = new_manager(1, string_forest(&foo));
    manager
        .add_local_change(insert_change(&foo, 0, &["keep"]))
        .unwrap();
    manager.start_transaction();
    manager
        .add_local_change(insert_change(&foo, 0, &["drop"]))
        .unwrap();
    assert_eq!(strings(manager.forest(), &foo), ["drop", "keep"]);

    let delta = manager.abort_transaction().unwrap();
    assert!(!delta.root.is_empty());
    assert_eq!(strings(manager.forest(), &foo), ["keep"]);
    assert_eq!(manager.local_len(), 1);
}

#[test]
fn test_abort_without_transaction_is_an_error() {
    let foo = FieldKey::new("foo");
    let mut manager = new_manager(1, string_forest(&foo));
    assert_matches!(
        manager.abort_transaction(),
        Err(EditManagerError::NoTransaction)
    );
}

#[test]
fn test_advance_peer_evicts_trunk_and_detached_state() {
    let foo = FieldKey::new("foo");
    let mut manager = new_manager(1, int_forest(&foo, &[1, 2, 3]));
    let peer = SessionId::new(2);

    let r1 = TaggedChange::new(RevisionTag::anonymous(peer, 0), remove_change(&foo, 0, 1));
    manager
        .add_sequenced_change(&r1, peer, SeqNumber(1), SeqNumber(0))
        .unwrap();
    let r2 = TaggedChange::new(RevisionTag::anonymous(peer, 1), remove_change(&foo, 0, 1));
    manager
        .add_sequenced_change(&r2, peer, SeqNumber(2), SeqNumber(1))
        .unwrap();
    assert_eq!(manager.trunk_len(), 2);
    let seq1_atom = ChangeAtomId::new(RevisionTag::sequenced(SeqNumber(1)), 0);
    assert!(manager.detached_field_index().get(&seq1_atom).is_some());

    // The only peer has observed up to 2; the seq-1 commit and its detached
    // state can go.
    manager.advance_peer(peer, SeqNumber(2));
    assert_eq!(manager.min_retained(), SeqNumber(2));
    assert_eq!(manager.trunk_len(), 1);
    assert_eq!(manager.detached_field_index().get(&seq1_atom), None);
}
