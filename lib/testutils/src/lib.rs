// Copyright 2022 The Arbor Authors
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

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use arbor_lib::delta::{Delta, DeltaMark, NodeDelta};
use arbor_lib::detached::ForestRootId;
use arbor_lib::edit_manager::EditManager;
use arbor_lib::forest::{Forest, ForestError, ForestResult};
use arbor_lib::modular::{FieldChange, ModularChangeset, NodeChangeset, ValueChange};
use arbor_lib::revision::{ChangeAtomId, RevisionTag, SessionId};
use arbor_lib::sequence_field::{Mark, SequenceChangeset};
use arbor_lib::tree::{FieldKey, TreeNode, TreeNodeType, TreeValue};
use itertools::Itertools as _;
use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;

pub fn number_leaf(value: i64) -> TreeNode {
    TreeNode::leaf(TreeNodeType::new("number"), TreeValue::Int(value))
}

pub fn string_leaf(value: &str) -> TreeNode {
    TreeNode::leaf(
        TreeNodeType::new("string"),
        TreeValue::String(value.to_string()),
    )
}

pub fn object_node() -> TreeNode {
    TreeNode::new(TreeNodeType::new("object"))
}

/// A forest whose root holds `values` as number leaves under `field`.
pub fn int_forest(field: &FieldKey, values: &[i64]) -> TestForest {
    let root =
        object_node().with_field(field.clone(), values.iter().copied().map(number_leaf).collect());
    TestForest::new(root)
}

pub fn new_manager(session: u128, forest: TestForest) -> EditManager<TestForest> {
    EditManager::new(SessionId::new(session), forest)
}

/// In-memory forest used by the scenario tests.
///
/// Besides the live tree and the detached store, it records repair data at
/// delta-application time: snapshots of detached subtrees and overwritten
/// leaf values, keyed by the revision that displaced them.
#[derive(Clone, Debug)]
pub struct TestForest {
    root: TreeNode,
    detached: BTreeMap<u64, TreeNode>,
    detach_log: HashMap<(RevisionTag, FieldKey, u64), TreeNode>,
    value_log: HashMap<(RevisionTag, FieldKey, u64), Option<TreeValue>>,
}

impl TestForest {
    pub fn new(root: TreeNode) -> Self {
        TestForest {
            root,
            detached: BTreeMap::new(),
            detach_log: HashMap::new(),
            value_log: HashMap::new(),
        }
    }

    pub fn root(&self) -> &TreeNode {
        &self.root
    }

    pub fn field(&self, key: &FieldKey) -> &[TreeNode] {
        self.root.field(key)
    }

    /// The leaf values of a root field, for compact assertions.
    pub fn field_values(&self, key: &FieldKey) -> Vec<TreeValue> {
        self.root
            .field(key)
            .iter()
            .filter_map(|node| node.value.clone())
            .collect_vec()
    }

    /// Snapshots of the nodes a revision detached from `field`, in field
    /// order starting at `start`.
    pub fn detached_nodes(
        &self,
        revision: &RevisionTag,
        field: &FieldKey,
        start: u64,
        count: u64,
    ) -> Vec<TreeNode> {
        (start..start + count)
            .filter_map(|index| {
                self.detach_log
                    .get(&(revision.clone(), field.clone(), index))
                    .cloned()
            })
            .collect_vec()
    }

    /// The pre-change value of `field[index]` as-of `revision`, if that
    /// revision overwrote it.
    pub fn saved_value(
        &self,
        revision: &RevisionTag,
        field: &FieldKey,
        index: u64,
    ) -> Option<Option<TreeValue>> {
        self.value_log
            .get(&(revision.clone(), field.clone(), index))
            .cloned()
    }

    pub fn detached_count(&self) -> usize {
        self.detached.len()
    }

    fn apply_node(
        &mut self,
        path: &mut TreeNode,
        delta: &NodeDelta,
        revision: Option<&RevisionTag>,
        context: Option<(&FieldKey, u64)>,
    ) -> ForestResult<()> {
        if let Some(replace) = &delta.value {
            if let (Some(revision), Some((field, index))) = (revision, context) {
                self.value_log
                    .insert((revision.clone(), field.clone(), index), replace.old.clone());
            }
            path.value = replace.new.clone();
        }
        // A move across sibling fields may list the attaching field before
        // the detaching one; fields whose roots are not there yet retry
        // after the rest. Replaying a field from a fresh cell snapshot is
        // idempotent.
        let mut pending: Vec<(FieldKey, arbor_lib::delta::FieldDelta)> =
            delta.fields.clone().into_iter().collect();
        while !pending.is_empty() {
            let mut deferred = vec![];
            let mut progressed = false;
            for (key, field_delta) in pending {
                let mut cells = path.field(&key).to_vec();
                match self.apply_field(&mut cells, &field_delta.marks, &key, revision) {
                    Ok(()) => {
                        *path.field_mut(&key) = cells;
                        progressed = true;
                    }
                    Err(ForestError::UnknownRoot(_)) => deferred.push((key, field_delta)),
                    Err(err) => return Err(err),
                }
            }
            if !progressed {
                // No field can make the missing roots appear; surface the
                // failure.
                let (key, field_delta) = deferred.remove(0);
                let mut cells = path.field(&key).to_vec();
                self.apply_field(&mut cells, &field_delta.marks, &key, revision)?;
                *path.field_mut(&key) = cells;
            }
            pending = deferred;
        }
        Ok(())
    }

    fn apply_field(
        &mut self,
        cells: &mut Vec<TreeNode>,
        marks: &[DeltaMark],
        key: &FieldKey,
        revision: Option<&RevisionTag>,
    ) -> ForestResult<()> {
        let mut cursor: usize = 0;
        // Detach indices are reported in the field's pre-delta coordinates.
        let mut consumed: u64 = 0;
        for mark in marks {
            match mark {
                DeltaMark::Skip(count) => {
                    cursor += *count as usize;
                    consumed += count;
                }
                DeltaMark::Attach { id, count } => {
                    for k in 0..*count {
                        let node = self
                            .detached
                            .remove(&(id.0 + k))
                            .ok_or(ForestError::UnknownRoot(ForestRootId(id.0 + k)))?;
                        cells.insert(cursor + k as usize, node);
                    }
                    cursor += *count as usize;
                }
                DeltaMark::Detach { id, count } => {
                    for k in 0..*count {
                        // A reservation-backed detach is conditional on the
                        // field being occupied.
                        if cursor >= cells.len() {
                            break;
                        }
                        let node = cells.remove(cursor);
                        if let Some(revision) = revision {
                            self.detach_log.insert(
                                (revision.clone(), key.clone(), consumed + k),
                                node.clone(),
                            );
                        }
                        self.detached.insert(id.0 + k, node);
                    }
                    consumed += count;
                }
                DeltaMark::Rename { from, to, count } => {
                    for k in 0..*count {
                        if let Some(node) = self.detached.remove(&(from.0 + k)) {
                            self.detached.insert(to.0 + k, node);
                        }
                    }
                }
                DeltaMark::Modify(node_delta) => {
                    if cursor >= cells.len() {
                        return Err(ForestError::Malformed(format!(
                            "modify past the end of field {key:?}"
                        )));
                    }
                    let mut node = cells[cursor].clone();
                    self.apply_node(&mut node, node_delta, revision, Some((key, consumed)))?;
                    cells[cursor] = node;
                    cursor += 1;
                    consumed += 1;
                }
            }
        }
        Ok(())
    }
}

impl Forest for TestForest {
    fn apply_delta(&mut self, delta: &Delta) -> ForestResult<()> {
        for (root_id, content) in &delta.builds {
            for (k, node) in content.iter().enumerate() {
                self.detached.insert(root_id.0 + k as u64, node.clone());
            }
        }
        // Edits to roots the delta itself detaches can only run after the
        // marks have; everything else runs up front.
        let mut deferred_edits = vec![];
        for (root_id, node_delta) in &delta.detached_edits {
            match self.detached.get(&root_id.0).cloned() {
                Some(mut node) => {
                    self.apply_node(&mut node, node_delta, delta.revision.as_ref(), None)?;
                    self.detached.insert(root_id.0, node);
                }
                None => deferred_edits.push((root_id, node_delta)),
            }
        }
        let mut root = self.root.clone();
        self.apply_node(&mut root, &delta.root, delta.revision.as_ref(), None)?;
        self.root = root;
        for (root_id, node_delta) in deferred_edits {
            // A root consumed by an attach carries its changes in the live
            // marks instead.
            if let Some(mut node) = self.detached.get(&root_id.0).cloned() {
                self.apply_node(&mut node, node_delta, delta.revision.as_ref(), None)?;
                self.detached.insert(root_id.0, node);
            }
        }
        Ok(())
    }

    fn build_detached_field(&mut self, id: ForestRootId, content: Vec<TreeNode>) {
        for (k, node) in content.into_iter().enumerate() {
            self.detached.insert(id.0 + k as u64, node);
        }
    }

    fn detached_content(&self, id: ForestRootId, count: u64) -> Option<Vec<TreeNode>> {
        (0..count)
            .map(|k| self.detached.get(&(id.0 + k)).cloned())
            .collect()
    }

    fn forget_detached(&mut self, id: ForestRootId, count: u64) {
        for k in 0..count {
            self.detached.remove(&(id.0 + k));
        }
    }
}

// --- random changesets for the algebra-law tests ---

pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// A random mark list over a field of `input_len` live cells, drawing from
/// the full mark vocabulary.
pub fn random_sequence_changeset(
    rng: &mut ChaCha8Rng,
    input_len: u64,
    next_atom: &mut u32,
) -> SequenceChangeset {
    let mut marks = vec![];
    let mut remaining = input_len;
    while remaining > 0 {
        let count = rng.gen_range(1..=remaining);
        match rng.gen_range(0..3) {
            0 => marks.push(Mark::skip(count)),
            1 => {
                marks.push(Mark::remove(ChangeAtomId::anonymous(*next_atom), count));
                *next_atom += count as u32;
            }
            _ => {
                let content = (0..count)
                    .map(|k| number_leaf((*next_atom as i64) * 100 + k as i64))
                    .collect();
                marks.push(Mark::insert(ChangeAtomId::anonymous(*next_atom), content));
                *next_atom += count as u32;
                marks.push(Mark::skip(count));
            }
        }
        remaining -= count;
    }
    SequenceChangeset::new(marks)
}

/// A random mark list using only occupancy-preserving and detach marks, for
/// laws that require a structural round trip.
pub fn random_detach_changeset(
    rng: &mut ChaCha8Rng,
    input_len: u64,
    next_atom: &mut u32,
) -> SequenceChangeset {
    let mut marks = vec![];
    let mut remaining = input_len;
    while remaining > 0 {
        let count = rng.gen_range(1..=remaining);
        if rng.gen_bool(0.5) {
            marks.push(Mark::skip(count));
        } else {
            marks.push(Mark::remove(ChangeAtomId::anonymous(*next_atom), count));
            *next_atom += count as u32;
        }
        remaining -= count;
    }
    SequenceChangeset::new(marks)
}

/// A modular changeset inserting `values` at `index` of a root sequence
/// field.
pub fn insert_change(
    field: &FieldKey,
    index: u64,
    values: &[&str],
) -> ModularChangeset {
    let content = values.iter().map(|v| string_leaf(v)).collect_vec();
    ModularChangeset::new(NodeChangeset::new().with_field(
        field.clone(),
        FieldChange::sequence(SequenceChangeset::insert_at(
            index,
            ChangeAtomId::anonymous(0),
            content,
        )),
    ))
}

/// A modular changeset removing `count` cells at `index` of a root sequence
/// field.
pub fn remove_change(field: &FieldKey, index: u64, count: u64) -> ModularChangeset {
    ModularChangeset::new(NodeChangeset::new().with_field(
        field.clone(),
        FieldChange::sequence(SequenceChangeset::remove_at(
            index,
            count,
            ChangeAtomId::anonymous(0),
        )),
    ))
}

/// A modular changeset moving one node from `src_field[src_index]` to
/// `dst_field[dst_index]` of the same parent node.
pub fn cross_field_move(
    src_field: &FieldKey,
    src_index: u64,
    dst_field: &FieldKey,
    dst_index: u64,
) -> ModularChangeset {
    let id = ChangeAtomId::anonymous(0);
    ModularChangeset::new(
        NodeChangeset::new()
            .with_field(
                src_field.clone(),
                FieldChange::sequence(SequenceChangeset::new(vec![
                    Mark::skip(src_index),
                    Mark::move_out(id.clone(), 1),
                ])),
            )
            .with_field(
                dst_field.clone(),
                FieldChange::sequence(SequenceChangeset::new(vec![
                    Mark::skip(dst_index),
                    Mark::move_in(id, 1),
                ])),
            ),
    )
}

/// A modular changeset replacing the value of `field[index]`.
pub fn set_value_change(
    field: &FieldKey,
    index: u64,
    old: Option<TreeValue>,
    new: Option<TreeValue>,
) -> ModularChangeset {
    let value_change = ValueChange { old, new };
    ModularChangeset::new(NodeChangeset::new().with_field(
        field.clone(),
        FieldChange::sequence(SequenceChangeset::modify_at(
            index,
            NodeChangeset::new().with_value_change(value_change),
        )),
    ))
}

pub fn assert_no_forgotten_test_files(test_dir: &Path) {
    let runner_path = test_dir.join("runner.rs");
    let runner = fs::read_to_string(&runner_path).unwrap();
    let entries = fs::read_dir(test_dir).unwrap();
    for entry in entries {
        let path = entry.unwrap().path();
        if let Some(ext) = path.extension() {
            let name = path.file_stem().unwrap();
            if ext == "rs" && name != "runner" {
                let search = format!("mod {};", name.to_str().unwrap());
                assert!(
                    runner.contains(&search),
                    "missing `{search}` declaration in {}",
                    runner_path.display()
                );
            }
        }
    }
}
