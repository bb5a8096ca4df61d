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

//! The detached-field index: the authoritative owner of removed subtrees.
//!
//! Changesets and deltas only ever hold change atom ids; this index maps them
//! to the forest-local root ids under which the forest keeps the content.
//! Root ids come from a monotone counter and survive summarize/load.

use serde::{Deserialize, Serialize};

use crate::range_map::RangeMap;
use crate::revision::{ChangeAtomId, RevisionTag};

/// Forest-local id of one detached tree root.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Debug, Serialize, Deserialize)]
pub struct ForestRootId(pub u64);

impl ForestRootId {
    pub fn offset(self, offset: u64) -> ForestRootId {
        ForestRootId(self.0 + offset)
    }
}

/// Maps change atom ids to forest root ids.
///
/// Entries are grouped per revision; within a revision, contiguous local-id
/// ranges share one entry storing the bias `root = local_id + bias`, so range
/// splits keep the association intact. A renamed id (revive-then-re-remove)
/// maps onto the root the original detach allocated, keeping the content
/// reachable through the whole cycle.
#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct DetachedFieldIndex {
    next_root_id: u64,
    entries: Vec<(Option<RevisionTag>, RangeMap<u64>)>,
}

impl DetachedFieldIndex {
    pub fn new() -> Self {
        DetachedFieldIndex::default()
    }

    fn map_for(&self, revision: &Option<RevisionTag>) -> Option<&RangeMap<u64>> {
        self.entries
            .iter()
            .find(|(rev, _)| rev == revision)
            .map(|(_, map)| map)
    }

    fn map_for_mut(&mut self, revision: &Option<RevisionTag>) -> &mut RangeMap<u64> {
        if let Some(index) = self.entries.iter().position(|(rev, _)| rev == revision) {
            return &mut self.entries[index].1;
        }
        self.entries.push((revision.clone(), RangeMap::new()));
        &mut self.entries.last_mut().unwrap().1
    }

    /// The root id of one detached tree, if the atom id is known.
    pub fn get(&self, id: &ChangeAtomId) -> Option<ForestRootId> {
        self.get_range(id, 1)
    }

    /// The root id of the first of `count` contiguous detached trees, if the
    /// whole range is known and uniform.
    pub fn get_range(&self, id: &ChangeAtomId, count: u64) -> Option<ForestRootId> {
        let map = self.map_for(&id.revision)?;
        let result = map.get_first(u64::from(id.local_id), count).ok()?;
        match result.value {
            Some(&bias) if result.length == count => {
                Some(ForestRootId(u64::from(id.local_id).wrapping_add(bias)))
            }
            _ => None,
        }
    }

    /// Looks the range up, allocating fresh contiguous root ids on first use.
    pub fn get_or_allocate(&mut self, id: &ChangeAtomId, count: u64) -> ForestRootId {
        if let Some(root) = self.get_range(id, count) {
            return root;
        }
        let root = ForestRootId(self.next_root_id);
        self.next_root_id += count;
        self.associate(id, count, root);
        root
    }

    /// Maps `id .. id+count` onto existing roots starting at `root`.
    pub fn associate(&mut self, id: &ChangeAtomId, count: u64, root: ForestRootId) {
        let bias = root.0.wrapping_sub(u64::from(id.local_id));
        self.map_for_mut(&id.revision)
            .set(u64::from(id.local_id), count, bias)
            .expect("count is positive");
    }

    /// Drops every entry minted under `revision`.
    pub fn remove_revision(&mut self, revision: &RevisionTag) {
        self.entries
            .retain(|(rev, _)| rev.as_ref() != Some(revision));
    }

    /// Rekeys the entries of `old` under `new`, as happens when a local
    /// commit is re-tagged with its sequenced revision.
    pub fn rename_revision(&mut self, old: &RevisionTag, new: &RevisionTag) {
        if old == new {
            return;
        }
        if let Some(index) = self
            .entries
            .iter()
            .position(|(rev, _)| rev.as_ref() == Some(old))
        {
            let (_, map) = self.entries.remove(index);
            let target = self.map_for_mut(&Some(new.clone()));
            for (start, length, &bias) in map.iter() {
                target.set(start, length, bias).expect("length is positive");
            }
        }
    }

    /// The `(root, count)` ranges held under `revision`, for forest cleanup.
    pub fn roots_for_revision(&self, revision: &RevisionTag) -> Vec<(ForestRootId, u64)> {
        let Some(map) = self.map_for(&Some(revision.clone())) else {
            return vec![];
        };
        map.iter()
            .map(|(start, length, &bias)| (ForestRootId(start.wrapping_add(bias)), length))
            .collect()
    }

    /// Revisions that still have live entries.
    pub fn revisions(&self) -> impl Iterator<Item = Option<&RevisionTag>> {
        self.entries.iter().map(|(rev, _)| rev.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|(_, map)| map.is_empty())
    }
}
