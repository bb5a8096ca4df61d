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

//! The change enricher: makes outbound commits self-contained by attaching
//! snapshots of the detached subtrees they reference, so peers that have
//! since evicted those subtrees can still apply them.

use std::collections::BTreeMap;

use itertools::Itertools as _;
use tracing::debug;

use crate::detached::DetachedFieldIndex;
use crate::field_kind::{ChangeResult, FieldKindRegistry};
use crate::forest::Forest;
use crate::modular::{self, ModularChangeset};
use crate::revision::{ChangeAtomId, RevisionTag};
use crate::tree::TreeNode;

/// Read-only view over the forest and the detached-field index, used to
/// attach refreshers to outbound commits.
pub struct ChangeEnricher<'a, F> {
    forest: &'a F,
    index: &'a DetachedFieldIndex,
}

impl<'a, F: Forest> ChangeEnricher<'a, F> {
    pub fn new(forest: &'a F, index: &'a DetachedFieldIndex) -> Self {
        ChangeEnricher { forest, index }
    }

    /// Copies every pre-existing detached subtree the changeset references
    /// into its `refreshers`. Ids the replica cannot resolve are left for
    /// the rebase or delta derivation to report.
    pub fn enrich(
        &self,
        registry: &FieldKindRegistry,
        change: &mut ModularChangeset,
        own_revision: Option<&RevisionTag>,
    ) -> ChangeResult<()> {
        for id in referenced_ids(registry, change, own_revision) {
            if let Some(content) = self.lookup(&id) {
                change.refreshers.push((id, content));
            } else {
                debug!(?id, "referenced detached subtree not present locally");
            }
        }
        Ok(())
    }

    fn lookup(&self, id: &ChangeAtomId) -> Option<Vec<TreeNode>> {
        let root = self.index.get(id)?;
        self.forest.detached_content(root, 1)
    }

    /// Forks a mutable enricher that can speculatively apply tip changes on
    /// top of this view, for open transactions.
    pub fn fork(&self) -> MutableEnricher<'a, F> {
        MutableEnricher {
            forest: self.forest,
            index: self.index,
            overlay: BTreeMap::new(),
        }
    }
}

/// A fork of the enricher holding speculative content from changes that are
/// applied on the transaction tip but not yet visible in the forest.
pub struct MutableEnricher<'a, F> {
    forest: &'a F,
    index: &'a DetachedFieldIndex,
    overlay: BTreeMap<ChangeAtomId, Vec<TreeNode>>,
}

impl<'a, F: Forest> MutableEnricher<'a, F> {
    /// Makes the subtrees a tip change introduces or detaches visible to
    /// subsequent enrichment.
    pub fn apply_tip_change(&mut self, change: &ModularChangeset) {
        for (id, content) in change.builds.iter().chain(&change.refreshers) {
            self.overlay.insert(id.clone(), content.clone());
        }
    }

    pub fn enrich(
        &self,
        registry: &FieldKindRegistry,
        change: &mut ModularChangeset,
        own_revision: Option<&RevisionTag>,
    ) -> ChangeResult<()> {
        for id in referenced_ids(registry, change, own_revision) {
            let content = self.overlay.get(&id).cloned().or_else(|| {
                let root = self.index.get(&id)?;
                self.forest.detached_content(root, 1)
            });
            match content {
                Some(content) => change.refreshers.push((id, content)),
                None => debug!(?id, "referenced detached subtree not present locally"),
            }
        }
        Ok(())
    }
}

/// Ids of pre-existing detached subtrees a changeset references, minus the
/// ones it already carries content for.
fn referenced_ids(
    registry: &FieldKindRegistry,
    change: &ModularChangeset,
    own_revision: Option<&RevisionTag>,
) -> Vec<ChangeAtomId> {
    let mut ids = vec![];
    modular::referenced_detached_node(registry, &change.change, own_revision, &mut ids);
    ids.into_iter()
        .unique()
        .filter(|id| change.build_content(id).is_none() && change.refresher_content(id).is_none())
        .collect_vec()
}
