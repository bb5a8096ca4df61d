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

//! Delta derivation: the minimal forest-mutation representation of applying
//! a committed changeset.
//!
//! Derivation is atomic. The index is only updated when the whole delta
//! derives successfully, and the forest consumes the delta in one step.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::detached::{DetachedFieldIndex, ForestRootId};
use crate::field_kind::{ChangeError, ChangeResult, FieldKindRegistry};
use crate::modular::{self, ModularChangeset};
use crate::revision::{ChangeAtomId, RevisionTag};
use crate::tree::{FieldKey, TreeNode, TreeValue};

#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct ValueReplace {
    pub old: Option<TreeValue>,
    pub new: Option<TreeValue>,
}

/// One forest mutation over a field's cells, in field order.
///
/// `Rename` marks are zero-width: they rehome detached content without
/// touching live cells.
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub enum DeltaMark {
    Skip(u64),
    Attach { id: ForestRootId, count: u64 },
    Detach { id: ForestRootId, count: u64 },
    Rename {
        from: ForestRootId,
        to: ForestRootId,
        count: u64,
    },
    Modify(Box<NodeDelta>),
}

#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct FieldDelta {
    pub marks: Vec<DeltaMark>,
}

#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeDelta {
    pub value: Option<ValueReplace>,
    pub fields: BTreeMap<FieldKey, FieldDelta>,
}

impl NodeDelta {
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.fields.is_empty()
    }
}

/// A complete, atomic forest mutation derived from one committed changeset.
#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct Delta {
    /// The revision the delta was derived for; repair data recorded while
    /// applying it is keyed by this.
    pub revision: Option<RevisionTag>,
    pub root: NodeDelta,
    /// Content to create as detached roots before the marks run.
    pub builds: Vec<(ForestRootId, Vec<TreeNode>)>,
    /// Edits to apply to detached subtrees.
    pub detached_edits: Vec<(ForestRootId, NodeDelta)>,
}

impl Delta {
    pub fn empty() -> Self {
        Delta::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty() && self.builds.is_empty() && self.detached_edits.is_empty()
    }
}

/// Allocation context threaded through `into_delta`. Memoizes atom id to
/// forest root so the same id referenced twice in one delta resolves to the
/// same root, and collects builds and detached edits.
pub struct DeltaContext<'a> {
    index: &'a mut DetachedFieldIndex,
    builds: Vec<(ForestRootId, Vec<TreeNode>)>,
    detached_edits: Vec<(ForestRootId, NodeDelta)>,
}

impl<'a> DeltaContext<'a> {
    pub fn new(index: &'a mut DetachedFieldIndex) -> Self {
        DeltaContext {
            index,
            builds: vec![],
            detached_edits: vec![],
        }
    }

    pub fn allocate(&mut self, id: &ChangeAtomId, count: u64) -> ChangeResult<ForestRootId> {
        if count == 0 {
            return Err(ChangeError::InvalidChangeset(
                "zero-width atom range".to_string(),
            ));
        }
        Ok(self.index.get_or_allocate(id, count))
    }

    /// The root a pre-existing range resolves to, without allocating.
    pub fn existing(&self, id: &ChangeAtomId, count: u64) -> Option<ForestRootId> {
        self.index.get_range(id, count)
    }

    /// Gives the content known under `old` the additional name `new`.
    /// Returns a rename when `new` was already bound to different roots, in
    /// which case the forest must rehome the content.
    pub fn alias(
        &mut self,
        old: &ChangeAtomId,
        new: &ChangeAtomId,
        count: u64,
    ) -> ChangeResult<Option<DeltaMark>> {
        let from = self.allocate(old, count)?;
        match self.index.get_range(new, count) {
            Some(to) if to != from => Ok(Some(DeltaMark::Rename { from, to, count })),
            Some(_) => Ok(None),
            None => {
                self.index.associate(new, count, from);
                Ok(None)
            }
        }
    }

    pub fn add_build(&mut self, root: ForestRootId, content: Vec<TreeNode>) {
        self.builds.push((root, content));
    }

    pub fn add_detached_edit(&mut self, root: ForestRootId, delta: NodeDelta) {
        self.detached_edits.push((root, delta));
    }
}

/// Derives the forest delta for a committed changeset.
///
/// A changeset whose constraints were violated during rebasing derives the
/// empty delta. Builds and refreshers are registered as detached roots first
/// so revives inside the changeset resolve.
pub fn derive_delta(
    registry: &FieldKindRegistry,
    change: &ModularChangeset,
    revision: Option<&RevisionTag>,
    index: &mut DetachedFieldIndex,
) -> ChangeResult<Delta> {
    if change.is_violated() {
        return Ok(Delta {
            revision: revision.cloned(),
            ..Delta::empty()
        });
    }
    // Work on a copy of the index so a failed derivation leaves no trace.
    let mut scratch = index.clone();
    let mut context = DeltaContext::new(&mut scratch);
    for (id, content) in &change.builds {
        let root = context.allocate(id, content.len() as u64)?;
        context.add_build(root, content.clone());
    }
    for (id, content) in &change.refreshers {
        if context.existing(id, content.len() as u64).is_none() {
            let root = context.allocate(id, content.len() as u64)?;
            context.add_build(root, content.clone());
        }
    }
    let root = modular::node_into_delta(registry, &change.change, &mut context)?;
    let DeltaContext {
        builds,
        detached_edits,
        ..
    } = context;
    *index = scratch;
    Ok(Delta {
        revision: revision.cloned(),
        root,
        builds,
        detached_edits,
    })
}
