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

//! The schema collaborator: a compatibility check between policies, and the
//! field kind modeling schema changes as sequenced ops.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::cross_field::CrossFieldManager;
use crate::delta::{DeltaContext, FieldDelta};
use crate::field_kind::{
    ChangeError, ChangeResult, FieldChangeset, FieldKind, FieldKindId, FieldKindRegistry,
    RevisionInfo,
};
use crate::revision::{ChangeAtomId, RevisionTag};
use crate::tree::TreeNodeType;

/// The set of node types a replica accepts.
#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct SchemaPolicy {
    pub version: u64,
    pub node_types: BTreeSet<TreeNodeType>,
}

impl SchemaPolicy {
    pub fn new(version: u64, node_types: impl IntoIterator<Item = TreeNodeType>) -> Self {
        SchemaPolicy {
            version,
            node_types: node_types.into_iter().collect(),
        }
    }

    pub fn allows(&self, node_type: &TreeNodeType) -> bool {
        self.node_types.contains(node_type)
    }
}

/// Whether a replica using policy `b` can consume data written under policy
/// `a`.
pub fn allows_repo_superset(a: &SchemaPolicy, b: &SchemaPolicy) -> bool {
    a.node_types.is_subset(&b.node_types)
}

/// A schema change: the policy pair it transitions between.
#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct SchemaChangeset {
    pub old: SchemaPolicy,
    pub new: SchemaPolicy,
}

impl SchemaChangeset {
    pub fn new(old: SchemaPolicy, new: SchemaPolicy) -> Self {
        SchemaChangeset { old, new }
    }

    pub fn is_noop(&self) -> bool {
        self.old == self.new
    }
}

/// The registered algebra for schema changes. Compose and rebase are
/// last-writer-wins; rebasing over an incompatible concurrent change fails
/// with [`ChangeError::OutOfSchema`].
#[derive(Debug)]
pub struct SchemaFieldKind;

impl FieldKind for SchemaFieldKind {
    fn id(&self) -> FieldKindId {
        FieldKindId::schema()
    }

    fn noop(&self) -> FieldChangeset {
        FieldChangeset::Schema(SchemaChangeset::default())
    }

    fn is_noop(&self, change: &FieldChangeset) -> bool {
        matches!(change, FieldChangeset::Schema(change) if change.is_noop())
    }

    fn compose(
        &self,
        _registry: &FieldKindRegistry,
        a: &FieldChangeset,
        _a_rev: &RevisionInfo,
        b: &FieldChangeset,
        _b_rev: &RevisionInfo,
        _manager: &mut CrossFieldManager,
    ) -> ChangeResult<FieldChangeset> {
        let a = a.as_schema()?;
        let b = b.as_schema()?;
        let composed = if b.is_noop() {
            a.clone()
        } else {
            SchemaChangeset::new(a.old.clone(), b.new.clone())
        };
        Ok(FieldChangeset::Schema(composed))
    }

    fn invert(
        &self,
        _registry: &FieldKindRegistry,
        a: &FieldChangeset,
        _a_rev: &RevisionInfo,
        _manager: &mut CrossFieldManager,
    ) -> ChangeResult<FieldChangeset> {
        let a = a.as_schema()?;
        Ok(FieldChangeset::Schema(SchemaChangeset::new(
            a.new.clone(),
            a.old.clone(),
        )))
    }

    fn rebase(
        &self,
        _registry: &FieldKindRegistry,
        a: &FieldChangeset,
        _a_rev: &RevisionInfo,
        base: &FieldChangeset,
        _base_rev: &RevisionInfo,
        _manager: &mut CrossFieldManager,
    ) -> ChangeResult<FieldChangeset> {
        let a = a.as_schema()?;
        let base = base.as_schema()?;
        if base.is_noop() {
            return Ok(FieldChangeset::Schema(a.clone()));
        }
        // Last writer wins, provided the survivor can still read what the
        // base wrote.
        if !allows_repo_superset(&base.new, &a.new) {
            return Err(ChangeError::OutOfSchema);
        }
        Ok(FieldChangeset::Schema(SchemaChangeset::new(
            base.new.clone(),
            a.new.clone(),
        )))
    }

    fn consume_cross_field(
        &self,
        _registry: &FieldKindRegistry,
        _change: &mut FieldChangeset,
        _manager: &mut CrossFieldManager,
    ) -> ChangeResult<()> {
        Ok(())
    }

    fn update_revision(
        &self,
        _registry: &FieldKindRegistry,
        _change: &mut FieldChangeset,
        _old: Option<&RevisionTag>,
        _new: &RevisionTag,
    ) {
    }

    fn into_delta(
        &self,
        _registry: &FieldKindRegistry,
        _change: &FieldChangeset,
        _context: &mut DeltaContext<'_>,
    ) -> ChangeResult<FieldDelta> {
        // Schema changes carry no forest mutation.
        Ok(FieldDelta::default())
    }

    fn referenced_detached(
        &self,
        _registry: &FieldKindRegistry,
        _change: &FieldChangeset,
        _own_revision: Option<&RevisionTag>,
        _out: &mut Vec<ChangeAtomId>,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_kind::default_registry;

    fn policy(version: u64, types: &[&str]) -> SchemaPolicy {
        SchemaPolicy::new(version, types.iter().map(|t| TreeNodeType::new(*t)))
    }

    #[test]
    fn test_superset_check() {
        let narrow = policy(1, &["a"]);
        let wide = policy(2, &["a", "b"]);
        assert!(allows_repo_superset(&narrow, &wide));
        assert!(!allows_repo_superset(&wide, &narrow));
    }

    #[test]
    fn test_rebase_is_last_writer_wins() {
        let registry = default_registry();
        let kind = SchemaFieldKind;
        let base = FieldChangeset::Schema(SchemaChangeset::new(
            policy(1, &["a"]),
            policy(2, &["a", "b"]),
        ));
        let ours = FieldChangeset::Schema(SchemaChangeset::new(
            policy(1, &["a"]),
            policy(3, &["a", "b", "c"]),
        ));
        let mut manager = CrossFieldManager::new();
        let rebased = kind
            .rebase(
                registry,
                &ours,
                &RevisionInfo::untagged(),
                &base,
                &RevisionInfo::untagged(),
                &mut manager,
            )
            .unwrap();
        let rebased = rebased.as_schema().unwrap();
        assert_eq!(rebased.old, policy(2, &["a", "b"]));
        assert_eq!(rebased.new, policy(3, &["a", "b", "c"]));
    }

    #[test]
    fn test_rebase_rejects_incompatible_narrowing() {
        let registry = default_registry();
        let kind = SchemaFieldKind;
        let base = FieldChangeset::Schema(SchemaChangeset::new(
            policy(1, &["a"]),
            policy(2, &["a", "b"]),
        ));
        let ours = FieldChangeset::Schema(SchemaChangeset::new(
            policy(1, &["a"]),
            policy(3, &["a"]),
        ));
        let mut manager = CrossFieldManager::new();
        assert_matches::assert_matches!(
            kind.rebase(
                registry,
                &ours,
                &RevisionInfo::untagged(),
                &base,
                &RevisionInfo::untagged(),
                &mut manager,
            ),
            Err(ChangeError::OutOfSchema)
        );
    }
}
