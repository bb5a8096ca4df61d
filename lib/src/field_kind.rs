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

//! Field-kind dispatch: every field of a node changeset carries a kind id,
//! and the registered algebra for that kind implements the change family's
//! total operations.

use std::fmt::Debug;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cross_field::CrossFieldManager;
use crate::delta::{DeltaContext, FieldDelta};
use crate::id_compressor::OrderKey;
use crate::optional_field::{OptionalChangeset, OptionalFieldKind};
use crate::revision::{ChangeAtomId, RevisionTag, SessionId};
use crate::schema::{SchemaChangeset, SchemaFieldKind};
use crate::sequence_field::{SequenceChangeset, SequenceFieldKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChangeError {
    #[error("malformed changeset: {0}")]
    InvalidChangeset(String),
    #[error("missing refresher for detached subtree {0:?}")]
    MissingRefresher(ChangeAtomId),
    #[error("change rejected by the schema policy")]
    OutOfSchema,
    #[error("unknown field kind {0:?}")]
    UnknownFieldKind(FieldKindId),
}

pub type ChangeResult<T> = Result<T, ChangeError>;

/// Identifies a field-kind algebra. Carried inline in changesets so the
/// registry can be consulted at decode and apply time.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Debug, Serialize, Deserialize)]
pub struct FieldKindId(String);

impl FieldKindId {
    pub fn new(name: impl Into<String>) -> Self {
        FieldKindId(name.into())
    }

    pub fn optional() -> Self {
        FieldKindId::new("optional")
    }

    pub fn sequence() -> Self {
        FieldKindId::new("sequence")
    }

    pub fn schema() -> Self {
        FieldKindId::new("schema")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A per-field changeset, tagged with its kind.
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub enum FieldChangeset {
    Optional(OptionalChangeset),
    Sequence(SequenceChangeset),
    Schema(SchemaChangeset),
}

impl FieldChangeset {
    pub fn as_optional(&self) -> ChangeResult<&OptionalChangeset> {
        match self {
            FieldChangeset::Optional(change) => Ok(change),
            other => Err(kind_mismatch("optional", other)),
        }
    }

    pub fn as_optional_mut(&mut self) -> ChangeResult<&mut OptionalChangeset> {
        match self {
            FieldChangeset::Optional(change) => Ok(change),
            other => Err(kind_mismatch("optional", other)),
        }
    }

    pub fn as_sequence(&self) -> ChangeResult<&SequenceChangeset> {
        match self {
            FieldChangeset::Sequence(change) => Ok(change),
            other => Err(kind_mismatch("sequence", other)),
        }
    }

    pub fn as_sequence_mut(&mut self) -> ChangeResult<&mut SequenceChangeset> {
        match self {
            FieldChangeset::Sequence(change) => Ok(change),
            other => Err(kind_mismatch("sequence", other)),
        }
    }

    pub fn as_schema(&self) -> ChangeResult<&SchemaChangeset> {
        match self {
            FieldChangeset::Schema(change) => Ok(change),
            other => Err(kind_mismatch("schema", other)),
        }
    }
}

fn kind_mismatch(expected: &str, got: &FieldChangeset) -> ChangeError {
    let got = match got {
        FieldChangeset::Optional(_) => "optional",
        FieldChangeset::Sequence(_) => "sequence",
        FieldChangeset::Schema(_) => "schema",
    };
    ChangeError::InvalidChangeset(format!(
        "field changeset kind mismatch: expected {expected}, got {got}"
    ))
}

/// Revision context of one side of a compose/invert/rebase, precomputed by
/// the caller (the edit manager resolves order keys through its id
/// compressor; untagged changesets get the local placeholder key).
#[derive(Clone, Debug)]
pub struct RevisionInfo {
    pub tag: Option<RevisionTag>,
    pub order: OrderKey,
}

impl RevisionInfo {
    pub fn new(tag: RevisionTag, order: OrderKey) -> Self {
        RevisionInfo {
            tag: Some(tag),
            order,
        }
    }

    /// Context for a changeset that is still being authored. The placeholder
    /// key orders after every minted key, matching a change that has not yet
    /// entered the op stream.
    pub fn untagged() -> Self {
        RevisionInfo {
            tag: None,
            order: OrderKey {
                session: u128::MAX,
                counter: u64::MAX,
                rollback: false,
            },
        }
    }

    pub fn anonymous(session: SessionId, counter: u64) -> Self {
        RevisionInfo {
            tag: Some(RevisionTag::anonymous(session, counter)),
            order: OrderKey::new(session, counter),
        }
    }
}

/// The change-family algebra of one field kind.
///
/// `compose`, `invert` and `rebase` are total: they never partially mutate
/// their inputs, and any failure leaves state unchanged. Cross-field
/// coordination goes through the manager; `consume_cross_field` is the second
/// pass that picks up messages other fields addressed to this one.
pub trait FieldKind: Debug + Send + Sync {
    fn id(&self) -> FieldKindId;

    fn noop(&self) -> FieldChangeset;

    fn is_noop(&self, change: &FieldChangeset) -> bool;

    fn compose(
        &self,
        registry: &FieldKindRegistry,
        a: &FieldChangeset,
        a_rev: &RevisionInfo,
        b: &FieldChangeset,
        b_rev: &RevisionInfo,
        manager: &mut CrossFieldManager,
    ) -> ChangeResult<FieldChangeset>;

    fn invert(
        &self,
        registry: &FieldKindRegistry,
        a: &FieldChangeset,
        a_rev: &RevisionInfo,
        manager: &mut CrossFieldManager,
    ) -> ChangeResult<FieldChangeset>;

    fn rebase(
        &self,
        registry: &FieldKindRegistry,
        a: &FieldChangeset,
        a_rev: &RevisionInfo,
        base: &FieldChangeset,
        base_rev: &RevisionInfo,
        manager: &mut CrossFieldManager,
    ) -> ChangeResult<FieldChangeset>;

    fn consume_cross_field(
        &self,
        registry: &FieldKindRegistry,
        change: &mut FieldChangeset,
        manager: &mut CrossFieldManager,
    ) -> ChangeResult<()>;

    /// Second pass of a rebase: picks up the nested changes queued under the
    /// ids of attaches the *base* performed in this field, placing them at
    /// the attach position in the rebased changeset. The default is for
    /// kinds whose content never receives moved nodes.
    fn deliver_base_attach_changes(
        &self,
        _registry: &FieldKindRegistry,
        _change: &mut FieldChangeset,
        _base: &FieldChangeset,
        _manager: &mut CrossFieldManager,
    ) -> ChangeResult<()> {
        Ok(())
    }

    /// Rewrites every atom id minted under `old` (or still anonymous) to
    /// carry `new`. Must be idempotent for ids already carrying `new`.
    fn update_revision(
        &self,
        registry: &FieldKindRegistry,
        change: &mut FieldChangeset,
        old: Option<&RevisionTag>,
        new: &RevisionTag,
    );

    /// Materializes the field changeset as forest-mutation marks.
    fn into_delta(
        &self,
        registry: &FieldKindRegistry,
        change: &FieldChangeset,
        context: &mut DeltaContext<'_>,
    ) -> ChangeResult<FieldDelta>;

    /// Collects ids of pre-existing detached subtrees the changeset needs,
    /// for the enricher. Ids minted by the changeset itself (under
    /// `own_revision` or still anonymous) are not pre-existing.
    fn referenced_detached(
        &self,
        registry: &FieldKindRegistry,
        change: &FieldChangeset,
        own_revision: Option<&RevisionTag>,
        out: &mut Vec<ChangeAtomId>,
    );
}

/// Registry consulted when dispatching on a changeset's inline kind id.
#[derive(Debug, Default)]
pub struct FieldKindRegistry {
    kinds: IndexMap<FieldKindId, Box<dyn FieldKind>>,
}

impl FieldKindRegistry {
    pub fn new() -> Self {
        FieldKindRegistry::default()
    }

    pub fn register(&mut self, kind: Box<dyn FieldKind>) {
        self.kinds.insert(kind.id(), kind);
    }

    pub fn get(&self, id: &FieldKindId) -> ChangeResult<&dyn FieldKind> {
        self.kinds
            .get(id)
            .map(|kind| kind.as_ref())
            .ok_or_else(|| ChangeError::UnknownFieldKind(id.clone()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &FieldKindId> {
        self.kinds.keys()
    }
}

static DEFAULT_REGISTRY: Lazy<FieldKindRegistry> = Lazy::new(|| {
    let mut registry = FieldKindRegistry::new();
    registry.register(Box::new(OptionalFieldKind));
    registry.register(Box::new(SequenceFieldKind));
    registry.register(Box::new(SchemaFieldKind));
    registry
});

/// The registry holding the built-in field kinds.
pub fn default_registry() -> &'static FieldKindRegistry {
    &DEFAULT_REGISTRY
}

/// Whether an atom id belongs to the changeset being operated on (minted
/// under its revision, or not yet tagged) as opposed to referencing state
/// detached by an earlier commit.
pub fn is_own_atom(id: &ChangeAtomId, own_revision: Option<&RevisionTag>) -> bool {
    match (&id.revision, own_revision) {
        (None, _) => true,
        (Some(rev), Some(own)) => rev == own,
        (Some(_), None) => false,
    }
}
