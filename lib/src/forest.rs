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

//! The forest collaborator: the in-memory tree representation the engine
//! drives. The engine calls into the forest, never the reverse.

use std::fmt::Debug;

use thiserror::Error;

use crate::delta::Delta;
use crate::detached::ForestRootId;
use crate::tree::TreeNode;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForestError {
    #[error("unknown detached root {0:?}")]
    UnknownRoot(ForestRootId),
    #[error("delta does not fit the tree: {0}")]
    Malformed(String),
}

pub type ForestResult<T> = Result<T, ForestError>;

/// The tree representation consuming derived deltas.
///
/// Detached subtrees are kept, keyed by forest root id, until the engine
/// instructs the forest to forget them. A delta either applies completely or
/// not at all; the forest must not expose intermediate states.
pub trait Forest: Debug {
    fn apply_delta(&mut self, delta: &Delta) -> ForestResult<()>;

    /// Creates detached roots `id .. id + content.len()` holding `content`.
    fn build_detached_field(&mut self, id: ForestRootId, content: Vec<TreeNode>);

    /// The content of `count` contiguous detached roots starting at `id`.
    fn detached_content(&self, id: ForestRootId, count: u64) -> Option<Vec<TreeNode>>;

    /// Releases detached roots the engine no longer tracks.
    fn forget_detached(&mut self, id: ForestRootId, count: u64);
}
