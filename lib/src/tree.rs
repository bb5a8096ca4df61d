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

//! The logical tree data model: nodes, leaf values, and field keys.

use std::collections::BTreeMap;
use std::fmt::{Debug, Error, Formatter};

use serde::{Deserialize, Serialize};

/// Name of a field inside an object node.
///
/// The distinguished [root](FieldKey::root) key anchors the tree root.
/// Detached field keys name the temporary homes of removed subtrees; they are
/// minted by the detached-field index and never collide with document keys.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Serialize, Deserialize)]
pub struct FieldKey(String);

impl Debug for FieldKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_tuple("FieldKey").field(&self.0).finish()
    }
}

impl FieldKey {
    pub fn new(key: impl Into<String>) -> Self {
        FieldKey(key.into())
    }

    /// The key anchoring the tree root.
    pub fn root() -> Self {
        FieldKey("".to_string())
    }

    /// A key naming the temporary home of a removed subtree.
    pub fn detached(root_id: u64) -> Self {
        FieldKey(format!("\u{0}detached-{root_id}"))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_detached(&self) -> bool {
        self.0.starts_with('\u{0}')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Type identifier of a tree node, resolved against the schema policy.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Serialize, Deserialize)]
pub struct TreeNodeType(String);

impl Debug for TreeNodeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_tuple("TreeNodeType").field(&self.0).finish()
    }
}

impl TreeNodeType {
    pub fn new(name: impl Into<String>) -> Self {
        TreeNodeType(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A leaf value. The value domain is closed.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Debug, Serialize, Deserialize)]
pub enum TreeValue {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    /// Opaque handle to out-of-tree state.
    Handle(String),
}

/// A node of the logical tree: a type identifier plus a mapping from field
/// key to field content. Leaf nodes carry a value.
///
/// Field content is an ordered sequence of nodes; optional fields hold at
/// most one entry (the schema policy enforces this, not the data type).
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct TreeNode {
    pub node_type: TreeNodeType,
    pub value: Option<TreeValue>,
    pub fields: BTreeMap<FieldKey, Vec<TreeNode>>,
}

impl TreeNode {
    pub fn new(node_type: TreeNodeType) -> Self {
        TreeNode {
            node_type,
            value: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn leaf(node_type: TreeNodeType, value: TreeValue) -> Self {
        TreeNode {
            node_type,
            value: Some(value),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: FieldKey, content: Vec<TreeNode>) -> Self {
        self.fields.insert(key, content);
        self
    }

    pub fn field(&self, key: &FieldKey) -> &[TreeNode] {
        self.fields.get(key).map_or(&[], |nodes| nodes.as_slice())
    }

    pub fn field_mut(&mut self, key: &FieldKey) -> &mut Vec<TreeNode> {
        self.fields.entry(key.clone()).or_default()
    }

    /// Drops empty fields so structurally equal trees compare equal.
    pub fn normalized(mut self) -> Self {
        self.fields.retain(|_, content| !content.is_empty());
        for content in self.fields.values_mut() {
            *content = std::mem::take(content)
                .into_iter()
                .map(TreeNode::normalized)
                .collect();
        }
        self
    }
}
