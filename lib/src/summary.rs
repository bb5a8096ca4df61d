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

//! Summary encoding: the persisted form of a replica's engine state.
//!
//! The summary tree has fixed root keys. The `editManager` blob carries the
//! trunk, the local branch and a versioned metadata sub-blob; legacy
//! summaries written before the metadata blob existed load as trunk-only
//! (format 0). No default version number is invented for them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detached::DetachedFieldIndex;
use crate::modular::ModularChangeset;
use crate::revision::{RevisionTag, SeqNumber, SessionId};
use crate::schema::SchemaPolicy;

pub const SUMMARY_FORMAT_VERSION: u64 = 1;

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("unsupported summary format version {0}")]
    IncompatibleSchemaVersion(u64),
    #[error("malformed summary: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type SummaryResult<T> = Result<T, SummaryError>;

#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct SummaryMetadata {
    pub version: u64,
}

#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
pub struct CommitSummary {
    pub seq: Option<SeqNumber>,
    pub revision: RevisionTag,
    pub session: SessionId,
    pub change: ModularChangeset,
}

#[derive(PartialEq, Eq, Clone, Debug, Default, Serialize, Deserialize)]
pub struct EditManagerSummary {
    pub trunk: Vec<CommitSummary>,
    pub local: Vec<CommitSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SummaryMetadata>,
}

/// The whole summary tree. Root keys are fixed; the `forest` sub-tree is
/// owned by the forest collaborator and carried opaquely.
#[derive(PartialEq, Eq, Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryTree {
    pub edit_manager: EditManagerSummary,
    pub forest: serde_json::Value,
    pub schema: SchemaPolicy,
    pub detached_field_index: DetachedFieldIndex,
}

pub fn encode_summary(summary: &SummaryTree) -> SummaryResult<Vec<u8>> {
    Ok(serde_json::to_vec(summary)?)
}

pub fn decode_summary(bytes: &[u8]) -> SummaryResult<SummaryTree> {
    let mut summary: SummaryTree = serde_json::from_slice(bytes)?;
    match &summary.edit_manager.metadata {
        Some(metadata) if metadata.version > SUMMARY_FORMAT_VERSION => {
            return Err(SummaryError::IncompatibleSchemaVersion(metadata.version));
        }
        Some(_) => {}
        None => {
            // Legacy pre-versioning summary: trunk-only.
            summary.edit_manager.local.clear();
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_summary(metadata: Option<SummaryMetadata>) -> SummaryTree {
        SummaryTree {
            edit_manager: EditManagerSummary {
                trunk: vec![],
                local: vec![CommitSummary {
                    seq: None,
                    revision: RevisionTag::anonymous(SessionId::new(1), 0),
                    session: SessionId::new(1),
                    change: ModularChangeset::noop(),
                }],
                metadata,
            },
            forest: serde_json::Value::Null,
            schema: SchemaPolicy::default(),
            detached_field_index: DetachedFieldIndex::new(),
        }
    }

    #[test]
    fn test_round_trip() {
        let summary = empty_summary(Some(SummaryMetadata {
            version: SUMMARY_FORMAT_VERSION,
        }));
        let bytes = encode_summary(&summary).unwrap();
        let decoded = decode_summary(&bytes).unwrap();
        assert_eq!(decoded, summary);
    }

    #[test]
    fn test_legacy_summary_loads_trunk_only() {
        let summary = empty_summary(None);
        let bytes = encode_summary(&summary).unwrap();
        let decoded = decode_summary(&bytes).unwrap();
        assert!(decoded.edit_manager.local.is_empty());
        assert_eq!(decoded.edit_manager.metadata, None);
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let summary = empty_summary(Some(SummaryMetadata { version: 99 }));
        let bytes = encode_summary(&summary).unwrap();
        assert_matches::assert_matches!(
            decode_summary(&bytes),
            Err(SummaryError::IncompatibleSchemaVersion(99))
        );
    }
}
