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

//! Identifier compression: session-scoped revision tags mapped to stable ids
//! and to the cross-session order keys used for insert tie-breaking.

use std::collections::HashMap;

use crate::revision::{RevisionTag, SeqNumber, SessionId};

/// A 64-bit id stable across summarize/load cycles.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Debug)]
pub struct StableId(pub u64);

/// Total order over revision tags that every replica computes identically.
///
/// The key of a commit is derived from its minting session and per-session
/// counter, so an anonymous tag and the sequenced tag that later replaces it
/// compare equal. Sequenced tags whose origin was never observed (e.g. loaded
/// from a summary) fall back to the nil session with the sequence number as
/// the counter, which is still identical on every replica.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Debug)]
pub struct OrderKey {
    pub session: u128,
    pub counter: u64,
    pub rollback: bool,
}

impl OrderKey {
    pub fn new(session: SessionId, counter: u64) -> Self {
        OrderKey {
            session: session.as_u128(),
            counter,
            rollback: false,
        }
    }

    fn fallback(seq: SeqNumber) -> Self {
        OrderKey {
            session: 0,
            counter: seq.0,
            rollback: false,
        }
    }
}

/// Maps between opaque session-scoped revision tags and 64-bit stable ids.
pub trait IdCompressor {
    /// The stable id for a tag, allocating one on first use.
    fn normalize(&mut self, tag: &RevisionTag) -> StableId;

    /// The tag a stable id was allocated for, if known.
    fn recognize(&self, id: StableId) -> Option<&RevisionTag>;

    /// Records that `sequenced` replaced `anonymous` when a commit was
    /// sequenced, so both map to the same order key.
    fn associate(&mut self, anonymous: &RevisionTag, sequenced: &RevisionTag);

    /// The cross-session order key for a tag.
    fn order_key(&self, tag: &RevisionTag) -> OrderKey;
}

/// In-memory compressor. Stable ids are allocated in first-use order, which
/// is deterministic per replica but not across replicas; only [`OrderKey`]s
/// may be compared across sessions.
#[derive(Default, Debug)]
pub struct InMemoryIdCompressor {
    by_tag: HashMap<RevisionTag, StableId>,
    by_id: Vec<RevisionTag>,
    origins: HashMap<SeqNumber, (SessionId, u64)>,
}

impl InMemoryIdCompressor {
    pub fn new() -> Self {
        InMemoryIdCompressor::default()
    }
}

impl IdCompressor for InMemoryIdCompressor {
    fn normalize(&mut self, tag: &RevisionTag) -> StableId {
        if let Some(&id) = self.by_tag.get(tag) {
            return id;
        }
        let id = StableId(self.by_id.len() as u64);
        self.by_tag.insert(tag.clone(), id);
        self.by_id.push(tag.clone());
        id
    }

    fn recognize(&self, id: StableId) -> Option<&RevisionTag> {
        self.by_id.get(id.0 as usize)
    }

    fn associate(&mut self, anonymous: &RevisionTag, sequenced: &RevisionTag) {
        if let (
            RevisionTag::Anonymous { session, counter },
            RevisionTag::Sequenced { seq },
        ) = (anonymous, sequenced)
        {
            self.origins.insert(*seq, (*session, *counter));
        }
    }

    fn order_key(&self, tag: &RevisionTag) -> OrderKey {
        match tag {
            RevisionTag::Anonymous { session, counter } => OrderKey::new(*session, *counter),
            RevisionTag::Sequenced { seq } => self
                .origins
                .get(seq)
                .map(|(session, counter)| OrderKey::new(*session, *counter))
                .unwrap_or_else(|| OrderKey::fallback(*seq)),
            RevisionTag::Rollback { of } => OrderKey {
                rollback: true,
                ..self.order_key(of)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_is_stable() {
        let mut compressor = InMemoryIdCompressor::new();
        let tag = RevisionTag::anonymous(SessionId::new(3), 0);
        let id = compressor.normalize(&tag);
        assert_eq!(compressor.normalize(&tag), id);
        assert_eq!(compressor.recognize(id), Some(&tag));
    }

    #[test]
    fn test_sequenced_tag_inherits_origin_key() {
        let mut compressor = InMemoryIdCompressor::new();
        let anonymous = RevisionTag::anonymous(SessionId::new(9), 2);
        let sequenced = RevisionTag::sequenced(SeqNumber(40));
        compressor.associate(&anonymous, &sequenced);
        assert_eq!(
            compressor.order_key(&anonymous),
            compressor.order_key(&sequenced)
        );
    }

    #[test]
    fn test_unknown_sequenced_tag_falls_back_to_seq() {
        let compressor = InMemoryIdCompressor::new();
        let a = compressor.order_key(&RevisionTag::sequenced(SeqNumber(1)));
        let b = compressor.order_key(&RevisionTag::sequenced(SeqNumber(2)));
        assert!(a < b);
    }

    #[test]
    fn test_rollback_orders_next_to_its_target() {
        let compressor = InMemoryIdCompressor::new();
        let target = RevisionTag::anonymous(SessionId::new(1), 5);
        let rollback = RevisionTag::rollback_of(target.clone());
        let target_key = compressor.order_key(&target);
        let rollback_key = compressor.order_key(&rollback);
        assert_ne!(target_key, rollback_key);
        assert_eq!(target_key.session, rollback_key.session);
        assert_eq!(target_key.counter, rollback_key.counter);
    }
}
