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

//! Revision tags and change-atom identity.

use std::fmt::{Debug, Error, Formatter};

use serde::{Deserialize, Serialize};

/// Identifies one editing session (one replica connection).
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct SessionId(u128);

impl Debug for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_tuple("SessionId")
            .field(&format!("{:032x}", self.0))
            .finish()
    }
}

impl SessionId {
    pub fn new(value: u128) -> Self {
        SessionId(value)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }
}

/// Position assigned to a commit by the sequencer. Strictly increasing across
/// the whole op stream.
#[derive(
    PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Debug, Serialize, Deserialize, Default,
)]
pub struct SeqNumber(pub u64);

impl SeqNumber {
    pub fn next(self) -> SeqNumber {
        SeqNumber(self.0 + 1)
    }
}

/// Opaque token naming one commit's revision.
///
/// Two disjoint flavors exist: anonymous tags minted locally before a commit
/// is sequenced, and sequenced tags carrying the sequencer-assigned number.
/// A rollback tag points at the revision it inverts.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Debug, Serialize, Deserialize)]
pub enum RevisionTag {
    Anonymous { session: SessionId, counter: u64 },
    Sequenced { seq: SeqNumber },
    Rollback { of: Box<RevisionTag> },
}

impl RevisionTag {
    pub fn anonymous(session: SessionId, counter: u64) -> Self {
        RevisionTag::Anonymous { session, counter }
    }

    pub fn sequenced(seq: SeqNumber) -> Self {
        RevisionTag::Sequenced { seq }
    }

    pub fn rollback_of(of: RevisionTag) -> Self {
        RevisionTag::Rollback { of: Box::new(of) }
    }

    pub fn is_sequenced(&self) -> bool {
        matches!(self, RevisionTag::Sequenced { .. })
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self, RevisionTag::Rollback { .. })
    }

    /// The revision a rollback tag inverts, if this is a rollback tag.
    pub fn rolled_back(&self) -> Option<&RevisionTag> {
        match self {
            RevisionTag::Rollback { of } => Some(of),
            _ => None,
        }
    }
}

/// Globally identifies a change atom: a detach, an attach slot, a move
/// endpoint, or a built subtree.
///
/// The id is a pair of the minting revision and a compact local id. While a
/// changeset is still being authored the revision is absent; tagging the
/// commit fills it in.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Serialize, Deserialize)]
pub struct ChangeAtomId {
    pub revision: Option<RevisionTag>,
    pub local_id: u32,
}

impl Debug for ChangeAtomId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_tuple("ChangeAtomId")
            .field(&self.revision)
            .field(&self.local_id)
            .finish()
    }
}

impl ChangeAtomId {
    pub fn new(revision: RevisionTag, local_id: u32) -> Self {
        ChangeAtomId {
            revision: Some(revision),
            local_id,
        }
    }

    /// An id belonging to the changeset currently being authored.
    pub fn anonymous(local_id: u32) -> Self {
        ChangeAtomId {
            revision: None,
            local_id,
        }
    }

    /// The id `offset` cells after this one, within the same atom range.
    pub fn offset(&self, offset: u32) -> Self {
        ChangeAtomId {
            revision: self.revision.clone(),
            local_id: self.local_id + offset,
        }
    }
}

/// Mints anonymous revision tags, monotone within a session.
#[derive(Clone, Debug)]
pub struct RevisionMinter {
    session: SessionId,
    next_counter: u64,
}

impl RevisionMinter {
    pub fn new(session: SessionId) -> Self {
        RevisionMinter {
            session,
            next_counter: 0,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn mint(&mut self) -> RevisionTag {
        let counter = self.next_counter;
        self.next_counter += 1;
        RevisionTag::Anonymous {
            session: self.session,
            counter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minter_is_monotone() {
        let mut minter = RevisionMinter::new(SessionId::new(7));
        let a = minter.mint();
        let b = minter.mint();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn test_rollback_points_at_inverted_revision() {
        let seq = RevisionTag::sequenced(SeqNumber(4));
        let rollback = RevisionTag::rollback_of(seq.clone());
        assert!(rollback.is_rollback());
        assert_eq!(rollback.rolled_back(), Some(&seq));
        assert_eq!(seq.rolled_back(), None);
    }

    #[test]
    fn test_atom_id_offset_stays_in_revision() {
        let id = ChangeAtomId::new(RevisionTag::sequenced(SeqNumber(1)), 10);
        let later = id.offset(5);
        assert_eq!(later.revision, id.revision);
        assert_eq!(later.local_id, 15);
    }
}
