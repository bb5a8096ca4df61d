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

//! The per-replica edit manager: a trunk of sequenced commits, a local
//! branch of unsequenced commits, and the sandwich-rebase state machine that
//! keeps the forest converged with the sequencer's total order.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;
use tracing::debug;

use crate::delta::{derive_delta, Delta};
use crate::detached::DetachedFieldIndex;
use crate::enricher::ChangeEnricher;
use crate::field_kind::{
    default_registry, ChangeError, FieldKindRegistry, RevisionInfo,
};
use crate::forest::{Forest, ForestError};
use crate::id_compressor::{IdCompressor, InMemoryIdCompressor};
use crate::modular::{
    change_revision, compose_modular, invert_modular, rebase_modular, ModularChangeset,
    TaggedChange,
};
use crate::revision::{RevisionMinter, RevisionTag, SeqNumber, SessionId};
use crate::summary::{
    CommitSummary, EditManagerSummary, SummaryMetadata, SUMMARY_FORMAT_VERSION,
};

#[derive(Debug, Error)]
pub enum EditManagerError {
    #[error("sequenced commit out of order: expected {expected:?}, got {got:?}")]
    UnexpectedSeqNum { expected: SeqNumber, got: SeqNumber },
    #[error("local branch does not start with the echoed commit {0:?}")]
    LocalBranchDesynchronized(RevisionTag),
    #[error("no transaction in progress")]
    NoTransaction,
    #[error("unknown revision {0:?}")]
    UnknownRevision(RevisionTag),
    #[error(transparent)]
    Change(#[from] ChangeError),
    #[error(transparent)]
    Forest(#[from] ForestError),
}

pub type EditManagerResult<T> = Result<T, EditManagerError>;

#[derive(Clone, Debug)]
struct TrunkCommit {
    seq: SeqNumber,
    revision: RevisionTag,
    session: SessionId,
    change: ModularChangeset,
}

#[derive(Clone, Debug)]
struct LocalCommit {
    revision: RevisionTag,
    change: ModularChangeset,
}

/// Owns the forest, the detached-field index, and the commit lineage. All
/// mutation goes through its public operations; callers observe a consistent
/// forest between calls.
pub struct EditManager<F> {
    registry: &'static FieldKindRegistry,
    session: SessionId,
    minter: RevisionMinter,
    compressor: Box<dyn IdCompressor>,
    forest: F,
    index: DetachedFieldIndex,
    trunk: VecDeque<TrunkCommit>,
    local: Vec<LocalCommit>,
    peer_heads: HashMap<SessionId, SeqNumber>,
    min_retained: SeqNumber,
    next_seq: SeqNumber,
    rollbacks: HashSet<RevisionTag>,
    transactions: Vec<usize>,
}

impl<F: Forest> EditManager<F> {
    pub fn new(session: SessionId, forest: F) -> Self {
        EditManager {
            registry: default_registry(),
            session,
            minter: RevisionMinter::new(session),
            compressor: Box::new(InMemoryIdCompressor::new()),
            forest,
            index: DetachedFieldIndex::new(),
            trunk: VecDeque::new(),
            local: vec![],
            peer_heads: HashMap::new(),
            min_retained: SeqNumber(0),
            next_seq: SeqNumber(1),
            rollbacks: HashSet::new(),
            transactions: vec![],
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn forest(&self) -> &F {
        &self.forest
    }

    pub fn detached_field_index(&self) -> &DetachedFieldIndex {
        &self.index
    }

    pub fn trunk_len(&self) -> usize {
        self.trunk.len()
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    pub fn min_retained(&self) -> SeqNumber {
        self.min_retained
    }

    /// Whether a rollback of `revision` has been committed.
    pub fn has_rollback(&self, revision: &RevisionTag) -> bool {
        self.rollbacks.contains(revision)
    }

    fn rev_info(&self, tag: &RevisionTag) -> RevisionInfo {
        RevisionInfo {
            tag: Some(tag.clone()),
            order: self.compressor.order_key(tag),
        }
    }

    fn compose_all(
        &self,
        parts: Vec<(RevisionInfo, ModularChangeset)>,
    ) -> EditManagerResult<ModularChangeset> {
        let mut acc = ModularChangeset::noop();
        let acc_rev = RevisionInfo::untagged();
        for (rev, change) in parts {
            acc = compose_modular(self.registry, &acc, &acc_rev, &change, &rev)?;
        }
        Ok(acc)
    }

    /// Appends a local edit, applies it to the forest, and returns the
    /// tagged change for outbound submission.
    pub fn add_local_change(
        &mut self,
        change: ModularChangeset,
    ) -> EditManagerResult<TaggedChange> {
        let revision = self.minter.mint();
        let mut change = change_revision(self.registry, &change, None, &revision);
        let enricher = ChangeEnricher::new(&self.forest, &self.index);
        enricher.enrich(self.registry, &mut change, Some(&revision))?;
        let delta = derive_delta(self.registry, &change, Some(&revision), &mut self.index)?;
        self.forest.apply_delta(&delta)?;
        self.compressor.normalize(&revision);
        if let Some(target) = revision.rolled_back() {
            self.rollbacks.insert(target.clone());
        }
        self.local.push(LocalCommit {
            revision: revision.clone(),
            change: change.clone(),
        });
        Ok(TaggedChange::new(revision, change))
    }

    /// Commits the inverse of an earlier local or trunk commit as a new
    /// local change under a rollback tag.
    pub fn undo(&mut self, revision: &RevisionTag) -> EditManagerResult<TaggedChange> {
        let change = self
            .local
            .iter()
            .find(|commit| &commit.revision == revision)
            .map(|commit| commit.change.clone())
            .or_else(|| {
                self.trunk
                    .iter()
                    .find(|commit| &commit.revision == revision)
                    .map(|commit| commit.change.clone())
            })
            .ok_or_else(|| EditManagerError::UnknownRevision(revision.clone()))?;
        let inverse = invert_modular(self.registry, &change, &self.rev_info(revision))?;
        let rollback = RevisionTag::rollback_of(revision.clone());
        let mut inverse = change_revision(self.registry, &inverse, None, &rollback);
        let enricher = ChangeEnricher::new(&self.forest, &self.index);
        enricher.enrich(self.registry, &mut inverse, Some(&rollback))?;
        let delta = derive_delta(self.registry, &inverse, Some(&rollback), &mut self.index)?;
        self.forest.apply_delta(&delta)?;
        self.rollbacks.insert(revision.clone());
        self.local.push(LocalCommit {
            revision: rollback.clone(),
            change: inverse.clone(),
        });
        Ok(TaggedChange::new(rollback, inverse))
    }

    /// Ingests the commit the sequencer assigned `seq`, rebasing the local
    /// branch over it, and returns the net forest delta (already applied).
    pub fn add_sequenced_change(
        &mut self,
        tagged: &TaggedChange,
        session: SessionId,
        seq: SeqNumber,
        ref_seq: SeqNumber,
    ) -> EditManagerResult<Delta> {
        if seq != self.next_seq {
            return Err(EditManagerError::UnexpectedSeqNum {
                expected: self.next_seq,
                got: seq,
            });
        }
        let seq_tag = RevisionTag::sequenced(seq);
        self.compressor.associate(&tagged.revision, &seq_tag);
        self.compressor.normalize(&seq_tag);
        if let Some(target) = tagged.revision.rolled_back() {
            self.rollbacks.insert(target.clone());
        }

        if session == self.session {
            // Our own change coming back: the local branch already applied
            // it, so the forest does not move.
            let commit = match self.local.first() {
                Some(commit) if commit.revision == tagged.revision => self.local.remove(0),
                _ => {
                    return Err(EditManagerError::LocalBranchDesynchronized(
                        tagged.revision.clone(),
                    ));
                }
            };
            let change = change_revision(
                self.registry,
                &commit.change,
                Some(&commit.revision),
                &seq_tag,
            );
            self.index.rename_revision(&commit.revision, &seq_tag);
            self.trunk.push_back(TrunkCommit {
                seq,
                revision: seq_tag.clone(),
                session,
                change,
            });
            self.next_seq = seq.next();
            debug!(?seq, "sequenced own commit");
            return Ok(Delta {
                revision: Some(seq_tag),
                ..Delta::empty()
            });
        }

        // Bring the inbound commit from its reference context up to the
        // trunk head.
        let mut inbound = change_revision(
            self.registry,
            &tagged.change,
            Some(&tagged.revision),
            &seq_tag,
        );
        let inbound_rev = self.rev_info(&seq_tag);
        for commit in &self.trunk {
            if commit.seq > ref_seq {
                inbound = rebase_modular(
                    self.registry,
                    &inbound,
                    &inbound_rev,
                    &commit.change,
                    &self.rev_info(&commit.revision),
                )?;
            }
        }

        // Sandwich: rebase each local commit over the inbound change, with
        // the base evolving so later locals see their predecessors.
        let old_locals = std::mem::take(&mut self.local);
        let mut new_locals: Vec<LocalCommit> = vec![];
        let mut base = inbound.clone();
        let mut base_rev = inbound_rev.clone();
        for commit in &old_locals {
            let local_rev = self.rev_info(&commit.revision);
            let rebased = rebase_modular(
                self.registry,
                &commit.change,
                &local_rev,
                &base,
                &base_rev,
            )?;
            let inverse = invert_modular(self.registry, &commit.change, &local_rev)?;
            let rollback_rev =
                self.rev_info(&RevisionTag::rollback_of(commit.revision.clone()));
            base = self.compose_all(vec![
                (rollback_rev, inverse),
                (base_rev.clone(), base),
                (local_rev, rebased.clone()),
            ])?;
            base_rev = inbound_rev.clone();
            new_locals.push(LocalCommit {
                revision: commit.revision.clone(),
                change: rebased,
            });
        }

        // Net forest movement: peel the old local branch, apply the inbound
        // commit at the trunk, put the rebased branch back.
        let mut parts: Vec<(RevisionInfo, ModularChangeset)> = vec![];
        for commit in old_locals.iter().rev() {
            let local_rev = self.rev_info(&commit.revision);
            let inverse = invert_modular(self.registry, &commit.change, &local_rev)?;
            let rollback_rev =
                self.rev_info(&RevisionTag::rollback_of(commit.revision.clone()));
            parts.push((rollback_rev, inverse));
        }
        parts.push((inbound_rev, inbound.clone()));
        for commit in &new_locals {
            parts.push((self.rev_info(&commit.revision), commit.change.clone()));
        }
        let net = self.compose_all(parts)?;
        let delta = derive_delta(self.registry, &net, Some(&seq_tag), &mut self.index)?;
        self.forest.apply_delta(&delta)?;

        self.local = new_locals;
        self.trunk.push_back(TrunkCommit {
            seq,
            revision: seq_tag,
            session,
            change: inbound,
        });
        self.next_seq = seq.next();
        debug!(?seq, ?session, "sequenced remote commit");
        Ok(delta)
    }

    /// Records that a peer observed the op stream up to `seq`, and evicts
    /// trunk commits (and their detached state) no active peer still needs.
    pub fn advance_peer(&mut self, session: SessionId, seq: SeqNumber) {
        self.peer_heads.insert(session, seq);
        let min = self
            .peer_heads
            .values()
            .copied()
            .min()
            .unwrap_or(SeqNumber(0));
        self.min_retained = min;
        let referenced = self.locally_referenced_revisions();
        while let Some(front) = self.trunk.front() {
            if front.seq >= self.min_retained {
                break;
            }
            let commit = self.trunk.pop_front().unwrap();
            if !referenced.contains(&commit.revision) {
                for (root, count) in self.index.roots_for_revision(&commit.revision) {
                    self.forest.forget_detached(root, count);
                }
                self.index.remove_revision(&commit.revision);
            }
            debug!(seq = ?commit.seq, "evicted trunk commit");
        }
    }

    fn locally_referenced_revisions(&self) -> HashSet<RevisionTag> {
        let mut ids = vec![];
        for commit in &self.local {
            crate::modular::referenced_detached_node(
                self.registry,
                &commit.change.change,
                Some(&commit.revision),
                &mut ids,
            );
        }
        ids.into_iter().filter_map(|id| id.revision).collect()
    }

    // --- transactions ---

    /// Snapshots the local branch head. Changes added until `commit` or
    /// `abort` belong to the transaction.
    pub fn start_transaction(&mut self) {
        self.transactions.push(self.local.len());
    }

    /// Squashes the commits added since the snapshot into one commit
    /// reusing the first one's revision.
    pub fn commit_transaction(&mut self) -> EditManagerResult<Option<TaggedChange>> {
        let snapshot = self
            .transactions
            .pop()
            .ok_or(EditManagerError::NoTransaction)?;
        if self.local.len() <= snapshot {
            return Ok(None);
        }
        let added = self.local.split_off(snapshot);
        let revision = added[0].revision.clone();
        let mut parts = vec![];
        for commit in &added {
            parts.push((self.rev_info(&commit.revision), commit.change.clone()));
        }
        let squashed = self.compose_all(parts)?;
        self.local.push(LocalCommit {
            revision: revision.clone(),
            change: squashed.clone(),
        });
        Ok(Some(TaggedChange::new(revision, squashed)))
    }

    /// Rolls the local branch back to the snapshot, emitting (and applying)
    /// the inverse delta.
    pub fn abort_transaction(&mut self) -> EditManagerResult<Delta> {
        let snapshot = self
            .transactions
            .pop()
            .ok_or(EditManagerError::NoTransaction)?;
        let removed = self.local.split_off(snapshot);
        let mut parts = vec![];
        for commit in removed.iter().rev() {
            let local_rev = self.rev_info(&commit.revision);
            let inverse = invert_modular(self.registry, &commit.change, &local_rev)?;
            let rollback_rev =
                self.rev_info(&RevisionTag::rollback_of(commit.revision.clone()));
            parts.push((rollback_rev, inverse));
        }
        let net = self.compose_all(parts)?;
        let delta = derive_delta(self.registry, &net, None, &mut self.index)?;
        self.forest.apply_delta(&delta)?;
        Ok(delta)
    }

    // --- summaries ---

    pub fn summarize(&self) -> EditManagerSummary {
        EditManagerSummary {
            trunk: self
                .trunk
                .iter()
                .map(|commit| CommitSummary {
                    seq: Some(commit.seq),
                    revision: commit.revision.clone(),
                    session: commit.session,
                    change: commit.change.clone(),
                })
                .collect(),
            local: self
                .local
                .iter()
                .map(|commit| CommitSummary {
                    seq: None,
                    revision: commit.revision.clone(),
                    session: self.session,
                    change: commit.change.clone(),
                })
                .collect(),
            metadata: Some(SummaryMetadata {
                version: SUMMARY_FORMAT_VERSION,
            }),
        }
    }

    /// Reconstructs a manager from a summary. The forest and the index are
    /// loaded by their own collaborators and handed in.
    pub fn load(
        session: SessionId,
        forest: F,
        index: DetachedFieldIndex,
        summary: &EditManagerSummary,
    ) -> Self {
        let mut manager = EditManager::new(session, forest);
        manager.index = index;
        for commit in &summary.trunk {
            let Some(seq) = commit.seq else {
                continue;
            };
            manager.trunk.push_back(TrunkCommit {
                seq,
                revision: commit.revision.clone(),
                session: commit.session,
                change: commit.change.clone(),
            });
            manager.next_seq = seq.next();
        }
        let mut max_counter = None;
        for commit in &summary.local {
            if let RevisionTag::Anonymous {
                session: tag_session,
                counter,
            } = &commit.revision
            {
                if *tag_session == session {
                    max_counter = max_counter.max(Some(*counter));
                }
            }
            manager.local.push(LocalCommit {
                revision: commit.revision.clone(),
                change: commit.change.clone(),
            });
        }
        if let Some(counter) = max_counter {
            let mut minter = RevisionMinter::new(session);
            for _ in 0..=counter {
                minter.mint();
            }
            manager.minter = minter;
        }
        manager
    }
}
