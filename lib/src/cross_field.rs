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

//! The per-operation coordinator that lets one field's algebra hand
//! child changes or renames to another field's algebra.
//!
//! A single modular compose/invert/rebase runs in two passes: the first pass
//! runs every field algebra, which may post messages here keyed by change
//! atom id; the second pass lets each field consume the messages addressed
//! to ids it owns.

use std::collections::{HashMap, HashSet};

use crate::modular::NodeChangeset;
use crate::revision::ChangeAtomId;

#[derive(Debug, Default)]
pub struct CrossFieldManager {
    /// Compose: nested changes the second changeset applied at an attach
    /// location, addressed to the detach location that owns the node.
    moved_changes: HashMap<ChangeAtomId, NodeChangeset>,
    /// Compose: attach-then-detach pairs that net out to a rename of
    /// detached content.
    renames: HashMap<ChangeAtomId, ChangeAtomId>,
    /// Compose: detach-then-attach pairs that cancelled out entirely.
    cancelled: HashSet<ChangeAtomId>,
    /// Rebase: cells the base change detached, keyed by the id the rebased
    /// change knew them under, valued by the base's detach id.
    base_detaches: HashMap<ChangeAtomId, ChangeAtomId>,
    /// Rebase: nested changes that must follow a node to the location the
    /// base attached it at.
    follow_changes: HashMap<ChangeAtomId, NodeChangeset>,
    /// Invert: endpoints whose direction was swapped.
    inverted_detaches: HashSet<ChangeAtomId>,
    inverted_attaches: HashSet<ChangeAtomId>,
    /// Set once every field had a chance to claim the messages addressed to
    /// its detaches; senders may then take unclaimed messages back.
    reclaim: bool,
}

impl CrossFieldManager {
    pub fn new() -> Self {
        CrossFieldManager::default()
    }

    // --- compose ---

    /// Records that the first changeset attached content under `attach_id`
    /// and the second detached the same content under `detach_id`.
    pub fn compose_attach_detach(&mut self, attach_id: ChangeAtomId, detach_id: ChangeAtomId) {
        self.renames.insert(attach_id, detach_id);
    }

    /// Records that the first changeset detached content under `detach_id`
    /// and the second attached it again, cancelling the pair.
    pub fn compose_detach_attach(&mut self, detach_id: ChangeAtomId) {
        self.cancelled.insert(detach_id);
    }

    /// Addresses nested changes made at an attach location to the field that
    /// owns the node's source location.
    pub fn send_new_changes_to_base_source_location(
        &mut self,
        id: ChangeAtomId,
        changes: NodeChangeset,
    ) {
        self.moved_changes.insert(id, changes);
    }

    pub fn take_moved_changes(&mut self, id: &ChangeAtomId) -> Option<NodeChangeset> {
        self.moved_changes.remove(id)
    }

    /// Starts the reclaim round of the second pass: detach owners have had
    /// their chance, so a field may take back messages it sent for an attach
    /// whose source turned out not to be a detach (e.g. a build).
    pub fn begin_reclaim(&mut self) {
        self.reclaim = true;
    }

    pub fn is_reclaim_phase(&self) -> bool {
        self.reclaim
    }

    pub fn rename_for(&self, id: &ChangeAtomId) -> Option<&ChangeAtomId> {
        self.renames.get(id)
    }

    pub fn is_cancelled(&self, id: &ChangeAtomId) -> bool {
        self.cancelled.contains(id)
    }

    // --- rebase ---

    /// Records that the base detached the cells the rebased change knew
    /// under `id`, giving them the base's `detach_id`.
    pub fn rebase_over_detach(&mut self, id: ChangeAtomId, detach_id: ChangeAtomId) {
        self.base_detaches.insert(id, detach_id);
    }

    pub fn base_detach_for(&self, id: &ChangeAtomId) -> Option<&ChangeAtomId> {
        self.base_detaches.get(id)
    }

    /// Queues nested changes to be re-emitted at the location the base
    /// attached the node at.
    pub fn send_changes_to_base_attach(&mut self, id: ChangeAtomId, changes: NodeChangeset) {
        self.follow_changes.insert(id, changes);
    }

    /// Retrieves nested changes queued for the base attach under `id`.
    pub fn get_new_changes_for_base_attach(&mut self, id: &ChangeAtomId) -> Option<NodeChangeset> {
        self.follow_changes.remove(id)
    }

    // --- invert ---

    pub fn invert_detach(&mut self, id: ChangeAtomId) {
        self.inverted_detaches.insert(id);
    }

    pub fn invert_attach(&mut self, id: ChangeAtomId) {
        self.inverted_attaches.insert(id);
    }

    pub fn was_detach_inverted(&self, id: &ChangeAtomId) -> bool {
        self.inverted_detaches.contains(id)
    }

    pub fn was_attach_inverted(&self, id: &ChangeAtomId) -> bool {
        self.inverted_attaches.contains(id)
    }
}
