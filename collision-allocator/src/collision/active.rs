// Copyright 2025 John Brosnihan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Constraint storage and the active lists
//!
//! Removal tombstones a slot (`None`) instead of compacting, so the index of
//! every other active constraint stays put for the rest of the epoch.
//! Readers of the active lists skip `None` slots.

use tracing::warn;

use crate::arena::Arena;
use crate::collision::constraint::{Constraint, ConstraintId};
use crate::collision::cookie::{ConstraintCookie, Epoch};

#[derive(Default)]
pub(crate) struct ConstraintStore {
    pub(crate) arena: Arena<Constraint>,
    pub(crate) active: Vec<Option<ConstraintId>>,
    pub(crate) active_ccd: Vec<Option<ConstraintId>>,
    /// Constraints activated by the last detection pass, waiting to be
    /// stamped and appended to `active`
    pub(crate) new_active: Vec<ConstraintId>,
}

impl ConstraintStore {
    pub(crate) fn get(&self, id: ConstraintId) -> Option<&Constraint> {
        self.arena.get(id.0)
    }

    pub(crate) fn get_mut(&mut self, id: ConstraintId) -> Option<&mut Constraint> {
        self.arena.get_mut(id.0)
    }

    /// Put `id` in the active lists unless it is already there this epoch
    ///
    /// Returns true if the constraint was added.
    pub(crate) fn add_active(&mut self, id: ConstraintId, epoch: Epoch) -> bool {
        match self.arena.get(id.0) {
            Some(constraint) if !constraint.cookie().is_current(epoch) => {
                self.add_active_unchecked(id, epoch);
                true
            }
            _ => false,
        }
    }

    // Only reachable through `add_active`, which owns the idempotence check.
    fn add_active_unchecked(&mut self, id: ConstraintId, epoch: Epoch) {
        let Some(constraint) = self.arena.get_mut(id.0) else {
            return;
        };
        let mut cookie = ConstraintCookie::active(epoch, self.active.len());
        self.active.push(Some(id));
        if constraint.is_ccd_enabled() {
            cookie.ccd_constraint_index = Some(self.active_ccd.len());
            self.active_ccd.push(Some(id));
        }
        constraint.set_cookie(cookie);
    }

    /// Tombstone `id`'s active slots
    ///
    /// A stale cookie means the constraint is not in this epoch's lists and
    /// nothing happens. Returns true if a slot was cleared.
    pub(crate) fn remove_active(&mut self, id: ConstraintId, epoch: Epoch) -> bool {
        let Some(constraint) = self.arena.get(id.0) else {
            return false;
        };
        let cookie = *constraint.cookie();
        if !cookie.is_current(epoch) {
            return false;
        }

        // Check both slots before touching either so a corrupt cookie leaves
        // the lists untouched.
        let main_ok = cookie
            .constraint_index
            .map_or(true, |index| self.active.get(index) == Some(&Some(id)));
        let ccd_ok = cookie
            .ccd_constraint_index
            .map_or(true, |index| self.active_ccd.get(index) == Some(&Some(id)));
        if !(main_ok && ccd_ok) {
            debug_assert!(false, "active slot for {id} does not point back at it: {cookie:?}");
            warn!(%id, ?cookie, "refusing to remove constraint with corrupt cookie");
            return false;
        }

        let mut removed = false;
        if let Some(index) = cookie.constraint_index {
            self.active[index] = None;
            removed = true;
        }
        if let Some(index) = cookie.ccd_constraint_index {
            self.active_ccd[index] = None;
        }
        if let Some(constraint) = self.arena.get_mut(id.0) {
            constraint.cookie_mut().clear();
        }
        removed
    }

    /// Clear transient flags on every live active constraint, then empty
    /// both active lists
    pub(crate) fn reset_active(&mut self) {
        for id in self.active.drain(..).flatten() {
            if let Some(constraint) = self.arena.get_mut(id.0) {
                constraint.begin_tick();
            }
        }
        self.active_ccd.clear();
    }

    /// Drop every entry left over from an earlier epoch
    ///
    /// Entries activated in `epoch` are kept in order and re-stamped, so
    /// their indices may move. Tombstones are compacted away. Returns the
    /// number of stale entries dropped.
    pub(crate) fn retire_stale(&mut self, epoch: Epoch) -> usize {
        // A slot is current when its constraint's cookie was stamped this
        // epoch for exactly that slot; a re-added constraint leaves its old
        // slot behind
        let arena = &self.arena;
        let is_current = |index: usize, id: ConstraintId| {
            arena
                .get(id.0)
                .map_or(false, |c| c.cookie().constraint_index_in(epoch) == Some(index))
        };
        let all_current = self
            .active
            .iter()
            .enumerate()
            .all(|(index, &slot)| slot.map_or(true, |id| is_current(index, id)));
        if all_current {
            return 0;
        }

        let mut kept = Vec::with_capacity(self.active.len());
        let mut retired = 0;
        for (index, slot) in self.active.iter().enumerate() {
            let Some(id) = *slot else {
                continue;
            };
            if is_current(index, id) {
                kept.push(id);
            } else {
                retired += 1;
            }
        }
        for id in self.active.drain(..).flatten() {
            if let Some(constraint) = self.arena.get_mut(id.0) {
                if !constraint.cookie().is_current(epoch) {
                    constraint.begin_tick();
                }
            }
        }
        self.active_ccd.clear();
        for id in kept {
            self.add_active_unchecked(id, epoch);
        }
        retired
    }

    /// Tombstone any slot that still holds `id`, whatever epoch its cookie
    /// was stamped in
    ///
    /// For constraints that must not stay listed: destroyed ones and those
    /// of a removed particle. Returns true if a main-list slot was cleared.
    pub(crate) fn evict(&mut self, id: ConstraintId) -> bool {
        let Some(constraint) = self.arena.get_mut(id.0) else {
            return false;
        };
        let cookie = *constraint.cookie();
        constraint.cookie_mut().clear();

        let mut removed = false;
        if let Some(slot) = cookie.constraint_index.and_then(|index| self.active.get_mut(index)) {
            if *slot == Some(id) {
                *slot = None;
                removed = true;
            }
        }
        if let Some(slot) = cookie.ccd_constraint_index.and_then(|index| self.active_ccd.get_mut(index)) {
            if *slot == Some(id) {
                *slot = None;
            }
        }
        removed
    }

    /// Remove `id` from the active lists and free it
    pub(crate) fn destroy(&mut self, id: ConstraintId) -> Option<Constraint> {
        self.evict(id);
        self.arena.remove(id.0)
    }

    pub(crate) fn num_active(&self) -> usize {
        self.active.iter().filter(|slot| slot.is_some()).count()
    }

    pub(crate) fn clear(&mut self) {
        self.arena.clear();
        self.active.clear();
        self.active_ccd.clear();
        self.new_active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{CollisionShape, ImplicitId, ShapePairType};
    use crate::particle::ParticleHandle;

    fn insert(store: &mut ConstraintStore, b: u64, ccd: bool) -> ConstraintId {
        let shape = CollisionShape::primitive(ImplicitId(0));
        let constraint = Constraint::new(
            ParticleHandle::new(0, 0),
            shape,
            ParticleHandle::new(b, 0),
            shape,
            0.1,
            false,
            ShapePairType::Unknown,
        )
        .with_ccd(ccd);
        ConstraintId(store.arena.insert(constraint))
    }

    #[test]
    fn test_add_active_is_idempotent() {
        let mut store = ConstraintStore::default();
        let epoch = Epoch::new(1);
        let id = insert(&mut store, 1, true);

        assert!(store.add_active(id, epoch));
        for _ in 0..5 {
            assert!(!store.add_active(id, epoch));
        }
        assert_eq!(store.active, vec![Some(id)]);
        assert_eq!(store.active_ccd, vec![Some(id)]);

        let cookie = *store.get(id).unwrap().cookie();
        assert_eq!(cookie.constraint_index_in(epoch), Some(0));
        assert_eq!(cookie.ccd_constraint_index_in(epoch), Some(0));
    }

    #[test]
    fn test_non_ccd_constraint_skips_ccd_list() {
        let mut store = ConstraintStore::default();
        let id = insert(&mut store, 1, false);
        store.add_active(id, Epoch::new(1));
        assert_eq!(store.active.len(), 1);
        assert!(store.active_ccd.is_empty());
        assert_eq!(store.get(id).unwrap().cookie().ccd_constraint_index, None);
    }

    #[test]
    fn test_remove_tombstones_without_shifting() {
        let mut store = ConstraintStore::default();
        let epoch = Epoch::new(2);
        let ids: Vec<_> = (1..=3).map(|b| insert(&mut store, b, true)).collect();
        for &id in &ids {
            store.add_active(id, epoch);
        }

        assert!(store.remove_active(ids[1], epoch));
        assert_eq!(store.active, vec![Some(ids[0]), None, Some(ids[2])]);
        assert_eq!(store.active_ccd, vec![Some(ids[0]), None, Some(ids[2])]);
        assert_eq!(store.get(ids[2]).unwrap().cookie().constraint_index_in(epoch), Some(2));
        assert_eq!(store.num_active(), 2);

        // Removing again is a no-op
        assert!(!store.remove_active(ids[1], epoch));
    }

    #[test]
    fn test_stale_removal_is_noop() {
        let mut store = ConstraintStore::default();
        let id = insert(&mut store, 1, true);
        store.add_active(id, Epoch::new(1));

        assert!(!store.remove_active(id, Epoch::new(2)));
        assert_eq!(store.active, vec![Some(id)]);
        assert_eq!(store.active_ccd, vec![Some(id)]);
    }

    #[test]
    fn test_removed_constraint_can_be_added_again() {
        let mut store = ConstraintStore::default();
        let epoch = Epoch::new(1);
        let id = insert(&mut store, 1, false);
        store.add_active(id, epoch);
        store.remove_active(id, epoch);
        assert!(store.add_active(id, epoch));
        assert_eq!(store.active, vec![None, Some(id)]);
    }

    #[test]
    fn test_reset_clears_lists_and_transient_flags() {
        use crate::collision::constraint::ConstraintFlags;

        let mut store = ConstraintStore::default();
        let id = insert(&mut store, 1, true);
        store.get_mut(id).unwrap().insert_flags(ConstraintFlags::NEW_THIS_TICK);
        store.add_active(id, Epoch::new(1));

        store.reset_active();
        assert!(store.active.is_empty());
        assert!(store.active_ccd.is_empty());
        assert!(!store.get(id).unwrap().flags().contains(ConstraintFlags::NEW_THIS_TICK));
    }

    #[test]
    fn test_destroy_removes_from_lists() {
        let mut store = ConstraintStore::default();
        let epoch = Epoch::new(1);
        let id = insert(&mut store, 1, true);
        store.add_active(id, epoch);
        assert!(store.destroy(id).is_some());
        assert_eq!(store.active, vec![None]);
        assert_eq!(store.active_ccd, vec![None]);
        assert!(store.get(id).is_none());
    }

    #[test]
    fn test_destroy_clears_slot_from_earlier_epoch() {
        let mut store = ConstraintStore::default();
        let id = insert(&mut store, 1, true);
        store.add_active(id, Epoch::new(1));

        // The lists were never reset, so the slot outlived its epoch
        assert!(store.destroy(id).is_some());
        assert_eq!(store.active, vec![None]);
        assert_eq!(store.active_ccd, vec![None]);
        assert_eq!(store.num_active(), 0);
    }

    #[test]
    fn test_evict_leaves_foreign_slots_alone() {
        let mut store = ConstraintStore::default();
        let first = insert(&mut store, 1, false);
        let second = insert(&mut store, 2, false);
        store.add_active(first, Epoch::new(1));
        store.reset_active();
        store.add_active(second, Epoch::new(2));

        // `first` still remembers slot 0, which now belongs to `second`
        assert!(!store.evict(first));
        assert_eq!(store.active, vec![Some(second)]);
        assert!(store.evict(second));
        assert_eq!(store.active, vec![None]);
        assert!(!store.get(second).unwrap().cookie().is_current(Epoch::new(2)));
    }

    #[test]
    fn test_retire_stale_keeps_current_entries() {
        let mut store = ConstraintStore::default();
        let old = insert(&mut store, 1, true);
        let fresh = insert(&mut store, 2, true);
        store.add_active(old, Epoch::new(1));

        let epoch = Epoch::new(2);
        store.add_active(fresh, epoch);
        assert_eq!(store.active, vec![Some(old), Some(fresh)]);

        assert_eq!(store.retire_stale(epoch), 1);
        assert_eq!(store.active, vec![Some(fresh)]);
        assert_eq!(store.active_ccd, vec![Some(fresh)]);
        let cookie = store.get(fresh).unwrap().cookie();
        assert_eq!(cookie.constraint_index_in(epoch), Some(0));
        assert_eq!(cookie.ccd_constraint_index_in(epoch), Some(0));

        // Nothing stale left
        assert_eq!(store.retire_stale(epoch), 0);
        assert_eq!(store.active, vec![Some(fresh)]);
    }
}
