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
//! The central collision constraint allocator
//!
//! [`CollisionConstraintAllocator`] is the single owner of every midphase,
//! every constraint and both active lists. A tick looks like this:
//!
//! ```text
//! advance_epoch
//! reset_active_constraints        (optional, outside detection)
//! begin_detect_collisions
//!   detection_context -> workers fill their ConstraintFactory
//! end_detect_collisions           (drain + merge)
//!   solver reads active_constraints / active_ccd_constraints
//! remove_particle ...             (any time outside detection)
//! prune_expired_midphases
//! ```
//!
//! Phase violations are programmer errors and panic.

use tracing::{debug, instrument};

use crate::arena::Arena;
use crate::collision::active::ConstraintStore;
use crate::collision::constraint::{Constraint, ConstraintId, ShapePairKey};
use crate::collision::cookie::Epoch;
use crate::collision::factory::ConstraintFactory;
use crate::collision::merge::{self, MergeScratch, MergeSettings, MergeSummary};
use crate::collision::midphase::{
    MidPhaseId, MidPhaseStore, ParticleCollisions, ParticlePairMidPhase, VisitResult,
};
use crate::config::{AllocatorConfig, ConfigError};
use crate::particle::ParticleHandle;
use crate::pool::{PoolStats, VecPool};
use crate::scheduler::TaskScheduler;

/// Read-only view of registered midphases and constraints
///
/// Handed to detection workers alongside their factories. It is `Copy` and
/// `Sync`, so every worker can hold its own.
#[derive(Clone, Copy)]
pub struct MidPhaseView<'a> {
    midphases: &'a MidPhaseStore,
    constraints: &'a Arena<Constraint>,
    epoch: Epoch,
}

impl<'a> MidPhaseView<'a> {
    /// Registered midphase for `{a, b}`, if any
    pub fn find_midphase(&self, a: ParticleHandle, b: ParticleHandle) -> Option<MidPhaseId> {
        self.midphases.find(a, b)
    }

    /// Look up a midphase
    pub fn midphase(&self, id: MidPhaseId) -> Option<&'a ParticlePairMidPhase> {
        self.midphases.get(id)
    }

    /// Look up a constraint
    pub fn constraint(&self, id: ConstraintId) -> Option<&'a Constraint> {
        self.constraints.get(id.0)
    }

    /// Constraint in `midphase` for the shape pair `shapes`
    pub fn find_constraint(&self, midphase: MidPhaseId, shapes: ShapePairKey) -> Option<ConstraintId> {
        let mut found = None;
        self.midphases.get(midphase)?.visit_collisions(self.constraints, |id, constraint| {
            if constraint.shape_pair_key() == shapes {
                found = Some(id);
                VisitResult::Stop
            } else {
                VisitResult::Continue
            }
        });
        found
    }

    /// Epoch of the detection pass
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }
}

/// Everything a detection pass needs: a shared view plus one factory per
/// worker slot
pub struct DetectionContext<'a> {
    /// Read-only lookups into registered state
    pub view: MidPhaseView<'a>,
    /// One factory per worker; hand each worker exactly one
    pub factories: &'a mut [ConstraintFactory],
}

/// Snapshot of allocator counters
#[derive(Debug, Clone, PartialEq)]
pub struct AllocatorStats {
    /// Current epoch
    pub epoch: Epoch,
    /// Registered midphases
    pub midphases: usize,
    /// Live constraints
    pub constraints: usize,
    /// Occupied active slots
    pub active_constraints: usize,
    /// Active slots including tombstones
    pub active_slots: usize,
    /// Occupied CCD slots
    pub active_ccd_constraints: usize,
    /// Counters from the most recent merge
    pub last_merge: MergeSummary,
    /// Midphase constraint-list pool
    pub constraint_list_pool: PoolStats,
}

/// Owner of all collision constraints and midphases
pub struct CollisionConstraintAllocator {
    config: AllocatorConfig,
    midphases: MidPhaseStore,
    constraints: ConstraintStore,
    factories: Vec<ConstraintFactory>,
    scheduler: TaskScheduler,
    constraint_lists: VecPool<ConstraintId>,
    removal_scratch: VecPool<MidPhaseId>,
    merge_scratch: MergeScratch,
    epoch: Epoch,
    in_detection: bool,
    last_merge: MergeSummary,
}

impl CollisionConstraintAllocator {
    /// Create an allocator
    ///
    /// # Panics
    ///
    /// Panics if the configuration does not validate.
    pub fn new(config: AllocatorConfig) -> Self {
        match Self::try_new(config) {
            Ok(allocator) => allocator,
            Err(err) => panic!("Invalid allocator configuration: {err}"),
        }
    }

    /// Create an allocator, rejecting an invalid configuration
    pub fn try_new(config: AllocatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        debug!(
            workers = config.worker_count,
            deterministic = config.deterministic,
            min_batch_size = config.min_batch_size,
            "creating collision constraint allocator"
        );
        Ok(CollisionConstraintAllocator {
            factories: (0..config.worker_count).map(ConstraintFactory::new).collect(),
            scheduler: TaskScheduler::new(config.worker_count),
            constraint_lists: VecPool::with_config(config.pool.clone()),
            removal_scratch: VecPool::new(),
            merge_scratch: MergeScratch::default(),
            midphases: MidPhaseStore::default(),
            constraints: ConstraintStore::default(),
            epoch: Epoch::ZERO,
            in_detection: false,
            last_merge: MergeSummary::default(),
            config,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Current epoch
    pub fn current_epoch(&self) -> Epoch {
        self.epoch
    }

    /// Advance the epoch by one and return it
    ///
    /// Called once per tick by the simulation loop, before detection.
    pub fn advance_epoch(&mut self) -> Epoch {
        assert!(!self.in_detection, "Cannot advance the epoch during collision detection");
        self.epoch = self.epoch.next();
        self.epoch
    }

    /// Whether a detection pass is running
    pub fn is_detecting(&self) -> bool {
        self.in_detection
    }

    /// Enable or disable deterministic merging
    pub fn set_deterministic(&mut self, deterministic: bool) {
        self.config.deterministic = deterministic;
    }

    /// Whether merging is deterministic
    pub fn is_deterministic(&self) -> bool {
        self.config.deterministic
    }

    /// Change the number of worker slots
    ///
    /// Rebuilds the factories and the worker pool.
    ///
    /// # Panics
    ///
    /// Panics during detection or if `worker_count` is zero.
    pub fn set_worker_count(&mut self, worker_count: usize) {
        assert!(!self.in_detection, "Cannot change workers during collision detection");
        assert!(worker_count > 0, "Worker count must be positive");
        self.config.worker_count = worker_count;
        self.factories = (0..worker_count).map(ConstraintFactory::new).collect();
        self.scheduler = TaskScheduler::new(worker_count);
    }

    /// Number of worker slots
    pub fn worker_count(&self) -> usize {
        self.factories.len()
    }

    // Detection

    /// Enter the detection phase
    ///
    /// Active entries left over from an earlier epoch are dropped first, so
    /// skipping [`reset_active_constraints`](Self::reset_active_constraints)
    /// never lists a constraint twice. Entries added this epoch are kept.
    ///
    /// # Panics
    ///
    /// Panics if detection is already running.
    #[instrument(level = "debug", skip(self), fields(epoch = %self.epoch))]
    pub fn begin_detect_collisions(&mut self) {
        assert!(!self.in_detection, "Collision detection already in progress");
        let retired = self.constraints.retire_stale(self.epoch);
        if retired > 0 {
            debug!(retired, "dropped active constraints from an earlier epoch");
        }
        self.in_detection = true;
        for factory in &mut self.factories {
            factory.begin(self.epoch);
        }
    }

    /// Shared view plus the per-worker factories
    ///
    /// # Panics
    ///
    /// Panics outside the detection phase.
    pub fn detection_context(&mut self) -> DetectionContext<'_> {
        assert!(self.in_detection, "Detection context requested outside collision detection");
        DetectionContext {
            view: MidPhaseView {
                midphases: &self.midphases,
                constraints: &self.constraints.arena,
                epoch: self.epoch,
            },
            factories: &mut self.factories,
        }
    }

    /// Read-only view of registered state
    pub fn view(&self) -> MidPhaseView<'_> {
        MidPhaseView {
            midphases: &self.midphases,
            constraints: &self.constraints.arena,
            epoch: self.epoch,
        }
    }

    /// Leave the detection phase and merge everything the factories produced
    ///
    /// # Panics
    ///
    /// Panics if detection is not running.
    #[instrument(level = "debug", skip(self), fields(epoch = %self.epoch))]
    pub fn end_detect_collisions(&mut self) -> MergeSummary {
        assert!(self.in_detection, "end_detect_collisions called outside collision detection");
        self.in_detection = false;
        self.process_new_items()
    }

    fn process_new_items(&mut self) -> MergeSummary {
        let settings = MergeSettings {
            epoch: self.epoch,
            deterministic: self.config.deterministic,
            min_batch_size: self.config.min_batch_size,
        };
        let mut summary = MergeSummary::default();
        let drained = merge::drain_factories(
            &mut self.factories,
            &mut self.constraints,
            &self.constraint_lists,
            &self.merge_scratch,
            settings,
            &mut summary,
        );
        merge::process_new_items(
            &mut self.midphases,
            &mut self.constraints,
            drained,
            &self.scheduler,
            &self.constraint_lists,
            &self.merge_scratch,
            settings,
            &mut summary,
        );
        self.last_merge = summary;
        summary
    }

    // Active lists

    /// Clear per-tick flags on active constraints and empty both active lists
    ///
    /// # Panics
    ///
    /// Panics during detection.
    pub fn reset_active_constraints(&mut self) {
        assert!(!self.in_detection, "Cannot reset active constraints during collision detection");
        self.constraints.reset_active();
    }

    /// Put a constraint in the active lists for this epoch
    ///
    /// Adding a constraint that is already active this epoch does nothing.
    /// Returns true if the constraint was added.
    ///
    /// # Panics
    ///
    /// Panics during detection.
    pub fn add_active_constraint(&mut self, id: ConstraintId) -> bool {
        assert!(!self.in_detection, "Cannot add active constraints during collision detection");
        self.constraints.add_active(id, self.epoch)
    }

    /// Tombstone a constraint's active slots
    ///
    /// A constraint that is not active this epoch is left alone. Returns true
    /// if a slot was cleared.
    ///
    /// # Panics
    ///
    /// Panics during detection.
    pub fn remove_active_constraint(&mut self, id: ConstraintId) -> bool {
        assert!(!self.in_detection, "Cannot remove active constraints during collision detection");
        self.constraints.remove_active(id, self.epoch)
    }

    /// Active constraints in slot order, skipping tombstones
    pub fn active_constraints(&self) -> impl Iterator<Item = ConstraintId> + '_ {
        self.constraints.active.iter().flatten().copied()
    }

    /// Active CCD constraints in slot order, skipping tombstones
    pub fn active_ccd_constraints(&self) -> impl Iterator<Item = ConstraintId> + '_ {
        self.constraints.active_ccd.iter().flatten().copied()
    }

    /// Raw active slots; `None` marks a removed constraint
    pub fn active_constraint_slots(&self) -> &[Option<ConstraintId>] {
        &self.constraints.active
    }

    /// Raw CCD slots; `None` marks a removed constraint
    pub fn active_ccd_constraint_slots(&self) -> &[Option<ConstraintId>] {
        &self.constraints.active_ccd
    }

    /// Number of occupied active slots
    pub fn num_active_constraints(&self) -> usize {
        self.constraints.num_active()
    }

    // Midphases and constraints

    /// Look up a midphase
    pub fn midphase(&self, id: MidPhaseId) -> Option<&ParticlePairMidPhase> {
        self.midphases.get(id)
    }

    /// Look up a constraint
    pub fn constraint(&self, id: ConstraintId) -> Option<&Constraint> {
        self.constraints.get(id)
    }

    /// Enable or disable solving of a constraint
    ///
    /// Returns false if the constraint no longer exists.
    pub fn set_constraint_disabled(&mut self, id: ConstraintId, disabled: bool) -> bool {
        match self.constraints.get_mut(id) {
            Some(constraint) => {
                constraint.set_disabled(disabled);
                true
            }
            None => false,
        }
    }

    /// Global midphase list
    pub fn midphase_list(&self) -> &[MidPhaseId] {
        &self.midphases.list
    }

    /// Number of registered midphases
    pub fn num_midphases(&self) -> usize {
        self.midphases.list.len()
    }

    /// Number of live constraints
    pub fn num_constraints(&self) -> usize {
        self.constraints.arena.len()
    }

    /// Mark a midphase as part of a sleeping island; sleeping midphases are
    /// never pruned
    ///
    /// Returns false if the midphase no longer exists.
    pub fn set_midphase_sleeping(&mut self, id: MidPhaseId, sleeping: bool) -> bool {
        match self.midphases.get_mut(id) {
            Some(midphase) => {
                midphase.set_sleeping(sleeping);
                true
            }
            None => false,
        }
    }

    /// The midphases `particle` is attached to
    pub fn collisions_of(&self, particle: ParticleHandle) -> Option<&ParticleCollisions> {
        self.midphases.collisions_of(particle)
    }

    /// Iterate `particle`'s midphases
    pub fn midphases_of(
        &self,
        particle: ParticleHandle,
    ) -> impl Iterator<Item = (MidPhaseId, &ParticlePairMidPhase)> + '_ {
        self.midphases
            .collisions_of(particle)
            .map(ParticleCollisions::midphases)
            .unwrap_or_default()
            .iter()
            .filter_map(move |&id| self.midphases.get(id).map(|midphase| (id, midphase)))
    }

    /// Visit `particle`'s midphases until the visitor stops
    pub fn visit_midphases<F>(&self, particle: ParticleHandle, mut visitor: F) -> VisitResult
    where
        F: FnMut(MidPhaseId, &ParticlePairMidPhase) -> VisitResult,
    {
        for (id, midphase) in self.midphases_of(particle) {
            if visitor(id, midphase) == VisitResult::Stop {
                return VisitResult::Stop;
            }
        }
        VisitResult::Continue
    }

    /// Visit a midphase's constraints until the visitor stops
    pub fn visit_collisions<F>(&self, midphase: MidPhaseId, visitor: F) -> VisitResult
    where
        F: FnMut(ConstraintId, &Constraint) -> VisitResult,
    {
        match self.midphases.get(midphase) {
            Some(midphase) => midphase.visit_collisions(&self.constraints.arena, visitor),
            None => VisitResult::Continue,
        }
    }

    // Lifecycle

    /// Drop every active constraint involving `particle` and detach the
    /// particle from its midphases
    ///
    /// The midphases stay in the global list, orphaned, until pruned. Call
    /// exactly once per particle, before its handle is invalidated. Returns
    /// the number of midphases detached.
    ///
    /// # Panics
    ///
    /// Panics during detection.
    #[instrument(level = "debug", skip(self), fields(epoch = %self.epoch))]
    pub fn remove_particle(&mut self, particle: ParticleHandle) -> usize {
        assert!(!self.in_detection, "Cannot remove a particle during collision detection");
        // Detaching reorders the particle's list, so walk a copy
        let mut attached = self.removal_scratch.acquire(0);
        match self.midphases.collisions_of(particle) {
            Some(collisions) => attached.extend_from_slice(collisions.midphases()),
            None => return 0,
        }

        for &id in attached.iter() {
            if let Some(midphase) = self.midphases.get_mut(id) {
                // Slots from an earlier epoch count too when nobody reset the lists
                for &constraint in midphase.constraints() {
                    self.constraints.evict(constraint);
                }
                midphase.set_sleeping(false);
            }
            self.midphases.detach_particle(id, particle);
        }
        attached.len()
    }

    /// Destroy midphases not used this epoch unless they are sleeping
    ///
    /// Surviving awake midphases also drop constraints that were not active
    /// this epoch. Returns the number of midphases destroyed.
    ///
    /// # Panics
    ///
    /// Panics during detection.
    #[instrument(level = "debug", skip(self), fields(epoch = %self.epoch))]
    pub fn prune_expired_midphases(&mut self) -> usize {
        assert!(!self.in_detection, "Cannot prune midphases during collision detection");
        let epoch = self.epoch;
        let mut pruned = 0;
        let mut expired_constraints = 0;

        // Reverse so swap_remove only moves already-visited entries
        for index in (0..self.midphases.list.len()).rev() {
            let id = self.midphases.list[index];
            let Some(midphase) = self.midphases.get_mut(id) else {
                debug_assert!(false, "stale midphase {id} in the global list");
                self.midphases.list.swap_remove(index);
                continue;
            };

            if !midphase.is_used_since(epoch) && !midphase.is_sleeping() {
                let mut owned = midphase.take_constraints();
                for &constraint in &owned {
                    self.constraints.destroy(constraint);
                }
                expired_constraints += owned.len();
                owned.clear();
                self.constraint_lists.recycle(owned);
                self.midphases.destroy(id);
                self.midphases.list.swap_remove(index);
                pruned += 1;
            } else if !midphase.is_sleeping() {
                let constraints = &mut self.constraints;
                midphase.retain_constraints(|&constraint| {
                    let active = constraints
                        .get(constraint)
                        .map_or(false, |c| c.is_active_in(epoch));
                    if !active {
                        constraints.destroy(constraint);
                        expired_constraints += 1;
                    }
                    active
                });
            }
        }

        let list = &mut self.midphases.list;
        if list.capacity() - list.len() > self.config.shrink_slack {
            list.shrink_to_fit();
        }

        debug!(
            pruned,
            expired_constraints,
            remaining = self.midphases.list.len(),
            "pruned expired midphases"
        );
        pruned
    }

    /// Drop every midphase and constraint and empty the active lists
    ///
    /// # Panics
    ///
    /// Panics during detection.
    pub fn reset(&mut self) {
        assert!(!self.in_detection, "Cannot reset the allocator during collision detection");
        self.midphases.clear();
        self.constraints.clear();
        for factory in &mut self.factories {
            factory.drain();
        }
        self.last_merge = MergeSummary::default();
    }

    /// Snapshot of counters
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            epoch: self.epoch,
            midphases: self.num_midphases(),
            constraints: self.num_constraints(),
            active_constraints: self.num_active_constraints(),
            active_slots: self.constraints.active.len(),
            active_ccd_constraints: self.constraints.active_ccd.iter().flatten().count(),
            last_merge: self.last_merge,
            constraint_list_pool: self.constraint_lists.stats(),
        }
    }
}

impl Default for CollisionConstraintAllocator {
    fn default() -> Self {
        Self::new(AllocatorConfig::default())
    }
}
