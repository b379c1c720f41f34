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
//! Merging factory output into the shared lists
//!
//! Runs once per tick when detection ends:
//!
//! 1. [`drain_factories`] moves every factory buffer out in factory order,
//!    inserts new constraints into the arena and builds the new-active list.
//!    This is the only point where worker output meets shared state.
//! 2. [`process_new_items`] registers new midphases while, concurrently,
//!    stamping cookies for the new-active list.
//!
//! With determinism enabled every ordering below is a function of particle
//! and shape identity, so the result does not depend on how pairs were
//! spread across workers or on how many workers ran.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace, warn};

use crate::collision::active::ConstraintStore;
use crate::collision::constraint::{Constraint, ConstraintFlags, ConstraintId, ConstraintKey};
use crate::collision::cookie::{ConstraintCookie, Epoch};
use crate::collision::factory::{ConstraintFactory, MidPhaseRef};
use crate::collision::midphase::{MidPhaseId, MidPhaseKey, MidPhaseStore, ParticlePairMidPhase};
use crate::particle::ParticleHandle;
use crate::pool::VecPool;
use crate::scheduler::{BatchPlan, TaskScheduler};

/// Merge-time knobs copied out of the allocator config
#[derive(Debug, Clone, Copy)]
pub(crate) struct MergeSettings {
    pub(crate) epoch: Epoch,
    pub(crate) deterministic: bool,
    pub(crate) min_batch_size: usize,
}

/// A midphase drained from a factory, not yet registered
#[derive(Debug)]
pub(crate) struct NewMidPhase {
    key: MidPhaseKey,
    particles: [ParticleHandle; 2],
    constraints: Vec<ConstraintId>,
}

/// Reusable buffers for the per-tick merge arrays
#[derive(Default)]
pub(crate) struct MergeScratch {
    midphases: VecPool<NewMidPhase>,
    pending: VecPool<(MidPhaseRef, Constraint)>,
    activations: VecPool<(ConstraintKey, ConstraintId)>,
}

/// Midphase work left over after draining
#[derive(Debug, Default)]
pub(crate) struct DrainedMidPhases {
    pub(crate) midphases: Vec<NewMidPhase>,
    /// New constraints that belong to an already registered midphase
    pub(crate) attachments: Vec<(MidPhaseId, ConstraintId)>,
    /// Registered midphases re-detected this tick
    pub(crate) touched: Vec<MidPhaseId>,
}

/// Counters from one merge, for logging and stats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Midphases registered
    pub new_midphases: usize,
    /// Pending midphases folded into another with the same key
    pub coalesced_midphases: usize,
    /// Constraints created
    pub new_constraints: usize,
    /// Duplicate pending constraints dropped
    pub dropped_constraints: usize,
    /// Constraints appended to the active list
    pub activated: usize,
    /// Constraints appended to the CCD list
    pub activated_ccd: usize,
}

/// Pull every factory's output, in factory order
///
/// New constraints get arena ids here, in key order when deterministic, and
/// the new-active list is filled with them plus any re-activated constraints
/// that are still alive and not already active this epoch.
pub(crate) fn drain_factories(
    factories: &mut [ConstraintFactory],
    constraints: &mut ConstraintStore,
    constraint_lists: &VecPool<ConstraintId>,
    scratch: &MergeScratch,
    settings: MergeSettings,
    summary: &mut MergeSummary,
) -> DrainedMidPhases {
    let midphase_count: usize = factories.iter().map(|f| f.num_pending_midphases()).sum();
    let constraint_count: usize = factories.iter().map(|f| f.num_pending_constraints()).sum();

    let mut drained = DrainedMidPhases {
        midphases: scratch.midphases.take(midphase_count),
        ..DrainedMidPhases::default()
    };
    let mut pending = scratch.pending.acquire(constraint_count);
    let mut reactivated = Vec::new();

    // Two workers may both have created a midphase for the same pair; fold
    // them together here so their constraints land in one list in key order
    let mut index_by_key = HashMap::with_capacity(midphase_count);
    for factory in factories.iter_mut() {
        let output = factory.drain();
        let local_to_global: Vec<usize> = output
            .midphases
            .into_iter()
            .map(|midphase| {
                let next = drained.midphases.len();
                let index = *index_by_key.entry(midphase.key).or_insert(next);
                if index == next {
                    drained.midphases.push(NewMidPhase {
                        key: midphase.key,
                        particles: midphase.particles,
                        constraints: constraint_lists.take(0),
                    });
                } else {
                    warn!(
                        worker = factory.worker_index(),
                        first = %midphase.key.first(),
                        second = %midphase.key.second(),
                        "coalescing duplicate midphase"
                    );
                    summary.coalesced_midphases += 1;
                }
                index
            })
            .collect();
        pending.extend(output.constraints.into_iter().map(|new| {
            let target = match new.midphase {
                MidPhaseRef::Pending(local) => MidPhaseRef::Pending(local_to_global[local]),
                existing => existing,
            };
            (target, new.constraint)
        }));
        reactivated.extend(output.reactivated);
        drained.touched.extend(output.touched);
    }

    if settings.deterministic {
        pending.sort_by_key(|(_, constraint)| constraint.key());
    }

    let mut activations = scratch.activations.acquire(pending.len() + reactivated.len());
    let mut created_keys = HashSet::with_capacity(pending.len());
    for (target, mut constraint) in pending.drain(..) {
        let key = constraint.key();
        if !created_keys.insert(key) {
            // Two workers found the same new shape pair
            summary.dropped_constraints += 1;
            continue;
        }
        constraint.insert_flags(ConstraintFlags::NEW_THIS_TICK);
        let id = ConstraintId(constraints.arena.insert(constraint));
        match target {
            MidPhaseRef::Pending(index) => drained.midphases[index].constraints.push(id),
            MidPhaseRef::Existing(midphase) => drained.attachments.push((midphase, id)),
        }
        activations.push((key, id));
        summary.new_constraints += 1;
    }

    let mut seen = HashSet::with_capacity(reactivated.len());
    for id in reactivated {
        if !seen.insert(id) {
            continue;
        }
        let Some(constraint) = constraints.get_mut(id) else {
            continue;
        };
        if constraint.cookie().is_current(settings.epoch) {
            continue;
        }
        constraint.insert_flags(ConstraintFlags::REACTIVATED);
        activations.push((constraint.key(), id));
    }

    if settings.deterministic {
        activations.sort_by_key(|&(key, _)| key);
    }
    constraints
        .new_active
        .extend(activations.drain(..).map(|(_, id)| id));

    drained
}

/// Register drained midphases with the global list and both particles
pub(crate) fn process_new_midphases(
    store: &mut MidPhaseStore,
    mut drained: DrainedMidPhases,
    constraint_lists: &VecPool<ConstraintId>,
    scratch: &MergeScratch,
    settings: MergeSettings,
) -> (usize, usize) {
    if settings.deterministic {
        drained.midphases.sort_by_key(|midphase| midphase.key);
    }

    let mut registered = 0;
    let mut coalesced = 0;
    store.list.reserve(drained.midphases.len());
    for new in drained.midphases.drain(..) {
        let [a, b] = new.particles;
        if let Some(existing) = store.find(a, b) {
            warn!(
                midphase = %existing,
                first = %new.key.first(),
                second = %new.key.second(),
                "coalescing duplicate midphase"
            );
            if let Some(midphase) = store.get_mut(existing) {
                for &constraint in &new.constraints {
                    midphase.push_constraint(constraint);
                }
                midphase.mark_used(settings.epoch);
            }
            constraint_lists.recycle(new.constraints);
            coalesced += 1;
            continue;
        }

        let mut midphase = ParticlePairMidPhase::new(a, b, new.constraints);
        midphase.mark_used(settings.epoch);
        store.register(midphase);
        registered += 1;
    }

    for (id, constraint) in drained.attachments {
        if let Some(midphase) = store.get_mut(id) {
            midphase.push_constraint(constraint);
            midphase.mark_used(settings.epoch);
        }
    }
    for id in drained.touched {
        if let Some(midphase) = store.get_mut(id) {
            midphase.mark_used(settings.epoch);
        }
    }
    scratch.midphases.recycle(drained.midphases);
    (registered, coalesced)
}

/// Cookies and CCD candidates computed by one batch
#[derive(Debug)]
struct StampedBatch {
    cookies: Vec<(ConstraintId, ConstraintCookie)>,
    ccd: Vec<ConstraintId>,
}

/// Stamp cookies for `new_active`, which occupies `base..` of the active list
///
/// Each cookie index is `base` plus the constraint's position in
/// `new_active`, whichever batch computed it. Returns the CCD candidates of
/// every batch, in batch order.
pub(crate) fn process_new_non_ccd_constraints(
    store: &mut ConstraintStore,
    scheduler: &TaskScheduler,
    new_active: &[ConstraintId],
    base: usize,
    settings: MergeSettings,
) -> Vec<Vec<ConstraintId>> {
    let plan = BatchPlan::new(new_active.len(), scheduler.worker_count(), settings.min_batch_size);
    let arena = &store.arena;
    let batches = scheduler.run_batches(&plan, |batch_index, range| {
        trace!(batch_index, start = range.start, end = range.end, "stamping constraint batch");
        let mut batch = StampedBatch {
            cookies: Vec::with_capacity(range.len()),
            ccd: Vec::new(),
        };
        for position in range {
            let id = new_active[position];
            let Some(constraint) = arena.get(id.0) else {
                continue;
            };
            batch
                .cookies
                .push((id, ConstraintCookie::active(settings.epoch, base + position)));
            if constraint.is_ccd_enabled() {
                batch.ccd.push(id);
            }
        }
        batch
    });

    let mut ccd_batches = Vec::with_capacity(batches.len());
    for batch in batches {
        for (id, cookie) in batch.cookies {
            if let Some(constraint) = store.get_mut(id) {
                constraint.set_cookie(cookie);
            }
        }
        ccd_batches.push(batch.ccd);
    }
    ccd_batches
}

/// Assign CCD indices to the CCD list entries from `ccd_base` on
pub(crate) fn process_new_ccd_constraints(
    store: &mut ConstraintStore,
    scheduler: &TaskScheduler,
    ccd_base: usize,
    settings: MergeSettings,
) {
    let pending = &store.active_ccd[ccd_base..];
    let plan = BatchPlan::new(pending.len(), scheduler.worker_count(), settings.min_batch_size);
    let batches = scheduler.run_batches(&plan, |batch_index, range| {
        trace!(batch_index, start = range.start, end = range.end, "indexing ccd batch");
        range
            .filter_map(|position| pending[position].map(|id| (id, ccd_base + position)))
            .collect::<Vec<_>>()
    });

    for (id, ccd_index) in batches.into_iter().flatten() {
        if let Some(constraint) = store.get_mut(id) {
            constraint.cookie_mut().ccd_constraint_index = Some(ccd_index);
        }
    }
    store.new_active.clear();
}

/// Append the new-active list to the active lists and stamp everything
///
/// Returns (activated, activated_ccd).
pub(crate) fn process_new_constraints(
    store: &mut ConstraintStore,
    scheduler: &TaskScheduler,
    settings: MergeSettings,
) -> (usize, usize) {
    let new_active = std::mem::take(&mut store.new_active);
    let base = store.active.len();
    store.active.extend(new_active.iter().map(|&id| Some(id)));

    let ccd_batches = process_new_non_ccd_constraints(store, scheduler, &new_active, base, settings);

    // Batch order, on this thread
    let ccd_base = store.active_ccd.len();
    for batch in ccd_batches {
        store.active_ccd.extend(batch.into_iter().map(Some));
    }
    let activated_ccd = store.active_ccd.len() - ccd_base;

    // Hand the buffer back so its capacity is reused next tick
    let activated = new_active.len();
    store.new_active = new_active;
    process_new_ccd_constraints(store, scheduler, ccd_base, settings);
    (activated, activated_ccd)
}

/// Merge midphases and process constraints side by side
pub(crate) fn process_new_items(
    midphases: &mut MidPhaseStore,
    constraints: &mut ConstraintStore,
    drained: DrainedMidPhases,
    scheduler: &TaskScheduler,
    constraint_lists: &VecPool<ConstraintId>,
    scratch: &MergeScratch,
    settings: MergeSettings,
    summary: &mut MergeSummary,
) {
    let ((registered, coalesced), (activated, activated_ccd)) = scheduler.join(
        || process_new_midphases(midphases, drained, constraint_lists, scratch, settings),
        || process_new_constraints(constraints, scheduler, settings),
    );
    summary.new_midphases = registered;
    summary.coalesced_midphases += coalesced;
    summary.activated = activated;
    summary.activated_ccd = activated_ccd;

    debug!(
        epoch = %settings.epoch,
        new_midphases = registered,
        coalesced = summary.coalesced_midphases,
        new_constraints = summary.new_constraints,
        dropped = summary.dropped_constraints,
        activated,
        activated_ccd,
        "merged detection output"
    );
}
