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
//! Per-worker constraint factories
//!
//! During detection every worker owns exactly one [`ConstraintFactory`]. A
//! factory only ever writes to its own buffers and only ever reads shared
//! state through a [`MidPhaseView`], so detection needs no locks. The
//! allocator drains every factory once, in factory order, when detection
//! ends; that drain is the only synchronization point between workers and
//! the shared lists.
//!
//! # Example
//!
//! ```rust
//! use collision_allocator::prelude::*;
//!
//! let mut particles = ParticleSet::new();
//! let a = particles.create_particle();
//! let b = particles.create_particle();
//!
//! let mut allocator = CollisionConstraintAllocator::new(AllocatorConfig::single_threaded());
//! allocator.advance_epoch();
//! allocator.begin_detect_collisions();
//! {
//!     let DetectionContext { view, factories } = allocator.detection_context();
//!     let shape = CollisionShape::primitive(ImplicitId(0));
//!     factories[0].find_or_create_constraint(
//!         &view,
//!         &ContactCandidate::new(a, shape, b, shape).with_cull_distance(0.05),
//!     );
//! }
//! allocator.end_detect_collisions();
//! assert_eq!(allocator.num_active_constraints(), 1);
//! ```

use std::collections::{HashMap, HashSet};

use crate::collision::allocator::MidPhaseView;
use crate::collision::constraint::{Constraint, ConstraintId, ConstraintKey, ShapePairKey};
use crate::collision::cookie::Epoch;
use crate::collision::midphase::{MidPhaseId, MidPhaseKey};
use crate::geometry::{CollisionShape, ShapePairType};
use crate::particle::ParticleHandle;

/// Where a buffered constraint will live once merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MidPhaseRef {
    /// A midphase already registered with the allocator
    Existing(MidPhaseId),
    /// A midphase created by this factory in the current detection pass,
    /// identified by its position in the factory's pending buffer
    Pending(usize),
}

/// Outcome of [`ConstraintFactory::find_or_create_constraint`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintRef {
    /// An existing constraint, queued for re-activation
    Existing(ConstraintId),
    /// A new constraint buffered in this factory at the given position
    Pending(usize),
}

/// One candidate shape pair reported by narrow-phase detection
#[derive(Debug, Clone, Copy)]
pub struct ContactCandidate {
    /// Particle owning `shape_a`
    pub particle_a: ParticleHandle,
    /// Shape on particle A
    pub shape_a: CollisionShape,
    /// Particle owning `shape_b`
    pub particle_b: ParticleHandle,
    /// Shape on particle B
    pub shape_b: CollisionShape,
    /// Separation beyond which the pair is not considered touching
    pub cull_distance: f64,
    /// Keep a contact manifold across ticks
    pub use_manifold: bool,
    /// Geometry pair classification
    pub shape_pair_type: ShapePairType,
    /// Route the constraint through the CCD pass
    pub ccd_enabled: bool,
}

impl ContactCandidate {
    /// Candidate with zero cull distance, no manifold, no CCD and an
    /// unclassified shape pair
    pub fn new(
        particle_a: ParticleHandle,
        shape_a: CollisionShape,
        particle_b: ParticleHandle,
        shape_b: CollisionShape,
    ) -> Self {
        ContactCandidate {
            particle_a,
            shape_a,
            particle_b,
            shape_b,
            cull_distance: 0.0,
            use_manifold: false,
            shape_pair_type: ShapePairType::Unknown,
            ccd_enabled: false,
        }
    }

    /// Set the cull distance
    pub fn with_cull_distance(mut self, cull_distance: f64) -> Self {
        self.cull_distance = cull_distance;
        self
    }

    /// Enable manifold tracking
    pub fn with_manifold(mut self, use_manifold: bool) -> Self {
        self.use_manifold = use_manifold;
        self
    }

    /// Set the shape pair classification
    pub fn with_shape_pair_type(mut self, shape_pair_type: ShapePairType) -> Self {
        self.shape_pair_type = shape_pair_type;
        self
    }

    /// Enable CCD
    pub fn with_ccd(mut self, ccd_enabled: bool) -> Self {
        self.ccd_enabled = ccd_enabled;
        self
    }

    fn key(&self) -> ConstraintKey {
        ConstraintKey {
            midphase: MidPhaseKey::new(self.particle_a, self.particle_b),
            shapes: ShapePairKey::new(self.particle_a, &self.shape_a, self.particle_b, &self.shape_b),
        }
    }
}

#[derive(Debug)]
pub(crate) struct PendingMidPhase {
    pub(crate) particles: [ParticleHandle; 2],
    pub(crate) key: MidPhaseKey,
}

#[derive(Debug)]
pub(crate) struct PendingConstraint {
    pub(crate) midphase: MidPhaseRef,
    pub(crate) constraint: Constraint,
}

/// Everything one factory produced during a detection pass
#[derive(Debug, Default)]
pub(crate) struct FactoryOutput {
    pub(crate) midphases: Vec<PendingMidPhase>,
    pub(crate) constraints: Vec<PendingConstraint>,
    pub(crate) reactivated: Vec<ConstraintId>,
    pub(crate) touched: Vec<MidPhaseId>,
}

/// Thread-local constraint and midphase producer
#[derive(Debug)]
pub struct ConstraintFactory {
    worker_index: usize,
    epoch: Epoch,
    output: FactoryOutput,
    pending_midphases: HashMap<MidPhaseKey, usize>,
    pending_constraints: HashMap<ConstraintKey, usize>,
    touched: HashSet<MidPhaseId>,
}

impl ConstraintFactory {
    pub(crate) fn new(worker_index: usize) -> Self {
        ConstraintFactory {
            worker_index,
            epoch: Epoch::ZERO,
            output: FactoryOutput::default(),
            pending_midphases: HashMap::new(),
            pending_constraints: HashMap::new(),
            touched: HashSet::new(),
        }
    }

    /// Worker slot this factory belongs to
    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    /// Epoch the factory was primed with
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Midphases created since the last drain
    pub fn num_pending_midphases(&self) -> usize {
        self.output.midphases.len()
    }

    /// Constraints created since the last drain
    pub fn num_pending_constraints(&self) -> usize {
        self.output.constraints.len()
    }

    /// Re-activation requests since the last drain
    pub fn num_pending_activations(&self) -> usize {
        self.output.reactivated.len()
    }

    /// Whether nothing is waiting to be drained
    pub fn is_empty(&self) -> bool {
        self.output.midphases.is_empty()
            && self.output.constraints.is_empty()
            && self.output.reactivated.is_empty()
            && self.output.touched.is_empty()
    }

    pub(crate) fn begin(&mut self, epoch: Epoch) {
        debug_assert!(self.is_empty(), "factory {} was not drained", self.worker_index);
        self.epoch = epoch;
    }

    /// Move the buffered output out and reset for the next pass
    pub(crate) fn drain(&mut self) -> FactoryOutput {
        self.pending_midphases.clear();
        self.pending_constraints.clear();
        self.touched.clear();
        std::mem::take(&mut self.output)
    }

    /// Build a constraint without buffering it
    ///
    /// # Panics
    ///
    /// Panics if the particles are the same or the cull distance is negative
    /// or not finite.
    #[allow(clippy::too_many_arguments)]
    pub fn create_constraint(
        &self,
        particle_a: ParticleHandle,
        shape_a: CollisionShape,
        particle_b: ParticleHandle,
        shape_b: CollisionShape,
        cull_distance: f64,
        use_manifold: bool,
        shape_pair_type: ShapePairType,
    ) -> Constraint {
        Constraint::new(
            particle_a,
            shape_a,
            particle_b,
            shape_b,
            cull_distance,
            use_manifold,
            shape_pair_type,
        )
    }

    /// Resolve the midphase for `{particle_a, particle_b}`
    ///
    /// A registered midphase is recorded as touched this tick. Otherwise a
    /// pending midphase is buffered, at most once per pair per factory.
    pub fn find_or_create_midphase(
        &mut self,
        view: &MidPhaseView<'_>,
        particle_a: ParticleHandle,
        particle_b: ParticleHandle,
    ) -> MidPhaseRef {
        assert!(particle_a != particle_b, "Midphase particles must differ");
        if let Some(id) = view.find_midphase(particle_a, particle_b) {
            if self.touched.insert(id) {
                self.output.touched.push(id);
            }
            return MidPhaseRef::Existing(id);
        }

        let key = MidPhaseKey::new(particle_a, particle_b);
        let next = self.output.midphases.len();
        let index = *self.pending_midphases.entry(key).or_insert(next);
        if index == next {
            self.output.midphases.push(PendingMidPhase {
                particles: [particle_a, particle_b],
                key,
            });
        }
        MidPhaseRef::Pending(index)
    }

    /// Buffer a new constraint for `midphase`
    ///
    /// Returns the constraint's position in this factory's buffer. The
    /// constraint is activated when the allocator merges the buffers.
    pub fn add_constraint(&mut self, midphase: MidPhaseRef, constraint: Constraint) -> usize {
        if let MidPhaseRef::Pending(index) = midphase {
            debug_assert!(
                self.output
                    .midphases
                    .get(index)
                    .map_or(false, |pending| pending.key == constraint.midphase_key()),
                "constraint does not belong to pending midphase {index}"
            );
        }
        let position = self.output.constraints.len();
        self.pending_constraints.entry(constraint.key()).or_insert(position);
        self.output.constraints.push(PendingConstraint { midphase, constraint });
        position
    }

    /// Queue an existing constraint for activation this tick
    pub fn activate_constraint(&mut self, constraint: ConstraintId) {
        self.output.reactivated.push(constraint);
    }

    /// The usual detection path: reuse the constraint for this shape pair if
    /// one exists, otherwise create it (and its midphase if needed)
    pub fn find_or_create_constraint(
        &mut self,
        view: &MidPhaseView<'_>,
        candidate: &ContactCandidate,
    ) -> ConstraintRef {
        let midphase =
            self.find_or_create_midphase(view, candidate.particle_a, candidate.particle_b);

        if let MidPhaseRef::Existing(id) = midphase {
            if let Some(existing) = view.find_constraint(id, candidate.key().shapes) {
                self.activate_constraint(existing);
                return ConstraintRef::Existing(existing);
            }
        }
        if let Some(&position) = self.pending_constraints.get(&candidate.key()) {
            return ConstraintRef::Pending(position);
        }

        let constraint = self
            .create_constraint(
                candidate.particle_a,
                candidate.shape_a,
                candidate.particle_b,
                candidate.shape_b,
                candidate.cull_distance,
                candidate.use_manifold,
                candidate.shape_pair_type,
            )
            .with_ccd(candidate.ccd_enabled);
        ConstraintRef::Pending(self.add_constraint(midphase, constraint))
    }
}
