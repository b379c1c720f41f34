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
//! Collision constraints
//!
//! A [`Constraint`] is one contact manifold between a shape on particle A
//! and a shape on particle B. Contact points, normals and impulses belong to
//! the solver; this type carries only what the allocator needs to create,
//! index and retire it.

use std::fmt;

use bitflags::bitflags;

use crate::arena::ArenaIndex;
use crate::collision::cookie::{ConstraintCookie, Epoch};
use crate::collision::midphase::MidPhaseKey;
use crate::geometry::{CollisionShape, ShapeIdentity, ShapePairType};
use crate::particle::ParticleHandle;

/// Handle to a constraint owned by the allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstraintId(pub(crate) ArenaIndex);

impl ConstraintId {
    /// Underlying arena index
    pub fn index(&self) -> ArenaIndex {
        self.0
    }
}

impl fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Constraint({})", self.0)
    }
}

bitflags! {
    /// Constraint state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConstraintFlags: u8 {
        /// Resolved in the dedicated CCD pass
        const CCD_ENABLED = 1 << 0;
        /// Keeps a contact manifold across ticks
        const USE_MANIFOLD = 1 << 1;
        /// Ignored by the solver
        const DISABLED = 1 << 2;
        /// Created during the current tick
        const NEW_THIS_TICK = 1 << 3;
        /// Re-detected during the current tick
        const REACTIVATED = 1 << 4;
    }
}

impl ConstraintFlags {
    /// Flags that only describe the current tick
    pub const TRANSIENT: ConstraintFlags =
        ConstraintFlags::NEW_THIS_TICK.union(ConstraintFlags::REACTIVATED);
}

/// Identity of a shape pair within one midphase
///
/// Sides are ordered by particle, the same way [`MidPhaseKey`] orders them,
/// so `(a.s1, b.s2)` and `(a.s2, b.s1)` are different pairs while swapping
/// the arguments wholesale is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapePairKey {
    first: ShapeIdentity,
    second: ShapeIdentity,
}

impl ShapePairKey {
    /// Key for `shape_a` on `particle_a` against `shape_b` on `particle_b`
    pub fn new(
        particle_a: ParticleHandle,
        shape_a: &CollisionShape,
        particle_b: ParticleHandle,
        shape_b: &CollisionShape,
    ) -> Self {
        let (a, b) = (shape_a.identity(), shape_b.identity());
        if particle_a <= particle_b {
            ShapePairKey { first: a, second: b }
        } else {
            ShapePairKey { first: b, second: a }
        }
    }
}

/// Total order over all constraints, used for deterministic merging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstraintKey {
    /// Owning particle pair
    pub midphase: MidPhaseKey,
    /// Shape pair inside that particle pair
    pub shapes: ShapePairKey,
}

/// One contact manifold between two particle shapes
#[derive(Debug, Clone)]
pub struct Constraint {
    particles: [ParticleHandle; 2],
    shapes: [CollisionShape; 2],
    cull_distance: f64,
    shape_pair_type: ShapePairType,
    flags: ConstraintFlags,
    cookie: ConstraintCookie,
}

impl Constraint {
    /// Build a constraint between `shape_a` on `particle_a` and `shape_b` on
    /// `particle_b`
    ///
    /// # Panics
    ///
    /// Panics if both particles are the same or the cull distance is negative
    /// or not finite.
    pub fn new(
        particle_a: ParticleHandle,
        shape_a: CollisionShape,
        particle_b: ParticleHandle,
        shape_b: CollisionShape,
        cull_distance: f64,
        use_manifold: bool,
        shape_pair_type: ShapePairType,
    ) -> Self {
        assert!(particle_a != particle_b, "Constraint particles must differ");
        assert!(
            cull_distance >= 0.0 && cull_distance.is_finite(),
            "Cull distance must be non-negative and finite"
        );
        debug_assert!(shape_a.local_transform.is_valid(), "Invalid local transform on shape A");
        debug_assert!(shape_b.local_transform.is_valid(), "Invalid local transform on shape B");

        let mut flags = ConstraintFlags::empty();
        flags.set(ConstraintFlags::USE_MANIFOLD, use_manifold);
        Constraint {
            particles: [particle_a, particle_b],
            shapes: [shape_a, shape_b],
            cull_distance,
            shape_pair_type,
            flags,
            cookie: ConstraintCookie::default(),
        }
    }

    /// Particle on side `side` (0 or 1)
    pub fn particle(&self, side: usize) -> ParticleHandle {
        self.particles[side]
    }

    /// Both particles in creation order
    pub fn particles(&self) -> [ParticleHandle; 2] {
        self.particles
    }

    /// Shape on side `side` (0 or 1)
    pub fn shape(&self, side: usize) -> &CollisionShape {
        &self.shapes[side]
    }

    /// Whether the constraint involves `particle`
    pub fn involves(&self, particle: ParticleHandle) -> bool {
        self.particles.contains(&particle)
    }

    /// Separation beyond which the pair is not considered touching
    pub fn cull_distance(&self) -> f64 {
        self.cull_distance
    }

    /// Update the cull distance
    ///
    /// # Panics
    ///
    /// Panics if the distance is negative or not finite.
    pub fn set_cull_distance(&mut self, cull_distance: f64) {
        assert!(
            cull_distance >= 0.0 && cull_distance.is_finite(),
            "Cull distance must be non-negative and finite"
        );
        self.cull_distance = cull_distance;
    }

    /// Geometry pair classification
    pub fn shape_pair_type(&self) -> ShapePairType {
        self.shape_pair_type
    }

    /// Current flags
    pub fn flags(&self) -> ConstraintFlags {
        self.flags
    }

    /// Whether the constraint goes through the CCD pass
    pub fn is_ccd_enabled(&self) -> bool {
        self.flags.contains(ConstraintFlags::CCD_ENABLED)
    }

    /// Mark the constraint for the CCD pass
    pub fn set_ccd_enabled(&mut self, enabled: bool) {
        self.flags.set(ConstraintFlags::CCD_ENABLED, enabled);
    }

    /// Builder form of [`Constraint::set_ccd_enabled`]
    pub fn with_ccd(mut self, enabled: bool) -> Self {
        self.set_ccd_enabled(enabled);
        self
    }

    /// Whether the manifold is kept across ticks
    pub fn uses_manifold(&self) -> bool {
        self.flags.contains(ConstraintFlags::USE_MANIFOLD)
    }

    /// Whether the solver should skip this constraint
    pub fn is_disabled(&self) -> bool {
        self.flags.contains(ConstraintFlags::DISABLED)
    }

    /// Enable or disable solving
    pub fn set_disabled(&mut self, disabled: bool) {
        self.flags.set(ConstraintFlags::DISABLED, disabled);
    }

    /// Container bookkeeping
    pub fn cookie(&self) -> &ConstraintCookie {
        &self.cookie
    }

    pub(crate) fn set_cookie(&mut self, cookie: ConstraintCookie) {
        self.cookie = cookie;
    }

    pub(crate) fn cookie_mut(&mut self) -> &mut ConstraintCookie {
        &mut self.cookie
    }

    /// Whether the constraint was placed in the active list in `epoch`
    pub fn is_active_in(&self, epoch: Epoch) -> bool {
        self.cookie.constraint_index_in(epoch).is_some()
    }

    pub(crate) fn insert_flags(&mut self, flags: ConstraintFlags) {
        self.flags.insert(flags);
    }

    /// Clear per-tick flags ahead of the next detection pass
    pub fn begin_tick(&mut self) {
        self.flags.remove(ConstraintFlags::TRANSIENT);
    }

    /// Key of the owning particle pair
    pub fn midphase_key(&self) -> MidPhaseKey {
        MidPhaseKey::new(self.particles[0], self.particles[1])
    }

    /// Identity of the shape pair inside the owning midphase
    pub fn shape_pair_key(&self) -> ShapePairKey {
        ShapePairKey::new(self.particles[0], &self.shapes[0], self.particles[1], &self.shapes[1])
    }

    /// Global ordering key
    pub fn key(&self) -> ConstraintKey {
        ConstraintKey {
            midphase: self.midphase_key(),
            shapes: self.shape_pair_key(),
        }
    }
}
