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
//! Particle-pair midphases
//!
//! A [`ParticlePairMidPhase`] tracks one unordered pair of particles that the
//! broad phase reported as possibly touching, and owns the ids of every
//! constraint between them.
//!
//! Every registered midphase is reachable from exactly three places: the
//! global midphase list and the [`ParticleCollisions`] list of each of its
//! two particles. Those particle lists are non-owning; each midphase side
//! remembers its position in its particle's list so detaching is a swap
//! remove plus one back-patch, with no scan of the world.

use std::collections::HashMap;
use std::fmt;

use crate::arena::{Arena, ArenaIndex};
use crate::collision::constraint::{Constraint, ConstraintId};
use crate::collision::cookie::Epoch;
use crate::particle::ParticleHandle;

/// Handle to a midphase owned by the allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MidPhaseId(pub(crate) ArenaIndex);

impl MidPhaseId {
    /// Underlying arena index
    pub fn index(&self) -> ArenaIndex {
        self.0
    }
}

impl fmt::Display for MidPhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MidPhase({})", self.0)
    }
}

/// Order-independent key for a particle pair
///
/// The sole sort criterion for merging midphases produced on different
/// threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MidPhaseKey {
    first: ParticleHandle,
    second: ParticleHandle,
}

impl MidPhaseKey {
    /// Key for the pair `{a, b}`
    pub fn new(a: ParticleHandle, b: ParticleHandle) -> Self {
        if a <= b {
            MidPhaseKey { first: a, second: b }
        } else {
            MidPhaseKey { first: b, second: a }
        }
    }

    /// Lower particle of the pair
    pub fn first(&self) -> ParticleHandle {
        self.first
    }

    /// Higher particle of the pair
    pub fn second(&self) -> ParticleHandle {
        self.second
    }
}

/// Visitor signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitResult {
    /// Keep visiting
    Continue,
    /// Stop after this item
    Stop,
}

#[derive(Debug, Clone, Copy)]
struct MidPhaseSide {
    particle: ParticleHandle,
    /// Position in the particle's [`ParticleCollisions`] list; `None` once
    /// detached
    list_index: Option<usize>,
}

/// Bookkeeping for one pair of particles
#[derive(Debug)]
pub struct ParticlePairMidPhase {
    key: MidPhaseKey,
    sides: [MidPhaseSide; 2],
    constraints: Vec<ConstraintId>,
    last_used_epoch: Option<Epoch>,
    sleeping: bool,
}

impl ParticlePairMidPhase {
    /// Create an unregistered midphase for `particle_a` and `particle_b`
    pub(crate) fn new(particle_a: ParticleHandle, particle_b: ParticleHandle, constraints: Vec<ConstraintId>) -> Self {
        debug_assert!(particle_a != particle_b, "midphase needs two distinct particles");
        ParticlePairMidPhase {
            key: MidPhaseKey::new(particle_a, particle_b),
            sides: [
                MidPhaseSide {
                    particle: particle_a,
                    list_index: None,
                },
                MidPhaseSide {
                    particle: particle_b,
                    list_index: None,
                },
            ],
            constraints,
            last_used_epoch: None,
            sleeping: false,
        }
    }

    /// Deterministic key over the two particles
    pub fn key(&self) -> MidPhaseKey {
        self.key
    }

    /// Particle on side `side` (0 or 1)
    pub fn particle(&self, side: usize) -> ParticleHandle {
        self.sides[side].particle
    }

    /// Whether `particle` is one side of this pair and still attached
    pub fn is_attached_to(&self, particle: ParticleHandle) -> bool {
        self.side_of(particle)
            .map_or(false, |side| self.sides[side].list_index.is_some())
    }

    /// Whether a side has been detached because its particle was removed
    pub fn is_orphaned(&self) -> bool {
        self.sides.iter().any(|side| side.list_index.is_none())
    }

    /// Constraint ids owned by this midphase
    pub fn constraints(&self) -> &[ConstraintId] {
        &self.constraints
    }

    /// Number of constraints owned by this midphase
    pub fn num_constraints(&self) -> usize {
        self.constraints.len()
    }

    /// Whether the pair was touched by detection in `epoch` or later
    pub fn is_used_since(&self, epoch: Epoch) -> bool {
        self.last_used_epoch.map_or(false, |used| used >= epoch)
    }

    /// Last epoch in which detection touched the pair
    pub fn last_used_epoch(&self) -> Option<Epoch> {
        self.last_used_epoch
    }

    /// Whether the pair belongs to a sleeping island
    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    pub(crate) fn set_sleeping(&mut self, sleeping: bool) {
        self.sleeping = sleeping;
    }

    pub(crate) fn mark_used(&mut self, epoch: Epoch) {
        if self.last_used_epoch.map_or(true, |used| used < epoch) {
            self.last_used_epoch = Some(epoch);
        }
    }

    pub(crate) fn push_constraint(&mut self, constraint: ConstraintId) {
        self.constraints.push(constraint);
    }

    pub(crate) fn take_constraints(&mut self) -> Vec<ConstraintId> {
        std::mem::take(&mut self.constraints)
    }

    pub(crate) fn retain_constraints(&mut self, keep: impl FnMut(&ConstraintId) -> bool) {
        self.constraints.retain(keep);
    }

    /// Visit this pair's live constraints in insertion order
    ///
    /// Returns [`VisitResult::Stop`] if the visitor stopped early.
    pub fn visit_collisions<F>(&self, constraints: &Arena<Constraint>, mut visitor: F) -> VisitResult
    where
        F: FnMut(ConstraintId, &Constraint) -> VisitResult,
    {
        for &id in &self.constraints {
            if let Some(constraint) = constraints.get(id.0) {
                if visitor(id, constraint) == VisitResult::Stop {
                    return VisitResult::Stop;
                }
            }
        }
        VisitResult::Continue
    }

    fn side_of(&self, particle: ParticleHandle) -> Option<usize> {
        self.sides.iter().position(|side| side.particle == particle)
    }
}

/// The midphases one particle participates in
///
/// Held by the allocator on the particle's behalf. Non-owning.
#[derive(Debug, Default)]
pub struct ParticleCollisions {
    midphases: Vec<MidPhaseId>,
}

impl ParticleCollisions {
    /// Midphase ids in attachment order (reordered by removals)
    pub fn midphases(&self) -> &[MidPhaseId] {
        &self.midphases
    }

    /// Number of attached midphases
    pub fn len(&self) -> usize {
        self.midphases.len()
    }

    /// Whether nothing is attached
    pub fn is_empty(&self) -> bool {
        self.midphases.is_empty()
    }

    /// Append a midphase and return its position
    fn add_midphase(&mut self, midphase: MidPhaseId) -> usize {
        self.midphases.push(midphase);
        self.midphases.len() - 1
    }
}

/// Owning store for midphases plus the particle back-references
#[derive(Default)]
pub(crate) struct MidPhaseStore {
    pub(crate) arena: Arena<ParticlePairMidPhase>,
    /// Global midphase list; merge order, then swap-removal order
    pub(crate) list: Vec<MidPhaseId>,
    pub(crate) particles: HashMap<ParticleHandle, ParticleCollisions>,
}

impl MidPhaseStore {
    pub(crate) fn get(&self, id: MidPhaseId) -> Option<&ParticlePairMidPhase> {
        self.arena.get(id.0)
    }

    pub(crate) fn get_mut(&mut self, id: MidPhaseId) -> Option<&mut ParticlePairMidPhase> {
        self.arena.get_mut(id.0)
    }

    /// Take ownership of `midphase`, attach it to both particles and append it
    /// to the global list
    pub(crate) fn register(&mut self, midphase: ParticlePairMidPhase) -> MidPhaseId {
        let particles = [midphase.sides[0].particle, midphase.sides[1].particle];
        let id = MidPhaseId(self.arena.insert(midphase));
        for (side, particle) in particles.into_iter().enumerate() {
            let list_index = self.particles.entry(particle).or_default().add_midphase(id);
            if let Some(stored) = self.arena.get_mut(id.0) {
                stored.sides[side].list_index = Some(list_index);
            }
        }
        self.list.push(id);
        id
    }

    /// Sever `particle`'s side of `id`
    ///
    /// Returns false if the midphase is gone or the side was already detached.
    pub(crate) fn detach_particle(&mut self, id: MidPhaseId, particle: ParticleHandle) -> bool {
        let list_index = match self.arena.get_mut(id.0) {
            Some(midphase) => match midphase.side_of(particle) {
                Some(side) => match midphase.sides[side].list_index.take() {
                    Some(list_index) => list_index,
                    None => return false,
                },
                None => return false,
            },
            None => return false,
        };

        let Some(collisions) = self.particles.get_mut(&particle) else {
            debug_assert!(false, "attached midphase {id} missing from {particle}'s list");
            return false;
        };
        debug_assert_eq!(collisions.midphases.get(list_index), Some(&id));
        collisions.midphases.swap_remove(list_index);
        let moved = collisions.midphases.get(list_index).copied();
        if collisions.midphases.is_empty() {
            self.particles.remove(&particle);
        }

        // Patch the back-reference of whichever midphase filled the hole
        if let Some(moved) = moved {
            if let Some(moved_midphase) = self.arena.get_mut(moved.0) {
                if let Some(moved_side) = moved_midphase.side_of(particle) {
                    moved_midphase.sides[moved_side].list_index = Some(list_index);
                }
            }
        }
        true
    }

    /// Detach both sides of `id` and drop it from the arena
    ///
    /// The caller removes it from the global list.
    pub(crate) fn destroy(&mut self, id: MidPhaseId) -> Option<ParticlePairMidPhase> {
        let particles = {
            let midphase = self.arena.get(id.0)?;
            [midphase.sides[0].particle, midphase.sides[1].particle]
        };
        for particle in particles {
            self.detach_particle(id, particle);
        }
        self.arena.remove(id.0)
    }

    /// Find the live, non-orphaned midphase for `{a, b}` by scanning the
    /// shorter of the two particle lists
    pub(crate) fn find(&self, a: ParticleHandle, b: ParticleHandle) -> Option<MidPhaseId> {
        let key = MidPhaseKey::new(a, b);
        let list_a = self.particles.get(&a)?;
        let list_b = self.particles.get(&b)?;
        let shorter = if list_a.len() <= list_b.len() { list_a } else { list_b };
        shorter.midphases.iter().copied().find(|&id| {
            self.arena
                .get(id.0)
                .map_or(false, |midphase| midphase.key == key && !midphase.is_orphaned())
        })
    }

    pub(crate) fn collisions_of(&self, particle: ParticleHandle) -> Option<&ParticleCollisions> {
        self.particles.get(&particle)
    }

    pub(crate) fn clear(&mut self) {
        self.arena.clear();
        self.list.clear();
        self.particles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handles() -> (ParticleHandle, ParticleHandle, ParticleHandle) {
        (
            ParticleHandle::new(1, 0),
            ParticleHandle::new(2, 0),
            ParticleHandle::new(3, 0),
        )
    }

    #[test]
    fn test_key_is_order_independent() {
        let (a, b, _) = handles();
        assert_eq!(MidPhaseKey::new(a, b), MidPhaseKey::new(b, a));
        assert_eq!(MidPhaseKey::new(b, a).first(), a);
        assert_eq!(MidPhaseKey::new(b, a).second(), b);
    }

    #[test]
    fn test_key_distinguishes_generations() {
        let a = ParticleHandle::new(1, 0);
        let a_reborn = ParticleHandle::new(1, 1);
        let b = ParticleHandle::new(2, 0);
        assert_ne!(MidPhaseKey::new(a, b), MidPhaseKey::new(a_reborn, b));
    }

    #[test]
    fn test_used_since_and_sleeping() {
        let (a, b, _) = handles();
        let mut midphase = ParticlePairMidPhase::new(a, b, Vec::new());
        assert!(!midphase.is_used_since(Epoch::ZERO));
        midphase.mark_used(Epoch::new(3));
        assert!(midphase.is_used_since(Epoch::new(3)));
        assert!(midphase.is_used_since(Epoch::new(2)));
        assert!(!midphase.is_used_since(Epoch::new(4)));

        // Marking an older epoch never rewinds
        midphase.mark_used(Epoch::new(1));
        assert_eq!(midphase.last_used_epoch(), Some(Epoch::new(3)));

        assert!(!midphase.is_sleeping());
        midphase.set_sleeping(true);
        assert!(midphase.is_sleeping());
    }

    #[test]
    fn test_register_attaches_both_sides() {
        let (a, b, _) = handles();
        let mut store = MidPhaseStore::default();
        let id = store.register(ParticlePairMidPhase::new(a, b, Vec::new()));

        assert_eq!(store.list, vec![id]);
        assert_eq!(store.collisions_of(a).map(|c| c.midphases().to_vec()), Some(vec![id]));
        assert_eq!(store.collisions_of(b).map(|c| c.midphases().to_vec()), Some(vec![id]));
        let midphase = store.get(id).unwrap();
        assert!(midphase.is_attached_to(a));
        assert!(midphase.is_attached_to(b));
        assert!(!midphase.is_orphaned());
        assert_eq!(store.find(b, a), Some(id));
    }

    #[test]
    fn test_detach_patches_moved_back_reference() {
        let (a, b, c) = handles();
        let mut store = MidPhaseStore::default();
        let ab = store.register(ParticlePairMidPhase::new(a, b, Vec::new()));
        let ac = store.register(ParticlePairMidPhase::new(a, c, Vec::new()));

        // Detaching ab from a moves ac into slot 0 of a's list
        assert!(store.detach_particle(ab, a));
        assert_eq!(store.collisions_of(a).map(|c| c.midphases().to_vec()), Some(vec![ac]));
        assert!(store.get(ab).unwrap().is_orphaned());
        assert!(!store.get(ab).unwrap().is_attached_to(a));
        assert!(store.get(ab).unwrap().is_attached_to(b));
        assert_eq!(store.find(a, b), None);

        // Second detach is a no-op
        assert!(!store.detach_particle(ab, a));

        // The patched index still lets ac detach cleanly
        assert!(store.detach_particle(ac, a));
        assert!(store.collisions_of(a).is_none());
    }

    #[test]
    fn test_destroy_detaches_everything() {
        let (a, b, _) = handles();
        let mut store = MidPhaseStore::default();
        let id = store.register(ParticlePairMidPhase::new(a, b, Vec::new()));
        assert!(store.destroy(id).is_some());
        assert!(store.get(id).is_none());
        assert!(store.collisions_of(a).is_none());
        assert!(store.collisions_of(b).is_none());
        assert!(store.destroy(id).is_none());
    }

    #[test]
    fn test_visit_collisions_stops_early() {
        let (a, b, _) = handles();
        let mut constraints = Arena::new();
        let shape = crate::geometry::CollisionShape::primitive(crate::geometry::ImplicitId(0));
        let ids: Vec<_> = (0..3)
            .map(|_| {
                ConstraintId(constraints.insert(Constraint::new(
                    a,
                    shape,
                    b,
                    shape,
                    0.0,
                    false,
                    crate::geometry::ShapePairType::Unknown,
                )))
            })
            .collect();
        let midphase = ParticlePairMidPhase::new(a, b, ids.clone());

        let mut seen = Vec::new();
        let result = midphase.visit_collisions(&constraints, |id, _| {
            seen.push(id);
            if seen.len() == 2 {
                VisitResult::Stop
            } else {
                VisitResult::Continue
            }
        });
        assert_eq!(result, VisitResult::Stop);
        assert_eq!(seen, ids[..2].to_vec());

        // Restartable: a fresh call sees everything again
        let mut count = 0;
        assert_eq!(
            midphase.visit_collisions(&constraints, |_, _| {
                count += 1;
                VisitResult::Continue
            }),
            VisitResult::Continue
        );
        assert_eq!(count, 3);
    }
}
