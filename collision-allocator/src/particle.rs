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
//! Particle handles
//!
//! Particles are the simulated bodies owned by the wider solver. The
//! collision allocator never owns them; it only stores these lightweight
//! handles and is told when a particle leaves the simulation.

use std::collections::HashSet;
use std::fmt;

/// Unique identifier for a particle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticleId(u64);

impl ParticleId {
    /// Create a new ParticleId from a raw u64 value
    pub fn new(id: u64) -> Self {
        ParticleId(id)
    }

    /// Get the raw u64 value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ParticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Particle({})", self.0)
    }
}

/// Particle handle with generational index support for safe references
///
/// Handles order by id first and generation second. That total order is what
/// midphase keys are built from, so it must stay stable across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticleHandle {
    id: ParticleId,
    generation: u32,
}

impl ParticleHandle {
    /// Create a new handle with the given ID and generation
    pub fn new(id: u64, generation: u32) -> Self {
        ParticleHandle {
            id: ParticleId::new(id),
            generation,
        }
    }

    /// Get the particle ID
    pub fn id(&self) -> ParticleId {
        self.id
    }

    /// Get the generation number
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ParticleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Particle({}, gen: {})", self.id.0, self.generation)
    }
}

/// Minimal particle lifecycle owner
///
/// Stands in for the solver's particle container: it mints handles and
/// retires them. Destroying a particle here does not touch the collision
/// allocator; callers must call
/// [`CollisionConstraintAllocator::remove_particle`](crate::CollisionConstraintAllocator::remove_particle)
/// first.
pub struct ParticleSet {
    next_particle_id: u64,
    generations: Vec<u32>,
    free_ids: Vec<u64>,
    alive: HashSet<ParticleHandle>,
}

impl ParticleSet {
    /// Create an empty particle set
    pub fn new() -> Self {
        ParticleSet {
            next_particle_id: 0,
            generations: Vec::new(),
            free_ids: Vec::new(),
            alive: HashSet::new(),
        }
    }

    /// Create a new particle, recycling retired ids first
    pub fn create_particle(&mut self) -> ParticleHandle {
        let id = match self.free_ids.pop() {
            Some(id) => id,
            None => {
                let id = self.next_particle_id;
                self.next_particle_id += 1;
                self.generations.push(0);
                id
            }
        };

        let handle = ParticleHandle::new(id, self.generations[id as usize]);
        self.alive.insert(handle);
        handle
    }

    /// Destroy a particle
    ///
    /// Bumps the generation so the old handle can never alias a new particle.
    pub fn destroy_particle(&mut self, particle: ParticleHandle) -> bool {
        if !self.alive.remove(&particle) {
            return false;
        }
        let id = particle.id().raw();
        let slot = &mut self.generations[id as usize];
        *slot = slot.wrapping_add(1);
        self.free_ids.push(id);
        true
    }

    /// Check if a particle is alive
    pub fn is_alive(&self, particle: ParticleHandle) -> bool {
        self.alive.contains(&particle)
    }

    /// Get the number of alive particles
    pub fn len(&self) -> usize {
        self.alive.len()
    }

    /// Check whether no particles are alive
    pub fn is_empty(&self) -> bool {
        self.alive.is_empty()
    }
}

impl Default for ParticleSet {
    fn default() -> Self {
        Self::new()
    }
}
