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
//! # Collision Allocator
//!
//! Collision-constraint allocation and lifecycle management for a rigid-body
//! physics solver. The allocator decides which particle-pair constraints
//! exist, reuses them across ticks, merges output from parallel detection
//! workers deterministically and prunes pairs that stopped touching.
//!
//! ## Features
//!
//! - **Lock-free detection**: one `ConstraintFactory` per worker, drained at a
//!   single synchronization point
//! - **Tombstoned active lists**: O(1) removal that never shifts other indices
//! - **Deterministic merging**: identical ordering for any worker count
//! - **Parallelization**: Optional Rayon integration for batch processing
//!
//! ## Example
//!
//! ```rust
//! use collision_allocator::prelude::*;
//!
//! let mut particles = ParticleSet::new();
//! let a = particles.create_particle();
//! let b = particles.create_particle();
//! let shape = CollisionShape::primitive(ImplicitId(0));
//!
//! let mut allocator = CollisionConstraintAllocator::new(AllocatorConfig::single_threaded());
//!
//! // Tick 1: the pair is detected
//! allocator.advance_epoch();
//! allocator.begin_detect_collisions();
//! {
//!     let DetectionContext { view, factories } = allocator.detection_context();
//!     factories[0].find_or_create_constraint(&view, &ContactCandidate::new(a, shape, b, shape));
//! }
//! allocator.end_detect_collisions();
//! assert_eq!(allocator.num_active_constraints(), 1);
//! allocator.prune_expired_midphases();
//!
//! // Tick 2: nothing detected, the pair is pruned
//! allocator.advance_epoch();
//! allocator.reset_active_constraints();
//! allocator.prune_expired_midphases();
//! assert_eq!(allocator.num_midphases(), 0);
//! ```

#![warn(missing_docs)]

/// Generational slot storage
pub mod arena;

/// Collision constraints, midphases and the central allocator
pub mod collision;

/// Allocator configuration
pub mod config;

/// Geometry references carried by constraints
pub mod geometry;

/// Particle handles
pub mod particle;

/// Memory pooling for reducing allocation churn
pub mod pool;

/// Fork-join scheduling glue
pub mod scheduler;

pub use collision::{
    CollisionConstraintAllocator, Constraint, ConstraintFlags, ConstraintId, Epoch, MidPhaseId,
};
pub use config::{AllocatorConfig, ConfigError};
pub use particle::ParticleHandle;

/// Commonly used types
pub mod prelude {
    pub use crate::collision::{
        AllocatorStats, CollisionConstraintAllocator, Constraint, ConstraintFactory, ConstraintId,
        ConstraintRef, ContactCandidate, DetectionContext, Epoch, MidPhaseId, MidPhaseRef,
        MidPhaseView, ParticlePairMidPhase, VisitResult,
    };
    pub use crate::config::AllocatorConfig;
    pub use crate::geometry::{CollisionShape, ImplicitId, RigidTransform, ShapeId, ShapePairType};
    pub use crate::particle::{ParticleHandle, ParticleSet};
}
