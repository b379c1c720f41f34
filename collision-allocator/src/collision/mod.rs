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
//! Collision constraint bookkeeping
//!
//! This module decides which particle-pair constraints exist, when they are
//! created, reused and destroyed, and keeps that bookkeeping consistent while
//! many detection workers run at once.
//!
//! # Pieces
//!
//! - **Cookie**: per-constraint active-list indices, valid for one epoch
//! - **Constraint**: one contact manifold between two particle shapes
//! - **Midphase**: all constraints between one pair of particles
//! - **Factory**: per-worker producer used during detection
//! - **Allocator**: owner of everything above plus the active lists
//!
//! # Determinism
//!
//! With `AllocatorConfig::deterministic` set, the global midphase list, the
//! active list and the CCD list come out in the same order for the same
//! detected pairs, whatever the worker count.

mod active;
mod allocator;
mod constraint;
mod cookie;
mod factory;
mod merge;
mod midphase;

pub use allocator::{AllocatorStats, CollisionConstraintAllocator, DetectionContext, MidPhaseView};
pub use constraint::{Constraint, ConstraintFlags, ConstraintId, ConstraintKey, ShapePairKey};
pub use cookie::{ConstraintCookie, Epoch};
pub use factory::{ConstraintFactory, ConstraintRef, ContactCandidate, MidPhaseRef};
pub use merge::MergeSummary;
pub use midphase::{MidPhaseId, MidPhaseKey, ParticleCollisions, ParticlePairMidPhase, VisitResult};
