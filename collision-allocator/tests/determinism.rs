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
//! Determinism across worker counts
//!
//! Detection runs on real threads, one per factory, with candidates spread
//! over the workers in different ways. With deterministic merging the
//! resulting lists must be identical to the single-threaded run.

use collision_allocator::collision::{ConstraintCookie, ConstraintKey, MidPhaseKey};
use collision_allocator::prelude::*;
use proptest::prelude::*;

#[derive(Debug, Clone, PartialEq)]
struct Snapshot {
    midphases: Vec<(MidPhaseId, MidPhaseKey, Vec<ConstraintId>)>,
    active: Vec<Option<(ConstraintId, ConstraintKey)>>,
    active_ccd: Vec<Option<ConstraintId>>,
    cookies: Vec<ConstraintCookie>,
}

fn snapshot(allocator: &CollisionConstraintAllocator) -> Snapshot {
    let midphases = allocator
        .midphase_list()
        .iter()
        .map(|&id| {
            let midphase = allocator.midphase(id).unwrap();
            (id, midphase.key(), midphase.constraints().to_vec())
        })
        .collect();
    let active = allocator
        .active_constraint_slots()
        .iter()
        .map(|slot| slot.map(|id| (id, allocator.constraint(id).unwrap().key())))
        .collect();
    let cookies = allocator
        .active_constraints()
        .map(|id| *allocator.constraint(id).unwrap().cookie())
        .collect();
    Snapshot {
        midphases,
        active,
        active_ccd: allocator.active_ccd_constraint_slots().to_vec(),
        cookies,
    }
}

/// How candidates are handed to workers
#[derive(Debug, Clone, Copy)]
enum Spread {
    RoundRobin,
    Reversed,
    Chunked,
}

impl Spread {
    fn worker_for(self, index: usize, count: usize, workers: usize) -> usize {
        match self {
            Spread::RoundRobin => index % workers,
            Spread::Reversed => workers - 1 - (index % workers),
            Spread::Chunked => (index * workers / count.max(1)).min(workers - 1),
        }
    }
}

fn detect_parallel(allocator: &mut CollisionConstraintAllocator, candidates: &[ContactCandidate], spread: Spread) {
    allocator.begin_detect_collisions();
    {
        let DetectionContext { view, factories } = allocator.detection_context();
        let workers = factories.len();
        let mut shares = vec![Vec::new(); workers];
        for (index, candidate) in candidates.iter().enumerate() {
            shares[spread.worker_for(index, candidates.len(), workers)].push(*candidate);
        }

        std::thread::scope(|scope| {
            for (factory, share) in factories.iter_mut().zip(&shares) {
                scope.spawn(move || {
                    for candidate in share {
                        factory.find_or_create_constraint(&view, candidate);
                    }
                });
            }
        });
    }
    allocator.end_detect_collisions();
}

fn sphere(id: u32) -> CollisionShape {
    CollisionShape::primitive(ImplicitId(id))
}

/// Three ticks over a ring of particles: contacts appear, some persist, a
/// particle is removed after the second tick and others separate
fn run_scenario(workers: usize, spread: Spread, reset: bool) -> Vec<Snapshot> {
    let mut particles = ParticleSet::new();
    let ring: Vec<_> = (0..24).map(|_| particles.create_particle()).collect();
    let mut allocator = CollisionConstraintAllocator::new(
        AllocatorConfig::default()
            .with_workers(workers)
            .with_min_batch_size(1)
            .with_deterministic(true),
    );

    let pair = |i: usize, j: usize, shape: u32| {
        ContactCandidate::new(ring[i], sphere(shape), ring[j], sphere(shape + 1))
            .with_ccd((i + j) % 3 == 0)
            .with_cull_distance(0.01)
    };

    let tick_one: Vec<_> = (0..24)
        .flat_map(|i| [pair(i, (i + 1) % 24, 0), pair(i, (i + 5) % 24, 2)])
        .collect();
    let tick_two: Vec<_> = (0..24)
        .filter(|i| i % 4 != 0)
        .flat_map(|i| [pair(i, (i + 1) % 24, 0), pair(i, (i + 1) % 24, 4)])
        .collect();
    // Every candidate twice, so several workers create the same pairs
    let tick_three: Vec<_> = (0..12)
        .flat_map(|i| [pair(i, i + 12, 0), pair(i, i + 12, 0), pair(i, (i + 1) % 24, 0)])
        .filter(|candidate| candidate.particle_a != ring[7] && candidate.particle_b != ring[7])
        .collect();

    let mut snapshots = Vec::new();
    for (tick, candidates) in [tick_one, tick_two, tick_three].iter().enumerate() {
        allocator.advance_epoch();
        if reset {
            allocator.reset_active_constraints();
        }
        detect_parallel(&mut allocator, candidates, spread);
        if tick == 1 {
            allocator.remove_particle(ring[7]);
        }
        snapshots.push(snapshot(&allocator));
        allocator.prune_expired_midphases();
        snapshots.push(snapshot(&allocator));
    }
    snapshots
}

#[test]
fn test_worker_count_does_not_change_results() {
    let reference = run_scenario(1, Spread::RoundRobin, true);
    assert!(reference.iter().any(|snapshot| !snapshot.active_ccd.is_empty()));

    for workers in [2, 8] {
        for spread in [Spread::RoundRobin, Spread::Reversed, Spread::Chunked] {
            assert_eq!(
                run_scenario(workers, spread, true),
                reference,
                "workers = {workers}, spread = {spread:?}"
            );
        }
    }
}

#[test]
fn test_skipping_reset_matches_reset_run() {
    // Detection drops last epoch's entries itself, so the lists seen after
    // each merge are the same whether or not the tick owner resets them
    let reference = run_scenario(1, Spread::RoundRobin, true);
    for workers in [1, 4] {
        let snapshots = run_scenario(workers, Spread::Chunked, false);
        for (tick, (got, expected)) in snapshots.iter().zip(&reference).enumerate().step_by(2) {
            assert_eq!(got.active, expected.active, "workers = {workers}, tick = {}", tick / 2);
            assert_eq!(got.active_ccd, expected.active_ccd);
            assert_eq!(got.cookies, expected.cookies);
        }
    }
}

#[test]
fn test_active_list_is_key_ordered() {
    let snapshots = run_scenario(4, Spread::Chunked, true);
    let first = &snapshots[0];
    let keys: Vec<_> = first.active.iter().map(|slot| slot.unwrap().1).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);

    let midphase_keys: Vec<_> = first.midphases.iter().map(|(_, key, _)| *key).collect();
    let mut sorted = midphase_keys.clone();
    sorted.sort();
    assert_eq!(midphase_keys, sorted);
}

#[test]
fn test_duplicates_across_workers_are_merged() {
    let mut particles = ParticleSet::new();
    let a = particles.create_particle();
    let b = particles.create_particle();
    let mut allocator = CollisionConstraintAllocator::new(AllocatorConfig::default().with_workers(4));
    let candidate = ContactCandidate::new(a, sphere(0), b, sphere(1));

    allocator.advance_epoch();
    detect_parallel(&mut allocator, &[candidate; 4], Spread::RoundRobin);

    let stats = allocator.stats();
    assert_eq!(stats.midphases, 1);
    assert_eq!(stats.constraints, 1);
    assert_eq!(stats.active_constraints, 1);
    assert_eq!(stats.last_merge.coalesced_midphases, 3);
    assert_eq!(stats.last_merge.dropped_constraints, 3);
}

fn run_pairs(pairs: &[(usize, usize, u32)], workers: usize) -> Snapshot {
    let mut particles = ParticleSet::new();
    let bodies: Vec<_> = (0..16).map(|_| particles.create_particle()).collect();
    let mut allocator = CollisionConstraintAllocator::new(
        AllocatorConfig::default().with_workers(workers).with_min_batch_size(1),
    );
    let candidates: Vec<_> = pairs
        .iter()
        .map(|&(i, j, shape)| {
            // Symmetric in the pair so repeated candidates always agree
            let ccd = (i * j + shape as usize) % 3 == 0;
            ContactCandidate::new(bodies[i], sphere(shape), bodies[j], sphere(shape)).with_ccd(ccd)
        })
        .collect();

    allocator.advance_epoch();
    detect_parallel(&mut allocator, &candidates, Spread::RoundRobin);
    snapshot(&allocator)
}

proptest! {
    #[test]
    fn prop_merge_is_independent_of_workers(
        raw in prop::collection::vec((0usize..16, 1usize..16, 0u32..3), 0..120)
    ) {
        let pairs: Vec<_> = raw
            .into_iter()
            .map(|(i, offset, shape)| (i, (i + offset) % 16, shape))
            .collect();
        let single = run_pairs(&pairs, 1);
        prop_assert_eq!(&run_pairs(&pairs, 3), &single);
        prop_assert_eq!(&run_pairs(&pairs, 8), &single);
    }
}
