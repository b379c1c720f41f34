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
//! Benchmarks for the detection merge
//!
//! Measures a full tick (detect, merge, prune) for fresh and persistent
//! contacts at several worker counts.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use collision_allocator::prelude::*;

fn ring_candidates(particles: &[ParticleHandle]) -> Vec<ContactCandidate> {
    let shape = CollisionShape::primitive(ImplicitId(0));
    let n = particles.len();
    (0..n)
        .flat_map(|i| {
            [1, 7].map(|stride| {
                ContactCandidate::new(particles[i], shape, particles[(i + stride) % n], shape)
                    .with_ccd(i % 8 == 0)
            })
        })
        .collect()
}

fn tick(allocator: &mut CollisionConstraintAllocator, candidates: &[ContactCandidate]) {
    allocator.advance_epoch();
    allocator.reset_active_constraints();
    allocator.begin_detect_collisions();
    {
        let DetectionContext { view, factories } = allocator.detection_context();
        let workers = factories.len();
        for (index, candidate) in candidates.iter().enumerate() {
            factories[index % workers].find_or_create_constraint(&view, candidate);
        }
    }
    allocator.end_detect_collisions();
    allocator.prune_expired_midphases();
}

fn bench_fresh_contacts(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_fresh");

    for n_particles in [100, 1000, 10000].iter() {
        let mut set = ParticleSet::new();
        let particles: Vec<_> = (0..*n_particles).map(|_| set.create_particle()).collect();
        let candidates = ring_candidates(&particles);

        for workers in [1, 4] {
            group.bench_with_input(
                BenchmarkId::new(format!("workers_{workers}"), n_particles),
                n_particles,
                |b, _| {
                    b.iter(|| {
                        let mut allocator = CollisionConstraintAllocator::new(
                            AllocatorConfig::default().with_workers(workers),
                        );
                        tick(&mut allocator, black_box(&candidates));
                        allocator.num_active_constraints()
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_persistent_contacts(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_persistent");

    for n_particles in [100, 1000, 10000].iter() {
        let mut set = ParticleSet::new();
        let particles: Vec<_> = (0..*n_particles).map(|_| set.create_particle()).collect();
        let candidates = ring_candidates(&particles);

        for workers in [1, 4] {
            let mut allocator =
                CollisionConstraintAllocator::new(AllocatorConfig::default().with_workers(workers));
            tick(&mut allocator, &candidates);

            group.bench_with_input(
                BenchmarkId::new(format!("workers_{workers}"), n_particles),
                n_particles,
                |b, _| {
                    b.iter(|| {
                        tick(&mut allocator, black_box(&candidates));
                        allocator.num_active_constraints()
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_nondeterministic(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_sorting");
    let mut set = ParticleSet::new();
    let particles: Vec<_> = (0..5000).map(|_| set.create_particle()).collect();
    let candidates = ring_candidates(&particles);

    for deterministic in [true, false] {
        group.bench_function(BenchmarkId::new("deterministic", deterministic), |b| {
            b.iter(|| {
                let mut allocator = CollisionConstraintAllocator::new(
                    AllocatorConfig::default()
                        .with_workers(4)
                        .with_deterministic(deterministic),
                );
                tick(&mut allocator, black_box(&candidates));
                allocator.num_midphases()
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_fresh_contacts,
    bench_persistent_contacts,
    bench_nondeterministic
);
criterion_main!(benches);
