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
//! Fork-join task glue
//!
//! The allocator needs two shapes of parallelism: data-parallel batches over
//! a contiguous index range, and running two independent closures side by
//! side. Both block until every task has finished. With the `parallel`
//! feature they run on a dedicated Rayon pool; without it, or with a single
//! worker, they run inline on the calling thread.
//!
//! Results are always returned in batch order, never completion order.

use std::ops::Range;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Partition of `0..item_count` into contiguous batches
///
/// Every batch except the last holds `item_count / batch_count` items; the
/// last absorbs the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    item_count: usize,
    batch_count: usize,
    batch_size: usize,
}

impl BatchPlan {
    /// Plan batches for `item_count` items across at most `max_batches`
    /// workers, never splitting below `min_batch_size` items per batch
    pub fn new(item_count: usize, max_batches: usize, min_batch_size: usize) -> Self {
        let min_batch_size = min_batch_size.max(1);
        let batch_count = if item_count == 0 {
            0
        } else {
            max_batches.max(1).min(item_count / min_batch_size).max(1)
        };
        let batch_size = if batch_count == 0 { 0 } else { item_count / batch_count };
        BatchPlan {
            item_count,
            batch_count,
            batch_size,
        }
    }

    /// Number of items covered
    pub fn item_count(&self) -> usize {
        self.item_count
    }

    /// Number of batches
    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    /// Index range of one batch
    pub fn range(&self, batch_index: usize) -> Range<usize> {
        debug_assert!(batch_index < self.batch_count);
        let start = batch_index * self.batch_size;
        let end = if batch_index + 1 == self.batch_count {
            self.item_count
        } else {
            start + self.batch_size
        };
        start..end
    }

    /// All batch ranges in order
    pub fn ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        (0..self.batch_count).map(move |batch_index| self.range(batch_index))
    }
}

/// Runs fork-join work for the allocator
pub struct TaskScheduler {
    worker_count: usize,
    #[cfg(feature = "parallel")]
    pool: Option<rayon::ThreadPool>,
}

impl TaskScheduler {
    /// Create a scheduler with `worker_count` workers
    ///
    /// A single worker never spawns threads. If the thread pool cannot be
    /// built the scheduler falls back to running inline.
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        #[cfg(feature = "parallel")]
        {
            let pool = if worker_count > 1 {
                match rayon::ThreadPoolBuilder::new()
                    .num_threads(worker_count)
                    .thread_name(|index| format!("collision-worker-{index}"))
                    .build()
                {
                    Ok(pool) => Some(pool),
                    Err(err) => {
                        tracing::warn!(%err, "failed to build collision worker pool, running inline");
                        None
                    }
                }
            } else {
                None
            };
            TaskScheduler { worker_count, pool }
        }
        #[cfg(not(feature = "parallel"))]
        {
            TaskScheduler { worker_count }
        }
    }

    /// Number of configured workers
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Whether work actually fans out across threads
    pub fn is_parallel(&self) -> bool {
        #[cfg(feature = "parallel")]
        {
            self.pool.is_some()
        }
        #[cfg(not(feature = "parallel"))]
        {
            false
        }
    }

    /// Run `task` once per batch of `plan` and collect results in batch order
    pub fn run_batches<R, F>(&self, plan: &BatchPlan, task: F) -> Vec<R>
    where
        R: Send,
        F: Fn(usize, Range<usize>) -> R + Sync + Send,
    {
        #[cfg(feature = "parallel")]
        {
            if let Some(pool) = &self.pool {
                if plan.batch_count() > 1 {
                    return pool.install(|| {
                        (0..plan.batch_count())
                            .into_par_iter()
                            .map(|batch_index| task(batch_index, plan.range(batch_index)))
                            .collect()
                    });
                }
            }
        }
        (0..plan.batch_count())
            .map(|batch_index| task(batch_index, plan.range(batch_index)))
            .collect()
    }

    /// Run two closures, potentially concurrently, and wait for both
    pub fn join<A, B, RA, RB>(&self, a: A, b: B) -> (RA, RB)
    where
        A: FnOnce() -> RA + Send,
        B: FnOnce() -> RB + Send,
        RA: Send,
        RB: Send,
    {
        #[cfg(feature = "parallel")]
        {
            if let Some(pool) = &self.pool {
                return pool.install(|| rayon::join(a, b));
            }
        }
        let ra = a();
        let rb = b();
        (ra, rb)
    }
}
