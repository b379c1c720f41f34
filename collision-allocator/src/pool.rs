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
//! Memory pooling for reducing allocation churn
//!
//! Collision bookkeeping churns short vectors every tick: scratch arrays for
//! the merge step and the per-midphase constraint lists that come and go as
//! pairs start and stop touching. This module provides a thread-safe pool of
//! `Vec` buffers so those allocations are reused instead of freed.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Configuration for buffer pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Initial capacity for each freshly allocated buffer
    pub initial_capacity: usize,
    /// Maximum number of idle buffers to keep in the pool
    pub max_pool_size: usize,
    /// Whether to log when the pool has to allocate
    pub log_resize_events: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            initial_capacity: 8,
            max_pool_size: 256,
            log_resize_events: false,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with custom settings
    pub fn new(initial_capacity: usize, max_pool_size: usize) -> Self {
        PoolConfig {
            initial_capacity,
            max_pool_size,
            log_resize_events: false,
        }
    }

    /// Enable logging for allocation events
    pub fn with_logging(mut self) -> Self {
        self.log_resize_events = true;
        self
    }
}

/// Statistics for monitoring pool performance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    /// Number of times a buffer was served from the pool
    pub hits: usize,
    /// Number of times a new buffer had to be allocated
    pub misses: usize,
    /// Number of buffers handed back to the pool
    pub returned: usize,
    /// Number of returned buffers dropped because the pool was full
    pub discarded: usize,
    /// Current number of idle buffers in the pool
    pub pool_size: usize,
    /// Peak number of idle buffers
    pub peak_size: usize,
}

impl PoolStats {
    /// Calculate the hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

struct PoolState<T> {
    buffers: Vec<Vec<T>>,
    stats: PoolStats,
}

/// A thread-safe pool of `Vec` buffers
///
/// Buffers come back cleared but keep their capacity. Clones share the same
/// underlying pool.
pub struct VecPool<T> {
    state: Arc<Mutex<PoolState<T>>>,
    config: PoolConfig,
}

impl<T> VecPool<T> {
    /// Create a new pool with default configuration
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    /// Create a new pool with custom configuration
    pub fn with_config(config: PoolConfig) -> Self {
        VecPool {
            state: Arc::new(Mutex::new(PoolState {
                buffers: Vec::new(),
                stats: PoolStats::default(),
            })),
            config,
        }
    }

    // A panic while holding the lock cannot leave the free list half-updated,
    // so a poisoned pool is still usable.
    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a buffer with at least `min_capacity` room out of the pool
    ///
    /// The caller owns the buffer; hand it back with [`VecPool::recycle`].
    pub fn take(&self, min_capacity: usize) -> Vec<T> {
        let mut state = self.lock();
        match state.buffers.pop() {
            Some(mut buffer) => {
                state.stats.hits += 1;
                state.stats.pool_size = state.buffers.len();
                drop(state);
                buffer.reserve(min_capacity);
                buffer
            }
            None => {
                state.stats.misses += 1;
                if self.config.log_resize_events {
                    debug!(hit_rate = state.stats.hit_rate(), "vec pool allocating new buffer");
                }
                drop(state);
                Vec::with_capacity(min_capacity.max(self.config.initial_capacity))
            }
        }
    }

    /// Return a buffer to the pool
    ///
    /// The buffer is cleared. If the pool already holds `max_pool_size` idle
    /// buffers it is dropped instead.
    pub fn recycle(&self, mut buffer: Vec<T>) {
        buffer.clear();
        let mut state = self.lock();
        state.stats.returned += 1;
        if state.buffers.len() < self.config.max_pool_size {
            state.buffers.push(buffer);
            state.stats.pool_size = state.buffers.len();
            state.stats.peak_size = state.stats.peak_size.max(state.stats.pool_size);
        } else {
            state.stats.discarded += 1;
        }
    }

    /// Borrow a buffer that returns itself to the pool when dropped
    pub fn acquire(&self, min_capacity: usize) -> PooledVec<T> {
        PooledVec {
            buffer: Some(self.take(min_capacity)),
            pool: self.clone(),
        }
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        self.lock().stats.clone()
    }

    /// Drop all idle buffers
    pub fn clear(&self) {
        let mut state = self.lock();
        state.buffers.clear();
        state.stats.pool_size = 0;
    }

    /// Get the current number of idle buffers
    pub fn len(&self) -> usize {
        self.lock().buffers.len()
    }

    /// Check if the pool has no idle buffers
    pub fn is_empty(&self) -> bool {
        self.lock().buffers.is_empty()
    }
}

impl<T> Default for VecPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for VecPool<T> {
    fn clone(&self) -> Self {
        VecPool {
            state: Arc::clone(&self.state),
            config: self.config.clone(),
        }
    }
}

/// RAII guard for a pooled `Vec`
///
/// When dropped, returns the buffer to the pool for reuse.
pub struct PooledVec<T> {
    buffer: Option<Vec<T>>,
    pool: VecPool<T>,
}

impl<T> Deref for PooledVec<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Self::Target {
        match &self.buffer {
            Some(buffer) => buffer,
            None => unreachable!("pooled buffer accessed after release"),
        }
    }
}

impl<T> DerefMut for PooledVec<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.buffer {
            Some(buffer) => buffer,
            None => unreachable!("pooled buffer accessed after release"),
        }
    }
}

impl<T> Drop for PooledVec<T> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.recycle(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.initial_capacity, 8);
        assert_eq!(config.max_pool_size, 256);
        assert!(!config.log_resize_events);
    }

    #[test]
    fn test_pool_config_custom() {
        let config = PoolConfig::new(128, 16).with_logging();
        assert_eq!(config.initial_capacity, 128);
        assert_eq!(config.max_pool_size, 16);
        assert!(config.log_resize_events);
    }

    #[test]
    fn test_take_and_recycle() {
        let pool: VecPool<u32> = VecPool::new();
        let mut buffer = pool.take(4);
        assert!(buffer.capacity() >= 8);
        buffer.extend([1, 2, 3]);
        pool.recycle(buffer);
        assert_eq!(pool.len(), 1);

        let reused = pool.take(0);
        assert!(reused.is_empty());
        assert!(reused.capacity() >= 3);

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.returned, 1);
        assert_eq!(stats.hit_rate(), 50.0);
    }

    #[test]
    fn test_guard_returns_on_drop() {
        let pool: VecPool<u32> = VecPool::new();
        {
            let mut guard = pool.acquire(16);
            guard.push(7);
            assert_eq!(guard.len(), 1);
        }
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_max_pool_size() {
        let pool: VecPool<u8> = VecPool::with_config(PoolConfig::new(4, 2));
        let buffers: Vec<_> = (0..3).map(|_| pool.take(1)).collect();
        for buffer in buffers {
            pool.recycle(buffer);
        }
        assert_eq!(pool.len(), 2);
        let stats = pool.stats();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.peak_size, 2);
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let pool: VecPool<usize> = VecPool::new();
        let pool_clone = pool.clone();

        let handle = thread::spawn(move || {
            let mut guard = pool_clone.acquire(1);
            guard.push(1);
        });

        {
            let mut guard = pool.acquire(1);
            guard.push(2);
        }

        handle.join().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.returned, 2);
    }

    #[test]
    fn test_clear() {
        let pool: VecPool<u8> = VecPool::new();
        pool.recycle(Vec::new());
        pool.recycle(Vec::new());
        assert_eq!(pool.len(), 2);
        pool.clear();
        assert!(pool.is_empty());
        assert_eq!(pool.stats().pool_size, 0);
    }
}
