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
//! Allocator configuration
//!
//! # Environment Configuration
//!
//! [`AllocatorConfig::from_env`] starts from the defaults and applies any of:
//! ```bash
//! export COLLISION_ALLOCATOR_WORKERS=8
//! export COLLISION_ALLOCATOR_DETERMINISTIC=1
//! export COLLISION_ALLOCATOR_MIN_BATCH=64
//! ```

use std::env;

use thiserror::Error;

use crate::pool::PoolConfig;

/// Environment variable overriding [`AllocatorConfig::worker_count`]
pub const ENV_WORKERS: &str = "COLLISION_ALLOCATOR_WORKERS";
/// Environment variable overriding [`AllocatorConfig::deterministic`]
pub const ENV_DETERMINISTIC: &str = "COLLISION_ALLOCATOR_DETERMINISTIC";
/// Environment variable overriding [`AllocatorConfig::min_batch_size`]
pub const ENV_MIN_BATCH: &str = "COLLISION_ALLOCATOR_MIN_BATCH";

/// Errors produced while building or validating a configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// At least one worker slot is required
    #[error("worker count must be at least 1")]
    ZeroWorkers,
    /// Batches must hold at least one item
    #[error("minimum batch size must be at least 1")]
    ZeroBatchSize,
    /// An environment variable held something unparsable
    #[error("environment variable {name} has invalid value {value:?}")]
    InvalidEnv {
        /// Variable name
        name: &'static str,
        /// Raw value found
        value: String,
    },
}

/// Tuning for [`CollisionConstraintAllocator`](crate::CollisionConstraintAllocator)
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Number of detection worker slots; one constraint factory is created per
    /// slot and the batch fan-out never exceeds it. `1` runs single-threaded.
    pub worker_count: usize,
    /// Sort merged items by stable keys so results do not depend on thread
    /// scheduling
    pub deterministic: bool,
    /// Smallest number of constraints a parallel batch may hold. Below twice
    /// this count everything runs as one batch.
    pub min_batch_size: usize,
    /// Unused capacity in the global midphase list allowed before pruning
    /// shrinks it
    pub shrink_slack: usize,
    /// Buffer pool settings
    pub pool: PoolConfig,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            worker_count: default_worker_count(),
            deterministic: true,
            min_batch_size: 64,
            shrink_slack: 1024,
            pool: PoolConfig::default(),
        }
    }
}

impl AllocatorConfig {
    /// Single-threaded configuration
    pub fn single_threaded() -> Self {
        AllocatorConfig {
            worker_count: 1,
            ..AllocatorConfig::default()
        }
    }

    /// Set the worker count
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Enable or disable deterministic merging
    pub fn with_deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    /// Set the minimum parallel batch size
    pub fn with_min_batch_size(mut self, min_batch_size: usize) -> Self {
        self.min_batch_size = min_batch_size;
        self
    }

    /// Set the midphase list shrink slack
    pub fn with_shrink_slack(mut self, shrink_slack: usize) -> Self {
        self.shrink_slack = shrink_slack;
        self
    }

    /// Set the buffer pool configuration
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Build a configuration from the defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = AllocatorConfig::default();
        if let Some(workers) = read_env(ENV_WORKERS, parse_usize)? {
            config.worker_count = workers;
        }
        if let Some(deterministic) = read_env(ENV_DETERMINISTIC, parse_bool)? {
            config.deterministic = deterministic;
        }
        if let Some(min_batch) = read_env(ENV_MIN_BATCH, parse_usize)? {
            config.min_batch_size = min_batch;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the allocator cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.min_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

fn read_env<T>(name: &'static str, parse: fn(&str) -> Option<T>) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => parse(raw.trim())
            .map(Some)
            .ok_or(ConfigError::InvalidEnv { name, value: raw }),
        Err(_) => Ok(None),
    }
}

fn parse_usize(raw: &str) -> Option<usize> {
    raw.parse().ok()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
