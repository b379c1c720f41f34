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
//! Epochs and container cookies

use std::fmt;

/// Simulation tick counter
///
/// Advanced by exactly one per tick by whoever owns the simulation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Epoch(u64);

impl Epoch {
    /// The first epoch
    pub const ZERO: Epoch = Epoch(0);

    /// Create an epoch from a raw tick count
    pub fn new(tick: u64) -> Self {
        Epoch(tick)
    }

    /// Raw tick count
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// The following epoch
    pub fn next(&self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch({})", self.0)
    }
}

/// Active-list bookkeeping stored on a constraint
///
/// The indices are only meaningful while `last_used_epoch` equals the
/// allocator's current epoch. Anything else is stale and must be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConstraintCookie {
    /// Epoch in which the indices were assigned; `None` if never active
    pub last_used_epoch: Option<Epoch>,
    /// Slot in the active constraint list
    pub constraint_index: Option<usize>,
    /// Slot in the active CCD constraint list, if CCD-enabled
    pub ccd_constraint_index: Option<usize>,
}

impl ConstraintCookie {
    /// Cookie for a constraint placed at `constraint_index` in `epoch`
    pub fn active(epoch: Epoch, constraint_index: usize) -> Self {
        ConstraintCookie {
            last_used_epoch: Some(epoch),
            constraint_index: Some(constraint_index),
            ccd_constraint_index: None,
        }
    }

    /// Whether the indices were assigned in `epoch`
    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.last_used_epoch == Some(epoch)
    }

    /// Active list slot, only if the cookie is current
    pub fn constraint_index_in(&self, epoch: Epoch) -> Option<usize> {
        if self.is_current(epoch) {
            self.constraint_index
        } else {
            None
        }
    }

    /// CCD list slot, only if the cookie is current
    pub fn ccd_constraint_index_in(&self, epoch: Epoch) -> Option<usize> {
        if self.is_current(epoch) {
            self.ccd_constraint_index
        } else {
            None
        }
    }

    /// Forget all indices
    pub fn clear(&mut self) {
        *self = ConstraintCookie::default();
    }
}
