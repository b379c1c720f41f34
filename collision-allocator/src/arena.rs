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
//! Generational slot arena
//!
//! Midphases and constraints are owned by arenas and referred to everywhere
//! else by [`ArenaIndex`]. Freed slots are recycled with a bumped generation,
//! so an index kept past its object's destruction resolves to `None` instead
//! of aliasing whatever took the slot.

use std::fmt;

/// Generational index into an [`Arena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaIndex {
    slot: u32,
    generation: u32,
}

impl ArenaIndex {
    /// Slot position inside the arena
    pub fn slot(&self) -> usize {
        self.slot as usize
    }

    /// Generation the slot had when this index was issued
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ArenaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.slot, self.generation)
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Free { generation: u32, next_free: Option<u32> },
}

/// Slot arena with generation-checked access
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Arena<T> {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create an arena with room for `capacity` values
    pub fn with_capacity(capacity: usize) -> Self {
        Arena {
            slots: Vec::with_capacity(capacity),
            free_head: None,
            len: 0,
        }
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena holds no live values
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a value, reusing the most recently freed slot if any
    pub fn insert(&mut self, value: T) -> ArenaIndex {
        self.len += 1;
        match self.free_head {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                let (generation, next_free) = match entry {
                    Slot::Free { generation, next_free } => (*generation, *next_free),
                    Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
                };
                *entry = Slot::Occupied { generation, value };
                self.free_head = next_free;
                ArenaIndex { slot, generation }
            }
            None => {
                let slot = u32::try_from(self.slots.len()).unwrap_or_else(|_| panic!("arena slot count exceeds u32"));
                self.slots.push(Slot::Occupied { generation: 0, value });
                ArenaIndex { slot, generation: 0 }
            }
        }
    }

    /// Remove and return the value at `index`
    ///
    /// Returns `None` if the index is stale.
    pub fn remove(&mut self, index: ArenaIndex) -> Option<T> {
        let entry = self.slots.get_mut(index.slot())?;
        match entry {
            Slot::Occupied { generation, .. } if *generation == index.generation => {}
            _ => return None,
        }
        let freed = Slot::Free {
            generation: index.generation.wrapping_add(1),
            next_free: self.free_head,
        };
        let previous = std::mem::replace(entry, freed);
        self.free_head = Some(index.slot);
        self.len -= 1;
        match previous {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Free { .. } => None,
        }
    }

    /// Get a reference to the value at `index`
    pub fn get(&self, index: ArenaIndex) -> Option<&T> {
        match self.slots.get(index.slot())? {
            Slot::Occupied { generation, value } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// Get a mutable reference to the value at `index`
    pub fn get_mut(&mut self, index: ArenaIndex) -> Option<&mut T> {
        match self.slots.get_mut(index.slot())? {
            Slot::Occupied { generation, value } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// Drop every value and forget all slots
    ///
    /// Indices issued before the clear must not be used afterwards; slot
    /// generations restart from zero.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free_head = None;
        self.len = 0;
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}
