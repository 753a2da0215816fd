//! 64-bit server process identifiers
//!
//! A `ServerId` names one enlisted server *process*, not a machine: if a
//! process crashes and a new one enlists with the same locator, it gets a
//! different id. Ids are allocated densely by the coordinator, which hands
//! out the lowest free index and bumps that index's generation, so lookups
//! are an array index plus a generation check rather than a hash lookup.
//!
//! Index 0 is reserved and never allocated to an enlisting server.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Generation number marking an invalid id. Never allocated to a real server.
pub const INVALID_GENERATION: u32 = u32::MAX;

#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(u64);

impl ServerId {
    /// Build an id from its index and generation parts.
    pub const fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// Wrap a serialized id.
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// An id that matches nothing.
    pub const fn invalid() -> Self {
        Self::new(0, INVALID_GENERATION)
    }

    /// Serialized form.
    pub const fn id(&self) -> u64 {
        self.0
    }

    /// The reusable slot part.
    pub const fn index(&self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    pub const fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn is_valid(&self) -> bool {
        self.generation() != INVALID_GENERATION
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::invalid()
    }
}

impl PartialEq for ServerId {
    fn eq(&self, other: &Self) -> bool {
        // Invalid is invalid, regardless of the index.
        if !self.is_valid() && !other.is_valid() {
            return true;
        }
        self.0 == other.0
    }
}

impl Eq for ServerId {}

impl Hash for ServerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        if self.is_valid() {
            self.0.hash(state);
        } else {
            INVALID_GENERATION.hash(state);
        }
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{}.{}", self.index(), self.generation())
        } else {
            write!(f, "invalid")
        }
    }
}

impl std::fmt::Debug for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ServerId({})", self)
    }
}
