//! # Handles
//!
//! A `Handle` is the 64-bit address used for both members and commands.
//!
//! ```text
//!  63                32 31                 0
//! ┌────────────────────┬────────────────────┐
//! │      type_id       │       seq_id       │
//! └────────────────────┴────────────────────┘
//! ```
//!
//! A `seq_id` of `0` is the wildcard: "any instance of this type" when used
//! as a receiver, "no reference" when returned from a descriptor.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 64-bit identifier made of a type component and a sequence component.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Handle(u64);

impl Handle {
    /// The any-handle: no type, no instance.
    pub const ANY: Self = Self(0);

    /// Build a handle from its two components.
    #[must_use]
    pub const fn new(type_id: u32, seq_id: u32) -> Self {
        Self(((type_id as u64) << 32) | seq_id as u64)
    }

    /// Wildcard handle addressing any instance of `type_id`.
    #[must_use]
    pub const fn of_type(type_id: u32) -> Self {
        Self::new(type_id, 0)
    }

    /// Wrap a raw 64-bit value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Upper 32 bits.
    #[must_use]
    pub const fn type_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Lower 32 bits.
    #[must_use]
    pub const fn seq_id(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }

    /// True for [`Handle::ANY`].
    #[must_use]
    pub const fn is_any(self) -> bool {
        self.0 == 0
    }

    /// True when the sequence component is the wildcard.
    #[must_use]
    pub const fn is_type_wildcard(self) -> bool {
        self.seq_id() == 0
    }
}

impl From<u64> for Handle {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<Handle> for u64 {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_id(), self.seq_id())
    }
}
