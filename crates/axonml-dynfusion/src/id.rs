//! Identifiers
//!
//! Monotonic id allocation and the two id spaces used by every graph:
//! tensors and operators.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::fmt;

use serde::Serialize;

/// Raw id value reserved for "no value". Never returned by an allocator.
pub const EMPTY_ID: i32 = -1;

// =============================================================================
// Allocator
// =============================================================================

/// Hands out strictly increasing ids starting at zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdAllocator {
    next: i32,
}

impl IdAllocator {
    /// Creates an allocator whose first id is zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next id.
    pub fn alloc(&mut self) -> i32 {
        let id = self.next;
        self.next += 1;
        id
    }

    /// Makes sure a future `alloc` never returns `id` or anything below it.
    pub fn reserve(&mut self, id: i32) {
        if id >= self.next {
            self.next = id + 1;
        }
    }

    /// Number of ids handed out or reserved so far.
    pub fn allocated(&self) -> usize {
        self.next as usize
    }
}

// =============================================================================
// Id Spaces
// =============================================================================

/// Identifier of a tensor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TensorId(pub(crate) i32);

/// Identifier of an operator node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct OperatorId(pub(crate) i32);

macro_rules! impl_id {
    ($name:ident, $prefix:literal) => {
        impl $name {
            /// Wraps a raw id.
            pub fn new(raw: i32) -> Self {
                Self(raw)
            }

            /// Returns the raw value.
            pub fn raw(self) -> i32 {
                self.0
            }

            /// Returns whether this is the reserved empty id.
            pub fn is_empty(self) -> bool {
                self.0 == EMPTY_ID
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

impl_id!(TensorId, "t");
impl_id!(OperatorId, "op");

// =============================================================================
// Tests
// =============================================================================
