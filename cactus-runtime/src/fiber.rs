//! # Fiber Identity
//!
//! A fiber is the unit of execution that owns one stack segment at a time.
//! Its identity survives stack growth: a grown segment carries the id of the
//! segment it replaced.
//!
//! ## Design
//!
//! Ids come from a single process-wide counter so that a continuation
//! resumed on another domain keeps a globally unique id.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub u64);

impl FiberId {
    /// Id shared by every domain's main segment.
    pub const MAIN: FiberId = FiberId(0);

    /// Wrap a raw id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.0)
    }
}

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a fresh fiber id.
pub fn next_fiber_id() -> FiberId {
    FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_ids_are_unique_and_increasing() {
        let a = next_fiber_id();
        let b = next_fiber_id();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_fiber_id_display() {
        assert_eq!(FiberId::new(9).to_string(), "Fiber(9)");
        assert_eq!(FiberId::new(9).as_u64(), 9);
    }
}
