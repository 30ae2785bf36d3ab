//! Identity generation
//!
//! Object and value records share one id space. Ids are handed out before
//! anything is written, so parent/child links and bulk inserts never depend
//! on store-generated keys.

use std::sync::atomic::{AtomicI64, Ordering};

/// Monotonically increasing id allocator, safe under concurrent use.
pub trait IdGenerator {
    fn next_id(&self) -> i64;
}

/// In-process sequence, typically seeded from the highest id in the store.
#[derive(Debug)]
pub struct SequenceIds {
    next: AtomicI64,
}

impl SequenceIds {
    /// Start handing out ids after `last`
    pub fn starting_after(last: i64) -> Self {
        Self {
            next: AtomicI64::new(last.max(0) + 1),
        }
    }

    /// Peek at the id the next call will return
    pub fn peek(&self) -> i64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for SequenceIds {
    fn default() -> Self {
        Self::starting_after(0)
    }
}

impl IdGenerator for SequenceIds {
    fn next_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}
