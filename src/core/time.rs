//! Logical modification clock.
//!
//! Staleness is decided by comparing logical timestamps, never wall-clock
//! time. The clock is a single process-wide counter that only moves forward
//! when something is mutated.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static GLOBAL_CLOCK: AtomicU64 = AtomicU64::new(0);

/// A point on the process-wide logical clock.
///
/// `TimeStamp::ZERO` is older than every stamp returned by [`TimeStamp::tick`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TimeStamp(u64);

impl TimeStamp {
    /// The "never modified" stamp.
    pub const ZERO: TimeStamp = TimeStamp(0);

    /// Advance the global clock and return the new stamp.
    ///
    /// Every call returns a stamp strictly greater than all previously
    /// returned stamps, across all threads.
    pub fn tick() -> Self {
        Self(GLOBAL_CLOCK.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Raw counter value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Whether this stamp was ever set.
    pub fn is_set(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_is_strictly_increasing() {
        let a = TimeStamp::tick();
        let b = TimeStamp::tick();
        assert!(b > a);
        assert!(a > TimeStamp::ZERO);
        assert!(a.is_set());
        assert!(!TimeStamp::ZERO.is_set());
    }

    #[test]
    fn test_tick_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..100).map(|_| TimeStamp::tick()).collect::<Vec<_>>()))
            .collect();

        let mut all: Vec<TimeStamp> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let len = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), len);
    }
}
