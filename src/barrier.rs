use crate::sync::{AtomicUsize, Ordering};

/// Countdown gate that releases a consumer block once every active
/// predecessor has reported completion (or was skipped).
///
/// The threshold is the consumer's *active* in-degree for the current
/// shipment cycle. [`signal`](Self::signal) returns `true` for exactly one
/// caller: the one whose decrement brings the count to zero. Signals arriving
/// after that are ignored.
#[must_use]
#[derive(Debug)]
pub struct DependencyBarrier {
    threshold: usize,
    remaining: AtomicUsize,
}

impl DependencyBarrier {
    /// Create a barrier waiting for `threshold` signals.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            remaining: AtomicUsize::new(threshold),
        }
    }

    /// Record one predecessor signal.
    ///
    /// Returns `true` only on the Waiting -> Satisfied transition.
    pub fn signal(&self) -> bool {
        // AcqRel: the satisfying thread observes every predecessor's commit
        // that happened before its own signal.
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                left.checked_sub(1)
            })
            .is_ok_and(|prev| prev == 1)
    }

    /// Whether all expected signals have arrived.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }

    /// Number of signals still expected.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Number of signals the barrier was seeded with.
    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }
}
