use core::sync::atomic::{AtomicU8, Ordering};
use derive_more::Display;

/// Execution state of one block.
///
/// `Ready -> Running -> {Completed | Failed | Cancelled}` for blocks that are
/// invoked; `Poisoned` for blocks skipped because a predecessor failed, was
/// cancelled, or was itself poisoned. Only `Completed` blocks leave their
/// state again, returning to `Pending`/`Ready` when a new shipment cycle
/// starts.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockState {
    /// Waiting for its dependency barrier.
    Pending,
    /// Dependencies satisfied; queued or about to be queued.
    Ready,
    /// Executing on a worker thread.
    Running,
    /// Executed successfully.
    Completed,
    /// Execution returned an error or panicked.
    Failed,
    /// Skipped because an upstream block failed or was cancelled.
    Poisoned,
    /// Skipped or aborted because cancellation was requested.
    Cancelled,
}

impl BlockState {
    const ALL: [Self; 7] = [
        Self::Pending,
        Self::Ready,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Poisoned,
        Self::Cancelled,
    ];

    /// `Failed`, `Poisoned` or `Cancelled`: the block will never deliver
    /// outputs again in this run.
    #[must_use]
    pub fn is_blocked(self) -> bool {
        matches!(self, Self::Failed | Self::Poisoned | Self::Cancelled)
    }

    /// Whether the block is done for the current shipment cycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Completed || self.is_blocked()
    }
}

/// Lock-free cell holding a [`BlockState`].
#[derive(Debug)]
pub(crate) struct AtomicBlockState(AtomicU8);

impl AtomicBlockState {
    pub(crate) fn new(state: BlockState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> BlockState {
        BlockState::ALL[self.0.load(Ordering::Acquire) as usize]
    }

    pub(crate) fn store(&self, state: BlockState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move to `state` unless the block is already blocked; returns whether
    /// the transition happened.
    pub(crate) fn store_unless_blocked(&self, state: BlockState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (!BlockState::ALL[current as usize].is_blocked()).then_some(state as u8)
            })
            .is_ok()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::{AtomicBlockState, BlockState};

    #[test]
    fn round_trips_every_state() {
        let cell = AtomicBlockState::new(BlockState::Pending);
        for state in BlockState::ALL {
            cell.store(state);
            assert_eq!(cell.load(), state);
        }
    }

    #[test]
    fn blocked_states_are_sticky_for_guarded_stores() {
        let cell = AtomicBlockState::new(BlockState::Running);
        assert!(cell.store_unless_blocked(BlockState::Completed));
        cell.store(BlockState::Failed);
        assert!(!cell.store_unless_blocked(BlockState::Ready));
        assert_eq!(cell.load(), BlockState::Failed);
        assert!(BlockState::Completed.is_terminal());
        assert!(!BlockState::Completed.is_blocked());
        assert!(!BlockState::Running.is_terminal());
    }
}
