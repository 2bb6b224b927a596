mod simple_dfs;

pub use crate::scheduler::simple_dfs::SimpleDfsScheduler;
use crate::{
    config::{Config, SchedulerMode},
    context::ExecutionContext,
    error::ExecutionError,
    types::BlockId,
};

/// Decides run order of ready blocks and propagates completion and blocking
/// effects to barriers and warehouses.
///
/// The executor only talks to the scheduler through this trait, so a new
/// strategy can be added without touching the driver.
pub trait Scheduler<C: Config>: Send + Sync {
    /// Whether no block is queued.
    fn is_empty(&self) -> bool;

    /// Queue a ready block.
    ///
    /// Returns `false` if the block is blocked or already queued.
    fn try_enqueue(&self, block: BlockId, ctx: &ExecutionContext<C>) -> bool;

    /// Pop the highest-priority block that is still runnable.
    fn try_dequeue(&self, ctx: &ExecutionContext<C>) -> Option<BlockId>;

    /// Signal the barrier of every downstream block of `block`; blocks whose
    /// barrier becomes satisfied are queued, or skipped if an upstream block
    /// is blocked.
    fn signal_completion(&self, block: BlockId, ctx: &ExecutionContext<C>);

    /// Skip a block that will never run: release its share of every upstream
    /// warehouse, signal downstream as if it had completed, and count it as a
    /// processed shipment.
    fn handle_blocked_block(&self, block: BlockId, ctx: &ExecutionContext<C>);

    /// Re-queue every active, unblocked shipment source.
    fn prepare_next_shipment_cycle(&self, ctx: &ExecutionContext<C>);
}

/// Build the scheduler selected by `mode`.
///
/// # Errors
/// [`ExecutionError::SchedulerNotImplemented`] for the reserved adaptive
/// modes.
pub fn for_mode<C: Config>(mode: SchedulerMode) -> Result<Box<dyn Scheduler<C>>, ExecutionError> {
    match mode {
        SchedulerMode::SimpleDfs => Ok(Box::new(SimpleDfsScheduler::new())),
        SchedulerMode::Adaptive | SchedulerMode::AdaptiveBatched => {
            Err(ExecutionError::SchedulerNotImplemented(mode))
        }
    }
}
