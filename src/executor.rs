mod dispatch;
mod handle;

pub use crate::executor::handle::RunHandle;
use crate::{
    config::{Config, RunConfig},
    context::ExecutionContext,
    error::ExecutionError,
    executor::dispatch::Dispatcher,
    scheduler,
    state::BlockState,
    topology::Topology,
    types::BlockId,
};
use core::time::Duration;
use derive_more::Debug;
use rayon::ThreadPoolBuilder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span};

/// Runs a [`Topology`] on a bounded pool of worker threads.
///
/// Every run:
/// - Seeds the scheduler with all root blocks.
/// - Lets `max_parallelism` workers repeatedly dequeue a ready block, hand
///   it the contents of its upstream warehouses, invoke it, commit its
///   outputs, and signal downstream barriers.
/// - Re-queues non-exhausted shipment sources whenever a shipment cycle
///   drains.
/// - Fails with [`ExecutionError::Deadlock`] if nothing completes or is
///   skipped within the watchdog timeout. The watchdog runs on the calling
///   thread, outside the worker pool, and does not wait for stuck blocks.
///
/// Block failures are contained: descendants are poisoned, unaffected
/// branches finish, and all failures are reported together at the end.
#[must_use]
#[derive(Debug)]
pub struct Executor<C: Config> {
    #[debug(skip)]
    topology: Arc<Topology<C>>,
    config: RunConfig,
}

impl<C: Config> Clone for Executor<C> {
    fn clone(&self) -> Self {
        Self {
            topology: Arc::clone(&self.topology),
            config: self.config.clone(),
        }
    }
}

impl<C: Config> Executor<C> {
    /// Bind a topology to a run configuration.
    ///
    /// # Errors
    /// [`ExecutionError::InvalidConfig`] or
    /// [`ExecutionError::SchedulerNotImplemented`] when the configuration
    /// cannot drive a run.
    pub fn new(
        topology: impl Into<Arc<Topology<C>>>,
        config: RunConfig,
    ) -> Result<Self, ExecutionError> {
        config.validate()?;
        scheduler::for_mode::<C>(config.scheduler)?;
        Ok(Self {
            topology: topology.into(),
            config,
        })
    }

    /// The graph this executor runs.
    pub fn topology(&self) -> &Arc<Topology<C>> {
        &self.topology
    }

    /// The run configuration.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run the graph to completion on the calling thread's behalf.
    ///
    /// # Errors
    /// See [`ExecutionError`].
    pub fn execute(&self) -> Result<RunReport, ExecutionError> {
        self.execute_with(&CancellationToken::new())
    }

    /// Run the graph, observing `cancellation`.
    ///
    /// A cancelled run is not an error: blocks not yet started end
    /// `Cancelled` (their descendants `Poisoned`) and the report says so.
    ///
    /// # Errors
    /// See [`ExecutionError`].
    pub fn execute_with(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<RunReport, ExecutionError> {
        self.execute_context(&self.context(cancellation))
    }

    /// Fresh run state for this executor. The run observes `cancellation`
    /// through a child token, so stopping the run internally never cancels
    /// the caller's token.
    pub fn context(&self, cancellation: &CancellationToken) -> Arc<ExecutionContext<C>> {
        Arc::new(ExecutionContext::new(
            Arc::clone(&self.topology),
            self.config.clone(),
            cancellation.child_token(),
        ))
    }

    /// Run the graph using a caller-prepared context.
    ///
    /// The context's own topology and configuration drive the run. A context
    /// must not be reused for a second run.
    ///
    /// When the watchdog fires, blocks still executing are left on detached
    /// pool threads with the run's token cancelled; their results are
    /// discarded.
    ///
    /// # Errors
    /// See [`ExecutionError`].
    pub fn execute_context(
        &self,
        ctx: &Arc<ExecutionContext<C>>,
    ) -> Result<RunReport, ExecutionError> {
        let config = ctx.config();
        config.validate()?;
        let scheduler = scheduler::for_mode::<C>(config.scheduler)?;
        let workers = config.max_parallelism.get();
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|idx| format!("blockflow-worker-{idx}"))
            .panic_handler(|_| error!("worker loop panicked"))
            .build()?;

        let span = info_span!("run", blocks = ctx.topology().len(), workers);
        let _entered = span.enter();
        debug!("run started");

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(ctx),
            Arc::from(scheduler),
            workers,
        ));
        dispatcher.seed();
        for _ in 0..workers {
            let dispatcher = Arc::clone(&dispatcher);
            pool.spawn(move || dispatcher.work());
        }
        dispatcher.watch();
        let result = dispatcher.finish();
        debug!(
            shipments = ctx.processed_shipments(),
            cycles = ctx.cycle() + 1,
            ok = result.is_ok(),
            "run finished"
        );
        result
    }

    /// Run the graph on a background thread.
    ///
    /// # Errors
    /// [`ExecutionError::Spawn`] if the thread cannot be started.
    pub fn spawn(&self, cancellation: &CancellationToken) -> Result<RunHandle, ExecutionError> {
        RunHandle::spawn(self.clone(), cancellation.clone())
    }
}

/// Outcome of a run that did not abort.
#[must_use]
#[derive(Debug, Clone)]
pub struct RunReport {
    states: Vec<BlockState>,
    processed_shipments: usize,
    cycles: usize,
    elapsed: Duration,
    cancelled: bool,
}

impl RunReport {
    pub(crate) fn from_context<C: Config>(ctx: &ExecutionContext<C>) -> Self {
        Self {
            states: ctx.states(),
            processed_shipments: ctx.processed_shipments(),
            cycles: ctx.cycle() + 1,
            elapsed: ctx.elapsed(),
            cancelled: ctx.cancellation().is_cancelled(),
        }
    }

    /// Final state of a block.
    ///
    /// # Panics
    /// If `id` does not belong to the executed topology.
    #[must_use]
    pub fn state(&self, id: BlockId) -> BlockState {
        self.states[id.index()]
    }

    /// Final state of every block, indexed by [`BlockId::index`].
    #[must_use]
    pub fn states(&self) -> &[BlockState] {
        &self.states
    }

    /// Number of blocks that ended in `state`.
    #[must_use]
    pub fn count(&self, state: BlockState) -> usize {
        self.states.iter().filter(|&&s| s == state).count()
    }

    /// Shipments settled (executed, failed, or skipped) during the run.
    #[must_use]
    pub fn processed_shipments(&self) -> usize {
        self.processed_shipments
    }

    /// Shipment cycles started.
    #[must_use]
    pub fn cycles(&self) -> usize {
        self.cycles
    }

    /// Wall-clock duration of the run.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Whether cancellation was requested during the run.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}
