use crate::{
    block::{Block, BlockContext, BlockError},
    config::{Config, FailurePolicy},
    context::ExecutionContext,
    error::{BlockFailure, ExecutionError},
    executor::RunReport,
    scheduler::Scheduler,
    state::BlockState,
    types::{BlockId, Inputs},
    warehouse::WarehouseError,
};
use core::time::Duration;
use parking_lot::{Condvar, Mutex};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tracing::{Span, debug, error, trace, warn};

/// Upper bound on how long the watchdog sleeps between progress checks.
const WATCHDOG_TICK: Duration = Duration::from_millis(10);

/// Shared state of the worker loops and the watchdog of one run.
///
/// Dequeuing a block and bumping the active-worker count happen under the
/// same lock as the idle checks (drained cycle), as does the final decrement
/// after a block has signalled downstream. An idle worker therefore never
/// observes "queue empty and nobody active" while a block is in flight.
///
/// Workers own a handle to the dispatcher, so the watchdog can end the run
/// while a block is still executing and leave that worker detached.
pub(super) struct Dispatcher<C: Config> {
    ctx: Arc<ExecutionContext<C>>,
    scheduler: Arc<dyn Scheduler<C>>,
    span: Span,
    state: Mutex<DispatchState>,
    wakeup: Condvar,
}

#[derive(Default)]
struct DispatchState {
    finished: bool,
    abort: Option<ExecutionError>,
    /// Worker loops that have not returned yet.
    live_workers: usize,
}

/// Decrements the live-worker count when a worker loop exits, unwinding
/// included.
struct LiveWorker<'a, C: Config>(&'a Dispatcher<C>);

impl<C: Config> Drop for LiveWorker<'_, C> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.live_workers -= 1;
        drop(state);
        self.0.wakeup.notify_all();
    }
}

impl<C: Config> Dispatcher<C> {
    pub(super) fn new(
        ctx: Arc<ExecutionContext<C>>,
        scheduler: Arc<dyn Scheduler<C>>,
        workers: usize,
    ) -> Self {
        Self {
            ctx,
            scheduler,
            span: Span::current(),
            state: Mutex::new(DispatchState {
                live_workers: workers,
                ..DispatchState::default()
            }),
            wakeup: Condvar::new(),
        }
    }

    /// Queue every root block.
    pub(super) fn seed(&self) {
        for root in self.ctx.topology().roots() {
            self.scheduler.try_enqueue(root, &self.ctx);
        }
    }

    /// Worker loop: run blocks until the run finishes or aborts.
    pub(super) fn work(&self) {
        let _entered = self.span.enter();
        let _live = LiveWorker(self);
        while let Some(block) = self.next_block() {
            let outcome = self.run_block(block);
            let mut state = self.state.lock();
            if let Err(err) = outcome {
                error!(block = %block, %err, "aborting run");
                state.abort.get_or_insert(err);
                state.finished = true;
                self.ctx.cancellation().cancel();
            }
            self.ctx.decrement_active_workers();
            drop(state);
            self.wakeup.notify_all();
        }
    }

    /// Watchdog loop, run on the thread that started the run.
    ///
    /// Returns once the workers have drained the graph, or as soon as the run
    /// aborts. On abort, workers still inside a block are left behind; the
    /// run's token is cancelled and they exit when their block returns.
    pub(super) fn watch(&self) {
        let ctx = &self.ctx;
        let timeout = ctx.config().watchdog_timeout;
        let mut state = self.state.lock();
        loop {
            if state.abort.is_some() || (state.finished && state.live_workers == 0) {
                return;
            }
            if state.finished {
                self.wakeup.wait(&mut state);
                continue;
            }
            let idle = ctx.since_last_progress();
            if idle >= timeout {
                let err = ExecutionError::Deadlock {
                    timeout,
                    last_progress: ctx.last_progress(),
                    processed_shipments: ctx.processed_shipments(),
                };
                error!(%err, active = ctx.active_workers(), "watchdog fired");
                state.abort = Some(err);
                state.finished = true;
                ctx.cancellation().cancel();
                drop(state);
                self.wakeup.notify_all();
                return;
            }
            self.wakeup
                .wait_for(&mut state, WATCHDOG_TICK.min(timeout - idle));
        }
    }

    /// Outcome of the run once [`watch`](Self::watch) has returned.
    pub(super) fn finish(&self) -> Result<RunReport, ExecutionError> {
        if let Some(err) = self.state.lock().abort.take() {
            return Err(err);
        }
        let report = RunReport::from_context(&self.ctx);
        let failures = self.ctx.take_failures();
        if failures.is_empty() {
            Ok(report)
        } else {
            Err(ExecutionError::BlockFailures { failures, report })
        }
    }

    fn next_block(&self) -> Option<BlockId> {
        let ctx = &self.ctx;
        let mut state = self.state.lock();
        loop {
            if state.finished {
                return None;
            }
            if let Some(block) = self.scheduler.try_dequeue(ctx) {
                ctx.increment_active_workers();
                return Some(block);
            }
            if ctx.active_workers() == 0 && self.scheduler.is_empty() && ctx.cycle_settled() {
                if !ctx.cancellation().is_cancelled() && ctx.has_active_sources() {
                    let cycle = ctx.advance_cycle();
                    debug!(cycle, sources = ?ctx.active_sources(), "next shipment cycle");
                    self.scheduler.prepare_next_shipment_cycle(ctx);
                    continue;
                }
                state.finished = true;
                self.wakeup.notify_all();
                return None;
            }
            self.wakeup.wait(&mut state);
        }
    }

    fn run_block(&self, id: BlockId) -> Result<(), ExecutionError> {
        let ctx = &self.ctx;
        let topology = ctx.topology();
        if ctx.cancellation().is_cancelled() {
            debug!(block = %id, "cancelled before start");
            ctx.set_state(id, BlockState::Cancelled);
            ctx.retire_source(id);
            self.scheduler.handle_blocked_block(id, ctx);
            return Ok(());
        }

        ctx.set_state(id, BlockState::Running);
        let inputs = self.gather_inputs(id)?;
        let block = topology.block(id);
        let block_ctx = BlockContext {
            block: id,
            cycle: ctx.cycle(),
            max_shipment_size: ctx.max_shipment_size(id),
            cancellation: ctx.cancellation(),
        };
        trace!(block = %id, name = block.name(), cycle = block_ctx.cycle, "invoke");
        let result = panic::catch_unwind(AssertUnwindSafe(|| block.execute(inputs, &block_ctx)))
            .unwrap_or_else(|payload| Err(BlockError::from_panic(payload.as_ref())));

        match result {
            Ok(outputs) => {
                let produced: usize = outputs.values().map(Vec::len).sum();
                if ctx.out_degree(id) > 0 {
                    ctx.warehouse_or_create(id)
                        .commit(outputs)
                        .map_err(|source| ExecutionError::Warehouse { block: id, source })?;
                } else {
                    trace!(block = %id, produced, "no consumers; outputs dropped");
                }
                ctx.set_state(id, BlockState::Completed);
                if let Some(max) = block_ctx.max_shipment_size {
                    if produced < max.get() && ctx.retire_source(id) {
                        debug!(block = %id, produced, max = max.get(), "source exhausted");
                    }
                }
            }
            Err(BlockError::Cancelled) => {
                debug!(block = %id, "cancelled while running");
                ctx.set_state(id, BlockState::Cancelled);
                ctx.retire_source(id);
            }
            Err(error) => {
                warn!(block = %id, name = block.name(), %error, "block failed");
                ctx.set_state(id, BlockState::Failed);
                ctx.retire_source(id);
                ctx.record_failure(BlockFailure {
                    block: id,
                    name: block.name().to_owned(),
                    cycle: block_ctx.cycle,
                    error,
                });
                if ctx.config().failure_policy == FailurePolicy::FailFast {
                    ctx.cancellation().cancel();
                }
            }
        }
        ctx.record_shipment();
        self.scheduler.signal_completion(id, ctx);
        Ok(())
    }

    /// Pull this block's share out of every participating upstream warehouse
    /// and route it onto the block's input sockets.
    fn gather_inputs(&self, id: BlockId) -> Result<Inputs<C::Item>, ExecutionError> {
        let ctx = &self.ctx;
        let topology = ctx.topology();
        let mut inputs: Inputs<C::Item> = topology
            .block(id)
            .inputs()
            .iter()
            .map(|socket| (socket.id.clone(), Vec::new()))
            .collect();

        for &parent in topology.upstream(id) {
            if !ctx.is_participating(parent) {
                continue;
            }
            let warehouse = ctx.warehouse(parent).ok_or(ExecutionError::Warehouse {
                block: parent,
                source: WarehouseError::NotCommitted,
            })?;
            let mut outputs = warehouse
                .get_inputs()
                .map_err(|source| ExecutionError::Warehouse {
                    block: parent,
                    source,
                })?;
            let routes: Vec<_> = topology
                .connections_into(id)
                .filter(|connection| connection.source == parent)
                .collect();
            for (idx, route) in routes.iter().enumerate() {
                let reused_later = routes[idx + 1..]
                    .iter()
                    .any(|later| later.source_socket == route.source_socket);
                let items = if reused_later {
                    outputs.get(&route.source_socket).cloned()
                } else {
                    outputs.swap_remove(&route.source_socket)
                };
                inputs
                    .entry(route.target_socket.clone())
                    .or_default()
                    .extend(items.unwrap_or_default());
            }
        }
        Ok(inputs)
    }
}
