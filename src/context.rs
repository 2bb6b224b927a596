use crate::{
    barrier::DependencyBarrier,
    block::BlockRole,
    config::{Config, RunConfig},
    error::BlockFailure,
    state::{AtomicBlockState, BlockState},
    topology::Topology,
    types::{BlockId, IndexSet},
    warehouse::Warehouse,
};
use core::{
    num::NonZeroUsize,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};
use derive_more::Debug;
use parking_lot::{Mutex, RwLock};
use std::{sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;
use unzip3::Unzip3;

type Slot<T> = RwLock<Option<Arc<T>>>;

/// Shared, thread-safe runtime state of one execution run.
///
/// Holds topology-derived out-degrees, the per-block state cells, lazily created
/// warehouses and barriers, and run-wide counters. It contains no scheduling
/// logic; the [`Scheduler`](crate::scheduler::Scheduler) and the executor
/// drive it. A context is scoped to exactly one run.
#[must_use]
#[derive(Debug)]
pub struct ExecutionContext<C: Config> {
    #[debug(skip)]
    topology: Arc<Topology<C>>,
    config: RunConfig,
    cancellation: CancellationToken,
    out_degree: Vec<usize>,
    states: Vec<AtomicBlockState>,
    #[debug(skip)]
    warehouses: Vec<Slot<Warehouse<C::Item>>>,
    #[debug(skip)]
    barriers: Vec<Slot<DependencyBarrier>>,
    /// Blocks taking part in the current shipment cycle.
    #[debug(skip)]
    participating: Vec<AtomicBool>,
    /// Shipment sources that have not reported exhaustion.
    active_sources: Mutex<IndexSet<BlockId>>,
    active_workers: AtomicUsize,
    processed_shipments: AtomicUsize,
    cycle: AtomicUsize,
    cycle_shipments: AtomicUsize,
    cycle_size: AtomicUsize,
    started: Instant,
    /// Nanoseconds since `started`.
    last_progress: AtomicU64,
    #[debug(skip)]
    failures: Mutex<Vec<BlockFailure>>,
}

impl<C: Config> ExecutionContext<C> {
    /// Derive the run state from a topology snapshot in O(blocks +
    /// connections).
    ///
    /// Every block starts `Pending` except roots, which start `Ready`; every
    /// block takes part in the first shipment cycle.
    pub fn new(
        topology: Arc<Topology<C>>,
        config: RunConfig,
        cancellation: CancellationToken,
    ) -> Self {
        let len = topology.len();
        let (out_degree, states, participating): (Vec<_>, Vec<_>, Vec<_>) = topology
            .block_ids()
            .map(|id| {
                let state = if topology.upstream(id).is_empty() {
                    BlockState::Ready
                } else {
                    BlockState::Pending
                };
                (
                    topology.downstream(id).len(),
                    AtomicBlockState::new(state),
                    AtomicBool::new(true),
                )
            })
            .unzip3();
        // Only root sources are re-run across cycles; a source with
        // predecessors behaves like a transform triggered by its upstream.
        let active_sources = topology
            .sources()
            .filter(|&id| topology.upstream(id).is_empty())
            .collect();

        Self {
            config,
            cancellation,
            out_degree,
            states,
            warehouses: (0..len).map(|_| RwLock::new(None)).collect(),
            barriers: (0..len).map(|_| RwLock::new(None)).collect(),
            participating,
            active_sources: Mutex::new(active_sources),
            active_workers: AtomicUsize::new(0),
            processed_shipments: AtomicUsize::new(0),
            cycle: AtomicUsize::new(0),
            cycle_shipments: AtomicUsize::new(0),
            cycle_size: AtomicUsize::new(len),
            started: Instant::now(),
            last_progress: AtomicU64::new(0),
            failures: Mutex::new(Vec::new()),
            topology,
        }
    }

    /// The graph being executed.
    pub fn topology(&self) -> &Topology<C> {
        &self.topology
    }

    /// The run configuration.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Cancellation signal of this run.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Number of distinct successors; the consumer count of the block's
    /// warehouse.
    #[must_use]
    pub fn out_degree(&self, id: BlockId) -> usize {
        self.out_degree[id.index()]
    }

    /// Predecessors taking part in the current shipment cycle.
    #[must_use]
    pub fn active_in_degree(&self, id: BlockId) -> usize {
        self.topology
            .upstream(id)
            .iter()
            .filter(|&&parent| self.is_participating(parent))
            .count()
    }

    /// Whether the block runs (or is skipped) in the current shipment cycle.
    #[must_use]
    pub fn is_participating(&self, id: BlockId) -> bool {
        self.participating[id.index()].load(Ordering::Acquire)
    }

    /// Current state of a block.
    #[must_use]
    pub fn state(&self, id: BlockId) -> BlockState {
        self.states[id.index()].load()
    }

    /// Snapshot of every block's state, indexed by [`BlockId::index`].
    #[must_use]
    pub fn states(&self) -> Vec<BlockState> {
        self.states.iter().map(AtomicBlockState::load).collect()
    }

    pub(crate) fn set_state(&self, id: BlockId, state: BlockState) {
        trace!(block = %id, %state, "state change");
        self.states[id.index()].store(state);
    }

    /// Set `state` unless the block is already blocked.
    pub(crate) fn advance_state(&self, id: BlockId, state: BlockState) -> bool {
        self.states[id.index()].store_unless_blocked(state)
    }

    /// Mark a block as skipped because of an upstream failure.
    pub fn mark_poisoned(&self, id: BlockId) {
        self.set_state(id, BlockState::Poisoned);
    }

    /// Whether the block is poisoned.
    #[must_use]
    pub fn is_poisoned(&self, id: BlockId) -> bool {
        self.state(id) == BlockState::Poisoned
    }

    /// Whether the block is poisoned, cancelled or failed.
    #[must_use]
    pub fn is_blocked(&self, id: BlockId) -> bool {
        self.state(id).is_blocked()
    }

    /// Warehouse of `id` if it has been created in this shipment cycle.
    #[must_use]
    pub fn warehouse(&self, id: BlockId) -> Option<Arc<Warehouse<C::Item>>> {
        self.warehouses[id.index()].read().clone()
    }

    /// Warehouse of `id`, created with the block's out-degree as consumer
    /// count by whichever thread gets here first.
    pub fn warehouse_or_create(&self, id: BlockId) -> Arc<Warehouse<C::Item>> {
        get_or_create(&self.warehouses[id.index()], || {
            Warehouse::new(self.out_degree(id))
        })
    }

    /// Barrier of `id` if it has been created in this shipment cycle.
    #[must_use]
    pub fn barrier(&self, id: BlockId) -> Option<Arc<DependencyBarrier>> {
        self.barriers[id.index()].read().clone()
    }

    /// Barrier of `id`, seeded with its active in-degree by whichever thread
    /// gets here first.
    pub fn barrier_or_create(&self, id: BlockId) -> Arc<DependencyBarrier> {
        self.barrier_or_insert_with(id, || DependencyBarrier::new(self.active_in_degree(id)))
    }

    /// Barrier of `id`, built by `init` if it does not exist yet.
    pub fn barrier_or_insert_with(
        &self,
        id: BlockId,
        init: impl FnOnce() -> DependencyBarrier,
    ) -> Arc<DependencyBarrier> {
        get_or_create(&self.barriers[id.index()], init)
    }

    /// Number of workers currently holding a block.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    pub(crate) fn increment_active_workers(&self) {
        self.active_workers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement_active_workers(&self) {
        let prev = self.active_workers.fetch_sub(1, Ordering::AcqRel);
        assert_ne!(prev, 0, "ExecutionContext::decrement_active_workers");
    }

    /// Count one settled shipment (a block executed, failed, or was skipped)
    /// and stamp the watchdog's progress timestamp.
    pub fn record_shipment(&self) {
        self.processed_shipments.fetch_add(1, Ordering::AcqRel);
        self.cycle_shipments.fetch_add(1, Ordering::AcqRel);
        let nanos = u64::try_from(self.started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last_progress.fetch_max(nanos, Ordering::AcqRel);
    }

    /// Shipments settled so far in the run.
    #[must_use]
    pub fn processed_shipments(&self) -> usize {
        self.processed_shipments.load(Ordering::Acquire)
    }

    /// Time since run start at which the last shipment settled.
    #[must_use]
    pub fn last_progress(&self) -> Duration {
        Duration::from_nanos(self.last_progress.load(Ordering::Acquire))
    }

    /// Time elapsed since the last shipment settled.
    #[must_use]
    pub fn since_last_progress(&self) -> Duration {
        self.started.elapsed().saturating_sub(self.last_progress())
    }

    /// Time elapsed since the context was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn record_failure(&self, failure: BlockFailure) {
        self.failures.lock().push(failure);
    }

    pub(crate) fn take_failures(&self) -> Vec<BlockFailure> {
        core::mem::take(&mut *self.failures.lock())
    }

    /// Item limit of a shipment source, falling back to the run default;
    /// `None` for other blocks.
    #[must_use]
    pub fn max_shipment_size(&self, id: BlockId) -> Option<NonZeroUsize> {
        match self.topology.role(id) {
            BlockRole::Source { max_shipment_size } => {
                Some(max_shipment_size.unwrap_or(self.config.shipment_size))
            }
            _ => None,
        }
    }

    /// Shipment sources that have not reported exhaustion, in topology order.
    #[must_use]
    pub fn active_sources(&self) -> Vec<BlockId> {
        self.active_sources.lock().iter().copied().collect()
    }

    /// Whether any source still has data (and is not blocked).
    #[must_use]
    pub fn has_active_sources(&self) -> bool {
        self.active_sources
            .lock()
            .iter()
            .any(|&source| !self.is_blocked(source))
    }

    /// Stop re-running a source: it is exhausted, failed, or cancelled.
    pub(crate) fn retire_source(&self, id: BlockId) -> bool {
        self.active_sources.lock().shift_remove(&id)
    }

    /// Zero-based index of the current shipment cycle.
    #[must_use]
    pub fn cycle(&self) -> usize {
        self.cycle.load(Ordering::Acquire)
    }

    /// Whether every participating block has settled in this cycle.
    #[must_use]
    pub fn cycle_settled(&self) -> bool {
        self.cycle_shipments.load(Ordering::Acquire) >= self.cycle_size.load(Ordering::Acquire)
    }

    /// Start the next shipment cycle.
    ///
    /// Only blocks reachable from a still-active source take part. Completed
    /// participants return to `Pending` (sources to `Ready`), and warehouses
    /// and barriers from the previous cycle are discarded. Must only be
    /// called while no worker holds a block.
    pub(crate) fn advance_cycle(&self) -> usize {
        assert_eq!(self.active_workers(), 0, "ExecutionContext::advance_cycle");
        let cycle = self.cycle.fetch_add(1, Ordering::AcqRel) + 1;
        let sources: Vec<_> = self
            .active_sources()
            .into_iter()
            .filter(|&source| !self.is_blocked(source))
            .collect();

        for flag in &self.participating {
            flag.store(false, Ordering::Release);
        }
        let mut stack = sources.clone();
        let mut size = 0;
        while let Some(id) = stack.pop() {
            if self.participating[id.index()].swap(true, Ordering::AcqRel) {
                continue;
            }
            size += 1;
            if self.state(id) == BlockState::Completed {
                self.set_state(id, BlockState::Pending);
            }
            stack.extend_from_slice(self.topology.downstream(id));
        }
        for &source in &sources {
            self.advance_state(source, BlockState::Ready);
        }
        for slot in &self.warehouses {
            *slot.write() = None;
        }
        for slot in &self.barriers {
            *slot.write() = None;
        }
        self.cycle_shipments.store(0, Ordering::Release);
        self.cycle_size.store(size, Ordering::Release);
        cycle
    }
}

fn get_or_create<T>(slot: &Slot<T>, init: impl FnOnce() -> T) -> Arc<T> {
    if let Some(existing) = slot.read().as_ref() {
        return Arc::clone(existing);
    }
    // Re-check under the write lock: another thread may have won the race.
    Arc::clone(slot.write().get_or_insert_with(|| Arc::new(init())))
}
