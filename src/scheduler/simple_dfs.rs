use crate::{
    config::Config,
    context::ExecutionContext,
    scheduler::Scheduler,
    state::BlockState,
    types::{BlockId, HashSet},
};
use core::cmp::Ordering;
use parking_lot::Mutex;
use std::collections::BinaryHeap;
use tracing::{debug, error, trace};

/// Greedy completion-pressure scheduler: runs the "hungriest" block first.
///
/// ```text
/// priority = CompletionPressure(block)
///          = sum over predecessors p with a live warehouse of
///            p.total_size_mp / p.remaining_consumers
/// ```
///
/// The block that frees the most pending memory soonest is dequeued first.
/// Pressure accumulates along a chain, so deep paths drain before wide ones
/// without any explicit depth bookkeeping. Priority is computed once, at
/// enqueue time; equal priorities are served FIFO.
#[derive(Debug, Default)]
pub struct SimpleDfsScheduler {
    queue: Mutex<ReadyQueue>,
}

#[derive(Debug, Default)]
struct ReadyQueue {
    heap: BinaryHeap<Entry>,
    queued: HashSet<BlockId>,
    seq: u64,
}

#[derive(Debug)]
struct Entry {
    pressure: f32,
    seq: u64,
    block: BlockId,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: higher pressure first, then lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.pressure
            .total_cmp(&other.pressure)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl SimpleDfsScheduler {
    /// Empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().heap.len()
    }

    /// Whether no block is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().heap.is_empty()
    }

    /// Memory that running `block` would help release.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn completion_pressure<C: Config>(block: BlockId, ctx: &ExecutionContext<C>) -> f32 {
        ctx.topology()
            .upstream(block)
            .iter()
            .filter_map(|&parent| ctx.warehouse(parent))
            .filter_map(|warehouse| {
                let consumers = warehouse.remaining_consumers();
                (consumers > 0).then(|| warehouse.total_size_mp() / consumers as f32)
            })
            .sum()
    }
}

impl<C: Config> Scheduler<C> for SimpleDfsScheduler {
    fn is_empty(&self) -> bool {
        SimpleDfsScheduler::is_empty(self)
    }

    fn try_enqueue(&self, block: BlockId, ctx: &ExecutionContext<C>) -> bool {
        if ctx.is_blocked(block) {
            return false;
        }
        let mut queue = self.queue.lock();
        if !queue.queued.insert(block) {
            return false;
        }
        let pressure = Self::completion_pressure(block, ctx);
        let seq = queue.seq;
        queue.seq += 1;
        trace!(block = %block, pressure, "enqueue");
        queue.heap.push(Entry {
            pressure,
            seq,
            block,
        });
        true
    }

    fn try_dequeue(&self, ctx: &ExecutionContext<C>) -> Option<BlockId> {
        let mut discarded = Vec::new();
        let next = {
            let mut queue = self.queue.lock();
            loop {
                let Some(Entry { block, .. }) = queue.heap.pop() else {
                    break None;
                };
                queue.queued.remove(&block);
                // Blocked after it was queued: it will never run, but it must
                // still settle for this cycle.
                if ctx.is_blocked(block) {
                    discarded.push(block);
                    continue;
                }
                break Some(block);
            }
        };
        for block in discarded {
            self.handle_blocked_block(block, ctx);
        }
        next
    }

    fn signal_completion(&self, block: BlockId, ctx: &ExecutionContext<C>) {
        for &child in ctx.topology().downstream(block) {
            if !ctx.is_participating(child) {
                continue;
            }
            if !ctx.barrier_or_create(child).signal() {
                continue;
            }
            let upstream_blocked = ctx
                .topology()
                .upstream(child)
                .iter()
                .any(|&parent| ctx.is_participating(parent) && ctx.is_blocked(parent));
            if ctx.is_blocked(child) || upstream_blocked {
                if !ctx.is_blocked(child) {
                    debug!(block = %child, name = ctx.topology().name(child), "poisoned");
                    ctx.mark_poisoned(child);
                }
                self.handle_blocked_block(child, ctx);
            } else if ctx.advance_state(child, BlockState::Ready) {
                self.try_enqueue(child, ctx);
            }
        }
    }

    fn handle_blocked_block(&self, block: BlockId, ctx: &ExecutionContext<C>) {
        for &parent in ctx.topology().upstream(block) {
            if !ctx.is_participating(parent) {
                continue;
            }
            if let Some(warehouse) = ctx.warehouse(parent) {
                if let Err(err) = warehouse.release_consumer() {
                    error!(block = %block, upstream = %parent, %err, "warehouse cleanup failed");
                }
            }
        }
        self.signal_completion(block, ctx);
        ctx.record_shipment();
    }

    fn prepare_next_shipment_cycle(&self, ctx: &ExecutionContext<C>) {
        for source in ctx.active_sources() {
            if !ctx.is_blocked(source) {
                self.try_enqueue(source, ctx);
            }
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::Entry;
    use crate::types::BlockId;
    use std::collections::BinaryHeap;

    #[test]
    fn heap_prefers_pressure_then_fifo() {
        let mut heap = BinaryHeap::new();
        for (seq, pressure) in [(0, 1.0), (1, 4.0), (2, 1.0), (3, 0.0)] {
            heap.push(Entry {
                pressure,
                seq,
                block: BlockId(u32::try_from(seq).unwrap()),
            });
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop().map(|entry| entry.block.0)).collect();
        assert_eq!(order, vec![1, 0, 2, 3]);
    }
}
