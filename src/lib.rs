//! Shipment-batched block graph runtime.
//!
//! A graph of [`Block`](block::Block)s connected socket to socket is executed
//! on a bounded pool of worker threads. Data moves along connections in
//! bounded batches ("shipments"): shipment sources are re-run cycle after
//! cycle until they run dry, and every block reachable from a still-active
//! source runs once per cycle.
//!
//! The runtime:
//! - Validates the graph (sockets, type tags, acyclicity) before any run.
//! - Keeps each block's outputs in a [`Warehouse`](warehouse::Warehouse)
//!   that hands deep clones to all consumers but the last, which receives
//!   the originals. The buffer is freed as soon as the last consumer reads.
//! - Gates each block behind a [`DependencyBarrier`](barrier::DependencyBarrier)
//!   that opens once every active predecessor has completed or was skipped.
//! - Orders ready blocks by completion pressure: the memory parked in their
//!   upstream warehouses divided by the consumers still to be served.
//! - Contains failures: a failed block's descendants are poisoned and
//!   skipped, unaffected branches drain, and all failures are reported
//!   together.
//! - Aborts with a deadlock error when nothing settles within the watchdog
//!   timeout.
//!
//! Quick start:
//! 1. Implement [`WorkItem`](block::WorkItem) for the payload and
//!    [`Block`](block::Block) for the block type, and bind both with a
//!    [`Config`](config::Config).
//! 2. Describe the graph with [`TopologyBuilder`](topology::TopologyBuilder).
//! 3. Create an [`Executor`](executor::Executor) with a
//!    [`RunConfig`](config::RunConfig) and call `execute`, or `spawn` to run
//!    in the background.

/// Countdown gate releasing a block once its predecessors have settled.
pub mod barrier;
/// The block interface, its role in shipment batching and its invocation
/// context.
pub mod block;
/// Binding of payload and block types, and per-run configuration.
pub mod config;
/// Shared per-run state: block states, warehouses, barriers and counters.
pub mod context;
/// Run-level errors.
pub mod error;
/// The multi-threaded driver.
///
/// Seeds the scheduler with root blocks, runs worker loops on a rayon pool,
/// advances shipment cycles and watches for stalls.
pub mod executor;
/// Ready-queue strategies.
pub mod scheduler;
/// Block lifecycle states.
pub mod state;
mod sync;
/// Validated graph snapshot and its builder.
pub mod topology;
/// Handles, sockets and container aliases.
pub mod types;
/// Per-block output buffers.
pub mod warehouse;

pub use crate::{
    block::{Block, BlockContext, BlockError, BlockRole, WorkItem},
    config::{Config, FailurePolicy, RunConfig, SchedulerMode},
    error::{BlockFailure, ExecutionError},
    executor::{Executor, RunHandle, RunReport},
    state::BlockState,
    topology::{Topology, TopologyBuilder, TopologyError},
    types::{BlockId, Inputs, Outputs, Socket, SocketId, TypeTag},
};
/// Cooperative cancellation token observed by runs and blocks.
///
/// Cancelling a token cancels every child token derived from it; cancelling
/// a child leaves the parent alone.
pub use tokio_util::sync::CancellationToken;
