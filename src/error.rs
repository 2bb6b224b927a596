use crate::{
    block::BlockError,
    config::{ConfigError, SchedulerMode},
    executor::RunReport,
    types::BlockId,
    warehouse::WarehouseError,
};
use core::time::Duration;
use thiserror::Error;

/// A block that failed during a run.
#[derive(Debug, Error)]
#[error("block {block} (`{name}`) failed in shipment cycle {cycle}")]
pub struct BlockFailure {
    /// Handle of the failed block.
    pub block: BlockId,
    /// Its name at the time of failure.
    pub name: String,
    /// Shipment cycle the failure happened in.
    pub cycle: usize,
    /// What went wrong.
    #[source]
    pub error: BlockError,
}

/// Why a run did not succeed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutionError {
    /// The run configuration was rejected before any block ran.
    #[error("invalid run configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    /// The configured scheduler mode is reserved but not built yet.
    #[error("scheduler mode {0:?} is not implemented; use SchedulerMode::SimpleDfs")]
    SchedulerNotImplemented(SchedulerMode),
    /// The worker pool could not be started.
    #[error("failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    /// The background run thread could not be started.
    #[error("failed to spawn run thread: {0}")]
    Spawn(#[from] std::io::Error),
    /// A warehouse contract was violated. This is a runtime bug and aborts
    /// the run.
    #[error("warehouse of block {block} misused: {source}")]
    Warehouse {
        /// Producer owning the warehouse.
        block: BlockId,
        /// The violation.
        source: WarehouseError,
    },
    /// No block completed or was skipped within the watchdog timeout.
    #[error(
        "no progress within {timeout:?} (last progress at {last_progress:?} after \
         {processed_shipments} shipments); the graph is deadlocked"
    )]
    Deadlock {
        /// Configured watchdog timeout.
        timeout: Duration,
        /// Time since run start of the last completed or skipped block.
        last_progress: Duration,
        /// Shipments processed before the run stalled.
        processed_shipments: usize,
    },
    /// One or more blocks failed; every other branch was drained.
    #[error("{} block(s) failed", .failures.len())]
    BlockFailures {
        /// Every failure collected during the run.
        failures: Vec<BlockFailure>,
        /// Final state of the run.
        report: RunReport,
    },
}
