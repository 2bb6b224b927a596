use crate::block::{Block, WorkItem};
use core::{num::NonZeroUsize, time::Duration};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration entry-point for instantiating the executor.
///
/// A concrete `Config` binds the payload type flowing along connections and
/// the block type stored in the topology. Heterogeneous graphs use an enum
/// (or a boxed trait object wrapper) as `Block`.
pub trait Config: Sized + 'static {
    /// Payload flowing between blocks.
    type Item: WorkItem;
    /// The user-defined block type that the executor will run.
    type Block: Block<Self>;
}

/// Scheduling strategy used by a run.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum SchedulerMode {
    /// Greedy completion-pressure ordering.
    #[default]
    SimpleDfs,
    /// Live cost profiling with critical-path analysis. Reserved.
    Adaptive,
    /// `Adaptive` with batch-based critical-path recomputation. Reserved.
    AdaptiveBatched,
}

/// What a run does after a block fails.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum FailurePolicy {
    /// Poison the failed block's descendants and let every unaffected branch
    /// drain; failures are aggregated at the end of the run.
    #[default]
    Contain,
    /// Cancel the rest of the run on the first failure.
    FailFast,
}

/// Immutable per-run configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Number of worker threads.
    pub max_parallelism: NonZeroUsize,
    /// A run with no completed or skipped block for this long is deadlocked.
    pub watchdog_timeout: Duration,
    /// Default batch limit of shipment sources.
    pub shipment_size: NonZeroUsize,
    /// Scheduling strategy.
    pub scheduler: SchedulerMode,
    /// Reaction to block failures.
    pub failure_policy: FailurePolicy,
}

/// Shipment size used when neither the block nor the run sets one.
pub const DEFAULT_SHIPMENT_SIZE: NonZeroUsize = match NonZeroUsize::new(64) {
    Some(size) => size,
    None => unreachable!(),
};

/// Watchdog timeout used by [`RunConfig::default`].
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parallelism: std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            shipment_size: DEFAULT_SHIPMENT_SIZE,
            scheduler: SchedulerMode::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl RunConfig {
    /// Set the number of worker threads.
    #[must_use]
    pub fn with_max_parallelism(mut self, max_parallelism: NonZeroUsize) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    /// Set the deadlock watchdog timeout.
    #[must_use]
    pub fn with_watchdog_timeout(mut self, watchdog_timeout: Duration) -> Self {
        self.watchdog_timeout = watchdog_timeout;
        self
    }

    /// Set the default shipment size.
    #[must_use]
    pub fn with_shipment_size(mut self, shipment_size: NonZeroUsize) -> Self {
        self.shipment_size = shipment_size;
        self
    }

    /// Select the scheduling strategy.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerMode) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Select the failure policy.
    #[must_use]
    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    /// Check values the type system cannot rule out.
    ///
    /// # Errors
    /// [`ConfigError::ZeroWatchdogTimeout`] for a zero timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watchdog_timeout.is_zero() {
            return Err(ConfigError::ZeroWatchdogTimeout);
        }
        Ok(())
    }
}

/// Invalid [`RunConfig`] values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The watchdog would fire immediately.
    #[error("watchdog timeout must be non-zero")]
    ZeroWatchdogTimeout,
}
