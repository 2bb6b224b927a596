use crate::{
    config::Config,
    types::{BlockId, Inputs, Outputs, Socket},
};
use core::{fmt::Debug, num::NonZeroUsize};
use std::error::Error as StdError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Opaque unit of payload data flowing between blocks.
///
/// `Clone` must produce an independent deep copy: the warehouse hands clones
/// to every consumer but the last, and those consumers may mutate them
/// freely.
pub trait WorkItem: Clone + Send + Sync + 'static {
    /// Size metric used for memory-pressure accounting (megapixels for
    /// images).
    fn size_mp(&self) -> f32;
}

/// How the runtime drives a block.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum BlockRole {
    /// Runs once per shipment cycle in which one of its predecessors runs.
    #[default]
    Transform,
    /// Bounded-batch producer re-run every shipment cycle until it returns
    /// fewer items than its maximum shipment size.
    Source {
        /// Batch limit; `None` uses
        /// [`RunConfig::shipment_size`](crate::config::RunConfig::shipment_size).
        max_shipment_size: Option<NonZeroUsize>,
    },
    /// Terminal consumer. Carries no behavior in the runtime; graph
    /// validators use it to check the graph has somewhere to deliver data.
    Sink,
}

impl BlockRole {
    /// Whether the block is a shipment source.
    #[must_use]
    pub fn is_source(self) -> bool {
        matches!(self, Self::Source { .. })
    }

    /// Whether the block is a shipment sink.
    #[must_use]
    pub fn is_sink(self) -> bool {
        matches!(self, Self::Sink)
    }
}

/// A single unit of work in the graph.
///
/// Blocks are owned by the [`Topology`](crate::topology::Topology) and only
/// borrowed by the runtime, so `execute` takes `&self`; a block that keeps a
/// cursor across shipments (a file loader, say) uses interior mutability.
/// The runtime never invokes the same block concurrently with itself.
pub trait Block<C: Config>: Debug + Send + Sync {
    /// Human readable name used in logs and failure reports.
    fn name(&self) -> &str;

    /// Declared input ports.
    fn inputs(&self) -> &[Socket];

    /// Declared output ports.
    fn outputs(&self) -> &[Socket];

    /// Role of the block in shipment batching.
    fn role(&self) -> BlockRole {
        BlockRole::Transform
    }

    /// Process one shipment.
    ///
    /// Every declared input socket is present in `inputs` (possibly empty).
    /// Long-running bodies should poll [`BlockContext::check_cancelled`].
    ///
    /// # Errors
    /// Any [`BlockError`]; the block is then marked failed (or cancelled) and
    /// its descendants are poisoned.
    fn execute(
        &self,
        inputs: Inputs<C::Item>,
        ctx: &BlockContext<'_>,
    ) -> Result<Outputs<C::Item>, BlockError>;
}

/// Per-invocation view handed to [`Block::execute`].
#[derive(Debug, Clone, Copy)]
pub struct BlockContext<'a> {
    pub(crate) block: BlockId,
    pub(crate) cycle: usize,
    pub(crate) max_shipment_size: Option<NonZeroUsize>,
    pub(crate) cancellation: &'a CancellationToken,
}

impl BlockContext<'_> {
    /// Handle of the running block.
    #[must_use]
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Zero-based shipment cycle index.
    #[must_use]
    pub fn cycle(&self) -> usize {
        self.cycle
    }

    /// Item limit for this shipment; `Some` only for source blocks.
    #[must_use]
    pub fn max_shipment_size(&self) -> Option<NonZeroUsize> {
        self.max_shipment_size
    }

    /// Whether cancellation of the run has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Cancellation point for block bodies.
    ///
    /// # Errors
    /// [`BlockError::Cancelled`] once cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<(), BlockError> {
        if self.is_cancelled() {
            Err(BlockError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Failure of a single block invocation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BlockError {
    /// The block body reported an error.
    #[error("block failed: {0}")]
    Failed(#[source] Box<dyn StdError + Send + Sync>),
    /// The block body panicked.
    #[error("block panicked: {0}")]
    Panicked(String),
    /// The block observed cancellation and aborted.
    #[error("block cancelled")]
    Cancelled,
}

impl BlockError {
    /// Wrap any error (or message) as a block failure.
    pub fn failed(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Failed(err.into())
    }

    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        Self::Panicked(message)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn context(cancellation: &CancellationToken) -> BlockContext<'_> {
        BlockContext {
            block: BlockId::from_index(0),
            cycle: 0,
            max_shipment_size: None,
            cancellation,
        }
    }

    #[test]
    fn cancelling_the_caller_reaches_the_block() {
        let caller = CancellationToken::new();
        let run = caller.child_token();
        let ctx = context(&run);
        assert!(ctx.check_cancelled().is_ok());

        caller.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.check_cancelled(), Err(BlockError::Cancelled)));
    }

    #[test]
    fn cancelling_the_run_spares_the_caller() {
        let caller = CancellationToken::new();
        let run = caller.child_token();
        run.cancel();
        assert!(context(&run).is_cancelled());
        assert!(!caller.is_cancelled());
    }

    #[test]
    fn panic_payloads_become_messages() {
        let err = BlockError::from_panic(&"boom");
        assert!(matches!(err, BlockError::Panicked(ref message) if message == "boom"));
        let err = BlockError::from_panic(&String::from("bang"));
        assert_eq!(err.to_string(), "block panicked: bang");
        let err = BlockError::from_panic(&7_u32);
        assert_eq!(err.to_string(), "block panicked: non-string panic payload");
    }
}
