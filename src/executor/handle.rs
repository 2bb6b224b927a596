use crate::{
    config::Config,
    error::ExecutionError,
    executor::{Executor, RunReport},
};
use std::{
    panic,
    thread::{self, JoinHandle},
};
use tokio_util::sync::CancellationToken;

/// A run executing on a background thread.
///
/// Dropping the handle detaches the run; it keeps going until it finishes
/// or its token is cancelled.
#[must_use]
#[derive(Debug)]
pub struct RunHandle {
    cancellation: CancellationToken,
    thread: JoinHandle<Result<RunReport, ExecutionError>>,
}

impl RunHandle {
    pub(crate) fn spawn<C: Config>(
        executor: Executor<C>,
        cancellation: CancellationToken,
    ) -> Result<Self, ExecutionError> {
        let token = cancellation.clone();
        let thread = thread::Builder::new()
            .name("blockflow-run".to_owned())
            .spawn(move || executor.execute_with(&token))?;
        Ok(Self {
            cancellation,
            thread,
        })
    }

    /// Request cancellation of the run.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// The token the run observes.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the run has returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the run returns.
    ///
    /// # Errors
    /// Whatever the run returned.
    pub fn join(self) -> Result<RunReport, ExecutionError> {
        self.thread
            .join()
            .unwrap_or_else(|payload| panic::resume_unwind(payload))
    }
}
