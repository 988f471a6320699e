use tokio::sync::oneshot;

use super::pool::{Completion, PoolShared};
use crate::error::{RuntimeError, WorkerError};
use crate::skeleton::Context;

/// An ordered chain of jobs on a [`WorkerPool`](super::WorkerPool).
///
/// Each job's body starts only after the body submitted before it through
/// the same context has finished. Jobs in other contexts, or submitted to the
/// pool directly, are not ordered against this chain. Callbacks still run on
/// the module thread through the pool's completion queue.
pub struct LinearContext<S> {
    shared: PoolShared<S>,
    tail: Option<oneshot::Receiver<()>>,
}

impl<S: Send + 'static> LinearContext<S> {
    pub(crate) fn new(shared: PoolShared<S>) -> Self {
        Self { shared, tail: None }
    }

    /// Appends `work` to the chain; `cb` runs on the module thread afterwards.
    pub fn go<T, W, F>(&mut self, work: W, cb: F) -> Result<(), RuntimeError>
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        F: FnOnce(&mut S, &mut Context<S>, Result<T, WorkerError>) + Send + 'static,
    {
        self.shared.begin()?;
        let shared = self.shared.clone();
        let (done_tx, done_rx) = oneshot::channel();
        let previous = self.tail.replace(done_rx);

        tokio::spawn(async move {
            if let Some(previous) = previous {
                // An error only means the previous job is gone; order holds either way.
                let _ = previous.await;
            }
            let result = tokio::task::spawn_blocking(work)
                .await
                .map_err(WorkerError::from);
            let _ = done_tx.send(());
            shared.deliver(Completion::new(result, cb)).await;
        });
        Ok(())
    }
}
