use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use super::LinearContext;
use crate::error::{RuntimeError, WorkerError};
use crate::skeleton::Context;

/// A finished job's callback, queued for the owning module.
pub(crate) struct Completion<S> {
    cb: Box<dyn FnOnce(&mut S, &mut Context<S>) + Send>,
}

impl<S: 'static> Completion<S> {
    pub(crate) fn new<T, F>(result: Result<T, WorkerError>, cb: F) -> Self
    where
        T: Send + 'static,
        F: FnOnce(&mut S, &mut Context<S>, Result<T, WorkerError>) + Send + 'static,
    {
        Self {
            cb: Box::new(move |state: &mut S, ctx: &mut Context<S>| cb(state, ctx, result)),
        }
    }

    pub(crate) fn into_callback(self) -> Box<dyn FnOnce(&mut S, &mut Context<S>) + Send> {
        self.cb
    }
}

/// Shared bookkeeping between a pool and the linear contexts it hands out.
pub(crate) struct PoolShared<S> {
    pub(crate) tx: mpsc::Sender<Completion<S>>,
    pub(crate) pending: Arc<AtomicUsize>,
    pub(crate) closed: Arc<AtomicBool>,
}

impl<S> Clone for PoolShared<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            pending: Arc::clone(&self.pending),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<S: 'static> PoolShared<S> {
    /// Reserves a slot for one job. Fails once the pool is closed.
    pub(crate) fn begin(&self) -> Result<(), RuntimeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RuntimeError::Closed);
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Delivers a completion, giving the slot back if the module is gone.
    pub(crate) async fn deliver(&self, completion: Completion<S>) {
        if self.tx.send(completion).await.is_err() {
            warn!("worker: completion dropped, owning module has stopped");
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Runs jobs concurrently and routes their callbacks back to one module.
///
/// `pending` counts jobs from submission until their callback has run on the
/// module thread, which is what [`idle`](Self::idle) reports on.
pub struct WorkerPool<S> {
    shared: Option<PoolShared<S>>,
}

impl<S: Send + 'static> WorkerPool<S> {
    /// Creates a pool whose completion queue holds `len` entries. A zero
    /// length disables the pool.
    pub(crate) fn new(len: usize) -> (Self, mpsc::Receiver<Completion<S>>) {
        let (tx, rx) = mpsc::channel(len.max(1));
        let shared = (len > 0).then(|| PoolShared {
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        });
        (Self { shared }, rx)
    }

    fn shared(&self) -> Result<&PoolShared<S>, RuntimeError> {
        self.shared.as_ref().ok_or(RuntimeError::Disabled("worker pool"))
    }

    /// Runs `work` off the module thread, then `cb` on it with the result.
    ///
    /// A panicking job is reported to `cb` as [`WorkerError::Panicked`].
    pub fn go<T, W, F>(&self, work: W, cb: F) -> Result<(), RuntimeError>
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        F: FnOnce(&mut S, &mut Context<S>, Result<T, WorkerError>) + Send + 'static,
    {
        let shared = self.shared()?.clone();
        shared.begin()?;
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(work)
                .await
                .map_err(WorkerError::from);
            shared.deliver(Completion::new(result, cb)).await;
        });
        Ok(())
    }

    /// Opens an ordered chain of jobs bound to this pool.
    pub fn new_linear_context(&self) -> Result<LinearContext<S>, RuntimeError> {
        Ok(LinearContext::new(self.shared()?.clone()))
    }

    /// Marks one completion as consumed.
    pub(crate) fn finish(&self) {
        if let Some(shared) = &self.shared {
            shared.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Jobs submitted whose callbacks have not run yet.
    pub fn pending(&self) -> usize {
        self.shared
            .as_ref()
            .map_or(0, |shared| shared.pending.load(Ordering::Acquire))
    }

    pub fn idle(&self) -> bool {
        self.pending() == 0
    }

    /// Rejects new jobs. Jobs already running still deliver completions.
    pub(crate) fn close(&self) {
        if let Some(shared) = &self.shared {
            shared.closed.store(true, Ordering::Release);
        }
    }
}
