use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use super::server::{Call, Reply, ServerHandle};
use super::CallId;
use crate::error::{RpcError, RuntimeError};
use crate::skeleton::Context;

/// A delivered async result waiting to run on the issuing module's thread.
///
/// The permit travels with the result, so a call keeps its token until its
/// callback has been dequeued.
pub(crate) struct AsyncReturn<S> {
    cb: Box<dyn FnOnce(&mut S, &mut Context<S>) + Send>,
    permit: OwnedSemaphorePermit,
}

impl<S> AsyncReturn<S> {
    /// Releases the token, then hands back the callback to run.
    pub(crate) fn into_callback(self) -> Box<dyn FnOnce(&mut S, &mut Context<S>) + Send> {
        drop(self.permit);
        self.cb
    }
}

type PendingAsync<S> =
    Box<dyn FnOnce(OwnedSemaphorePermit, mpsc::Sender<AsyncReturn<S>>) + Send>;

/// The calling side of the router, owned by one module.
///
/// Every asynchronous call holds one token from a pool of `asyn_call_len`
/// until its result has been taken off the return queue. Calls issued while
/// the pool is exhausted are staged in order and admitted by the module loop
/// as tokens come back. At most `asyn_call_len` calls are staged; further
/// calls are refused with `RpcError::QueueFull`.
pub struct Client<S> {
    tokens: Arc<Semaphore>,
    capacity: usize,
    ret_tx: mpsc::Sender<AsyncReturn<S>>,
    backlog: VecDeque<PendingAsync<S>>,
    closed: bool,
}

impl<S: 'static> Client<S> {
    /// Builds a client with `capacity` tokens and its return queue.
    ///
    /// The queue is as deep as the token pool, so a result can always be
    /// delivered without waiting.
    pub(crate) fn new(capacity: usize) -> (Self, mpsc::Receiver<AsyncReturn<S>>) {
        let (ret_tx, ret_rx) = mpsc::channel(capacity.max(1));
        let client = Self {
            tokens: Arc::new(Semaphore::new(capacity)),
            capacity,
            ret_tx,
            backlog: VecDeque::new(),
            closed: false,
        };
        (client, ret_rx)
    }

    /// Issues `id` against `target`; `cb` later runs on this module's thread
    /// with the result.
    pub fn asyn_call<M, R, F>(
        &mut self,
        target: &ServerHandle<M, R>,
        id: CallId,
        args: M,
        cb: F,
    ) -> Result<(), RuntimeError>
    where
        M: Send + 'static,
        R: Send + 'static,
        F: FnOnce(&mut S, &mut Context<S>, Result<R, RpcError>) + Send + 'static,
    {
        if self.capacity == 0 {
            return Err(RuntimeError::Disabled("async calls"));
        }
        if self.closed {
            return Err(RuntimeError::Closed);
        }
        self.admit();
        if self.backlog.len() >= self.capacity {
            trace!("chanrpc client: staging area full, refusing {}", id);
            return Err(RpcError::QueueFull.into());
        }

        let target = target.clone();
        self.backlog.push_back(Box::new(
            move |permit: OwnedSemaphorePermit, ret_tx: mpsc::Sender<AsyncReturn<S>>| {
                let forward = move |result: Result<R, RpcError>| {
                    let ret = AsyncReturn {
                        cb: Box::new(move |state: &mut S, ctx: &mut Context<S>| cb(state, ctx, result)),
                        permit,
                    };
                    // Capacity matches the token pool, so this only fails once
                    // the issuing module is gone.
                    let _ = ret_tx.try_send(ret);
                };
                target.dispatch(Call::new(id, args, Reply::Async(Box::new(forward))));
            },
        ));
        self.admit();
        Ok(())
    }

    /// Dispatches staged calls for as long as tokens are available.
    pub(crate) fn admit(&mut self) {
        while !self.backlog.is_empty() {
            let Ok(permit) = self.tokens.clone().try_acquire_owned() else {
                trace!("chanrpc client: {} calls waiting for a token", self.backlog.len());
                break;
            };
            if let Some(pending) = self.backlog.pop_front() {
                pending(permit, self.ret_tx.clone());
            }
        }
    }

    /// Calls in flight plus calls still waiting for a token.
    pub fn pending(&self) -> usize {
        self.capacity - self.tokens.available_permits() + self.backlog.len()
    }

    /// True when no call is in flight or staged.
    pub fn idle(&self) -> bool {
        self.pending() == 0
    }

    pub(crate) fn has_backlog(&self) -> bool {
        !self.backlog.is_empty()
    }

    /// Rejects new calls. Calls already issued still deliver their results.
    pub(crate) fn close(&mut self) {
        self.closed = true;
    }
}
