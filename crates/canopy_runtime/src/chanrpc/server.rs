use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use super::CallId;
use crate::error::RpcError;
use crate::panic::panic_message;
use crate::skeleton::Context;

type Handler<S, M, R> =
    Box<dyn FnMut(&mut S, &mut Context<S>, M) -> Result<R, RpcError> + Send>;

/// Where the result of a call goes once it has been executed.
pub(crate) enum Reply<R> {
    /// Fire-and-forget, the result is discarded.
    None,
    /// A caller is waiting on the other end.
    Sync(oneshot::Sender<Result<R, RpcError>>),
    /// Result is forwarded to the issuing module's return queue.
    Async(Box<dyn FnOnce(Result<R, RpcError>) + Send>),
}

impl<R> Reply<R> {
    fn send(self, result: Result<R, RpcError>) {
        match self {
            Reply::None => {}
            Reply::Sync(tx) => {
                let _ = tx.send(result);
            }
            Reply::Async(forward) => forward(result),
        }
    }
}

/// One pending invocation.
///
/// A call is answered exactly once: either by the handler, or with
/// [`RpcError::Closed`] when it is dropped unexecuted (router closed, queue
/// torn down).
pub struct Call<M, R> {
    id: CallId,
    args: Option<M>,
    reply: Reply<R>,
}

impl<M, R> Call<M, R> {
    pub(crate) fn new(id: CallId, args: M, reply: Reply<R>) -> Self {
        Self { id, args: Some(args), reply }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    fn respond(&mut self, result: Result<R, RpcError>) {
        std::mem::replace(&mut self.reply, Reply::None).send(result);
    }
}

impl<M, R> Drop for Call<M, R> {
    fn drop(&mut self) {
        self.respond(Err(RpcError::Closed));
    }
}

impl<M, R> fmt::Debug for Call<M, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Handler table plus the bounded queue of calls waiting to be executed.
pub struct Server<S, M, R> {
    functions: HashMap<CallId, Handler<S, M, R>>,
    tx: mpsc::Sender<Call<M, R>>,
    rx: mpsc::Receiver<Call<M, R>>,
}

impl<S, M, R> Server<S, M, R>
where
    S: 'static,
    M: Send + 'static,
    R: Send + 'static,
{
    /// Creates a router whose pending-call queue holds `len` calls.
    ///
    /// A zero length still gets a single slot, the closest a bounded tokio
    /// channel comes to a rendezvous.
    pub fn new(len: usize) -> Self {
        let (tx, rx) = mpsc::channel(len.max(1));
        Self { functions: HashMap::new(), tx, rx }
    }

    /// Binds `f` to `id`. Registering the same id twice is a setup error.
    pub fn register<F>(&mut self, id: CallId, f: F) -> Result<(), RpcError>
    where
        F: FnMut(&mut S, &mut Context<S>, M) -> Result<R, RpcError> + Send + 'static,
    {
        if self.functions.contains_key(id) {
            return Err(RpcError::AlreadyRegistered(id.to_string()));
        }
        self.functions.insert(id, Box::new(f));
        Ok(())
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.functions.contains_key(id)
    }

    /// Registered ids, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = CallId> + '_ {
        self.functions.keys().copied()
    }

    /// Calls waiting to be executed.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    /// Returns a cloneable handle other tasks use to enqueue calls.
    pub fn handle(&self) -> ServerHandle<M, R> {
        ServerHandle { tx: self.tx.clone() }
    }

    pub(crate) async fn recv(&mut self) -> Option<Call<M, R>> {
        self.rx.recv().await
    }

    /// Executes one call on the owning module's thread.
    ///
    /// Unknown ids and handler panics are answered with an error and logged;
    /// they never unwind into the module loop.
    pub(crate) fn exec(&mut self, state: &mut S, ctx: &mut Context<S>, mut call: Call<M, R>) {
        let Some(handler) = self.functions.get_mut(call.id) else {
            error!("chanrpc: no handler registered for {:?}", call.id);
            call.respond(Err(RpcError::NotRegistered(call.id.to_string())));
            return;
        };
        let Some(args) = call.args.take() else {
            return;
        };

        let result = match catch_unwind(AssertUnwindSafe(|| handler(state, ctx, args))) {
            Ok(result) => result,
            Err(payload) => {
                let msg = panic_message(&*payload);
                error!("💥 chanrpc handler {:?} panicked: {}", call.id, msg);
                Err(RpcError::HandlerPanicked(msg))
            }
        };
        call.respond(result);
    }

    /// Stops accepting calls and answers everything still queued with
    /// [`RpcError::Closed`].
    pub(crate) fn close(&mut self) {
        self.rx.close();
        let mut dropped = 0usize;
        while let Ok(call) = self.rx.try_recv() {
            drop(call);
            dropped += 1;
        }
        if dropped > 0 {
            debug!("chanrpc: rejected {} queued calls on close", dropped);
        }
    }
}

/// Cloneable sending side of a [`Server`].
pub struct ServerHandle<M, R> {
    tx: mpsc::Sender<Call<M, R>>,
}

impl<M, R> Clone for ServerHandle<M, R> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<M, R> fmt::Debug for ServerHandle<M, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<M, R> ServerHandle<M, R>
where
    M: Send + 'static,
    R: Send + 'static,
{
    /// Enqueues a call without waiting for its result. Waits for queue space.
    pub async fn go(&self, id: CallId, args: M) -> Result<(), RpcError> {
        self.send(Call::new(id, args, Reply::None)).await
    }

    /// Like [`go`](Self::go) but fails with `QueueFull` instead of waiting.
    pub fn try_go(&self, id: CallId, args: M) -> Result<(), RpcError> {
        match self.tx.try_send(Call::new(id, args, Reply::None)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(RpcError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RpcError::Closed),
        }
    }

    /// Enqueues a call and waits until the owning module has executed it.
    ///
    /// Calling a module's own router from inside that module's loop never
    /// completes; use the async client there instead.
    pub async fn call(&self, id: CallId, args: M) -> Result<R, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.send(Call::new(id, args, Reply::Sync(tx))).await?;
        rx.await.unwrap_or(Err(RpcError::Closed))
    }

    /// Blocking variant of [`call`](Self::call) for code outside the async runtime.
    pub fn blocking_call(&self, id: CallId, args: M) -> Result<R, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .blocking_send(Call::new(id, args, Reply::Sync(tx)))
            .map_err(|_| RpcError::Closed)?;
        rx.blocking_recv().unwrap_or(Err(RpcError::Closed))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) async fn send(&self, call: Call<M, R>) -> Result<(), RpcError> {
        self.tx.send(call).await.map_err(|_| RpcError::Closed)
    }

    /// Hands `call` over without blocking, finishing the send on a task when
    /// the queue is momentarily full.
    pub(crate) fn dispatch(&self, call: Call<M, R>) {
        match self.tx.try_send(call) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(call)) => {
                let handle = self.clone();
                tokio::spawn(async move {
                    let _ = handle.send(call).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(call)) => drop(call),
        }
    }
}
