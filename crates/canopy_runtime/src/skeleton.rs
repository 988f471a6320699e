//! The per-module event loop.
//!
//! A [`Skeleton`] owns a module's state together with its call router,
//! command router, async client, worker pool and timer dispatcher, and runs
//! everything that touches the state from a single task. Sources are
//! serviced in whatever order they become ready; no two callbacks ever
//! overlap.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::chanrpc::{AsyncReturn, CallId, Client, Server, ServerHandle};
use crate::error::{RpcError, RuntimeError, WorkerError};
use crate::module::{ModuleSignal, SignalEvent};
use crate::panic::guard;
use crate::timer::{self, CronExpr, TimerDispatcher, TimerHandle, TimerId};
use crate::worker::{Completion, LinearContext, WorkerPool};

fn default_queue_len() -> usize {
    10000
}

fn default_command_len() -> usize {
    32
}

fn default_loop_interval_ms() -> u64 {
    100
}

/// Queue sizes and tick period for one module.
///
/// A zero `go_len`, `timer_dispatcher_len` or `asyn_call_len` disables the
/// worker pool, timers or async calls respectively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkeletonConfig {
    /// Capacity of the worker completion queue
    #[serde(default = "default_queue_len")]
    pub go_len: usize,
    /// Capacity of the timer firing queue
    #[serde(default = "default_queue_len")]
    pub timer_dispatcher_len: usize,
    /// Maximum async calls in flight
    #[serde(default = "default_queue_len")]
    pub asyn_call_len: usize,
    /// Capacity of the module's pending-call queue
    #[serde(default = "default_queue_len")]
    pub chan_rpc_len: usize,
    /// Capacity of the administrative command queue
    #[serde(default = "default_command_len")]
    pub command_len: usize,
    /// Update tick period in milliseconds (0 to disable)
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,
}

impl Default for SkeletonConfig {
    fn default() -> Self {
        Self {
            go_len: default_queue_len(),
            timer_dispatcher_len: default_queue_len(),
            asyn_call_len: default_queue_len(),
            chan_rpc_len: default_queue_len(),
            command_len: default_command_len(),
            loop_interval_ms: default_loop_interval_ms(),
        }
    }
}

impl SkeletonConfig {
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.asyn_call_len > Semaphore::MAX_PERMITS {
            return Err(RuntimeError::Config(format!(
                "asyn_call_len {} exceeds {}",
                self.asyn_call_len,
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }
}

/// Everything a callback may do besides touching state: dispatch jobs, arm
/// timers and issue async calls.
pub struct Context<S> {
    pub(crate) pool: WorkerPool<S>,
    pub(crate) timers: TimerDispatcher<S>,
    pub(crate) client: Client<S>,
}

impl<S: Send + 'static> Context<S> {
    /// Runs `work` on the blocking pool and `cb` back on the module thread.
    pub fn go<T, W, F>(&self, work: W, cb: F) -> Result<(), RuntimeError>
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        F: FnOnce(&mut S, &mut Context<S>, Result<T, WorkerError>) + Send + 'static,
    {
        self.pool.go(work, cb)
    }

    pub fn new_linear_context(&self) -> Result<LinearContext<S>, RuntimeError> {
        self.pool.new_linear_context()
    }

    pub fn after_func<F>(&mut self, after: Duration, cb: F) -> Result<TimerHandle, RuntimeError>
    where
        F: FnOnce(&mut S, &mut Context<S>) + Send + 'static,
    {
        self.timers.after_func(after, cb)
    }

    pub fn cron_func<F>(&mut self, expr: CronExpr, cb: F) -> Result<TimerHandle, RuntimeError>
    where
        F: FnMut(&mut S, &mut Context<S>) + Send + 'static,
    {
        self.timers.cron_func(expr, cb)
    }

    /// Calls `id` on `target` without waiting; `cb` receives the result on
    /// this module's thread.
    ///
    /// When the in-flight limit is reached the call is staged and issued by
    /// the loop as soon as an earlier result has been consumed. Once as many
    /// calls are staged as are in flight, further calls fail with
    /// `RpcError::QueueFull` and `cb` is dropped.
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
        self.client.asyn_call(target, id, args, cb)
    }

    /// Jobs whose callbacks have not run yet.
    pub fn pending_jobs(&self) -> usize {
        self.pool.pending()
    }

    /// Async calls in flight or staged.
    pub fn pending_calls(&self) -> usize {
        self.client.pending()
    }

    pub fn active_timers(&self) -> usize {
        self.timers.active()
    }
}

/// Name and help text of a registered administrative command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInfo {
    pub name: CallId,
    pub help: String,
}

type Hook<S> = Box<dyn FnMut(&mut S, &mut Context<S>) + Send>;
type StartHook<S> = Box<dyn FnOnce(&mut S, &mut Context<S>) + Send>;

/// A module's state plus the machinery that feeds it.
///
/// `M` and `R` are the argument and result types of the module's call
/// router; a module typically uses an enum of its messages for `M`.
pub struct Skeleton<S, M, R> {
    name: String,
    config: SkeletonConfig,
    state: S,
    ctx: Context<S>,
    server: Server<S, M, R>,
    commands: Server<S, Vec<String>, String>,
    command_info: Vec<CommandInfo>,
    completions: mpsc::Receiver<Completion<S>>,
    returns: mpsc::Receiver<AsyncReturn<S>>,
    firings: mpsc::Receiver<TimerId>,
    on_start: Option<StartHook<S>>,
    on_update: Option<Hook<S>>,
    on_reload: Option<Hook<S>>,
}

impl<S, M, R> Skeleton<S, M, R>
where
    S: Send + 'static,
    M: Send + 'static,
    R: Send + 'static,
{
    pub fn new(name: impl Into<String>, config: SkeletonConfig, state: S) -> Result<Self, RuntimeError> {
        config.validate()?;

        let (pool, completions) = WorkerPool::new(config.go_len);
        let (timers, firings) = TimerDispatcher::new(config.timer_dispatcher_len);
        let (client, returns) = Client::new(config.asyn_call_len);

        Ok(Self {
            name: name.into(),
            server: Server::new(config.chan_rpc_len),
            commands: Server::new(config.command_len),
            config,
            state,
            ctx: Context { pool, timers, client },
            command_info: Vec::new(),
            completions,
            returns,
            firings,
            on_start: None,
            on_update: None,
            on_reload: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Handle other modules use to call this one.
    pub fn chan_rpc(&self) -> ServerHandle<M, R> {
        self.server.handle()
    }

    pub fn register_chan_rpc<F>(&mut self, id: CallId, f: F) -> Result<(), RuntimeError>
    where
        F: FnMut(&mut S, &mut Context<S>, M) -> Result<R, RpcError> + Send + 'static,
    {
        self.server.register(id, f)?;
        Ok(())
    }

    /// Registers an administrative command. Its handler receives the
    /// command's arguments and returns the text to show the operator.
    pub fn register_command<F>(&mut self, name: CallId, help: impl Into<String>, f: F) -> Result<(), RuntimeError>
    where
        F: FnMut(&mut S, &mut Context<S>, Vec<String>) -> Result<String, RpcError> + Send + 'static,
    {
        self.commands.register(name, f)?;
        self.command_info.push(CommandInfo { name, help: help.into() });
        Ok(())
    }

    pub fn commands(&self) -> &[CommandInfo] {
        &self.command_info
    }

    pub fn command_handle(&self) -> ServerHandle<Vec<String>, String> {
        self.commands.handle()
    }

    /// Runs once on the module thread before the loop starts.
    pub fn set_start<F>(&mut self, f: F)
    where
        F: FnOnce(&mut S, &mut Context<S>) + Send + 'static,
    {
        self.on_start = Some(Box::new(f));
    }

    /// Runs on every update tick.
    pub fn set_update<F>(&mut self, f: F)
    where
        F: FnMut(&mut S, &mut Context<S>) + Send + 'static,
    {
        self.on_update = Some(Box::new(f));
    }

    /// Runs whenever the module is asked to reload.
    pub fn set_reload<F>(&mut self, f: F)
    where
        F: FnMut(&mut S, &mut Context<S>) + Send + 'static,
    {
        self.on_reload = Some(Box::new(f));
    }

    /// Drives the module until `signal` asks it to close, drains outstanding
    /// work and hands the state back.
    pub async fn run(mut self, mut signal: ModuleSignal) -> S {
        info!("▶️ module {} running", self.name);

        if let Some(start) = self.on_start.take() {
            let (state, ctx) = (&mut self.state, &mut self.ctx);
            guard(&self.name, "start hook", || start(state, ctx));
            self.ctx.client.admit();
        }

        let ticking = self.on_update.is_some() && self.config.loop_interval_ms > 0;
        let period = Duration::from_millis(self.config.loop_interval_ms.max(1));
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = signal.recv() => match event {
                    SignalEvent::Close => break,
                    SignalEvent::Reload => self.reload(),
                },
                Some(item) = self.completions.recv() => self.complete(item),
                Some(call) = self.server.recv() => {
                    self.server.exec(&mut self.state, &mut self.ctx, call);
                }
                Some(call) = self.commands.recv() => {
                    self.commands.exec(&mut self.state, &mut self.ctx, call);
                }
                Some(ret) = self.returns.recv() => self.async_return(ret),
                Some(id) = self.firings.recv() => {
                    timer::dispatch(&self.name, &mut self.state, &mut self.ctx, id);
                }
                _ = ticker.tick(), if ticking => self.update(),
            }
            self.ctx.client.admit();
        }

        self.drain().await;
        info!("⏹️ module {} stopped", self.name);
        self.state
    }

    fn complete(&mut self, item: Completion<S>) {
        let cb = item.into_callback();
        let (state, ctx) = (&mut self.state, &mut self.ctx);
        guard(&self.name, "job callback", || cb(state, ctx));
        self.ctx.pool.finish();
    }

    fn async_return(&mut self, ret: AsyncReturn<S>) {
        let cb = ret.into_callback();
        let (state, ctx) = (&mut self.state, &mut self.ctx);
        guard(&self.name, "async call callback", || cb(state, ctx));
    }

    fn update(&mut self) {
        if let Some(on_update) = self.on_update.as_mut() {
            let (state, ctx) = (&mut self.state, &mut self.ctx);
            guard(&self.name, "update", || on_update(state, ctx));
        }
    }

    fn reload(&mut self) {
        debug!("module {} reloading", self.name);
        if let Some(on_reload) = self.on_reload.as_mut() {
            let (state, ctx) = (&mut self.state, &mut self.ctx);
            guard(&self.name, "reload", || on_reload(state, ctx));
        }
    }

    /// Closes both routers to new calls, then keeps consuming completions
    /// and async results until every job and call issued so far has
    /// delivered. Outstanding producers can only finish if their results are
    /// consumed, so the queues are serviced for the whole drain.
    async fn drain(&mut self) {
        self.server.close();
        self.commands.close();
        self.ctx.timers.close();
        self.ctx.pool.close();
        self.ctx.client.close();

        loop {
            self.ctx.client.admit();
            if self.ctx.pool.idle() && self.ctx.client.idle() {
                break;
            }
            debug!(
                "module {} draining: {} jobs, {} calls outstanding",
                self.name,
                self.ctx.pool.pending(),
                self.ctx.client.pending()
            );
            tokio::select! {
                Some(item) = self.completions.recv() => self.complete(item),
                Some(ret) = self.returns.recv() => self.async_return(ret),
                else => break,
            }
        }
    }
}

#[cfg(test)]
mod tests;
