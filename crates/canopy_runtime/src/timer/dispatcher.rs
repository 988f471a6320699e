use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use super::CronExpr;
use crate::error::RuntimeError;
use crate::panic::guard;
use crate::skeleton::Context;

pub type TimerId = u64;

enum TimerKind<S> {
    Once(Box<dyn FnOnce(&mut S, &mut Context<S>) + Send>),
    Cron(Box<dyn FnMut(&mut S, &mut Context<S>) + Send>),
}

struct TimerEntry<S> {
    kind: TimerKind<S>,
    stopped: Arc<AtomicBool>,
    exhausted: Arc<AtomicBool>,
    task: AbortHandle,
}

impl<S> TimerEntry<S> {
    fn is_armed(&self) -> bool {
        !self.stopped.load(Ordering::Acquire) && !self.exhausted.load(Ordering::Acquire)
    }
}

/// Cancels a scheduled timer or cron.
///
/// Stopping wins over a firing that is already queued: once `stop` returns,
/// the callback will not run again.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: TimerId,
    stopped: Arc<AtomicBool>,
    exhausted: Arc<AtomicBool>,
    task: AbortHandle,
}

impl TimerHandle {
    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.task.abort();
    }

    /// True once stopped, fired (one-shot) or out of occurrences (cron).
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.exhausted.load(Ordering::Acquire)
    }
}

/// Owns every armed timer of one module.
pub struct TimerDispatcher<S> {
    tx: Option<mpsc::Sender<TimerId>>,
    entries: HashMap<TimerId, TimerEntry<S>>,
    next_id: TimerId,
}

impl<S: Send + 'static> TimerDispatcher<S> {
    /// Creates a dispatcher whose firing queue holds `len` ids. A zero length
    /// disables timers.
    pub(crate) fn new(len: usize) -> (Self, mpsc::Receiver<TimerId>) {
        let (tx, rx) = mpsc::channel(len.max(1));
        let dispatcher = Self {
            tx: (len > 0).then_some(tx),
            entries: HashMap::new(),
            next_id: 0,
        };
        (dispatcher, rx)
    }

    fn sender(&self) -> Result<mpsc::Sender<TimerId>, RuntimeError> {
        self.tx.clone().ok_or(RuntimeError::Disabled("timers"))
    }

    fn insert(
        &mut self,
        id: TimerId,
        kind: TimerKind<S>,
        stopped: Arc<AtomicBool>,
        exhausted: Arc<AtomicBool>,
        task: AbortHandle,
    ) -> TimerHandle {
        // Entries of stopped timers are only reclaimed here or when they fire.
        self.entries.retain(|_, entry| !entry.stopped.load(Ordering::Acquire));
        self.entries.insert(
            id,
            TimerEntry {
                kind,
                stopped: Arc::clone(&stopped),
                exhausted: Arc::clone(&exhausted),
                task: task.clone(),
            },
        );
        TimerHandle { id, stopped, exhausted, task }
    }

    fn allocate(&mut self) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Runs `cb` on the module thread once `after` has elapsed.
    pub fn after_func<F>(&mut self, after: Duration, cb: F) -> Result<TimerHandle, RuntimeError>
    where
        F: FnOnce(&mut S, &mut Context<S>) + Send + 'static,
    {
        let tx = self.sender()?;
        let id = self.allocate();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(id).await;
        });
        Ok(self.insert(
            id,
            TimerKind::Once(Box::new(cb)),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
            task.abort_handle(),
        ))
    }

    /// Runs `cb` on the module thread at every occurrence of `expr`, in
    /// local time.
    pub fn cron_func<F>(&mut self, expr: CronExpr, cb: F) -> Result<TimerHandle, RuntimeError>
    where
        F: FnMut(&mut S, &mut Context<S>) + Send + 'static,
    {
        let tx = self.sender()?;
        let id = self.allocate();
        let exhausted = Arc::new(AtomicBool::new(false));
        let finished = Arc::clone(&exhausted);
        let task = tokio::spawn(async move {
            let mut last = None;
            loop {
                let now = chrono::Local::now().naive_local();
                // Never schedule at or before the previous occurrence, even if
                // the wall clock lags the monotonic sleep.
                let base = match last {
                    Some(last) if last > now => last,
                    _ => now,
                };
                let Some(next) = expr.next(base) else {
                    debug!("cron {}: no further occurrences", id);
                    finished.store(true, Ordering::Release);
                    break;
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                last = Some(next);
                if tx.send(id).await.is_err() {
                    break;
                }
            }
        });
        Ok(self.insert(
            id,
            TimerKind::Cron(Box::new(cb)),
            Arc::new(AtomicBool::new(false)),
            exhausted,
            task.abort_handle(),
        ))
    }

    /// Number of timers that are still armed.
    pub fn active(&self) -> usize {
        self.entries.values().filter(|entry| entry.is_armed()).count()
    }

    /// Aborts every timer task and drops all callbacks.
    pub(crate) fn close(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.stopped.store(true, Ordering::Release);
            entry.task.abort();
        }
    }
}

/// Runs the callback bound to `id` after dequeuing its firing.
///
/// One-shot timers are deactivated first; a cron goes back into the table
/// unless it was stopped while its callback ran or has no occurrences left.
/// A firing queued before the cron ran out still runs.
pub(crate) fn dispatch<S: Send + 'static>(
    module: &str,
    state: &mut S,
    ctx: &mut Context<S>,
    id: TimerId,
) {
    let Some(entry) = ctx.timers.entries.remove(&id) else {
        trace!("timer {} fired after being reclaimed", id);
        return;
    };
    let TimerEntry { kind, stopped, exhausted, task } = entry;
    if stopped.load(Ordering::Acquire) {
        trace!("timer {} fired after stop", id);
        return;
    }

    match kind {
        TimerKind::Once(cb) => {
            stopped.store(true, Ordering::Release);
            guard(module, "timer callback", || cb(state, ctx));
        }
        TimerKind::Cron(mut cb) => {
            guard(module, "cron callback", || cb(state, ctx));
            let rearm = TimerEntry { kind: TimerKind::Cron(cb), stopped, exhausted, task };
            if rearm.is_armed() {
                ctx.timers.entries.insert(id, rearm);
            }
        }
    }
}
