//! Module lifecycle: registration, startup, reload and ordered teardown.
//!
//! Modules are initialised in registration order and destroyed in reverse,
//! so a module can rely on everything registered before it outliving it.

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::RuntimeError;
use crate::panic::panic_message;

/// A unit of server logic with its own task.
///
/// `run` is expected to drive a [`Skeleton`](crate::Skeleton) (or any loop)
/// until its signal reports [`SignalEvent::Close`].
#[async_trait]
pub trait Module: Send + 'static {
    fn name(&self) -> &str;

    /// Called before any module starts running. An error aborts startup.
    async fn on_init(&mut self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn run(&mut self, signal: ModuleSignal);

    /// Called after `run` has returned.
    async fn on_destroy(&mut self) {}
}

/// What a module is being asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Close,
    Reload,
}

#[derive(Debug, Clone, Copy, Default)]
struct SignalState {
    close: bool,
    reload_seq: u64,
}

/// Control side of a [`ModuleSignal`].
#[derive(Debug)]
pub struct SignalSender {
    tx: watch::Sender<SignalState>,
}

impl SignalSender {
    pub fn close(&self) {
        self.tx.send_modify(|state| state.close = true);
    }

    pub fn reload(&self) {
        self.tx.send_modify(|state| state.reload_seq += 1);
    }
}

/// Receiving side handed to [`Module::run`].
///
/// Dropping the sender reads as a close request.
#[derive(Debug, Clone)]
pub struct ModuleSignal {
    rx: watch::Receiver<SignalState>,
    seen_reload: u64,
}

impl ModuleSignal {
    pub fn new() -> (SignalSender, ModuleSignal) {
        let (tx, rx) = watch::channel(SignalState::default());
        (SignalSender { tx }, ModuleSignal { rx, seen_reload: 0 })
    }

    /// Waits for the next request. Once closed, keeps returning `Close`.
    ///
    /// Cancel safe: a request is only consumed when this returns.
    pub async fn recv(&mut self) -> SignalEvent {
        loop {
            let state = *self.rx.borrow_and_update();
            if state.close {
                return SignalEvent::Close;
            }
            if state.reload_seq != self.seen_reload {
                self.seen_reload = state.reload_seq;
                return SignalEvent::Reload;
            }
            if self.rx.changed().await.is_err() {
                return SignalEvent::Close;
            }
        }
    }

    /// Waits until a close is requested, skipping reloads.
    pub async fn closed(&mut self) {
        while self.recv().await != SignalEvent::Close {}
    }

    pub fn is_closed(&self) -> bool {
        self.rx.borrow().close || self.rx.has_changed().is_err()
    }
}

struct RunningModule {
    name: String,
    signal: SignalSender,
    task: JoinHandle<Box<dyn Module>>,
}

/// Owns the registered modules and drives their lifecycle.
#[derive(Default)]
pub struct ModuleManager {
    registered: Vec<Box<dyn Module>>,
    running: Vec<RunningModule>,
}

impl ModuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M: Module>(&mut self, module: M) {
        self.registered.push(Box::new(module));
    }

    pub fn len(&self) -> usize {
        self.registered.len() + self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Initialises every registered module in order, then starts them all.
    ///
    /// If any `on_init` fails nothing is started and the error is returned.
    pub async fn init(&mut self) -> Result<(), RuntimeError> {
        for module in self.registered.iter_mut() {
            debug!("initialising module {}", module.name());
            module.on_init().await?;
        }

        for mut module in self.registered.drain(..) {
            let name = module.name().to_string();
            let (signal, rx) = ModuleSignal::new();
            let task_name = name.clone();
            let task = tokio::spawn(async move {
                if let Err(payload) = AssertUnwindSafe(module.run(rx)).catch_unwind().await {
                    error!("💥 module {} panicked: {}", task_name, panic_message(&*payload));
                }
                module
            });
            info!("🧩 module {} started", name);
            self.running.push(RunningModule { name, signal, task });
        }
        Ok(())
    }

    /// Asks every running module to reload.
    pub fn reload(&self) {
        for module in &self.running {
            debug!("reloading module {}", module.name);
            module.signal.reload();
        }
    }

    /// Stops modules in reverse registration order, waiting for each one's
    /// loop to finish before calling its `on_destroy`.
    pub async fn destroy(&mut self) {
        while let Some(running) = self.running.pop() {
            running.signal.close();
            match running.task.await {
                Ok(mut module) => {
                    if let Err(payload) = AssertUnwindSafe(module.on_destroy()).catch_unwind().await {
                        error!(
                            "💥 module {} panicked during destroy: {}",
                            running.name,
                            panic_message(&*payload)
                        );
                    }
                    info!("🧩 module {} stopped", running.name);
                }
                Err(e) => error!("module {} task failed: {}", running.name, e),
            }
        }
    }
}
