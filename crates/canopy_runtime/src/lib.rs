//! # Canopy Runtime
//!
//! The module runtime that every Canopy server is assembled from. A *module*
//! is one logical thread of execution that owns its state outright and
//! interleaves, one at a time:
//!
//! - calls routed to it by other modules through its [`chanrpc::Server`],
//! - administrative commands issued through a second command router,
//! - results of asynchronous calls it issued through its own client,
//! - completions of background work handed to the [`worker::WorkerPool`],
//! - firings of one-shot and cron timers from the [`timer::TimerDispatcher`],
//! - a periodic update tick.
//!
//! Every cross-task handoff goes through a bounded `tokio::sync::mpsc` queue
//! carrying plain data, so no module state is ever touched by two tasks.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use canopy_runtime::{ModuleSignal, Skeleton, SkeletonConfig};
//!
//! #[derive(Default)]
//! struct Counter { hits: u64 }
//!
//! # async fn demo() -> Result<(), canopy_runtime::RuntimeError> {
//! let mut skeleton: Skeleton<Counter, u64, u64> =
//!     Skeleton::new("counter", SkeletonConfig::default(), Counter::default())?;
//! skeleton.register_chan_rpc("add", |state, _ctx, n| {
//!     state.hits += n;
//!     Ok(state.hits)
//! })?;
//!
//! let router = skeleton.chan_rpc();
//! let (sender, signal) = ModuleSignal::new();
//! let task = tokio::spawn(skeleton.run(signal));
//!
//! assert_eq!(router.call("add", 2).await, Ok(2));
//! sender.close();
//! let state = task.await.expect("module task");
//! assert_eq!(state.hits, 2);
//! # Ok(())
//! # }
//! ```

pub mod chanrpc;
pub mod error;
pub mod module;
pub mod panic;
pub mod skeleton;
pub mod timer;
pub mod worker;

pub use chanrpc::{CallId, Server, ServerHandle};
pub use error::{RpcError, RuntimeError, WorkerError};
pub use module::{Module, ModuleManager, ModuleSignal, SignalEvent, SignalSender};
pub use panic::panic_message;
pub use skeleton::{CommandInfo, Context, Skeleton, SkeletonConfig};
pub use timer::{CronExpr, TimerHandle};
pub use worker::LinearContext;
