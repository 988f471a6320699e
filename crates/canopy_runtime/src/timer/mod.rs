//! One-shot and cron timers whose callbacks run on the module thread.
//!
//! Timer tasks only push the id of the timer that fired onto a bounded
//! queue; the callback itself stays in the dispatcher and is executed by the
//! module loop when it dequeues the firing.
pub mod cron;
mod dispatcher;

pub use cron::{CronError, CronExpr};
pub use dispatcher::{TimerDispatcher, TimerHandle, TimerId};

pub(crate) use dispatcher::dispatch;
