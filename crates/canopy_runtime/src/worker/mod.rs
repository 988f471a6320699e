//! Background work off the module thread.
//!
//! Job bodies run on tokio's blocking pool; their completion callbacks are
//! marshalled back through a bounded queue and run by the owning module.
mod linear;
mod pool;

pub use linear::LinearContext;
pub use pool::WorkerPool;

pub(crate) use pool::Completion;

#[cfg(test)]
mod tests;
