//! Call router: moves work onto the thread of the module that owns a handler.
//!
//! The server side (`Server`) is owned by one module and executed only from
//! its loop. Any task can enqueue calls through a cloned `ServerHandle`.
//! The client side (`Client`) lets a module issue calls whose results come
//! back through its own return queue, bounded by an in-flight limit.
mod client;
mod server;

pub use client::Client;
pub use server::{Call, Server, ServerHandle};

pub(crate) use client::AsyncReturn;

/// Identifier a handler is registered under.
///
/// Ids are fixed when a module is assembled, so they are plain static strings.
pub type CallId = &'static str;
