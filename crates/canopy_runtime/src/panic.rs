//! Panic isolation helpers.
//!
//! A fault inside a handler, callback or background task must never take
//! down the module that runs it. These helpers convert a caught panic into a
//! log line and let the caller continue.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

/// Extracts a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs `f`, logging and swallowing any panic. Returns `false` if it panicked.
pub(crate) fn guard<F: FnOnce()>(module: &str, what: &str, f: F) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            error!(
                module,
                "💥 {} panicked: {}",
                what,
                panic_message(&*payload)
            );
            false
        }
    }
}
