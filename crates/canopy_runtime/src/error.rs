//! Error types shared by the runtime components.

use thiserror::Error;

/// Errors produced by the call router.
///
/// Configuration failures (`AlreadyRegistered`) surface at setup time;
/// everything else is handed back to the caller as a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("call id {0:?} is not registered")]
    NotRegistered(String),
    #[error("call id {0:?} is already registered")]
    AlreadyRegistered(String),
    #[error("call router is closed")]
    Closed,
    #[error("call queue is full")]
    QueueFull,
    #[error("handler panicked: {0}")]
    HandlerPanicked(String),
    #[error("handler failed: {0}")]
    Handler(String),
}

/// Errors raised while configuring or driving a module.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0} is disabled by configuration")]
    Disabled(&'static str),
    #[error("module is closing")]
    Closed,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("call router error: {0}")]
    Rpc(#[from] RpcError),
    #[error("module {module} failed to initialize: {reason}")]
    Init { module: String, reason: String },
}

/// Failure of a background job, delivered to its completion callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error("job panicked: {0}")]
    Panicked(String),
    #[error("job was cancelled")]
    Cancelled,
}

impl From<tokio::task::JoinError> for WorkerError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            WorkerError::Panicked(crate::panic_message(&*err.into_panic()))
        } else {
            WorkerError::Cancelled
        }
    }
}
