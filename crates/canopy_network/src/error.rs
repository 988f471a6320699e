//! Error types for the transport layer.

use canopy_runtime::RpcError;
use std::io;
use thiserror::Error;

/// Framing failures. Any of these ends the connection that produced it.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("message too long: {len} > {max}")]
    TooLong { len: usize, max: usize },
    #[error("message too short: {len} < {min}")]
    TooShort { len: usize, min: usize },
    #[error("message body failed to decrypt")]
    Decrypt,
    #[error("invalid frame configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// True when the peer simply went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            FrameError::Io(e) if matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            )
        )
    }
}

/// Failures while turning a frame body into a routed call, or a reply into
/// a frame body. None of these is fatal to the connection.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("message has no \"cmd\" field")]
    MissingCmd,
    #[error("no route for message {0:?}")]
    UnknownMessage(String),
    #[error("message {0:?} is already registered")]
    AlreadyRegistered(String),
    #[error("message {0:?} must encode to a JSON object")]
    NotAnObject(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("routing failed: {0}")]
    Route(#[from] RpcError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Failures of the TCP server and client.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}
