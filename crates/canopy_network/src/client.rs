//! TCP dialer with optional reconnect.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use canopy_runtime::panic_message;

use crate::agent::Agent;
use crate::conn::{ConnOptions, ConnReader, TcpConn};
use crate::error::NetworkError;
use crate::frame::FrameCodec;

fn default_connect_interval_ms() -> u64 {
    3000
}

fn default_pending_write_num() -> usize {
    2000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpClientConfig {
    /// Server address to dial
    pub addr: String,
    /// Delay between connection attempts in milliseconds
    #[serde(default = "default_connect_interval_ms")]
    pub connect_interval_ms: u64,
    /// Outbound queue capacity
    #[serde(default = "default_pending_write_num")]
    pub pending_write_num: usize,
    /// Dial again after the connection ends
    #[serde(default)]
    pub auto_reconnect: bool,
}

impl TcpClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_interval_ms: default_connect_interval_ms(),
            pending_write_num: default_pending_write_num(),
            auto_reconnect: false,
        }
    }

    fn conn_options(&self) -> ConnOptions {
        // the dialing side has nothing to prove to itself
        ConnOptions { pending_write_num: self.pending_write_num, verify_interval: None }
    }
}

pub type NewClientAgent = Arc<dyn Fn(TcpConn) -> Box<dyn Agent> + Send + Sync>;

/// Dials a server and runs an agent on the resulting connection.
pub struct TcpClient {
    config: TcpClientConfig,
    codec: Arc<FrameCodec>,
    current: Arc<Mutex<Option<TcpConn>>>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl TcpClient {
    pub fn new(config: TcpClientConfig, codec: Arc<FrameCodec>) -> Self {
        Self {
            config,
            codec,
            current: Arc::new(Mutex::new(None)),
            shutdown: None,
            task: None,
        }
    }

    /// Dials once.
    pub async fn connect(&self) -> Result<(TcpConn, ConnReader), NetworkError> {
        dial(&self.config, &self.codec).await
    }

    /// The connection currently served by the background task, if any.
    pub fn conn(&self) -> Option<TcpConn> {
        self.current.lock().clone()
    }

    /// Dials in the background, retrying every `connect_interval_ms`, and
    /// runs a fresh agent on every connection until [`close`](Self::close).
    pub fn start(&mut self, new_agent: NewClientAgent) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let config = self.config.clone();
        let codec = Arc::clone(&self.codec);
        let current = Arc::clone(&self.current);
        let interval = Duration::from_millis(config.connect_interval_ms);

        self.shutdown = Some(shutdown_tx);
        self.task = Some(tokio::spawn(async move {
            loop {
                let dialed = tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    dialed = dial(&config, &codec) => dialed,
                };
                let (conn, reader) = match dialed {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("{}; retrying in {:?}", e, interval);
                        tokio::select! {
                            _ = shutdown_rx.changed() => return,
                            _ = tokio::time::sleep(interval) => continue,
                        }
                    }
                };

                *current.lock() = Some(conn.clone());
                if *shutdown_rx.borrow() {
                    // close() ran between the dial and publishing the connection
                    conn.close();
                }
                let mut agent = new_agent(conn.clone());
                if let Err(payload) = AssertUnwindSafe(agent.run(reader)).catch_unwind().await {
                    error!("💥 client agent panicked: {}", panic_message(&*payload));
                }
                conn.close();
                *current.lock() = None;
                agent.on_close().await;

                if !config.auto_reconnect || *shutdown_rx.borrow() {
                    return;
                }
                info!("reconnecting to {}", config.addr);
            }
        }));
    }

    /// Closes the live connection and stops reconnecting.
    pub async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(conn) = self.current.lock().take() {
            conn.close();
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("client task failed: {}", e);
            }
        }
    }
}

async fn dial(config: &TcpClientConfig, codec: &Arc<FrameCodec>) -> Result<(TcpConn, ConnReader), NetworkError> {
    let stream = TcpStream::connect(&config.addr)
        .await
        .map_err(|source| NetworkError::Connect { addr: config.addr.clone(), source })?;
    let pair = TcpConn::new(stream, Arc::clone(codec), config.conn_options())?;
    Ok(pair)
}
