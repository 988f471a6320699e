//! TCP accept loop.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use canopy_runtime::panic_message;

use crate::agent::Agent;
use crate::conn::{ConnOptions, TcpConn};
use crate::error::NetworkError;
use crate::frame::FrameCodec;

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

fn default_listen_addr() -> String {
    "127.0.0.1:3563".to_string()
}

fn default_max_conn_num() -> usize {
    100
}

fn default_pending_write_num() -> usize {
    2000
}

fn default_verify_interval_secs() -> u64 {
    30
}

fn default_close_timeout_ms() -> u64 {
    5000
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpServerConfig {
    /// Address to listen on (e.g. "127.0.0.1:3563")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Connections beyond this are dropped on accept
    #[serde(default = "default_max_conn_num")]
    pub max_conn_num: usize,
    /// Outbound queue capacity per connection
    #[serde(default = "default_pending_write_num")]
    pub pending_write_num: usize,
    /// Seconds a connection may stay unverified (0 to disable)
    #[serde(default = "default_verify_interval_secs")]
    pub verify_interval_secs: u64,
    /// Milliseconds shutdown waits for connections to flush before resetting them
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_conn_num: default_max_conn_num(),
            pending_write_num: default_pending_write_num(),
            verify_interval_secs: default_verify_interval_secs(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }
}

impl TcpServerConfig {
    pub fn conn_options(&self) -> ConnOptions {
        ConnOptions {
            pending_write_num: self.pending_write_num,
            verify_interval: (self.verify_interval_secs > 0)
                .then(|| Duration::from_secs(self.verify_interval_secs)),
        }
    }
}

/// Builds the agent for a freshly accepted connection.
pub type NewAgent = Arc<dyn Fn(TcpConn) -> Box<dyn Agent> + Send + Sync>;

/// Accepts connections and runs one agent per connection.
pub struct TcpServer {
    config: TcpServerConfig,
    codec: Arc<FrameCodec>,
    new_agent: NewAgent,
    conns: Arc<DashMap<Uuid, TcpConn>>,
    shutdown: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpServer {
    pub fn new(config: TcpServerConfig, codec: Arc<FrameCodec>, new_agent: NewAgent) -> Self {
        Self {
            config,
            codec,
            new_agent,
            conns: Arc::new(DashMap::new()),
            shutdown: None,
            accept_task: None,
        }
    }

    /// Binds the listener and starts accepting. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, NetworkError> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|source| NetworkError::Bind { addr: self.config.listen_addr.clone(), source })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept = AcceptLoop {
            listener,
            config: self.config.clone(),
            codec: Arc::clone(&self.codec),
            new_agent: Arc::clone(&self.new_agent),
            conns: Arc::clone(&self.conns),
        };
        self.accept_task = Some(tokio::spawn(accept.run(shutdown_rx)));
        self.shutdown = Some(shutdown_tx);

        info!("🌐 listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Live connections.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Stops accepting, closes every connection and waits for their agents.
    ///
    /// Connections still open after `close_timeout_ms` are destroyed.
    pub async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                error!("accept loop failed: {}", e);
            }
        }
    }
}

struct AcceptLoop {
    listener: TcpListener,
    config: TcpServerConfig,
    codec: Arc<FrameCodec>,
    new_agent: NewAgent,
    conns: Arc<DashMap<Uuid, TcpConn>>,
}

impl AcceptLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut agents = JoinSet::new();
        let mut backoff = Duration::ZERO;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(_) = agents.join_next(), if !agents.is_empty() => {}
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => {
                            backoff = Duration::ZERO;
                            accepted
                        }
                        Err(e) => {
                            backoff = (backoff * 2).clamp(MIN_ACCEPT_BACKOFF, MAX_ACCEPT_BACKOFF);
                            warn!("accept error: {}; retrying in {:?}", e, backoff);
                            tokio::time::sleep(backoff).await;
                            continue;
                        }
                    };

                    if self.conns.len() >= self.config.max_conn_num {
                        warn!("too many connections, dropping {}", addr);
                        drop(stream);
                        continue;
                    }

                    let (conn, reader) = match TcpConn::new(stream, Arc::clone(&self.codec), self.config.conn_options()) {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("failed to set up connection from {}: {}", addr, e);
                            continue;
                        }
                    };
                    self.conns.insert(conn.id(), conn.clone());

                    let mut agent = (self.new_agent)(conn.clone());
                    let conns = Arc::clone(&self.conns);
                    agents.spawn(async move {
                        if let Err(payload) = AssertUnwindSafe(agent.run(reader)).catch_unwind().await {
                            error!("💥 agent for {} panicked: {}", conn.remote_addr(), panic_message(&*payload));
                        }
                        conn.close();
                        conns.remove(&conn.id());
                        agent.on_close().await;
                    });
                }
            }
        }

        drop(self.listener);
        debug!("closing {} connections", self.conns.len());
        for entry in self.conns.iter() {
            entry.value().close();
        }
        let grace = Duration::from_millis(self.config.close_timeout_ms);
        let flushed = tokio::time::timeout(grace, async {
            while agents.join_next().await.is_some() {}
        })
        .await;
        if flushed.is_err() {
            warn!("{} connections still open after {:?}, destroying", self.conns.len(), grace);
            for entry in self.conns.iter() {
                entry.value().destroy();
            }
            while agents.join_next().await.is_some() {}
        }
        info!("🛑 server stopped");
    }
}
