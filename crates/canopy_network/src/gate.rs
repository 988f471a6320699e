//! The gate module: accepts client connections and feeds their messages to
//! the modules that own them.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use canopy_runtime::{CallId, Module, ModuleSignal, RpcError, RuntimeError, ServerHandle};

use crate::agent::Agent;
use crate::conn::{ConnReader, TcpConn};
use crate::error::{FrameError, ProcessorError};
use crate::frame::FrameCodec;
use crate::processor::Processor;
use crate::server::{NewAgent, TcpServer, TcpServerConfig};

/// Call id used to announce a new connection to the agent router.
pub const NEW_AGENT: CallId = "NewAgent";
/// Call id used to announce a closed connection to the agent router.
pub const CLOSE_AGENT: CallId = "CloseAgent";

/// What module handlers hold on to in order to answer a connection.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    conn: TcpConn,
}

impl AgentHandle {
    pub fn new(conn: TcpConn) -> Self {
        Self { conn }
    }

    pub fn id(&self) -> Uuid {
        self.conn.id()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    pub fn conn(&self) -> &TcpConn {
        &self.conn
    }

    /// Sends one raw message body.
    pub fn write_msg(&self, body: &[u8]) -> Result<(), FrameError> {
        self.conn.write_msg(&[body])
    }

    /// Sends `msg` as a JSON object tagged with `cmd`.
    pub fn write_json<T: Serialize>(&self, cmd: &str, msg: &T) -> Result<(), ProcessorError> {
        let body = Processor::marshal(cmd, msg)?;
        self.conn.write_msg(&[&body])?;
        Ok(())
    }

    pub fn verify(&self) {
        self.conn.verify();
    }

    pub fn is_verified(&self) -> bool {
        self.conn.is_verified()
    }

    pub fn close(&self) {
        self.conn.close();
    }

    pub fn destroy(&self) {
        self.conn.destroy();
    }
}

impl PartialEq for AgentHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for AgentHandle {}

/// Connection lifecycle notification sent to the agent router.
#[derive(Debug, Clone)]
pub enum GateEvent {
    Connected(AgentHandle),
    Closed(AgentHandle),
}

type EventSink = Arc<dyn Fn(GateEvent) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct Gate {
    config: TcpServerConfig,
    codec: Arc<FrameCodec>,
    processor: Arc<Processor>,
    events: Option<EventSink>,
    server: Option<TcpServer>,
    local_addr: Option<SocketAddr>,
}

impl Gate {
    pub fn new(config: TcpServerConfig, codec: Arc<FrameCodec>, processor: Processor) -> Self {
        Self {
            config,
            codec,
            processor: Arc::new(processor),
            events: None,
            server: None,
            local_addr: None,
        }
    }

    /// Sends [`GateEvent`]s to `router` under [`NEW_AGENT`] and
    /// [`CLOSE_AGENT`], wrapped into its message type by `wrap`.
    pub fn with_agent_router<M, R, W>(mut self, router: ServerHandle<M, R>, wrap: W) -> Self
    where
        M: Send + 'static,
        R: Send + 'static,
        W: Fn(GateEvent) -> M + Send + Sync + 'static,
    {
        self.events = Some(Arc::new(move |event: GateEvent| {
            let id = match event {
                GateEvent::Connected(_) => NEW_AGENT,
                GateEvent::Closed(_) => CLOSE_AGENT,
            };
            let router = router.clone();
            let msg = wrap(event);
            async move {
                if let Err(e) = router.go(id, msg).await {
                    debug!("gate: agent router unavailable for {}: {}", id, e);
                }
            }
            .boxed()
        }));
        self
    }

    /// Address the listener is bound to, once initialised.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

#[async_trait]
impl Module for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    async fn on_init(&mut self) -> Result<(), RuntimeError> {
        let processor = Arc::clone(&self.processor);
        let events = self.events.clone();
        let new_agent: NewAgent = Arc::new(move |conn: TcpConn| -> Box<dyn Agent> {
            Box::new(GateAgent {
                handle: AgentHandle::new(conn),
                processor: Arc::clone(&processor),
                events: events.clone(),
            })
        });

        let mut server = TcpServer::new(self.config.clone(), Arc::clone(&self.codec), new_agent);
        let addr = server.start().await.map_err(|e| RuntimeError::Init {
            module: self.name().to_string(),
            reason: e.to_string(),
        })?;
        self.local_addr = Some(addr);
        self.server = Some(server);
        Ok(())
    }

    async fn run(&mut self, mut signal: ModuleSignal) {
        signal.closed().await;
        if let Some(mut server) = self.server.take() {
            server.close().await;
        }
    }
}

struct GateAgent {
    handle: AgentHandle,
    processor: Arc<Processor>,
    events: Option<EventSink>,
}

#[async_trait]
impl Agent for GateAgent {
    async fn run(&mut self, mut reader: ConnReader) {
        if let Some(events) = &self.events {
            events(GateEvent::Connected(self.handle.clone())).await;
        }

        loop {
            let data = match reader.read_msg().await {
                Ok(data) => data,
                Err(e) if e.is_disconnect() => {
                    debug!("connection {} ended: {}", self.handle.id(), e);
                    break;
                }
                Err(e) => {
                    warn!("connection {} from {}: {}", self.handle.id(), self.handle.remote_addr(), e);
                    self.handle.destroy();
                    break;
                }
            };

            match self.processor.route(&data, &self.handle).await {
                Ok(()) => {}
                Err(ProcessorError::Route(RpcError::Closed)) => {
                    debug!("connection {}: target module closed", self.handle.id());
                    break;
                }
                Err(e) => debug!("connection {}: dropped message: {}", self.handle.id(), e),
            }
        }
    }

    async fn on_close(&mut self) {
        if let Some(events) = &self.events {
            events(GateEvent::Closed(self.handle.clone())).await;
        }
    }
}
