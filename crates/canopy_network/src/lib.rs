//! # Canopy Network
//!
//! Transport for Canopy servers: a configurable length-prefixed frame codec
//! with optional XXTEA body encryption, a per-connection actor with a
//! bounded write queue and verification deadline, TCP server and client
//! loops, JSON message routing onto module call routers, and the gate
//! module tying them together.

pub mod agent;
pub mod client;
pub mod conn;
pub mod error;
pub mod frame;
pub mod gate;
pub mod processor;
pub mod server;
pub mod xxtea;

pub use agent::Agent;
pub use client::{TcpClient, TcpClientConfig};
pub use conn::{ConnOptions, ConnReader, ConnState, TcpConn};
pub use error::{FrameError, NetworkError, ProcessorError};
pub use frame::{FrameCodec, FrameConfig};
pub use gate::{AgentHandle, Gate, GateEvent, CLOSE_AGENT, NEW_AGENT};
pub use processor::Processor;
pub use server::{NewAgent, TcpServer, TcpServerConfig};
