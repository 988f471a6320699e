use async_trait::async_trait;

use crate::conn::ConnReader;

/// Application logic bound to one connection.
///
/// `run` owns the inbound side and returns when the connection should end;
/// the server or client then closes the connection and calls `on_close`.
#[async_trait]
pub trait Agent: Send + 'static {
    async fn run(&mut self, reader: ConnReader);

    async fn on_close(&mut self) {}
}
