//! Per-connection actor.
//!
//! A [`TcpConn`] owns the outbound side of one socket: a bounded write queue
//! drained by exactly one writer task, plus the verification deadline. The
//! inbound side is a separate [`ConnReader`] used by a single agent task.

use std::net::{Shutdown, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use socket2::Socket;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use canopy_runtime::panic_message;

use crate::error::FrameError;
use crate::frame::FrameCodec;

/// Closing state of a connection. Verification is tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    /// A graceful close is queued behind pending writes.
    Closing,
    Closed,
}

/// Per-connection tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnOptions {
    /// Capacity of the outbound queue
    pub pending_write_num: usize,
    /// Deadline for [`TcpConn::verify`]; `None` never expires
    pub verify_interval: Option<Duration>,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self { pending_write_num: 2000, verify_interval: Some(Duration::from_secs(30)) }
    }
}

struct Core {
    state: ConnState,
    writer: Option<AbortHandle>,
}

struct Inner {
    id: Uuid,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    core: Mutex<Core>,
    write_tx: mpsc::Sender<Option<Vec<u8>>>,
    verified: AtomicBool,
    control: Socket,
    codec: Arc<FrameCodec>,
}

/// Cloneable handle to the outbound side of a connection.
#[derive(Clone)]
pub struct TcpConn {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConn")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl TcpConn {
    /// Takes ownership of `stream` and starts its writer task.
    pub fn new(
        stream: TcpStream,
        codec: Arc<FrameCodec>,
        options: ConnOptions,
    ) -> std::io::Result<(TcpConn, ConnReader)> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;

        // Keep a duplicate descriptor so destroy can reset the socket while
        // the halves are owned elsewhere.
        let std_stream = stream.into_std()?;
        let control = Socket::from(std_stream.try_clone()?);
        let stream = TcpStream::from_std(std_stream)?;
        let (read_half, write_half) = stream.into_split();

        let (write_tx, write_rx) = mpsc::channel(options.pending_write_num.max(1));
        let conn = TcpConn {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                local_addr,
                remote_addr,
                core: Mutex::new(Core { state: ConnState::Open, writer: None }),
                write_tx,
                verified: AtomicBool::new(false),
                control,
                codec: Arc::clone(&codec),
            }),
        };

        let writer = tokio::spawn(run_writer(conn.clone(), write_half, write_rx, options.verify_interval));
        conn.inner.core.lock().writer = Some(writer.abort_handle());

        debug!("🔗 connection {} opened from {}", conn.id(), remote_addr);
        Ok((conn, ConnReader { half: read_half, codec, remote_addr }))
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn state(&self) -> ConnState {
        self.inner.core.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnState::Closed
    }

    pub fn is_verified(&self) -> bool {
        self.inner.verified.load(Ordering::Acquire)
    }

    /// Marks the connection as having passed its handshake, which exempts
    /// it from the verification deadline.
    pub fn verify(&self) {
        self.inner.verified.store(true, Ordering::Release);
    }

    /// Queues raw bytes for the writer.
    ///
    /// Does nothing once closing or for empty input. Never waits: if the
    /// queue is full the connection is destroyed instead.
    pub fn write(&self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let mut core = self.inner.core.lock();
        if core.state != ConnState::Open {
            return;
        }
        self.enqueue(&mut core, Some(bytes));
    }

    /// Frames `parts` as one message and queues it.
    pub fn write_msg(&self, parts: &[&[u8]]) -> Result<(), FrameError> {
        let frame = self.inner.codec.encode(parts)?;
        self.write(frame);
        Ok(())
    }

    /// Flushes what is queued, then closes the socket. Idempotent.
    pub fn close(&self) {
        let mut core = self.inner.core.lock();
        if core.state != ConnState::Open {
            return;
        }
        core.state = ConnState::Closing;
        self.enqueue(&mut core, None);
    }

    /// Resets the socket immediately, discarding anything not yet sent.
    /// Safe to call in any state.
    pub fn destroy(&self) {
        let mut core = self.inner.core.lock();
        self.destroy_locked(&mut core);
    }

    fn enqueue(&self, core: &mut Core, item: Option<Vec<u8>>) {
        match self.inner.write_tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("connection {}: write queue full, destroying", self.inner.id);
                self.destroy_locked(core);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn destroy_locked(&self, core: &mut Core) {
        if core.state == ConnState::Closed {
            return;
        }
        core.state = ConnState::Closed;
        if let Err(e) = self.inner.control.set_linger(Some(Duration::ZERO)) {
            debug!("connection {}: set linger: {}", self.inner.id, e);
        }
        let _ = self.inner.control.shutdown(Shutdown::Both);
        if let Some(writer) = core.writer.take() {
            writer.abort();
        }
        debug!("💥 connection {} destroyed", self.inner.id);
    }

    /// Cleanup after the writer stops on its own. Runs at most once.
    fn release(&self) {
        let mut core = self.inner.core.lock();
        if core.state == ConnState::Closed {
            return;
        }
        core.state = ConnState::Closed;
        core.writer = None;
        let _ = self.inner.control.shutdown(Shutdown::Both);
        debug!("🔌 connection {} closed", self.inner.id);
    }
}

async fn run_writer(
    conn: TcpConn,
    half: OwnedWriteHalf,
    rx: mpsc::Receiver<Option<Vec<u8>>>,
    verify_interval: Option<Duration>,
) {
    let outcome = AssertUnwindSafe(write_loop(&conn, half, rx, verify_interval))
        .catch_unwind()
        .await;
    match outcome {
        Ok(WriterExit::Finished) => conn.release(),
        Ok(WriterExit::Unverified) => {
            warn!("connection {} not verified in time, destroying", conn.id());
            conn.destroy();
        }
        Err(payload) => {
            error!("💥 connection {} writer panicked: {}", conn.id(), panic_message(&*payload));
            conn.destroy();
        }
    }
}

enum WriterExit {
    Finished,
    Unverified,
}

async fn write_loop(
    conn: &TcpConn,
    mut half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Option<Vec<u8>>>,
    verify_interval: Option<Duration>,
) -> WriterExit {
    let deadline = async {
        match verify_interval {
            Some(interval) => tokio::time::sleep(interval).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let mut deadline_armed = true;

    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(Some(bytes)) => {
                    if let Err(e) = half.write_all(&bytes).await {
                        debug!("connection {}: write failed: {}", conn.id(), e);
                        return WriterExit::Finished;
                    }
                }
                // close sentinel, or every sender is gone
                Some(None) | None => return WriterExit::Finished,
            },
            _ = &mut deadline, if deadline_armed => {
                deadline_armed = false;
                if !conn.is_verified() {
                    return WriterExit::Unverified;
                }
            }
        }
    }
}

/// Inbound side of a connection. Owned by a single reading task.
#[derive(Debug)]
pub struct ConnReader {
    half: OwnedReadHalf,
    codec: Arc<FrameCodec>,
    remote_addr: SocketAddr,
}

impl ConnReader {
    /// Reads the next message body.
    pub async fn read_msg(&mut self) -> Result<Vec<u8>, FrameError> {
        self.codec.decode(&mut self.half).await
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}
