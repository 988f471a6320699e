//! Process signal handling.
//!
//! SIGHUP asks for a configuration reload; SIGINT and SIGTERM (Ctrl+C on
//! Windows) ask for a graceful shutdown.

use std::io;
use tokio::signal;
use tracing::info;

/// What the operator asked the process to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Shutdown,
    Reload,
}

/// Signal streams registered once at startup, so no signal delivered
/// between two waits is lost.
pub struct SignalListener {
    #[cfg(unix)]
    sigint: signal::unix::Signal,
    #[cfg(unix)]
    sigterm: signal::unix::Signal,
    #[cfg(unix)]
    sighup: signal::unix::Signal,
}

impl SignalListener {
    pub fn new() -> io::Result<Self> {
        #[cfg(unix)]
        {
            use signal::unix::{signal, SignalKind};

            Ok(Self {
                sigint: signal(SignalKind::interrupt())?,
                sigterm: signal(SignalKind::terminate())?,
                sighup: signal(SignalKind::hangup())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Waits for the next signal of interest.
    pub async fn recv(&mut self) -> io::Result<ProcessSignal> {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.sigint.recv() => {
                    info!("📡 Received SIGINT");
                    Ok(ProcessSignal::Shutdown)
                }
                _ = self.sigterm.recv() => {
                    info!("📡 Received SIGTERM");
                    Ok(ProcessSignal::Shutdown)
                }
                _ = self.sighup.recv() => {
                    info!("📡 Received SIGHUP");
                    Ok(ProcessSignal::Reload)
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("📡 Received Ctrl+C");
            Ok(ProcessSignal::Shutdown)
        }
    }
}
