//! Logging system setup.
//!
//! The filter sits behind a reload layer so the level can follow the
//! configuration file when the process is asked to reload.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

use crate::config::LoggingSettings;

/// Lets the binary swap the active level after startup.
pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    level: String,
}

impl LogHandle {
    pub fn level(&self) -> &str {
        &self.level
    }

    /// Replaces the filter. `RUST_LOG`, when set, still wins.
    pub fn set_level(&mut self, level: &str) -> Result<()> {
        if level == self.level {
            return Ok(());
        }
        self.handle.reload(build_filter(level))?;
        info!("🔧 Log level changed: {} -> {}", self.level, level);
        self.level = level.to_string();
        Ok(())
    }
}

/// Builds the filter: `RUST_LOG` if present, `level` otherwise.
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the global tracing subscriber.
///
/// # Arguments
/// * `settings` - Level and output format
///
/// # Returns
/// * `Result<LogHandle>` - Handle for later level changes, or an error if a
///   subscriber was already installed
pub fn setup_logging(settings: &LoggingSettings) -> Result<LogHandle> {
    let (filter, handle) = reload::Layer::new(build_filter(&settings.level));
    let registry = tracing_subscriber::registry().with(filter);

    if settings.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()?;
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()?;
    }

    info!("🔧 Logging initialized with level: {}", settings.level);
    Ok(LogHandle {
        handle,
        level: settings.level.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_installs_once_and_reloads() {
        let settings = LoggingSettings::default();
        let mut logs = setup_logging(&settings).unwrap();
        assert_eq!(logs.level(), "info");

        logs.set_level("debug").unwrap();
        assert_eq!(logs.level(), "debug");
        logs.set_level("debug").unwrap();

        assert!(setup_logging(&settings).is_err());
    }
}
