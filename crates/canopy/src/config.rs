//! Configuration management for the canopy server.
//!
//! The whole process is described by one TOML file. Every section falls
//! back to the defaults owned by the library crates, so a file only needs
//! the keys it wants to change.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

use canopy_network::{FrameCodec, FrameConfig, TcpServerConfig};
use canopy_runtime::SkeletonConfig;

use crate::cli::CliArgs;

/// Log levels accepted in the configuration file.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

fn default_log_level() -> String {
    "info".to_string()
}

/// Application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Listener settings for the gate
    #[serde(default)]
    pub server: TcpServerConfig,
    /// Wire format shared by every connection
    #[serde(default)]
    pub frame: FrameConfig,
    /// Queue sizes and tick period of the echo module
    #[serde(default)]
    pub module: SkeletonConfig,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Logging system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, a default configuration is written to
    /// `path` and returned.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig =
                toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Applies command-line overrides on top of the file contents.
    pub fn apply_overrides(&mut self, args: &CliArgs) {
        if let Some(listen) = &args.listen_addr {
            self.server.listen_addr = listen.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(format!("Invalid listen address: {}", &self.server.listen_addr));
        }
        if self.server.max_conn_num == 0 {
            return Err("max_conn_num must be greater than zero".to_string());
        }
        if self.server.pending_write_num == 0 {
            return Err("pending_write_num must be greater than zero".to_string());
        }

        FrameCodec::new(self.frame.clone()).map_err(|e| format!("Invalid frame settings: {e}"))?;
        self.module
            .validate()
            .map_err(|e| format!("Invalid module settings: {e}"))?;

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {LOG_LEVELS:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}
