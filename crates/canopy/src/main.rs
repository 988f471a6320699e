//! Canopy server entry point.
//!
//! Loads the configuration, wires the echo module behind a TCP gate and
//! keeps both running until the process is told to stop. SIGHUP re-reads
//! the configuration file, applies its log level and reloads the modules.

mod cli;
mod config;
mod echo;
mod logging;
mod signals;

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use canopy_network::{FrameCodec, Gate};
use canopy_runtime::{ModuleManager, ServerHandle};

use cli::CliArgs;
use config::AppConfig;
use echo::{EchoModule, EchoMsg};
use logging::LogHandle;
use signals::{ProcessSignal, SignalListener};

/// Main application struct tying configuration, logging and modules together.
struct Application {
    args: CliArgs,
    config: AppConfig,
    logs: LogHandle,
    modules: ModuleManager,
    console: ServerHandle<Vec<String>, String>,
}

impl Application {
    fn new(args: CliArgs, config: AppConfig, logs: LogHandle) -> Result<Self> {
        let codec = Arc::new(FrameCodec::new(config.frame.clone())?);
        let echo = EchoModule::new(config.module.clone())?;
        let console = echo.console();
        for command in echo.commands() {
            debug!("command {}: {}", command.name, command.help);
        }

        let gate = Gate::new(config.server.clone(), codec, echo.processor()?)
            .with_agent_router(echo.router(), EchoMsg::Agent);

        // Torn down in reverse, so the gate stops accepting before echo stops.
        let mut modules = ModuleManager::new();
        modules.register(echo);
        modules.register(gate);

        Ok(Self {
            args,
            config,
            logs,
            modules,
            console,
        })
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = SignalListener::new()?;

        info!("🌟 Starting canopy v{}", env!("CARGO_PKG_VERSION"));
        info!("  🌐 Listen address: {}", self.config.server.listen_addr);
        info!("  🔌 Max connections: {}", self.config.server.max_conn_num);
        info!("  🔐 Encrypted frames: {}", self.config.frame.encrypt);
        info!("  🔧 Log level: {}", self.logs.level());

        if let Err(e) = self.modules.init().await {
            error!("❌ Startup failed: {}", e);
            self.modules.destroy().await;
            return Err(e.into());
        }
        info!("✅ canopy is running");

        loop {
            match signals.recv().await? {
                ProcessSignal::Reload => self.reload().await,
                ProcessSignal::Shutdown => break,
            }
        }

        info!("🛑 Shutting down");
        self.modules.destroy().await;
        info!("✅ canopy stopped");
        Ok(())
    }

    /// Re-reads the configuration file. Only the log level takes effect
    /// without a restart; the modules get their reload hook.
    async fn reload(&mut self) {
        match AppConfig::load_from_file(&self.args.config_path).await {
            Ok(mut config) => {
                config.apply_overrides(&self.args);
                match config.validate() {
                    Ok(()) => {
                        if let Err(e) = self.logs.set_level(&config.logging.level) {
                            warn!("⚠️ Could not change log level: {}", e);
                        }
                        self.config = config;
                    }
                    Err(e) => warn!("⚠️ Ignoring invalid configuration: {}", e),
                }
            }
            Err(e) => warn!("⚠️ Could not reload configuration: {:#}", e),
        }

        self.modules.reload();
        match self.console.call("stats", Vec::new()).await {
            Ok(stats) => info!("📊 echo: {}", stats),
            Err(e) => debug!("echo statistics unavailable: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = AppConfig::load_from_file(&args.config_path).await?;
    config.apply_overrides(&args);
    config
        .validate()
        .map_err(|e| anyhow!("Configuration validation failed: {}", e))?;

    let logs = logging::setup_logging(&config.logging)?;
    info!("📂 Config: {}", args.config_path.display());

    Application::new(args, config, logs)?.run().await
}
