//! Demo module served behind the gate.
//!
//! Answers `{"cmd":"ping"}` with a `pong` carrying the same sequence number
//! and payload, verifies connections on `{"cmd":"verify"}` and keeps a few
//! counters that are logged periodically and exposed as the `stats` command.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use canopy_network::{AgentHandle, GateEvent, Processor, CLOSE_AGENT, NEW_AGENT};
use canopy_runtime::{
    CommandInfo, Context, CronExpr, Module, ModuleSignal, RpcError, ServerHandle, Skeleton,
    SkeletonConfig,
};

/// Fires every ten seconds.
const STATS_SCHEDULE: &str = "*/10 * * * * *";

/// Client request: `{"cmd":"ping","seq":1,"payload":...}`
#[derive(Debug, Deserialize)]
pub struct Ping {
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize)]
struct Pong<'a> {
    seq: u64,
    payload: &'a Value,
    served: u64,
}

/// Client request: `{"cmd":"verify"}`
#[derive(Debug, Default, Deserialize)]
pub struct Verify {}

/// Messages accepted on the echo module's router.
#[derive(Debug)]
pub enum EchoMsg {
    Ping(Ping, AgentHandle),
    Verify(Verify, AgentHandle),
    Agent(GateEvent),
}

/// Counters owned by the module thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EchoStats {
    pub pings: u64,
    pub payload_bytes: u64,
    pub online: usize,
    pub connected_total: u64,
    pub ticks: u64,
    pub reloads: u64,
}

impl EchoStats {
    fn summary(&self) -> String {
        format!(
            "online={} connected_total={} pings={} payload_bytes={} ticks={} reloads={}",
            self.online, self.connected_total, self.pings, self.payload_bytes, self.ticks, self.reloads
        )
    }
}

pub struct EchoModule {
    skeleton: Option<Skeleton<EchoStats, EchoMsg, ()>>,
    router: ServerHandle<EchoMsg, ()>,
    console: ServerHandle<Vec<String>, String>,
    commands: Vec<CommandInfo>,
    stats: EchoStats,
}

impl EchoModule {
    pub fn new(config: SkeletonConfig) -> Result<Self> {
        let schedule = CronExpr::parse(STATS_SCHEDULE)?;
        let mut skeleton = Skeleton::new("echo", config, EchoStats::default())?;

        skeleton.register_chan_rpc("ping", on_ping)?;
        skeleton.register_chan_rpc("verify", on_verify)?;
        skeleton.register_chan_rpc(NEW_AGENT, on_agent)?;
        skeleton.register_chan_rpc(CLOSE_AGENT, on_agent)?;

        skeleton.register_command("stats", "show connection and request counters", |stats, _ctx, _args| {
            Ok(stats.summary())
        })?;
        skeleton.register_command("ping-count", "show how many pings were answered", |stats, _ctx, _args| {
            Ok(stats.pings.to_string())
        })?;

        skeleton.set_start(move |_stats, ctx| {
            let report = ctx.cron_func(schedule, |stats, _ctx| info!("📊 echo: {}", stats.summary()));
            if let Err(e) = report {
                warn!("echo: statistics timer unavailable: {}", e);
            }
        });
        skeleton.set_update(|stats, _ctx| stats.ticks += 1);
        skeleton.set_reload(|stats, _ctx| {
            stats.reloads += 1;
            info!("🔄 echo reloaded: {}", stats.summary());
        });

        Ok(Self {
            router: skeleton.chan_rpc(),
            console: skeleton.command_handle(),
            commands: skeleton.commands().to_vec(),
            skeleton: Some(skeleton),
            stats: EchoStats::default(),
        })
    }

    pub fn router(&self) -> ServerHandle<EchoMsg, ()> {
        self.router.clone()
    }

    /// Administrative command router.
    pub fn console(&self) -> ServerHandle<Vec<String>, String> {
        self.console.clone()
    }

    pub fn commands(&self) -> &[CommandInfo] {
        &self.commands
    }

    /// Client commands routed to this module.
    pub fn processor(&self) -> Result<Processor> {
        let mut processor = Processor::new();
        processor.register("ping", self.router(), |ping: Ping, agent| EchoMsg::Ping(ping, agent))?;
        processor.register("verify", self.router(), |verify: Verify, agent| EchoMsg::Verify(verify, agent))?;
        Ok(processor)
    }
}

fn on_ping(stats: &mut EchoStats, ctx: &mut Context<EchoStats>, msg: EchoMsg) -> Result<(), RpcError> {
    let EchoMsg::Ping(ping, agent) = msg else {
        return Ok(());
    };
    stats.pings += 1;
    let pong = Pong {
        seq: ping.seq,
        payload: &ping.payload,
        served: stats.pings,
    };
    agent
        .write_json("pong", &pong)
        .map_err(|e| RpcError::Handler(e.to_string()))?;

    let payload = ping.payload;
    let sized = ctx.go(
        move || serde_json::to_vec(&payload).map(|b| b.len()).unwrap_or(0),
        |stats, _ctx, len| match len {
            Ok(len) => stats.payload_bytes += len as u64,
            Err(e) => warn!("echo: payload sizing failed: {}", e),
        },
    );
    if let Err(e) = sized {
        debug!("echo: skipping payload accounting: {}", e);
    }
    Ok(())
}

fn on_verify(_stats: &mut EchoStats, _ctx: &mut Context<EchoStats>, msg: EchoMsg) -> Result<(), RpcError> {
    if let EchoMsg::Verify(_, agent) = msg {
        agent.verify();
        agent
            .write_json("verified", &())
            .map_err(|e| RpcError::Handler(e.to_string()))?;
    }
    Ok(())
}

fn on_agent(stats: &mut EchoStats, _ctx: &mut Context<EchoStats>, msg: EchoMsg) -> Result<(), RpcError> {
    match msg {
        EchoMsg::Agent(GateEvent::Connected(agent)) => {
            stats.online += 1;
            stats.connected_total += 1;
            debug!("echo: agent {} connected from {}", agent.id(), agent.remote_addr());
        }
        EchoMsg::Agent(GateEvent::Closed(agent)) => {
            stats.online = stats.online.saturating_sub(1);
            debug!("echo: agent {} left", agent.id());
        }
        _ => {}
    }
    Ok(())
}

#[async_trait]
impl Module for EchoModule {
    fn name(&self) -> &str {
        "echo"
    }

    async fn run(&mut self, signal: ModuleSignal) {
        if let Some(skeleton) = self.skeleton.take() {
            self.stats = skeleton.run(signal).await;
        }
    }

    async fn on_destroy(&mut self) {
        info!("📊 echo final: {}", self.stats.summary());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use canopy_network::{FrameCodec, FrameConfig, Gate, TcpClient, TcpClientConfig, TcpServerConfig};
    use tokio::time::timeout;

    async fn console_until(console: &ServerHandle<Vec<String>, String>, cmd: &'static str, want: &str) {
        timeout(Duration::from_secs(3), async {
            loop {
                let out = console.call(cmd, Vec::new()).await.unwrap();
                if out.contains(want) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} never reported {}", cmd, want));
    }

    #[test]
    fn commands_are_listed_with_help() {
        let echo = EchoModule::new(SkeletonConfig::default()).unwrap();
        let names: Vec<_> = echo.commands().iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["stats", "ping-count"]);
        assert!(echo.commands().iter().all(|c| !c.help.is_empty()));
    }

    #[test]
    fn processor_routes_client_commands() {
        let echo = EchoModule::new(SkeletonConfig::default()).unwrap();
        let processor = echo.processor().unwrap();
        assert!(processor.is_registered("ping"));
        assert!(processor.is_registered("verify"));
        assert!(!processor.is_registered("pong"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ping_round_trip_through_the_gate() {
        let echo = EchoModule::new(SkeletonConfig::default()).unwrap();
        let console = echo.console();
        let codec = Arc::new(FrameCodec::new(FrameConfig::default()).unwrap());
        let server = TcpServerConfig {
            listen_addr: "127.0.0.1:0".into(),
            ..TcpServerConfig::default()
        };
        let mut gate = Gate::new(server, Arc::clone(&codec), echo.processor().unwrap())
            .with_agent_router(echo.router(), EchoMsg::Agent);
        gate.on_init().await.unwrap();
        let addr = gate.local_addr().unwrap();

        let (echo_signal, signal) = ModuleSignal::new();
        let echo_task = tokio::spawn(async move {
            let mut echo = echo;
            echo.run(signal).await;
            echo
        });
        let (gate_signal, signal) = ModuleSignal::new();
        let gate_task = tokio::spawn(async move {
            let mut gate = gate;
            gate.run(signal).await;
        });

        let client = TcpClient::new(TcpClientConfig::new(addr.to_string()), codec);
        let (conn, mut reader) = client.connect().await.unwrap();
        conn.write_msg(&[br#"{"cmd":"ping","seq":3,"payload":{"hello":"world"}}"#]).unwrap();

        let reply = timeout(Duration::from_secs(3), reader.read_msg()).await.unwrap().unwrap();
        let reply: Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(reply["cmd"], "pong");
        assert_eq!(reply["seq"], 3);
        assert_eq!(reply["payload"]["hello"], "world");
        assert_eq!(reply["served"], 1);

        console_until(&console, "stats", "online=1").await;
        console_until(&console, "stats", "payload_bytes=17").await;
        assert_eq!(console.call("ping-count", Vec::new()).await.unwrap(), "1");

        conn.close();
        console_until(&console, "stats", "online=0").await;

        gate_signal.close();
        gate_task.await.unwrap();
        echo_signal.close();
        let mut echo = echo_task.await.unwrap();
        echo.on_destroy().await;
        assert_eq!(echo.stats.pings, 1);
        assert_eq!(echo.stats.connected_total, 1);
    }

    #[tokio::test]
    async fn reload_is_counted() {
        let echo = EchoModule::new(SkeletonConfig::default()).unwrap();
        let console = echo.console();
        let (sender, signal) = ModuleSignal::new();
        let task = tokio::spawn(async move {
            let mut echo = echo;
            echo.run(signal).await;
            echo
        });

        sender.reload();
        console_until(&console, "stats", "reloads=1").await;
        sender.close();
        let echo = task.await.unwrap();
        assert_eq!(echo.stats.reloads, 1);
    }
}
