//! EngineNet - demo server and client
//!
//! Runs a fixed-rate simulation loop on the main thread and drives a server
//! or client manager from it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use enginenet::config::{self, Config};
use enginenet::network::{ClientManager, Connection, NetworkConfig, ServerHooks, ServerManager};
use enginenet::protocol::{self, Message, SystemMessage};

/// EngineNet - framed-message networking demo
#[derive(Parser)]
#[command(name = "enginenet")]
#[command(author = "EngineNet Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Run an EngineNet demo server or client", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo server
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run the demo client
    Client {
        /// Server address to connect to
        #[arg(long)]
        host: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Application message types used by the demo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum DemoMessage {
    ServerAccept = protocol::FIRST_APPLICATION_TYPE_ID,
    Ping,
    MessageAll,
    ServerMessage,
}

impl DemoMessage {
    fn type_id(self) -> u32 {
        self as u32
    }

    fn from_type_id(type_id: u32) -> Option<Self> {
        [
            DemoMessage::ServerAccept,
            DemoMessage::Ping,
            DemoMessage::MessageAll,
            DemoMessage::ServerMessage,
        ]
        .into_iter()
        .find(|kind| kind.type_id() == type_id)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Server { port } => {
            run_server(&config, port)?;
        }
        Commands::Client {
            host,
            port,
            duration,
        } => {
            run_client(&config, host, port, duration.map(Duration::from_secs))?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Flag raised on Ctrl-C
fn shutdown_flag() -> anyhow::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let raised = flag.clone();
    std::thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    raised.store(true, Ordering::SeqCst);
                }
            });
        })?;

    Ok(flag)
}

fn tick_period(config: &Config) -> Duration {
    Duration::from_secs(1) / config.server.tick_rate_hz.max(1)
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Server side of the demo
struct DemoServer;

impl ServerHooks for DemoServer {
    fn on_connect(&self, client: &Arc<Connection>) -> bool {
        let greeting = Message::new(DemoMessage::ServerAccept.type_id());
        if let Err(e) = client.send(greeting) {
            tracing::warn!("Could not greet new client: {}", e);
        }
        true
    }

    fn on_message(&self, server: &ServerManager<Self>, message: Message) {
        let Some(client) = message.owner() else {
            return;
        };

        match DemoMessage::from_type_id(message.type_id()) {
            Some(DemoMessage::Ping) => {
                tracing::debug!("[{}] Server Ping", client.id());
                if let Err(e) = server.message_client(&client, message) {
                    tracing::debug!("Ping reply to {} failed: {}", client.id(), e);
                }
            }
            Some(DemoMessage::MessageAll) => {
                tracing::info!("[{}] Message All", client.id());
                let mut relay = Message::new(DemoMessage::ServerMessage.type_id());
                relay.push(&client.id());
                if let Err(e) = server.message_all_clients(&relay, Some(&client)) {
                    tracing::warn!("Relay failed: {}", e);
                }
            }
            _ => tracing::debug!("[{}] Ignoring {}", client.id(), message),
        }
    }

    fn on_disconnect(&self, client: &Arc<Connection>) {
        tracing::info!("Removing client [{}]", client.id());
    }
}

/// Run the demo server until Ctrl-C
fn run_server(config: &Config, port: Option<u16>) -> anyhow::Result<()> {
    let mut net_config = NetworkConfig::from(config);
    if let Some(port) = port {
        net_config.port = port;
    }

    tracing::info!("Starting EngineNet server '{}'", config.general.name);
    let mut server = ServerManager::new(DemoServer, net_config);
    server.start()?;

    let stop = shutdown_flag()?;
    let tick = tick_period(config);

    while !stop.load(Ordering::SeqCst) {
        let started = Instant::now();
        server.update(config.server.max_messages_per_update);
        std::thread::sleep(tick.saturating_sub(started.elapsed()));
    }

    println!("\nShutting down...");
    server.destroy();
    Ok(())
}

/// Run the demo client until Ctrl-C, disconnect or `duration`
fn run_client(
    config: &Config,
    host: Option<String>,
    port: Option<u16>,
    duration: Option<Duration>,
) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| config.network.host.clone());
    let port = port.unwrap_or(config.network.port);

    let mut client = ClientManager::new(NetworkConfig::from(config));
    client.connect(&host, port)?;

    let stop = shutdown_flag()?;
    let tick = tick_period(config);
    let began = Instant::now();
    let mut last_ping = Instant::now();
    let mut last_broadcast = Instant::now();

    'sim: while !stop.load(Ordering::SeqCst) {
        let started = Instant::now();
        if duration.is_some_and(|d| began.elapsed() >= d) {
            break;
        }

        if client.is_connected() {
            if last_ping.elapsed() >= Duration::from_secs(1) {
                let mut ping = Message::new(DemoMessage::Ping.type_id());
                ping.push(&now_micros());
                if let Err(e) = client.send(ping) {
                    tracing::debug!("Ping not sent: {}", e);
                }
                last_ping = Instant::now();
            }

            if last_broadcast.elapsed() >= Duration::from_secs(3) {
                if let Err(e) = client.send(Message::new(DemoMessage::MessageAll.type_id())) {
                    tracing::debug!("Broadcast not sent: {}", e);
                }
                last_broadcast = Instant::now();
            }
        }

        while let Some(mut message) = client.poll() {
            if let Some(kind) = message.system_kind() {
                match kind {
                    SystemMessage::Connected => tracing::info!("Connected to {}:{}", host, port),
                    SystemMessage::Disconnected => {
                        tracing::info!("Server closed the connection");
                        break 'sim;
                    }
                    SystemMessage::Failed => {
                        tracing::error!("Could not connect to {}:{}", host, port);
                        break 'sim;
                    }
                }
                continue;
            }

            match DemoMessage::from_type_id(message.type_id()) {
                Some(DemoMessage::ServerAccept) => tracing::info!("Server accepted connection"),
                Some(DemoMessage::Ping) => {
                    let sent: u64 = message.pop()?;
                    let rtt = now_micros().saturating_sub(sent);
                    tracing::info!("Ping: {:.3} ms", rtt as f64 / 1000.0);
                }
                Some(DemoMessage::ServerMessage) => {
                    let from: u32 = message.pop()?;
                    tracing::info!("Hello from [{}]", from);
                }
                _ => tracing::debug!("Unhandled {}", message),
            }
        }

        std::thread::sleep(tick.saturating_sub(started.elapsed()));
    }

    client.destroy();
    tracing::info!("Client disconnected");
    Ok(())
}
