use anyhow::anyhow;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use trafmask::client::{AdaptiveClient, ClientSettings};
use trafmask::config::{Config, DEFAULT_CONFIG_PATH};
use trafmask::logging;
use trafmask::obfuscation::{HeaderMode, ObfuscationConfig, PaddingStrategy};
use trafmask::profile::TrafficProfile;
use trafmask::server::MaskingServer;

/// UDP cover-traffic generator
#[derive(Parser)]
#[command(name = "trafmask")]
#[command(about = "Generates UDP cover traffic that imitates web, video, voip, file and gaming flows")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the masking server
    Server {
        /// IP address to bind
        #[arg(long)]
        host: Option<String>,

        /// UDP port
        #[arg(long)]
        port: Option<u16>,

        /// Fixed target throughput in Mbps
        #[arg(long)]
        mbps: Option<f64>,

        /// Floating throughput lower bound in Mbps
        #[arg(long, requires = "max_mbps")]
        min_mbps: Option<f64>,

        /// Floating throughput upper bound in Mbps
        #[arg(long, requires = "min_mbps")]
        max_mbps: Option<f64>,

        /// Traffic profile for the advanced generator
        #[arg(long, value_enum)]
        profile: Option<TrafficProfile>,

        #[command(flatten)]
        obfuscation: ObfuscationArgs,
    },
    /// Connect as an adaptive client
    Client {
        /// Server IP address or host name
        #[arg(long)]
        server: Option<String>,

        /// Server UDP port
        #[arg(long)]
        port: Option<u16>,

        /// Uplink response ratio (0.0-1.0)
        #[arg(long)]
        response: Option<f64>,

        /// Traffic profile for uplink shaping in advanced mode
        #[arg(long, value_enum)]
        uplink_profile: Option<TrafficProfile>,

        #[command(flatten)]
        obfuscation: ObfuscationArgs,
    },
}

/// Flags shared by both endpoints
#[derive(Args)]
struct ObfuscationArgs {
    /// Enable the full obfuscation pipeline
    #[arg(long)]
    advanced: bool,

    /// Pseudo-header prepended in advanced mode
    #[arg(long, value_enum)]
    header: Option<HeaderMode>,

    /// Padding strategy in advanced mode
    #[arg(long, value_enum)]
    padding: Option<PaddingStrategy>,

    /// MTU for fragmentation in advanced mode
    #[arg(long)]
    mtu: Option<usize>,

    /// Payload entropy level (0.0-1.0)
    #[arg(long)]
    entropy: Option<f64>,

    /// Seconds between stats lines
    #[arg(long)]
    stats_interval: Option<f64>,
}

impl ObfuscationArgs {
    fn apply(&self, obfuscation: &mut ObfuscationConfig) {
        if let Some(header) = self.header {
            obfuscation.header_mode = header;
        }
        if let Some(padding) = self.padding {
            obfuscation.padding_strategy = padding;
        }
        if let Some(mtu) = self.mtu {
            obfuscation.mtu = mtu;
        }
        if let Some(entropy) = self.entropy {
            obfuscation.entropy = entropy;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config first to get logging settings
    let cli = Cli::parse();
    let mut config = Config::load(&cli.config).await?;

    logging::init_logging(
        &config.log_level,
        &config.log_theme_path,
        config.log_to_file,
        config.log_file_path.as_deref(),
    )
    .await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut tasks = JoinSet::new();

    match cli.command {
        Commands::Server {
            host,
            port,
            mbps,
            min_mbps,
            max_mbps,
            profile,
            obfuscation,
        } => {
            let server = &mut config.server;
            if let Some(host) = host {
                server.bind_address = host;
            }
            if let Some(port) = port {
                server.port = port;
            }
            if let Some(mbps) = mbps {
                server.target_mbps = mbps;
            }
            if min_mbps.is_some() {
                server.min_mbps = min_mbps;
                server.max_mbps = max_mbps;
            }
            if let Some(profile) = profile {
                server.profile = profile;
            }
            if obfuscation.advanced {
                server.advanced = true;
            }
            if let Some(interval) = obfuscation.stats_interval {
                server.stats_interval_secs = interval;
            }
            obfuscation.apply(&mut config.obfuscation);
            config.validate()?;

            let server = MaskingServer::bind(config.server.clone(), config.obfuscation.clone(), &config.socket).await?;
            let shutdown = shutdown_tx.clone();
            tasks.spawn(async move { server.run(shutdown).await });
        }
        Commands::Client {
            server,
            port,
            response,
            uplink_profile,
            obfuscation,
        } => {
            let client = &mut config.client;
            if let Some(server) = server {
                client.server_host = server;
            }
            if let Some(port) = port {
                client.server_port = port;
            }
            if let Some(response) = response {
                client.response_ratio = response;
            }
            if let Some(profile) = uplink_profile {
                client.uplink_profile = profile;
            }
            if obfuscation.advanced {
                client.advanced = true;
            }
            if let Some(interval) = obfuscation.stats_interval {
                client.stats_interval_secs = interval;
            }
            obfuscation.apply(&mut config.obfuscation);
            config.validate()?;

            let settings = ClientSettings::builder(config.client.clone())
                .obfuscation(config.obfuscation.clone())
                .build()?;
            let client = AdaptiveClient::connect(settings, &config.socket).await?;
            let shutdown = shutdown_tx.clone();
            tasks.spawn(async move { client.run(shutdown).await });
        }
    }

    // Spawn signal handler for graceful shutdown
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Signal handler error: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx_clone.send(());
    });

    let mut shutdown_rx = shutdown_tx.subscribe();
    let shutdown_timeout = Duration::from_secs(5);
    let mut deadline: Option<tokio::time::Instant> = None;

    while !tasks.is_empty() {
        tokio::select! {
            Some(result) = tasks.join_next() => {
                match result {
                    Ok(Ok(())) => tracing::info!("Task completed successfully"),
                    Ok(Err(e)) => {
                        tracing::error!("Task error: {}", e);
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::error!("Join error: {}", e);
                        return Err(anyhow!("Task join error: {}", e));
                    }
                }
            }
            _ = shutdown_rx.recv(), if deadline.is_none() => {
                deadline = Some(tokio::time::Instant::now() + shutdown_timeout);
            }
            _ = async {
                if let Some(deadline) = deadline {
                    tokio::time::sleep_until(deadline).await;
                }
            }, if deadline.is_some() => {
                tracing::warn!("Shutdown timeout exceeded, aborting remaining tasks");
                tasks.abort_all();
                break;
            }
        }
    }
    tracing::info!("All tasks completed");

    Ok(())
}
