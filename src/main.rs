//! FleetGate - Clustered Industrial-Protocol Gateway
//!
//! Runs one node of the cluster: coordination plane, device-ownership
//! driver, and the combined cluster/driver HTTP surface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleetgate::cluster::transport::ClusterClient;
use fleetgate::cluster::{ClusterService, Redirector};
use fleetgate::command::{CommandRuntime, RhaiEvaluator};
use fleetgate::config::FleetGateConfig;
use fleetgate::error::{Error, Result};
use fleetgate::sink::{build_sink, SinkFanout};

/// FleetGate - Clustered Industrial-Protocol Gateway
#[derive(Parser)]
#[command(name = "fleetgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "fleetgate.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the FleetGate node
    Start,

    /// Check cluster + driver status
    Status {
        /// Node address to query (defaults to localhost)
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "fleetgate.toml")]
        output: PathBuf,

        /// Node index
        #[arg(long, default_value_t = 1)]
        node_index: u32,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Init { output, node_index } => run_init(output, node_index),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the FleetGate node
async fn run_start(config_path: PathBuf) -> Result<()> {
    println!(
        r#"
 ▄████ ██      ▓████▒ ▓████▒▄▄▄█████▓  ▄████  ▄▄▄     ▄▄▄█████▓▓█████
▓█   ▀ ▓█      ▓█   ▀ ▓█   ▀ ▓  ██▒ ▓▒▒██▀ ▀█ ▒████▄   ▓  ██▒ ▓▒▓█   ▀
▒███   ▓█      ▒███   ▒███   ▒ ▓██░ ▒░▒▓█    ▄▒██  ▀█▄ ▒ ▓██░ ▒░▒███
▒▓█  ▄ ▓█      ▒▓█  ▄ ▒▓█  ▄ ░ ▓██▓ ░ ▒▓▓▄ ▄██░██▄▄▄▄██░ ▓██▓ ░ ▒▓█  ▄
░▒████▒▓████▒░▒████▒░▒████▒ ▒██▒ ░ ▒ ▓███▀ ░▓█   ▓██▒ ▒██▒ ░ ░▒████▒
                                  GATE
"#
    );

    tracing::info!("starting fleetgate node");

    let config = match FleetGateConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    tracing::info!(node_index = config.node.index, "loaded configuration");

    std::fs::create_dir_all(&config.node.data_dir)?;

    let config = Arc::new(config);
    let cluster = ClusterService::new(config.clone());
    cluster.start();

    let transport = ClusterClient::new(config.connect_timeout(), config.read_timeout());
    let redirector = Arc::new(Redirector::new(cluster.clone(), transport));

    let sinks: Vec<_> = config
        .sinks
        .iter()
        .map(build_sink)
        .collect::<fleetgate::error::Result<_>>()?;
    tracing::info!(count = sinks.len(), "configured sinks");
    let sinks = Arc::new(SinkFanout::new(sinks));

    let command_runtime = Arc::new(CommandRuntime::new(Arc::new(RhaiEvaluator::new())));

    let driver = fleetgate::driver::DriverService::new(&config, cluster.clone(), redirector, command_runtime, sinks);
    driver.start();

    let app = axum::Router::new()
        .nest(&config.cluster.base_path, fleetgate::cluster::api::router(cluster.clone()))
        .nest(&config.driver.base_path, fleetgate::api::driver_router(driver.clone(), cluster.clone()));

    let listener = tokio::net::TcpListener::bind(&config.cluster.bind_address)
        .await
        .map_err(Error::Io)?;
    tracing::info!(address = %config.cluster.bind_address, "listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let shutdown_tx = std::sync::Mutex::new(Some(shutdown_tx));
    ctrlc::set_handler(move || {
        if let Some(tx) = shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    })
    .map_err(|e| Error::Internal(e.to_string()))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("shutdown signal received, draining");
        })
        .await
        .map_err(Error::Io)?;

    match tokio::time::timeout(Duration::from_secs(config.driver.drain_seconds), driver.disconnect_all()).await {
        Ok(_) => tracing::info!("drained all devices"),
        Err(_) => tracing::warn!(seconds = config.driver.drain_seconds, "drain timed out"),
    }

    Ok(())
}

/// Query cluster + driver status over HTTP
async fn run_status(address: String) -> Result<()> {
    let cluster_url = format!("http://{}/cluster/node-status", address);
    let driver_url = format!("http://{}/driver/device-status", address);

    let cluster_status: serde_json::Value = reqwest::get(&cluster_url)
        .await
        .map_err(|e| Error::Network(e.to_string()))?
        .json()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    println!("Cluster status:");
    println!("{}", serde_json::to_string_pretty(&cluster_status).unwrap());

    let device_status: serde_json::Value = reqwest::get(&driver_url)
        .await
        .map_err(|e| Error::Network(e.to_string()))?
        .json()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    println!("\nDevice status:");
    println!("{}", serde_json::to_string_pretty(&device_status).unwrap());

    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_index: u32) -> Result<()> {
    let config_content = format!(
        r#"# FleetGate configuration

[node]
index = {node_index}
target_urls = ["http://127.0.0.1:8080", "http://127.0.0.1:8081", "http://127.0.0.1:8082"]
data_dir = "/var/lib/fleetgate/node-{node_index}"

[cluster]
base_path = "/cluster"
bind_address = "0.0.0.0:8080"
heartbeat_interval_ms = 1000
leader_lost_timeout_secs = 5

[driver]
base_path = "/driver"
load_balance = true
drain_seconds = 3

[logging]
level = "info"
format = "pretty"

# [[sinks]]
# type = "log"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("Edit the file, then start with: fleetgated --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match FleetGateConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  Node index:     {}", config.node.index);
            println!("  Target URLs:    {:?}", config.node.target_urls);
            println!("  Bind address:   {}", config.cluster.bind_address);
            println!("  Sinks:          {}", config.sinks.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = FleetGateConfig::from_file(&config_path)?;

    println!("FleetGate Node Information");
    println!("==========================");
    println!();
    println!("Node index:       {}", config.node.index);
    println!("Target URLs:      {:?}", config.node.target_urls);
    println!("Data directory:   {}", config.node.data_dir.display());
    println!();
    println!("Cluster:");
    println!("  Base path:      {}", config.cluster.base_path);
    println!("  Bind address:   {}", config.cluster.bind_address);
    println!("  Heartbeat:      {} ms", config.cluster.heartbeat_interval_ms);
    println!("  Leader lost:    {} s", config.cluster.leader_lost_timeout_secs);
    println!();
    println!("Driver:");
    println!("  Base path:      {}", config.driver.base_path);
    println!("  Load balance:   {}", config.driver.load_balance);
    println!("  Drain seconds:  {}", config.driver.drain_seconds);
    println!();
    println!("Sinks:            {}", config.sinks.len());

    Ok(())
}
