//! fleetgatectl - Command line tool for inspecting and controlling a
//! FleetGate cluster.
//!
//! Grounded on the teacher's `bin/wolfctl.rs` (clap subcommand shape,
//! config-derived default endpoint, colored table for `list servers`,
//! best-effort `check-config` linter), adapted to this crate's wire
//! shapes (`NodeStatusBody`, driver device-status map) instead of the
//! teacher's WAL/replication fields.
//!
//! Usage:
//!   fleetgatectl status                 - node + driver status of one node
//!   fleetgatectl list servers            - node-status of every configured peer
//!   fleetgatectl devices                 - device-id -> owning-node map
//!   fleetgatectl device-status <id>      - status of one device
//!   fleetgatectl check-config            - validate a configuration file

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// FleetGate Cluster Control Tool
#[derive(Parser)]
#[command(name = "fleetgatectl")]
#[command(about = "Inspect and control a FleetGate cluster node", long_about = None)]
struct Cli {
    /// Path to config file (used to derive the default endpoint)
    #[arg(short, long, default_value = "fleetgate.toml")]
    config: PathBuf,

    /// API endpoint to connect to, e.g. http://127.0.0.1:8080 (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List cluster peers and their status
    List {
        #[command(subcommand)]
        what: ListSubcommand,
    },
    /// Show cluster + driver status of the queried node
    Status,
    /// Show the device id -> owning node map
    Devices,
    /// Show the status of a single device
    DeviceStatus {
        /// Device id to query
        device_id: String,
    },
    /// Check a configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ListSubcommand {
    /// List all peers configured for this node
    Servers,
}

// ============ API Response Types ============
// Mirrors the wire shapes in cluster::transport::NodeStatusBody and the
// driver REST surface in api::http - deliberately decoupled from the
// library's types so this binary only depends on the HTTP contract.

#[derive(Debug, Deserialize)]
struct NodeStatusResponse {
    node_index: u32,
    role: String,
    activated: bool,
}

#[derive(Debug, Deserialize)]
struct DeviceStatusResponse {
    #[serde(default)]
    code: String,
}

// ============ Config (subset used to derive defaults) ============

#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    node: Option<NodeConfigView>,
    #[serde(default)]
    cluster: Option<ClusterConfigView>,
    #[serde(default)]
    driver: Option<DriverConfigView>,
}

#[derive(Debug, Deserialize)]
struct NodeConfigView {
    index: Option<u32>,
    target_urls: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ClusterConfigView {
    bind_address: Option<String>,
    base_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriverConfigView {
    base_path: Option<String>,
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let loaded_config = std::fs::read_to_string(&cli.config)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok());

    let endpoint = match &cli.endpoint {
        Some(e) => e.clone(),
        None => endpoint_from_config(loaded_config.as_ref()),
    };
    let cluster_base = loaded_config
        .as_ref()
        .and_then(|c| c.cluster.as_ref())
        .and_then(|c| c.base_path.clone())
        .unwrap_or_else(|| "/cluster".to_string());
    let driver_base = loaded_config
        .as_ref()
        .and_then(|c| c.driver.as_ref())
        .and_then(|d| d.base_path.clone())
        .unwrap_or_else(|| "/driver".to_string());

    let result = match &cli.command {
        Commands::List { what } => match what {
            ListSubcommand::Servers => list_servers(loaded_config.as_ref(), &cluster_base).await,
        },
        Commands::Status => show_status(&endpoint, &cluster_base, &driver_base).await,
        Commands::Devices => list_devices(&endpoint, &driver_base).await,
        Commands::DeviceStatus { device_id } => device_status(&endpoint, &driver_base, device_id).await,
        Commands::CheckConfig { file } => {
            let config_path = file.clone().unwrap_or_else(|| cli.config.clone());
            check_config(&config_path)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn endpoint_from_config(config: Option<&Config>) -> String {
    let bind = config
        .and_then(|c| c.cluster.as_ref())
        .and_then(|c| c.bind_address.clone())
        .unwrap_or_else(default_bind_address);

    if bind.starts_with("0.0.0.0") {
        format!("http://127.0.0.1:{}", bind.split(':').nth(1).unwrap_or("8080"))
    } else {
        format!("http://{}", bind)
    }
}

// ============ Commands ============

async fn show_status(endpoint: &str, cluster_base: &str, driver_base: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();

    let node_status: NodeStatusResponse = client
        .get(format!("{}{}/node-status", endpoint, cluster_base))
        .send()
        .await?
        .json()
        .await?;

    println!();
    println!("Node Status");
    println!("===========");
    println!();
    println!("Node index:   {}", node_status.node_index);
    println!("Role:         {}", node_status.role);
    println!("Activated:    {}", node_status.activated);

    let device_map: HashMap<String, u32> = client
        .get(format!("{}{}/device-id-map", endpoint, driver_base))
        .send()
        .await?
        .json()
        .await?;
    println!();
    println!("Devices owned cluster-wide: {}", device_map.len());
    println!();

    Ok(())
}

async fn list_servers(config: Option<&Config>, cluster_base: &str) -> Result<(), Box<dyn std::error::Error>> {
    let target_urls = config
        .and_then(|c| c.node.as_ref())
        .and_then(|n| n.target_urls.clone())
        .unwrap_or_default();

    if target_urls.is_empty() {
        println!("No peers configured (node.target_urls is empty in the config file).");
        return Ok(());
    }

    let client = reqwest::Client::new();

    println!();
    println!("FleetGate Cluster Status");
    println!("========================");
    println!();
    println!("{:<8} {:<32} {:<10} {:<10}", "INDEX", "ADDRESS", "ROLE", "ACTIVATED");
    println!("{}", "-".repeat(62));

    for url in &target_urls {
        let status_url = format!("{}{}/node-status", url, cluster_base);
        match client.get(&status_url).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<NodeStatusResponse>().await {
                    Ok(status) => {
                        let role_colored = match status.role.as_str() {
                            "LEADER" => format!("\x1b[1;34m{:<10}\x1b[0m", status.role),
                            _ => format!("{:<10}", status.role),
                        };
                        println!(
                            "{:<8} {:<32} {} {:<10}",
                            status.node_index, url, role_colored, status.activated
                        );
                    }
                    Err(_) => println!("{:<8} {:<32} {:<10} {:<10}", "?", url, "BAD_REPLY", "-"),
                }
            }
            _ => {
                println!(
                    "{:<8} {:<32} \x1b[31m{:<10}\x1b[0m {:<10}",
                    "?", url, "OFFLINE", "-"
                );
            }
        }
    }
    println!();

    Ok(())
}

async fn list_devices(endpoint: &str, driver_base: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let url = format!("{}{}/device-id-map", endpoint, driver_base);
    let response = client.get(&url).send().await?;

    if !response.status().is_success() {
        return Err(format!("API error: {}", response.status()).into());
    }

    let device_map: HashMap<String, u32> = response.json().await?;

    println!();
    println!("{:<24} {:<10}", "DEVICE ID", "NODE INDEX");
    println!("{}", "-".repeat(36));
    let mut entries: Vec<_> = device_map.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    for (device_id, node_index) in entries {
        println!("{:<24} {:<10}", device_id, node_index);
    }
    println!();

    Ok(())
}

async fn device_status(endpoint: &str, driver_base: &str, device_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let url = format!("{}{}/device-status/{}", endpoint, driver_base, device_id);
    let response = client.get(&url).send().await?;

    if !response.status().is_success() {
        return Err(format!("API error: {}", response.status()).into());
    }

    let status: DeviceStatusResponse = response.json().await?;
    println!("{}: {}", device_id, status.code);

    Ok(())
}

// ============ Config Check ============

fn check_config(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!();
    println!("FleetGate Configuration Check");
    println!("==============================");
    println!();

    if !path.exists() {
        println!("\x1b[1;31mERROR:\x1b[0m Config file not found: {}", path.display());
        return Ok(());
    }
    println!("\x1b[1;32m\u{2713}\x1b[0m Config file: {}", path.display());

    let content = std::fs::read_to_string(path)?;

    let config: Config = match toml::from_str(&content) {
        Ok(c) => c,
        Err(e) => {
            println!("\x1b[1;31mERROR:\x1b[0m Failed to parse config: {}", e);
            return Ok(());
        }
    };
    println!("\x1b[1;32m\u{2713}\x1b[0m Config file is valid TOML");

    let mut warnings = Vec::new();
    let mut errors = Vec::new();

    match &config.node {
        Some(node) => {
            match node.index {
                Some(0) => errors.push("[node] index must not be 0".to_string()),
                Some(i) => println!("\x1b[1;32m\u{2713}\x1b[0m Node index: {}", i),
                None => errors.push("[node] index is required".to_string()),
            }
            match &node.target_urls {
                Some(urls) if !urls.is_empty() => {
                    println!("\x1b[1;32m\u{2713}\x1b[0m Target URLs: {} configured", urls.len());
                }
                _ => errors.push("[node] target_urls must list every peer including this node".to_string()),
            }
        }
        None => errors.push("[node] section is missing".to_string()),
    }

    match &config.cluster {
        Some(cluster) => {
            if let Some(bind) = &cluster.bind_address {
                if bind.starts_with("127.0.0.1") || bind.starts_with("localhost") {
                    warnings.push(format!(
                        "[cluster] bind_address '{}' only accepts local connections; peers on other hosts will not reach it",
                        bind
                    ));
                }
            }
        }
        None => warnings.push("[cluster] section not set, defaults will be used".to_string()),
    }

    if config.driver.is_none() {
        warnings.push("[driver] section not set, defaults will be used".to_string());
    }

    println!();
    if !warnings.is_empty() {
        println!("Warnings ({}):", warnings.len());
        for w in &warnings {
            println!("  \x1b[33m!\x1b[0m  {}", w);
        }
        println!();
    }

    if !errors.is_empty() {
        println!("Errors ({}):", errors.len());
        for e in &errors {
            println!("  \x1b[31m\u{2717}\x1b[0m  {}", e);
        }
        println!();
        println!("\x1b[1;31mConfiguration has errors that must be fixed!\x1b[0m");
    } else {
        println!("\x1b[1;32mConfiguration looks good!\x1b[0m");
    }
    println!();

    Ok(())
}
