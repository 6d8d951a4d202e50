//! FleetGate Configuration
//!
//! Configuration structures for the clustered industrial-protocol gateway.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main FleetGate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetGateConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster coordination configuration
    pub cluster: ClusterConfig,

    /// Driver / device ownership configuration
    #[serde(default)]
    pub driver: DriverConfig,

    /// Sink definitions
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's cluster-wide unique index (nodeIndex)
    pub index: u32,

    /// Candidate URLs to probe via GET /index to resolve this node's own URL
    pub target_urls: Vec<String>,

    /// Data directory, used only for CSV sink output files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Cluster coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// HTTP base path for the cluster RPC surface (§6)
    #[serde(default = "default_cluster_base_path")]
    pub base_path: String,

    /// Bind address for the cluster + driver HTTP server
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Heartbeat sending interval
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Seconds without a leader heartbeat before a follower declares the leader lost
    #[serde(default = "default_leader_lost_timeout_secs")]
    pub leader_lost_timeout_secs: u64,

    /// Explicit quorum override; 0 means derive from max observed cluster size
    #[serde(default)]
    pub quorum_override: usize,

    /// Per-call connect timeout for peer RPCs
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-call read timeout for peer RPCs
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Threshold of consecutive failures before a load-balanced client index is skipped
    #[serde(default = "default_lb_fail_threshold")]
    pub lb_fail_threshold: u32,
}

/// Driver / device ownership configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// HTTP base path for the driver REST surface (§6)
    #[serde(default = "default_driver_base_path")]
    pub base_path: String,

    /// Enable balancedConnectAll placement across the live cluster
    #[serde(default = "default_true")]
    pub load_balance: bool,

    /// Seconds to wait for in-flight device disconnects to drain on shutdown
    #[serde(default = "default_drain_seconds")]
    pub drain_seconds: u64,
}

/// A configured sink (file / kafka / rest / log)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    File {
        path: PathBuf,
        #[serde(default = "default_response_template")]
        response_template: String,
        #[serde(default = "default_status_template")]
        status_template: String,
    },
    Kafka {
        brokers: String,
        topic: String,
        #[serde(default = "default_response_template")]
        response_template: String,
        #[serde(default = "default_status_template")]
        status_template: String,
    },
    Rest {
        target_urls: Vec<String>,
        #[serde(default = "default_response_template")]
        response_template: String,
        #[serde(default = "default_status_template")]
        status_template: String,
    },
    Log {
        #[serde(default = "default_response_template")]
        response_template: String,
        #[serde(default = "default_status_template")]
        status_template: String,
    },
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            base_path: default_driver_base_path(),
            load_balance: true,
            drain_seconds: default_drain_seconds(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleetgate")
}

fn default_cluster_base_path() -> String {
    "/cluster".to_string()
}

fn default_driver_base_path() -> String {
    "/driver".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_leader_lost_timeout_secs() -> u64 {
    5
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_read_timeout_ms() -> u64 {
    5000
}

fn default_lb_fail_threshold() -> u32 {
    3
}

fn default_drain_seconds() -> u64 {
    3
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_response_template() -> String {
    "{deviceId},{tagId},{value},{receivedTime}".to_string()
}

fn default_status_template() -> String {
    "{deviceId},{status},{issuedTime}".to_string()
}

impl FleetGateConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetGateConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: FleetGateConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.index == 0 {
            return Err(crate::Error::Config("node.index must be >= 1".into()));
        }
        if self.node.target_urls.is_empty() {
            return Err(crate::Error::Config("node.target_urls cannot be empty".into()));
        }
        Ok(())
    }

    /// Heartbeat sending interval as a Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    /// Leader-lost timeout as a Duration
    pub fn leader_lost_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.leader_lost_timeout_secs)
    }

    /// The "preparing" window observed at startup: 1.5x the leader-lost timeout
    pub fn prepare_duration(&self) -> Duration {
        self.leader_lost_timeout().mul_f64(1.5)
    }

    /// Per-call connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.connect_timeout_ms)
    }

    /// Per-call read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.read_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
index = 1
target_urls = ["http://127.0.0.1:8080", "http://127.0.0.1:8081"]

[cluster]
heartbeat_interval_ms = 500
leader_lost_timeout_secs = 3
"#;

        let config = FleetGateConfig::from_str(toml).unwrap();
        assert_eq!(config.node.index, 1);
        assert_eq!(config.cluster.leader_lost_timeout_secs, 3);
        assert_eq!(config.prepare_duration(), Duration::from_millis(4500));
    }

    #[test]
    fn test_validate_rejects_empty_targets() {
        let toml = r#"
[node]
index = 1
target_urls = []

[cluster]
"#;
        assert!(FleetGateConfig::from_str(toml).is_err());
    }
}
