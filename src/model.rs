//! Core data model shared across the cluster, driver and protocol layers.
//!
//! §3 DATA MODEL of the specification.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in epoch milliseconds, used for `Response.received_time`
/// and `Status.issued_time` (§3).
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Role of a node in the cluster (§3 Node).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Leader,
    Follower,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Leader => write!(f, "LEADER"),
            NodeRole::Follower => write!(f, "FOLLOWER"),
        }
    }
}

/// Status codes for a device's protocol engine (§3 Status).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Disconnected,
    DisconnectionFail,
    Connecting,
    Connected,
    ConnectionFail,
    ConnectionLost,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusCode::Disconnected => "DISCONNECTED",
            StatusCode::DisconnectionFail => "DISCONNECTION_FAIL",
            StatusCode::Connecting => "CONNECTING",
            StatusCode::Connected => "CONNECTED",
            StatusCode::ConnectionFail => "CONNECTION_FAIL",
            StatusCode::ConnectionLost => "CONNECTION_LOST",
        };
        write!(f, "{}", s)
    }
}

/// A status change emitted to sinks (§3 Status).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub device_id: String,
    pub code: StatusCode,
    pub issued_time: i64,
}

/// A tagged reading emitted to sinks (§3 Response).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub device_id: String,
    pub tag_id: String,
    pub value: String,
    pub received_time: i64,
}

/// Command type (§3 Command).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    ReadRequest,
    WriteRequest,
    Request,
    StartingCommand,
    StoppingCommand,
}

impl CommandType {
    /// Whether this type runs once at CONNECTED (STARTING_*) rather than
    /// periodically or on-demand.
    pub fn is_starting(&self) -> bool {
        matches!(self, CommandType::StartingCommand)
    }

    /// Whether this type runs once on the disconnect path (STOPPING_*).
    pub fn is_stopping(&self) -> bool {
        matches!(self, CommandType::StoppingCommand)
    }

    /// Whether this command blocks for a matching inbound packet.
    pub fn is_read(&self) -> bool {
        matches!(self, CommandType::ReadRequest)
    }

    /// Whether this type can legally be scheduled periodically.
    pub fn is_periodic_eligible(&self) -> bool {
        matches!(
            self,
            CommandType::ReadRequest | CommandType::WriteRequest | CommandType::Request
        )
    }
}

/// Minimum effective period for any period group (§3 I-C1).
pub const MIN_PERIOD_MS: i64 = 500;

/// A single scripted command attached to a device (§3 Command).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub order: i64,
    pub command_type: CommandType,
    /// Negative means non-periodic.
    pub period_group: i64,
    pub request_info: Option<String>,
    pub after_delay_ms: i64,
    pub command_timeout_ms: i64,
    pub cmd_script: Option<String>,
}

impl Command {
    /// max(configured periodGroup, MIN_PERIOD) — the glossary's "effective period".
    pub fn effective_period_ms(&self) -> Option<i64> {
        if self.period_group < 0 || !self.command_type.is_periodic_eligible() {
            None
        } else {
            Some(self.period_group.max(MIN_PERIOD_MS))
        }
    }
}

/// A registered field device (§3 Device).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub group: String,
    pub connection_url: String,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: i64,
    #[serde(default = "default_max_retry_connect")]
    pub max_retry_connect: i64,
    #[serde(default = "default_retry_connect_delay_ms")]
    pub retry_connect_delay_ms: i64,
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: i64,
    #[serde(default)]
    pub initial_command_delay_ms: i64,
    #[serde(default)]
    pub protocol_script: Option<String>,
    #[serde(default)]
    pub commands: Vec<Command>,
    #[serde(default)]
    pub connection_command: bool,
    #[serde(default)]
    pub connection_lost_on_exception: bool,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

fn default_response_timeout_ms() -> i64 {
    0
}
fn default_max_retry_connect() -> i64 {
    3
}
fn default_retry_connect_delay_ms() -> i64 {
    1000
}
fn default_socket_timeout_ms() -> i64 {
    5000
}

/// Device id pattern required by §3: `[A-Za-z0-9_]+`.
pub fn is_valid_device_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A cluster-wide map of device id -> the devices owned by one node, as
/// stored under `sharedObject[nodeIndex].tree["devices"]` (§3 Shared object).
pub type DeviceMap = HashMap<String, Device>;

/// Group devices sharing a non-empty `group` as a single placement unit
/// (§4.D balancedConnectAll). Devices with an empty group are each their
/// own singleton unit.
pub fn group_devices_for_placement(devices: Vec<Device>) -> Vec<Vec<Device>> {
    let mut groups: HashMap<String, Vec<Device>> = HashMap::new();
    let mut singles: Vec<Vec<Device>> = Vec::new();

    for device in devices {
        if device.group.is_empty() {
            singles.push(vec![device]);
        } else {
            groups.entry(device.group.clone()).or_default().push(device);
        }
    }

    let mut units: Vec<Vec<Device>> = groups.into_values().collect();
    units.extend(singles);
    units
}

/// Device ids currently known across the whole cluster, used for duplicate
/// detection in `connectAllToLeader` (§4.D I-D1).
pub fn all_known_ids(device_id_map: &HashMap<u32, DeviceMap>) -> HashSet<String> {
    device_id_map
        .values()
        .flat_map(|m| m.keys().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_pattern() {
        assert!(is_valid_device_id("sensor_1"));
        assert!(!is_valid_device_id(""));
        assert!(!is_valid_device_id("bad id"));
        assert!(!is_valid_device_id("bad-id"));
    }

    #[test]
    fn test_effective_period_coerces_minimum() {
        let cmd = Command {
            id: "c1".into(),
            order: 0,
            command_type: CommandType::ReadRequest,
            period_group: 10,
            request_info: Some("x".into()),
            after_delay_ms: 0,
            command_timeout_ms: 1000,
            cmd_script: Some("f".into()),
        };
        assert_eq!(cmd.effective_period_ms(), Some(MIN_PERIOD_MS));
    }

    #[test]
    fn test_non_periodic_command() {
        let cmd = Command {
            id: "c1".into(),
            order: 0,
            command_type: CommandType::WriteRequest,
            period_group: -1,
            request_info: Some("x".into()),
            after_delay_ms: 0,
            command_timeout_ms: 1000,
            cmd_script: Some("f".into()),
        };
        assert_eq!(cmd.effective_period_ms(), None);
    }

    #[test]
    fn test_group_devices_for_placement() {
        let mk = |id: &str, group: &str| Device {
            id: id.into(),
            group: group.into(),
            connection_url: "dummy://x".into(),
            response_timeout_ms: 0,
            max_retry_connect: 3,
            retry_connect_delay_ms: 1000,
            socket_timeout_ms: 5000,
            initial_command_delay_ms: 0,
            protocol_script: None,
            commands: vec![],
            connection_command: false,
            connection_lost_on_exception: false,
            data: serde_json::Map::new(),
        };
        let devices = vec![mk("a", "g1"), mk("b", "g1"), mk("c", "")];
        let units = group_devices_for_placement(devices);
        assert_eq!(units.len(), 2);
        assert!(units.iter().any(|u| u.len() == 2));
        assert!(units.iter().any(|u| u.len() == 1));
    }
}
