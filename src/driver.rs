//! Driver Service (§4.D): device ownership, placement, and the REST-facing
//! query/command surface built on top of one `ProtocolEngine` per owned
//! device.
//!
//! Grounded on the teacher's `state/membership.rs` (per-node map guarded by
//! a process-wide mutex, the same shape `driver_mutex` plays here) and
//! `network/client.rs` (reusable per-peer `reqwest::Client`, reused below as
//! `DriverClient`); the placement/duplicate-detection logic has no teacher
//! counterpart and is built directly from this spec's §4.D.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::cluster::{ClusterEvent, ClusterService, Redirector};
use crate::command::CommandRuntime;
use crate::config::FleetGateConfig;
use crate::error::{Error, Result};
use crate::model::{group_devices_for_placement, is_valid_device_id, Device, Response, StatusCode};
use crate::protocol::engine::ProtocolEngine;
use crate::sink::SinkFanout;

/// Owns `deviceId -> ProtocolEngine` for the devices placed on this node,
/// plus the last-seen on-demand response table (§4.D).
pub struct DriverService {
    node_index: u32,
    driver_id: String,
    load_balance: bool,
    cluster: Arc<ClusterService>,
    redirector: Arc<Redirector>,
    client: DriverClient,
    command_runtime: Arc<CommandRuntime>,
    sinks: Arc<SinkFanout>,

    engines: RwLock<HashMap<String, Arc<ProtocolEngine>>>,
    responses: RwLock<HashMap<String, HashMap<String, Response>>>,
    connect_all_mutex: Mutex<()>,
    driver_mutex: Mutex<()>,
}

impl DriverService {
    pub fn new(
        config: &FleetGateConfig,
        cluster: Arc<ClusterService>,
        redirector: Arc<Redirector>,
        command_runtime: Arc<CommandRuntime>,
        sinks: Arc<SinkFanout>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_index: config.node.index,
            driver_id: format!("fleetgate-{}", config.node.index),
            load_balance: config.driver.load_balance,
            cluster,
            redirector,
            client: DriverClient::new(config.connect_timeout(), config.read_timeout(), config.driver.base_path.clone()),
            command_runtime,
            sinks,
            engines: RwLock::new(HashMap::new()),
            responses: RwLock::new(HashMap::new()),
            connect_all_mutex: Mutex::new(()),
            driver_mutex: Mutex::new(()),
        })
    }

    pub fn node_index(&self) -> u32 {
        self.node_index
    }

    /// Spawn the cluster-event reaction loop (§4.D "Cluster event wiring").
    /// Call once at startup.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.cluster_event_loop().await });
    }

    async fn cluster_event_loop(self: Arc<Self>) {
        let mut rx = self.cluster.subscribe();
        loop {
            match rx.recv().await {
                Ok(ClusterEvent::Inactivated) => {
                    tracing::warn!("quorum lost, disconnecting all locally owned devices");
                    self.disconnect_all().await;
                }
                Ok(ClusterEvent::ClusterDeleted(node_index, tree)) => {
                    let devices = decode_devices(&tree);
                    if !devices.is_empty() {
                        tracing::info!(node_index, count = devices.len(), "reassigning orphaned devices");
                        if let Err(e) = self.balanced_connect_all(self.node_index, devices).await {
                            tracing::warn!(error = %e, "failed to reassign orphaned devices");
                        }
                    }
                }
                Ok(ClusterEvent::Overwritten(node_index)) => {
                    self.resolve_duplicates(node_index).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "driver event loop lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// `connectAllToLeader` (§4.D): validated registration, forwarded to
    /// whichever node is currently LEADER.
    pub async fn connect_all_to_leader(self: &Arc<Self>, node_index: u32, devices: Vec<Device>) -> Result<HashMap<String, String>> {
        if self.cluster.is_leader().await {
            return self.connect_all_to_leader_local(node_index, devices).await;
        }
        let this = Arc::clone(self);
        self.redirector
            .to_leader("connectAllToLeader", true, move |url_opt| {
                let this = Arc::clone(&this);
                let devices = devices.clone();
                async move {
                    match url_opt {
                        None => this.connect_all_to_leader_local(node_index, devices).await,
                        Some(url) => this.client.connect_all_to_leader(&url, node_index, devices).await,
                    }
                }
            })
            .await
    }

    async fn connect_all_to_leader_local(self: &Arc<Self>, node_index: u32, devices: Vec<Device>) -> Result<HashMap<String, String>> {
        let _guard = self.connect_all_mutex.lock().await;
        let known = self.known_device_ids().await;
        let mut accepted = Vec::new();
        let mut result = HashMap::new();
        for device in devices {
            if !is_valid_device_id(&device.id) {
                result.insert(device.id.clone(), "invalid device id".to_string());
            } else if known.contains(&device.id) {
                result.insert(device.id.clone(), "device already registered".to_string());
            } else {
                accepted.push(device);
            }
        }
        let connected = self.dispatch_to_node(node_index, accepted).await?;
        result.extend(connected);
        Ok(result)
    }

    /// `connectAll` (§4.D): build a `ProtocolEngine` per device, register
    /// the accepted set in the shared object, then connect concurrently.
    pub async fn connect_all(self: &Arc<Self>, devices: Vec<Device>) -> Result<HashMap<String, String>> {
        if devices.is_empty() {
            return Ok(HashMap::new());
        }
        let _guard = self.driver_mutex.lock().await;

        let mut engines = Vec::with_capacity(devices.len());
        for device in &devices {
            let engine = ProtocolEngine::new(
                device.clone(),
                self.node_index,
                self.driver_id.clone(),
                Arc::clone(&self.command_runtime),
                Arc::clone(&self.sinks),
            )?;
            engines.push(engine);
        }

        let mut devices_tree = Map::new();
        for device in &devices {
            devices_tree.insert(device.id.clone(), serde_json::to_value(device).unwrap_or(Value::Null));
        }
        let mut delta = Map::new();
        delta.insert("devices".to_string(), Value::Object(devices_tree));
        self.cluster.merge_shared_object(delta).await?;

        {
            let mut map = self.engines.write().await;
            for engine in &engines {
                map.insert(engine.device_id().to_string(), Arc::clone(engine));
            }
        }

        let results = futures::future::join_all(engines.into_iter().map(|engine| async move {
            let id = engine.device_id().to_string();
            match engine.connect().await {
                Ok(()) => (id, "connected".to_string()),
                Err(e) => (id, e.to_string()),
            }
        }))
        .await;

        Ok(results.into_iter().collect())
    }

    /// `balancedConnectAll` (§4.D): min-priority-queue placement across the
    /// live cluster, group-aware; falls back to routing everything to
    /// `requested_node_index` when load-balancing is disabled or the
    /// cluster has fewer than two members.
    pub async fn balanced_connect_all(self: &Arc<Self>, requested_node_index: u32, devices: Vec<Device>) -> Result<HashMap<String, String>> {
        if devices.is_empty() {
            return Ok(HashMap::new());
        }
        let cluster_size = self.cluster.known_node_indices().await.len();
        if !self.load_balance || cluster_size < 2 {
            return self.dispatch_to_node(requested_node_index, devices).await;
        }

        let counts = self.device_counts_per_node().await;
        let mut heap: BinaryHeap<Reverse<(usize, u32)>> =
            counts.into_iter().map(|(idx, count)| Reverse((count, idx))).collect();
        if heap.is_empty() {
            heap.push(Reverse((0, self.node_index)));
        }

        let units = group_devices_for_placement(devices);
        let mut placement: HashMap<u32, Vec<Device>> = HashMap::new();
        for unit in units {
            let Reverse((count, idx)) = heap.pop().expect("heap seeded above, never empty while units remain");
            let unit_len = unit.len();
            placement.entry(idx).or_default().extend(unit);
            heap.push(Reverse((count + unit_len, idx)));
        }

        let mut result = HashMap::new();
        for (idx, group) in placement {
            let partial = self.dispatch_to_node(idx, group).await?;
            result.extend(partial);
        }
        Ok(result)
    }

    async fn dispatch_to_node(self: &Arc<Self>, node_index: u32, devices: Vec<Device>) -> Result<HashMap<String, String>> {
        if devices.is_empty() {
            return Ok(HashMap::new());
        }
        if node_index == self.node_index {
            self.connect_all(devices).await
        } else {
            self.redirector
                .to_index(node_index, |url| {
                    let devices = devices.clone();
                    async move { self.client.connect_all_to_index(&url, devices).await }
                })
                .await
        }
    }

    /// `disconnectList` (§4.D): group by owning node, disconnect locally
    /// owned ids directly and forward the rest unless `only_self`.
    pub async fn disconnect_list(self: &Arc<Self>, ids: Vec<String>, only_self: bool) -> Result<HashMap<String, String>> {
        let owners = self.owners_for(&ids).await;
        let mut by_owner: HashMap<Option<u32>, Vec<String>> = HashMap::new();
        for id in ids {
            let owner = owners.get(&id).copied();
            by_owner.entry(owner).or_default().push(id);
        }

        let mut result = HashMap::new();
        for (owner, ids) in by_owner {
            match owner {
                None => {
                    for id in ids {
                        result.insert(id, "device not found".to_string());
                    }
                }
                Some(idx) if idx == self.node_index => {
                    result.extend(self.disconnect_local(ids).await);
                }
                Some(idx) => {
                    if only_self {
                        continue;
                    }
                    let outcome = self
                        .redirector
                        .to_index(idx, |url| {
                            let ids = ids.clone();
                            async move { self.client.disconnect_remote(&url, ids, false).await }
                        })
                        .await;
                    match outcome {
                        Ok(partial) => result.extend(partial),
                        Err(e) => {
                            for id in ids {
                                result.insert(id, e.to_string());
                            }
                        }
                    }
                }
            }
        }
        Ok(result)
    }

    async fn disconnect_local(self: &Arc<Self>, ids: Vec<String>) -> HashMap<String, String> {
        let mut result = HashMap::new();
        let mut deleted_paths = Vec::new();
        for id in ids {
            let engine = self.engines.write().await.remove(&id);
            match engine {
                Some(engine) => {
                    engine.disconnect().await;
                    self.command_runtime.forget_device(&id).await;
                    self.responses.write().await.remove(&id);
                    deleted_paths.push(format!("devices.{id}"));
                    result.insert(id, "disconnected".to_string());
                }
                None => {
                    result.insert(id, "device not found".to_string());
                }
            }
        }
        if !deleted_paths.is_empty() {
            if let Err(e) = self.cluster.delete_shared_object(deleted_paths).await {
                tracing::warn!(error = %e, "failed to prune disconnected devices from shared object");
            }
        }
        result
    }

    pub async fn disconnect_all(self: &Arc<Self>) {
        let ids: Vec<String> = self.engines.read().await.keys().cloned().collect();
        if !ids.is_empty() {
            self.disconnect_local(ids).await;
        }
    }

    /// `reconnectAll`: drop and rebuild every locally owned device's
    /// `ProtocolEngine`, e.g. after a device definition changed.
    pub async fn reconnect_all(self: &Arc<Self>) -> Result<HashMap<String, String>> {
        let devices: Vec<Device> = {
            let engines = self.engines.read().await;
            let mut v = Vec::with_capacity(engines.len());
            for engine in engines.values() {
                v.push(engine.device_snapshot().await);
            }
            v
        };
        let ids: Vec<String> = devices.iter().map(|d| d.id.clone()).collect();
        self.disconnect_local(ids).await;
        self.connect_all(devices).await
    }

    async fn resolve_duplicates(self: &Arc<Self>, overwritten_node: u32) {
        let local_ids: HashSet<String> = self.engines.read().await.keys().cloned().collect();
        let body = self.cluster.get_shared_object(Some(overwritten_node)).await;
        let their_ids: HashSet<String> = body
            .tree
            .get("devices")
            .and_then(|v| v.as_object())
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        let duplicates: Vec<String> = local_ids.intersection(&their_ids).cloned().collect();
        if duplicates.is_empty() {
            return;
        }
        tracing::warn!(node_index = overwritten_node, devices = ?duplicates, "duplicate device ownership detected");

        let devices: Vec<Device> = {
            let engines = self.engines.read().await;
            let mut v = Vec::new();
            for id in &duplicates {
                if let Some(engine) = engines.get(id) {
                    v.push(engine.device_snapshot().await);
                }
            }
            v
        };
        self.disconnect_local(duplicates).await;
        if let Err(e) = self.balanced_connect_all(self.node_index, devices).await {
            tracing::warn!(error = %e, "failed to rebalance duplicate devices");
        }
    }

    async fn device_counts_per_node(&self) -> HashMap<u32, usize> {
        let mut counts: HashMap<u32, usize> = HashMap::new();
        for idx in self.cluster.known_node_indices().await {
            counts.insert(idx, 0);
        }
        counts.insert(self.node_index, self.engines.read().await.len());
        for (idx, body) in self.cluster.all_shared_objects().await {
            if idx == self.node_index {
                continue;
            }
            let n = body.tree.get("devices").and_then(|v| v.as_object()).map(|m| m.len()).unwrap_or(0);
            counts.insert(idx, n);
        }
        counts
    }

    /// Device ids known anywhere in the cluster, including locally owned
    /// ones not yet propagated (§4.D I-D1 duplicate check).
    async fn known_device_ids(&self) -> HashSet<String> {
        let mut ids: HashSet<String> = self.engines.read().await.keys().cloned().collect();
        for (idx, body) in self.cluster.all_shared_objects().await {
            if idx == self.node_index {
                continue;
            }
            if let Some(devices) = body.tree.get("devices").and_then(|v| v.as_object()) {
                ids.extend(devices.keys().cloned());
            }
        }
        ids
    }

    async fn owners_for(&self, ids: &[String]) -> HashMap<String, u32> {
        let mut owners = HashMap::new();
        {
            let engines = self.engines.read().await;
            for id in ids {
                if engines.contains_key(id) {
                    owners.insert(id.clone(), self.node_index);
                }
            }
        }
        for (idx, body) in self.cluster.all_shared_objects().await {
            if idx == self.node_index {
                continue;
            }
            if let Some(devices) = body.tree.get("devices").and_then(|v| v.as_object()) {
                for id in ids {
                    if devices.contains_key(id) {
                        owners.entry(id.clone()).or_insert(idx);
                    }
                }
            }
        }
        owners
    }

    /// §7 "status endpoints return DISCONNECTED for unknown devices".
    pub async fn device_status(&self, device_id: &str) -> StatusCode {
        match self.engines.read().await.get(device_id) {
            Some(engine) => engine.status().await,
            None => StatusCode::Disconnected,
        }
    }

    pub async fn device_status_all(&self) -> HashMap<String, StatusCode> {
        let engines = self.engines.read().await;
        let mut result = HashMap::with_capacity(engines.len());
        for (id, engine) in engines.iter() {
            result.insert(id.clone(), engine.status().await);
        }
        result
    }

    pub async fn device_id_map(&self) -> HashMap<u32, Vec<String>> {
        let mut map = HashMap::new();
        map.insert(self.node_index, self.engines.read().await.keys().cloned().collect());
        for (idx, body) in self.cluster.all_shared_objects().await {
            if idx == self.node_index {
                continue;
            }
            let ids = body
                .tree
                .get("devices")
                .and_then(|v| v.as_object())
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default();
            map.insert(idx, ids);
        }
        map
    }

    async fn record_response(&self, response: Response) {
        let mut table = self.responses.write().await;
        table.entry(response.device_id.clone()).or_default().insert(response.tag_id.clone(), response);
    }

    pub async fn last_response(&self, device_id: &str, tag_id: &str) -> Option<Response> {
        self.responses.read().await.get(device_id).and_then(|m| m.get(tag_id)).cloned()
    }

    pub async fn last_responses_for_device(&self, device_id: &str) -> HashMap<String, Response> {
        self.responses.read().await.get(device_id).cloned().unwrap_or_default()
    }

    /// Runs `ids` (empty means the device's full on-demand set) against a
    /// locally owned device. `emit_responses=false` fires without waiting
    /// for the produced responses to be returned to the caller (§6
    /// `execute-commands`/`execute-command-ids`); `true` returns them
    /// synchronously (`request-commands`/`request-command-ids`).
    pub async fn run_commands(self: &Arc<Self>, device_id: &str, ids: Vec<String>, emit_responses: bool) -> Result<Vec<Response>> {
        let engine = {
            let engines = self.engines.read().await;
            engines.get(device_id).cloned().ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?
        };
        let responses = engine.execute_commands(&ids, emit_responses).await?;
        for response in &responses {
            self.record_response(response.clone()).await;
        }
        Ok(responses)
    }
}

fn decode_devices(tree: &Map<String, Value>) -> Vec<Device> {
    let Some(devices) = tree.get("devices").and_then(|v| v.as_object()) else {
        return Vec::new();
    };
    devices
        .values()
        .filter_map(|v| match serde_json::from_value::<Device>(v.clone()) {
            Ok(d) => Some(d),
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode orphaned device record");
                None
            }
        })
        .collect()
}

/// Driver-surface peer RPC client (§6, base path default `/driver`).
/// Mirrors `cluster::transport::ClusterClient`'s reusable-client,
/// per-call-deadline shape.
#[derive(Clone)]
struct DriverClient {
    http: reqwest::Client,
    connect_timeout: Duration,
    read_timeout: Duration,
    base_path: String,
}

#[derive(Serialize, Deserialize)]
struct ConnectAllBody {
    devices: Vec<Device>,
}

#[derive(Serialize, Deserialize)]
struct DisconnectBody {
    ids: Vec<String>,
    only_self: bool,
}

impl DriverClient {
    fn new(connect_timeout: Duration, read_timeout: Duration, base_path: String) -> Self {
        Self {
            http: reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .build()
                .expect("failed to build driver HTTP client"),
            connect_timeout,
            read_timeout,
            base_path,
        }
    }

    fn deadline(&self) -> Duration {
        self.connect_timeout + self.read_timeout
    }

    async fn post(&self, url: &str, body: &impl Serialize) -> Result<HashMap<String, String>> {
        let resp = tokio::time::timeout(self.deadline(), self.http.post(url).json(body).send())
            .await
            .map_err(|_| Error::ConnectionTimeout(url.to_string()))??;
        Ok(resp.error_for_status().map_err(Error::Http)?.json().await?)
    }

    async fn connect_all_to_index(&self, base_url: &str, devices: Vec<Device>) -> Result<HashMap<String, String>> {
        let url = format!("{base_url}{}/connect-all-to-index", self.base_path);
        self.post(&url, &ConnectAllBody { devices }).await
    }

    async fn connect_all_to_leader(&self, base_url: &str, node_index: u32, devices: Vec<Device>) -> Result<HashMap<String, String>> {
        let url = format!("{base_url}{}/connect-all-to-leader/{node_index}", self.base_path);
        self.post(&url, &ConnectAllBody { devices }).await
    }

    async fn disconnect_remote(&self, base_url: &str, ids: Vec<String>, only_self: bool) -> Result<HashMap<String, String>> {
        let url = format!("{base_url}{}/disconnect", self.base_path);
        self.post(&url, &DisconnectBody { ids, only_self }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RhaiEvaluator;
    use crate::config::{ClusterConfig, DriverConfig, LoggingConfig, NodeConfig};

    fn test_config(index: u32) -> Arc<FleetGateConfig> {
        Arc::new(FleetGateConfig {
            node: NodeConfig { index, target_urls: vec!["http://127.0.0.1:9101".into()], data_dir: "/tmp".into() },
            cluster: ClusterConfig {
                base_path: "/cluster".into(),
                bind_address: "0.0.0.0:9101".into(),
                heartbeat_interval_ms: 50,
                leader_lost_timeout_secs: 1,
                quorum_override: 1,
                connect_timeout_ms: 200,
                read_timeout_ms: 200,
                lb_fail_threshold: 3,
            },
            driver: DriverConfig::default(),
            sinks: vec![],
            logging: LoggingConfig::default(),
        })
    }

    fn make_driver(index: u32) -> Arc<DriverService> {
        let config = test_config(index);
        let cluster = ClusterService::new(Arc::clone(&config));
        let redirector = Arc::new(Redirector::new(
            Arc::clone(&cluster),
            crate::cluster::transport::ClusterClient::new(config.connect_timeout(), config.read_timeout()),
        ));
        let command_runtime = Arc::new(CommandRuntime::new(Arc::new(RhaiEvaluator::new())));
        let sinks = Arc::new(SinkFanout::new(vec![]));
        DriverService::new(&config, cluster, redirector, command_runtime, sinks)
    }

    fn dummy_device(id: &str) -> Device {
        Device {
            id: id.into(),
            group: String::new(),
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
        }
    }

    #[tokio::test]
    async fn test_connect_all_registers_and_connects() {
        let driver = make_driver(1);
        let result = driver.connect_all(vec![dummy_device("d1")]).await.unwrap();
        assert_eq!(result.get("d1"), Some(&"connected".to_string()));
        assert_eq!(driver.device_status("d1").await, StatusCode::Connected);
    }

    #[tokio::test]
    async fn test_device_status_unknown_is_disconnected() {
        let driver = make_driver(1);
        assert_eq!(driver.device_status("missing").await, StatusCode::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_list_removes_local_device() {
        let driver = make_driver(1);
        driver.connect_all(vec![dummy_device("d1")]).await.unwrap();
        let result = driver.disconnect_list(vec!["d1".to_string()], true).await.unwrap();
        assert_eq!(result.get("d1"), Some(&"disconnected".to_string()));
        assert_eq!(driver.device_status("d1").await, StatusCode::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_all_to_leader_rejects_duplicate_id() {
        let driver = make_driver(1);
        driver.cluster.transition_to(crate::model::NodeRole::Leader).await;
        driver.connect_all(vec![dummy_device("d1")]).await.unwrap();
        let result = driver.connect_all_to_leader(1, vec![dummy_device("d1")]).await.unwrap();
        assert_eq!(result.get("d1"), Some(&"device already registered".to_string()));
    }

    #[tokio::test]
    async fn test_balanced_connect_all_single_node_routes_to_requested() {
        let driver = make_driver(1);
        let result = driver.balanced_connect_all(1, vec![dummy_device("d1"), dummy_device("d2")]).await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(driver.device_status("d1").await, StatusCode::Connected);
    }
}
