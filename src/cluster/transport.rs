//! Cluster Transport (§4.A)
//!
//! Typed, stateless HTTP+JSON RPC against peers, plus a load-balanced
//! client wrapper that routes around a flaky peer without removing it.
//! Grounded on the teacher's `network/client.rs` (per-peer reusable client,
//! per-call deadline, no automatic retry) and `lb.rs` (routing that skips
//! unhealthy targets), re-expressed for HTTP+JSON rather than framed TCP.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::model::NodeRole;

/// Wire shape of a heartbeat call (§4.A, §6 PUT /heartbeat/{nodeIndex}/{role}/{lastTransition}).
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct HeartbeatBody {
    pub seq_map: HashMap<u32, u64>,
}

/// Wire shape of GET /node-status.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct NodeStatusBody {
    pub node_index: u32,
    pub role: NodeRole,
    pub activated: bool,
}

/// Wire shape of a merge/delete-to-leader call.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct SharedObjectDelta {
    pub seq: u64,
    pub tree: serde_json::Map<String, serde_json::Value>,
}

/// Wire shape of a delete-to-leader call.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct SharedObjectDeletion {
    pub seq: u64,
    pub paths: Vec<String>,
}

/// Wire shape of GET /get-shared-object[/{nodeIndex}].
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct SharedObjectBody {
    pub seq: u64,
    pub tree: serde_json::Map<String, serde_json::Value>,
}

/// A reusable, per-URL HTTP client for cluster RPC. Mirrors the teacher's
/// single static `reqwest::Client` in `api/http.rs`, parameterized by
/// per-call deadlines instead of one client-wide timeout.
#[derive(Clone)]
pub struct ClusterClient {
    http: reqwest::Client,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl ClusterClient {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .build()
                .expect("failed to build cluster HTTP client"),
            connect_timeout,
            read_timeout,
        }
    }

    fn deadline(&self) -> Duration {
        self.connect_timeout + self.read_timeout
    }

    async fn put<B: Serialize>(&self, url: &str, body: &B) -> Result<()> {
        let resp = tokio::time::timeout(self.deadline(), self.http.put(url).json(body).send())
            .await
            .map_err(|_| Error::ConnectionTimeout(url.to_string()))??;
        resp.error_for_status().map_err(Error::Http)?;
        Ok(())
    }

    async fn delete(&self, url: &str) -> Result<()> {
        let resp = tokio::time::timeout(self.deadline(), self.http.delete(url).send())
            .await
            .map_err(|_| Error::ConnectionTimeout(url.to_string()))??;
        resp.error_for_status().map_err(Error::Http)?;
        Ok(())
    }

    async fn get<R: DeserializeOwned>(&self, url: &str) -> Result<R> {
        let resp = tokio::time::timeout(self.deadline(), self.http.get(url).send())
            .await
            .map_err(|_| Error::ConnectionTimeout(url.to_string()))??;
        Ok(resp.error_for_status().map_err(Error::Http)?.json().await?)
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, url: &str, body: &B) -> Result<R> {
        let resp = tokio::time::timeout(self.deadline(), self.http.post(url).json(body).send())
            .await
            .map_err(|_| Error::ConnectionTimeout(url.to_string()))??;
        Ok(resp.error_for_status().map_err(Error::Http)?.json().await?)
    }

    async fn post_empty<B: Serialize>(&self, url: &str, body: &B) -> Result<()> {
        let resp = tokio::time::timeout(self.deadline(), self.http.post(url).json(body).send())
            .await
            .map_err(|_| Error::ConnectionTimeout(url.to_string()))??;
        resp.error_for_status().map_err(Error::Http)?;
        Ok(())
    }

    pub async fn heartbeat(
        &self,
        base_url: &str,
        from_index: u32,
        role: NodeRole,
        last_transition_ms: i64,
        seq_map: HashMap<u32, u64>,
    ) -> Result<()> {
        let url = format!(
            "{base_url}/heartbeat/{from_index}/{role}/{last_transition_ms}"
        );
        self.put(&url, &HeartbeatBody { seq_map }).await
    }

    pub async fn get_node_status(&self, base_url: &str) -> Result<NodeStatusBody> {
        self.get(&format!("{base_url}/node-status")).await
    }

    pub async fn set_to_leader(&self, base_url: &str) -> Result<()> {
        self.put(&format!("{base_url}/set-to-leader"), &()).await
    }

    pub async fn set_to_follower(&self, base_url: &str) -> Result<()> {
        self.put(&format!("{base_url}/set-to-follower"), &()).await
    }

    pub async fn cluster_deleted(&self, base_url: &str, node_index: u32) -> Result<()> {
        self.delete(&format!("{base_url}/cluster-deleted/{node_index}"))
            .await
    }

    pub async fn remove_shared_object(&self, base_url: &str, node_index: u32) -> Result<()> {
        self.delete(&format!("{base_url}/remove-shared-object/{node_index}"))
            .await
    }

    pub async fn merge_shared_object_to_leader(
        &self,
        base_url: &str,
        sender_index: u32,
        info: SharedObjectDelta,
    ) -> Result<()> {
        self.post_empty(
            &format!("{base_url}/merge-shared-object-to-leader/{sender_index}"),
            &info,
        )
        .await
    }

    pub async fn delete_shared_object_to_leader(
        &self,
        base_url: &str,
        sender_index: u32,
        info: SharedObjectDeletion,
    ) -> Result<()> {
        self.post_empty(
            &format!("{base_url}/delete-shared-object-to-leader/{sender_index}"),
            &info,
        )
        .await
    }

    pub async fn check_merge_shared_object(
        &self,
        base_url: &str,
        node_index: u32,
        info: SharedObjectDelta,
    ) -> Result<bool> {
        self.post(
            &format!("{base_url}/check-merge-shared-object/{node_index}"),
            &info,
        )
        .await
    }

    pub async fn check_delete_shared_object(
        &self,
        base_url: &str,
        node_index: u32,
        info: SharedObjectDeletion,
    ) -> Result<bool> {
        self.post(
            &format!("{base_url}/check-delete-shared-object/{node_index}"),
            &info,
        )
        .await
    }

    pub async fn overwrite_shared_object(
        &self,
        base_url: &str,
        node_index: u32,
        body: SharedObjectBody,
    ) -> Result<()> {
        self.post_empty(
            &format!("{base_url}/overwrite-shared-object/{node_index}"),
            &body,
        )
        .await
    }

    pub async fn sync_shared_object(
        &self,
        base_url: &str,
        sender_index: u32,
        full_map: HashMap<u32, SharedObjectBody>,
        seq_map: HashMap<u32, u64>,
    ) -> Result<()> {
        #[derive(Serialize)]
        struct SyncBody {
            full_map: HashMap<u32, SharedObjectBody>,
            seq_map: HashMap<u32, u64>,
        }
        self.post_empty(
            &format!("{base_url}/sync-shared-object/{sender_index}"),
            &SyncBody { full_map, seq_map },
        )
        .await
    }

    pub async fn get_shared_object(
        &self,
        base_url: &str,
        node_index: Option<u32>,
    ) -> Result<SharedObjectBody> {
        match node_index {
            Some(i) => self.get(&format!("{base_url}/get-shared-object/{i}")).await,
            None => self.get(&format!("{base_url}/get-shared-object")).await,
        }
    }

    pub async fn check_shared_object_seq(
        &self,
        base_url: &str,
        seq_map: HashMap<u32, u64>,
    ) -> Result<Vec<u32>> {
        self.post(&format!("{base_url}/check-shared-object-sequence"), &seq_map)
            .await
    }

    /// `GET /index`, used once at startup to resolve self-URL among
    /// `nodeTargetUrls`.
    pub async fn get_index(&self, base_url: &str) -> Result<u32> {
        let url = format!("{base_url}/index");
        let resp = tokio::time::timeout(self.deadline(), self.http.get(&url).send())
            .await
            .map_err(|_| Error::ConnectionTimeout(url.clone()))??;
        let text = resp.error_for_status().map_err(Error::Http)?.text().await?;
        text.trim()
            .parse()
            .map_err(|_| Error::Internal(format!("bad /index response from {url}: {text:?}")))
    }
}

/// Per-URL-set load-balanced routing. Picks an index via a shuffled
/// permutation; an index's failure counter increments on error up to
/// `fail_threshold`; indices with `failed > 0` are skipped for
/// `skipped < failed` subsequent attempts, then retried. This lets the
/// caller quickly route around a flaky peer without hard-removing it
/// (§4.A rationale).
pub struct LoadBalancedClient {
    urls: Vec<String>,
    fail_threshold: u32,
    state: RwLock<Vec<TargetState>>,
    cursor: AtomicU32,
}

struct TargetState {
    failed: u32,
    skipped: u32,
}

impl LoadBalancedClient {
    pub fn new(urls: Vec<String>, fail_threshold: u32) -> Arc<Self> {
        let state = (0..urls.len())
            .map(|_| TargetState { failed: 0, skipped: 0 })
            .collect();
        Arc::new(Self {
            urls,
            fail_threshold,
            state: RwLock::new(state),
            cursor: AtomicU32::new(0),
        })
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Pick the next index to try: round-robin over a shuffled permutation,
    /// skipping targets currently being penalized.
    pub async fn pick(&self) -> Option<usize> {
        if self.urls.is_empty() {
            return None;
        }
        let mut order: Vec<usize> = (0..self.urls.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        let mut state = self.state.write().await;
        for idx in order {
            let t = &mut state[idx];
            if t.failed == 0 {
                return Some(idx);
            }
            if t.skipped < t.failed {
                t.skipped += 1;
                continue;
            }
            // Served its penalty; give it another chance.
            t.skipped = 0;
            return Some(idx);
        }
        // Everyone is being skipped this round; fall back to the cursor.
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % self.urls.len();
        Some(idx)
    }

    pub async fn report_failure(&self, idx: usize) {
        let mut state = self.state.write().await;
        if let Some(t) = state.get_mut(idx) {
            t.failed = (t.failed + 1).min(self.fail_threshold);
        }
    }

    pub async fn report_success(&self, idx: usize) {
        let mut state = self.state.write().await;
        if let Some(t) = state.get_mut(idx) {
            t.failed = 0;
            t.skipped = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pick_skips_failed_then_retries() {
        let lb = LoadBalancedClient::new(
            vec!["http://a".into(), "http://b".into()],
            2,
        );
        let idx = lb.pick().await.unwrap();
        lb.report_failure(idx).await;
        // Immediately after a failure that index should be skippable at
        // least once (failed=1 > skipped=0).
        for _ in 0..4 {
            let _ = lb.pick().await;
        }
        lb.report_success(idx).await;
        let state = lb.state.read().await;
        assert_eq!(state[idx].failed, 0);
    }

    #[test]
    fn test_split_heartbeat_url_shape() {
        let url = format!("{}/heartbeat/{}/{}/{}", "http://x", 1, NodeRole::Leader, 123);
        assert_eq!(url, "http://x/heartbeat/1/LEADER/123");
    }
}
