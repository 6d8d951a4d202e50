//! REST sink (§4.H): load-balanced POST across a set of target URLs.
//!
//! Reuses `cluster::transport::LoadBalancedClient` (§4.A's shuffled-
//! permutation/fail-skip wrapper) rather than reimplementing it — the same
//! "route around a flaky peer" rationale applies to a fleet of REST
//! collectors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cluster::transport::LoadBalancedClient;
use crate::error::{Error, Result};
use crate::model::{Response, Status};
use crate::sink::{format_response, format_status, Sink};

pub struct RestSink {
    http: reqwest::Client,
    lb: Arc<LoadBalancedClient>,
    response_template: String,
    status_template: String,
}

impl RestSink {
    pub fn new(target_urls: Vec<String>, response_template: String, status_template: String) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            lb: LoadBalancedClient::new(target_urls, 3),
            response_template,
            status_template,
        }
    }

    async fn post(&self, body: String) -> Result<()> {
        let Some(idx) = self.lb.pick().await else {
            return Err(Error::Config("rest sink has no target urls configured".into()));
        };
        let url = &self.lb.urls()[idx];
        match self.http.post(url).body(body).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.lb.report_success(idx).await;
                Ok(())
            }
            Ok(resp) => {
                self.lb.report_failure(idx).await;
                Err(Error::Network(format!("rest sink {url} returned {}", resp.status())))
            }
            Err(e) => {
                self.lb.report_failure(idx).await;
                Err(Error::Http(e))
            }
        }
    }
}

#[async_trait]
impl Sink for RestSink {
    async fn send_response(&self, response: &Response, driver_id: &str, node_index: u32) -> Result<()> {
        self.post(format_response(&self.response_template, response, driver_id, node_index)).await
    }

    async fn send_status(&self, status: &Status, driver_id: &str, node_index: u32) -> Result<()> {
        self.post(format_status(&self.status_template, status, driver_id, node_index)).await
    }
}
