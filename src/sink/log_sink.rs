//! Log-only sink (§4.H): formats and emits via `tracing`, for local
//! development and as the zero-configuration default.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Response, Status};
use crate::sink::{format_response, format_status, Sink};

pub struct LogSink {
    response_template: String,
    status_template: String,
}

impl LogSink {
    pub fn new(response_template: String, status_template: String) -> Self {
        Self { response_template, status_template }
    }
}

#[async_trait]
impl Sink for LogSink {
    async fn send_response(&self, response: &Response, driver_id: &str, node_index: u32) -> Result<()> {
        tracing::info!(sink = "log", "{}", format_response(&self.response_template, response, driver_id, node_index));
        Ok(())
    }

    async fn send_status(&self, status: &Status, driver_id: &str, node_index: u32) -> Result<()> {
        tracing::info!(sink = "log", "{}", format_status(&self.status_template, status, driver_id, node_index));
        Ok(())
    }
}
