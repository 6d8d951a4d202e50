//! Sink adapters (§4.H): format and deliver responses/status to one of
//! file (CSV append), Kafka, REST (load-balanced), or log.
//!
//! Grounded on the teacher's plugin-style `lb.rs`/`network` client reuse for
//! the REST sink and `tracing`-based logging throughout for the log sink;
//! file and Kafka delivery have no teacher counterpart (WolfScale never
//! emits to a CSV file or a message broker) and are built from the `csv`
//! and `rdkafka` crates per DESIGN.md Open Question #5.

mod file;
mod kafka;
mod log_sink;
mod rest;

use async_trait::async_trait;

use crate::config::SinkConfig;
use crate::error::Result;
use crate::model::{Response, Status};

pub use file::FileSink;
pub use kafka::KafkaSink;
pub use log_sink::LogSink;
pub use rest::RestSink;

/// The two deliveries the protocol engine makes to every configured sink
/// (§4.H). Implementations own their own delivery retries, if any; the
/// engine itself treats delivery failures as logged-and-dropped (§4.E
/// "delivery errors are logged, not retried").
#[async_trait]
pub trait Sink: Send + Sync {
    async fn send_response(&self, response: &Response, driver_id: &str, node_index: u32) -> Result<()>;
    async fn send_status(&self, status: &Status, driver_id: &str, node_index: u32) -> Result<()>;
}

/// Substitutes `{deviceId,tagId,value,receivedTime,driverId,nodeIndex}`
/// into a response template (§4.H).
pub fn format_response(template: &str, response: &Response, driver_id: &str, node_index: u32) -> String {
    template
        .replace("{deviceId}", &response.device_id)
        .replace("{tagId}", &response.tag_id)
        .replace("{value}", &response.value)
        .replace("{receivedTime}", &response.received_time.to_string())
        .replace("{driverId}", driver_id)
        .replace("{nodeIndex}", &node_index.to_string())
}

/// Substitutes `{deviceId,status,issuedTime,driverId,nodeIndex}` into a
/// status template (§4.H).
pub fn format_status(template: &str, status: &Status, driver_id: &str, node_index: u32) -> String {
    template
        .replace("{deviceId}", &status.device_id)
        .replace("{status}", &status.code.to_string())
        .replace("{issuedTime}", &status.issued_time.to_string())
        .replace("{driverId}", driver_id)
        .replace("{nodeIndex}", &node_index.to_string())
}

/// Builds the sink implementation for one configured entry.
pub fn build_sink(config: &SinkConfig) -> Result<Box<dyn Sink>> {
    Ok(match config {
        SinkConfig::File { path, response_template, status_template } => {
            Box::new(FileSink::new(path.clone(), response_template.clone(), status_template.clone())?)
        }
        SinkConfig::Kafka { brokers, topic, response_template, status_template } => Box::new(KafkaSink::new(
            brokers.clone(),
            topic.clone(),
            response_template.clone(),
            status_template.clone(),
        )?),
        SinkConfig::Rest { target_urls, response_template, status_template } => Box::new(RestSink::new(
            target_urls.clone(),
            response_template.clone(),
            status_template.clone(),
        )),
        SinkConfig::Log { response_template, status_template } => {
            Box::new(LogSink::new(response_template.clone(), status_template.clone()))
        }
    })
}

/// Fans responses/status out to every configured sink. A failing sink is
/// logged and does not block the others (§4.H best-effort delivery).
pub struct SinkFanout {
    sinks: Vec<Box<dyn Sink>>,
}

impl SinkFanout {
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub async fn send_response(&self, response: &Response, driver_id: &str, node_index: u32) {
        for sink in &self.sinks {
            if let Err(e) = sink.send_response(response, driver_id, node_index).await {
                tracing::warn!(device_id = %response.device_id, error = %e, "sink delivery failed for response");
            }
        }
    }

    pub async fn send_status(&self, status: &Status, driver_id: &str, node_index: u32) {
        for sink in &self.sinks {
            if let Err(e) = sink.send_status(status, driver_id, node_index).await {
                tracing::warn!(device_id = %status.device_id, error = %e, "sink delivery failed for status");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_response_template() {
        let response = Response {
            device_id: "d1".into(),
            tag_id: "t1".into(),
            value: "42".into(),
            received_time: 1000,
        };
        let out = format_response("{deviceId},{tagId},{value},{receivedTime}", &response, "node1", 1);
        assert_eq!(out, "d1,t1,42,1000");
    }

    #[test]
    fn test_format_status_template() {
        let status = Status {
            device_id: "d1".into(),
            code: crate::model::StatusCode::Connected,
            issued_time: 2000,
        };
        let out = format_status("{deviceId},{status},{issuedTime}", &status, "node1", 1);
        assert_eq!(out, "d1,CONNECTED,2000");
    }
}
