//! Kafka sink (§4.H): publishes formatted responses/status to one topic.
//!
//! No example repo in the pack talks to a message broker; `rdkafka` is the
//! ecosystem-standard client for a tokio host (DESIGN.md Open Question #5).

use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;

use crate::error::{Error, Result};
use crate::model::{Response, Status};
use crate::sink::{format_response, format_status, Sink};

pub struct KafkaSink {
    producer: FutureProducer,
    topic: String,
    response_template: String,
    status_template: String,
}

impl KafkaSink {
    pub fn new(brokers: String, topic: String, response_template: String, status_template: String) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| Error::Config(format!("kafka producer: {e}")))?;
        Ok(Self { producer, topic, response_template, status_template })
    }

    async fn publish(&self, key: &str, payload: String) -> Result<()> {
        let record = FutureRecord::to(&self.topic).key(key).payload(&payload);
        self.producer
            .send(record, Timeout::After(std::time::Duration::from_secs(5)))
            .await
            .map_err(|(e, _)| Error::Network(format!("kafka publish to {:?}: {e}", self.topic)))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Sink for KafkaSink {
    async fn send_response(&self, response: &Response, driver_id: &str, node_index: u32) -> Result<()> {
        let payload = format_response(&self.response_template, response, driver_id, node_index);
        self.publish(&response.device_id, payload).await
    }

    async fn send_status(&self, status: &Status, driver_id: &str, node_index: u32) -> Result<()> {
        let payload = format_status(&self.status_template, status, driver_id, node_index);
        self.publish(&status.device_id, payload).await
    }
}
