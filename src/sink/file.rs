//! File sink (§4.H): CSV append to a configured path. The only form of
//! persisted state the core keeps (§6 "Persisted state is limited to
//! optional CSV output files for the file sink").

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::{Response, Status};
use crate::sink::{format_response, format_status, Sink};

pub struct FileSink {
    path: PathBuf,
    response_template: String,
    status_template: String,
    writer: Arc<Mutex<()>>,
}

impl FileSink {
    pub fn new(path: PathBuf, response_template: String, status_template: String) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path, response_template, status_template, writer: Arc::new(Mutex::new(())) })
    }

    async fn append_line(&self, formatted: String) -> Result<()> {
        let _guard = self.writer.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
            writer.write_record(formatted.split(',')).map_err(|e| Error::Internal(e.to_string()))?;
            writer.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;
        Ok(())
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn send_response(&self, response: &Response, driver_id: &str, node_index: u32) -> Result<()> {
        self.append_line(format_response(&self.response_template, response, driver_id, node_index)).await
    }

    async fn send_status(&self, status: &Status, driver_id: &str, node_index: u32) -> Result<()> {
        self.append_line(format_status(&self.status_template, status, driver_id, node_index)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_writes_csv_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("responses.csv");
        let sink = FileSink::new(path.clone(), "{deviceId},{value}".into(), "{deviceId},{status}".into()).unwrap();
        let response = Response { device_id: "d1".into(), tag_id: "t1".into(), value: "9".into(), received_time: 1 };
        sink.send_response(&response, "node1", 1).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), "d1,9");
    }
}
