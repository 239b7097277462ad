//! Shared fixtures for the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use scanner_agent::{AgentConfig, AgentContext, Result, ServiceManager};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Records unit calls instead of touching systemd.
#[derive(Default)]
pub struct RecordingServices {
    pub calls: Mutex<Vec<String>>,
}

impl RecordingServices {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceManager for RecordingServices {
    async fn start(&self, unit: &str) -> Result<String> {
        self.calls.lock().unwrap().push(format!("start {unit}"));
        Ok(format!("started {unit}"))
    }

    async fn stop(&self, unit: &str) -> Result<String> {
        self.calls.lock().unwrap().push(format!("stop {unit}"));
        Ok(format!("stopped {unit}"))
    }

    async fn restart(&self, unit: &str) -> Result<String> {
        self.calls.lock().unwrap().push(format!("restart {unit}"));
        Ok(format!("restarted {unit}"))
    }

    async fn is_active(&self, _unit: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Config rooted at `base` with fast retries.
pub fn config(base: &Path, nms_url: &str) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.paths.base_dir = base.to_path_buf();
    config.nms.base_url = nms_url.to_owned();
    config.nms.http_timeout_sec = 2;
    config.nms.ack_retry_delay_ms = 1;
    config.bundle.fetch_timeout_sec = 2;
    config
}

pub fn context(config: AgentConfig) -> (Arc<AgentContext>, Arc<RecordingServices>) {
    let services = Arc::new(RecordingServices::default());
    let ctx = AgentContext::with_services(config, services.clone()).unwrap();
    (Arc::new(ctx), services)
}

/// Build a ZIP payload in memory.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, data) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap().into_inner()
}
