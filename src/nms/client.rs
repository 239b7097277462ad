//! NMS HTTP client.

use super::types::{AckResult, BundleReport, Command, PollResponse};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::time::Duration;
use url::Url;

/// The NMS endpoints the agent talks to.
#[async_trait]
pub trait NmsApi: Send + Sync {
    /// Fetch pending commands for `device_id`. An empty list is a normal outcome.
    async fn poll(&self, device_id: &str, limit: u32) -> Result<Vec<Command>>;

    /// Deliver one acknowledgment. Any non-2xx answer is an error.
    async fn ack(&self, device_id: &str, ack: &AckResult) -> Result<()>;

    /// Report a bundle deployment outcome.
    async fn report_bundle(&self, device_id: &str, report: &BundleReport) -> Result<()>;
}

/// [`NmsApi`] over HTTP with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpNmsClient {
    client: reqwest::Client,
    base: Url,
}

impl HttpNmsClient {
    /// Build a client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot carry a path or the HTTP client
    /// cannot be constructed.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url.trim().trim_end_matches('/'))
            .map_err(|e| AgentError::Config(format!("invalid NMS base URL {base_url:?}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(AgentError::Config(format!("NMS base URL cannot carry a path: {base_url}")));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("scanner-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AgentError::Nms(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| AgentError::Nms("NMS base URL cannot carry a path".to_owned()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post_json<T: serde::Serialize + Sync>(&self, url: Url, body: &T) -> Result<()> {
        let resp = self
            .client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::Nms(format!("POST {url} failed: {e}")))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(AgentError::Nms(format!(
                "POST {url} http={status} body={}",
                crate::identity::truncate(body.trim(), 200)
            )))
        }
    }
}

#[async_trait]
impl NmsApi for HttpNmsClient {
    async fn poll(&self, device_id: &str, limit: u32) -> Result<Vec<Command>> {
        let url = self.endpoint(&["cmd", "poll", device_id])?;
        let resp = self
            .client
            .get(url.clone())
            .query(&[("limit", limit)])
            .send()
            .await
            .map_err(|e| AgentError::Nms(format!("GET {url} failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AgentError::Nms(format!("GET {url} http={status}")));
        }
        let body: PollResponse = resp
            .json()
            .await
            .map_err(|e| AgentError::Nms(format!("poll response is not valid JSON: {e}")))?;
        Ok(body.into_commands())
    }

    async fn ack(&self, device_id: &str, ack: &AckResult) -> Result<()> {
        let url = self.endpoint(&["cmd", "ack", device_id])?;
        self.post_json(url, ack).await
    }

    async fn report_bundle(&self, device_id: &str, report: &BundleReport) -> Result<()> {
        let url = self.endpoint(&["bootstrap", "report", device_id])?;
        self.post_json(url, report).await
    }
}
