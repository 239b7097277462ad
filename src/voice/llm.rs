//! Completion service seam and a Responses-style HTTP client.

use crate::config::LlmConfig;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Request/reply text completion.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Reply to one user utterance.
    async fn complete(&self, user_text: &str) -> Result<String>;
}

/// Conversation continuity kept between exchanges and restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmState {
    pub previous_response_id: Option<String>,
    pub session_id: Option<String>,
    pub updated_at: Option<String>,
}

impl LlmState {
    /// Missing or unreadable state starts a fresh conversation.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let mut state: Self = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        if state.previous_response_id.as_deref().is_some_and(|id| !is_safe_id(id)) {
            state.previous_response_id = None;
        }
        state
    }

    fn save(&mut self, path: &Path) {
        self.updated_at = Some(crate::timefmt::now_string());
        let result = serde_json::to_vec_pretty(self)
            .map_err(std::io::Error::other)
            .and_then(|json| crate::fsutil::write_atomic(path, &json));
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "cannot save LLM state");
        }
    }
}

fn is_safe_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Join every `output[].content[type=output_text].text`.
fn extract_output_text(body: &Value) -> String {
    body.get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter(|c| c.get("type").and_then(Value::as_str) == Some("output_text"))
        .filter_map(|c| c.get("text").and_then(Value::as_str))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Failed attempt; the status is kept to decide on the stale-id retry.
struct Failure {
    status: Option<u16>,
    detail: String,
}

/// [`CompletionClient`] for a Responses-style endpoint.
#[derive(Debug, Clone)]
pub struct ResponsesClient {
    http: reqwest::Client,
    config: LlmConfig,
    api_key_file: PathBuf,
    state_file: PathBuf,
    state_lock: std::sync::Arc<tokio::sync::Mutex<()>>,
}

impl ResponsesClient {
    /// Relative key/state paths resolve against `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not an http(s) URL or the client
    /// cannot be built.
    pub fn new(config: LlmConfig, base_dir: &Path) -> Result<Self> {
        let endpoint = url::Url::parse(&config.endpoint)
            .map_err(|e| AgentError::Config(format!("invalid llm.endpoint: {e}")))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(AgentError::Config("llm.endpoint must be http(s)".to_owned()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_sec))
            .build()
            .map_err(|e| AgentError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            api_key_file: base_dir.join(&config.api_key_file),
            state_file: base_dir.join(&config.state_file),
            http,
            config,
            state_lock: std::sync::Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    fn api_key(&self) -> Result<String> {
        let key = std::fs::read_to_string(&self.api_key_file)
            .map(|s| s.trim().to_owned())
            .unwrap_or_default();
        if key.is_empty() {
            return Err(AgentError::Llm(format!("API key file empty or missing: {}", self.api_key_file.display())));
        }
        Ok(key)
    }

    fn payload(&self, user_text: &str, previous: Option<&str>) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "input": [
                {"role": "system", "content": self.config.system_prompt},
                {"role": "user", "content": user_text},
            ],
            "max_output_tokens": self.config.max_output_tokens,
            "temperature": self.config.temperature,
        });
        if let Some(prev) = previous {
            body["previous_response_id"] = json!(prev);
        }
        if !self.config.session_id.is_empty() {
            body["metadata"] = json!({"session_id": self.config.session_id});
        }
        body
    }

    async fn send(&self, key: &str, body: &Value) -> std::result::Result<Value, Failure> {
        let resp = self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(key)
            .json(body)
            .send()
            .await
            .map_err(|e| Failure {
                status: None,
                detail: if e.is_timeout() {
                    format!("LLM request exceeded {}s", self.config.timeout_sec)
                } else {
                    format!("LLM request failed: {e}")
                },
            })?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Failure {
                status: Some(status.as_u16()),
                detail: format!(
                    "LLM http={} body={}",
                    status.as_u16(),
                    crate::identity::truncate(&text.replace('\n', " "), 400)
                ),
            });
        }
        resp.json::<Value>().await.map_err(|e| Failure {
            status: Some(status.as_u16()),
            detail: format!("LLM returned invalid JSON: {e}"),
        })
    }
}

#[async_trait]
impl CompletionClient for ResponsesClient {
    async fn complete(&self, user_text: &str) -> Result<String> {
        let user_text = user_text.trim();
        if user_text.is_empty() {
            return Ok(String::new());
        }
        let key = self.api_key()?;
        let _guard = self.state_lock.lock().await;
        let mut state = LlmState::load(&self.state_file);
        let previous = state.previous_response_id.clone();

        let mut result = self.send(&key, &self.payload(user_text, previous.as_deref())).await;
        if previous.is_some() && matches!(result, Err(Failure { status: Some(400), .. })) {
            tracing::info!("LLM rejected previous_response_id; retrying without it");
            state.previous_response_id = None;
            state.save(&self.state_file);
            result = self.send(&key, &self.payload(user_text, None)).await;
        }
        let body = result.map_err(|f| AgentError::Llm(f.detail))?;

        if let Some(id) = body.get("id").and_then(Value::as_str).filter(|id| is_safe_id(id)) {
            state.previous_response_id = Some(id.to_owned());
        }
        if !self.config.session_id.is_empty() {
            state.session_id = Some(self.config.session_id.clone());
        }
        state.save(&self.state_file);

        let text = extract_output_text(&body);
        Ok(if text.is_empty() { self.config.empty_reply.clone() } else { text })
    }
}
