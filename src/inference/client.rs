//! OpenAI-compatible inference client.
//!
//! Sends chat completion requests to the configured endpoint and streams back
//! text and tool calls. Walks the fallback chain when a model is unreachable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client as HttpClient;

use super::config::{ModelConfig, ModelsConfig};
use super::errors::InferenceError;
use super::streaming::parse_sse_stream;
use super::types::{ChatCompletionRequest, ModelFragment, ToolDefinition};
use crate::agent_core::types::Transcript;

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout for streaming calls.
///
/// Large transcripts can take a long time before the first token; a short
/// timeout ends the stream silently and looks like an empty answer.
const STREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

// ─── ModelCapability ─────────────────────────────────────────────────────────

/// Fragments of one model turn, in arrival order.
pub type FragmentStream = BoxStream<'static, Result<ModelFragment, InferenceError>>;

/// "Submit a transcript and a tool catalog, receive a stream of fragments."
///
/// An `Err` from `submit` means no turn could be started at all. Errors
/// inside the stream end the turn with what was received so far.
#[async_trait]
pub trait ModelCapability: Send + Sync {
    async fn submit(
        &self,
        system_prompt: &str,
        transcript: &Transcript,
        tools: &[ToolDefinition],
    ) -> Result<FragmentStream, InferenceError>;
}

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for OpenAI-compatible `/chat/completions` endpoints.
///
/// Candidates are the active model followed by the fallback chain. The last
/// model that answered is remembered, so later turns start there.
pub struct InferenceClient {
    http: HttpClient,
    candidates: Vec<(String, ModelConfig)>,
    current: AtomicUsize,
}

impl InferenceClient {
    /// Create a new inference client from the models configuration.
    ///
    /// Does NOT check connectivity; that happens on the first request.
    pub fn from_config(config: &ModelsConfig) -> Result<Self, InferenceError> {
        let candidates = config.candidate_chain();
        let (_, first) = candidates
            .first()
            .ok_or_else(|| InferenceError::ConfigError {
                reason: format!(
                    "active model '{}' not found in config and no fallback available",
                    config.active_model
                ),
            })?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(STREAM_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: first.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            candidates,
            current: AtomicUsize::new(0),
        })
    }

    /// Key of the model the next request starts with.
    pub fn current_model_key(&self) -> &str {
        &self.candidates[self.current_index()].0
    }

    /// Display name of the model the next request starts with.
    pub fn current_model_name(&self) -> &str {
        let (key, model) = &self.candidates[self.current_index()];
        if model.display_name.is_empty() {
            key
        } else {
            &model.display_name
        }
    }

    fn current_index(&self) -> usize {
        self.current.load(Ordering::Relaxed) % self.candidates.len()
    }

    /// Build the request body for one model.
    fn build_request(
        key: &str,
        model: &ModelConfig,
        system_prompt: &str,
        transcript: &Transcript,
        tools: &[ToolDefinition],
    ) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.model_name.clone().unwrap_or_else(|| key.to_string()),
            messages: transcript.to_chat_messages(system_prompt),
            tools: (!tools.is_empty()).then(|| tools.to_vec()),
            tool_choice: (!tools.is_empty()).then(|| "auto".to_string()),
            temperature: model.temperature,
            max_tokens: model.max_tokens,
            stream: true,
        }
    }

    /// Attempt a single streaming request to one model.
    async fn try_stream_request(
        &self,
        model: &ModelConfig,
        body: &ChatCompletionRequest,
    ) -> Result<FragmentStream, InferenceError> {
        let url = format!("{}/chat/completions", model.base_url.trim_end_matches('/'));

        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            max_tokens = body.max_tokens,
            "model request"
        );

        let mut request = self
            .http
            .post(&url)
            .json(body)
            .header("Accept", "text/event-stream");
        if let Some(key) = model.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: STREAM_REQUEST_TIMEOUT.as_secs(),
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        Ok(parse_sse_stream(response.bytes_stream()).boxed())
    }
}

#[async_trait]
impl ModelCapability for InferenceClient {
    async fn submit(
        &self,
        system_prompt: &str,
        transcript: &Transcript,
        tools: &[ToolDefinition],
    ) -> Result<FragmentStream, InferenceError> {
        let start = self.current_index();
        let mut attempted = Vec::new();
        let mut last_error: Option<InferenceError> = None;

        for offset in 0..self.candidates.len() {
            let index = (start + offset) % self.candidates.len();
            let (key, model) = &self.candidates[index];
            let body = Self::build_request(key, model, system_prompt, transcript, tools);

            match self.try_stream_request(model, &body).await {
                Ok(stream) => {
                    if index != start {
                        tracing::info!(model = %key, "switched to fallback model");
                        self.current.store(index, Ordering::Relaxed);
                    }
                    return Ok(stream);
                }
                Err(e) if e.is_retriable() => {
                    tracing::warn!(model = %key, error = %e, "model unavailable, trying next");
                    attempted.push(key.clone());
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(e) = last_error {
            tracing::warn!(error = %e, "every model in the chain failed");
        }
        Err(InferenceError::AllModelsUnavailable { attempted })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn model(port: u16) -> ModelConfig {
        ModelConfig {
            display_name: String::new(),
            base_url: format!("http://127.0.0.1:{port}/v1/"),
            model_name: None,
            api_key: None,
            temperature: 0.2,
            max_tokens: 512,
        }
    }

    fn test_config() -> ModelsConfig {
        let mut models = HashMap::new();
        models.insert("model-a".to_string(), model(9));
        models.insert("model-b".to_string(), model(9));
        ModelsConfig {
            active_model: "model-a".to_string(),
            models,
            fallback_chain: vec!["model-b".to_string()],
        }
    }

    #[test]
    fn test_from_config_selects_active_model() {
        let client = InferenceClient::from_config(&test_config()).unwrap();
        assert_eq!(client.current_model_key(), "model-a");
        assert_eq!(client.current_model_name(), "model-a");
    }

    #[test]
    fn test_from_config_without_models_fails() {
        let config = ModelsConfig {
            active_model: "nope".into(),
            ..Default::default()
        };
        assert!(InferenceClient::from_config(&config).is_err());
    }

    #[test]
    fn test_build_request_includes_tools_and_system_prompt() {
        let transcript = Transcript::new("hello");
        let tools = vec![ToolDefinition::function(
            "jira__get_issue",
            "Fetch an issue",
            serde_json::json!({"type": "object"}),
        )];
        let body =
            InferenceClient::build_request("model-a", &model(9), "system", &transcript, &tools);
        assert_eq!(body.model, "model-a");
        assert_eq!(body.messages.len(), 2);
        assert_eq!(body.tool_choice.as_deref(), Some("auto"));
        assert!(body.stream);

        let none = InferenceClient::build_request("model-a", &model(9), "", &transcript, &[]);
        assert!(none.tools.is_none());
        assert_eq!(none.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_chain_reports_all_attempts() {
        // Port 9 (discard) is closed on test machines
        let client = InferenceClient::from_config(&test_config()).unwrap();
        let err = client
            .submit("", &Transcript::new("hi"), &[])
            .await
            .err()
            .unwrap();
        match err {
            InferenceError::AllModelsUnavailable { attempted } => {
                assert_eq!(attempted, vec!["model-a", "model-b"]);
            }
            other => panic!("expected AllModelsUnavailable, got {other:?}"),
        }
    }
}
