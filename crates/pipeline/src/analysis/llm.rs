//! LLM client abstraction
//!
//! Provides a unified interface for chat-completion providers:
//! - OpenAI-compatible `/chat/completions` with JSON response format
//! - Mock client with per-feature canned answers

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use callscope_common::config::LlmConfig;
use callscope_common::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

/// One structured-output request
#[derive(Debug, Clone)]
pub struct LlmRequest<'a> {
    /// Feature slug, used for tracing and by the mock
    pub feature: &'a str,
    pub system: &'a str,
    pub user: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Trait for JSON-mode chat completion
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete_json(&self, request: &LlmRequest<'_>) -> Result<LlmResponse>;

    /// Get the model name
    fn model(&self) -> &str;
}

/// OpenAI chat completion client
pub struct OpenAiChatClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    max_retries: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    response_format: serde_json::Value,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl OpenAiChatClient {
    pub fn new(api_key: String, config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            temperature: config.temperature,
            max_retries: config.max_retries.max(1),
        })
    }

    /// Make request with retry
    async fn request_with_retry(&self, request: &LlmRequest<'_>) -> Result<LlmResponse> {
        let mut last_error = None;

        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_millis(250 * 2_u64.pow(attempt));
                tokio::time::sleep(delay).await;
            }

            match self.make_request(request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        feature = request.feature,
                        error = %e,
                        "LLM request failed, retrying"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| AppError::Llm {
            message: "Unknown error after retries".to_string(),
        }))
    }

    async fn make_request(&self, request: &LlmRequest<'_>) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            response_format: json!({ "type": "json_object" }),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: request.system,
                },
                ChatMessage {
                    role: "user",
                    content: request.user,
                },
            ],
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Llm {
                message: format!("Request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Llm {
                message: format!("API error {}: {}", status, body),
            });
        }

        let result: ChatResponse = response.json().await.map_err(|e| AppError::Llm {
            message: format!("Failed to parse response: {}", e),
        })?;

        let content = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::Llm {
                message: "Empty completion".to_string(),
            })?;
        let usage = result.usage.unwrap_or(ChatUsage {
            prompt_tokens: 0,
            completion_tokens: 0,
        });

        Ok(LlmResponse {
            content,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    async fn complete_json(&self, request: &LlmRequest<'_>) -> Result<LlmResponse> {
        self.request_with_retry(request).await
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Mock LLM for testing
///
/// Answers each feature with a valid sample unless a reply or a failure has
/// been scripted for that feature slug.
#[derive(Default)]
pub struct MockLlm {
    replies: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `content` verbatim for `feature`
    pub fn reply_with(&self, feature: &str, content: &str) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.insert(feature.to_string(), content.to_string());
        }
    }

    /// Fail transport for `feature`
    pub fn fail_feature(&self, feature: &str, fail: bool) {
        if let Ok(mut failing) = self.failing.lock() {
            if fail {
                failing.insert(feature.to_string());
            } else {
                failing.remove(feature);
            }
        }
    }

    pub fn call_count(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, feature: &str) -> usize {
        self.calls
            .lock()
            .ok()
            .and_then(|c| c.get(feature).copied())
            .unwrap_or(0)
    }

    fn sample(feature: &str) -> String {
        let value = match feature {
            "sentiment-analysis" => json!({
                "sentiment": "positive",
                "score": 0.6,
                "customer_emotions": ["satisfied"]
            }),
            "quality-scoring" => json!({
                "overall_score": 82,
                "greeting": 90,
                "empathy": 75,
                "resolution": 80,
                "professionalism": 85,
                "strengths": ["clear greeting"],
                "improvements": ["confirm resolution"]
            }),
            "churn-prediction" => json!({
                "risk_level": "low",
                "probability": 0.1,
                "signals": [],
                "recommended_action": "none"
            }),
            "call-summary" => json!({
                "summary": "Customer called for help.",
                "key_points": ["greeting"],
                "action_items": [],
                "topic": "support"
            }),
            _ => json!({}),
        };
        value.to_string()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete_json(&self, request: &LlmRequest<'_>) -> Result<LlmResponse> {
        self.total.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(request.feature.to_string()).or_default() += 1;
        }

        let failing = self
            .failing
            .lock()
            .map(|f| f.contains(request.feature))
            .unwrap_or(false);
        if failing {
            return Err(AppError::Llm {
                message: format!("mock failure for {}", request.feature),
            });
        }

        let content = self
            .replies
            .lock()
            .ok()
            .and_then(|r| r.get(request.feature).cloned())
            .unwrap_or_else(|| Self::sample(request.feature));

        Ok(LlmResponse {
            content,
            prompt_tokens: 1000,
            completion_tokens: 100,
        })
    }

    fn model(&self) -> &str {
        "mock-llm"
    }
}

/// Create an LLM client based on configuration
pub fn create_llm_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    match (config.provider.as_str(), config.api_key.clone()) {
        ("openai", Some(key)) if !key.is_empty() => Ok(Arc::new(OpenAiChatClient::new(key, config)?)),
        ("openai", _) => {
            warn!("No LLM API key configured, using mock client");
            Ok(Arc::new(MockLlm::new()))
        }
        ("mock", _) => Ok(Arc::new(MockLlm::new())),
        (provider, _) => {
            warn!(provider = provider, "Unknown LLM provider, using mock");
            Ok(Arc::new(MockLlm::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(feature: &'a str) -> LlmRequest<'a> {
        LlmRequest {
            feature,
            system: "instructions",
            user: "transcript",
        }
    }

    #[tokio::test]
    async fn test_mock_answers_and_counts() {
        let llm = MockLlm::new();
        let response = llm.complete_json(&request("call-summary")).await.unwrap();

        let value: serde_json::Value = serde_json::from_str(&response.content).unwrap();
        assert_eq!(value["topic"], "support");
        assert_eq!(llm.calls_for("call-summary"), 1);
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_scripted_reply_and_failure() {
        let llm = MockLlm::new();
        llm.reply_with("sentiment-analysis", "not json");
        llm.fail_feature("churn-prediction", true);

        let reply = llm.complete_json(&request("sentiment-analysis")).await.unwrap();
        assert_eq!(reply.content, "not json");

        let err = llm.complete_json(&request("churn-prediction")).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
