//! External inference backends for the model router (model router, external
//! inference interface). Concrete cloud backends beyond a single
//! OpenAI-compatible HTTP client are out of scope; the router only needs a
//! uniform seam to call whichever backend a model tier resolves to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub text: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> anyhow::Result<CompletionOutcome>;
}

/// Talks to any OpenAI-compatible `/chat/completions` endpoint: local Ollama
/// servers and most hosted model gateways implement this surface.
pub struct HttpInferenceClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpInferenceClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> anyhow::Result<CompletionOutcome> {
        let wire_messages = messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect::<Vec<_>>();

        let mut req = self.client.post(format!("{}/chat/completions", self.base_url)).json(&json!({
            "model": model,
            "messages": wire_messages,
            "stream": false,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?;
        let status = response.status();
        let value: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let detail = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("provider request failed");
            anyhow::bail!("inference backend error ({}): {}", status, detail);
        }

        let text = value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let usage = value.get("usage").map(|u| TokenUsage {
            prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            completion_tokens: u.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        }).unwrap_or_default();

        Ok(CompletionOutcome { text, usage })
    }
}

/// Deterministic backend used by tests and as the degraded-mode fallback
/// when every configured tier has tripped its cooldown.
pub struct EchoInferenceClient;

#[async_trait]
impl InferenceClient for EchoInferenceClient {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> anyhow::Result<CompletionOutcome> {
        let last = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        Ok(CompletionOutcome {
            text: format!("[{model}] {last}"),
            usage: TokenUsage::default(),
        })
    }
}

/// Backend that always fails, used by router tests exercising cooldown and
/// exhaustion paths.
pub struct AlwaysFailInferenceClient;

#[async_trait]
impl InferenceClient for AlwaysFailInferenceClient {
    async fn complete(&self, _model: &str, _messages: &[ChatMessage]) -> anyhow::Result<CompletionOutcome> {
        anyhow::bail!("backend unavailable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_client_prefixes_model_name() {
        let client = EchoInferenceClient;
        let out = client
            .complete("local-small", &[ChatMessage { role: "user".into(), content: "hi".into() }])
            .await
            .unwrap();
        assert_eq!(out.text, "[local-small] hi");
    }
}
