use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One role-tagged prompt segment in OpenAI chat-completion shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// The seam between the queue worker and the model endpoint.
///
/// The worker only ever sees this trait, so tests can script completions,
/// failures and delays without a live server.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        max_tokens: u32,
        stop: &[String],
    ) -> Result<String>;

    /// Cheap reachability probe. Defaults to available for backends that
    /// have nothing meaningful to check.
    async fn is_online(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            api_url,
            api_key: api_key.unwrap_or_default(),
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CompletionBackend for LlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        max_tokens: u32,
        stop: &[String],
    ) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            temperature: Some(0.7),
            max_tokens: Some(max_tokens),
            stop: stop.to_vec(),
        };

        let mut req = self.client.post(&url).json(&request);

        // Add API key header if provided (not needed for local models)
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        // Check for HTTP errors and include response body for debugging
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?;

        Ok(strip_reasoning_block(&content).trim().to_string())
    }

    /// Quick reachability probe against the endpoint base URL.
    ///
    /// A local model server that is down fails fast here, so the chat can
    /// answer "offline" instead of queueing a request doomed to time out.
    async fn is_online(&self) -> bool {
        match self
            .client
            .head(&self.api_url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Completion endpoint is offline: {}", e);
                false
            }
        }
    }
}

/// Drop a leading reasoning block some local models emit before the reply.
pub fn strip_reasoning_block(response: &str) -> &str {
    if let Some(think_end) = response.rfind("</think>") {
        &response[think_end + 8..]
    } else {
        response
    }
}
