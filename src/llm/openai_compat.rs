//! OpenAI-compatible HTTP transport.
//!
//! Speaks the `/chat/completions` and `/embeddings` wire shapes served by
//! OpenAI-compatible gateways. HTTP 429 maps to [`CallError::RateLimited`],
//! the designated retryable class, so the retry executor can tell throttling
//! apart from genuine failures.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{ChatMessage, ChatResponse, EmbeddingResponse, ModelClient, TokenUsage};
use crate::error::CallError;

pub struct OpenAiCompatClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct Embeddings {
    data: Vec<EmbeddingDatum>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        Self {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }
    }
}

impl OpenAiCompatClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    async fn post_json<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, CallError> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::RateLimited(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::Remote(format!("{status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| CallError::Remote(format!("invalid response body: {e}")))
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatResponse, CallError> {
        let completion: ChatCompletion = self
            .post_json("/chat/completions", &ChatRequest { model, messages })
            .await?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(ChatResponse {
            content,
            usage: completion.usage.map(TokenUsage::from),
            cost: None,
        })
    }

    async fn embed(&self, model: &str, input: &[String]) -> Result<EmbeddingResponse, CallError> {
        let embeddings: Embeddings = self
            .post_json("/embeddings", &EmbeddingsRequest { model, input })
            .await?;

        Ok(EmbeddingResponse {
            embeddings: embeddings.data.into_iter().map(|d| d.embedding).collect(),
            usage: embeddings.usage.map(TokenUsage::from),
            cost: None,
        })
    }
}
