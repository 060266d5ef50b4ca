//! Model-inference collaborators: the remote-call implementations the
//! execution framework wraps.
//!
//! The framework itself treats results as opaque JSON; this module gives
//! chat-completion and embedding calls their concrete shapes and provides
//! the wrapped operations built on them.

pub mod openai_compat;
pub mod ops;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Token usage reported by the provider for one billable call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
    /// Provider-reported cost, when the provider exposes one.
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub embeddings: Vec<Vec<f32>>,
    pub usage: Option<TokenUsage>,
    pub cost: Option<f64>,
}

/// A model-inference provider. Implementations are plain transports; the
/// caching, pacing, retry, and accounting pipeline lives in
/// [`ops::ModelOps`].
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatResponse, CallError>;

    async fn embed(&self, model: &str, input: &[String]) -> Result<EmbeddingResponse, CallError>;
}
