//! Wrapped model operations: chat completion and embedding run through the
//! full derive→limit→retry→log pipeline, plus batch fan-out helpers.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use super::{ChatMessage, ChatResponse, EmbeddingResponse, ModelClient};
use crate::cache::CacheKey;
use crate::call::{CallArgs, CallContext, CallPolicy, CostBreakdown, RemoteCall, Wrapped};
use crate::error::{CallError, Error, Result};
use crate::ledger::CallRecord;
use crate::retry::RetryPolicy;

struct ChatCall {
    client: Arc<dyn ModelClient>,
}

#[async_trait]
impl RemoteCall for ChatCall {
    async fn call(&self, endpoint: &str, args: &CallArgs) -> std::result::Result<Value, CallError> {
        let messages: Vec<ChatMessage> = args
            .get("messages")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| CallError::InvalidArguments(e.to_string()))?
            .ok_or_else(|| CallError::InvalidArguments("missing 'messages'".into()))?;
        let response = self.client.chat(endpoint, &messages).await?;
        serde_json::to_value(response).map_err(|e| CallError::Remote(e.to_string()))
    }
}

struct EmbedCall {
    client: Arc<dyn ModelClient>,
}

#[async_trait]
impl RemoteCall for EmbedCall {
    async fn call(&self, endpoint: &str, args: &CallArgs) -> std::result::Result<Value, CallError> {
        let input: Vec<String> = args
            .get("input")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| CallError::InvalidArguments(e.to_string()))?
            .ok_or_else(|| CallError::InvalidArguments("missing 'input'".into()))?;
        let response = self.client.embed(endpoint, &input).await?;
        serde_json::to_value(response).map_err(|e| CallError::Remote(e.to_string()))
    }
}

fn reported_cost(value: &Value) -> f64 {
    value.get("cost").and_then(Value::as_f64).unwrap_or(0.0)
}

fn usage_field(value: &Value, field: &str) -> Option<u64> {
    value
        .get("usage")
        .and_then(|u| u.get(field))
        .and_then(Value::as_u64)
}

fn chat_cost(_endpoint: &str, _args: &CallArgs, value: &Value) -> CostBreakdown {
    CostBreakdown {
        method: "chat_completion".to_string(),
        cost: reported_cost(value),
        input_tokens: usage_field(value, "input_tokens"),
        output_tokens: usage_field(value, "output_tokens"),
    }
}

fn embed_cost(_endpoint: &str, _args: &CallArgs, value: &Value) -> CostBreakdown {
    CostBreakdown {
        method: "embedding".to_string(),
        cost: reported_cost(value),
        input_tokens: usage_field(value, "input_tokens"),
        output_tokens: None,
    }
}

/// Model operations bound to one context and one provider client.
pub struct ModelOps {
    chat: Wrapped<ChatCall>,
    embed: Wrapped<EmbedCall>,
}

impl ModelOps {
    pub fn new(ctx: Arc<CallContext>, client: Arc<dyn ModelClient>) -> Self {
        Self::with_retry(ctx, client, RetryPolicy::default())
    }

    pub fn with_retry(
        ctx: Arc<CallContext>,
        client: Arc<dyn ModelClient>,
        retry: RetryPolicy,
    ) -> Self {
        let chat = Wrapped::new(
            ctx.clone(),
            CallPolicy::new("chat_completion").retry(retry.clone()),
            ChatCall {
                client: client.clone(),
            },
        )
        .with_cost_extractor(chat_cost);

        let embed = Wrapped::new(
            ctx,
            CallPolicy::new("embedding").retry(retry),
            EmbedCall { client },
        )
        .with_cost_extractor(embed_cost);

        Self { chat, embed }
    }

    fn chat_args(messages: &[ChatMessage]) -> Result<CallArgs> {
        Ok(CallArgs::new().with("messages", serde_json::to_value(messages)?))
    }

    fn embed_args(input: &[String]) -> Result<CallArgs> {
        Ok(CallArgs::new().with("input", serde_json::to_value(input)?))
    }

    /// The key a chat completion would cache under, without executing it.
    pub fn chat_cache_key(&self, model: &str, messages: &[ChatMessage]) -> Result<CacheKey> {
        self.chat.cache_key(model, &Self::chat_args(messages)?)
    }

    pub async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<(ChatResponse, bool, Option<CallRecord>)> {
        let outcome = self
            .chat
            .invoke_with_info(model, Self::chat_args(messages)?)
            .await?;
        let response: ChatResponse = serde_json::from_value(outcome.value)?;
        Ok((response, outcome.cache_hit, outcome.record))
    }

    pub async fn embedding(
        &self,
        model: &str,
        input: &[String],
    ) -> Result<(EmbeddingResponse, bool, Option<CallRecord>)> {
        let outcome = self
            .embed
            .invoke_with_info(model, Self::embed_args(input)?)
            .await?;
        let response: EmbeddingResponse = serde_json::from_value(outcome.value)?;
        Ok((response, outcome.cache_hit, outcome.record))
    }

    /// Embed `input` in batches of `batch_size`, issuing the batches
    /// concurrently under a caller-supplied admission gate. The framework
    /// imposes no concurrency cap of its own beyond the per-endpoint rate
    /// limiter.
    pub async fn batch_embeddings(
        &self,
        model: &str,
        input: &[String],
        batch_size: usize,
        concurrency_limit: Option<usize>,
    ) -> Result<Vec<Vec<f32>>> {
        let batches: Vec<Vec<String>> = input
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
        let permits = concurrency_limit.unwrap_or_else(|| batches.len().max(1));
        let semaphore = Arc::new(Semaphore::new(permits));

        let futures = batches.into_iter().map(|batch| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("admission gate closed");
                let (response, _, _) = self.embedding(model, &batch).await?;
                Ok::<_, Error>(response.embeddings)
            }
        });

        let results = futures::future::try_join_all(futures).await?;
        Ok(results.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::TokenUsage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingClient {
        chats: AtomicUsize,
        embeds: AtomicUsize,
    }

    impl CountingClient {
        fn new() -> Self {
            Self {
                chats: AtomicUsize::new(0),
                embeds: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelClient for CountingClient {
        async fn chat(
            &self,
            _model: &str,
            messages: &[ChatMessage],
        ) -> std::result::Result<ChatResponse, CallError> {
            self.chats.fetch_add(1, Ordering::SeqCst);
            Ok(ChatResponse {
                content: format!("echo: {}", messages.last().map(|m| m.content.as_str()).unwrap_or("")),
                usage: Some(TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                }),
                cost: Some(0.01),
            })
        }

        async fn embed(
            &self,
            _model: &str,
            input: &[String],
        ) -> std::result::Result<EmbeddingResponse, CallError> {
            self.embeds.fetch_add(1, Ordering::SeqCst);
            Ok(EmbeddingResponse {
                embeddings: input.iter().map(|s| vec![s.len() as f32]).collect(),
                usage: Some(TokenUsage {
                    input_tokens: input.len() as u64,
                    output_tokens: 0,
                }),
                cost: Some(0.001),
            })
        }
    }

    fn test_ops() -> (ModelOps, Arc<CountingClient>, Arc<CallContext>, TempDir) {
        let dir = TempDir::new().unwrap();
        let ctx = Arc::new(CallContext::new());
        ctx.set_default_cache_path(dir.path());
        let client = Arc::new(CountingClient::new());
        let ops = ModelOps::new(ctx.clone(), client.clone());
        (ops, client, ctx, dir)
    }

    #[tokio::test]
    async fn chat_completion_caches_and_logs() {
        let (ops, client, ctx, _dir) = test_ops();
        let messages = vec![ChatMessage::user("hello")];

        let (first, hit, record) = ops.chat_completion("test-model", &messages).await.unwrap();
        assert!(!hit);
        let record = record.expect("billable call must be logged");
        assert_eq!(record.method, "chat_completion");
        assert_eq!(record.model, "test-model");
        assert_eq!(record.input_tokens, Some(10));

        let (second, hit, record) = ops.chat_completion("test-model", &messages).await.unwrap();
        assert!(hit);
        assert!(record.is_none());
        assert_eq!(first, second);
        assert_eq!(client.chats.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.call_records(None).len(), 1);
        assert!((ctx.total_cost(Some("test-model")) - 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cache_key_is_returned_without_executing() {
        let (ops, client, _ctx, _dir) = test_ops();
        let key = ops
            .chat_cache_key("test-model", &[ChatMessage::user("hi")])
            .unwrap();
        assert_eq!(key.operation(), "chat_completion");
        assert_eq!(client.chats.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn embedding_records_have_no_output_tokens() {
        let (ops, _client, _ctx, _dir) = test_ops();
        let (_, _, record) = ops
            .embedding("small", &["one".to_string()])
            .await
            .unwrap();
        let record = record.unwrap();
        assert_eq!(record.method, "embedding");
        assert_eq!(record.input_tokens, Some(1));
        assert_eq!(record.output_tokens, None);
    }

    #[tokio::test]
    async fn batch_embeddings_preserve_input_order() {
        let (ops, client, _ctx, _dir) = test_ops();
        let input: Vec<String> = ["a", "bb", "ccc", "dddd", "eeeee"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let embeddings = ops
            .batch_embeddings("small", &input, 2, Some(2))
            .await
            .unwrap();

        assert_eq!(embeddings.len(), 5);
        assert_eq!(embeddings[0], vec![1.0]);
        assert_eq!(embeddings[4], vec![5.0]);
        assert_eq!(client.embeds.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cached_batches_do_not_call_again() {
        let (ops, client, _ctx, _dir) = test_ops();
        let input: Vec<String> = ["a", "bb", "ccc"].iter().map(|s| s.to_string()).collect();

        ops.batch_embeddings("small", &input, 2, None).await.unwrap();
        ops.batch_embeddings("small", &input, 2, None).await.unwrap();
        assert_eq!(client.embeds.load(Ordering::SeqCst), 2);
    }
}
