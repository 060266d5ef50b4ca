//! Composition root: wraps a raw remote call with caching, rate limiting,
//! retry, and cost accounting.
//!
//! A [`CallContext`] owns the three shared registries (stores, limiters,
//! ledger) as an explicitly constructed object, so independent
//! configurations can coexist; [`CallContext::global`] provides the usual
//! process-wide default. [`Wrapped`] is the public callable built from a
//! context, a [`CallPolicy`], and the raw call.
//!
//! Known limitation, preserved by design: concurrent callers racing the
//! same cold key are not coalesced. Both may execute the underlying call
//! and both pay for it; the store keeps whichever write lands last.

mod args;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use serde_json::Value;

pub use args::CallArgs;

use crate::cache::{CacheKey, Store, StoreRegistry};
use crate::error::{CallError, Result};
use crate::ledger::{CallLedger, CallRecord};
use crate::limiter::{LimiterRegistry, RateUnit};
use crate::retry::RetryPolicy;

/// A raw asynchronous remote call: `(endpoint identity, named args) -> result`.
///
/// The result must carry whatever structure a cost extractor wants to read
/// (usage counts, provider-reported cost); the framework treats it as opaque.
#[async_trait]
pub trait RemoteCall: Send + Sync {
    async fn call(&self, endpoint: &str, args: &CallArgs) -> std::result::Result<Value, CallError>;
}

/// Blocking twin of [`RemoteCall`], with an equivalent signature.
pub trait BlockingCall: Send + Sync {
    fn call(&self, endpoint: &str, args: &CallArgs) -> std::result::Result<Value, CallError>;
}

#[async_trait]
impl<T: RemoteCall + ?Sized> RemoteCall for Arc<T> {
    async fn call(&self, endpoint: &str, args: &CallArgs) -> std::result::Result<Value, CallError> {
        (**self).call(endpoint, args).await
    }
}

impl<T: BlockingCall + ?Sized> BlockingCall for Arc<T> {
    fn call(&self, endpoint: &str, args: &CallArgs) -> std::result::Result<Value, CallError> {
        (**self).call(endpoint, args)
    }
}

/// What one billable call cost, as read off its result by a cost extractor.
#[derive(Debug, Clone)]
pub struct CostBreakdown {
    pub method: String,
    pub cost: f64,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// Reads usage/cost fields off a raw result to build the ledger record.
pub type CostExtractor = Arc<dyn Fn(&str, &CallArgs, &Value) -> CostBreakdown + Send + Sync>;

/// Shared state one configuration of the framework runs against.
pub struct CallContext {
    stores: StoreRegistry,
    limiters: LimiterRegistry,
    ledger: Mutex<CallLedger>,
}

lazy_static! {
    static ref GLOBAL_CONTEXT: Arc<CallContext> = Arc::new(CallContext::new());
}

impl CallContext {
    pub fn new() -> Self {
        Self {
            stores: StoreRegistry::new(),
            limiters: LimiterRegistry::new(),
            ledger: Mutex::new(CallLedger::new()),
        }
    }

    /// The process-wide default context.
    pub fn global() -> Arc<CallContext> {
        GLOBAL_CONTEXT.clone()
    }

    pub fn stores(&self) -> &StoreRegistry {
        &self.stores
    }

    pub fn limiters(&self) -> &LimiterRegistry {
        &self.limiters
    }

    // Configuration surface.

    pub fn set_default_cache_path(&self, path: impl Into<PathBuf>) {
        self.stores.set_default_path(path);
    }

    pub fn default_cache_path(&self) -> Option<PathBuf> {
        self.stores.default_path()
    }

    pub fn set_call_log_path(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.ledger.lock().expect("poisoned lock").set_log_path(path)
    }

    /// Returns the effective per-minute rate.
    pub fn set_default_request_rate(&self, rate: f64, unit: RateUnit) -> f64 {
        self.limiters.set_default_rate(rate, unit)
    }

    pub fn set_request_rate(
        &self,
        endpoint: &str,
        credential: Option<&str>,
        rate: f64,
        unit: RateUnit,
    ) {
        self.limiters.reconfigure(endpoint, credential, rate, unit);
    }

    // Ledger access.

    pub(crate) fn append_record(&self, record: CallRecord) -> Result<()> {
        self.ledger.lock().expect("poisoned lock").append(record)
    }

    pub fn call_records(&self, model: Option<&str>) -> Vec<CallRecord> {
        self.ledger
            .lock()
            .expect("poisoned lock")
            .records(model)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn total_cost(&self, model: Option<&str>) -> f64 {
        self.ledger.lock().expect("poisoned lock").total_cost(model)
    }

    pub fn total_input_tokens(&self, model: Option<&str>) -> u64 {
        self.ledger
            .lock()
            .expect("poisoned lock")
            .total_input_tokens(model)
    }

    pub fn total_output_tokens(&self, model: Option<&str>) -> u64 {
        self.ledger
            .lock()
            .expect("poisoned lock")
            .total_output_tokens(model)
    }

    pub fn total_tokens(&self, model: Option<&str>) -> u64 {
        self.ledger.lock().expect("poisoned lock").total_tokens(model)
    }

    /// Snapshot the ledger to `path` (full merge-and-rewrite).
    pub fn save_call_log(&self, path: &Path, combine_with_existing: bool) -> Result<()> {
        self.ledger
            .lock()
            .expect("poisoned lock")
            .save(path, combine_with_existing)
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-operation policy for a wrapped call.
#[derive(Debug, Clone)]
pub struct CallPolicy {
    /// Operation name, a slot of every derived cache key.
    pub operation: String,
    /// Overrides the operation slot of the key, letting differently-named
    /// operations (e.g. an async twin) share one cache bucket.
    pub cache_bucket: Option<String>,
    pub cache_enabled: bool,
    /// Store to cache into; `None` uses the context's default path.
    pub cache_path: Option<PathBuf>,
    /// Optional prefix slot of the cache key, separating otherwise
    /// identical runs.
    pub key_prefix: Option<String>,
    /// When false the endpoint slot collapses to a wildcard, so identical
    /// calls against different endpoints share cache entries.
    pub include_endpoint_in_key: bool,
    /// Per-entry expiry handed to the store.
    pub cache_expire: Option<Duration>,
    /// Tag stored alongside entries this operation writes.
    pub cache_tag: Option<String>,
    /// Credential identity for rate-limiter keying.
    pub credential: Option<String>,
    pub retry: RetryPolicy,
}

impl CallPolicy {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            cache_bucket: None,
            cache_enabled: true,
            cache_path: None,
            key_prefix: None,
            include_endpoint_in_key: true,
            cache_expire: None,
            cache_tag: None,
            credential: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn cache_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.cache_bucket = Some(bucket.into());
        self
    }

    pub fn cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn cache_disabled(mut self) -> Self {
        self.cache_enabled = false;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn endpoint_independent(mut self) -> Self {
        self.include_endpoint_in_key = false;
        self
    }

    pub fn credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Result of one wrapped invocation, for callers that asked for the
/// execution details along with the value.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub value: Value,
    pub cache_hit: bool,
    /// Ledger record created for this call; absent on cache hits and when
    /// no cost extractor is configured.
    pub record: Option<CallRecord>,
}

impl CallOutcome {
    pub fn into_value(self) -> Value {
        self.value
    }
}

/// The public callable produced by wrapping a raw call with a policy.
pub struct Wrapped<C> {
    ctx: Arc<CallContext>,
    policy: CallPolicy,
    cost: Option<CostExtractor>,
    raw: C,
}

impl<C> Wrapped<C> {
    pub fn new(ctx: Arc<CallContext>, policy: CallPolicy, raw: C) -> Self {
        Self {
            ctx,
            policy,
            cost: None,
            raw,
        }
    }

    pub fn with_cost_extractor(
        mut self,
        extractor: impl Fn(&str, &CallArgs, &Value) -> CostBreakdown + Send + Sync + 'static,
    ) -> Self {
        self.cost = Some(Arc::new(extractor));
        self
    }

    pub fn policy(&self) -> &CallPolicy {
        &self.policy
    }

    /// Derive this call's cache key without executing anything.
    pub fn cache_key(&self, endpoint: &str, args: &CallArgs) -> Result<CacheKey> {
        CacheKey::derive(
            self.policy
                .cache_bucket
                .as_deref()
                .unwrap_or(&self.policy.operation),
            args,
            self.policy.key_prefix.as_deref(),
            Some(endpoint),
            self.policy.include_endpoint_in_key,
        )
    }

    fn store(&self) -> Result<Arc<Store>> {
        self.ctx
            .stores
            .get_or_create(self.policy.cache_path.as_deref())
    }

    /// Ledger append plus outcome assembly, shared by both styles.
    fn finish(
        &self,
        endpoint: &str,
        args: &CallArgs,
        value: Value,
        cache_hit: bool,
    ) -> Result<CallOutcome> {
        let record = match (&self.cost, cache_hit) {
            (Some(extract), false) => {
                let breakdown = extract(endpoint, args, &value);
                let record = CallRecord::new(
                    breakdown.method,
                    endpoint,
                    breakdown.cost,
                    breakdown.input_tokens,
                    breakdown.output_tokens,
                );
                self.ctx.append_record(record.clone())?;
                Some(record)
            }
            _ => None,
        };
        Ok(CallOutcome {
            value,
            cache_hit,
            record,
        })
    }
}

impl<C: RemoteCall> Wrapped<C> {
    /// Asynchronous invocation returning the bare value.
    pub async fn invoke(&self, endpoint: &str, args: CallArgs) -> Result<Value> {
        self.invoke_with_info(endpoint, args)
            .await
            .map(CallOutcome::into_value)
    }

    /// Asynchronous invocation: derive key → (on miss) rate-limit wait →
    /// retrying get-or-compute → ledger append.
    pub async fn invoke_with_info(&self, endpoint: &str, args: CallArgs) -> Result<CallOutcome> {
        if !self.policy.cache_enabled {
            let limiter = self
                .ctx
                .limiters
                .acquire(endpoint, self.policy.credential.as_deref());
            limiter.wait().await;
            let value = self
                .policy
                .retry
                .execute(|| async { Ok(self.raw.call(endpoint, &args).await?) })
                .await?;
            return self.finish(endpoint, &args, value, false);
        }

        let key = self.cache_key(endpoint, &args)?;
        let store = self.store()?;

        // Cache hits never consume rate-limit quota.
        if !store.contains(&key)? {
            let limiter = self
                .ctx
                .limiters
                .acquire(endpoint, self.policy.credential.as_deref());
            limiter.wait().await;
        }

        let computed = AtomicBool::new(false);
        let value = self
            .policy
            .retry
            .execute(|| {
                let key = key.clone();
                let store = store.clone();
                let computed = &computed;
                let args = &args;
                async move {
                    if let Some(found) = store.get(&key)? {
                        tracing::debug!(key = %key, "cache hit");
                        return Ok(found);
                    }
                    tracing::debug!(key = %key, "cache miss, executing call");
                    computed.store(true, Ordering::SeqCst);
                    let value = self.raw.call(endpoint, args).await?;
                    store.set(
                        &key,
                        value.clone(),
                        self.policy.cache_expire,
                        self.policy.cache_tag.as_deref(),
                    )?;
                    Ok(value)
                }
            })
            .await?;

        self.finish(endpoint, &args, value, !computed.load(Ordering::SeqCst))
    }
}

impl<C: BlockingCall> Wrapped<C> {
    /// Blocking invocation returning the bare value. The synchronous style
    /// never waits on the rate limiter and its retry delays block the
    /// calling thread.
    pub fn invoke_blocking(&self, endpoint: &str, args: CallArgs) -> Result<Value> {
        self.invoke_blocking_with_info(endpoint, args)
            .map(CallOutcome::into_value)
    }

    pub fn invoke_blocking_with_info(&self, endpoint: &str, args: CallArgs) -> Result<CallOutcome> {
        if !self.policy.cache_enabled {
            let value = self
                .policy
                .retry
                .execute_blocking(|| Ok(self.raw.call(endpoint, &args)?))?;
            return self.finish(endpoint, &args, value, false);
        }

        let key = self.cache_key(endpoint, &args)?;
        let store = self.store()?;

        let mut computed = false;
        let value = self.policy.retry.execute_blocking(|| {
            if let Some(found) = store.get(&key)? {
                tracing::debug!(key = %key, "cache hit");
                return Ok(found);
            }
            tracing::debug!(key = %key, "cache miss, executing call");
            computed = true;
            let value = self.raw.call(endpoint, &args)?;
            store.set(
                &key,
                value.clone(),
                self.policy.cache_expire,
                self.policy.cache_tag.as_deref(),
            )?;
            Ok(value)
        })?;

        self.finish(endpoint, &args, value, !computed)
    }
}
