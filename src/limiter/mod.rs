//! Per-endpoint request pacing.
//!
//! A [`RateLimiter`] releases asynchronous callers at a configured
//! requests-per-minute rate. The registry maps `(endpoint, credential)` to a
//! limiter, creating each lazily at the registry's default rate. Replacing a
//! limiter first breaches the old one: every caller currently suspended in
//! [`RateLimiter::wait`] is released immediately, never stranded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Default pacing rate, in requests per minute.
pub const DEFAULT_RPM: f64 = 1000.0;

/// Unit a request rate is expressed in. Normalized internally to per-minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateUnit {
    PerSecond,
    PerMinute,
    PerHour,
}

impl RateUnit {
    /// Exact conversion to requests per minute.
    pub fn to_per_minute(self, rate: f64) -> f64 {
        match self {
            RateUnit::PerSecond => rate * 60.0,
            RateUnit::PerMinute => rate,
            RateUnit::PerHour => rate / 60.0,
        }
    }
}

/// Asynchronous pacing primitive releasing callers at a fixed rate.
pub struct RateLimiter {
    rpm: f64,
    next_slot: Mutex<Option<Instant>>,
    breached: Notify,
    waits: AtomicU64,
}

impl RateLimiter {
    pub fn new(rpm: f64) -> Self {
        Self {
            rpm,
            next_slot: Mutex::new(None),
            breached: Notify::new(),
            waits: AtomicU64::new(0),
        }
    }

    pub fn rpm(&self) -> f64 {
        self.rpm
    }

    /// Number of times `wait` has been entered. Cache hits bypass the
    /// limiter entirely, which tests observe through this counter.
    pub fn wait_count(&self) -> u64 {
        self.waits.load(Ordering::SeqCst)
    }

    /// Suspend until the next release slot at the configured rate, or until
    /// the limiter is breached. Never blocks a thread.
    pub async fn wait(&self) {
        self.waits.fetch_add(1, Ordering::SeqCst);
        if self.rpm <= 0.0 {
            return;
        }
        let interval = Duration::from_secs_f64(60.0 / self.rpm);
        let slot = {
            let mut next = self.next_slot.lock().expect("poisoned lock");
            let now = Instant::now();
            let slot = match *next {
                Some(scheduled) if scheduled > now => scheduled,
                _ => now,
            };
            *next = Some(slot + interval);
            slot
        };
        tokio::select! {
            _ = tokio::time::sleep_until(slot) => {}
            _ = self.breached.notified() => {}
        }
    }

    /// Release every caller currently suspended in [`wait`](Self::wait).
    pub fn breach(&self) {
        self.breached.notify_waiters();
    }
}

/// Identifies one limiter: endpoint identity plus optional credential
/// identity, so distinct key holders pace independently.
type LimiterKey = (String, Option<String>);

/// Lazily-populated map from `(endpoint, credential)` to its limiter.
pub struct LimiterRegistry {
    default_rpm: RwLock<f64>,
    limiters: Mutex<HashMap<LimiterKey, Arc<RateLimiter>>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::with_default_rpm(DEFAULT_RPM)
    }

    pub fn with_default_rpm(rpm: f64) -> Self {
        Self {
            default_rpm: RwLock::new(rpm),
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Set the rate applied to limiters created after this call. Returns the
    /// effective per-minute rate.
    pub fn set_default_rate(&self, rate: f64, unit: RateUnit) -> f64 {
        let rpm = unit.to_per_minute(rate);
        tracing::info!(rpm, "default request rate configured");
        *self.default_rpm.write().expect("poisoned lock") = rpm;
        rpm
    }

    pub fn default_rpm(&self) -> f64 {
        *self.default_rpm.read().expect("poisoned lock")
    }

    /// Fetch the limiter for `(endpoint, credential)`, creating it at the
    /// default rate on first reference.
    pub fn acquire(&self, endpoint: &str, credential: Option<&str>) -> Arc<RateLimiter> {
        let key = (endpoint.to_string(), credential.map(str::to_string));
        let mut limiters = self.limiters.lock().expect("poisoned lock");
        limiters
            .entry(key)
            .or_insert_with(|| Arc::new(RateLimiter::new(self.default_rpm())))
            .clone()
    }

    /// Replace the limiter for `(endpoint, credential)` with one at the new
    /// rate. The old limiter is breached first so no suspended caller is
    /// stranded waiting on pacing that no longer applies.
    pub fn reconfigure(
        &self,
        endpoint: &str,
        credential: Option<&str>,
        rate: f64,
        unit: RateUnit,
    ) -> Arc<RateLimiter> {
        let key = (endpoint.to_string(), credential.map(str::to_string));
        let rpm = unit.to_per_minute(rate);
        let mut limiters = self.limiters.lock().expect("poisoned lock");
        if let Some(old) = limiters.get(&key) {
            old.breach();
        }
        let limiter = Arc::new(RateLimiter::new(rpm));
        limiters.insert(key, limiter.clone());
        tracing::info!(endpoint, rpm, "request rate reconfigured");
        limiter
    }
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_units_convert_exactly() {
        assert_eq!(RateUnit::PerSecond.to_per_minute(60.0), 3600.0);
        assert_eq!(RateUnit::PerHour.to_per_minute(120.0), 2.0);
        assert_eq!(RateUnit::PerMinute.to_per_minute(250.0), 250.0);
    }

    #[test]
    fn default_rate_applies_to_new_limiters() {
        let registry = LimiterRegistry::new();
        assert_eq!(registry.set_default_rate(60.0, RateUnit::PerSecond), 3600.0);
        let limiter = registry.acquire("gpt-4o", None);
        assert_eq!(limiter.rpm(), 3600.0);
    }

    #[test]
    fn acquire_is_keyed_by_endpoint_and_credential() {
        let registry = LimiterRegistry::new();
        let a = registry.acquire("gpt-4o", None);
        let b = registry.acquire("gpt-4o", None);
        let c = registry.acquire("gpt-4o", Some("key-2"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_paces_at_configured_rate() {
        let limiter = RateLimiter::new(60.0); // one per second
        let start = Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(limiter.wait_count(), 3);
    }

    #[tokio::test]
    async fn breach_releases_suspended_waiters() {
        let limiter = Arc::new(RateLimiter::new(0.6)); // 100 s between slots
        limiter.wait().await; // first slot is immediate

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.wait().await })
        };
        tokio::task::yield_now().await;
        limiter.breach();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("breached waiter must be released promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn reconfigure_breaches_old_limiter() {
        let registry = Arc::new(LimiterRegistry::new());
        let limiter = registry.reconfigure("slow-model", None, 0.6, RateUnit::PerMinute);
        limiter.wait().await;

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.wait().await })
        };
        tokio::task::yield_now().await;
        registry.reconfigure("slow-model", None, 600.0, RateUnit::PerMinute);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("reconfigure must release suspended waiters")
            .unwrap();
        assert_eq!(registry.acquire("slow-model", None).rpm(), 600.0);
    }
}
