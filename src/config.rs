use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::call::CallContext;
use crate::limiter::RateUnit;
use crate::retry::RetryPolicy;

/// File-backed configuration for a call context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub ledger: LedgerSettings,
    #[serde(default)]
    pub rates: RateSettings,
    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Default store location; operations may still name their own.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSettings {
    /// Durable call-log file (`.jsonl`).
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateSettings {
    /// Rate applied to endpoints without an explicit override.
    #[serde(default = "default_rate")]
    pub default_rate: f64,
    #[serde(default = "default_rate_unit")]
    pub default_unit: RateUnit,
    /// Per-endpoint overrides.
    #[serde(default)]
    pub endpoints: Vec<EndpointRate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRate {
    pub endpoint: String,
    pub credential: Option<String>,
    pub rate: f64,
    #[serde(default = "default_rate_unit")]
    pub unit: RateUnit,
}

fn default_rate() -> f64 {
    crate::limiter::DEFAULT_RPM
}

fn default_rate_unit() -> RateUnit {
    RateUnit::PerMinute
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            default_rate: default_rate(),
            default_unit: default_rate_unit(),
            endpoints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts per call (default: 5)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between attempts in seconds (default: 10)
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Per-attempt deadline in seconds, asynchronous style only
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_secs() -> u64 {
    10
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            timeout_secs: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;

        toml::from_str(&content).context("Failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(config_dir.join("tollgate").join("config.toml"))
    }

    /// Impart this configuration onto a context.
    pub fn apply(&self, ctx: &CallContext) -> crate::error::Result<()> {
        if let Some(path) = &self.cache.path {
            ctx.set_default_cache_path(path.clone());
        }
        if let Some(path) = &self.ledger.log_path {
            ctx.set_call_log_path(path.clone())?;
        }
        ctx.set_default_request_rate(self.rates.default_rate, self.rates.default_unit);
        for rate in &self.rates.endpoints {
            ctx.set_request_rate(
                &rate.endpoint,
                rate.credential.as_deref(),
                rate.rate,
                rate.unit,
            );
        }
        Ok(())
    }

    /// The retry policy these settings describe.
    pub fn retry_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::new(
            self.retry.max_retries,
            Duration::from_secs(self.retry.retry_delay_secs),
        );
        if let Some(secs) = self.retry.timeout_secs {
            policy = policy.with_timeout(Duration::from_secs(secs));
        }
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_framework_defaults() {
        let config = Config::default();
        assert_eq!(config.rates.default_rate, 1000.0);
        assert_eq!(config.rates.default_unit, RateUnit::PerMinute);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.retry_delay_secs, 10);
        assert!(config.retry.timeout_secs.is_none());
        assert!(config.cache.path.is_none());
        assert!(config.ledger.log_path.is_none());
    }

    #[test]
    fn toml_round_trip_preserves_settings() {
        let mut config = Config::default();
        config.cache.path = Some(PathBuf::from("/var/cache/tollgate"));
        config.rates.endpoints.push(EndpointRate {
            endpoint: "gpt-4o".into(),
            credential: None,
            rate: 60.0,
            unit: RateUnit::PerSecond,
        });

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.cache.path, config.cache.path);
        assert_eq!(parsed.rates.endpoints.len(), 1);
        assert_eq!(parsed.rates.endpoints[0].unit, RateUnit::PerSecond);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: Config = toml::from_str("[retry]\nmax_retries = 2\n").unwrap();
        assert_eq!(parsed.retry.max_retries, 2);
        assert_eq!(parsed.retry.retry_delay_secs, 10);
        assert_eq!(parsed.rates.default_rate, 1000.0);
    }

    #[test]
    fn apply_configures_context() {
        let ctx = CallContext::new();
        let mut config = Config::default();
        config.rates.default_rate = 120.0;
        config.rates.default_unit = RateUnit::PerHour;
        config.apply(&ctx).unwrap();
        assert_eq!(ctx.limiters().default_rpm(), 2.0);
    }

    #[test]
    fn retry_policy_reflects_settings() {
        let mut config = Config::default();
        config.retry.max_retries = 3;
        config.retry.retry_delay_secs = 1;
        config.retry.timeout_secs = Some(30);
        let policy = config.retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.retry_delay, Duration::from_secs(1));
        assert_eq!(policy.timeout, Some(Duration::from_secs(30)));
    }
}
