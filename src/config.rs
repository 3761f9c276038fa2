//! Run configuration, resolved once before a run starts.
//!
//! ```json
//! {
//!   "executor": { "max_in_flight": 8, "error_policy": {"mode": "skip"},
//!                 "retry": {"max_attempts": 3}, "sink_timeout_ms": 5000 },
//!   "cache": { "dir": "/tmp/lakepipe_cache", "max_disk_size": "10GB",
//!              "ttl_secs": 604800, "immutable_only": true }
//! }
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::resilience::{ErrorPolicy, RetryPolicy};

const DEFAULT_MAX_IN_FLIGHT: usize = 16;
const DEFAULT_MEMORY_CAPACITY: usize = 128;
const DEFAULT_MAX_DISK_SIZE: u64 = 10 * 1024 * 1024 * 1024;
const DEFAULT_TTL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub executor: ExecutorConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Upper bound on units between source and sink
    pub max_in_flight: usize,
    pub error_policy: ErrorPolicy,
    pub retry: RetryPolicy,
    pub source_timeout_ms: Option<u64>,
    pub sink_timeout_ms: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            error_policy: ErrorPolicy::default(),
            retry: RetryPolicy::default(),
            source_timeout_ms: None,
            sink_timeout_ms: None,
        }
    }
}

impl ExecutorConfig {
    pub fn source_timeout(&self) -> Option<Duration> {
        self.source_timeout_ms.map(Duration::from_millis)
    }

    pub fn sink_timeout(&self) -> Option<Duration> {
        self.sink_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::invalid("executor.max_in_flight", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "executor.retry.max_attempts",
                "must be at least 1 (1 disables retries)",
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Contradiction(format!(
                "retry base delay {}ms exceeds max delay {}ms",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if let ErrorPolicy::Tolerant { max_error_rate, .. } = self.error_policy {
            if !(0.0..=1.0).contains(&max_error_rate) {
                return Err(ConfigError::invalid(
                    "executor.error_policy.max_error_rate",
                    format!("{max_error_rate} is not within 0.0..=1.0"),
                ));
            }
        }
        for (field, timeout) in [
            ("executor.source_timeout_ms", self.source_timeout_ms),
            ("executor.sink_timeout_ms", self.sink_timeout_ms),
        ] {
            if timeout == Some(0) {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Tier-2 directory; memory-only when unset
    pub dir: Option<PathBuf>,
    /// Tier-1 capacity in entries
    pub memory_capacity: usize,
    /// Tier-2 budget in bytes; accepts `10737418240` or `"10GB"`
    #[serde(deserialize_with = "deserialize_size")]
    pub max_disk_size: u64,
    pub ttl_secs: u64,
    pub immutable_only: bool,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            max_disk_size: DEFAULT_MAX_DISK_SIZE,
            ttl_secs: DEFAULT_TTL_SECS,
            immutable_only: true,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.memory_capacity == 0 {
            return Err(ConfigError::invalid("cache.memory_capacity", "must be at least 1"));
        }
        if self.ttl_secs == 0 {
            return Err(ConfigError::invalid("cache.ttl_secs", "must be greater than zero"));
        }
        if self.dir.is_some() && self.max_disk_size == 0 {
            return Err(ConfigError::invalid(
                "cache.max_disk_size",
                "must be greater than zero when a cache dir is set",
            ));
        }
        for (field, patterns) in [
            ("cache.include_patterns", &self.include_patterns),
            ("cache.exclude_patterns", &self.exclude_patterns),
        ] {
            for pattern in patterns {
                globset::Glob::new(pattern)
                    .map_err(|e| ConfigError::invalid(field, format!("`{pattern}`: {e}")))?;
            }
        }
        if let Some(pattern) = self
            .include_patterns
            .iter()
            .find(|p| self.exclude_patterns.contains(p))
        {
            return Err(ConfigError::Contradiction(format!(
                "pattern `{pattern}` is both included and excluded"
            )));
        }
        Ok(())
    }
}

impl PipelineConfig {
    pub fn from_json(config: Value) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_value(config).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.executor.validate()?;
        self.cache.validate()
    }
}

/// Parse a byte size such as `512`, `"64KB"`, `"1.5 GB"` (binary multiples).
pub fn parse_size(input: &str) -> Result<u64, ConfigError> {
    let s = input.trim().to_ascii_uppercase();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| ConfigError::invalid("cache.max_disk_size", format!("`{input}` is not a size")))?;
    let multiplier: u64 = match unit.trim() {
        "" | "B" => 1,
        "KB" | "K" => 1 << 10,
        "MB" | "M" => 1 << 20,
        "GB" | "G" => 1 << 30,
        "TB" | "T" => 1 << 40,
        other => {
            return Err(ConfigError::invalid(
                "cache.max_disk_size",
                format!("unknown unit `{other}`"),
            ))
        }
    };
    Ok((number * multiplier as f64) as u64)
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Human(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Bytes(n) => Ok(n),
        Size::Human(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}
