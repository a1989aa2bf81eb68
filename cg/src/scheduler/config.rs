//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Where a throttled task goes when its backoff expires
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryPlacement {
    /// Head of the queue, ahead of work that has not been attempted yet
    #[default]
    Front,
    /// Tail of the queue, behind everything already waiting
    Back,
    /// Separate retry lane, alternated with the main queue
    Fair,
}

impl std::fmt::Display for RetryPlacement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Front => write!(f, "front"),
            Self::Back => write!(f, "back"),
            Self::Fair => write!(f, "fair"),
        }
    }
}

impl std::str::FromStr for RetryPlacement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "front" | "head" => Ok(Self::Front),
            "back" | "tail" => Ok(Self::Back),
            "fair" => Ok(Self::Fair),
            _ => Err(format!("Unknown retry placement: {}", s)),
        }
    }
}

/// Invalid scheduler configuration
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{0} must be at least 1")]
    Zero(&'static str),

    #[error("backoff-multiplier must be at least 1.0, got {0}")]
    Multiplier(f64),

    #[error("max-backoff-ms ({max}) is smaller than initial-backoff-ms ({initial})")]
    BackoffRange { initial: u64, max: u64 },
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Max admitted executions per rate window
    #[serde(rename = "max-requests-per-minute", default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: u32,

    /// Max simultaneously executing calls
    #[serde(rename = "max-concurrent-requests", default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Retries allowed after the first attempt
    #[serde(rename = "retry-attempts", default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay before the first retry
    #[serde(rename = "initial-backoff-ms", default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on any retry delay
    #[serde(rename = "max-backoff-ms", default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Growth factor applied per retry
    #[serde(rename = "backoff-multiplier", default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Rate limit window duration in seconds
    #[serde(rename = "rate-window-secs", default = "default_rate_window_secs")]
    pub rate_window_secs: u64,

    /// Queue placement of retried tasks
    #[serde(rename = "retry-placement", default)]
    pub retry_placement: RetryPlacement,
}

fn default_max_requests_per_minute() -> u32 {
    60
}

fn default_max_concurrent_requests() -> usize {
    10
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_rate_window_secs() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: default_max_requests_per_minute(),
            max_concurrent_requests: default_max_concurrent_requests(),
            retry_attempts: default_retry_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            rate_window_secs: default_rate_window_secs(),
            retry_placement: RetryPlacement::Front,
        }
    }
}

impl SchedulerConfig {
    /// Get the rate window as a Duration
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    /// Delay before the retry that follows `retry_count` earlier retries
    ///
    /// `min(initial_backoff_ms * backoff_multiplier^retry_count, max_backoff_ms)`
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let raw = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Check the limits are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests_per_minute == 0 {
            return Err(ConfigError::Zero("max-requests-per-minute"));
        }
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::Zero("max-concurrent-requests"));
        }
        if self.rate_window_secs == 0 {
            return Err(ConfigError::Zero("rate-window-secs"));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Multiplier(self.backoff_multiplier));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::BackoffRange {
                initial: self.initial_backoff_ms,
                max: self.max_backoff_ms,
            });
        }
        Ok(())
    }
}

/// Partial configuration for `Scheduler::update_options`
///
/// Fields left as `None` keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfigUpdate {
    #[serde(rename = "max-requests-per-minute")]
    pub max_requests_per_minute: Option<u32>,

    #[serde(rename = "max-concurrent-requests")]
    pub max_concurrent_requests: Option<usize>,

    #[serde(rename = "retry-attempts")]
    pub retry_attempts: Option<u32>,

    #[serde(rename = "initial-backoff-ms")]
    pub initial_backoff_ms: Option<u64>,

    #[serde(rename = "max-backoff-ms")]
    pub max_backoff_ms: Option<u64>,

    #[serde(rename = "backoff-multiplier")]
    pub backoff_multiplier: Option<f64>,

    #[serde(rename = "rate-window-secs")]
    pub rate_window_secs: Option<u64>,

    #[serde(rename = "retry-placement")]
    pub retry_placement: Option<RetryPlacement>,
}

impl SchedulerConfigUpdate {
    /// Produce the configuration that results from applying this update
    pub fn apply_to(&self, config: &SchedulerConfig) -> SchedulerConfig {
        SchedulerConfig {
            max_requests_per_minute: self.max_requests_per_minute.unwrap_or(config.max_requests_per_minute),
            max_concurrent_requests: self.max_concurrent_requests.unwrap_or(config.max_concurrent_requests),
            retry_attempts: self.retry_attempts.unwrap_or(config.retry_attempts),
            initial_backoff_ms: self.initial_backoff_ms.unwrap_or(config.initial_backoff_ms),
            max_backoff_ms: self.max_backoff_ms.unwrap_or(config.max_backoff_ms),
            backoff_multiplier: self.backoff_multiplier.unwrap_or(config.backoff_multiplier),
            rate_window_secs: self.rate_window_secs.unwrap_or(config.rate_window_secs),
            retry_placement: self.retry_placement.unwrap_or(config.retry_placement),
        }
    }
}
