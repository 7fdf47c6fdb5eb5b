//! Tuning knobs for the limiter, the retry policy and the queue.
//!
//! Every value has a default matching the external provider's free-tier
//! quota. A YAML file can override any subset of them; see
//! [`Config::from_yaml_file`].
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RateLimitConfig {
    /// Calls permitted in any rolling window.
    pub max_calls_per_window: usize,
    /// Length of the rolling window.
    pub window: Duration,
    /// How often `wait_for_slot` re-checks the window.
    pub poll_interval: Duration,
    /// How often expired entries are pruned.
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls_per_window: 5,
            window: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed per job, shared by call retries and re-queues.
    pub max_retries: u32,
    /// First throttling backoff; doubles on each further attempt.
    pub throttle_backoff: Duration,
    /// Fixed backoff after any other external failure.
    pub transient_backoff: Duration,
}

impl RetryPolicy {
    /// Backoff to take after `attempt` (1-based) was throttled.
    pub fn throttle_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.throttle_backoff.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            throttle_backoff: Duration::from_secs(15),
            transient_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetentionPolicy {
    /// How long a terminal job stays queryable.
    pub ttl: Duration,
    /// Upper bound on retained terminal jobs; the oldest go first.
    pub max_retained: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            max_retained: 1000,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueConfig {
    /// Pause taken by the drain loop after every job.
    pub inter_job_delay: Duration,
    /// Largest accepted image, in bytes.
    pub max_image_size: usize,
    pub retry: RetryPolicy,
    pub retention: RetentionPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            inter_job_delay: Duration::from_secs(12),
            max_image_size: 10 * 1024 * 1024,
            retry: RetryPolicy::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub vision_model: String,
    pub image_model: String,
    pub image_size: String,
    pub max_tokens: u32,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            vision_model: "gpt-4o".into(),
            image_model: "dall-e-3".into(),
            image_size: "1024x1024".into(),
            max_tokens: 200,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Config {
    pub rate_limit: RateLimitConfig,
    pub queue: QueueConfig,
    pub openai: OpenAiConfig,
}

/// On-disk shape of the config file. Durations are whole seconds.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    max_calls_per_window: Option<usize>,
    window_secs: Option<u64>,
    slot_poll_secs: Option<u64>,
    cleanup_interval_secs: Option<u64>,
    max_retries: Option<u32>,
    throttle_backoff_secs: Option<u64>,
    transient_backoff_secs: Option<u64>,
    inter_job_delay_secs: Option<u64>,
    max_image_size: Option<usize>,
    retention_secs: Option<u64>,
    max_retained_jobs: Option<usize>,
    openai: OpenAiFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct OpenAiFile {
    base_url: Option<String>,
    vision_model: Option<String>,
    image_model: Option<String>,
    image_size: Option<String>,
    max_tokens: Option<u32>,
}

impl Config {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        // An empty document deserialises to unit, not to a map.
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let file: ConfigFile = serde_yaml::from_str(raw)?;
        let mut cfg = Self::default();

        let secs = Duration::from_secs;
        let rl = &mut cfg.rate_limit;
        if let Some(v) = file.max_calls_per_window {
            rl.max_calls_per_window = v;
        }
        if let Some(v) = file.window_secs {
            rl.window = secs(v);
        }
        if let Some(v) = file.slot_poll_secs {
            rl.poll_interval = secs(v);
        }
        if let Some(v) = file.cleanup_interval_secs {
            rl.cleanup_interval = secs(v);
        }

        let q = &mut cfg.queue;
        if let Some(v) = file.max_retries {
            q.retry.max_retries = v;
        }
        if let Some(v) = file.throttle_backoff_secs {
            q.retry.throttle_backoff = secs(v);
        }
        if let Some(v) = file.transient_backoff_secs {
            q.retry.transient_backoff = secs(v);
        }
        if let Some(v) = file.inter_job_delay_secs {
            q.inter_job_delay = secs(v);
        }
        if let Some(v) = file.max_image_size {
            q.max_image_size = v;
        }
        if let Some(v) = file.retention_secs {
            q.retention.ttl = secs(v);
        }
        if let Some(v) = file.max_retained_jobs {
            q.retention.max_retained = v;
        }

        let o = &mut cfg.openai;
        if let Some(v) = file.openai.base_url {
            o.base_url = v;
        }
        if let Some(v) = file.openai.vision_model {
            o.vision_model = v;
        }
        if let Some(v) = file.openai.image_model {
            o.image_model = v;
        }
        if let Some(v) = file.openai.image_size {
            o.image_size = v;
        }
        if let Some(v) = file.openai.max_tokens {
            o.max_tokens = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.max_calls_per_window == 0 {
            return Err(ConfigError::Invalid(
                "max_calls_per_window must be at least 1".into(),
            ));
        }
        if self.rate_limit.window.is_zero() {
            return Err(ConfigError::Invalid(
                "window_secs must be non-zero".into(),
            ));
        }
        if self.rate_limit.poll_interval.is_zero()
            || self.rate_limit.cleanup_interval.is_zero()
        {
            return Err(ConfigError::Invalid(
                "poll and cleanup intervals must be non-zero".into(),
            ));
        }
        if self.queue.retry.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "max_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
