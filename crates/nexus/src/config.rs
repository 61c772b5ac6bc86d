//! Environment-derived configuration.
//!
//! Loaded once at startup and passed by handle; nothing in the core reads
//! the process environment after construction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::CoreError;

pub const DEFAULT_WORKER_COUNT: usize = 8;
pub const DEFAULT_QUEUE_CAP: usize = 64;
pub const DEFAULT_PROVIDER_RPS: u32 = 5;
pub const DEFAULT_PROVIDER_CONCURRENCY: usize = 4;
pub const DEFAULT_EVENT_MAX_BYTES: usize = 10 * 1024;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct NexusConfig {
    pub worker_count: usize,
    /// Per-queue depth caps, keyed by lowercase queue name. Queues not listed
    /// use `default_queue_cap`.
    pub queue_caps: HashMap<String, usize>,
    pub default_queue_cap: usize,
    /// Per-queue concurrency caps. Unlisted queues are bounded only by the
    /// worker pool.
    pub queue_concurrency: HashMap<String, usize>,
    /// Per-provider request rate (tokens per second), keyed by lowercase
    /// provider name.
    pub provider_rps: HashMap<String, u32>,
    pub default_provider_rps: u32,
    pub provider_concurrency: HashMap<String, usize>,
    pub default_provider_concurrency: usize,
    pub llm_reasoning_model: String,
    pub llm_task_model: String,
    pub event_max_bytes: usize,
    /// Cap on a single evidence row's JSON payload.
    pub evidence_max_bytes: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_ttl: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub stats_interval: Duration,
    /// Completion threshold for fan-out phases; sequential phases use 1.0.
    pub fanout_min_success_ratio: f64,
    /// Optional wall-clock bound per orchestrator phase. On breach the
    /// remaining in-flight ops are cancelled and the phase is evaluated on
    /// what finished.
    pub phase_timeout: Option<Duration>,
    pub max_tree_depth: usize,
    pub max_fact_len: usize,
    /// Smoothing factor for the reliability-score moving average.
    pub reliability_alpha: f64,
    /// Root directory for exported artifacts (`storage/{task_id}/...`).
    pub storage_root: PathBuf,
}

impl Default for NexusConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue_caps: HashMap::new(),
            default_queue_cap: DEFAULT_QUEUE_CAP,
            queue_concurrency: HashMap::new(),
            provider_rps: HashMap::new(),
            default_provider_rps: DEFAULT_PROVIDER_RPS,
            provider_concurrency: HashMap::new(),
            default_provider_concurrency: DEFAULT_PROVIDER_CONCURRENCY,
            llm_reasoning_model: "reasoning-default".to_string(),
            llm_task_model: "task-default".to_string(),
            event_max_bytes: DEFAULT_EVENT_MAX_BYTES,
            evidence_max_bytes: 64 * 1024,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_ttl: Duration::from_secs(30),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            stats_interval: Duration::from_secs(5),
            fanout_min_success_ratio: 0.5,
            phase_timeout: None,
            max_tree_depth: 4,
            max_fact_len: 500,
            reliability_alpha: 0.3,
            storage_root: PathBuf::from("storage"),
        }
    }
}

impl NexusConfig {
    /// Build from the process environment.
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_vars(std::env::vars())
    }

    /// Build from an explicit variable set. Used directly by tests.
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self, CoreError> {
        let mut config = Self::default();

        for (key, value) in vars {
            match key.as_str() {
                "WORKER_COUNT" => {
                    config.worker_count = parse_positive(&key, &value)?;
                }
                "EVENT_MAX_BYTES" => {
                    config.event_max_bytes = parse_positive(&key, &value)?;
                }
                "EVIDENCE_MAX_BYTES" => {
                    config.evidence_max_bytes = parse_positive(&key, &value)?;
                }
                "HEARTBEAT_INTERVAL_SEC" => {
                    config.heartbeat_interval =
                        Duration::from_secs(parse_positive::<u64>(&key, &value)?);
                }
                "HEARTBEAT_TTL_SEC" => {
                    config.heartbeat_ttl =
                        Duration::from_secs(parse_positive::<u64>(&key, &value)?);
                }
                "MAX_RETRIES" => {
                    config.max_retries = parse_num(&key, &value)?;
                }
                "RETRY_BASE_MS" => {
                    config.retry_base = Duration::from_millis(parse_positive::<u64>(&key, &value)?);
                }
                "LLM_REASONING_MODEL" => {
                    config.llm_reasoning_model = value;
                }
                "LLM_TASK_MODEL" => {
                    config.llm_task_model = value;
                }
                "STORAGE_ROOT" => {
                    config.storage_root = PathBuf::from(value);
                }
                "PHASE_TIMEOUT_SEC" => {
                    config.phase_timeout =
                        Some(Duration::from_secs(parse_positive::<u64>(&key, &value)?));
                }
                _ => {
                    if let Some(queue) = key
                        .strip_prefix("QUEUE_")
                        .and_then(|rest| rest.strip_suffix("_CAP"))
                    {
                        config
                            .queue_caps
                            .insert(queue.to_lowercase(), parse_positive(&key, &value)?);
                    } else if let Some(queue) = key
                        .strip_prefix("QUEUE_")
                        .and_then(|rest| rest.strip_suffix("_CONCURRENCY"))
                    {
                        config
                            .queue_concurrency
                            .insert(queue.to_lowercase(), parse_positive(&key, &value)?);
                    } else if let Some(provider) = key
                        .strip_prefix("PROVIDER_")
                        .and_then(|rest| rest.strip_suffix("_RPS"))
                    {
                        config
                            .provider_rps
                            .insert(provider.to_lowercase(), parse_positive(&key, &value)?);
                    } else if let Some(provider) = key
                        .strip_prefix("PROVIDER_")
                        .and_then(|rest| rest.strip_suffix("_CONCURRENCY"))
                    {
                        config
                            .provider_concurrency
                            .insert(provider.to_lowercase(), parse_positive(&key, &value)?);
                    }
                }
            }
        }

        if config.heartbeat_ttl < config.heartbeat_interval {
            return Err(CoreError::Config(format!(
                "HEARTBEAT_TTL_SEC ({:?}) must be >= HEARTBEAT_INTERVAL_SEC ({:?})",
                config.heartbeat_ttl, config.heartbeat_interval
            )));
        }

        Ok(config)
    }

    pub fn queue_cap(&self, queue: &str) -> usize {
        self.queue_caps
            .get(&queue.to_lowercase())
            .copied()
            .unwrap_or(self.default_queue_cap)
    }

    pub fn queue_concurrency(&self, queue: &str) -> usize {
        self.queue_concurrency
            .get(&queue.to_lowercase())
            .copied()
            .unwrap_or(self.worker_count)
    }

    pub fn provider_rps(&self, provider: &str) -> u32 {
        self.provider_rps
            .get(&provider.to_lowercase())
            .copied()
            .unwrap_or(self.default_provider_rps)
    }

    pub fn provider_concurrency(&self, provider: &str) -> usize {
        self.provider_concurrency
            .get(&provider.to_lowercase())
            .copied()
            .unwrap_or(self.default_provider_concurrency)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, CoreError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| CoreError::Config(format!("invalid value for {key}: '{value}'")))
}

fn parse_positive<T>(key: &str, value: &str) -> Result<T, CoreError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let parsed: T = parse_num(key, value)?;
    if parsed <= T::default() {
        return Err(CoreError::Config(format!(
            "{key} must be positive, got '{value}'"
        )));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = NexusConfig::from_vars(vars(&[])).unwrap();
        assert_eq!(config.worker_count, DEFAULT_WORKER_COUNT);
        assert_eq!(config.queue_cap("search"), DEFAULT_QUEUE_CAP);
        assert_eq!(config.provider_rps("exa"), DEFAULT_PROVIDER_RPS);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_prefixed_overrides() {
        let config = NexusConfig::from_vars(vars(&[
            ("WORKER_COUNT", "4"),
            ("QUEUE_SEARCH_CAP", "16"),
            ("PROVIDER_EXA_RPS", "2"),
            ("PROVIDER_EXA_CONCURRENCY", "1"),
        ]))
        .unwrap();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.queue_cap("search"), 16);
        assert_eq!(config.queue_cap("llm"), DEFAULT_QUEUE_CAP);
        assert_eq!(config.provider_rps("exa"), 2);
        assert_eq!(config.provider_concurrency("exa"), 1);
    }

    #[test]
    fn test_invalid_value_is_config_error() {
        let err = NexusConfig::from_vars(vars(&[("WORKER_COUNT", "zero")])).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));

        let err = NexusConfig::from_vars(vars(&[("WORKER_COUNT", "0")])).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn test_ttl_must_cover_interval() {
        let err = NexusConfig::from_vars(vars(&[
            ("HEARTBEAT_INTERVAL_SEC", "30"),
            ("HEARTBEAT_TTL_SEC", "10"),
        ]))
        .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }
}
