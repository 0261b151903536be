use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::event_pool::types::RecheckPolicy;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Extra `EnvFilter` directives appended after `log_level`
    #[serde(default)]
    pub log_directives: Vec<String>,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    /// PostgreSQL connection URL; the in-memory store is used when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub postgres_max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

/// Pool tuning
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Retry rounds before a record is rejected with `retry_exhausted`
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Symmetric jitter as a fraction of the delay (0.2 = ±20%)
    pub backoff_jitter: f64,
    /// TTL applied when a creation request does not carry one
    pub default_ttl_secs: u64,
    pub reaper_interval_secs: u64,
    pub reaper_batch_size: usize,
    /// Events handled concurrently by the listener
    pub listener_concurrency: usize,
    /// Capacity of the inbound event channel
    pub event_buffer: usize,
    pub recheck_policy: RecheckPolicy,
    pub allow_self_transfer: bool,
    /// Calls to the executor per record; >1 re-attempts transient errors
    pub execution_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 300_000,
            backoff_jitter: 0.2,
            default_ttl_secs: 86_400,
            reaper_interval_secs: 60,
            reaper_batch_size: 100,
            listener_concurrency: 64,
            event_buffer: 1_024,
            recheck_policy: RecheckPolicy::FailedOnly,
            allow_self_transfer: false,
            execution_attempts: 1,
        }
    }
}

impl PoolConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.backoff_base_ms > 0, "pool.backoff_base_ms must be > 0");
        anyhow::ensure!(
            self.backoff_cap_ms >= self.backoff_base_ms,
            "pool.backoff_cap_ms must be >= pool.backoff_base_ms"
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&self.backoff_jitter),
            "pool.backoff_jitter must be in [0, 1)"
        );
        anyhow::ensure!(self.default_ttl_secs > 0, "pool.default_ttl_secs must be > 0");
        anyhow::ensure!(self.reaper_interval_secs > 0, "pool.reaper_interval_secs must be > 0");
        anyhow::ensure!(self.execution_attempts > 0, "pool.execution_attempts must be > 0");
        Ok(())
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid config file: {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        crate::logging::rotation(&config.rotation)?;
        config.pool.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
log_level: info
log_dir: ./logs
log_file: pool.log
use_json: false
rotation: never
gateway:
  host: 127.0.0.1
  port: 8080
"#;

    #[test]
    fn test_pool_defaults_apply() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.pool.max_retries, 10);
        assert_eq!(config.pool.backoff_base(), Duration::from_secs(1));
        assert_eq!(config.pool.backoff_cap(), Duration::from_secs(300));
        assert_eq!(config.pool.default_ttl(), Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.pool.recheck_policy, RecheckPolicy::FailedOnly);
        assert!(config.postgres_url.is_none());
    }

    #[test]
    fn test_pool_overrides() {
        let yaml = format!(
            "{}pool:\n  max_retries: 3\n  recheck_policy: all\n  execution_attempts: 2\n",
            MINIMAL
        );
        let config = AppConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.pool.max_retries, 3);
        assert_eq!(config.pool.recheck_policy, RecheckPolicy::All);
        assert_eq!(config.pool.execution_attempts, 2);
        assert_eq!(config.pool.reaper_batch_size, 100);
    }

    #[test]
    fn test_invalid_pool_config_is_rejected() {
        let yaml = format!("{}pool:\n  backoff_jitter: 1.5\n", MINIMAL);
        assert!(AppConfig::from_yaml(&yaml).is_err());

        let yaml = format!("{}pool:\n  backoff_base_ms: 500\n  backoff_cap_ms: 100\n", MINIMAL);
        assert!(AppConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_unknown_rotation_is_rejected() {
        let yaml = MINIMAL.replace("rotation: never", "rotation: weekly");
        assert!(AppConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(AppConfig::load("does-not-exist").is_err());
    }
}
