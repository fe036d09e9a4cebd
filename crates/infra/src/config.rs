//! Engine configuration.
//!
//! Loaded from `HAULAGE_*` environment variables over defaults, or deserialized
//! from JSON (durations in milliseconds). Always validated before use.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_MAX_PARALLEL_TASKS: &str = "HAULAGE_MAX_PARALLEL_TASKS";
pub const ENV_TASK_TIMEOUT_MS: &str = "HAULAGE_TASK_TIMEOUT_MS";
pub const ENV_RESTART_INTERVAL_MS: &str = "HAULAGE_RESTART_INTERVAL_MS";
pub const ENV_RESTART_TASKS_OLDER_THAN_MS: &str = "HAULAGE_RESTART_TASKS_OLDER_THAN_MS";
pub const ENV_SHUTDOWN_GRACE_MS: &str = "HAULAGE_SHUTDOWN_GRACE_MS";
pub const ENV_SOURCE_RETRY_DELAY_MS: &str = "HAULAGE_SOURCE_RETRY_DELAY_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be an unsigned integer, got {value:?}")]
    NotANumber { key: &'static str, value: String },

    #[error("max_parallel_tasks must be at least 1")]
    NoParallelism,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent handler invocations per queue.
    pub max_parallel_tasks: usize,
    #[serde(rename = "task_timeout_ms", with = "millis")]
    pub task_timeout: Duration,
    /// Orphan sweep period.
    #[serde(rename = "restart_interval_ms", with = "millis")]
    pub restart_interval: Duration,
    /// Age after which an in-flight marker counts as orphaned.
    #[serde(rename = "restart_tasks_older_than_ms", with = "millis")]
    pub restart_tasks_older_than: Duration,
    #[serde(rename = "shutdown_grace_ms", with = "millis")]
    pub shutdown_grace: Duration,
    #[serde(rename = "source_retry_delay_ms", with = "millis")]
    pub source_retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: 10,
            task_timeout: Duration::from_secs(30),
            restart_interval: Duration::from_secs(60),
            restart_tasks_older_than: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(10),
            source_retry_delay: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by whatever `HAULAGE_*` variables are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(n) = read_u64(&lookup, ENV_MAX_PARALLEL_TASKS)? {
            config.max_parallel_tasks = usize::try_from(n).unwrap_or(usize::MAX);
        }
        if let Some(ms) = read_u64(&lookup, ENV_TASK_TIMEOUT_MS)? {
            config.task_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = read_u64(&lookup, ENV_RESTART_INTERVAL_MS)? {
            config.restart_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = read_u64(&lookup, ENV_RESTART_TASKS_OLDER_THAN_MS)? {
            config.restart_tasks_older_than = Duration::from_millis(ms);
        }
        if let Some(ms) = read_u64(&lookup, ENV_SHUTDOWN_GRACE_MS)? {
            config.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = read_u64(&lookup, ENV_SOURCE_RETRY_DELAY_MS)? {
            config.source_retry_delay = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_tasks == 0 {
            return Err(ConfigError::NoParallelism);
        }
        let durations = [
            ("task_timeout", self.task_timeout),
            ("restart_interval", self.restart_interval),
            ("restart_tasks_older_than", self.restart_tasks_older_than),
            ("shutdown_grace", self.shutdown_grace),
            ("source_retry_delay", self.source_retry_delay),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        Ok(())
    }
}

fn read_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<u64>()
        .map(Some)
        .map_err(|_| ConfigError::NotANumber { key, value: raw })
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
        assert_eq!(EngineConfig::from_lookup(lookup(&[])).unwrap(), EngineConfig::default());
    }

    #[test]
    fn env_overrides_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_MAX_PARALLEL_TASKS, "3"),
            (ENV_TASK_TIMEOUT_MS, "1500"),
            (ENV_RESTART_TASKS_OLDER_THAN_MS, " 60000 "),
        ]))
        .unwrap();

        assert_eq!(config.max_parallel_tasks, 3);
        assert_eq!(config.task_timeout, Duration::from_millis(1500));
        assert_eq!(config.restart_tasks_older_than, Duration::from_secs(60));
        assert_eq!(config.restart_interval, EngineConfig::default().restart_interval);
    }

    #[test]
    fn rejects_garbage_and_zero() {
        let err = EngineConfig::from_lookup(lookup(&[(ENV_TASK_TIMEOUT_MS, "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::NotANumber { key: ENV_TASK_TIMEOUT_MS, .. }));

        let err = EngineConfig::from_lookup(lookup(&[(ENV_MAX_PARALLEL_TASKS, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::NoParallelism));

        let err = EngineConfig::from_lookup(lookup(&[(ENV_RESTART_INTERVAL_MS, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroDuration("restart_interval")));
    }

    #[test]
    fn json_uses_millisecond_fields_and_defaults() {
        let config =
            EngineConfig::from_json(r#"{"max_parallel_tasks": 2, "task_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.max_parallel_tasks, 2);
        assert_eq!(config.task_timeout, Duration::from_millis(250));
        assert_eq!(config.shutdown_grace, EngineConfig::default().shutdown_grace);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["task_timeout_ms"], 250);
    }
}
