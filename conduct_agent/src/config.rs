//! Orchestrator configuration.
//!
//! Every section has defaults, so a YAML file only needs the values it
//! changes. Durations are in milliseconds.
//!
//! ```yaml
//! resources:
//!   total_cpu: 16
//!   total_memory: 16384
//!   max_concurrent_tasks: 8
//! executor:
//!   enable_jitter: false
//! monitor:
//!   slow_task_threshold: 30000
//! engine:
//!   retained_statuses: 500
//! ```

use crate::workflow::{EngineConfig, ExecutorConfig};
use conduct_core::ResourcePoolConfig;
use conduct_runtime::MonitorConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration errors.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml::Error),
}

/// Settings for every component the orchestrator wires together.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub resources: ResourcePoolConfig,
    pub executor: ExecutorConfig,
    pub monitor: MonitorConfig,
    pub engine: EngineConfig,
}

impl OrchestratorConfig {
    /// Parses and validates a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a YAML file.
    pub async fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_yaml_str(&content)
    }

    /// Rejects settings no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.resources;
        if r.total_cpu == 0 || r.total_memory == 0 || r.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid(
                "resource pool needs non-zero cpu, memory and concurrency".to_string(),
            ));
        }
        if self.monitor.alert_channel_capacity == 0 {
            return Err(ConfigError::Invalid("alert_channel_capacity must be at least 1".to_string()));
        }
        if self.engine.resource_poll_interval == Duration::ZERO {
            return Err(ConfigError::Invalid("resource_poll_interval must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.resources.total_cpu, 8);
        assert_eq!(config.monitor.slow_task_threshold, Duration::from_secs(60));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = OrchestratorConfig::from_yaml_str(
            "resources:\n  total_cpu: 16\nexecutor:\n  enable_jitter: false\nengine:\n  resource_poll_interval: 10\n",
        )
        .unwrap();
        assert_eq!(config.resources.total_cpu, 16);
        assert_eq!(config.resources.total_memory, 8192);
        assert!(!config.executor.enable_jitter);
        assert_eq!(config.engine.resource_poll_interval, Duration::from_millis(10));
        assert_eq!(config.engine.retained_statuses, 100);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            OrchestratorConfig::from_yaml_str("resources:\n  total_cpu: 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            OrchestratorConfig::from_yaml_str("resources: [1, 2]"),
            Err(ConfigError::YamlParse(_))
        ));
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conduct.yaml");
        tokio::fs::write(&path, "monitor:\n  slow_task_threshold: 30000\n")
            .await
            .unwrap();

        let config = OrchestratorConfig::from_yaml_file(&path).await.unwrap();
        assert_eq!(config.monitor.slow_task_threshold, Duration::from_secs(30));
    }
}
