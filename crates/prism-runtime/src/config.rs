//! Engine configuration loading and validation

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DB_FILE_NAME: &str = "orchestrator_results.db";

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Engine configuration. All knobs have working defaults apart from the
/// workspace directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory for persistent state (database, agent directories)
    pub workspace: PathBuf,
    /// Maximum number of subtasks Stage 1 may produce
    #[serde(default = "default_max_subtasks")]
    pub max_subtasks: usize,
    /// Worker pool size; defaults to CPU cores (minimum 2)
    #[serde(default)]
    pub max_parallel: Option<usize>,
    /// Per-task wall-clock budget
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Per-task dependency wait budget
    #[serde(default = "default_dependency_wait_timeout_ms")]
    pub dependency_wait_timeout_ms: u64,
    /// Task-store polling interval while waiting on dependencies
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Skip the answer-validation step
    #[serde(default)]
    pub skip_validation: bool,
}

fn default_max_subtasks() -> usize {
    5
}

fn default_task_timeout_ms() -> u64 {
    120_000
}

fn default_dependency_wait_timeout_ms() -> u64 {
    300_000
}

fn default_poll_interval_ms() -> u64 {
    200
}

impl EngineConfig {
    /// Config with defaults for a workspace directory
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            max_subtasks: default_max_subtasks(),
            max_parallel: None,
            task_timeout_ms: default_task_timeout_ms(),
            dependency_wait_timeout_ms: default_dependency_wait_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            skip_validation: false,
        }
    }

    /// Path of the task-store database file
    pub fn db_path(&self) -> PathBuf {
        self.workspace.join(DB_FILE_NAME)
    }

    /// Worker pool size: the configured value, or CPU cores with a floor
    /// of two.
    pub fn effective_max_parallel(&self) -> usize {
        self.max_parallel.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .max(2)
        })
    }
}

/// Load engine configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: EngineConfig = serde_yaml::from_str(&content)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.workspace.as_os_str().is_empty() {
        return Err(ConfigError::Invalid(
            "workspace must not be empty".to_string(),
        ));
    }
    if config.max_subtasks == 0 {
        return Err(ConfigError::Invalid(
            "max_subtasks must be greater than 0".to_string(),
        ));
    }
    if config.max_parallel == Some(0) {
        return Err(ConfigError::Invalid(
            "max_parallel must be greater than 0".to_string(),
        ));
    }
    if config.task_timeout_ms == 0 {
        return Err(ConfigError::Invalid(
            "task_timeout_ms must be greater than 0".to_string(),
        ));
    }
    if config.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid(
            "poll_interval_ms must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::new("/tmp/prism");
        assert_eq!(config.max_subtasks, 5);
        assert_eq!(config.task_timeout_ms, 120_000);
        assert_eq!(config.dependency_wait_timeout_ms, 300_000);
        assert_eq!(config.poll_interval_ms, 200);
        assert!(!config.skip_validation);
        assert!(config.effective_max_parallel() >= 2);
        assert!(config.db_path().ends_with("orchestrator_results.db"));
    }

    #[test]
    fn test_yaml_round_trip_with_partial_fields() {
        let yaml = "workspace: /tmp/prism\nmax_subtasks: 3\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.max_subtasks, 3);
        assert_eq!(config.poll_interval_ms, 200);
    }

    #[test]
    fn test_zero_max_subtasks_is_invalid() {
        let config = EngineConfig {
            max_subtasks: 0,
            ..EngineConfig::new("/tmp/prism")
        };
        assert!(validate_config(&config).is_err());
    }
}
