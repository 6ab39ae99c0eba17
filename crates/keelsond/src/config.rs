//! keelsond.toml configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use keelson_scheduler::WorkerConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelsonConfig {
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory holding the state database.
    pub data_dir: PathBuf,
    /// Number of scheduler workers.
    pub workers: usize,
    /// How often the dispatcher polls for pending evaluations.
    pub poll_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/keelson"),
            workers: 4,
            poll_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Overrides every scheduler's plan attempt budget when set.
    pub max_plan_attempts: Option<u32>,
    /// How long a worker waits for the store to catch up to an evaluation.
    pub snapshot_wait_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_plan_attempts: None,
            snapshot_wait_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info,keelsond=debug,keelson=debug".to_string(),
            json: false,
        }
    }
}

impl KeelsonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: KeelsonConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, otherwise the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.workers == 0 {
            anyhow::bail!("server.workers must be at least 1");
        }
        if self.server.poll_interval_ms == 0 {
            anyhow::bail!("server.poll_interval_ms must be positive");
        }
        if self.scheduler.max_plan_attempts == Some(0) {
            anyhow::bail!("scheduler.max_plan_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.server.data_dir.join("keelson.redb")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.server.poll_interval_ms)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            snapshot_wait: Duration::from_millis(self.scheduler.snapshot_wait_ms),
            max_plan_attempts: self.scheduler.max_plan_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: KeelsonConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.log.filter, "info,keelsond=debug,keelson=debug");
        assert!(config.scheduler.max_plan_attempts.is_none());
        assert_eq!(config.worker_config().snapshot_wait, Duration::from_secs(5));
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[server]
data_dir = "/tmp/keelson"
workers = 8

[scheduler]
max_plan_attempts = 3

[log]
json = true
"#;
        let config: KeelsonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.db_path(), PathBuf::from("/tmp/keelson/keelson.redb"));
        assert_eq!(config.server.workers, 8);
        assert_eq!(config.server.poll_interval_ms, 250);
        assert_eq!(config.worker_config().max_plan_attempts, Some(3));
        assert!(config.log.json);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keelsond.toml");
        std::fs::write(&path, "[server]\nworkers = 0\n").unwrap();

        let err = KeelsonConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("server.workers"));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(KeelsonConfig::load(Some(Path::new("/nonexistent/keelsond.toml"))).is_err());
        assert!(KeelsonConfig::load(None).is_ok());
    }
}
