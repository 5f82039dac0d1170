use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::coordination::{CoordinatorConfig, ReaperConfig};
use crate::workflow::RetryPolicy;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Override for the coordination state file.
    pub state_path: Option<String>,
    /// Override for the append-only span log.
    pub trace_path: Option<String>,
    pub agent_liveness_secs: u64,
    pub work_staleness_secs: u64,
    pub reaper_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub metrics_interval_secs: u64,
    pub claim_attempts: u32,
    pub lock_wait_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub default_capacity: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_path: None,
            trace_path: None,
            agent_liveness_secs: 90,
            work_staleness_secs: 300,
            reaper_interval_secs: 30,
            heartbeat_interval_secs: 15,
            metrics_interval_secs: 60,
            claim_attempts: 3,
            lock_wait_ms: 250,
            retry_max_attempts: 3,
            retry_initial_backoff_ms: 100,
            retry_max_backoff_ms: 5_000,
            default_capacity: 1,
        }
    }
}

impl Config {
    pub fn hive_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".hive"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::hive_dir()?.join("hive.toml"))
    }

    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.state_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::hive_dir()?.join("state.json")),
        }
    }

    pub fn trace_path(&self) -> Result<PathBuf> {
        match &self.trace_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::hive_dir()?.join("spans.jsonl")),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.claim_attempts == 0 {
            return Err(Error::Validation("claim_attempts must be at least 1".into()));
        }
        if self.retry_max_attempts == 0 {
            return Err(Error::Validation(
                "retry_max_attempts must be at least 1".into(),
            ));
        }
        if self.default_capacity == 0 {
            return Err(Error::Validation("default_capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn agent_liveness(&self) -> Duration {
        Duration::from_secs(self.agent_liveness_secs)
    }

    pub fn work_staleness(&self) -> Duration {
        Duration::from_secs(self.work_staleness_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            claim_attempts: self.claim_attempts,
            ..CoordinatorConfig::default()
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            agent_liveness: self.agent_liveness(),
            work_staleness: self.work_staleness(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            ..RetryPolicy::default()
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
