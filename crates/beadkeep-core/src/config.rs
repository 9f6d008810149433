//! Configuration loaded from an optional TOML file with an environment
//! overlay, following the layered `Config::load` pattern used throughout
//! this lineage: defaults first, file second, environment last.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub repo: RepoConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repo: RepoConfig::default(),
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            watchdog: WatchdogConfig::default(),
            notification: NotificationConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl Config {
    /// Load from `~/.beadkeep/config.toml` if present, then apply the
    /// environment overlay described in the external-interfaces section.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let mut cfg = if path.exists() {
            Self::load_from(&path)?
        } else {
            Config::default()
        };
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Overlay the environment variables enumerated in the external
    /// interfaces section on top of whatever the file (or default)
    /// already set.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_u64("MEMORY_LIMIT_GB") {
            self.worker.memory_limit_gb = v;
        }
        if let Some(v) = env_u64("TIMEOUT_MINUTES") {
            self.worker.timeout_minutes = v;
        }
        if let Some(v) = env_u32("MAX_RETRIES") {
            self.retry.max_retries = v;
        }
        if let Some(v) = env_u64("STALL_SECONDS") {
            self.watchdog.stall_seconds = v;
        }
        if let Ok(url) = std::env::var("WEBHOOK_URL") {
            if !url.is_empty() {
                self.notification.webhook_url = Some(url);
            }
        }
        if let Ok(v) = std::env::var("USE_BEADS") {
            self.repo.use_beads = !v.is_empty() && v != "0" && v.to_lowercase() != "false";
        }
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".beadkeep")
            .join("config.toml")
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Path to the managed git repository's working copy.
    pub path: PathBuf,
    /// Selects this persistent backend over a collaborator SQL backend;
    /// only this one is in scope, so the flag defaults on.
    pub use_beads: bool,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            use_beads: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Command template: the executable plus its argument template. `{workdir}`
    /// and `{prompt_file}` are substituted by the driver.
    pub command: String,
    pub args: Vec<String>,
    pub memory_limit_gb: u64,
    pub timeout_minutes: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "echo".to_string(),
            args: vec!["no worker command configured".to_string()],
            memory_limit_gb: 4,
            timeout_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub stall_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stall_seconds: 300,
            sweep_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Number of supervisor loops to run concurrently.
    pub concurrency: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.worker.memory_limit_gb, 4);
        assert_eq!(cfg.worker.timeout_minutes, 30);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.watchdog.stall_seconds, 300);
        assert!(cfg.notification.webhook_url.is_none());
    }

    #[test]
    fn env_overlay_overrides_defaults() {
        std::env::set_var("MAX_RETRIES", "7");
        std::env::set_var("STALL_SECONDS", "45");
        let mut cfg = Config::default();
        cfg.apply_env();
        assert_eq!(cfg.retry.max_retries, 7);
        assert_eq!(cfg.watchdog.stall_seconds, 45);
        std::env::remove_var("MAX_RETRIES");
        std::env::remove_var("STALL_SECONDS");
    }

    #[test]
    fn load_from_missing_path_errors() {
        let err = Config::load_from("/nonexistent/beadkeep/config.toml");
        assert!(err.is_err());
    }
}
