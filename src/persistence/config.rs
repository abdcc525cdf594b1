use crate::domain::task::{
    TimeLimit, DEFAULT_TIME_LIMIT_MINUTES, MIN_TIME_LIMIT_MINUTES, TIME_LIMIT_STEP_MINUTES,
};
use crate::ticker::DEFAULT_TICK_MS;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine settings stored in config.json
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Deadline sweep period
    pub monitor_tick_ms: u64,
    /// Elapsed-time counter period
    pub tracker_tick_ms: u64,
    /// Time limit proposed for new tasks
    pub default_time_limit_minutes: u32,
    pub min_time_limit_minutes: u32,
    pub time_limit_step_minutes: u32,
    /// Fallback tracing filter when RUST_LOG is unset
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitor_tick_ms: DEFAULT_TICK_MS,
            tracker_tick_ms: DEFAULT_TICK_MS,
            default_time_limit_minutes: DEFAULT_TIME_LIMIT_MINUTES,
            min_time_limit_minutes: MIN_TIME_LIMIT_MINUTES,
            time_limit_step_minutes: TIME_LIMIT_STEP_MINUTES,
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn monitor_period(&self) -> Duration {
        Duration::from_millis(self.monitor_tick_ms)
    }

    pub fn tracker_period(&self) -> Duration {
        Duration::from_millis(self.tracker_tick_ms)
    }

    /// Time limit for the creation form, or `minutes` when given
    pub fn time_limit(&self, minutes: Option<u32>) -> TimeLimit {
        TimeLimit::with_bounds(
            minutes.unwrap_or(self.default_time_limit_minutes),
            self.min_time_limit_minutes,
            self.time_limit_step_minutes,
        )
    }
}

/// Load config from config.json, defaults if the file doesn't exist
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    let config: Config = serde_json::from_str(&content)
        .with_context(|| format!("Invalid config: {}", path.display()))?;
    Ok(config)
}

/// Save config to config.json
pub fn save_config<P: AsRef<Path>>(path: P, config: &Config) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    crate::persistence::atomic_write(path, &json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_load_nonexistent_config() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.json");

        let config = load_config(&path).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.monitor_period(), Duration::from_secs(1));
        assert_eq!(config.tracker_period(), Duration::from_secs(1));
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.json");

        let config = Config {
            monitor_tick_ms: 500,
            default_time_limit_minutes: 45,
            log_filter: "taskup=debug".to_string(),
            ..Config::default()
        };
        save_config(&path, &config).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, r#"{ "tracker_tick_ms": 250 }"#).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.tracker_tick_ms, 250);
        assert_eq!(loaded.monitor_tick_ms, 1000);
        assert_eq!(loaded.default_time_limit_minutes, 30);
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_time_limit_from_config() {
        let config = Config {
            default_time_limit_minutes: 20,
            min_time_limit_minutes: 10,
            ..Config::default()
        };
        assert_eq!(config.time_limit(None).as_minutes(), 20);
        assert_eq!(config.time_limit(Some(3)).as_minutes(), 10);
    }
}
