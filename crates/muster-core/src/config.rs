//! Engine configuration: a TOML file plus a layered resolution chain.
//!
//! Resolution order, for every tunable: CLI flag > environment variable >
//! config file > built-in default, with an XDG-only config directory
//! policy.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// On-disk representation of `$XDG_CONFIG_HOME/muster/config.toml`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub engine: EngineSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EngineSection {
    pub max_instances: Option<usize>,
    pub default_task_timeout_secs: Option<u64>,
    pub output_buffer_bytes: Option<usize>,
    pub worker_command: Option<String>,
    pub health_sweep_interval_secs: Option<u64>,
    pub stop_grace_secs: Option<u64>,
}

/// Return the muster config directory.
///
/// Always XDG layout: `$XDG_CONFIG_HOME/muster` or `~/.config/muster`. We
/// deliberately do not use `dirs::config_dir()`, which would resolve to a
/// platform-specific directory on macOS/Windows.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("muster");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("muster")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

fn load_config_file() -> Option<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path).ok()?;
    toml::from_str(&contents).ok()
}

/// Fully resolved, ready-to-use engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_instances: usize,
    pub default_task_timeout: Duration,
    pub output_buffer_bytes: usize,
    pub worker_command: Vec<String>,
    pub health_sweep_interval: Duration,
    pub stop_grace: Duration,
}

/// Overrides supplied on the command line; `None` means "not given".
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub max_instances: Option<usize>,
    pub default_task_timeout_secs: Option<u64>,
    pub output_buffer_bytes: Option<usize>,
    pub worker_command: Option<String>,
    pub health_sweep_interval_secs: Option<u64>,
    pub stop_grace_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_instances: 4,
            default_task_timeout: Duration::from_secs(1800),
            output_buffer_bytes: 64 * 1024,
            worker_command: vec!["/bin/sh".to_string()],
            health_sweep_interval: Duration::from_secs(30),
            stop_grace: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > built-in default.
    pub fn resolve(cli: &CliOverrides) -> Result<Self, EngineError> {
        let file = load_config_file().unwrap_or_default();
        let defaults = EngineConfig::default();

        let max_instances = cli
            .max_instances
            .or_else(|| env_usize("MUSTER_MAX_INSTANCES"))
            .or(file.engine.max_instances)
            .unwrap_or(defaults.max_instances);

        let default_task_timeout_secs = cli
            .default_task_timeout_secs
            .or_else(|| env_u64("MUSTER_DEFAULT_TASK_TIMEOUT_SECS"))
            .or(file.engine.default_task_timeout_secs)
            .unwrap_or_else(|| defaults.default_task_timeout.as_secs());

        let output_buffer_bytes = cli
            .output_buffer_bytes
            .or_else(|| env_usize("MUSTER_OUTPUT_BUFFER_BYTES"))
            .or(file.engine.output_buffer_bytes)
            .unwrap_or(defaults.output_buffer_bytes);

        let worker_command = cli
            .worker_command
            .clone()
            .or_else(|| std::env::var("MUSTER_WORKER_COMMAND").ok())
            .or(file.engine.worker_command)
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|| defaults.worker_command.clone());

        if worker_command.is_empty() {
            return Err(EngineError::Configuration(
                "worker_command must not be empty".to_string(),
            ));
        }

        let health_sweep_interval_secs = cli
            .health_sweep_interval_secs
            .or_else(|| env_u64("MUSTER_HEALTH_SWEEP_INTERVAL_SECS"))
            .or(file.engine.health_sweep_interval_secs)
            .unwrap_or_else(|| defaults.health_sweep_interval.as_secs());

        let stop_grace_secs = cli
            .stop_grace_secs
            .or_else(|| env_u64("MUSTER_STOP_GRACE_SECS"))
            .or(file.engine.stop_grace_secs)
            .unwrap_or_else(|| defaults.stop_grace.as_secs());

        if max_instances == 0 {
            return Err(EngineError::Configuration(
                "max_instances must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            max_instances,
            default_task_timeout: Duration::from_secs(default_task_timeout_secs),
            output_buffer_bytes,
            worker_command,
            health_sweep_interval: Duration::from_secs(health_sweep_interval_secs),
            stop_grace: Duration::from_secs(stop_grace_secs),
        })
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> std::io::Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let contents = toml::to_string_pretty(config).expect("ConfigFile always serializes");
    std::fs::write(&path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_set() {
        let cfg = EngineConfig::resolve(&CliOverrides::default()).unwrap();
        assert_eq!(cfg.max_instances, 4);
        assert_eq!(cfg.worker_command, vec!["/bin/sh".to_string()]);
    }

    #[test]
    fn cli_override_wins() {
        let overrides = CliOverrides {
            max_instances: Some(8),
            ..Default::default()
        };
        let cfg = EngineConfig::resolve(&overrides).unwrap();
        assert_eq!(cfg.max_instances, 8);
    }

    #[test]
    fn rejects_zero_max_instances() {
        let overrides = CliOverrides {
            max_instances: Some(0),
            ..Default::default()
        };
        assert!(EngineConfig::resolve(&overrides).is_err());
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(path.ends_with("muster/config.toml"));
    }
}
