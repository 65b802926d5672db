//! Configuration loading and validation

use anyhow::{Context, Result};
use ifemgr_core::{ManagerConfig, StreamGroupConfig};
use ifemgr_sim::{SimPlatform, SimPlatformConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Hardware manager tunables
    #[serde(default)]
    pub manager: ManagerConfig,
    /// Shape of the simulated hardware
    #[serde(default)]
    pub platform: SimPlatformConfig,
    #[serde(default, rename = "stream_group")]
    pub stream_groups: Vec<StreamGroupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the control API
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_event_capacity() -> usize {
    256
}

impl Config {
    pub fn to_manager_config(&self) -> ManagerConfig {
        self.manager.clone()
    }

    /// Build the simulated hardware described by `[platform]`
    pub fn to_platform(&self) -> Result<SimPlatform> {
        SimPlatform::from_config(&self.platform).context("invalid [platform] section")
    }
}

/// Load configuration from file, falling back to defaults when it is missing
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();

    if !path.exists() {
        info!("Config file not found, using defaults");
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("parsing {}", path.display()))?;

    info!(
        path = %path.display(),
        stream_groups = config.stream_groups.len(),
        "Loaded configuration"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config(&path).unwrap();
        assert_eq!(config.daemon.bind, "127.0.0.1:8090");
        assert_eq!(config.manager, ManagerConfig::default());
        assert!(config.stream_groups.is_empty());
    }

    #[test]
    fn test_full_config_parses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[daemon]
bind = "0.0.0.0:9000"

[manager]
enable_recovery = false
cdm_timeout_ms = 250

[platform]
num_full = 3
num_lite = 2
num_sfe = 1

[[stream_group]]
sensors = [{{ sensor_id = 7 }}, {{ sensor_id = 9 }}]
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.daemon.bind, "0.0.0.0:9000");
        assert_eq!(config.daemon.event_capacity, 256);
        let manager = config.to_manager_config();
        assert!(!manager.enable_recovery);
        assert_eq!(manager.cdm_timeout_ms, 250);
        assert_eq!(config.platform.num_full, 3);
        assert_eq!(config.platform.num_lite, 2);
        assert_eq!(config.stream_groups.len(), 1);
        assert_eq!(config.stream_groups[0].sensors.len(), 2);

        let sim = config.to_platform().unwrap();
        // Three full pairs, two lite pairs, one SFE
        assert_eq!(sim.instances().len(), 11);
    }

    #[test]
    fn test_bad_link_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[platform]
num_full = 1
links = [{{ csid = 0, targets = [5] }}]
"#
        )
        .unwrap();
        let config = load_config(file.path()).unwrap();
        assert!(config.to_platform().is_err());
    }
}
