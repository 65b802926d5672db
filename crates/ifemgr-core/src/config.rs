//! Manager and stream-group configuration

use serde::{Deserialize, Serialize};

use crate::port::{UsageType, VcDt};
use crate::resource::CsidPath;

/// Tunables for the hardware manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Number of streaming contexts in the free pool
    #[serde(default = "default_max_contexts")]
    pub max_contexts: usize,
    /// Capacity of each context's node pool
    #[serde(default = "default_ctx_pool_size")]
    pub ctx_pool_size: usize,
    /// Maximum number of per-port stream groups
    #[serde(default = "default_max_stream_groups")]
    pub max_stream_groups: usize,
    /// Capacity of each stream group's node pool
    #[serde(default = "default_group_pool_size")]
    pub group_pool_size: usize,
    /// Run stop/reset/restart on overflow-class errors
    #[serde(default = "default_true")]
    pub enable_recovery: bool,
    /// Reset CSID paths as part of recovery
    #[serde(default = "default_true")]
    pub enable_csid_recovery: bool,
    /// Issue a CSID global reset at the end of init
    #[serde(default)]
    pub csid_global_reset: bool,
    /// Command-DMA completion wait
    #[serde(default = "default_cdm_timeout_ms")]
    pub cdm_timeout_ms: u64,
    /// Queue register dumps for every context hit by an error
    #[serde(default)]
    pub enable_req_dump: bool,
    /// Single real-time ports scan instances from the highest index down
    #[serde(default = "default_true")]
    pub prefer_high_index_single: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_contexts: default_max_contexts(),
            ctx_pool_size: default_ctx_pool_size(),
            max_stream_groups: default_max_stream_groups(),
            group_pool_size: default_group_pool_size(),
            enable_recovery: true,
            enable_csid_recovery: true,
            csid_global_reset: false,
            cdm_timeout_ms: default_cdm_timeout_ms(),
            enable_req_dump: false,
            prefer_high_index_single: true,
        }
    }
}

fn default_max_contexts() -> usize {
    8
}

fn default_ctx_pool_size() -> usize {
    crate::pool::RES_POOL_MAX
}

fn default_max_stream_groups() -> usize {
    8
}

fn default_group_pool_size() -> usize {
    crate::pool::STREAM_GRP_RES_POOL_MAX
}

fn default_cdm_timeout_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

/// vc/dt bindings for one sensor inside a stream group
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SensorStreamConfig {
    pub sensor_id: u32,
    #[serde(default)]
    pub usage: UsageType,
    #[serde(default)]
    pub pxl: Option<VcDt>,
    #[serde(default)]
    pub ppp: Option<VcDt>,
    #[serde(default)]
    pub lcr: Option<VcDt>,
    /// Indexed by RDI number
    #[serde(default)]
    pub rdi: Vec<VcDt>,
}

impl SensorStreamConfig {
    /// Configured vc/dt for a CSID path, if the path is bound for this sensor
    pub fn vc_dt_for(&self, path: CsidPath) -> Option<VcDt> {
        match path {
            CsidPath::Ipp => self.pxl.or(self.lcr),
            CsidPath::Ppp => self.ppp,
            CsidPath::Rdi(n) => self.rdi.get(n as usize).copied(),
        }
    }
}

/// Sensors that share one set of hardware in per-port mode
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamGroupConfig {
    #[serde(default)]
    pub sensors: Vec<SensorStreamConfig>,
}

impl StreamGroupConfig {
    pub fn sensor(&self, sensor_id: u32) -> Option<&SensorStreamConfig> {
        self.sensors.iter().find(|s| s.sensor_id == sensor_id)
    }

    pub fn contains(&self, sensor_id: u32) -> bool {
        self.sensor(sensor_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_config_defaults_from_empty_toml() {
        let config: ManagerConfig = toml::from_str("").unwrap();
        assert_eq!(config, ManagerConfig::default());
        assert_eq!(config.max_contexts, 8);
        assert_eq!(config.cdm_timeout_ms, 100);
        assert!(config.enable_recovery);
        assert!(!config.csid_global_reset);
    }

    #[test]
    fn test_stream_group_vc_dt_lookup() {
        let toml = r#"
            [[sensors]]
            sensor_id = 3
            pxl = { vc = 0, dt = 43 }
            rdi = [ { vc = 1, dt = 48 }, { vc = 2, dt = 48 } ]
        "#;
        let group: StreamGroupConfig = toml::from_str(toml).unwrap();
        let sensor = group.sensor(3).unwrap();
        assert_eq!(sensor.vc_dt_for(CsidPath::Ipp), Some(VcDt::new(0, 43)));
        assert_eq!(sensor.vc_dt_for(CsidPath::Rdi(1)), Some(VcDt::new(2, 48)));
        assert_eq!(sensor.vc_dt_for(CsidPath::Rdi(2)), None);
        assert!(!group.contains(4));
    }
}
