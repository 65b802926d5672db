//! Acquire request types: in-port descriptions and requested outputs

use serde::{Deserialize, Serialize};

use crate::resource::OutPortId;

/// Explicit request version; only the superset layout is accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquireVersion {
    V1,
    V2,
    #[default]
    V3,
}

/// Who controls the physical hardware backing a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquireKind {
    /// Local hardware, configured through the command-DMA service
    #[default]
    Real,
    /// Remote-processor controlled hardware only
    Virtual,
    /// Local hardware whose out ports are published for a remote sensor controller
    Hybrid,
}

/// Single or dual-ISP usage of one in-port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageType {
    #[default]
    Single,
    Dual,
}

/// Where pixel data enters the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputSource {
    /// Sensor PHY by index
    Phy(u8),
    /// Test pattern generator by index
    Tpg(u8),
    /// Fetch engine reading from memory (offline)
    Fetch,
}

impl Default for InputSource {
    fn default() -> Self {
        Self::Phy(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaneType {
    #[default]
    Dphy,
    Cphy,
}

/// SFE operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SfeMode {
    #[default]
    None,
    /// Staggered HDR
    Shdr,
    /// Front-end fetch with line buffering
    Fs,
}

/// Virtual channel / data type pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VcDt {
    pub vc: u32,
    pub dt: u32,
}

impl VcDt {
    pub const fn new(vc: u32, dt: u32) -> Self {
        Self { vc, dt }
    }
}

impl std::fmt::Display for VcDt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vc{}/dt{:#x}", self.vc, self.dt)
    }
}

/// One requested output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutRequest {
    pub id: OutPortId,
    #[serde(default)]
    pub format: u32,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub secure: bool,
}

impl OutRequest {
    pub fn new(id: OutPortId) -> Self {
        Self {
            id,
            format: 0,
            width: 0,
            height: 0,
            secure: false,
        }
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }
}

/// Logical input description handed to the graph builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InPort {
    #[serde(default)]
    pub source: InputSource,
    #[serde(default)]
    pub lane_type: LaneType,
    #[serde(default = "default_lane_num")]
    pub lane_num: u32,
    #[serde(default)]
    pub lane_cfg: u32,
    /// vc/dt pairs; the first one is the primary stream
    #[serde(default)]
    pub vc_dt: Vec<VcDt>,
    #[serde(default)]
    pub format: u32,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub usage: UsageType,
    #[serde(default)]
    pub horizontal_bin: bool,
    #[serde(default)]
    pub qcfa_bin: bool,
    #[serde(default)]
    pub crop_enable: bool,
    #[serde(default)]
    pub drop_enable: bool,
    /// Lite instances may satisfy RDI-only requests
    #[serde(default)]
    pub can_use_lite: bool,
    #[serde(default)]
    pub dsp_mode: bool,
    #[serde(default)]
    pub sfe_mode: SfeMode,
    #[serde(default = "default_num_exposures")]
    pub num_exposures: u32,
    #[serde(default)]
    pub aeb_mode: bool,
    /// LCR is sourced from an RDI instead of the pixel path
    #[serde(default)]
    pub rdi_lcr: bool,
    /// Physical sensor id, used as the stream-group key
    #[serde(default)]
    pub sensor_id: u32,
    /// Acquire through the per-port stream-group cache
    #[serde(default)]
    pub per_port: bool,
    pub outputs: Vec<OutRequest>,
}

fn default_lane_num() -> u32 {
    4
}

fn default_num_exposures() -> u32 {
    1
}

impl Default for InPort {
    fn default() -> Self {
        Self {
            source: InputSource::default(),
            lane_type: LaneType::default(),
            lane_num: default_lane_num(),
            lane_cfg: 0x3210,
            vc_dt: vec![VcDt::new(0, 0x2b)],
            format: 0,
            width: 1920,
            height: 1080,
            usage: UsageType::Single,
            horizontal_bin: false,
            qcfa_bin: false,
            crop_enable: false,
            drop_enable: false,
            can_use_lite: false,
            dsp_mode: false,
            sfe_mode: SfeMode::None,
            num_exposures: default_num_exposures(),
            aeb_mode: false,
            rdi_lcr: false,
            sensor_id: 0,
            per_port: false,
            outputs: Vec::new(),
        }
    }
}

impl InPort {
    /// Single-usage port on PHY 0 with the given outputs
    pub fn with_outputs(outputs: impl IntoIterator<Item = OutPortId>) -> Self {
        Self {
            outputs: outputs.into_iter().map(OutRequest::new).collect(),
            ..Self::default()
        }
    }

    pub fn dual(mut self) -> Self {
        self.usage = UsageType::Dual;
        self
    }

    pub fn is_dual(&self) -> bool {
        self.usage == UsageType::Dual
    }

    pub fn is_fetch(&self) -> bool {
        self.source == InputSource::Fetch
    }

    pub fn uses_sfe(&self) -> bool {
        self.sfe_mode != SfeMode::None
    }

    /// Primary vc/dt, used for CSID reservation and stream-group matching
    pub fn primary_vc_dt(&self) -> VcDt {
        self.vc_dt.first().copied().unwrap_or_default()
    }

    /// Whether every requested output is an RDI
    pub fn is_rdi_only(&self) -> bool {
        !self.outputs.is_empty() && self.outputs.iter().all(|o| o.id.rdi_index().is_some())
    }

    pub fn has_secure_output(&self) -> bool {
        self.outputs.iter().any(|o| o.secure)
    }
}

/// Context-level configuration flags carried by the acquire request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CtxConfig {
    #[serde(default)]
    pub frame_header_ts: bool,
    #[serde(default)]
    pub sw_sync: bool,
    #[serde(default)]
    pub dynamic_switch: bool,
    /// Capture register and mini dumps when this context hits an error
    #[serde(default)]
    pub dump_on_error: bool,
}

/// Full acquire request
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AcquireRequest {
    #[serde(default)]
    pub version: AcquireVersion,
    #[serde(default)]
    pub kind: AcquireKind,
    pub in_ports: Vec<InPort>,
    #[serde(default)]
    pub ctx_config: CtxConfig,
}

impl AcquireRequest {
    pub fn new(in_ports: Vec<InPort>) -> Self {
        Self {
            in_ports,
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: AcquireKind) -> Self {
        self.kind = kind;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rdi_only_detection() {
        let port = InPort::with_outputs([OutPortId::RDI0, OutPortId::RDI1]);
        assert!(port.is_rdi_only());

        let port = InPort::with_outputs([OutPortId::FULL, OutPortId::RDI0]);
        assert!(!port.is_rdi_only());
    }

    #[test]
    fn test_in_port_from_json_defaults() {
        let json = r#"{ "usage": "dual", "outputs": [ { "id": 12288 } ] }"#;
        let port: InPort = serde_json::from_str(json).unwrap();
        assert!(port.is_dual());
        assert_eq!(port.lane_num, 4);
        assert_eq!(port.num_exposures, 1);
        assert_eq!(port.outputs[0].id, OutPortId::FULL);
        assert!(port.vc_dt.is_empty());
        assert_eq!(port.primary_vc_dt(), VcDt::default());
    }

    #[test]
    fn test_request_defaults_to_v3_real() {
        let req: AcquireRequest = serde_json::from_str(r#"{ "in_ports": [] }"#).unwrap();
        assert_eq!(req.version, AcquireVersion::V3);
        assert_eq!(req.kind, AcquireKind::Real);
    }
}
