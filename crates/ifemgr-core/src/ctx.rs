//! Context descriptors shared with callers and callbacks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hw::HwId;
use crate::node::BaseEntry;
use crate::port::AcquireKind;

/// Lifecycle state of a streaming context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    #[default]
    Free,
    Acquired,
    HwInitialized,
    Streaming,
    Stopped,
    HwDeinitialized,
}

impl std::fmt::Display for ContextState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Free => "free",
            Self::Acquired => "acquired",
            Self::HwInitialized => "hw_initialized",
            Self::Streaming => "streaming",
            Self::Stopped => "stopped",
            Self::HwDeinitialized => "hw_deinitialized",
        };
        f.write_str(s)
    }
}

/// Context type, by whether an SFE sits in front of the IFE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CtxType {
    #[default]
    None,
    Sfe,
}

/// Classification flags computed at acquire time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CtxFlags {
    pub is_dual: bool,
    /// Input comes from the fetch engine
    pub is_offline: bool,
    pub is_fe_enabled: bool,
    pub is_rdi_only: bool,
    pub is_lite: bool,
    pub secure_mode: bool,
    pub is_aeb: bool,
    pub is_sfe_shdr: bool,
    pub is_sfe_fs: bool,
    pub dsp_enabled: bool,
    pub per_port_en: bool,
    pub hybrid_acquire: bool,
    pub dump_on_error: bool,
    pub frame_header_ts: bool,
    pub sw_sync: bool,
    pub dynamic_switch: bool,
}

/// Per-core frame counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameCounters {
    pub sof: u64,
    pub epoch: u64,
    pub eof: u64,
}

/// Running counters for one context
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CtxCounters {
    /// Indexed like the base list
    pub per_base: Vec<FrameCounters>,
    pub applied_req_id: u64,
    pub last_cdm_done_req: u64,
    pub num_acq_ife_out: u32,
    pub num_acq_sfe_out: u32,
    pub last_sof_ns: u64,
}

/// Crash-time snapshot of one context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtxMiniDump {
    pub ctx: usize,
    pub state: ContextState,
    pub kind: AcquireKind,
    pub ctx_type: CtxType,
    pub flags: CtxFlags,
    pub base: Vec<BaseEntry>,
    /// Left/right IFE instance of the master path
    pub left_hw: Option<HwId>,
    pub right_hw: Option<HwId>,
    pub counters: CtxCounters,
    pub overflow_pending: bool,
    pub recovery_id: u64,
    pub num_nodes: usize,
    pub acquired_at: Option<DateTime<Utc>>,
    pub captured_at: DateTime<Utc>,
}
