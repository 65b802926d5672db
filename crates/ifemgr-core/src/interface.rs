//! Capability interfaces the manager drives
//!
//! Each physical CSID, SFE or IFE instance is reached only through [`IspHw`];
//! the command-DMA engine through [`CdmService`]. Register-level drivers sit
//! behind these traits and are selected once, when the registry is built.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HwError;
use crate::event::HwEventSink;
use crate::hw::{HwCaps, HwId, Split, SyncMode};
use crate::port::{InputSource, VcDt};
use crate::resource::{NodeRes, OutPortId};

/// Who a reservation is made for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Owner {
    /// A single context, by index
    Ctx(usize),
    /// A per-port stream group, by group index
    Group(u32),
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ctx(idx) => write!(f, "ctx{}", idx),
            Self::Group(g) => write!(f, "group{}", g),
        }
    }
}

/// Arguments for one `reserve` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveArgs {
    pub res: NodeRes,
    pub owner: Owner,
    /// Which half of a dual pair this reservation is for
    pub split: Option<Split>,
    pub sync: SyncMode,
    pub source: InputSource,
    pub vc_dt: Vec<VcDt>,
    pub width: u32,
    pub height: u32,
    pub crop_enable: bool,
    pub drop_enable: bool,
    pub secure: bool,
    /// Only lite instances may satisfy this reservation
    pub need_lite: bool,
}

impl ReserveArgs {
    pub fn new(res: NodeRes, owner: Owner) -> Self {
        Self {
            res,
            owner,
            split: None,
            sync: SyncMode::None,
            source: InputSource::default(),
            vc_dt: Vec::new(),
            width: 0,
            height: 0,
            crop_enable: false,
            drop_enable: false,
            secure: false,
            need_lite: false,
        }
    }
}

/// Proof of a successful `reserve`; handed back on every later call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reservation {
    pub hw: HwId,
    pub res: NodeRes,
    /// Instance-local reservation id
    pub id: u64,
}

/// Stop policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// Halt at the next frame boundary
    #[default]
    AtFrameBoundary,
    Immediately,
}

/// What a reset covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetScope {
    /// The whole instance
    Core,
    /// One reserved path
    Path(Reservation),
    /// CSID global reset (all paths, all instances sharing the reset domain)
    Global,
}

/// Commands accepted by `process_cmd`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HwCmd {
    Clock { rate_hz: u64 },
    Bandwidth { ab: u64, ib: u64 },
    /// Enable or disable interrupts for one reserved path without touching streaming state
    IrqMask { rsv: Reservation, enable: bool },
    /// Program dual-ISP master/slave sync for a reserved path
    DualSync { rsv: Reservation, sync: SyncMode },
    RegDump,
    GetTimestamp,
    MiniDump,
    /// Forward a register payload to a remote-controlled instance
    RemoteConfig { ctx: usize, payload: Vec<u32> },
    /// Publish a hybrid context's out ports to the remote sensor controller
    PopulateOutPorts { ctx: usize, ports: Vec<OutPortId> },
    Scratch { port: OutPortId, addr: u64 },
}

impl HwCmd {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Clock { .. } => "clock",
            Self::Bandwidth { .. } => "bandwidth",
            Self::IrqMask { .. } => "irq_mask",
            Self::DualSync { .. } => "dual_sync",
            Self::RegDump => "reg_dump",
            Self::GetTimestamp => "get_timestamp",
            Self::MiniDump => "mini_dump",
            Self::RemoteConfig { .. } => "remote_config",
            Self::PopulateOutPorts { .. } => "populate_out_ports",
            Self::Scratch { .. } => "scratch",
        }
    }
}

/// Result of `process_cmd`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HwCmdResult {
    Done,
    Timestamp { sof_ns: u64 },
    /// (offset, value) pairs
    RegDump(Vec<(u32, u32)>),
    MiniDump(serde_json::Value),
}

/// One physical hardware instance
pub trait IspHw: std::fmt::Debug + Send + Sync {
    /// Identity of this instance; known before probing
    fn id(&self) -> HwId;

    /// Probe the instance. A failure excludes it from the registry.
    fn get_hw_caps(&self) -> Result<HwCaps, HwError>;

    fn reserve(&self, args: &ReserveArgs) -> Result<Reservation, HwError>;

    fn release(&self, rsv: &Reservation) -> Result<(), HwError>;

    fn init(&self, rsv: &Reservation) -> Result<(), HwError>;

    fn deinit(&self, rsv: &Reservation) -> Result<(), HwError>;

    fn start(&self, rsv: &Reservation) -> Result<(), HwError>;

    fn stop(&self, rsv: &Reservation, mode: StopMode) -> Result<(), HwError>;

    fn reset(&self, scope: ResetScope) -> Result<(), HwError>;

    fn process_cmd(&self, cmd: HwCmd) -> Result<HwCmdResult, HwError>;

    /// Where this instance delivers interrupts; instances without events may ignore it
    fn register_event_sink(&self, _sink: Weak<dyn HwEventSink>) {}
}

/// Handle to an acquired command-DMA channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CdmHandle(pub u32);

/// Register-write batch entry produced by `prepare_update`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwUpdateEntry {
    pub hw: HwId,
    pub kind: UpdateKind,
    pub payload: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// Register writes applied through command DMA
    Registers,
    Clock,
    Bandwidth,
    Scratch,
}

/// Command-DMA service
pub trait CdmService: std::fmt::Debug + Send + Sync {
    /// Acquire a channel sized for the given number of base entries
    fn acquire(&self, ctx: usize, num_bases: usize) -> Result<CdmHandle, HwError>;

    fn submit(&self, handle: CdmHandle, request_id: u64, batch: &[HwUpdateEntry]) -> Result<(), HwError>;

    /// Wait for a submitted request to be applied; `Err(HwError::Timeout)` on expiry
    fn wait(&self, handle: CdmHandle, request_id: u64, timeout: Duration) -> Result<(), HwError>;

    /// Ask whether the engine behind the channel is hung
    fn detect_hang(&self, handle: CdmHandle) -> bool;

    fn reset(&self, handle: CdmHandle) -> Result<(), HwError>;

    fn stream_on(&self, handle: CdmHandle) -> Result<(), HwError>;

    fn stream_off(&self, handle: CdmHandle) -> Result<(), HwError>;

    fn release(&self, handle: CdmHandle) -> Result<(), HwError>;
}

/// Everything the manager needs from the platform at init
#[derive(Debug, Clone)]
pub struct Platform {
    pub instances: Vec<Arc<dyn IspHw>>,
    pub cdm: Arc<dyn CdmService>,
}
