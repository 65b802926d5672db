//! ifemgr Core - Shared types for the camera ISP hardware manager
//!
//! This crate provides the vocabulary every other ifemgr crate speaks:
//! - Hardware identifiers and capability descriptors (CSID, SFE, IFE)
//! - Resource ids and the output-port table
//! - Acquire requests and in-port descriptions
//! - Resource-graph nodes and the fixed-capacity node pool
//! - The capability traits implemented by hardware and command-DMA drivers
//! - Events, callbacks, configuration and errors

pub mod config;
pub mod ctx;
pub mod error;
pub mod event;
pub mod hw;
pub mod interface;
pub mod node;
pub mod pool;
pub mod port;
pub mod resource;

pub use config::{ManagerConfig, SensorStreamConfig, StreamGroupConfig};
pub use ctx::{ContextState, CtxCounters, CtxFlags, CtxMiniDump, CtxType, FrameCounters};
pub use error::{HwError, IspError, Result};
pub use event::{ErrorKind, EventCallback, HwEvent, HwEventKind, HwEventSink, IspEvent, RecoveryHint};
pub use hw::{BusCaps, HwCaps, HwId, HwType, Split, SyncMode};
pub use interface::{
    CdmHandle, CdmService, HwCmd, HwCmdResult, HwUpdateEntry, IspHw, Owner, Platform, Reservation,
    ReserveArgs, ResetScope, StopMode, UpdateKind,
};
pub use node::{BaseEntry, HwBinding, ResourceNode};
pub use pool::{NodeHandle, NodePool, Pool};
pub use port::{
    AcquireKind, AcquireRequest, AcquireVersion, CtxConfig, InPort, InputSource, LaneType,
    OutRequest, SfeMode, UsageType, VcDt,
};
pub use resource::{CsidPath, IfeSrc, NodeRes, OutFamily, OutPortId, PathCategory, SfeSrc};
