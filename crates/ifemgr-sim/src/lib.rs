//! ifemgr Sim - Simulated ISP hardware
//!
//! This crate implements the ifemgr capability traits in memory so the
//! manager can run without register-level drivers:
//! - `SimHw` for CSID, SFE and IFE instances, with fault injection
//! - `SimCdm` for the command-DMA engine, with stall/hang injection
//! - `SimPlatform` to lay out full, lite and remote-controlled instances
//! - `CallLog` recording every call for ordering and balance checks

pub mod cdm;
pub mod hw;
pub mod log;
pub mod platform;

pub use cdm::SimCdm;
pub use hw::SimHw;
pub use log::{CallLog, HwCall, HwOp};
pub use platform::{LinkConfig, SimError, SimPlatform, SimPlatformBuilder, SimPlatformConfig};
