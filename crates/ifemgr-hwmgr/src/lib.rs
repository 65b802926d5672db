//! ifemgr Hwmgr - The camera ISP hardware manager
//!
//! This crate hands out CSID, SFE and IFE hardware to streaming contexts and
//! keeps it running:
//! - A capability registry of every probed instance
//! - A resource-graph builder turning in-port requests into reserved paths
//! - The context lifecycle (init, start, stop, reset, config, release)
//! - Per-sensor stream groups shared between contexts
//! - An event router and a background recovery worker

pub mod builder;
pub mod context;
pub mod dump;
pub mod lifecycle;
pub mod manager;
pub mod port_map;
pub mod query;
pub mod recovery;
pub mod registry;
pub mod router;
pub mod stream_group;
pub mod update;

#[cfg(test)]
mod test_util;

pub use context::{CtxTask, RdiMapping, VirtualRdiMap};
pub use lifecycle::{StartArgs, StopArgs};
pub use manager::{ContextSummary, HwManager, ManagerEvent};
pub use query::{QueryCmd, QueryResult};
pub use recovery::{RecoveryBatch, RecoveryReport};
pub use registry::{ClassCounts, HwEntry, Registry, RegistryCounts};
pub use router::recovery_hint;
pub use stream_group::StreamGroupStatus;
pub use update::{ConfigBlob, ConfigPacket, PacketOpcode};
