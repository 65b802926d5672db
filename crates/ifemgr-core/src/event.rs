//! Hardware notifications and the events delivered to context owners

use serde::{Deserialize, Serialize};

use crate::ctx::CtxMiniDump;
use crate::hw::HwId;
use crate::resource::{NodeRes, OutPortId};

/// Asynchronous error classes reported by hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Overflow,
    BusOverflow,
    Violation,
    FrameSizeMismatch,
    CsidFatal,
    SfeViolation,
}

impl ErrorKind {
    /// Errors reported with their own code to the owner
    pub fn is_fatal_class(&self) -> bool {
        matches!(self, Self::CsidFatal | Self::SfeViolation)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Overflow => "overflow",
            Self::BusOverflow => "bus_overflow",
            Self::Violation => "violation",
            Self::FrameSizeMismatch => "frame_size_mismatch",
            Self::CsidFatal => "csid_fatal",
            Self::SfeViolation => "sfe_violation",
        };
        f.write_str(s)
    }
}

/// Interrupt class raised by an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum HwEventKind {
    Sof,
    Eof,
    Epoch,
    RegUpdate,
    BufDone {
        /// Last consumed address, on buses that report it
        consumed_addr: Option<u64>,
    },
    Error { kind: ErrorKind },
}

/// Notification tagged with the instance and resource that raised it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwEvent {
    pub hw: HwId,
    pub res: NodeRes,
    pub kind: HwEventKind,
    #[serde(default)]
    pub timestamp_ns: u64,
}

/// How the owner should treat an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryHint {
    /// Handled by the manager's own stop/reset/restart
    Internal,
    /// Hardware is reset; the owner is expected to resubmit
    HostRetry,
    /// Context stays halted
    Unrecoverable,
}

/// Event delivered to a context's callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum IspEvent {
    Sof { hw: HwId, timestamp_ns: u64 },
    Eof { hw: HwId },
    Epoch { hw: HwId },
    RegUpdate { hw: HwId },
    BufDone { port: OutPortId, addr: Option<u64> },
    Error {
        kind: ErrorKind,
        hw: HwId,
        /// Every core the affected contexts touch
        affected: Vec<HwId>,
        hint: RecoveryHint,
    },
    /// Recovery finished restarting this context
    Recovered { recovery_id: u64 },
}

/// Per-context owner callbacks
pub trait EventCallback: Send + Sync {
    fn on_event(&self, ctx: usize, event: &IspEvent);

    fn on_mini_dump(&self, _ctx: usize, _dump: &CtxMiniDump) {}
}

/// Receiver of raw hardware notifications
pub trait HwEventSink: Send + Sync {
    fn on_hw_event(&self, event: HwEvent);
}
