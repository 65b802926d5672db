//! Error types for hardware capability calls and manager operations

use thiserror::Error;

use crate::hw::{HwId, HwType};
use crate::resource::OutPortId;

/// Result type alias for manager operations
pub type Result<T> = std::result::Result<T, IspError>;

/// Errors returned by a single hardware instance
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HwError {
    /// Resource is held by someone else; the caller may try another instance
    #[error("Resource busy")]
    Busy,

    /// Capability mismatch or invalid argument
    #[error("Rejected: {reason}")]
    Rejected { reason: String },

    #[error("Hardware timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Hardware error: {reason}")]
    Hardware { reason: String },

    /// Operation not valid in the resource's current state
    #[error("Invalid hardware state: {state}")]
    InvalidState { state: String },
}

impl HwError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn hardware(reason: impl Into<String>) -> Self {
        Self::Hardware {
            reason: reason.into(),
        }
    }

    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// The "try next candidate" case during graph building
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

/// Errors that can occur during manager operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IspError {
    /// A required hardware family has no usable instance
    #[error("No usable {hw_type} instances detected")]
    NoDevicesFound { hw_type: HwType },

    /// Node pool has no free slot
    #[error("{pool} pool exhausted (capacity {capacity})")]
    PoolExhausted { pool: &'static str, capacity: usize },

    #[error("No free context (max {max})")]
    NoFreeContext { max: usize },

    #[error("Invalid context {index}")]
    InvalidContext { index: usize },

    /// Operation not valid for the context's lifecycle state
    #[error("Context {index} in invalid state: {state}")]
    InvalidState { index: usize, state: String },

    /// Requested output id is outside the port tables
    #[error("Unmapped output port {0}")]
    UnmappedOutPort(OutPortId),

    /// Request cannot be satisfied by the hardware topology
    #[error("Request rejected: {reason}")]
    Rejected { reason: String },

    /// Hardware call failed on a specific instance
    #[error("{hw}: {source}")]
    Hw {
        hw: HwId,
        #[source]
        source: HwError,
    },

    #[error("Operation timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Command-DMA engine confirmed hung and was reset
    #[error("Command DMA hang on context {index}, request {request_id}")]
    CdmHang { index: usize, request_id: u64 },

    /// Node handle generation does not match the slot
    #[error("Stale node handle {index}:{generation}")]
    StaleHandle { index: usize, generation: u32 },

    /// Stream group still referenced by a context
    #[error("Stream group for sensor {sensor_id} busy ({acquire_cnt} holders)")]
    StreamGroupBusy { sensor_id: u32, acquire_cnt: u32 },

    #[error("Unsupported acquire version {0}")]
    UnsupportedVersion(String),
}

impl IspError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn invalid_state(index: usize, state: impl Into<String>) -> Self {
        Self::InvalidState {
            index,
            state: state.into(),
        }
    }

    pub fn hw(hw: HwId, source: HwError) -> Self {
        Self::Hw { hw, source }
    }

    /// Whether this error came from a busy hardware instance
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Hw { source, .. } if source.is_busy())
    }
}
