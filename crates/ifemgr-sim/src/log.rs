//! Shared record of every call made into simulated hardware

use std::sync::Arc;

use ifemgr_core::{HwId, NodeRes};
use parking_lot::Mutex;
use serde::Serialize;

/// Operation recorded in the call log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HwOp {
    Probe,
    Reserve,
    Release,
    Init,
    Deinit,
    Start,
    Stop,
    Reset,
    Cmd(&'static str),
    CdmAcquire,
    CdmSubmit,
    CdmStreamOn,
    CdmStreamOff,
    CdmReset,
    CdmRelease,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HwCall {
    /// `None` for command-DMA calls
    pub hw: Option<HwId>,
    pub op: HwOp,
    pub res: Option<NodeRes>,
    /// Reservation id, where the call carried one
    pub rsv_id: Option<u64>,
    pub ok: bool,
}

/// Cloneable handle to the call log
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<HwCall>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, call: HwCall) {
        self.calls.lock().push(call);
    }

    pub fn calls(&self) -> Vec<HwCall> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    /// Successful calls of one kind
    pub fn ops(&self, op: HwOp) -> Vec<HwCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.op == op && c.ok)
            .cloned()
            .collect()
    }

    pub fn count(&self, op: HwOp) -> usize {
        self.calls.lock().iter().filter(|c| c.op == op && c.ok).count()
    }

    /// (instance, resource) pairs of successful calls of one kind, in call order
    pub fn sequence(&self, op: HwOp) -> Vec<(HwId, NodeRes)> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.op == op && c.ok)
            .filter_map(|c| Some((c.hw?, c.res?)))
            .collect()
    }
}
