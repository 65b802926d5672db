//! Simulated CSID, SFE and IFE instances
//!
//! A `SimHw` tracks reservations per path, enforces the ownership rules real
//! drivers apply, records every call in the shared [`CallLog`] and can raise
//! interrupts into whatever sink the manager registered.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Weak;

use ifemgr_core::resource::{CsidPath, IfeSrc, NodeRes, OutFamily, PathCategory, SfeSrc};
use ifemgr_core::{
    HwCaps, HwCmd, HwCmdResult, HwError, HwEvent, HwEventKind, HwEventSink, HwId, HwType, IspHw,
    Owner, Reservation, ReserveArgs, ResetScope, StopMode,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::log::{CallLog, HwCall, HwOp};

#[derive(Debug, Clone)]
struct PathState {
    rsv_id: u64,
    owner: Owner,
    initialized: bool,
    started: bool,
    irq_enabled: bool,
}

#[derive(Debug, Clone)]
struct Fault {
    op: HwOp,
    /// Only calls on this path trip the fault
    res: Option<NodeRes>,
    err: HwError,
}

#[derive(Debug, Default)]
struct SimState {
    paths: BTreeMap<NodeRes, PathState>,
    next_rsv_id: u64,
    faults: VecDeque<Fault>,
    probe_fails: bool,
    frame_ts_ns: u64,
    resets: u32,
}

/// One simulated hardware instance
pub struct SimHw {
    caps: HwCaps,
    log: CallLog,
    state: Mutex<SimState>,
    sink: Mutex<Option<Weak<dyn HwEventSink>>>,
}

impl std::fmt::Debug for SimHw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimHw").field("id", &self.caps.id).finish()
    }
}

impl SimHw {
    pub fn new(caps: HwCaps, log: CallLog) -> Self {
        Self {
            caps,
            log,
            state: Mutex::new(SimState {
                next_rsv_id: 1,
                ..SimState::default()
            }),
            sink: Mutex::new(None),
        }
    }

    pub fn caps(&self) -> &HwCaps {
        &self.caps
    }

    /// Fail the next call of the given kind with `err`
    pub fn fail_next(&self, op: HwOp, err: HwError) {
        self.state.lock().faults.push_back(Fault { op, res: None, err });
    }

    /// Fail the next call of the given kind on one path with `err`
    pub fn fail_next_on(&self, op: HwOp, res: NodeRes, err: HwError) {
        self.state.lock().faults.push_back(Fault {
            op,
            res: Some(res),
            err,
        });
    }

    /// Make `get_hw_caps` fail
    pub fn set_probe_failure(&self, fail: bool) {
        self.state.lock().probe_fails = fail;
    }

    /// Currently reserved paths and their owners
    pub fn reserved(&self) -> Vec<(NodeRes, Owner)> {
        self.state
            .lock()
            .paths
            .iter()
            .map(|(res, p)| (*res, p.owner))
            .collect()
    }

    pub fn is_started(&self, res: NodeRes) -> bool {
        self.state.lock().paths.get(&res).is_some_and(|p| p.started)
    }

    pub fn irq_enabled(&self, res: NodeRes) -> bool {
        self.state.lock().paths.get(&res).is_some_and(|p| p.irq_enabled)
    }

    pub fn reset_count(&self) -> u32 {
        self.state.lock().resets
    }

    /// Deliver an interrupt to the registered sink. Returns false if none is registered.
    pub fn raise(&self, res: NodeRes, kind: HwEventKind) -> bool {
        let timestamp_ns = {
            let mut state = self.state.lock();
            if kind == HwEventKind::Sof {
                state.frame_ts_ns += 33_333_333;
            }
            state.frame_ts_ns
        };
        let sink = self.sink.lock().as_ref().and_then(Weak::upgrade);
        match sink {
            Some(sink) => {
                trace!(hw = %self.caps.id, res = %res, "raising {:?}", kind);
                sink.on_hw_event(HwEvent {
                    hw: self.caps.id,
                    res,
                    kind,
                    timestamp_ns,
                });
                true
            }
            None => false,
        }
    }

    fn record(&self, op: HwOp, res: Option<NodeRes>, rsv_id: Option<u64>, ok: bool) {
        self.log.record(HwCall {
            hw: Some(self.caps.id),
            op,
            res,
            rsv_id,
            ok,
        });
    }

    fn take_fault(state: &mut SimState, op: HwOp, res: Option<NodeRes>) -> Option<HwError> {
        let pos = state
            .faults
            .iter()
            .position(|f| f.op == op && (f.res.is_none() || f.res == res))?;
        state.faults.remove(pos).map(|f| f.err)
    }

    /// Whether this instance has the requested path at all
    fn check_path(&self, res: &NodeRes) -> Result<(), HwError> {
        let caps = &self.caps;
        let ok = match (caps.id.hw_type, res) {
            (HwType::Csid, NodeRes::Csid(CsidPath::Ipp)) => caps.num_pix > 0,
            (HwType::Csid, NodeRes::Csid(CsidPath::Ppp)) => caps.num_ppp > 0,
            (HwType::Csid, NodeRes::Csid(CsidPath::Rdi(n))) => *n < caps.num_rdi,
            (HwType::Ife, NodeRes::IfeSrc(IfeSrc::Camif)) => caps.num_pix > 0,
            (HwType::Ife, NodeRes::IfeSrc(IfeSrc::Pdlib)) => caps.num_ppp > 0,
            (HwType::Ife, NodeRes::IfeSrc(IfeSrc::Lcr)) => !caps.is_lite,
            (HwType::Ife, NodeRes::IfeSrc(IfeSrc::Rdi(n))) => *n < caps.num_rdi,
            (HwType::Sfe, NodeRes::SfeSrc(SfeSrc::Pix)) => caps.num_pix > 0,
            (HwType::Sfe, NodeRes::SfeSrc(SfeSrc::Rdi(n))) => *n < caps.num_rdi,
            (HwType::Ife | HwType::Sfe, NodeRes::BusRead) => !caps.is_lite,
            (HwType::Ife, NodeRes::IfeOut(port)) | (HwType::Sfe, NodeRes::SfeOut(port)) => {
                let family = if caps.id.hw_type == HwType::Ife {
                    OutFamily::Ife
                } else {
                    OutFamily::Sfe
                };
                match port.info() {
                    Some(info) if info.family == family => {
                        port.namespace_index() < caps.max_out_res
                            && (!caps.is_lite || matches!(info.category, PathCategory::Rdi(_)))
                    }
                    _ => false,
                }
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(HwError::rejected(format!("{} has no {}", caps.id, res)))
        }
    }

    fn with_path<F>(&self, op: HwOp, rsv: &Reservation, f: F) -> Result<(), HwError>
    where
        F: FnOnce(&mut PathState) -> Result<(), HwError>,
    {
        let result = {
            let mut state = self.state.lock();
            match Self::take_fault(&mut state, op, Some(rsv.res)) {
                Some(err) => Err(err),
                None => match state.paths.get_mut(&rsv.res) {
                    Some(path) if path.rsv_id == rsv.id => f(path),
                    _ => Err(HwError::invalid_state(format!(
                        "{} not reserved by rsv {}",
                        rsv.res, rsv.id
                    ))),
                },
            }
        };
        self.record(op, Some(rsv.res), Some(rsv.id), result.is_ok());
        result
    }
}

impl IspHw for SimHw {
    fn id(&self) -> HwId {
        self.caps.id
    }

    fn get_hw_caps(&self) -> Result<HwCaps, HwError> {
        let fails = self.state.lock().probe_fails;
        self.record(HwOp::Probe, None, None, !fails);
        if fails {
            return Err(HwError::hardware("probe failed"));
        }
        Ok(self.caps.clone())
    }

    fn reserve(&self, args: &ReserveArgs) -> Result<Reservation, HwError> {
        let result = (|| {
            self.check_path(&args.res)?;
            if args.need_lite && !self.caps.is_lite {
                return Err(HwError::rejected("lite instance required"));
            }
            if args.split.is_some() && !self.caps.supports_dual {
                return Err(HwError::rejected("dual not supported"));
            }
            let mut state = self.state.lock();
            if let Some(err) = Self::take_fault(&mut state, HwOp::Reserve, Some(args.res)) {
                return Err(err);
            }
            if state.paths.contains_key(&args.res) {
                return Err(HwError::Busy);
            }
            // A CSID serves one owner at a time
            if self.caps.id.hw_type == HwType::Csid
                && state.paths.values().any(|p| p.owner != args.owner)
            {
                return Err(HwError::Busy);
            }
            let id = state.next_rsv_id;
            state.next_rsv_id += 1;
            state.paths.insert(
                args.res,
                PathState {
                    rsv_id: id,
                    owner: args.owner,
                    initialized: false,
                    started: false,
                    irq_enabled: true,
                },
            );
            Ok(Reservation {
                hw: self.caps.id,
                res: args.res,
                id,
            })
        })();
        debug!(
            hw = %self.caps.id,
            res = %args.res,
            owner = %args.owner,
            ok = result.is_ok(),
            "reserve"
        );
        self.record(
            HwOp::Reserve,
            Some(args.res),
            result.as_ref().ok().map(|r| r.id),
            result.is_ok(),
        );
        result
    }

    fn release(&self, rsv: &Reservation) -> Result<(), HwError> {
        let result = {
            let mut state = self.state.lock();
            match Self::take_fault(&mut state, HwOp::Release, Some(rsv.res)) {
                Some(err) => Err(err),
                None => match state.paths.get(&rsv.res) {
                    Some(path) if path.rsv_id == rsv.id => {
                        state.paths.remove(&rsv.res);
                        Ok(())
                    }
                    _ => Err(HwError::invalid_state(format!("{} not reserved", rsv.res))),
                },
            }
        };
        self.record(HwOp::Release, Some(rsv.res), Some(rsv.id), result.is_ok());
        result
    }

    fn init(&self, rsv: &Reservation) -> Result<(), HwError> {
        self.with_path(HwOp::Init, rsv, |p| {
            p.initialized = true;
            Ok(())
        })
    }

    fn deinit(&self, rsv: &Reservation) -> Result<(), HwError> {
        self.with_path(HwOp::Deinit, rsv, |p| {
            p.initialized = false;
            p.started = false;
            Ok(())
        })
    }

    fn start(&self, rsv: &Reservation) -> Result<(), HwError> {
        self.with_path(HwOp::Start, rsv, |p| {
            if !p.initialized {
                return Err(HwError::invalid_state("start before init"));
            }
            p.started = true;
            Ok(())
        })
    }

    fn stop(&self, rsv: &Reservation, _mode: StopMode) -> Result<(), HwError> {
        self.with_path(HwOp::Stop, rsv, |p| {
            p.started = false;
            Ok(())
        })
    }

    fn reset(&self, scope: ResetScope) -> Result<(), HwError> {
        let (result, res) = {
            let mut state = self.state.lock();
            let path = match scope {
                ResetScope::Path(rsv) => Some(rsv.res),
                _ => None,
            };
            match Self::take_fault(&mut state, HwOp::Reset, path) {
                Some(err) => (Err(err), None),
                None => {
                    state.resets += 1;
                    match scope {
                        ResetScope::Core | ResetScope::Global => {
                            for path in state.paths.values_mut() {
                                path.started = false;
                            }
                            (Ok(()), None)
                        }
                        ResetScope::Path(rsv) => {
                            if let Some(path) = state.paths.get_mut(&rsv.res) {
                                path.started = false;
                            }
                            (Ok(()), Some(rsv.res))
                        }
                    }
                }
            }
        };
        self.record(HwOp::Reset, res, None, result.is_ok());
        result
    }

    fn process_cmd(&self, cmd: HwCmd) -> Result<HwCmdResult, HwError> {
        let name = cmd.name();
        let (result, res) = {
            let mut state = self.state.lock();
            match Self::take_fault(&mut state, HwOp::Cmd(name), None) {
                Some(err) => (Err(err), None),
                None => match cmd {
                    HwCmd::IrqMask { rsv, enable } => match state.paths.get_mut(&rsv.res) {
                        Some(path) if path.rsv_id == rsv.id => {
                            path.irq_enabled = enable;
                            (Ok(HwCmdResult::Done), Some(rsv.res))
                        }
                        _ => (Err(HwError::invalid_state("irq mask on unreserved path")), None),
                    },
                    HwCmd::GetTimestamp => (
                        Ok(HwCmdResult::Timestamp {
                            sof_ns: state.frame_ts_ns,
                        }),
                        None,
                    ),
                    HwCmd::RegDump => {
                        let base = self.caps.id.index * 0x1000;
                        let regs = state
                            .paths
                            .values()
                            .enumerate()
                            .map(|(i, p)| (base + i as u32 * 4, p.started as u32))
                            .collect();
                        (Ok(HwCmdResult::RegDump(regs)), None)
                    }
                    HwCmd::MiniDump => {
                        let paths: Vec<String> = state.paths.keys().map(|r| r.to_string()).collect();
                        (
                            Ok(HwCmdResult::MiniDump(serde_json::json!({
                                "hw": self.caps.id.to_string(),
                                "paths": paths,
                                "resets": state.resets,
                            }))),
                            None,
                        )
                    }
                    HwCmd::RemoteConfig { .. } if !self.caps.is_virtual => {
                        (Err(HwError::rejected("not a remote instance")), None)
                    }
                    _ => (Ok(HwCmdResult::Done), None),
                },
            }
        };
        self.record(HwOp::Cmd(name), res, None, result.is_ok());
        result
    }

    fn register_event_sink(&self, sink: Weak<dyn HwEventSink>) {
        *self.sink.lock() = Some(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ifemgr_core::OutPortId;

    fn csid() -> SimHw {
        SimHw::new(HwCaps::full(HwId::csid(0)), CallLog::new())
    }

    #[test]
    fn test_csid_busy_for_other_owner() {
        let hw = csid();
        let a = ReserveArgs::new(NodeRes::Csid(CsidPath::Ipp), Owner::Ctx(0));
        hw.reserve(&a).unwrap();

        let b = ReserveArgs::new(NodeRes::Csid(CsidPath::Rdi(0)), Owner::Ctx(1));
        assert_eq!(hw.reserve(&b), Err(HwError::Busy));

        let same_owner = ReserveArgs::new(NodeRes::Csid(CsidPath::Rdi(0)), Owner::Ctx(0));
        assert!(hw.reserve(&same_owner).is_ok());
    }

    #[test]
    fn test_double_release_rejected() {
        let hw = csid();
        let rsv = hw
            .reserve(&ReserveArgs::new(NodeRes::Csid(CsidPath::Ipp), Owner::Ctx(0)))
            .unwrap();
        hw.release(&rsv).unwrap();
        assert!(hw.release(&rsv).is_err());
        assert!(hw.reserved().is_empty());
    }

    #[test]
    fn test_lite_ife_only_takes_rdi_outputs() {
        let hw = SimHw::new(HwCaps::lite(HwId::ife(3)), CallLog::new());
        let full = ReserveArgs::new(NodeRes::IfeOut(OutPortId::FULL), Owner::Ctx(0));
        assert!(matches!(hw.reserve(&full), Err(HwError::Rejected { .. })));
        let rdi = ReserveArgs::new(NodeRes::IfeOut(OutPortId::RDI1), Owner::Ctx(0));
        assert!(hw.reserve(&rdi).is_ok());
    }

    #[test]
    fn test_injected_fault_consumed_once() {
        let hw = csid();
        hw.fail_next(HwOp::Reserve, HwError::Busy);
        let args = ReserveArgs::new(NodeRes::Csid(CsidPath::Ipp), Owner::Ctx(0));
        assert_eq!(hw.reserve(&args), Err(HwError::Busy));
        assert!(hw.reserve(&args).is_ok());
    }

    #[test]
    fn test_path_fault_skips_other_paths() {
        let hw = csid();
        hw.fail_next_on(HwOp::Reserve, NodeRes::Csid(CsidPath::Rdi(1)), HwError::hardware("phy"));
        let ipp = ReserveArgs::new(NodeRes::Csid(CsidPath::Ipp), Owner::Ctx(0));
        assert!(hw.reserve(&ipp).is_ok());
        let rdi = ReserveArgs::new(NodeRes::Csid(CsidPath::Rdi(1)), Owner::Ctx(0));
        assert!(matches!(hw.reserve(&rdi), Err(HwError::Hardware { .. })));
        assert!(hw.reserve(&rdi).is_ok());
    }

    #[test]
    fn test_start_requires_init() {
        let hw = csid();
        let rsv = hw
            .reserve(&ReserveArgs::new(NodeRes::Csid(CsidPath::Ipp), Owner::Ctx(0)))
            .unwrap();
        assert!(hw.start(&rsv).is_err());
        hw.init(&rsv).unwrap();
        hw.start(&rsv).unwrap();
        assert!(hw.is_started(rsv.res));
    }
}
