//! Context lifecycle: hardware init, start, stop, reset and configuration
//!
//! Start arms consumers before producers: IFE outputs, IFE mux inputs, SFE
//! outputs, SFE sources, the read path and finally CSID, right split before
//! left within a node so the master comes up last. Stop walks the exact
//! reverse. Init and start are all-or-nothing; stop and deinit log failures
//! and keep going.

use std::collections::BTreeSet;
use std::time::Duration;

use ifemgr_core::{
    AcquireKind, ContextState, HwCmd, HwError, HwId, HwType, HwUpdateEntry, IspError, IspHw,
    NodeHandle, NodePool, Reservation, ResetScope, Result, StopMode, UpdateKind,
};
use tracing::{debug, error, info, warn};

use crate::context::{ContextSlot, IfeContext};
use crate::manager::{HwManager, ManagerEvent};
use crate::update;

/// Options for [`HwManager::start_with`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartArgs {
    /// Skip the queued initial register batch
    pub start_only: bool,
    /// Restart issued by recovery; keeps the recovery generation
    pub internal: bool,
}

/// Options for [`HwManager::stop_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopArgs {
    pub mode: StopMode,
    /// Leave the hardware initialized
    pub stop_only: bool,
    /// Stop issued by recovery; keeps scratch/MUP/exposure state and the generation
    pub internal: bool,
}

impl StopArgs {
    pub fn new(mode: StopMode) -> Self {
        Self {
            mode,
            stop_only: true,
            internal: false,
        }
    }
}

/// Reservations of the given nodes in init order, left split first.
/// Linked nodes belong to a stream group and are skipped.
pub(crate) fn init_sequence(pool: &NodePool, handles: &[NodeHandle]) -> Vec<Reservation> {
    handles
        .iter()
        .filter_map(|h| pool.get(*h).ok())
        .filter(|n| !n.linked)
        .flat_map(|n| n.bindings().map(|(_, b)| b.rsv).collect::<Vec<_>>())
        .collect()
}

/// Reservations of the given nodes in start order, right split first so the
/// master of every dual node starts last. Linked nodes are skipped.
pub(crate) fn start_sequence(pool: &NodePool, handles: &[NodeHandle]) -> Vec<Reservation> {
    handles
        .iter()
        .filter_map(|h| pool.get(*h).ok())
        .filter(|n| !n.linked)
        .flat_map(|n| {
            let mut rsvs: Vec<Reservation> = n.bindings().map(|(_, b)| b.rsv).collect();
            rsvs.reverse();
            rsvs
        })
        .collect()
}

fn cdm_error(e: HwError) -> IspError {
    match e {
        HwError::Timeout { duration_ms } => IspError::Timeout { duration_ms },
        e => IspError::rejected(format!("command DMA: {}", e)),
    }
}

impl HwManager {
    fn hw_call<F>(&self, rsv: &Reservation, f: F) -> Result<()>
    where
        F: FnOnce(&dyn IspHw) -> std::result::Result<(), HwError>,
    {
        let hw = self.registry.hw(rsv.hw)?;
        f(hw.as_ref()).map_err(|e| IspError::hw(rsv.hw, e))
    }

    fn deinit_all(&self, rsvs: &[Reservation]) {
        for rsv in rsvs.iter().rev() {
            if let Err(e) = self.hw_call(rsv, |hw| hw.deinit(rsv)) {
                warn!(hw = %rsv.hw, res = %rsv.res, error = %e, "deinit failed");
            }
        }
    }

    /// Initialize a freshly acquired context's hardware
    pub fn init_hw(&self, index: usize) -> Result<()> {
        let slot = self.slot(index)?;
        let mut ctx = slot.ctx.lock();
        self.init_locked(&mut ctx)
    }

    fn init_locked(&self, ctx: &mut IfeContext) -> Result<()> {
        match ctx.state {
            ContextState::Acquired | ContextState::HwDeinitialized => {}
            state => return Err(IspError::invalid_state(ctx.index, state.to_string())),
        }

        let rsvs = init_sequence(&ctx.pool, &ctx.lists.init_order());
        let mut done: Vec<Reservation> = Vec::new();
        for rsv in &rsvs {
            if let Err(e) = self.hw_call(rsv, |hw| hw.init(rsv)) {
                error!(ctx = ctx.index, hw = %rsv.hw, res = %rsv.res, error = %e, "Init failed");
                self.deinit_all(&done);
                return Err(e);
            }
            done.push(*rsv);
        }

        let mut joined: Vec<usize> = Vec::new();
        for link in &ctx.groups {
            if let Err(e) = self.group_init(link.group, ctx.index) {
                for g in joined.iter().rev() {
                    self.group_deinit(*g, ctx.index);
                }
                self.deinit_all(&done);
                return Err(e);
            }
            joined.push(link.group);
        }

        if self.config.csid_global_reset {
            let csids: BTreeSet<HwId> = ctx
                .base
                .iter()
                .map(|b| b.hw)
                .filter(|hw| hw.hw_type == HwType::Csid)
                .collect();
            for id in csids {
                let result = self
                    .registry
                    .hw(id)
                    .and_then(|hw| hw.reset(ResetScope::Global).map_err(|e| IspError::hw(id, e)));
                if let Err(e) = result {
                    for g in joined.iter().rev() {
                        self.group_deinit(*g, ctx.index);
                    }
                    self.deinit_all(&done);
                    return Err(e);
                }
            }
        }

        ctx.state = ContextState::HwInitialized;
        debug!(ctx = ctx.index, nodes = done.len(), "hardware initialized");
        Ok(())
    }

    /// Deinitialize everything the context initialized. Best effort.
    pub(crate) fn deinit_locked(&self, ctx: &mut IfeContext) {
        for link in ctx.groups.iter().rev() {
            self.group_deinit(link.group, ctx.index);
        }
        let rsvs = init_sequence(&ctx.pool, &ctx.lists.init_order());
        self.deinit_all(&rsvs);
        ctx.state = ContextState::HwDeinitialized;
        debug!(ctx = ctx.index, "hardware deinitialized");
    }

    pub fn start(&self, index: usize) -> Result<()> {
        self.start_with(index, StartArgs::default())
    }

    /// Start streaming, initializing the hardware first if needed. Any
    /// failure halts whatever was started before the error returns.
    pub fn start_with(&self, index: usize, args: StartArgs) -> Result<()> {
        let slot = self.slot(index)?;
        let mut guard = slot.ctx.lock();
        let ctx = &mut *guard;

        match ctx.state {
            ContextState::Acquired | ContextState::HwDeinitialized => self.init_locked(ctx)?,
            ContextState::HwInitialized | ContextState::Stopped => {}
            state => return Err(IspError::invalid_state(index, state.to_string())),
        }

        if let Err(e) = self.start_locked(slot, ctx, args) {
            error!(ctx = index, error = %e, "Start failed, halting context");
            self.halt(ctx, StopMode::Immediately);
            ctx.state = ContextState::Stopped;
            return Err(e);
        }

        ctx.state = ContextState::Streaming;
        ctx.pending.clear();
        if !args.start_only {
            ctx.init_batch = None;
        }
        slot.set_overflow_pending(false);
        {
            let mut route = slot.route.write();
            route.streaming = true;
            route.scratch = ctx.scratch.clone();
        }
        if !args.internal {
            slot.bump_recovery_id();
        }
        info!(ctx = index, internal = args.internal, "Context started");
        self.emit(ManagerEvent::ContextStarted { ctx: index });
        Ok(())
    }

    fn start_locked(&self, slot: &ContextSlot, ctx: &mut IfeContext, args: StartArgs) -> Result<()> {
        for entry in &ctx.pending {
            self.apply_resource_update(entry)?;
        }

        if let Some(handle) = ctx.cdm {
            self.cdm.stream_on(handle).map_err(cdm_error)?;
        }

        if !args.start_only {
            if let Some((request_id, batch)) = ctx.init_batch.take() {
                let applied = self.apply_batch(ctx, request_id, &batch);
                // Held until the start succeeds so a retry replays it
                ctx.init_batch = Some((request_id, batch));
                applied?;
                slot.counters.lock().last_cdm_done_req = ctx.last_cdm_done_req;
            }
        }

        if ctx.flags.hybrid_acquire {
            let master = self.master_ife(ctx)?;
            let ports = ctx.lists.ife_out.keys().chain(ctx.lists.sfe_out.keys()).copied().collect();
            self.registry
                .hw(master)?
                .process_cmd(HwCmd::PopulateOutPorts { ctx: ctx.index, ports })
                .map_err(|e| IspError::hw(master, e))?;
        }

        let rsvs = start_sequence(&ctx.pool, &ctx.lists.start_order());
        for rsv in &rsvs {
            self.hw_call(rsv, |hw| hw.start(rsv))?;
            debug!(ctx = ctx.index, hw = %rsv.hw, res = %rsv.res, "started");
        }

        for link in &ctx.groups {
            self.group_stream_on(link.group, ctx.index)?;
        }
        Ok(())
    }

    /// Stop every started resource of the context, top-down. Best effort.
    fn halt(&self, ctx: &mut IfeContext, mode: StopMode) {
        for link in ctx.groups.iter().rev() {
            self.group_stream_off(link.group, ctx.index, mode);
        }
        let mut rsvs = start_sequence(&ctx.pool, &ctx.lists.start_order());
        rsvs.reverse();
        for rsv in &rsvs {
            if let Err(e) = self.hw_call(rsv, |hw| hw.stop(rsv, mode)) {
                warn!(ctx = ctx.index, hw = %rsv.hw, res = %rsv.res, error = %e, "stop failed");
            }
        }
        if let Some(handle) = ctx.cdm {
            if let Err(e) = self.cdm.stream_off(handle) {
                warn!(ctx = ctx.index, error = %e, "command DMA stream off failed");
            }
        }
    }

    pub fn stop(&self, index: usize, mode: StopMode) -> Result<()> {
        self.stop_with(index, StopArgs::new(mode))
    }

    /// Stop streaming. Always flushes the context's diagnostic queue.
    pub fn stop_with(&self, index: usize, args: StopArgs) -> Result<()> {
        let slot = self.slot(index)?;
        let mut guard = slot.ctx.lock();
        let ctx = &mut *guard;

        match ctx.state {
            ContextState::Streaming => {}
            _ if args.internal => return Ok(()),
            ContextState::Stopped | ContextState::HwInitialized => return Ok(()),
            state => return Err(IspError::invalid_state(index, state.to_string())),
        }

        // Frame events stop before the hardware does
        slot.route.write().streaming = false;
        self.halt(ctx, args.mode);
        let flushed = slot.flush_tasks();

        if !args.internal {
            ctx.scratch.clear();
            ctx.current_mup = 0;
            ctx.curr_num_exp = 0;
            slot.route.write().scratch.clear();
            slot.bump_recovery_id();
        }
        ctx.state = ContextState::Stopped;
        if !args.stop_only {
            self.deinit_locked(ctx);
        }

        info!(ctx = index, mode = ?args.mode, internal = args.internal, flushed, "Context stopped");
        self.emit(ManagerEvent::ContextStopped { ctx: index });
        Ok(())
    }

    /// Reset the context's CSID paths and every IFE/SFE core it uses
    pub fn reset(&self, index: usize) -> Result<()> {
        let slot = self.slot(index)?;
        let ctx = slot.ctx.lock();
        if ctx.state == ContextState::Free {
            return Err(IspError::invalid_state(index, ctx.state.to_string()));
        }
        self.reset_hw(&ctx, true)?;
        info!(ctx = index, "Context reset");
        Ok(())
    }

    /// Path reset on CSID reservations, then a core reset per distinct IFE/SFE
    pub(crate) fn reset_hw(&self, ctx: &IfeContext, csid_paths: bool) -> Result<()> {
        if csid_paths {
            for handle in &ctx.lists.csid {
                let node = ctx.node(*handle)?;
                if node.linked {
                    continue;
                }
                for (_, binding) in node.bindings() {
                    let rsv = binding.rsv;
                    self.hw_call(&rsv, |hw| hw.reset(ResetScope::Path(rsv)))?;
                }
            }
        }
        let cores: BTreeSet<HwId> = ctx
            .base
            .iter()
            .map(|b| b.hw)
            .filter(|hw| hw.hw_type != HwType::Csid)
            .collect();
        for id in cores {
            self.registry
                .hw(id)?
                .reset(ResetScope::Core)
                .map_err(|e| IspError::hw(id, e))?;
        }
        Ok(())
    }

    /// Apply prepared update entries for one request. Clock and bandwidth
    /// are applied at once when streaming and queued for start otherwise;
    /// register writes go through command DMA, or are held as the initial
    /// batch until start.
    pub fn config(&self, index: usize, entries: &[HwUpdateEntry], request_id: u64) -> Result<()> {
        let slot = self.slot(index)?;
        let mut guard = slot.ctx.lock();
        let ctx = &mut *guard;
        if ctx.state == ContextState::Free {
            return Err(IspError::invalid_state(index, ctx.state.to_string()));
        }

        let mut regs: Vec<HwUpdateEntry> = Vec::new();
        for entry in entries {
            match entry.kind {
                UpdateKind::Clock | UpdateKind::Bandwidth => {
                    if ctx.is_streaming() {
                        self.apply_resource_update(entry)?;
                    } else {
                        ctx.pending.push(entry.clone());
                    }
                }
                UpdateKind::Scratch => self.apply_resource_update(entry)?,
                UpdateKind::Registers => regs.push(entry.clone()),
            }
        }

        if !regs.is_empty() {
            if ctx.is_streaming() {
                self.apply_batch(ctx, request_id, &regs)?;
            } else {
                match &mut ctx.init_batch {
                    Some((id, batch)) => {
                        *id = request_id;
                        batch.extend(regs);
                    }
                    None => ctx.init_batch = Some((request_id, regs)),
                }
            }
        }

        ctx.applied_req_id = request_id;
        {
            let mut counters = slot.counters.lock();
            counters.applied_req_id = request_id;
            counters.last_cdm_done_req = ctx.last_cdm_done_req;
        }
        debug!(ctx = index, request_id, entries = entries.len(), "config applied");
        Ok(())
    }

    fn apply_resource_update(&self, entry: &HwUpdateEntry) -> Result<()> {
        let cmd = update::resource_cmd(entry)?;
        self.registry
            .hw(entry.hw)?
            .process_cmd(cmd)
            .map_err(|e| IspError::hw(entry.hw, e))?;
        Ok(())
    }

    /// Master IFE of the context
    fn master_ife(&self, ctx: &IfeContext) -> Result<HwId> {
        ctx.hw_idx_pair()
            .0
            .or_else(|| ctx.base.iter().map(|b| b.hw).find(|hw| hw.hw_type == HwType::Ife))
            .ok_or_else(|| IspError::rejected(format!("context {} has no IFE", ctx.index)))
    }

    /// Push one register batch to the hardware and wait for it to land
    fn apply_batch(&self, ctx: &mut IfeContext, request_id: u64, batch: &[HwUpdateEntry]) -> Result<()> {
        if ctx.kind == AcquireKind::Virtual {
            let master = self.master_ife(ctx)?;
            let payload = batch.iter().flat_map(|e| e.payload.iter().copied()).collect();
            self.registry
                .hw(master)?
                .process_cmd(HwCmd::RemoteConfig {
                    ctx: ctx.index,
                    payload,
                })
                .map_err(|e| IspError::hw(master, e))?;
            ctx.last_cdm_done_req = request_id;
            return Ok(());
        }

        let handle = ctx
            .cdm
            .ok_or_else(|| IspError::rejected(format!("context {} has no command DMA channel", ctx.index)))?;
        self.cdm.submit(handle, request_id, batch).map_err(cdm_error)?;

        let timeout = Duration::from_millis(self.config.cdm_timeout_ms);
        match self.cdm.wait(handle, request_id, timeout) {
            Ok(()) => {
                ctx.last_cdm_done_req = request_id;
                Ok(())
            }
            Err(HwError::Timeout { duration_ms }) => {
                if self.cdm.detect_hang(handle) {
                    error!(ctx = ctx.index, request_id, duration_ms, "Command DMA hang, resetting");
                    if let Err(e) = self.cdm.reset(handle) {
                        warn!(ctx = ctx.index, error = %e, "command DMA reset failed");
                    }
                    return Err(IspError::CdmHang {
                        index: ctx.index,
                        request_id,
                    });
                }
                warn!(ctx = ctx.index, request_id, duration_ms, "Command DMA completion late, engine not hung");
                Ok(())
            }
            Err(e) => Err(cdm_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{manager, Recorder};
    use ifemgr_core::{AcquireRequest, InPort, NodeRes, OutPortId, Split};
    use ifemgr_sim::{HwOp, SimPlatform};

    fn regs(hw: HwId, payload: Vec<u32>) -> HwUpdateEntry {
        HwUpdateEntry {
            hw,
            kind: UpdateKind::Registers,
            payload,
        }
    }

    #[test]
    fn test_start_order_consumers_first_master_last() {
        let (sim, mgr) = manager(SimPlatform::builder().full(2));
        let req = AcquireRequest::new(vec![InPort::with_outputs([OutPortId::FULL]).dual()]);
        let idx = mgr.acquire(&req, Recorder::new()).unwrap();
        mgr.start(idx).unwrap();

        let seq = sim.log.sequence(HwOp::Start);
        assert_eq!(seq.len(), 6);
        let kinds: Vec<NodeRes> = seq.iter().map(|(_, r)| *r).collect();
        assert!(matches!(kinds[0], NodeRes::IfeOut(_)));
        assert!(matches!(kinds[5], NodeRes::Csid(_)));

        // Master CSID half is the very last start
        let ctx = mgr.slot(idx).unwrap().ctx.lock();
        let csid = ctx.node(ctx.lists.csid[0]).unwrap();
        assert_eq!(seq[5].0, csid.binding(Split::Left).unwrap().hw());
        assert_eq!(seq[4].0, csid.binding(Split::Right).unwrap().hw());
    }

    #[test]
    fn test_stop_sequence_reverses_start() {
        let (sim, mgr) = manager(SimPlatform::builder().full(2).sfe(2));
        let mut port = InPort::with_outputs([OutPortId::FULL, OutPortId::RDI0, OutPortId::SFE_RDI1]);
        port.sfe_mode = ifemgr_core::SfeMode::Shdr;
        let idx = mgr.acquire(&AcquireRequest::new(vec![port]), Recorder::new()).unwrap();
        mgr.start(idx).unwrap();
        mgr.stop(idx, StopMode::AtFrameBoundary).unwrap();

        let mut stops = sim.log.sequence(HwOp::Stop);
        stops.reverse();
        assert_eq!(sim.log.sequence(HwOp::Start), stops);
        assert_eq!(mgr.state(idx).unwrap(), ContextState::Stopped);
    }

    #[test]
    fn test_init_failure_deinits_what_was_initialized() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let idx = mgr
            .acquire(&AcquireRequest::new(vec![InPort::with_outputs([OutPortId::FULL])]), Recorder::new())
            .unwrap();
        // CSID initializes last
        sim.hw(HwId::csid(0))
            .unwrap()
            .fail_next(HwOp::Init, HwError::hardware("phy not locked"));

        let err = mgr.init_hw(idx).unwrap_err();
        assert!(matches!(err, IspError::Hw { hw, .. } if hw == HwId::csid(0)));
        assert_eq!(sim.log.count(HwOp::Init), 2);
        assert_eq!(sim.log.count(HwOp::Deinit), 2);
        assert_eq!(mgr.state(idx).unwrap(), ContextState::Acquired);
        mgr.release(idx).unwrap();
    }

    #[test]
    fn test_start_failure_halts_context() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let idx = mgr
            .acquire(&AcquireRequest::new(vec![InPort::with_outputs([OutPortId::FULL])]), Recorder::new())
            .unwrap();
        sim.hw(HwId::csid(0))
            .unwrap()
            .fail_next(HwOp::Start, HwError::hardware("no clock"));

        assert!(mgr.start(idx).is_err());
        assert_eq!(mgr.state(idx).unwrap(), ContextState::Stopped);
        let ife = sim.hw(HwId::ife(0)).unwrap();
        assert!(!ife.is_started(NodeRes::IfeOut(OutPortId::FULL)));
        assert!(!mgr.slot(idx).unwrap().route.read().streaming);

        // Retry succeeds once the fault is gone
        mgr.start(idx).unwrap();
        assert_eq!(mgr.state(idx).unwrap(), ContextState::Streaming);
    }

    #[test]
    fn test_stop_then_deinit_and_restart() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let idx = mgr
            .acquire(&AcquireRequest::new(vec![InPort::with_outputs([OutPortId::RDI0])]), Recorder::new())
            .unwrap();
        mgr.start(idx).unwrap();
        mgr.stop_with(
            idx,
            StopArgs {
                mode: StopMode::Immediately,
                stop_only: false,
                internal: false,
            },
        )
        .unwrap();
        assert_eq!(mgr.state(idx).unwrap(), ContextState::HwDeinitialized);
        assert_eq!(sim.log.count(HwOp::Deinit), 3);

        mgr.start(idx).unwrap();
        assert_eq!(sim.log.count(HwOp::Init), 6);
        assert!(mgr.release(idx).is_err());
    }

    #[test]
    fn test_release_requires_stop() {
        let (_sim, mgr) = manager(SimPlatform::builder().full(1));
        let idx = mgr
            .acquire(&AcquireRequest::new(vec![InPort::with_outputs([OutPortId::FULL])]), Recorder::new())
            .unwrap();
        mgr.start(idx).unwrap();
        assert!(matches!(mgr.release(idx), Err(IspError::InvalidState { .. })));
        mgr.stop(idx, StopMode::AtFrameBoundary).unwrap();
        mgr.release(idx).unwrap();
    }

    #[test]
    fn test_config_before_start_is_held_for_start() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let idx = mgr
            .acquire(&AcquireRequest::new(vec![InPort::with_outputs([OutPortId::FULL])]), Recorder::new())
            .unwrap();
        mgr.config(idx, &[regs(HwId::ife(0), vec![0x10, 1])], 1).unwrap();
        assert_eq!(sim.log.count(HwOp::CdmSubmit), 0);

        mgr.start(idx).unwrap();
        assert_eq!(sim.log.count(HwOp::CdmSubmit), 1);
        assert_eq!(mgr.slot(idx).unwrap().counters.lock().last_cdm_done_req, 1);

        mgr.config(idx, &[regs(HwId::ife(0), vec![0x14, 2])], 2).unwrap();
        assert_eq!(sim.log.count(HwOp::CdmSubmit), 2);
        assert_eq!(mgr.slot(idx).unwrap().counters.lock().applied_req_id, 2);
    }

    #[test]
    fn test_cdm_hang_resets_engine() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let idx = mgr
            .acquire(&AcquireRequest::new(vec![InPort::with_outputs([OutPortId::FULL])]), Recorder::new())
            .unwrap();
        mgr.start(idx).unwrap();

        sim.cdm.stall(false);
        mgr.config(idx, &[regs(HwId::ife(0), vec![1])], 5).unwrap();
        assert_eq!(sim.cdm.reset_count(), 0);

        sim.cdm.stall(true);
        assert_eq!(
            mgr.config(idx, &[regs(HwId::ife(0), vec![1])], 6),
            Err(IspError::CdmHang {
                index: idx,
                request_id: 6
            })
        );
        assert_eq!(sim.cdm.reset_count(), 1);
    }

    #[test]
    fn test_clock_queued_until_start() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let idx = mgr
            .acquire(&AcquireRequest::new(vec![InPort::with_outputs([OutPortId::FULL])]), Recorder::new())
            .unwrap();
        let clock = HwUpdateEntry {
            hw: HwId::ife(0),
            kind: UpdateKind::Clock,
            payload: update::split_u64(600_000_000).to_vec(),
        };
        mgr.config(idx, &[clock], 1).unwrap();
        assert_eq!(sim.log.count(HwOp::Cmd("clock")), 0);
        mgr.start(idx).unwrap();
        assert_eq!(sim.log.count(HwOp::Cmd("clock")), 1);
    }

    #[test]
    fn test_failed_start_replays_held_config() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let idx = mgr
            .acquire(&AcquireRequest::new(vec![InPort::with_outputs([OutPortId::FULL])]), Recorder::new())
            .unwrap();
        let clock = HwUpdateEntry {
            hw: HwId::ife(0),
            kind: UpdateKind::Clock,
            payload: update::split_u64(600_000_000).to_vec(),
        };
        mgr.config(idx, &[clock, regs(HwId::ife(0), vec![0x10, 1])], 1).unwrap();
        sim.hw(HwId::csid(0))
            .unwrap()
            .fail_next(HwOp::Start, HwError::hardware("no clock"));

        assert!(mgr.start(idx).is_err());
        assert_eq!(sim.log.count(HwOp::Cmd("clock")), 1);
        assert_eq!(sim.log.count(HwOp::CdmSubmit), 1);

        mgr.start(idx).unwrap();
        assert_eq!(sim.log.count(HwOp::Cmd("clock")), 2);
        assert_eq!(sim.log.count(HwOp::CdmSubmit), 2);

        // Nothing is replayed once streaming began
        mgr.stop(idx, StopMode::AtFrameBoundary).unwrap();
        mgr.start(idx).unwrap();
        assert_eq!(sim.log.count(HwOp::Cmd("clock")), 2);
        assert_eq!(sim.log.count(HwOp::CdmSubmit), 2);
    }

    #[test]
    fn test_virtual_context_configures_remotely() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1).virtual_pairs(1));
        let req = AcquireRequest::new(vec![InPort::with_outputs([OutPortId::FULL])])
            .with_kind(AcquireKind::Virtual);
        let idx = mgr.acquire(&req, Recorder::new()).unwrap();
        assert_eq!(sim.cdm.open_channels(), 0);

        let ife = mgr.summary(idx).unwrap().base.iter().map(|b| b.hw).find(|h| h.hw_type == HwType::Ife).unwrap();
        mgr.start(idx).unwrap();
        mgr.config(idx, &[regs(ife, vec![7, 8])], 3).unwrap();
        assert_eq!(sim.log.count(HwOp::Cmd("remote_config")), 1);
        assert_eq!(sim.log.count(HwOp::CdmSubmit), 0);
    }

    #[test]
    fn test_reset_covers_paths_and_cores() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let idx = mgr
            .acquire(&AcquireRequest::new(vec![InPort::with_outputs([OutPortId::FULL, OutPortId::RDI0])]), Recorder::new())
            .unwrap();
        mgr.reset(idx).unwrap();
        assert_eq!(sim.hw(HwId::csid(0)).unwrap().reset_count(), 2);
        assert_eq!(sim.hw(HwId::ife(0)).unwrap().reset_count(), 1);
    }
}
