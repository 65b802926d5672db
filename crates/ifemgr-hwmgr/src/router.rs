//! Event router
//!
//! Resolves tagged hardware notifications to the contexts that own the
//! tagged resource. Runs on whatever thread the hardware raises from and never
//! takes a context's lifecycle lock: it reads the published route table and
//! the per-slot atomics only. Errors are fanned out to every context sharing
//! the faulted core and handed to the background worker as one batch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use ifemgr_core::{
    BaseEntry, ErrorKind, EventCallback, HwEvent, HwEventKind, HwEventSink, HwId, IspEvent,
    NodeRes, OutPortId, RecoveryHint, Split,
};
use tracing::{debug, info, trace, warn};

use crate::context::{CtxTask, IfeContext, VirtualRdiMap};
use crate::manager::{HwManager, ManagerEvent};
use crate::recovery::{RecoveryBatch, WorkItem};

/// One (instance, resource) a context listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub hw: HwId,
    pub res: NodeRes,
    pub split: Split,
}

/// Snapshot of a context the event path may read without the context lock
#[derive(Clone, Default)]
pub struct RouteTable {
    /// Context is out of the free pool
    pub active: bool,
    pub streaming: bool,
    pub routes: Vec<Route>,
    pub base: Vec<BaseEntry>,
    pub rdi_map: VirtualRdiMap,
    /// Active scratch address per output
    pub scratch: BTreeMap<OutPortId, u64>,
    pub dump_on_error: bool,
    pub callback: Option<Arc<dyn EventCallback>>,
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("active", &self.active)
            .field("streaming", &self.streaming)
            .field("routes", &self.routes.len())
            .field("base", &self.base)
            .finish()
    }
}

impl RouteTable {
    /// Routes for every bound node of the context, linked copies included
    pub fn build(ctx: &IfeContext) -> Self {
        let routes = ctx
            .pool
            .iter()
            .flat_map(|(_, node)| {
                node.bindings()
                    .map(|(split, b)| Route {
                        hw: b.hw(),
                        res: node.res,
                        split,
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        Self {
            active: true,
            streaming: ctx.is_streaming(),
            routes,
            base: ctx.base.clone(),
            rdi_map: ctx.rdi_map.clone(),
            scratch: ctx.scratch.clone(),
            dump_on_error: ctx.flags.dump_on_error,
            callback: ctx.callback.clone(),
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn find(&self, hw: HwId, res: NodeRes) -> Option<&Route> {
        self.routes.iter().find(|r| r.hw == hw && r.res == res)
    }

    pub fn touches(&self, cores: &BTreeSet<HwId>) -> bool {
        self.base.iter().any(|b| cores.contains(&b.hw))
    }

    fn base_index(&self, hw: HwId) -> Option<usize> {
        self.base.iter().position(|b| b.hw == hw)
    }
}

/// Owner-facing disposition of an error class
pub fn recovery_hint(kind: ErrorKind, csid_recovery: bool) -> RecoveryHint {
    match kind {
        ErrorKind::CsidFatal if csid_recovery => RecoveryHint::HostRetry,
        ErrorKind::CsidFatal => RecoveryHint::Unrecoverable,
        ErrorKind::SfeViolation => RecoveryHint::HostRetry,
        ErrorKind::Overflow
        | ErrorKind::BusOverflow
        | ErrorKind::Violation
        | ErrorKind::FrameSizeMismatch => RecoveryHint::Internal,
    }
}

impl HwEventSink for HwManager {
    fn on_hw_event(&self, event: HwEvent) {
        match event.kind {
            HwEventKind::Error { kind } => self.route_error(event, kind),
            _ => self.route_frame_event(event),
        }
    }
}

impl HwManager {
    fn route_frame_event(&self, event: HwEvent) {
        for slot in &self.slots {
            let (callback, ev) = {
                let route = slot.route.read();
                if !route.active || !route.streaming {
                    continue;
                }
                let Some(hit) = route.find(event.hw, event.res) else {
                    continue;
                };
                // Dual: only the master split reports
                if hit.split == Split::Right {
                    trace!(ctx = slot.index, hw = %event.hw, "slave split event ignored");
                    continue;
                }
                if slot.overflow_pending() {
                    trace!(ctx = slot.index, hw = %event.hw, "event swallowed while overflow pending");
                    continue;
                }
                let Some(callback) = route.callback.clone() else {
                    continue;
                };

                let base_idx = route.base_index(event.hw);
                let ev = match event.kind {
                    HwEventKind::Sof => {
                        let mut counters = slot.counters.lock();
                        if let Some(i) = base_idx {
                            if let Some(c) = counters.per_base.get_mut(i) {
                                c.sof += 1;
                            }
                        }
                        counters.last_sof_ns = event.timestamp_ns;
                        IspEvent::Sof {
                            hw: event.hw,
                            timestamp_ns: event.timestamp_ns,
                        }
                    }
                    HwEventKind::Epoch => {
                        if let Some(i) = base_idx {
                            if let Some(c) = slot.counters.lock().per_base.get_mut(i) {
                                c.epoch += 1;
                            }
                        }
                        IspEvent::Epoch { hw: event.hw }
                    }
                    HwEventKind::Eof => {
                        if let Some(i) = base_idx {
                            if let Some(c) = slot.counters.lock().per_base.get_mut(i) {
                                c.eof += 1;
                            }
                        }
                        IspEvent::Eof { hw: event.hw }
                    }
                    HwEventKind::RegUpdate => IspEvent::RegUpdate { hw: event.hw },
                    HwEventKind::BufDone { consumed_addr } => {
                        let Some(port) = event.res.out_port() else {
                            continue;
                        };
                        if consumed_addr.is_some() && route.scratch.get(&port).copied() == consumed_addr {
                            debug!(ctx = slot.index, port = %port, "buf done on scratch buffer suppressed");
                            continue;
                        }
                        IspEvent::BufDone {
                            port: route.rdi_map.to_virtual(port),
                            addr: consumed_addr,
                        }
                    }
                    HwEventKind::Error { .. } => continue,
                };
                (callback, ev)
            };
            callback.on_event(slot.index, &ev);
        }
    }

    /// Contexts and cores hit by an error on `hw`: every streaming context
    /// whose base touches an affected core, closed over the cores those
    /// contexts touch in turn
    pub(crate) fn affected_by(&self, hw: HwId) -> (Vec<usize>, BTreeSet<HwId>) {
        let tables: Vec<(usize, Vec<HwId>)> = self
            .slots
            .iter()
            .filter_map(|slot| {
                let route = slot.route.read();
                (route.active && route.streaming)
                    .then(|| (slot.index, route.base.iter().map(|b| b.hw).collect()))
            })
            .collect();

        let mut cores: BTreeSet<HwId> = [hw].into_iter().collect();
        let mut contexts: BTreeSet<usize> = BTreeSet::new();
        loop {
            let mut grew = false;
            for (index, base) in &tables {
                if contexts.contains(index) || !base.iter().any(|h| cores.contains(h)) {
                    continue;
                }
                contexts.insert(*index);
                cores.extend(base.iter().copied());
                grew = true;
            }
            if !grew {
                break;
            }
        }
        (contexts.into_iter().collect(), cores)
    }

    fn route_error(&self, event: HwEvent, kind: ErrorKind) {
        let (contexts, cores) = self.affected_by(event.hw);
        if contexts.is_empty() {
            warn!(hw = %event.hw, res = %event.res, kind = %kind, "error on a core no streaming context owns");
            return;
        }
        if contexts.iter().all(|i| self.slots[*i].overflow_pending()) {
            debug!(hw = %event.hw, kind = %kind, "duplicate error while recovery pending");
            return;
        }

        let hint = recovery_hint(kind, self.config.enable_csid_recovery);
        warn!(
            hw = %event.hw,
            res = %event.res,
            kind = %kind,
            contexts = ?contexts,
            cores = ?cores,
            hint = ?hint,
            "hardware error"
        );

        // Every affected context stops delivering frame events before any owner hears about it
        for index in &contexts {
            self.slots[*index].set_overflow_pending(true);
        }

        let affected: Vec<HwId> = cores.iter().copied().collect();
        let error = IspEvent::Error {
            kind,
            hw: event.hw,
            affected: affected.clone(),
            hint,
        };
        for index in &contexts {
            let slot = &self.slots[*index];
            let (callback, dump) = {
                let route = slot.route.read();
                (
                    route.callback.clone(),
                    route.dump_on_error || self.config.enable_req_dump,
                )
            };
            if let Some(callback) = callback {
                callback.on_event(*index, &error);
            }
            if dump {
                {
                    let mut tasks = slot.tasks.lock();
                    tasks.push_back(CtxTask::RegDump);
                    tasks.push_back(CtxTask::MiniDump);
                }
                self.queue(WorkItem::Dump { ctx: *index });
            }
        }
        self.emit(ManagerEvent::HwError {
            kind,
            hw: event.hw,
            contexts: contexts.clone(),
        });

        if !self.config.enable_recovery {
            warn!(hw = %event.hw, "recovery disabled, affected contexts stay halted");
            return;
        }

        let batch = RecoveryBatch {
            id: self.next_batch.fetch_add(1, Ordering::AcqRel) + 1,
            kind,
            hw: event.hw,
            cores: affected.clone(),
            entries: contexts
                .iter()
                .map(|i| (*i, self.slots[*i].bump_recovery_id()))
                .collect(),
            restart: hint == RecoveryHint::Internal,
            reset: hint != RecoveryHint::Unrecoverable,
        };
        info!(
            batch = batch.id,
            contexts = ?contexts,
            cores = ?affected,
            restart = batch.restart,
            "Recovery scheduled"
        );
        self.emit(ManagerEvent::RecoveryScheduled {
            batch: batch.id,
            contexts,
            cores: affected,
        });
        self.queue(WorkItem::Recovery(batch));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{manager, manager_on, start_ctx, Recorder};
    use ifemgr_core::{AcquireRequest, CsidPath, IfeSrc, InPort};
    use ifemgr_sim::SimPlatform;

    #[test]
    fn test_recovery_hint_by_kind() {
        assert_eq!(recovery_hint(ErrorKind::Overflow, true), RecoveryHint::Internal);
        assert_eq!(recovery_hint(ErrorKind::CsidFatal, true), RecoveryHint::HostRetry);
        assert_eq!(recovery_hint(ErrorKind::CsidFatal, false), RecoveryHint::Unrecoverable);
        assert_eq!(recovery_hint(ErrorKind::SfeViolation, false), RecoveryHint::HostRetry);
    }

    #[test]
    fn test_frame_events_reach_owner() {
        let (sim, mgr) = manager(SimPlatform::builder().full(2));
        let rec = Recorder::new();
        let idx = start_ctx(&mgr, InPort::with_outputs([OutPortId::FULL]), rec.clone());

        let ife = sim.hw(HwId::ife(1)).unwrap();
        assert!(ife.raise(NodeRes::IfeSrc(IfeSrc::Camif), HwEventKind::Sof));
        assert!(ife.raise(NodeRes::IfeSrc(IfeSrc::Camif), HwEventKind::Epoch));
        assert!(ife.raise(
            NodeRes::IfeOut(OutPortId::FULL),
            HwEventKind::BufDone {
                consumed_addr: Some(0x8000)
            }
        ));

        let events = rec.events_for(idx);
        assert!(matches!(events[0], IspEvent::Sof { hw, timestamp_ns } if hw == HwId::ife(1) && timestamp_ns > 0));
        assert!(matches!(events[1], IspEvent::Epoch { .. }));
        assert_eq!(
            events[2],
            IspEvent::BufDone {
                port: OutPortId::FULL,
                addr: Some(0x8000)
            }
        );

        let counters = mgr.slot(idx).unwrap().counters.lock().clone();
        let ife_base = mgr.summary(idx).unwrap().base.iter().position(|b| b.hw == HwId::ife(1)).unwrap();
        assert_eq!(counters.per_base[ife_base].sof, 1);
        assert_eq!(counters.per_base[ife_base].epoch, 1);
    }

    #[test]
    fn test_events_ignored_when_not_streaming() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let rec = Recorder::new();
        let req = AcquireRequest::new(vec![InPort::with_outputs([OutPortId::FULL])]);
        let idx = mgr.acquire(&req, rec.clone()).unwrap();
        sim.hw(HwId::ife(0))
            .unwrap()
            .raise(NodeRes::IfeSrc(IfeSrc::Camif), HwEventKind::Sof);
        assert!(rec.events_for(idx).is_empty());
    }

    #[test]
    fn test_slave_split_events_ignored() {
        let (sim, mgr) = manager(SimPlatform::builder().full(2));
        let rec = Recorder::new();
        let idx = start_ctx(&mgr, InPort::with_outputs([OutPortId::FULL]).dual(), rec.clone());
        let (left, right) = {
            let ctx = mgr.slot(idx).unwrap().ctx.lock();
            let (l, r) = ctx.hw_idx_pair();
            (l.unwrap(), r.unwrap())
        };
        sim.hw(right).unwrap().raise(NodeRes::IfeSrc(IfeSrc::Camif), HwEventKind::Sof);
        assert!(rec.events_for(idx).is_empty());
        sim.hw(left).unwrap().raise(NodeRes::IfeSrc(IfeSrc::Camif), HwEventKind::Sof);
        assert_eq!(rec.events_for(idx).len(), 1);
    }

    #[test]
    fn test_scratch_buf_done_suppressed() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let rec = Recorder::new();
        let idx = start_ctx(&mgr, InPort::with_outputs([OutPortId::FULL]), rec.clone());
        mgr.slot(idx).unwrap().route.write().scratch.insert(OutPortId::FULL, 0xdead_0000);

        let ife = sim.hw(HwId::ife(0)).unwrap();
        ife.raise(
            NodeRes::IfeOut(OutPortId::FULL),
            HwEventKind::BufDone {
                consumed_addr: Some(0xdead_0000),
            },
        );
        assert!(rec.events_for(idx).is_empty());
        ife.raise(
            NodeRes::IfeOut(OutPortId::FULL),
            HwEventKind::BufDone {
                consumed_addr: Some(0xbeef_0000),
            },
        );
        assert_eq!(rec.events_for(idx).len(), 1);
    }

    #[test]
    fn test_remapped_rdi_reported_with_requested_id() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let rec = Recorder::new();
        let a = InPort::with_outputs([OutPortId::RDI0]);
        let mut b = InPort::with_outputs([OutPortId::RDI0]);
        b.sensor_id = 7;
        let req = AcquireRequest::new(vec![a, b]);
        let idx = mgr.acquire(&req, rec.clone()).unwrap();
        mgr.start(idx).unwrap();

        sim.hw(HwId::ife(0)).unwrap().raise(
            NodeRes::IfeOut(OutPortId::RDI1),
            HwEventKind::BufDone { consumed_addr: None },
        );
        assert_eq!(
            rec.events_for(idx),
            vec![IspEvent::BufDone {
                port: OutPortId::RDI0,
                addr: None
            }]
        );
    }

    #[test]
    fn test_scenario_d_error_fans_out_to_sharing_contexts() {
        let sim = SimPlatform::builder().full(3).link(2, [1]).build().unwrap();
        sim.hw(HwId::ife(2)).unwrap().set_probe_failure(true);
        let mgr = manager_on(&sim, Default::default());

        let rec = Recorder::new();
        let c1 = start_ctx(&mgr, InPort::with_outputs([OutPortId::FULL]).dual(), rec.clone());
        let c2 = start_ctx(&mgr, InPort::with_outputs([OutPortId::RDI0]), rec.clone());
        {
            let ctx = mgr.slot(c2).unwrap().ctx.lock();
            assert!(ctx.base.iter().any(|b| b.hw == HwId::ife(1)));
            assert!(!ctx.base.iter().any(|b| b.hw == HwId::ife(0)));
        }

        // Both flags must already be set when the first callback runs
        let mgr2 = mgr.clone();
        rec.on_error(move |_| {
            mgr2.slot(c1).unwrap().overflow_pending() && mgr2.slot(c2).unwrap().overflow_pending()
        });
        sim.hw(HwId::ife(0)).unwrap().raise(
            NodeRes::IfeSrc(IfeSrc::Camif),
            HwEventKind::Error {
                kind: ErrorKind::Overflow,
            },
        );

        assert!(rec.error_checks().iter().all(|ok| *ok));
        assert_eq!(rec.error_checks().len(), 2);
        let IspEvent::Error { affected, hint, .. } = &rec.events_for(c2)[0] else {
            panic!("expected error event");
        };
        let ife_cores: Vec<HwId> = affected.iter().copied().filter(|h| h.hw_type == ifemgr_core::HwType::Ife).collect();
        assert_eq!(ife_cores, vec![HwId::ife(0), HwId::ife(1)]);
        assert_eq!(*hint, RecoveryHint::Internal);

        let (contexts, _) = mgr.affected_by(HwId::ife(0));
        assert_eq!(contexts, vec![c1, c2]);

        // A second report of the same fault is swallowed
        sim.hw(HwId::ife(1)).unwrap().raise(
            NodeRes::IfeSrc(IfeSrc::Rdi(0)),
            HwEventKind::Error {
                kind: ErrorKind::Overflow,
            },
        );
        assert_eq!(rec.error_checks().len(), 2);

        // Frame events are swallowed until recovery restarts the contexts
        sim.hw(HwId::csid(2))
            .unwrap()
            .raise(NodeRes::Csid(CsidPath::Rdi(0)), HwEventKind::Sof);
        assert_eq!(rec.events_for(c2).len(), 1);
    }

    #[test]
    fn test_error_queues_dumps_when_requested() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let rec = Recorder::new();
        let mut req = AcquireRequest::new(vec![InPort::with_outputs([OutPortId::FULL])]);
        req.ctx_config.dump_on_error = true;
        let idx = mgr.acquire(&req, rec.clone()).unwrap();
        mgr.start(idx).unwrap();

        sim.hw(HwId::csid(0)).unwrap().raise(
            NodeRes::Csid(CsidPath::Ipp),
            HwEventKind::Error {
                kind: ErrorKind::CsidFatal,
            },
        );
        assert_eq!(mgr.slot(idx).unwrap().tasks.lock().len(), 2);

        mgr.process_pending_work();
        assert_eq!(rec.mini_dumps().len(), 1);
        assert_eq!(rec.mini_dumps()[0].ctx, idx);
    }
}
