//! Error recovery and the background worker
//!
//! The event path never touches hardware. It marks the affected contexts,
//! tells their owners and queues a [`WorkItem`]; everything that blocks
//! (stop, reset, restart, register dumps) runs here.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use ifemgr_core::{ContextState, ErrorKind, HwId, HwType, IspError, IspEvent, ResetScope, StopMode};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::lifecycle::{StartArgs, StopArgs};
use crate::manager::{HwManager, ManagerEvent};

/// One error's worth of recovery work
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryBatch {
    pub id: u64,
    pub kind: ErrorKind,
    /// Instance that raised the error
    pub hw: HwId,
    /// Every core the affected contexts touch
    pub cores: Vec<HwId>,
    /// (context, recovery generation it was scheduled under)
    pub entries: Vec<(usize, u64)>,
    /// Restart the contexts once the cores are reset
    pub restart: bool,
    pub reset: bool,
}

/// Work queued by the event path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    Recovery(RecoveryBatch),
    /// Drain a context's diagnostic queue
    Dump { ctx: usize },
}

/// What happened to each context of a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub batch: u64,
    pub restarted: Vec<usize>,
    pub failed: Vec<usize>,
    /// Released, stopped or re-armed since the batch was scheduled
    pub skipped: Vec<usize>,
}

impl HwManager {
    pub(crate) fn queue(&self, item: WorkItem) {
        if self.work_tx.send(item).is_err() {
            warn!("work queue closed, dropping item");
        }
    }

    /// Stop, reset and (for internally handled errors) restart every context
    /// of the batch that is still in the state it was scheduled in. Running
    /// the same batch twice is harmless: the second run finds every context
    /// re-armed and skips it.
    pub fn recover(&self, batch: &RecoveryBatch) -> RecoveryReport {
        let mut report = RecoveryReport {
            batch: batch.id,
            ..RecoveryReport::default()
        };

        let mut live: Vec<(usize, u64)> = Vec::new();
        for &(index, rid) in &batch.entries {
            let Ok(slot) = self.slot(index) else {
                report.skipped.push(index);
                continue;
            };
            let current = slot.recovery_id();
            let streaming = slot.ctx.lock().state == ContextState::Streaming;
            if current != rid || !streaming || !slot.overflow_pending() {
                debug!(ctx = index, scheduled = rid, current, streaming, "stale recovery entry skipped");
                report.skipped.push(index);
                continue;
            }
            live.push((index, rid));
        }

        if live.is_empty() {
            info!(batch = batch.id, "Recovery batch had nothing left to do");
            return report;
        }

        let internal_stop = StopArgs {
            mode: StopMode::Immediately,
            stop_only: true,
            internal: true,
        };
        for &(index, _) in &live {
            if let Err(e) = self.stop_with(index, internal_stop) {
                warn!(ctx = index, error = %e, "recovery stop failed");
            }
        }

        let mut reset_ok = true;
        if batch.reset {
            if let Err(e) = self.reset_cores(batch, &live) {
                error!(batch = batch.id, error = %e, "Recovery reset failed");
                reset_ok = false;
            }
        }

        for &(index, rid) in &live {
            if !batch.restart {
                continue;
            }
            if !reset_ok {
                report.failed.push(index);
                continue;
            }
            let internal_start = StartArgs {
                start_only: true,
                internal: true,
            };
            match self.start_with(index, internal_start) {
                Ok(()) => {
                    let callback = self.slots[index].route.read().callback.clone();
                    if let Some(callback) = callback {
                        callback.on_event(index, &IspEvent::Recovered { recovery_id: rid });
                    }
                    report.restarted.push(index);
                }
                Err(e) => {
                    error!(ctx = index, error = %e, "Recovery restart failed, context stays halted");
                    report.failed.push(index);
                }
            }
        }

        info!(
            batch = batch.id,
            kind = %batch.kind,
            restarted = ?report.restarted,
            failed = ?report.failed,
            skipped = ?report.skipped,
            "Recovery completed"
        );
        self.emit(ManagerEvent::RecoveryCompleted {
            batch: batch.id,
            restarted: report.restarted.clone(),
            failed: report.failed.clone(),
        });
        report
    }

    /// CSID path resets for the live contexts, then one core reset per
    /// distinct IFE/SFE those contexts still hold. Cores only used by
    /// skipped contexts are left alone.
    fn reset_cores(&self, batch: &RecoveryBatch, live: &[(usize, u64)]) -> Result<(), IspError> {
        let mut cores: BTreeSet<HwId> = BTreeSet::new();
        for &(index, _) in live {
            let ctx = self.slots[index].ctx.lock();
            cores.extend(
                ctx.base
                    .iter()
                    .map(|b| b.hw)
                    .filter(|hw| matches!(hw.hw_type, HwType::Ife | HwType::Sfe)),
            );

            if self.config.enable_csid_recovery {
                for handle in &ctx.lists.csid {
                    let node = ctx.node(*handle)?;
                    if node.linked {
                        continue;
                    }
                    for (_, binding) in node.bindings() {
                        let rsv = binding.rsv;
                        self.registry
                            .hw(rsv.hw)?
                            .reset(ResetScope::Path(rsv))
                            .map_err(|e| IspError::hw(rsv.hw, e))?;
                    }
                }
            }
        }

        for id in cores {
            self.registry
                .hw(id)?
                .reset(ResetScope::Core)
                .map_err(|e| IspError::hw(id, e))?;
            debug!(batch = batch.id, hw = %id, "core reset");
        }
        Ok(())
    }

    pub(crate) fn run_work(&self, item: WorkItem) {
        match item {
            WorkItem::Recovery(batch) => {
                self.recover(&batch);
            }
            WorkItem::Dump { ctx } => self.run_tasks(ctx),
        }
    }

    /// Run everything already queued, on the calling thread. Returns the
    /// number of items processed.
    pub fn process_pending_work(&self) -> usize {
        let mut items = Vec::new();
        {
            let mut rx = self.work_rx.lock();
            let Some(rx) = rx.as_mut() else {
                return 0;
            };
            while let Ok(item) = rx.try_recv() {
                items.push(item);
            }
        }
        let n = items.len();
        for item in items {
            self.run_work(item);
        }
        n
    }

    /// Start the background worker. Returns `None` if it already runs.
    pub fn spawn_worker(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.work_rx.lock().take()?;
        let weak: Weak<Self> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            info!("Recovery worker started");
            while let Some(item) = rx.recv().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = tokio::task::spawn_blocking(move || manager.run_work(item)).await {
                    error!(error = %e, "recovery work panicked");
                }
            }
            info!("Recovery worker stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{manager, start_ctx, Recorder};
    use ifemgr_core::{HwEventKind, InPort, NodeRes, OutPortId};
    use ifemgr_core::resource::IfeSrc;
    use ifemgr_sim::{HwOp, SimPlatform};
    use std::time::Duration;

    fn overflow(sim: &ifemgr_sim::SimPlatform, hw: HwId) {
        sim.hw(hw).unwrap().raise(
            NodeRes::IfeSrc(IfeSrc::Camif),
            HwEventKind::Error {
                kind: ErrorKind::Overflow,
            },
        );
    }

    fn take_batch(mgr: &HwManager) -> RecoveryBatch {
        let mut rx = mgr.work_rx.lock();
        loop {
            match rx.as_mut().unwrap().try_recv().unwrap() {
                WorkItem::Recovery(batch) => return batch,
                WorkItem::Dump { .. } => continue,
            }
        }
    }

    #[test]
    fn test_overflow_restarts_context() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let rec = Recorder::new();
        let idx = start_ctx(&mgr, InPort::with_outputs([OutPortId::FULL]), rec.clone());
        let starts = sim.log.count(HwOp::Start);

        overflow(&sim, HwId::ife(0));
        assert!(mgr.slot(idx).unwrap().overflow_pending());
        assert_eq!(mgr.process_pending_work(), 1);

        assert_eq!(mgr.state(idx).unwrap(), ContextState::Streaming);
        assert!(!mgr.slot(idx).unwrap().overflow_pending());
        assert_eq!(sim.log.count(HwOp::Start), starts * 2);
        assert_eq!(sim.hw(HwId::ife(0)).unwrap().reset_count(), 1);
        assert!(rec
            .events_for(idx)
            .iter()
            .any(|e| matches!(e, IspEvent::Recovered { .. })));

        // Frames flow again
        sim.hw(HwId::ife(0)).unwrap().raise(NodeRes::IfeSrc(IfeSrc::Camif), HwEventKind::Sof);
        assert!(matches!(rec.events_for(idx).last(), Some(IspEvent::Sof { .. })));
    }

    #[test]
    fn test_batch_runs_once() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let idx = start_ctx(&mgr, InPort::with_outputs([OutPortId::FULL]), Recorder::new());
        overflow(&sim, HwId::ife(0));
        let batch = take_batch(&mgr);

        let first = mgr.recover(&batch);
        assert_eq!(first.restarted, vec![idx]);
        let resets = sim.hw(HwId::ife(0)).unwrap().reset_count();

        let second = mgr.recover(&batch);
        assert!(second.restarted.is_empty());
        assert_eq!(second.skipped, vec![idx]);
        assert_eq!(sim.hw(HwId::ife(0)).unwrap().reset_count(), resets);
    }

    #[test]
    fn test_stale_batch_after_user_stop_is_skipped() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let idx = start_ctx(&mgr, InPort::with_outputs([OutPortId::FULL]), Recorder::new());
        overflow(&sim, HwId::ife(0));
        let batch = take_batch(&mgr);

        mgr.stop(idx, StopMode::Immediately).unwrap();
        mgr.start(idx).unwrap();
        let (stops, starts, resets) = (
            sim.log.count(HwOp::Stop),
            sim.log.count(HwOp::Start),
            sim.log.count(HwOp::Reset),
        );

        let report = mgr.recover(&batch);
        assert_eq!(report.skipped, vec![idx]);
        assert_eq!(sim.log.count(HwOp::Stop), stops);
        assert_eq!(sim.log.count(HwOp::Start), starts);
        assert_eq!(sim.log.count(HwOp::Reset), resets);
    }

    #[test]
    fn test_restart_order_matches_reverse_stop() {
        let (sim, mgr) = manager(SimPlatform::builder().full(2));
        let idx = start_ctx(&mgr, InPort::with_outputs([OutPortId::FULL]).dual(), Recorder::new());
        let (left, _) = mgr.slot(idx).unwrap().ctx.lock().hw_idx_pair();
        overflow(&sim, left.unwrap());
        let batch = take_batch(&mgr);

        sim.log.clear();
        mgr.recover(&batch);
        let mut stops = sim.log.sequence(HwOp::Stop);
        stops.reverse();
        assert!(!stops.is_empty());
        assert_eq!(sim.log.sequence(HwOp::Start), stops);
    }

    #[test]
    fn test_reset_limited_to_cores_of_live_contexts() {
        let (sim, mgr) = manager(SimPlatform::builder().full(2));
        let c1 = start_ctx(&mgr, InPort::with_outputs([OutPortId::FULL]).dual(), Recorder::new());
        let c2 = start_ctx(&mgr, InPort::with_outputs([OutPortId::RDI0]), Recorder::new());
        let c2_ifes: Vec<HwId> = mgr
            .summary(c2)
            .unwrap()
            .base
            .iter()
            .map(|b| b.hw)
            .filter(|hw| hw.hw_type == HwType::Ife)
            .collect();
        assert_eq!(c2_ifes, vec![HwId::ife(1)]);

        overflow(&sim, HwId::ife(1));
        let batch = take_batch(&mgr);
        assert!(batch.cores.contains(&HwId::ife(0)));

        // The user restarts c1 before the worker gets to it
        mgr.stop(c1, StopMode::Immediately).unwrap();
        mgr.start(c1).unwrap();

        let report = mgr.recover(&batch);
        assert_eq!(report.skipped, vec![c1]);
        assert_eq!(report.restarted, vec![c2]);
        assert_eq!(sim.hw(HwId::ife(0)).unwrap().reset_count(), 0);
        assert_eq!(sim.hw(HwId::ife(1)).unwrap().reset_count(), 1);
    }

    #[test]
    fn test_host_retry_resets_without_restart() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let rec = Recorder::new();
        let idx = start_ctx(&mgr, InPort::with_outputs([OutPortId::FULL]), rec.clone());
        sim.hw(HwId::csid(0)).unwrap().raise(
            NodeRes::Csid(ifemgr_core::CsidPath::Ipp),
            HwEventKind::Error {
                kind: ErrorKind::CsidFatal,
            },
        );
        let batch = take_batch(&mgr);
        assert!(!batch.restart);

        let report = mgr.recover(&batch);
        assert!(report.restarted.is_empty());
        assert_eq!(mgr.state(idx).unwrap(), ContextState::Stopped);
        assert_eq!(sim.hw(HwId::csid(0)).unwrap().reset_count(), 1);
        assert_eq!(sim.hw(HwId::ife(0)).unwrap().reset_count(), 1);
        assert!(!rec.events_for(idx).iter().any(|e| matches!(e, IspEvent::Recovered { .. })));
    }

    #[test]
    fn test_failed_restart_leaves_context_halted() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let idx = start_ctx(&mgr, InPort::with_outputs([OutPortId::FULL]), Recorder::new());
        overflow(&sim, HwId::ife(0));
        sim.hw(HwId::csid(0))
            .unwrap()
            .fail_next(HwOp::Start, ifemgr_core::HwError::hardware("phy lost"));

        let batch = take_batch(&mgr);
        let report = mgr.recover(&batch);
        assert_eq!(report.failed, vec![idx]);
        assert_eq!(mgr.state(idx).unwrap(), ContextState::Stopped);
        assert!(!sim.hw(HwId::ife(0)).unwrap().is_started(NodeRes::IfeOut(OutPortId::FULL)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_runs_queued_recovery() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let mut events = mgr.subscribe();
        let idx = start_ctx(&mgr, InPort::with_outputs([OutPortId::FULL]), Recorder::new());
        let worker = mgr.spawn_worker().unwrap();
        assert!(mgr.spawn_worker().is_none());

        overflow(&sim, HwId::ife(0));
        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(ManagerEvent::RecoveryCompleted { restarted, .. }) = events.recv().await {
                    return restarted;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(completed, vec![idx]);
        worker.abort();
    }
}
