//! Diagnostic capture queued by the event path

use ifemgr_core::{HwCmd, HwCmdResult, HwId, IspError};
use tracing::{debug, info, warn};

use crate::context::CtxTask;
use crate::manager::HwManager;

impl HwManager {
    /// Drain and run a context's diagnostic queue
    pub(crate) fn run_tasks(&self, index: usize) {
        let Ok(slot) = self.slot(index) else {
            return;
        };
        loop {
            // Stop may flush the queue between tasks
            let Some(task) = slot.tasks.lock().pop_front() else {
                break;
            };
            match task {
                CtxTask::RegDump => self.reg_dump(index),
                CtxTask::MiniDump => self.deliver_mini_dump(index),
            }
        }
    }

    fn reg_dump(&self, index: usize) {
        let cores: Vec<HwId> = {
            let route = self.slots[index].route.read();
            route.base.iter().map(|b| b.hw).collect()
        };
        for id in cores {
            let result = self
                .registry
                .hw(id)
                .and_then(|hw| hw.process_cmd(HwCmd::RegDump).map_err(|e| IspError::hw(id, e)));
            match result {
                Ok(HwCmdResult::RegDump(regs)) => {
                    for (offset, value) in &regs {
                        debug!(ctx = index, hw = %id, "{:#06x}: {:#010x}", offset, value);
                    }
                    info!(ctx = index, hw = %id, registers = regs.len(), "Register dump");
                }
                Ok(other) => debug!(ctx = index, hw = %id, ?other, "unexpected register dump reply"),
                Err(e) => warn!(ctx = index, hw = %id, error = %e, "register dump failed"),
            }
        }
    }

    fn deliver_mini_dump(&self, index: usize) {
        let dump = match self.mini_dump(index) {
            Ok(dump) => dump,
            Err(e) => {
                warn!(ctx = index, error = %e, "mini dump skipped");
                return;
            }
        };
        let callback = self.slots[index].route.read().callback.clone();
        if let Some(callback) = callback {
            callback.on_mini_dump(index, &dump);
        }
        debug!(ctx = index, state = %dump.state, "mini dump delivered");
    }
}
