//! Shared fixtures for the scenario tests

use std::sync::Arc;

use ifemgr_core::{AcquireRequest, CtxMiniDump, EventCallback, InPort, IspEvent, ManagerConfig};
use ifemgr_sim::{SimPlatform, SimPlatformBuilder};
use parking_lot::Mutex;

use crate::manager::HwManager;

pub fn manager(builder: SimPlatformBuilder) -> (SimPlatform, Arc<HwManager>) {
    manager_with(builder, ManagerConfig::default())
}

pub fn manager_with(builder: SimPlatformBuilder, config: ManagerConfig) -> (SimPlatform, Arc<HwManager>) {
    let sim = builder.build().unwrap();
    let mgr = manager_on(&sim, config);
    (sim, mgr)
}

pub fn manager_on(sim: &SimPlatform, config: ManagerConfig) -> Arc<HwManager> {
    HwManager::new(sim.platform(), config).unwrap()
}

/// Acquire a single-port context and start it
pub fn start_ctx(mgr: &HwManager, port: InPort, callback: Arc<dyn EventCallback>) -> usize {
    let idx = mgr.acquire(&AcquireRequest::new(vec![port]), callback).unwrap();
    mgr.start(idx).unwrap();
    idx
}

type ErrorCheck = Box<dyn Fn(usize) -> bool + Send + Sync>;

/// Callback that keeps everything it is handed
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<(usize, IspEvent)>>,
    dumps: Mutex<Vec<CtxMiniDump>>,
    check: Mutex<Option<ErrorCheck>>,
    checks: Mutex<Vec<bool>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events_for(&self, ctx: usize) -> Vec<IspEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(c, _)| *c == ctx)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Evaluate `check` inside every error callback
    pub fn on_error(&self, check: impl Fn(usize) -> bool + Send + Sync + 'static) {
        *self.check.lock() = Some(Box::new(check));
    }

    pub fn error_checks(&self) -> Vec<bool> {
        self.checks.lock().clone()
    }

    pub fn mini_dumps(&self) -> Vec<CtxMiniDump> {
        self.dumps.lock().clone()
    }
}

impl EventCallback for Recorder {
    fn on_event(&self, ctx: usize, event: &IspEvent) {
        if matches!(event, IspEvent::Error { .. }) {
            if let Some(check) = self.check.lock().as_ref() {
                let ok = check(ctx);
                self.checks.lock().push(ok);
            }
        }
        self.events.lock().push((ctx, event.clone()));
    }

    fn on_mini_dump(&self, _ctx: usize, dump: &CtxMiniDump) {
        self.dumps.lock().push(dump.clone());
    }
}
