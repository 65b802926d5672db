//! Application state management

use anyhow::{Context, Result};
use ifemgr_core::{CtxMiniDump, EventCallback, HwEvent, IspEvent};
use ifemgr_hwmgr::{HwManager, ManagerEvent};
use ifemgr_sim::SimPlatform;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Per-context notification fanned out to API clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextEvent {
    Event { ctx: usize, event: IspEvent },
    MiniDump { ctx: usize, dump: CtxMiniDump },
}

/// Callback installed on every context acquired through the API
pub struct BroadcastCallback {
    events: broadcast::Sender<ContextEvent>,
}

impl EventCallback for BroadcastCallback {
    fn on_event(&self, ctx: usize, event: &IspEvent) {
        if let IspEvent::Error { kind, hw, hint, .. } = event {
            warn!(ctx, hw = %hw, ?kind, ?hint, "Context error");
        }
        // No subscribers is fine
        let _ = self.events.send(ContextEvent::Event {
            ctx,
            event: event.clone(),
        });
    }

    fn on_mini_dump(&self, ctx: usize, dump: &CtxMiniDump) {
        info!(ctx, state = %dump.state, "Mini dump captured");
        let _ = self.events.send(ContextEvent::MiniDump {
            ctx,
            dump: dump.clone(),
        });
    }
}

/// Shared application state
pub struct AppState {
    /// Simulated hardware the manager drives
    pub sim: SimPlatform,
    /// Hardware manager
    pub manager: Arc<HwManager>,
    /// Configuration
    pub config: Config,
    /// Context event broadcast for WebSocket clients
    pub events: broadcast::Sender<ContextEvent>,
}

impl AppState {
    /// Build the platform and the manager. The recovery worker is not started.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let sim = config.to_platform()?;
        let manager = HwManager::new(sim.platform(), config.to_manager_config())
            .context("hardware manager initialization failed")?;

        if !config.stream_groups.is_empty() {
            manager
                .configure_stream_groups(config.stream_groups.clone())
                .context("invalid [[stream_group]] configuration")?;
        }

        let (events, _) = broadcast::channel(config.daemon.event_capacity.max(1));

        info!(
            instances = sim.instances().len(),
            stream_groups = config.stream_groups.len(),
            "Application state ready"
        );

        Ok(Arc::new(Self {
            sim,
            manager,
            config,
            events,
        }))
    }

    /// Start the background recovery worker. Must run inside the runtime.
    pub fn start_worker(&self) {
        match self.manager.spawn_worker() {
            Some(_) => debug!("Recovery worker started"),
            None => debug!("Recovery worker already running"),
        }
    }

    /// Callback for a new context
    pub fn callback(&self) -> Arc<dyn EventCallback> {
        Arc::new(BroadcastCallback {
            events: self.events.clone(),
        })
    }

    /// Subscribe to per-context events
    pub fn subscribe(&self) -> broadcast::Receiver<ContextEvent> {
        self.events.subscribe()
    }

    /// Subscribe to manager lifecycle events
    pub fn subscribe_manager(&self) -> broadcast::Receiver<ManagerEvent> {
        self.manager.subscribe()
    }

    /// Raise an interrupt on a simulated instance. Returns false when the
    /// instance is unknown or has no registered sink.
    pub fn inject(&self, event: &HwEvent) -> bool {
        match self.sim.hw(event.hw) {
            Some(hw) => hw.raise(event.res, event.kind),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ifemgr_core::{AcquireRequest, HwEventKind, HwId, HwType, IfeSrc, InPort, NodeRes, OutPortId};

    #[tokio::test]
    async fn test_callback_forwards_events() {
        let state = AppState::new(Config::default()).unwrap();
        let mut rx = state.subscribe();

        let idx = state
            .manager
            .acquire(
                &AcquireRequest::new(vec![InPort::with_outputs([OutPortId::FULL])]),
                state.callback(),
            )
            .unwrap();
        state.manager.start(idx).unwrap();

        let ife = state
            .manager
            .summary(idx)
            .unwrap()
            .base
            .iter()
            .map(|b| b.hw)
            .find(|hw| hw.hw_type == HwType::Ife)
            .unwrap();
        assert!(state.inject(&HwEvent {
            hw: ife,
            res: NodeRes::IfeSrc(IfeSrc::Camif),
            kind: HwEventKind::Sof,
            timestamp_ns: 0,
        }));

        match rx.recv().await.unwrap() {
            ContextEvent::Event { ctx, event } => {
                assert_eq!(ctx, idx);
                assert!(matches!(event, IspEvent::Sof { .. }));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_inject_unknown_instance() {
        let state = AppState::new(Config::default()).unwrap();
        assert!(!state.inject(&HwEvent {
            hw: HwId::ife(42),
            res: NodeRes::IfeSrc(IfeSrc::Camif),
            kind: HwEventKind::Sof,
            timestamp_ns: 0,
        }));
    }
}
