//! Hardware manager
//!
//! Owns the capability registry, the fixed context table and the stream
//! groups. Acquisition builds a context's resource graph port by port; a
//! failure at any point tears down everything the call bound.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};

use chrono::Utc;
use ifemgr_core::{
    AcquireKind, AcquireRequest, AcquireVersion, BaseEntry, CdmService, ContextState, CtxCounters,
    CtxFlags, CtxMiniDump, CtxType, ErrorKind, EventCallback, FrameCounters, HwEventSink, HwId, InPort,
    IspError, ManagerConfig, OutPortId, Owner, Platform, Result, SfeMode, StreamGroupConfig,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::builder::{self, BuildParams, Builder};
use crate::context::{ContextSlot, IfeContext, RdiMapping};
use crate::port_map;
use crate::recovery::WorkItem;
use crate::registry::Registry;
use crate::router::RouteTable;
use crate::stream_group::StreamGroup;

/// Manager-level notifications, for observers such as the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ManagerEvent {
    ContextAcquired { ctx: usize, base: Vec<BaseEntry> },
    ContextStarted { ctx: usize },
    ContextStopped { ctx: usize },
    ContextReleased { ctx: usize },
    HwError { kind: ErrorKind, hw: HwId, contexts: Vec<usize> },
    RecoveryScheduled { batch: u64, contexts: Vec<usize>, cores: Vec<HwId> },
    RecoveryCompleted { batch: u64, restarted: Vec<usize>, failed: Vec<usize> },
}

/// Listing entry for one in-use context
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextSummary {
    pub index: usize,
    pub state: ContextState,
    pub kind: AcquireKind,
    pub ctx_type: CtxType,
    pub flags: CtxFlags,
    pub base: Vec<BaseEntry>,
    pub num_nodes: usize,
    pub overflow_pending: bool,
    pub recovery_id: u64,
}

#[derive(Debug, Default)]
pub(crate) struct CtxPool {
    pub free: VecDeque<usize>,
    pub used: Vec<usize>,
}

/// The ISP hardware manager
pub struct HwManager {
    pub(crate) config: ManagerConfig,
    pub(crate) registry: Registry,
    pub(crate) cdm: Arc<dyn CdmService>,
    pub(crate) slots: Vec<ContextSlot>,
    pub(crate) ctx_pool: Mutex<CtxPool>,
    pub(crate) groups: Vec<Mutex<StreamGroup>>,
    pub(crate) work_tx: mpsc::UnboundedSender<WorkItem>,
    pub(crate) work_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkItem>>>,
    pub(crate) event_tx: broadcast::Sender<ManagerEvent>,
    pub(crate) next_batch: AtomicU64,
}

impl std::fmt::Debug for HwManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HwManager")
            .field("contexts", &self.slots.len())
            .field("groups", &self.groups.len())
            .field("counts", self.registry.counts())
            .finish()
    }
}

impl HwManager {
    /// Build the registry and the context table, and register as the
    /// interrupt sink of every usable instance
    pub fn new(platform: Platform, config: ManagerConfig) -> Result<Arc<Self>> {
        let registry = Registry::enumerate(&platform.instances)?;
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(100);

        let slots = (0..config.max_contexts)
            .map(|i| ContextSlot::new(i, config.ctx_pool_size))
            .collect();
        let groups = (0..config.max_stream_groups)
            .map(|i| Mutex::new(StreamGroup::new(i, config.group_pool_size)))
            .collect();

        let manager = Arc::new(Self {
            ctx_pool: Mutex::new(CtxPool {
                free: (0..config.max_contexts).collect(),
                used: Vec::new(),
            }),
            config,
            registry,
            cdm: platform.cdm,
            slots,
            groups,
            work_tx,
            work_rx: Mutex::new(Some(work_rx)),
            event_tx,
            next_batch: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&manager);
        let sink: Weak<dyn HwEventSink> = weak;
        for entry in manager.registry.entries() {
            entry.hw.register_event_sink(sink.clone());
        }

        info!(
            contexts = manager.config.max_contexts,
            groups = manager.config.max_stream_groups,
            "Hardware manager ready"
        );
        Ok(manager)
    }

    pub fn manager_config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Subscribe to manager events
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: ManagerEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn slot(&self, index: usize) -> Result<&ContextSlot> {
        self.slots.get(index).ok_or(IspError::InvalidContext { index })
    }

    /// Indices of contexts currently out of the free pool
    pub fn used_contexts(&self) -> Vec<usize> {
        self.ctx_pool.lock().used.clone()
    }

    pub fn active_context_count(&self) -> usize {
        self.ctx_pool.lock().used.len()
    }

    pub fn contexts(&self) -> Vec<ContextSummary> {
        self.used_contexts()
            .into_iter()
            .filter_map(|i| self.summary(i).ok())
            .collect()
    }

    pub fn summary(&self, index: usize) -> Result<ContextSummary> {
        let slot = self.slot(index)?;
        let ctx = slot.ctx.lock();
        if ctx.state == ContextState::Free {
            return Err(IspError::invalid_state(index, ctx.state.to_string()));
        }
        Ok(ContextSummary {
            index,
            state: ctx.state,
            kind: ctx.kind,
            ctx_type: ctx.ctx_type,
            flags: ctx.flags,
            base: ctx.base.clone(),
            num_nodes: ctx.pool.in_use(),
            overflow_pending: slot.overflow_pending(),
            recovery_id: slot.recovery_id(),
        })
    }

    pub fn state(&self, index: usize) -> Result<ContextState> {
        Ok(self.slot(index)?.ctx.lock().state)
    }

    fn take_context(&self) -> Result<usize> {
        let mut pool = self.ctx_pool.lock();
        let index = pool.free.pop_front().ok_or(IspError::NoFreeContext {
            max: self.config.max_contexts,
        })?;
        pool.used.push(index);
        Ok(index)
    }

    pub(crate) fn return_context(&self, index: usize) {
        let mut pool = self.ctx_pool.lock();
        pool.used.retain(|i| *i != index);
        if !pool.free.contains(&index) {
            pool.free.push_back(index);
        }
    }

    /// Acquire a context for the given in-ports
    pub fn acquire(&self, req: &AcquireRequest, callback: Arc<dyn EventCallback>) -> Result<usize> {
        if req.version != AcquireVersion::V3 {
            return Err(IspError::UnsupportedVersion(format!("{:?}", req.version)));
        }
        if req.in_ports.is_empty() {
            return Err(IspError::rejected("acquire without in-ports"));
        }

        let index = self.take_context()?;
        let slot = &self.slots[index];
        let mut guard = slot.ctx.lock();
        let ctx = &mut *guard;

        if let Err(e) = self.populate(ctx, req) {
            warn!(ctx = index, error = %e, "Acquire failed, releasing partial graph");
            self.free_resources(ctx);
            drop(guard);
            self.return_context(index);
            return Err(e);
        }

        ctx.state = ContextState::Acquired;
        ctx.callback = Some(callback);
        ctx.acquired_at = Some(Utc::now());
        {
            let mut counters = slot.counters.lock();
            *counters = CtxCounters {
                per_base: vec![FrameCounters::default(); ctx.base.len()],
                num_acq_ife_out: ctx.num_acq_ife_out,
                num_acq_sfe_out: ctx.num_acq_sfe_out,
                ..CtxCounters::default()
            };
        }
        slot.set_overflow_pending(false);
        *slot.route.write() = RouteTable::build(ctx);

        info!(
            ctx = index,
            kind = ?ctx.kind,
            nodes = ctx.pool.in_use(),
            base = ctx.base.len(),
            dual = ctx.flags.is_dual,
            "Context acquired"
        );
        self.emit(ManagerEvent::ContextAcquired {
            ctx: index,
            base: ctx.base.clone(),
        });
        Ok(index)
    }

    /// Run the builder for every in-port and fill in the derived context state
    fn populate(&self, ctx: &mut IfeContext, req: &AcquireRequest) -> Result<()> {
        ctx.kind = req.kind;
        let mut taken_rdi: BTreeSet<u8> = BTreeSet::new();

        for port in &req.in_ports {
            if port.per_port {
                let remaps = self.acquire_in_group(ctx, port)?;
                for (requested, bound) in remaps {
                    record_remap(ctx, port, requested, bound);
                }
            } else {
                let plan = port_map::classify(
                    port,
                    self.registry.max_ife_out_res(),
                    self.registry.max_sfe_out_res(),
                    &taken_rdi,
                )?;
                let params = BuildParams {
                    owner: Owner::Ctx(ctx.index),
                    kind: req.kind,
                    port,
                    plan: &plan,
                    sensor_cfg: None,
                    preferred_ife: None,
                    reuse: false,
                };
                let outcome = Builder::new(&self.registry, &self.config, &mut ctx.pool, &mut ctx.lists)
                    .build(params)?;
                ctx.num_acq_ife_out += outcome.new_ife_out;
                ctx.num_acq_sfe_out += outcome.new_sfe_out;
                for (requested, bound) in outcome.rdi_remaps {
                    record_remap(ctx, port, requested, bound);
                }
            }
            taken_rdi.extend(
                ctx.lists
                    .ife_out
                    .keys()
                    .chain(ctx.lists.sfe_out.keys())
                    .filter_map(|p| p.rdi_index()),
            );
        }

        ctx.compute_base();
        ctx.flags = self.classify_flags(ctx, req);
        ctx.ctx_type = if req.in_ports.iter().any(InPort::uses_sfe) {
            CtxType::Sfe
        } else {
            CtxType::None
        };
        ctx.num_exposures = req.in_ports.iter().map(|p| p.num_exposures).max().unwrap_or(1);

        if req.kind != AcquireKind::Virtual {
            let handle = self
                .cdm
                .acquire(ctx.index, ctx.base.len())
                .map_err(|e| IspError::rejected(format!("command DMA acquire failed: {}", e)))?;
            debug!(ctx = ctx.index, handle = handle.0, "command DMA channel acquired");
            ctx.cdm = Some(handle);
        }
        Ok(())
    }

    fn classify_flags(&self, ctx: &IfeContext, req: &AcquireRequest) -> CtxFlags {
        let ports = &req.in_ports;
        let is_offline = ports.iter().any(InPort::is_fetch);
        CtxFlags {
            is_dual: ports.iter().any(InPort::is_dual),
            is_offline,
            is_fe_enabled: is_offline,
            is_rdi_only: ports.iter().all(InPort::is_rdi_only),
            is_lite: ctx
                .base
                .iter()
                .any(|b| self.registry.caps(b.hw).is_some_and(|c| c.is_lite)),
            secure_mode: ports.iter().any(InPort::has_secure_output),
            is_aeb: ports.iter().any(|p| p.aeb_mode),
            is_sfe_shdr: ports.iter().any(|p| p.sfe_mode == SfeMode::Shdr),
            is_sfe_fs: ports.iter().any(|p| p.sfe_mode == SfeMode::Fs),
            dsp_enabled: ports.iter().any(|p| p.dsp_mode),
            per_port_en: ports.iter().any(|p| p.per_port),
            hybrid_acquire: req.kind == AcquireKind::Hybrid,
            dump_on_error: req.ctx_config.dump_on_error,
            frame_header_ts: req.ctx_config.frame_header_ts,
            sw_sync: req.ctx_config.sw_sync,
            dynamic_switch: req.ctx_config.dynamic_switch,
        }
    }

    /// Release every reservation and node the context holds and reset it.
    /// Best effort: failures are logged and teardown continues.
    pub(crate) fn free_resources(&self, ctx: &mut IfeContext) {
        let handles: Vec<_> = ctx.pool.iter().map(|(h, _)| h).collect();
        for handle in handles {
            match ctx.pool.free(handle) {
                Ok(node) if !node.linked => {
                    for (_, binding) in node.bindings() {
                        builder::release_binding(&self.registry, binding);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(ctx = ctx.index, error = %e, "node already freed"),
            }
        }

        for link in std::mem::take(&mut ctx.groups) {
            self.group_leave(link.group, ctx.index);
        }

        if let Some(handle) = ctx.cdm.take() {
            if let Err(e) = self.cdm.release(handle) {
                warn!(ctx = ctx.index, error = %e, "command DMA release failed");
            }
        }
        ctx.reset();
    }

    /// Release a stopped context back to the free pool
    pub fn release(&self, index: usize) -> Result<()> {
        let slot = self.slot(index)?;
        let mut guard = slot.ctx.lock();
        let ctx = &mut *guard;
        match ctx.state {
            ContextState::Free | ContextState::Streaming => {
                return Err(IspError::invalid_state(index, ctx.state.to_string()));
            }
            ContextState::HwInitialized | ContextState::Stopped => self.deinit_locked(ctx),
            ContextState::Acquired | ContextState::HwDeinitialized => {}
        }

        slot.route.write().clear();
        let flushed = slot.flush_tasks();
        self.free_resources(ctx);
        slot.bump_recovery_id();
        slot.set_overflow_pending(false);
        *slot.counters.lock() = CtxCounters::default();
        drop(guard);

        self.return_context(index);
        info!(ctx = index, flushed, "Context released");
        self.emit(ManagerEvent::ContextReleased { ctx: index });
        Ok(())
    }

    /// Snapshot of one context for crash-time capture
    pub fn mini_dump(&self, index: usize) -> Result<CtxMiniDump> {
        let slot = self.slot(index)?;
        let ctx = slot.ctx.lock();
        if ctx.state == ContextState::Free {
            return Err(IspError::invalid_state(index, ctx.state.to_string()));
        }
        let (left_hw, right_hw) = ctx.hw_idx_pair();
        Ok(CtxMiniDump {
            ctx: index,
            state: ctx.state,
            kind: ctx.kind,
            ctx_type: ctx.ctx_type,
            flags: ctx.flags,
            base: ctx.base.clone(),
            left_hw,
            right_hw,
            counters: slot.counters.lock().clone(),
            overflow_pending: slot.overflow_pending(),
            recovery_id: slot.recovery_id(),
            num_nodes: ctx.pool.in_use(),
            acquired_at: ctx.acquired_at,
            captured_at: Utc::now(),
        })
    }

    /// Replace the stream-group configuration. Fails without changing anything
    /// if a group that would be replaced still has holders.
    pub fn configure_stream_groups(&self, configs: Vec<StreamGroupConfig>) -> Result<()> {
        if configs.len() > self.groups.len() {
            return Err(IspError::PoolExhausted {
                pool: "stream_group",
                capacity: self.groups.len(),
            });
        }
        let mut guards: Vec<_> = self.groups.iter().map(|g| g.lock()).collect();
        for group in &guards {
            if group.acquire_cnt() > 0 {
                let sensor_id = group.sensor_ids().first().copied().unwrap_or_default();
                return Err(IspError::StreamGroupBusy {
                    sensor_id,
                    acquire_cnt: group.acquire_cnt(),
                });
            }
        }
        let mut configs = configs.into_iter();
        for group in guards.iter_mut() {
            group.replace_config(configs.next());
        }
        info!(groups = self.groups.len(), "Stream groups configured");
        Ok(())
    }
}

fn record_remap(ctx: &mut IfeContext, port: &InPort, requested: OutPortId, bound: OutPortId) {
    debug!(ctx = ctx.index, requested = %requested, bound = %bound, "RDI remapped");
    ctx.rdi_map.insert(RdiMapping {
        sensor_id: port.sensor_id,
        virtual_rdi: requested,
        acquired_rdi: bound,
    });
}
