//! Per-port stream-group cache
//!
//! Contexts acquiring a per-port in-port for the same sensor share one set of
//! hardware. The first holder builds the graph in the group's own pool; later
//! holders reuse the matching nodes and get linked copies in their context
//! pool. Group hardware is initialized and started by the first holder that
//! needs it and torn down by the last one; joins and leaves in between only
//! toggle CSID interrupt masks.
//!
//! Hardware calls that block (init, start, stop, deinit) run with the group
//! lock dropped; the group's bookkeeping is updated under it first and rolled
//! back if the hardware call fails.

use std::collections::{BTreeMap, BTreeSet};

use ifemgr_core::{
    HwBinding, HwCmd, InPort, IspError, NodeHandle, NodePool, NodeRes, OutPortId, Owner, Reservation,
    Result, SensorStreamConfig, StopMode, StreamGroupConfig,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::builder::{self, BuildOutcome, BuildParams, Builder};
use crate::context::{GroupLink, IfeContext, ListKind, NodeLists};
use crate::lifecycle::{init_sequence, start_sequence};
use crate::manager::HwManager;
use crate::port_map;

/// One context's hold on a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holder {
    pub sensor_id: u32,
    /// Group nodes this context relies on
    pub nodes: Vec<NodeHandle>,
    pub initialized: bool,
    pub streaming: bool,
}

impl Holder {
    fn new(sensor_id: u32) -> Self {
        Self {
            sensor_id,
            nodes: Vec::new(),
            initialized: false,
            streaming: false,
        }
    }
}

/// Shared hardware for the sensors of one group
#[derive(Debug)]
pub struct StreamGroup {
    pub index: usize,
    pub config: Option<StreamGroupConfig>,
    /// Claimed on demand for an unconfigured sensor; dropped when the last holder leaves
    pub implicit: bool,
    pub pool: NodePool,
    pub lists: NodeLists,
    /// Keyed by context index
    pub holders: BTreeMap<usize, Holder>,
    pub init_cnt: u32,
    pub stream_on_cnt: u32,
    /// IFE index the group settled on; later builds try it first
    pub acquired_hw_idx: Option<u32>,
    initialized: BTreeSet<NodeHandle>,
    started: BTreeSet<NodeHandle>,
}

/// Serializable view of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamGroupStatus {
    pub group: usize,
    pub sensor_ids: Vec<u32>,
    pub implicit: bool,
    pub acquire_cnt: u32,
    pub init_cnt: u32,
    pub stream_on_cnt: u32,
    pub acquired_hw_idx: Option<u32>,
    pub num_nodes: usize,
}

impl StreamGroup {
    pub fn new(index: usize, pool_size: usize) -> Self {
        Self {
            index,
            config: None,
            implicit: false,
            pool: NodePool::new("stream_group", pool_size),
            lists: NodeLists::default(),
            holders: BTreeMap::new(),
            init_cnt: 0,
            stream_on_cnt: 0,
            acquired_hw_idx: None,
            initialized: BTreeSet::new(),
            started: BTreeSet::new(),
        }
    }

    /// Contexts holding the group
    pub fn acquire_cnt(&self) -> u32 {
        self.holders.len() as u32
    }

    pub fn sensor_ids(&self) -> Vec<u32> {
        self.config
            .iter()
            .flat_map(|c| c.sensors.iter().map(|s| s.sensor_id))
            .collect()
    }

    pub fn serves(&self, sensor_id: u32) -> bool {
        self.config.as_ref().is_some_and(|c| c.contains(sensor_id))
    }

    pub fn replace_config(&mut self, config: Option<StreamGroupConfig>) {
        self.config = config;
        self.implicit = false;
    }

    pub fn status(&self) -> StreamGroupStatus {
        StreamGroupStatus {
            group: self.index,
            sensor_ids: self.sensor_ids(),
            implicit: self.implicit,
            acquire_cnt: self.acquire_cnt(),
            init_cnt: self.init_cnt,
            stream_on_cnt: self.stream_on_cnt,
            acquired_hw_idx: self.acquired_hw_idx,
            num_nodes: self.pool.in_use(),
        }
    }

    /// RDI indices bound for other sensors of the group
    pub fn rdi_taken_by_others(&self, sensor_id: u32) -> BTreeSet<u8> {
        self.holders
            .values()
            .filter(|h| h.sensor_id != sensor_id)
            .flat_map(|h| h.nodes.iter())
            .filter_map(|n| self.pool.get(*n).ok())
            .filter_map(|n| n.res.out_port())
            .filter_map(|p| p.rdi_index())
            .collect()
    }

    /// Nodes of `holder` no other holder matching `other` relies on
    fn exclusive_nodes(&self, holder: usize, other: impl Fn(&Holder) -> bool) -> Vec<NodeHandle> {
        let Some(mine) = self.holders.get(&holder) else {
            return Vec::new();
        };
        mine.nodes
            .iter()
            .copied()
            .filter(|n| {
                !self
                    .holders
                    .iter()
                    .any(|(i, h)| *i != holder && other(h) && h.nodes.contains(n))
            })
            .collect()
    }

    /// Free group nodes and return their bindings; children first
    fn free_nodes(&mut self, handles: &[NodeHandle]) -> Vec<HwBinding> {
        let mut order: Vec<NodeHandle> = self.lists.start_order();
        order.retain(|h| handles.contains(h));
        let mut released = Vec::new();
        for handle in order {
            let Ok(node) = self.pool.free(handle) else {
                continue;
            };
            self.lists.remove(handle);
            self.initialized.remove(&handle);
            self.started.remove(&handle);
            if let Some(parent) = node.parent {
                if let Ok(parent) = self.pool.get_mut(parent) {
                    parent.num_children = parent.num_children.saturating_sub(1);
                }
            }
            released.extend(node.bindings().map(|(_, b)| *b));
        }
        released
    }

    /// Back to the unused state, keeping an explicit configuration
    fn reset(&mut self) {
        self.lists.clear();
        self.holders.clear();
        self.init_cnt = 0;
        self.stream_on_cnt = 0;
        self.acquired_hw_idx = None;
        self.initialized.clear();
        self.started.clear();
        if self.implicit {
            self.config = None;
            self.implicit = false;
        }
    }

    fn is_csid(&self, handle: NodeHandle) -> bool {
        self.pool
            .get(handle)
            .is_ok_and(|n| matches!(n.res, NodeRes::Csid(_)))
    }

    fn reservations(&self, handles: &[NodeHandle]) -> Vec<Reservation> {
        handles
            .iter()
            .filter_map(|h| self.pool.get(*h).ok())
            .flat_map(|n| n.bindings().map(|(_, b)| b.rsv).collect::<Vec<_>>())
            .collect()
    }
}

impl HwManager {
    /// Group serving a sensor: its configured group, or an empty one claimed for it
    fn find_group(&self, sensor_id: u32) -> Result<usize> {
        if let Some(g) = self.groups.iter().position(|g| g.lock().serves(sensor_id)) {
            return Ok(g);
        }
        for group in &self.groups {
            let mut group = group.lock();
            if group.config.is_none() && group.holders.is_empty() {
                group.config = Some(StreamGroupConfig {
                    sensors: vec![SensorStreamConfig {
                        sensor_id,
                        ..SensorStreamConfig::default()
                    }],
                });
                group.implicit = true;
                debug!(group = group.index, sensor_id, "stream group claimed");
                return Ok(group.index);
            }
        }
        Err(IspError::PoolExhausted {
            pool: "stream_group",
            capacity: self.groups.len(),
        })
    }

    /// Acquire a per-port in-port through its sensor's group and link the
    /// nodes into the context. Returns the (requested, bound) RDI remaps.
    pub(crate) fn acquire_in_group(
        &self,
        ctx: &mut IfeContext,
        port: &InPort,
    ) -> Result<Vec<(OutPortId, OutPortId)>> {
        let g = self.find_group(port.sensor_id)?;
        let mut guard = self.groups[g].lock();
        let group = &mut *guard;

        let built = (|| -> Result<(BuildOutcome, Vec<(OutPortId, OutPortId)>)> {
            let taken = group.rdi_taken_by_others(port.sensor_id);
            let plan = port_map::classify(
                port,
                self.registry.max_ife_out_res(),
                self.registry.max_sfe_out_res(),
                &taken,
            )?;
            for out in &plan.outputs {
                let clash = ctx.lists.ife_out.contains_key(&out.port) || ctx.lists.sfe_out.contains_key(&out.port);
                if clash {
                    return Err(IspError::rejected(format!(
                        "output {} already acquired on context {}",
                        out.port, ctx.index
                    )));
                }
            }
            let sensor_cfg = group.config.as_ref().and_then(|c| c.sensor(port.sensor_id)).cloned();
            let params = BuildParams {
                owner: Owner::Group(g as u32),
                kind: ctx.kind,
                port,
                plan: &plan,
                sensor_cfg: sensor_cfg.as_ref(),
                preferred_ife: group.acquired_hw_idx,
                reuse: true,
            };
            let outcome = Builder::new(&self.registry, &self.config, &mut group.pool, &mut group.lists)
                .build(params)?;
            let remaps: Vec<(OutPortId, OutPortId)> = plan
                .outputs
                .iter()
                .filter(|o| o.requested != o.port)
                .map(|o| (o.requested, o.port))
                .collect();
            Ok((outcome, remaps))
        })();

        let (outcome, remaps) = match built {
            Ok(built) => built,
            Err(e) => {
                if group.holders.is_empty() {
                    group.reset();
                }
                return Err(e);
            }
        };

        if group.acquired_hw_idx.is_none() {
            group.acquired_hw_idx = group
                .lists
                .ife_src
                .first()
                .and_then(|h| group.pool.get(*h).ok())
                .and_then(|n| n.left())
                .map(|b| b.hw().index);
        }
        let holder = group
            .holders
            .entry(ctx.index)
            .or_insert_with(|| Holder::new(port.sensor_id));
        for handle in &outcome.used {
            if !holder.nodes.contains(handle) {
                holder.nodes.push(*handle);
            }
        }
        let copies: Vec<(NodeHandle, Option<NodeHandle>, _)> = outcome
            .used
            .iter()
            .filter_map(|h| group.pool.get(*h).ok().map(|n| (*h, n.parent, n.linked_copy())))
            .collect();
        info!(
            ctx = ctx.index,
            group = g,
            sensor_id = port.sensor_id,
            acquire_cnt = group.acquire_cnt(),
            created = outcome.created.len(),
            "Joined stream group"
        );
        drop(guard);

        // Filed before the copies so a failed copy still leaves the group on teardown
        let link_pos = match ctx.groups.iter().position(|l| l.group == g) {
            Some(pos) => pos,
            None => {
                ctx.groups.push(GroupLink {
                    group: g,
                    sensor_id: port.sensor_id,
                    nodes: BTreeMap::new(),
                });
                ctx.groups.len() - 1
            }
        };
        for (group_handle, group_parent, mut copy) in copies {
            if ctx.groups[link_pos].nodes.contains_key(&group_handle) {
                continue;
            }
            copy.parent = group_parent.and_then(|p| ctx.groups[link_pos].nodes.get(&p).copied());
            let kind = ListKind::for_res(copy.res);
            let handle = ctx.pool.alloc(copy)?;
            ctx.lists.push(kind, handle);
            ctx.groups[link_pos].nodes.insert(group_handle, handle);
        }
        Ok(remaps)
    }

    /// Drop a context's hold. Nodes nobody else uses are released; the last
    /// holder takes the whole group down.
    pub(crate) fn group_leave(&self, g: usize, ctx_index: usize) {
        let Some(group) = self.groups.get(g) else {
            return;
        };
        let released = {
            let mut group = group.lock();
            if !group.holders.contains_key(&ctx_index) {
                return;
            }
            let exclusive: Vec<NodeHandle> = group
                .exclusive_nodes(ctx_index, |_| true)
                .into_iter()
                .filter(|h| !group.initialized.contains(h))
                .collect();
            let released = group.free_nodes(&exclusive);
            group.holders.remove(&ctx_index);

            if group.holders.is_empty() {
                let rest: Vec<NodeHandle> = group.pool.iter().map(|(h, _)| h).collect();
                let mut released = released;
                released.extend(group.free_nodes(&rest));
                group.reset();
                info!(group = g, ctx = ctx_index, "Stream group released");
                released
            } else {
                debug!(group = g, ctx = ctx_index, acquire_cnt = group.acquire_cnt(), "left stream group");
                released
            }
        };
        for binding in &released {
            builder::release_binding(&self.registry, binding);
        }
    }

    /// Initialize the group nodes a context needs that nobody has initialized yet
    pub(crate) fn group_init(&self, g: usize, ctx_index: usize) -> Result<()> {
        let (handles, rsvs) = {
            let mut group = self.groups[g].lock();
            let Some(holder) = group.holders.get_mut(&ctx_index) else {
                return Ok(());
            };
            if holder.initialized {
                return Ok(());
            }
            holder.initialized = true;
            let nodes = holder.nodes.clone();
            group.init_cnt += 1;
            let handles: Vec<NodeHandle> = group
                .lists
                .init_order()
                .into_iter()
                .filter(|h| nodes.contains(h) && !group.initialized.contains(h))
                .collect();
            group.initialized.extend(handles.iter().copied());
            let rsvs = init_sequence(&group.pool, &handles);
            (handles, rsvs)
        };

        let mut done: Vec<Reservation> = Vec::new();
        for rsv in &rsvs {
            let result = self.registry.hw(rsv.hw).and_then(|hw| hw.init(rsv).map_err(|e| IspError::hw(rsv.hw, e)));
            if let Err(e) = result {
                for rsv in done.iter().rev() {
                    if let Ok(hw) = self.registry.hw(rsv.hw) {
                        if let Err(e) = hw.deinit(rsv) {
                            warn!(hw = %rsv.hw, res = %rsv.res, error = %e, "deinit during rollback failed");
                        }
                    }
                }
                let mut group = self.groups[g].lock();
                for h in &handles {
                    group.initialized.remove(h);
                }
                if let Some(holder) = group.holders.get_mut(&ctx_index) {
                    holder.initialized = false;
                }
                group.init_cnt = group.init_cnt.saturating_sub(1);
                return Err(e);
            }
            done.push(*rsv);
        }
        debug!(group = g, ctx = ctx_index, nodes = handles.len(), "group nodes initialized");
        Ok(())
    }

    /// Deinitialize the group nodes no other initialized holder relies on.
    /// Exclusive nodes still running after a masked stream off are stopped first.
    pub(crate) fn group_deinit(&self, g: usize, ctx_index: usize) {
        let (to_stop, rsvs) = {
            let mut group = self.groups[g].lock();
            match group.holders.get_mut(&ctx_index) {
                Some(holder) if holder.initialized => holder.initialized = false,
                _ => return,
            }
            group.init_cnt = group.init_cnt.saturating_sub(1);
            let exclusive = group.exclusive_nodes(ctx_index, |h| h.initialized);
            let running: Vec<NodeHandle> = group
                .lists
                .start_order()
                .into_iter()
                .filter(|h| exclusive.contains(h) && group.started.contains(h))
                .collect();
            for h in &running {
                group.started.remove(h);
            }
            let mut to_stop = start_sequence(&group.pool, &running);
            to_stop.reverse();

            let handles: Vec<NodeHandle> = group
                .lists
                .init_order()
                .into_iter()
                .filter(|h| exclusive.contains(h) && group.initialized.contains(h))
                .collect();
            for h in &handles {
                group.initialized.remove(h);
            }
            let mut rsvs = init_sequence(&group.pool, &handles);
            rsvs.reverse();
            (to_stop, rsvs)
        };
        for rsv in &to_stop {
            match self.registry.hw(rsv.hw) {
                Ok(hw) => {
                    if let Err(e) = hw.stop(rsv, StopMode::Immediately) {
                        warn!(group = g, hw = %rsv.hw, res = %rsv.res, error = %e, "group stop before deinit failed");
                    }
                }
                Err(e) => warn!(group = g, error = %e, "group stop on unknown instance"),
            }
        }
        for rsv in rsvs {
            match self.registry.hw(rsv.hw) {
                Ok(hw) => {
                    if let Err(e) = hw.deinit(&rsv) {
                        warn!(group = g, hw = %rsv.hw, res = %rsv.res, error = %e, "group deinit failed");
                    }
                }
                Err(e) => warn!(group = g, error = %e, "group deinit on unknown instance"),
            }
        }
    }

    /// Stream on for one holder. The first holder starts the group hardware;
    /// later holders start only nodes nobody started and unmask their CSID paths.
    pub(crate) fn group_stream_on(&self, g: usize, ctx_index: usize) -> Result<()> {
        let (handles, to_start, unmask) = {
            let mut group = self.groups[g].lock();
            let Some(holder) = group.holders.get_mut(&ctx_index) else {
                return Ok(());
            };
            if holder.streaming {
                return Ok(());
            }
            holder.streaming = true;
            let nodes = holder.nodes.clone();
            group.stream_on_cnt += 1;

            let unmask: Vec<NodeHandle> = if group.stream_on_cnt > 1 {
                nodes
                    .iter()
                    .copied()
                    .filter(|h| group.started.contains(h) && group.is_csid(*h))
                    .collect()
            } else {
                Vec::new()
            };
            let handles: Vec<NodeHandle> = group
                .lists
                .start_order()
                .into_iter()
                .filter(|h| nodes.contains(h) && !group.started.contains(h))
                .collect();
            group.started.extend(handles.iter().copied());
            let to_start = start_sequence(&group.pool, &handles);
            (handles, to_start, group.reservations(&unmask))
        };

        let mut done: Vec<Reservation> = Vec::new();
        for rsv in &to_start {
            let result = self
                .registry
                .hw(rsv.hw)
                .and_then(|hw| hw.start(rsv).map_err(|e| IspError::hw(rsv.hw, e)));
            if let Err(e) = result {
                for rsv in done.iter().rev() {
                    if let Ok(hw) = self.registry.hw(rsv.hw) {
                        if let Err(e) = hw.stop(rsv, StopMode::Immediately) {
                            warn!(hw = %rsv.hw, res = %rsv.res, error = %e, "stop during rollback failed");
                        }
                    }
                }
                let mut group = self.groups[g].lock();
                for h in &handles {
                    group.started.remove(h);
                }
                if let Some(holder) = group.holders.get_mut(&ctx_index) {
                    holder.streaming = false;
                }
                group.stream_on_cnt = group.stream_on_cnt.saturating_sub(1);
                return Err(e);
            }
            done.push(*rsv);
        }

        for rsv in unmask {
            self.registry
                .hw(rsv.hw)?
                .process_cmd(HwCmd::IrqMask { rsv, enable: true })
                .map_err(|e| IspError::hw(rsv.hw, e))?;
        }
        debug!(group = g, ctx = ctx_index, started = to_start.len(), "group stream on");
        Ok(())
    }

    /// Stream off for one holder. The last streaming holder stops the group
    /// hardware; earlier leavers only mask the CSID paths nobody else streams on.
    pub(crate) fn group_stream_off(&self, g: usize, ctx_index: usize, mode: StopMode) {
        let (to_stop, mask) = {
            let mut group = self.groups[g].lock();
            match group.holders.get_mut(&ctx_index) {
                Some(holder) if holder.streaming => holder.streaming = false,
                _ => return,
            }
            group.stream_on_cnt = group.stream_on_cnt.saturating_sub(1);

            if group.stream_on_cnt == 0 {
                let handles: Vec<NodeHandle> = group
                    .lists
                    .start_order()
                    .into_iter()
                    .filter(|h| group.started.contains(h))
                    .collect();
                group.started.clear();
                let mut rsvs = start_sequence(&group.pool, &handles);
                rsvs.reverse();
                (rsvs, Vec::new())
            } else {
                let mask: Vec<NodeHandle> = group
                    .exclusive_nodes(ctx_index, |h| h.streaming)
                    .into_iter()
                    .filter(|h| group.started.contains(h) && group.is_csid(*h))
                    .collect();
                (Vec::new(), group.reservations(&mask))
            }
        };

        for rsv in &to_stop {
            match self.registry.hw(rsv.hw) {
                Ok(hw) => {
                    if let Err(e) = hw.stop(rsv, mode) {
                        warn!(group = g, hw = %rsv.hw, res = %rsv.res, error = %e, "group stop failed");
                    }
                }
                Err(e) => warn!(group = g, error = %e, "group stop on unknown instance"),
            }
        }
        for rsv in mask {
            let result = self
                .registry
                .hw(rsv.hw)
                .and_then(|hw| hw.process_cmd(HwCmd::IrqMask { rsv, enable: false }).map_err(|e| IspError::hw(rsv.hw, e)));
            if let Err(e) = result {
                warn!(group = g, error = %e, "irq mask failed");
            }
        }
        debug!(group = g, ctx = ctx_index, stopped = to_stop.len(), "group stream off");
    }

    /// Status of every group
    pub fn stream_groups(&self) -> Vec<StreamGroupStatus> {
        self.groups.iter().map(|g| g.lock().status()).collect()
    }

    pub fn stream_group(&self, g: usize) -> Option<StreamGroupStatus> {
        self.groups.get(g).map(|g| g.lock().status())
    }
}
