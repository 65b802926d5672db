//! Resource-graph builder
//!
//! Binds one classified in-port to hardware: CSID paths first, then SFE
//! sources, the fetch read path, IFE mux inputs and finally outputs. Every
//! node allocated by a build is journaled; if any step fails the journal is
//! unwound (reservations released, nodes freed) before the error returns.
//! Nodes bound by earlier builds on the same target are never touched.

use std::collections::BTreeMap;

use ifemgr_core::resource::{CsidPath, IfeSrc, SfeSrc};
use ifemgr_core::{
    AcquireKind, HwBinding, HwError, HwId, HwType, InPort, IspError, ManagerConfig, NodeHandle,
    NodePool, NodeRes, Owner, OutFamily, OutPortId, ReserveArgs, ResourceNode, Result,
    SensorStreamConfig, Split, SyncMode, VcDt,
};
use tracing::{debug, warn};

use crate::context::{ListKind, NodeLists};
use crate::port_map::{self, PortPlan};
use crate::registry::{CandidateFilter, HwEntry, Registry, ScanOrder};

/// Per-build inputs
#[derive(Debug, Clone, Copy)]
pub struct BuildParams<'a> {
    pub owner: Owner,
    pub kind: AcquireKind,
    pub port: &'a InPort,
    pub plan: &'a PortPlan,
    /// Stream-group vc/dt bindings for the port's sensor
    pub sensor_cfg: Option<&'a SensorStreamConfig>,
    /// IFE index to try first (stream group's acquired instance)
    pub preferred_ife: Option<u32>,
    /// Reuse matching nodes already on the target instead of reserving again
    pub reuse: bool,
}

/// What a successful build produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutcome {
    /// Every node the port relies on, newly bound or reused
    pub used: Vec<NodeHandle>,
    /// Nodes allocated by this build
    pub created: Vec<NodeHandle>,
    pub new_ife_out: u32,
    pub new_sfe_out: u32,
    /// (requested, bound) RDI pairs that were remapped
    pub rdi_remaps: Vec<(OutPortId, OutPortId)>,
}

/// One-shot builder over a node pool and its lists
pub struct Builder<'a> {
    registry: &'a Registry,
    config: &'a ManagerConfig,
    pool: &'a mut NodePool,
    lists: &'a mut NodeLists,
    journal: Vec<NodeHandle>,
    /// Nodes of this port by resource
    port_nodes: BTreeMap<NodeRes, NodeHandle>,
    outcome: BuildOutcome,
}

impl<'a> Builder<'a> {
    pub fn new(
        registry: &'a Registry,
        config: &'a ManagerConfig,
        pool: &'a mut NodePool,
        lists: &'a mut NodeLists,
    ) -> Self {
        Self {
            registry,
            config,
            pool,
            lists,
            journal: Vec::new(),
            port_nodes: BTreeMap::new(),
            outcome: BuildOutcome::default(),
        }
    }

    /// Build the graph for one in-port; all-or-nothing for this call
    pub fn build(mut self, params: BuildParams<'_>) -> Result<BuildOutcome> {
        match self.build_inner(&params) {
            Ok(()) => {
                self.outcome.created = std::mem::take(&mut self.journal);
                Ok(self.outcome)
            }
            Err(e) => {
                warn!(owner = %params.owner, error = %e, "graph build failed, unwinding");
                self.unwind();
                Err(e)
            }
        }
    }

    fn build_inner(&mut self, p: &BuildParams<'_>) -> Result<()> {
        let port = p.port;

        if port.is_fetch() {
            self.acquire_bus_read(p)?;
        } else {
            for path in p.plan.csid_paths.iter().copied() {
                self.acquire_csid(p, path)?;
            }
        }

        for src in p.plan.sfe_srcs.iter().copied() {
            self.acquire_sfe_src(p, src)?;
        }

        for src in p.plan.ife_srcs.iter().copied() {
            self.acquire_ife_src(p, src)?;
        }

        for out in &p.plan.outputs {
            self.acquire_out(p, out)?;
        }
        Ok(())
    }

    fn scan_order(&self, port: &InPort) -> ScanOrder {
        if port.is_dual() || port.is_fetch() || port.dsp_mode || !self.config.prefer_high_index_single {
            ScanOrder::Ascending
        } else {
            ScanOrder::Descending
        }
    }

    fn reserve_args(&self, p: &BuildParams<'_>, res: NodeRes, vc_dt: VcDt) -> ReserveArgs {
        let port = p.port;
        ReserveArgs {
            source: port.source,
            vc_dt: vec![vc_dt],
            width: port.width,
            height: port.height,
            crop_enable: port.crop_enable,
            drop_enable: port.drop_enable,
            secure: port.has_secure_output(),
            ..ReserveArgs::new(res, p.owner)
        }
    }

    /// Allocate a node, file it and journal it
    fn alloc(&mut self, node: ResourceNode, kind: ListKind) -> Result<NodeHandle> {
        let res = node.res;
        let handle = self.pool.alloc(node)?;
        self.lists.push(kind, handle);
        self.journal.push(handle);
        self.port_nodes.insert(res, handle);
        self.outcome.used.push(handle);
        Ok(handle)
    }

    fn reuse(&mut self, res: NodeRes, handle: NodeHandle) -> NodeHandle {
        debug!(res = %res, "reusing bound node");
        self.port_nodes.insert(res, handle);
        if !self.outcome.used.contains(&handle) {
            self.outcome.used.push(handle);
        }
        handle
    }

    fn bind(&mut self, handle: NodeHandle, split: Split, binding: HwBinding) -> Result<()> {
        self.pool.get_mut(handle)?.set_binding(split, binding);
        Ok(())
    }

    /// Try candidates in order; busy moves on, any other error is fatal
    fn reserve_first<'e>(
        &self,
        candidates: impl IntoIterator<Item = &'e HwEntry>,
        args: &ReserveArgs,
        skip: Option<HwId>,
    ) -> Result<Option<HwBinding>> {
        for entry in candidates {
            if Some(entry.caps.id) == skip {
                continue;
            }
            match entry.hw.reserve(args) {
                Ok(rsv) => {
                    debug!(hw = %rsv.hw, res = %rsv.res, owner = %args.owner, "reserved");
                    return Ok(Some(HwBinding {
                        rsv,
                        sync: args.sync,
                    }));
                }
                Err(e) if e.is_busy() => {
                    debug!(hw = %entry.caps.id, res = %args.res, "busy, trying next");
                }
                Err(e) => return Err(IspError::hw(entry.caps.id, e)),
            }
        }
        Ok(None)
    }

    fn csid_candidates(&self, p: &BuildParams<'_>, path: CsidPath, lite_pass: bool) -> Vec<&'a HwEntry> {
        let filter = CandidateFilter {
            remote: p.kind == AcquireKind::Virtual,
            allow_lite: false,
            lite_only: lite_pass,
            need_dual: p.port.is_dual(),
        };
        let registry: &'a Registry = self.registry;
        let mut found: Vec<&'a HwEntry> = registry
            .candidates(HwType::Csid, filter, self.scan_order(p.port))
            .into_iter()
            .filter(|e| match path {
                CsidPath::Ipp => e.caps.num_pix > 0,
                CsidPath::Ppp => e.caps.num_ppp > 0,
                CsidPath::Rdi(n) => n < e.caps.num_rdi,
            })
            .collect();

        // Paths of one port stay on the instance(s) the port already uses
        let used: Vec<HwId> = self
            .port_nodes
            .iter()
            .filter(|(res, _)| matches!(res, NodeRes::Csid(_)))
            .filter_map(|(_, h)| self.pool.get(*h).ok())
            .flat_map(|n| n.hw_ids().collect::<Vec<_>>())
            .collect();
        found.sort_by_key(|e| !used.contains(&e.caps.id));
        found
    }

    fn acquire_csid(&mut self, p: &BuildParams<'_>, path: CsidPath) -> Result<NodeHandle> {
        let port = p.port;
        let res = NodeRes::Csid(path);
        let vc_dt = p
            .sensor_cfg
            .and_then(|c| c.vc_dt_for(path))
            .unwrap_or_else(|| PortPlan::vc_dt_for(port, path));

        if p.reuse {
            let existing = self.lists.csid.iter().copied().find(|h| {
                self.pool
                    .get(*h)
                    .map(|n| n.res == res && n.vc_dt == vc_dt && n.is_dual == port.is_dual())
                    .unwrap_or(false)
            });
            if let Some(handle) = existing {
                return Ok(self.reuse(res, handle));
            }
        }

        let mut node = ResourceNode::new(res);
        node.is_dual = port.is_dual();
        node.is_secure = port.has_secure_output();
        node.vc_dt = vc_dt;
        let handle = self.alloc(node, ListKind::Csid)?;

        let mut args = self.reserve_args(p, res, vc_dt);
        let lite_first = path.is_rdi() && port.can_use_lite && !port.is_dual();
        let passes: &[bool] = if lite_first { &[true, false] } else { &[false] };

        let mut last_tried = None;
        for &lite_pass in passes {
            args.need_lite = lite_pass;
            let candidates = self.csid_candidates(p, path, lite_pass);
            if let Some(last) = candidates.last() {
                last_tried = Some(last.caps.id);
            }

            if !port.is_dual() {
                if let Some(binding) = self.reserve_first(candidates.iter().copied(), &args, None)? {
                    self.bind(handle, Split::Left, binding)?;
                    return Ok(handle);
                }
                continue;
            }

            for (i, left) in candidates.iter().enumerate() {
                let mut left_args = args.clone();
                left_args.split = Some(Split::Left);
                left_args.sync = SyncMode::Master;
                let Some(left_binding) = self.reserve_first([*left], &left_args, None)? else {
                    continue;
                };

                let mut right_args = args.clone();
                right_args.split = Some(Split::Right);
                right_args.sync = SyncMode::Slave;
                let others = candidates.iter().skip(i + 1).chain(candidates.iter().take(i)).copied();
                match self.reserve_first(others, &right_args, Some(left.caps.id)) {
                    Ok(Some(right_binding)) => {
                        self.bind(handle, Split::Left, left_binding)?;
                        self.bind(handle, Split::Right, right_binding)?;
                        return Ok(handle);
                    }
                    Ok(None) => {
                        debug!(hw = %left.caps.id, "no dual partner, releasing left");
                        release_binding(self.registry, &left_binding);
                    }
                    Err(e) => {
                        release_binding(self.registry, &left_binding);
                        return Err(e);
                    }
                }
            }
        }

        Err(match last_tried {
            Some(hw) => IspError::hw(hw, HwError::Busy),
            None => IspError::rejected(format!("no CSID can serve {}", path)),
        })
    }

    /// Instances hosting the fetch read path: SFE for SFE ports, IFE otherwise
    fn acquire_bus_read(&mut self, p: &BuildParams<'_>) -> Result<NodeHandle> {
        let port = p.port;
        let host = if port.uses_sfe() { HwType::Sfe } else { HwType::Ife };
        let res = NodeRes::BusRead;

        let mut node = ResourceNode::new(res);
        node.is_dual = port.is_dual();
        let handle = self.alloc(node, ListKind::BusRead)?;

        let filter = CandidateFilter {
            remote: p.kind == AcquireKind::Virtual,
            need_dual: port.is_dual(),
            ..CandidateFilter::default()
        };
        let candidates = self.registry.candidates(host, filter, ScanOrder::Ascending);
        let args = self.reserve_args(p, res, port.primary_vc_dt());

        let splits: &[(Split, SyncMode)] = if port.is_dual() {
            &[(Split::Left, SyncMode::Master), (Split::Right, SyncMode::Slave)]
        } else {
            &[(Split::Left, SyncMode::None)]
        };
        let mut taken = None;
        for &(split, sync) in splits {
            let mut split_args = args.clone();
            split_args.split = port.is_dual().then_some(split);
            split_args.sync = sync;
            let binding = self
                .reserve_first(candidates.iter().copied(), &split_args, taken)?
                .ok_or_else(|| IspError::rejected(format!("no {} for fetch read", host)))?;
            taken = Some(binding.hw());
            self.bind(handle, split, binding)?;
        }
        Ok(handle)
    }

    /// Parent node of an SFE source: its CSID path, or the read path when fetching
    fn sfe_parent(&self, p: &BuildParams<'_>, src: SfeSrc) -> Result<NodeHandle> {
        let res = if p.port.is_fetch() {
            NodeRes::BusRead
        } else {
            NodeRes::Csid(port_map::csid_path_for_sfe(src))
        };
        self.port_nodes
            .get(&res)
            .copied()
            .ok_or_else(|| IspError::rejected(format!("no parent {} for sfe {}", res, src)))
    }

    fn acquire_sfe_src(&mut self, p: &BuildParams<'_>, src: SfeSrc) -> Result<NodeHandle> {
        let res = NodeRes::SfeSrc(src);
        let parent = self.sfe_parent(p, src)?;
        if p.reuse {
            if let Some(handle) = self.find_child(&self.lists.sfe_src, res, parent) {
                return Ok(self.reuse(res, handle));
            }
        }
        let parent_node = self.pool.get(parent)?.clone();

        let mut node = ResourceNode::new(res);
        node.is_dual = parent_node.is_dual;
        node.parent = Some(parent);
        let handle = self.alloc(node, ListKind::SfeSrc)?;
        self.pool.get_mut(parent)?.num_children += 1;

        let args = self.reserve_args(p, res, parent_node.vc_dt);
        let mut taken = None;
        for (split, parent_binding) in parent_node.bindings() {
            let candidates: Vec<&HwEntry> = match parent_node.res {
                // Read path already sits on an SFE: same instance
                NodeRes::BusRead => self.registry.get(parent_binding.hw()).into_iter().collect(),
                // Streaming: SFE follows the CSID split through its links
                _ => self.registry.linked(parent_binding.hw(), HwType::Sfe),
            };
            let mut split_args = args.clone();
            split_args.split = parent_node.is_dual.then_some(split);
            split_args.sync = parent_binding.sync;
            let binding = self
                .reserve_first(candidates, &split_args, taken)?
                .ok_or_else(|| IspError::hw(parent_binding.hw(), HwError::Busy))?;
            taken = Some(binding.hw());
            self.bind(handle, split, binding)?;
        }
        Ok(handle)
    }

    /// Parent node of an IFE mux input
    fn ife_parent(&self, p: &BuildParams<'_>, src: IfeSrc) -> Result<NodeHandle> {
        let port = p.port;
        let res = if port.is_fetch() {
            if port.uses_sfe() {
                NodeRes::SfeSrc(SfeSrc::Pix)
            } else {
                NodeRes::BusRead
            }
        } else {
            let path = port_map::csid_path_for(src, p.plan.rdi_lcr);
            match port_map::sfe_src_between(path) {
                Some(sfe) if port.uses_sfe() => NodeRes::SfeSrc(sfe),
                _ => NodeRes::Csid(path),
            }
        };
        self.port_nodes
            .get(&res)
            .copied()
            .ok_or_else(|| IspError::rejected(format!("no parent {} for ife {}", res, src)))
    }

    fn ife_can_host(entry: &HwEntry, src: IfeSrc, remote: bool) -> bool {
        let caps = &entry.caps;
        caps.is_virtual == remote
            && match src {
                IfeSrc::Camif => caps.num_pix > 0,
                IfeSrc::Pdlib => caps.num_ppp > 0,
                IfeSrc::Lcr => !caps.is_lite,
                IfeSrc::Rdi(n) => n < caps.num_rdi,
            }
    }

    fn acquire_ife_src(&mut self, p: &BuildParams<'_>, src: IfeSrc) -> Result<NodeHandle> {
        let res = NodeRes::IfeSrc(src);
        let parent = self.ife_parent(p, src)?;
        if p.reuse {
            if let Some(handle) = self.find_child(&self.lists.ife_src, res, parent) {
                return Ok(self.reuse(res, handle));
            }
        }
        let parent_node = self.pool.get(parent)?.clone();
        let remote = p.kind == AcquireKind::Virtual;

        // Keep one port on one IFE per split where possible
        let port_ife: Vec<u32> = self
            .port_nodes
            .iter()
            .filter(|(r, _)| matches!(r, NodeRes::IfeSrc(_)))
            .filter_map(|(_, h)| self.pool.get(*h).ok())
            .flat_map(|n| n.hw_ids().map(|id| id.index).collect::<Vec<_>>())
            .collect();

        let mut node = ResourceNode::new(res);
        node.is_dual = parent_node.is_dual;
        node.parent = Some(parent);
        let handle = self.alloc(node, ListKind::IfeSrc)?;
        self.pool.get_mut(parent)?.num_children += 1;

        let args = self.reserve_args(p, res, parent_node.vc_dt);
        let mut taken = None;
        for (split, parent_binding) in parent_node.bindings() {
            let parent_hw = parent_binding.hw();
            let mut candidates: Vec<&HwEntry> = match parent_hw.hw_type {
                HwType::Csid => self.registry.linked(parent_hw, HwType::Ife),
                // SFE k and a read path on IFE k both feed IFE k
                HwType::Sfe | HwType::Ife => self
                    .registry
                    .get(HwId::ife(parent_hw.index))
                    .into_iter()
                    .collect(),
            };
            candidates.retain(|e| Self::ife_can_host(e, src, remote));
            candidates.sort_by_key(|e| {
                let idx = e.caps.id.index;
                (p.preferred_ife != Some(idx), !port_ife.contains(&idx))
            });

            let mut split_args = args.clone();
            split_args.split = parent_node.is_dual.then_some(split);
            split_args.sync = parent_binding.sync;
            let binding = self
                .reserve_first(candidates, &split_args, taken)?
                .ok_or_else(|| IspError::hw(parent_hw, HwError::Busy))?;
            taken = Some(binding.hw());
            self.bind(handle, split, binding)?;
        }
        Ok(handle)
    }

    fn acquire_out(&mut self, p: &BuildParams<'_>, out: &port_map::PlannedOut) -> Result<NodeHandle> {
        let (res, kind, parent_res) = match out.family {
            OutFamily::Ife => (
                NodeRes::IfeOut(out.port),
                ListKind::IfeOut(out.port),
                NodeRes::IfeSrc(port_map::ife_src_for(out.category)),
            ),
            OutFamily::Sfe => {
                let src = port_map::sfe_src_for(out.category)
                    .ok_or(IspError::UnmappedOutPort(out.port))?;
                (NodeRes::SfeOut(out.port), ListKind::SfeOut(out.port), NodeRes::SfeSrc(src))
            }
        };

        let bound = match out.family {
            OutFamily::Ife => self.lists.ife_out.get(&out.port).copied(),
            OutFamily::Sfe => self.lists.sfe_out.get(&out.port).copied(),
        };
        let parent = self
            .port_nodes
            .get(&parent_res)
            .copied()
            .ok_or_else(|| IspError::rejected(format!("no {} for output {}", parent_res, out.port)))?;

        if let Some(handle) = bound {
            // Shared only along the same source chain
            let same_chain = self.pool.get(handle)?.parent == Some(parent);
            if p.reuse && same_chain {
                return Ok(self.reuse(res, handle));
            }
            return Err(IspError::rejected(format!("output {} already acquired", out.port)));
        }
        let parent_node = self.pool.get(parent)?.clone();

        let mut node = ResourceNode::new(res);
        node.is_dual = parent_node.is_dual;
        node.is_secure = out.secure;
        node.parent = Some(parent);
        let handle = self.alloc(node, kind)?;
        self.pool.get_mut(parent)?.num_children += 1;

        let args = ReserveArgs {
            secure: out.secure,
            ..self.reserve_args(p, res, parent_node.vc_dt)
        };
        for (split, parent_binding) in parent_node.bindings() {
            let entry = self
                .registry
                .get(parent_binding.hw())
                .ok_or_else(|| IspError::rejected(format!("{} left the registry", parent_binding.hw())))?;
            let mut split_args = args.clone();
            split_args.split = parent_node.is_dual.then_some(split);
            split_args.sync = parent_binding.sync;
            let binding = self
                .reserve_first([entry], &split_args, None)?
                .ok_or_else(|| IspError::hw(entry.caps.id, HwError::Busy))?;
            self.bind(handle, split, binding)?;
        }

        match out.family {
            OutFamily::Ife => self.outcome.new_ife_out += 1,
            OutFamily::Sfe => self.outcome.new_sfe_out += 1,
        }
        if out.requested != out.port {
            self.outcome.rdi_remaps.push((out.requested, out.port));
        }
        Ok(handle)
    }

    fn find_child(&self, list: &[NodeHandle], res: NodeRes, parent: NodeHandle) -> Option<NodeHandle> {
        list.iter().copied().find(|h| {
            self.pool
                .get(*h)
                .map(|n| n.res == res && n.parent == Some(parent))
                .unwrap_or(false)
        })
    }

    /// Release and free everything this build allocated, newest first
    fn unwind(&mut self) {
        while let Some(handle) = self.journal.pop() {
            let node = match self.pool.free(handle) {
                Ok(node) => node,
                Err(e) => {
                    warn!(error = %e, "unwind found a stale node");
                    continue;
                }
            };
            self.lists.remove(handle);
            if !node.linked {
                for (_, binding) in node.bindings() {
                    release_binding(self.registry, binding);
                }
            }
            if let Some(parent) = node.parent {
                if let Ok(parent) = self.pool.get_mut(parent) {
                    parent.num_children = parent.num_children.saturating_sub(1);
                }
            }
        }
        self.port_nodes.clear();
        self.outcome = BuildOutcome::default();
    }
}

/// Best-effort release of one reservation
pub(crate) fn release_binding(registry: &Registry, binding: &HwBinding) {
    match registry.hw(binding.hw()) {
        Ok(hw) => {
            if let Err(e) = hw.release(&binding.rsv) {
                warn!(hw = %binding.hw(), res = %binding.rsv.res, error = %e, "release failed");
            }
        }
        Err(e) => warn!(error = %e, "release on unknown instance"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use ifemgr_sim::{HwOp, SimPlatform};

    struct Fixture {
        sim: SimPlatform,
        registry: Registry,
        config: ManagerConfig,
        pool: NodePool,
        lists: NodeLists,
    }

    impl Fixture {
        fn new(sim: SimPlatform) -> Self {
            let registry = Registry::enumerate(&sim.platform().instances).unwrap();
            Self {
                sim,
                registry,
                config: ManagerConfig::default(),
                pool: NodePool::new("test", 64),
                lists: NodeLists::default(),
            }
        }

        fn build(&mut self, port: &InPort, owner: Owner) -> Result<BuildOutcome> {
            let plan = port_map::classify(port, 0x30, 0x20, &BTreeSet::new())?;
            let params = BuildParams {
                owner,
                kind: AcquireKind::Real,
                port,
                plan: &plan,
                sensor_cfg: None,
                preferred_ife: None,
                reuse: false,
            };
            Builder::new(&self.registry, &self.config, &mut self.pool, &mut self.lists).build(params)
        }
    }

    #[test]
    fn test_single_port_stays_on_one_instance_pair() {
        let mut fx = Fixture::new(SimPlatform::builder().full(2).build().unwrap());
        let port = InPort::with_outputs([OutPortId::FULL, OutPortId::RDI0]);
        let outcome = fx.build(&port, Owner::Ctx(0)).unwrap();

        assert_eq!(outcome.created.len(), 6);
        assert_eq!(outcome.new_ife_out, 2);
        let hws: BTreeSet<HwId> = outcome
            .used
            .iter()
            .flat_map(|h| fx.pool.get(*h).unwrap().hw_ids().collect::<Vec<_>>())
            .collect();
        // Single ports scan from the top
        assert_eq!(hws, [HwId::csid(1), HwId::ife(1)].into_iter().collect());
    }

    #[test]
    fn test_busy_csid_moves_to_next_candidate() {
        let mut fx = Fixture::new(SimPlatform::builder().full(2).build().unwrap());
        let port = InPort::with_outputs([OutPortId::RDI0]);
        fx.build(&port, Owner::Ctx(0)).unwrap();

        let mut lists2 = NodeLists::default();
        let mut pool2 = NodePool::new("test2", 8);
        let plan = port_map::classify(&port, 0x30, 0x20, &BTreeSet::new()).unwrap();
        let outcome = Builder::new(&fx.registry, &fx.config, &mut pool2, &mut lists2)
            .build(BuildParams {
                owner: Owner::Ctx(1),
                kind: AcquireKind::Real,
                port: &port,
                plan: &plan,
                sensor_cfg: None,
                preferred_ife: None,
                reuse: false,
            })
            .unwrap();
        let csid = pool2.get(lists2.csid[0]).unwrap().left().unwrap().hw();
        assert_eq!(csid, HwId::csid(0));
        assert_eq!(outcome.used.len(), 3);
    }

    #[test]
    fn test_exhausted_csids_report_last_candidate_tried() {
        let fx = Fixture::new(SimPlatform::builder().full(2).build().unwrap());
        let port = InPort::with_outputs([OutPortId::RDI0]);
        let plan = port_map::classify(&port, 0x30, 0x20, &BTreeSet::new()).unwrap();
        let mut results = Vec::new();
        for owner in 0..3 {
            let mut lists = NodeLists::default();
            let mut pool = NodePool::new("test", 8);
            let result = Builder::new(&fx.registry, &fx.config, &mut pool, &mut lists).build(BuildParams {
                owner: Owner::Ctx(owner),
                kind: AcquireKind::Real,
                port: &port,
                plan: &plan,
                sensor_cfg: None,
                preferred_ife: None,
                reuse: false,
            });
            results.push(result.map(|_| ()));
        }

        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        // Single ports scan downward, so csid0 is the final candidate
        let err = results[2].clone().unwrap_err();
        assert!(err.is_busy());
        assert!(matches!(err, IspError::Hw { hw, .. } if hw == HwId::csid(0)));
    }

    #[test]
    fn test_non_busy_error_is_fatal_and_unwinds() {
        let mut fx = Fixture::new(SimPlatform::builder().full(2).build().unwrap());
        fx.sim
            .hw(HwId::ife(1))
            .unwrap()
            .fail_next(HwOp::Reserve, HwError::rejected("bad format"));
        let port = InPort::with_outputs([OutPortId::FULL]);
        let err = fx.build(&port, Owner::Ctx(0)).unwrap_err();
        assert!(matches!(err, IspError::Hw { hw, .. } if hw == HwId::ife(1)));

        assert!(fx.pool.is_empty());
        assert!(fx.lists.is_empty());
        assert_eq!(fx.sim.log.count(HwOp::Reserve), fx.sim.log.count(HwOp::Release));
    }

    #[test]
    fn test_all_busy_reports_busy() {
        let mut fx = Fixture::new(SimPlatform::builder().full(1).build().unwrap());
        let port = InPort::with_outputs([OutPortId::FULL]);
        fx.build(&port, Owner::Ctx(0)).unwrap();

        let mut pool2 = NodePool::new("test2", 8);
        let mut lists2 = NodeLists::default();
        let plan = port_map::classify(&port, 0x30, 0x20, &BTreeSet::new()).unwrap();
        let err = Builder::new(&fx.registry, &fx.config, &mut pool2, &mut lists2)
            .build(BuildParams {
                owner: Owner::Ctx(1),
                kind: AcquireKind::Real,
                port: &port,
                plan: &plan,
                sensor_cfg: None,
                preferred_ife: None,
                reuse: false,
            })
            .unwrap_err();
        assert!(err.is_busy());
        assert!(pool2.is_empty());
    }

    #[test]
    fn test_lite_preferred_for_rdi_only() {
        let mut fx = Fixture::new(SimPlatform::builder().full(2).lite(1).build().unwrap());
        let mut port = InPort::with_outputs([OutPortId::RDI0]);
        port.can_use_lite = true;
        fx.build(&port, Owner::Ctx(0)).unwrap();
        let csid = fx.pool.get(fx.lists.csid[0]).unwrap().left().unwrap().hw();
        let ife = fx.pool.get(fx.lists.ife_src[0]).unwrap().left().unwrap().hw();
        assert_eq!(csid, HwId::csid(2));
        assert_eq!(ife, HwId::ife(2));
    }

    #[test]
    fn test_fetch_port_reads_from_lowest_ife() {
        let mut fx = Fixture::new(SimPlatform::builder().full(3).build().unwrap());
        let mut port = InPort::with_outputs([OutPortId::FULL]);
        port.source = ifemgr_core::InputSource::Fetch;
        fx.build(&port, Owner::Ctx(0)).unwrap();
        assert!(fx.lists.csid.is_empty());
        let rd = fx.pool.get(fx.lists.bus_rd[0]).unwrap().left().unwrap().hw();
        assert_eq!(rd, HwId::ife(0));
        let camif = fx.pool.get(fx.lists.ife_src[0]).unwrap().left().unwrap().hw();
        assert_eq!(camif, HwId::ife(0));
    }

    #[test]
    fn test_sfe_port_builds_sfe_chain() {
        let mut fx = Fixture::new(SimPlatform::builder().full(2).sfe(2).build().unwrap());
        let mut port = InPort::with_outputs([OutPortId::FULL, OutPortId::SFE_RDI0]);
        port.sfe_mode = ifemgr_core::SfeMode::Shdr;
        fx.build(&port, Owner::Ctx(0)).unwrap();

        assert_eq!(fx.lists.sfe_src.len(), 2);
        assert_eq!(fx.lists.sfe_out.len(), 1);
        let camif = fx
            .lists
            .ife_src
            .iter()
            .map(|h| fx.pool.get(*h).unwrap())
            .find(|n| n.res == NodeRes::IfeSrc(IfeSrc::Camif))
            .unwrap();
        let parent = fx.pool.get(camif.parent.unwrap()).unwrap();
        assert_eq!(parent.res, NodeRes::SfeSrc(SfeSrc::Pix));
        assert_eq!(parent.left().unwrap().hw().index, camif.left().unwrap().hw().index);
    }
}
