//! Streaming context state
//!
//! A context is locked as a whole by its slot mutex for lifecycle calls. The
//! fields the event path reads (overflow flag, recovery generation, route
//! table, task queue, frame counters) sit beside that mutex so interrupts
//! never wait behind a blocking hardware call.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ifemgr_core::{
    AcquireKind, BaseEntry, CdmHandle, ContextState, CtxCounters, CtxFlags, CtxType, EventCallback,
    HwUpdateEntry, NodeHandle, NodePool, NodeRes, OutPortId, ResourceNode,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::router::RouteTable;

/// Node list a handle is filed under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    Csid,
    SfeSrc,
    IfeSrc,
    BusRead,
    SfeOut(OutPortId),
    IfeOut(OutPortId),
}

impl ListKind {
    /// List a node with the given resource belongs in
    pub fn for_res(res: NodeRes) -> Self {
        match res {
            NodeRes::Csid(_) => Self::Csid,
            NodeRes::SfeSrc(_) => Self::SfeSrc,
            NodeRes::IfeSrc(_) => Self::IfeSrc,
            NodeRes::BusRead => Self::BusRead,
            NodeRes::SfeOut(port) => Self::SfeOut(port),
            NodeRes::IfeOut(port) => Self::IfeOut(port),
        }
    }
}

/// Per-category node lists of one context or stream group
#[derive(Debug, Clone, Default)]
pub struct NodeLists {
    pub csid: Vec<NodeHandle>,
    pub sfe_src: Vec<NodeHandle>,
    pub ife_src: Vec<NodeHandle>,
    pub bus_rd: Vec<NodeHandle>,
    pub sfe_out: BTreeMap<OutPortId, NodeHandle>,
    pub ife_out: BTreeMap<OutPortId, NodeHandle>,
}

impl NodeLists {
    pub fn push(&mut self, kind: ListKind, handle: NodeHandle) {
        match kind {
            ListKind::Csid => self.csid.push(handle),
            ListKind::SfeSrc => self.sfe_src.push(handle),
            ListKind::IfeSrc => self.ife_src.push(handle),
            ListKind::BusRead => self.bus_rd.push(handle),
            ListKind::SfeOut(port) => {
                self.sfe_out.insert(port, handle);
            }
            ListKind::IfeOut(port) => {
                self.ife_out.insert(port, handle);
            }
        }
    }

    pub fn remove(&mut self, handle: NodeHandle) {
        self.csid.retain(|h| *h != handle);
        self.sfe_src.retain(|h| *h != handle);
        self.ife_src.retain(|h| *h != handle);
        self.bus_rd.retain(|h| *h != handle);
        self.sfe_out.retain(|_, h| *h != handle);
        self.ife_out.retain(|_, h| *h != handle);
    }

    /// Every handle, in init order
    pub fn init_order(&self) -> Vec<NodeHandle> {
        self.ife_src
            .iter()
            .chain(&self.sfe_src)
            .chain(self.sfe_out.values())
            .chain(&self.bus_rd)
            .chain(self.ife_out.values())
            .chain(&self.csid)
            .copied()
            .collect()
    }

    /// Every handle, in start order (consumers first, CSID last)
    pub fn start_order(&self) -> Vec<NodeHandle> {
        self.ife_out
            .values()
            .chain(&self.ife_src)
            .chain(self.sfe_out.values())
            .chain(&self.sfe_src)
            .chain(&self.bus_rd)
            .chain(&self.csid)
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.csid.len()
            + self.sfe_src.len()
            + self.ife_src.len()
            + self.bus_rd.len()
            + self.sfe_out.len()
            + self.ife_out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// One externally requested RDI bound to a different internal RDI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RdiMapping {
    pub sensor_id: u32,
    pub virtual_rdi: OutPortId,
    pub acquired_rdi: OutPortId,
}

/// Per-context virtual RDI table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VirtualRdiMap {
    entries: Vec<RdiMapping>,
}

impl VirtualRdiMap {
    pub fn insert(&mut self, mapping: RdiMapping) {
        self.entries.push(mapping);
    }

    /// External id for an acquired RDI port; unmapped ports map to themselves
    pub fn to_virtual(&self, acquired: OutPortId) -> OutPortId {
        self.entries
            .iter()
            .find(|m| m.acquired_rdi == acquired)
            .map(|m| m.virtual_rdi)
            .unwrap_or(acquired)
    }

    /// Acquired port for an external id requested by a given sensor
    pub fn to_acquired(&self, sensor_id: u32, virtual_rdi: OutPortId) -> Option<OutPortId> {
        self.entries
            .iter()
            .find(|m| m.sensor_id == sensor_id && m.virtual_rdi == virtual_rdi)
            .map(|m| m.acquired_rdi)
    }

    pub fn entries(&self) -> &[RdiMapping] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Diagnostic work queued by the event path and run by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CtxTask {
    RegDump,
    MiniDump,
}

/// Link from a context to a stream group it shares hardware with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLink {
    pub group: usize,
    pub sensor_id: u32,
    /// Group node -> its linked copy in the context pool
    pub nodes: BTreeMap<NodeHandle, NodeHandle>,
}

/// Lifecycle-owned context state, guarded by the slot mutex
pub struct IfeContext {
    pub index: usize,
    pub state: ContextState,
    pub kind: AcquireKind,
    pub ctx_type: CtxType,
    pub flags: CtxFlags,
    pub pool: NodePool,
    pub lists: NodeLists,
    /// Distinct (instance, split) pairs, in discovery order
    pub base: Vec<BaseEntry>,
    pub cdm: Option<CdmHandle>,
    pub rdi_map: VirtualRdiMap,
    pub callback: Option<Arc<dyn EventCallback>>,
    pub groups: Vec<GroupLink>,
    pub scratch: BTreeMap<OutPortId, u64>,
    pub current_mup: u32,
    pub curr_num_exp: u32,
    pub num_exposures: u32,
    /// Clock/bandwidth updates waiting for start
    pub pending: Vec<HwUpdateEntry>,
    /// Register batch received before stream-on
    pub init_batch: Option<(u64, Vec<HwUpdateEntry>)>,
    pub applied_req_id: u64,
    pub last_cdm_done_req: u64,
    pub num_acq_ife_out: u32,
    pub num_acq_sfe_out: u32,
    pub acquired_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for IfeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IfeContext")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("kind", &self.kind)
            .field("base", &self.base)
            .finish()
    }
}

impl IfeContext {
    pub fn new(index: usize, pool_size: usize) -> Self {
        Self {
            index,
            state: ContextState::Free,
            kind: AcquireKind::Real,
            ctx_type: CtxType::None,
            flags: CtxFlags::default(),
            pool: NodePool::new("context", pool_size),
            lists: NodeLists::default(),
            base: Vec::new(),
            cdm: None,
            rdi_map: VirtualRdiMap::default(),
            callback: None,
            groups: Vec::new(),
            scratch: BTreeMap::new(),
            current_mup: 0,
            curr_num_exp: 0,
            num_exposures: 1,
            pending: Vec::new(),
            init_batch: None,
            applied_req_id: 0,
            last_cdm_done_req: 0,
            num_acq_ife_out: 0,
            num_acq_sfe_out: 0,
            acquired_at: None,
        }
    }

    /// Return to the just-created state, keeping the (already emptied) pool
    pub fn reset(&mut self) {
        let pool = std::mem::replace(&mut self.pool, NodePool::new("context", 0));
        *self = Self {
            pool,
            ..Self::new(self.index, 0)
        };
    }

    pub fn node(&self, handle: NodeHandle) -> ifemgr_core::Result<&ResourceNode> {
        self.pool.get(handle)
    }

    /// Recompute the base list from every bound node
    pub fn compute_base(&mut self) {
        let mut base: Vec<BaseEntry> = Vec::new();
        for handle in self.lists.init_order() {
            let Ok(node) = self.pool.get(handle) else {
                continue;
            };
            for (split, binding) in node.bindings() {
                let entry = BaseEntry {
                    hw: binding.hw(),
                    split,
                };
                if !base.iter().any(|b| b.hw == entry.hw) {
                    base.push(entry);
                }
            }
        }
        base.sort_by_key(|b| (b.split, b.hw.hw_type, b.hw.index));
        self.base = base;
    }

    /// Master IFE instance and its dual partner, from the first IFE source
    pub fn hw_idx_pair(&self) -> (Option<ifemgr_core::HwId>, Option<ifemgr_core::HwId>) {
        self.lists
            .ife_src
            .first()
            .and_then(|h| self.pool.get(*h).ok())
            .map(|n| (n.left().map(|b| b.hw()), n.right().map(|b| b.hw())))
            .unwrap_or((None, None))
    }

    pub fn is_streaming(&self) -> bool {
        self.state == ContextState::Streaming
    }
}

/// One entry of the fixed context table
pub struct ContextSlot {
    pub index: usize,
    pub ctx: Mutex<IfeContext>,
    pub overflow_pending: AtomicBool,
    /// Recovery generation; queued recovery work carries the value it saw
    pub recovery_id: AtomicU64,
    pub route: RwLock<RouteTable>,
    pub tasks: Mutex<VecDeque<CtxTask>>,
    pub counters: Mutex<CtxCounters>,
}

impl ContextSlot {
    pub fn new(index: usize, pool_size: usize) -> Self {
        Self {
            index,
            ctx: Mutex::new(IfeContext::new(index, pool_size)),
            overflow_pending: AtomicBool::new(false),
            recovery_id: AtomicU64::new(0),
            route: RwLock::new(RouteTable::default()),
            tasks: Mutex::new(VecDeque::new()),
            counters: Mutex::new(CtxCounters::default()),
        }
    }

    pub fn recovery_id(&self) -> u64 {
        self.recovery_id.load(Ordering::Acquire)
    }

    /// Advance the recovery generation and return the new value
    pub fn bump_recovery_id(&self) -> u64 {
        self.recovery_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn overflow_pending(&self) -> bool {
        self.overflow_pending.load(Ordering::Acquire)
    }

    pub fn set_overflow_pending(&self, value: bool) -> bool {
        self.overflow_pending.swap(value, Ordering::AcqRel)
    }

    /// Drop any queued diagnostic work
    pub fn flush_tasks(&self) -> usize {
        let mut tasks = self.tasks.lock();
        let n = tasks.len();
        tasks.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(index: u32) -> NodeHandle {
        NodeHandle {
            index,
            generation: 0,
        }
    }

    #[test]
    fn test_start_order_is_consumers_first() {
        let mut lists = NodeLists::default();
        lists.push(ListKind::Csid, handle(0));
        lists.push(ListKind::IfeSrc, handle(1));
        lists.push(ListKind::IfeOut(OutPortId::FULL), handle(2));
        lists.push(ListKind::SfeSrc, handle(3));
        lists.push(ListKind::SfeOut(OutPortId::SFE_RDI0), handle(4));
        lists.push(ListKind::BusRead, handle(5));

        let order: Vec<u32> = lists.start_order().iter().map(|h| h.index).collect();
        assert_eq!(order, vec![2, 1, 4, 3, 5, 0]);

        let init: Vec<u32> = lists.init_order().iter().map(|h| h.index).collect();
        assert_eq!(init, vec![1, 3, 4, 5, 2, 0]);
    }

    #[test]
    fn test_remove_from_any_list() {
        let mut lists = NodeLists::default();
        lists.push(ListKind::IfeOut(OutPortId::RDI0), handle(7));
        lists.push(ListKind::Csid, handle(8));
        lists.remove(handle(7));
        assert!(lists.ife_out.is_empty());
        assert_eq!(lists.len(), 1);
    }

    #[test]
    fn test_virtual_rdi_translation() {
        let mut map = VirtualRdiMap::default();
        map.insert(RdiMapping {
            sensor_id: 2,
            virtual_rdi: OutPortId::RDI0,
            acquired_rdi: OutPortId::RDI1,
        });
        assert_eq!(map.to_virtual(OutPortId::RDI1), OutPortId::RDI0);
        assert_eq!(map.to_virtual(OutPortId::RDI2), OutPortId::RDI2);
        assert_eq!(map.to_acquired(2, OutPortId::RDI0), Some(OutPortId::RDI1));
        assert_eq!(map.to_acquired(1, OutPortId::RDI0), None);
    }

    #[test]
    fn test_recovery_id_bump() {
        let slot = ContextSlot::new(0, 4);
        assert_eq!(slot.recovery_id(), 0);
        assert_eq!(slot.bump_recovery_id(), 1);
        assert!(!slot.set_overflow_pending(true));
        assert!(slot.overflow_pending());
    }
}
