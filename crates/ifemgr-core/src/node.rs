//! Resource-graph nodes

use serde::{Deserialize, Serialize};

use crate::hw::{HwId, Split, SyncMode};
use crate::interface::Reservation;
use crate::pool::NodeHandle;
use crate::port::VcDt;
use crate::resource::NodeRes;

/// One split's hardware binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwBinding {
    pub rsv: Reservation,
    pub sync: SyncMode,
}

impl HwBinding {
    pub fn hw(&self) -> HwId {
        self.rsv.hw
    }
}

/// A logical resource bound to up to two physical instances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNode {
    pub res: NodeRes,
    pub is_dual: bool,
    pub is_secure: bool,
    /// Shares a stream group's reservation instead of owning one
    pub linked: bool,
    /// Number of nodes hanging from this one
    pub num_children: u32,
    pub parent: Option<NodeHandle>,
    /// Primary vc/dt (CSID nodes)
    pub vc_dt: VcDt,
    pub hw: [Option<HwBinding>; 2],
}

impl ResourceNode {
    pub fn new(res: NodeRes) -> Self {
        Self {
            res,
            is_dual: false,
            is_secure: false,
            linked: false,
            num_children: 0,
            parent: None,
            vc_dt: VcDt::default(),
            hw: [None, None],
        }
    }

    pub fn binding(&self, split: Split) -> Option<&HwBinding> {
        self.hw[split.index()].as_ref()
    }

    pub fn set_binding(&mut self, split: Split, binding: HwBinding) {
        self.hw[split.index()] = Some(binding);
    }

    pub fn left(&self) -> Option<&HwBinding> {
        self.binding(Split::Left)
    }

    pub fn right(&self) -> Option<&HwBinding> {
        self.binding(Split::Right)
    }

    /// Bound splits in left, right order
    pub fn bindings(&self) -> impl Iterator<Item = (Split, &HwBinding)> + '_ {
        Split::BOTH
            .into_iter()
            .filter_map(move |s| self.binding(s).map(|b| (s, b)))
    }

    pub fn hw_ids(&self) -> impl Iterator<Item = HwId> + '_ {
        self.bindings().map(|(_, b)| b.hw())
    }

    /// Split bound to the given instance, if any
    pub fn split_of(&self, hw: HwId) -> Option<Split> {
        self.bindings().find(|(_, b)| b.hw() == hw).map(|(s, _)| s)
    }

    pub fn is_bound(&self) -> bool {
        self.hw.iter().any(Option::is_some)
    }

    /// A dual node must carry both halves
    pub fn is_complete(&self) -> bool {
        if self.is_dual {
            self.hw[0].is_some() && self.hw[1].is_some()
        } else {
            self.hw[0].is_some()
        }
    }

    /// Copy of this node referencing the same reservations, for a stream-group link
    pub fn linked_copy(&self) -> Self {
        Self {
            linked: true,
            num_children: 0,
            parent: None,
            ..self.clone()
        }
    }
}

/// One distinct (instance, split) touched by a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseEntry {
    pub hw: HwId,
    pub split: Split,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::CsidPath;

    fn binding(hw: HwId, sync: SyncMode) -> HwBinding {
        HwBinding {
            rsv: Reservation {
                hw,
                res: NodeRes::Csid(CsidPath::Ipp),
                id: 1,
            },
            sync,
        }
    }

    #[test]
    fn test_dual_node_completeness() {
        let mut node = ResourceNode::new(NodeRes::Csid(CsidPath::Ipp));
        node.is_dual = true;
        node.set_binding(Split::Left, binding(HwId::csid(0), SyncMode::Master));
        assert!(!node.is_complete());

        node.set_binding(Split::Right, binding(HwId::csid(1), SyncMode::Slave));
        assert!(node.is_complete());
        assert_eq!(node.split_of(HwId::csid(1)), Some(Split::Right));
        assert_eq!(node.hw_ids().collect::<Vec<_>>(), vec![HwId::csid(0), HwId::csid(1)]);
    }

    #[test]
    fn test_linked_copy_keeps_bindings() {
        let mut node = ResourceNode::new(NodeRes::Csid(CsidPath::Rdi(0)));
        node.num_children = 2;
        node.set_binding(Split::Left, binding(HwId::csid(2), SyncMode::None));

        let copy = node.linked_copy();
        assert!(copy.linked);
        assert_eq!(copy.num_children, 0);
        assert_eq!(copy.left(), node.left());
    }
}
