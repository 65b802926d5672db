//! Capability registry
//!
//! Probes every instance once at init and keeps the results in an immutable
//! table indexed by family and hardware index. Reservation state is not kept
//! here; it lives in the nodes that own the reservations.

use std::collections::BTreeMap;
use std::sync::Arc;

use ifemgr_core::{HwCaps, HwId, HwType, IspError, IspHw, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

/// One probed instance
#[derive(Debug, Clone)]
pub struct HwEntry {
    pub caps: HwCaps,
    pub hw: Arc<dyn IspHw>,
}

/// Full/lite/virtual counts for one family
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassCounts {
    pub full: usize,
    pub lite: usize,
    pub remote: usize,
}

impl ClassCounts {
    pub fn total(&self) -> usize {
        self.full + self.lite + self.remote
    }
}

/// Per-family instance counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryCounts {
    pub csid: ClassCounts,
    pub sfe: ClassCounts,
    pub ife: ClassCounts,
}

impl RegistryCounts {
    pub fn of(&self, hw_type: HwType) -> &ClassCounts {
        match hw_type {
            HwType::Csid => &self.csid,
            HwType::Sfe => &self.sfe,
            HwType::Ife => &self.ife,
        }
    }

    fn of_mut(&mut self, hw_type: HwType) -> &mut ClassCounts {
        match hw_type {
            HwType::Csid => &mut self.csid,
            HwType::Sfe => &mut self.sfe,
            HwType::Ife => &mut self.ife,
        }
    }
}

/// Scan order over candidate instances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    Ascending,
    Descending,
}

/// Filter applied while scanning candidates
#[derive(Debug, Clone, Copy, Default)]
pub struct CandidateFilter {
    /// Remote-controlled instances instead of local ones
    pub remote: bool,
    /// Lite instances are acceptable
    pub allow_lite: bool,
    /// Only lite instances are acceptable
    pub lite_only: bool,
    /// Must support dual
    pub need_dual: bool,
}

/// Immutable-after-init table of every usable instance
#[derive(Debug, Clone)]
pub struct Registry {
    entries: BTreeMap<HwId, HwEntry>,
    counts: RegistryCounts,
    max_ife_out_res: u32,
    max_sfe_out_res: u32,
}

impl Registry {
    /// Probe every instance. A failed probe excludes that instance; a family
    /// with no usable instance at all fails the whole registry.
    pub fn enumerate(instances: &[Arc<dyn IspHw>]) -> Result<Self> {
        let mut entries = BTreeMap::new();

        for hw in instances {
            let id = hw.id();
            match hw.get_hw_caps() {
                Ok(caps) => {
                    debug!(
                        hw = %id,
                        lite = caps.is_lite,
                        remote = caps.is_virtual,
                        max_out = caps.max_out_res,
                        "instance probed"
                    );
                    entries.insert(
                        id,
                        HwEntry {
                            caps,
                            hw: hw.clone(),
                        },
                    );
                }
                Err(e) => {
                    warn!(hw = %id, error = %e, "probe failed, instance excluded");
                }
            }
        }

        let mut registry = Self {
            entries,
            counts: RegistryCounts::default(),
            max_ife_out_res: 0,
            max_sfe_out_res: 0,
        };
        registry.count_by_class();

        for required in [HwType::Csid, HwType::Ife] {
            if registry.counts.of(required).total() == 0 {
                return Err(IspError::NoDevicesFound { hw_type: required });
            }
        }

        info!(
            csid = registry.counts.csid.total(),
            sfe = registry.counts.sfe.total(),
            ife = registry.counts.ife.total(),
            "capability registry built"
        );
        Ok(registry)
    }

    /// Recompute class counts and per-family output namespace sizes
    pub fn count_by_class(&mut self) -> &RegistryCounts {
        let mut counts = RegistryCounts::default();
        let mut max_ife = 0;
        let mut max_sfe = 0;
        for entry in self.entries.values() {
            let class = counts.of_mut(entry.caps.id.hw_type);
            if entry.caps.is_virtual {
                class.remote += 1;
            } else if entry.caps.is_lite {
                class.lite += 1;
            } else {
                class.full += 1;
            }
            match entry.caps.id.hw_type {
                HwType::Ife => max_ife = max_ife.max(entry.caps.max_out_res),
                HwType::Sfe => max_sfe = max_sfe.max(entry.caps.max_out_res),
                HwType::Csid => {}
            }
        }
        self.counts = counts;
        self.max_ife_out_res = max_ife;
        self.max_sfe_out_res = max_sfe;
        &self.counts
    }

    pub fn counts(&self) -> &RegistryCounts {
        &self.counts
    }

    pub fn max_ife_out_res(&self) -> u32 {
        self.max_ife_out_res
    }

    pub fn max_sfe_out_res(&self) -> u32 {
        self.max_sfe_out_res
    }

    pub fn get(&self, id: HwId) -> Option<&HwEntry> {
        self.entries.get(&id)
    }

    pub fn caps(&self, id: HwId) -> Option<&HwCaps> {
        self.entries.get(&id).map(|e| &e.caps)
    }

    /// The instance handle; excluded or unknown instances are rejected
    pub fn hw(&self, id: HwId) -> Result<&Arc<dyn IspHw>> {
        self.entries
            .get(&id)
            .map(|e| &e.hw)
            .ok_or_else(|| IspError::rejected(format!("{} not in registry", id)))
    }

    pub fn entries(&self) -> impl Iterator<Item = &HwEntry> + '_ {
        self.entries.values()
    }

    /// Instances of one family matching `filter`, in `order`
    pub fn candidates(&self, hw_type: HwType, filter: CandidateFilter, order: ScanOrder) -> Vec<&HwEntry> {
        let mut found: Vec<&HwEntry> = self
            .entries
            .values()
            .filter(|e| e.caps.id.hw_type == hw_type)
            .filter(|e| e.caps.is_virtual == filter.remote)
            .filter(|e| !e.caps.is_lite || filter.allow_lite || filter.lite_only)
            .filter(|e| !filter.lite_only || e.caps.is_lite)
            .filter(|e| !filter.need_dual || e.caps.supports_dual)
            .collect();
        if order == ScanOrder::Descending {
            found.reverse();
        }
        found
    }

    /// Downstream instances of `hw_type` a CSID can feed, same index first
    pub fn linked(&self, csid: HwId, hw_type: HwType) -> Vec<&HwEntry> {
        let Some(caps) = self.caps(csid) else {
            return Vec::new();
        };
        let mut targets: Vec<u32> = caps.links.clone();
        targets.sort_by_key(|&i| (i != csid.index, i));
        targets
            .into_iter()
            .filter_map(|i| self.entries.get(&HwId::new(hw_type, i)))
            .collect()
    }
}
