//! Path/port compatibility tables and in-port classification
//!
//! Classification turns the requested outputs of one in-port into the set of
//! CSID paths, SFE sources and IFE mux inputs the graph needs, before any
//! hardware is touched.

use std::collections::BTreeSet;

use ifemgr_core::resource::{CsidPath, IfeSrc, OutFamily, PathCategory, SfeSrc, CSID_MAX_RDI};
use ifemgr_core::{InPort, IspError, OutPortId, OutRequest, Result, VcDt};

/// IFE mux input an output category hangs from
pub fn ife_src_for(category: PathCategory) -> IfeSrc {
    match category {
        PathCategory::Ipp => IfeSrc::Camif,
        PathCategory::Ppp => IfeSrc::Pdlib,
        PathCategory::Lcr => IfeSrc::Lcr,
        PathCategory::Rdi(n) => IfeSrc::Rdi(n),
    }
}

/// SFE source an SFE output category hangs from
pub fn sfe_src_for(category: PathCategory) -> Option<SfeSrc> {
    match category {
        PathCategory::Ipp => Some(SfeSrc::Pix),
        PathCategory::Rdi(n) => Some(SfeSrc::Rdi(n)),
        PathCategory::Ppp | PathCategory::Lcr => None,
    }
}

/// CSID path feeding an IFE mux input
pub fn csid_path_for(src: IfeSrc, rdi_lcr: Option<u8>) -> CsidPath {
    match src {
        IfeSrc::Camif => CsidPath::Ipp,
        IfeSrc::Pdlib => CsidPath::Ppp,
        IfeSrc::Lcr => rdi_lcr.map(CsidPath::Rdi).unwrap_or(CsidPath::Ipp),
        IfeSrc::Rdi(n) => CsidPath::Rdi(n),
    }
}

/// CSID path feeding an SFE source
pub fn csid_path_for_sfe(src: SfeSrc) -> CsidPath {
    match src {
        SfeSrc::Pix => CsidPath::Ipp,
        SfeSrc::Rdi(n) => CsidPath::Rdi(n),
    }
}

/// SFE source sitting between a CSID path and the IFE, for SFE contexts
pub fn sfe_src_between(path: CsidPath) -> Option<SfeSrc> {
    match path {
        CsidPath::Ipp => Some(SfeSrc::Pix),
        CsidPath::Rdi(n) => Some(SfeSrc::Rdi(n)),
        CsidPath::Ppp => None,
    }
}

/// One requested output after classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedOut {
    /// Id as the client asked for it
    pub requested: OutPortId,
    /// Id actually bound; differs for remapped RDIs
    pub port: OutPortId,
    pub family: OutFamily,
    pub category: PathCategory,
    pub secure: bool,
}

/// Everything the builder needs to know about one in-port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortPlan {
    pub csid_paths: BTreeSet<CsidPath>,
    pub sfe_srcs: BTreeSet<SfeSrc>,
    pub ife_srcs: BTreeSet<IfeSrc>,
    pub outputs: Vec<PlannedOut>,
    /// CSID RDI that feeds the LCR mux, when LCR comes from an RDI
    pub rdi_lcr: Option<u8>,
}

impl PortPlan {
    /// vc/dt a CSID path should be reserved with: pair `n` feeds RDI `n` and
    /// the second pair feeds PPP; anything missing falls back to the first
    pub fn vc_dt_for(port: &InPort, path: CsidPath) -> VcDt {
        let idx = match path {
            CsidPath::Ipp => 0,
            CsidPath::Ppp => 1,
            CsidPath::Rdi(n) => n as usize,
        };
        port.vc_dt
            .get(idx)
            .copied()
            .unwrap_or_else(|| port.primary_vc_dt())
    }
}

/// Classify one in-port.
///
/// `taken_rdi` lists RDI outputs already bound on the context; a request for
/// one of those is remapped to the lowest free RDI so two sensors can ask for
/// the same nominal id.
pub fn classify(
    port: &InPort,
    max_ife_out_res: u32,
    max_sfe_out_res: u32,
    taken_rdi: &BTreeSet<u8>,
) -> Result<PortPlan> {
    if port.outputs.is_empty() {
        return Err(IspError::rejected("in-port requests no outputs"));
    }

    let mut plan = PortPlan::default();
    let mut used_rdi: BTreeSet<u8> = taken_rdi.clone();
    let requested_rdi: BTreeSet<u8> = port.outputs.iter().filter_map(|o| o.id.rdi_index()).collect();

    for out in &port.outputs {
        let info = out.id.info().ok_or(IspError::UnmappedOutPort(out.id))?;
        let limit = match info.family {
            OutFamily::Ife => max_ife_out_res,
            OutFamily::Sfe => max_sfe_out_res,
        };
        if out.id.namespace_index() >= limit {
            return Err(IspError::UnmappedOutPort(out.id));
        }
        if info.family == OutFamily::Sfe && !port.uses_sfe() {
            return Err(IspError::rejected(format!(
                "SFE output {} on a port without SFE mode",
                out.id
            )));
        }
        if port.is_fetch() && matches!(info.category, PathCategory::Rdi(_)) {
            return Err(IspError::rejected(format!("RDI output {} on a fetch port", out.id)));
        }

        let (category, bound) = match info.category {
            PathCategory::Rdi(n) if used_rdi.contains(&n) => {
                let free = (0..CSID_MAX_RDI)
                    .find(|i| !used_rdi.contains(i) && !requested_rdi.contains(i))
                    .ok_or_else(|| IspError::rejected(format!("no free RDI to remap {}", out.id)))?;
                let bound = match info.family {
                    OutFamily::Ife => OutPortId::ife_rdi(free),
                    OutFamily::Sfe => OutPortId::sfe_rdi(free),
                };
                if bound.info().is_none() {
                    return Err(IspError::UnmappedOutPort(bound));
                }
                (PathCategory::Rdi(free), bound)
            }
            category => (category, out.id),
        };
        if let PathCategory::Rdi(n) = category {
            used_rdi.insert(n);
        }

        plan.outputs.push(planned(out, bound, info.family, category));
    }

    if port.rdi_lcr && plan.outputs.iter().any(|o| o.category == PathCategory::Lcr) {
        let free = (0..CSID_MAX_RDI)
            .find(|i| !used_rdi.contains(i))
            .ok_or_else(|| IspError::rejected("no free RDI for LCR"))?;
        plan.rdi_lcr = Some(free);
    }

    for out in &plan.outputs {
        match out.family {
            OutFamily::Ife => {
                let src = ife_src_for(out.category);
                plan.ife_srcs.insert(src);
                if !port.is_fetch() {
                    plan.csid_paths.insert(csid_path_for(src, plan.rdi_lcr));
                }
            }
            OutFamily::Sfe => {
                let src = sfe_src_for(out.category).ok_or_else(|| {
                    IspError::rejected(format!("{} has no SFE source", out.port))
                })?;
                plan.sfe_srcs.insert(src);
                if !port.is_fetch() {
                    plan.csid_paths.insert(csid_path_for_sfe(src));
                }
            }
        }
    }

    // SFE contexts route every CSID path that has an SFE source through the SFE
    if port.uses_sfe() {
        let through: Vec<SfeSrc> = plan.csid_paths.iter().filter_map(|p| sfe_src_between(*p)).collect();
        plan.sfe_srcs.extend(through);
    }

    Ok(plan)
}

fn planned(out: &OutRequest, port: OutPortId, family: OutFamily, category: PathCategory) -> PlannedOut {
    PlannedOut {
        requested: out.id,
        port,
        family,
        category,
        secure: out.secure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ifemgr_core::{InputSource, SfeMode};

    fn classify_simple(port: &InPort) -> Result<PortPlan> {
        classify(port, 0x30, 0x20, &BTreeSet::new())
    }

    #[test]
    fn test_ipp_and_rdi_paths() {
        let port = InPort::with_outputs([OutPortId::FULL, OutPortId::DS4, OutPortId::RDI0]);
        let plan = classify_simple(&port).unwrap();
        assert_eq!(
            plan.csid_paths.iter().copied().collect::<Vec<_>>(),
            vec![CsidPath::Ipp, CsidPath::Rdi(0)]
        );
        assert_eq!(
            plan.ife_srcs.iter().copied().collect::<Vec<_>>(),
            vec![IfeSrc::Camif, IfeSrc::Rdi(0)]
        );
        assert!(plan.sfe_srcs.is_empty());
    }

    #[test]
    fn test_unmapped_out_port_rejected() {
        let port = InPort::with_outputs([OutPortId(0x30F0)]);
        assert_eq!(
            classify_simple(&port).unwrap_err(),
            IspError::UnmappedOutPort(OutPortId(0x30F0))
        );
        let port = InPort::with_outputs([OutPortId(0x4000)]);
        assert!(matches!(classify_simple(&port), Err(IspError::UnmappedOutPort(_))));
    }

    #[test]
    fn test_out_port_beyond_namespace_rejected() {
        let port = InPort::with_outputs([OutPortId::LCR]);
        let err = classify(&port, 0x10, 0x20, &BTreeSet::new()).unwrap_err();
        assert_eq!(err, IspError::UnmappedOutPort(OutPortId::LCR));
    }

    #[test]
    fn test_taken_rdi_is_remapped() {
        let port = InPort::with_outputs([OutPortId::RDI0, OutPortId::RDI1]);
        let taken: BTreeSet<u8> = [0].into_iter().collect();
        let plan = classify(&port, 0x30, 0x20, &taken).unwrap();
        assert_eq!(plan.outputs[0].requested, OutPortId::RDI0);
        assert_eq!(plan.outputs[0].port, OutPortId::RDI2);
        assert_eq!(plan.outputs[1].port, OutPortId::RDI1);
    }

    #[test]
    fn test_sfe_port_routes_through_sfe() {
        let mut port = InPort::with_outputs([OutPortId::FULL, OutPortId::SFE_RDI0, OutPortId::PDAF]);
        port.sfe_mode = SfeMode::Shdr;
        let plan = classify_simple(&port).unwrap();
        assert!(plan.sfe_srcs.contains(&SfeSrc::Pix));
        assert!(plan.sfe_srcs.contains(&SfeSrc::Rdi(0)));
        assert!(plan.csid_paths.contains(&CsidPath::Ppp));
        assert_eq!(plan.sfe_srcs.len(), 2);
    }

    #[test]
    fn test_sfe_output_needs_sfe_mode() {
        let port = InPort::with_outputs([OutPortId::SFE_RAW_DUMP]);
        assert!(matches!(classify_simple(&port), Err(IspError::Rejected { .. })));
    }

    #[test]
    fn test_fetch_port_has_no_csid_paths() {
        let mut port = InPort::with_outputs([OutPortId::FULL]);
        port.source = InputSource::Fetch;
        let plan = classify_simple(&port).unwrap();
        assert!(plan.csid_paths.is_empty());
        assert!(plan.ife_srcs.contains(&IfeSrc::Camif));

        port.outputs.push(OutRequest::new(OutPortId::RDI0));
        assert!(classify_simple(&port).is_err());
    }

    #[test]
    fn test_lcr_from_rdi() {
        let mut port = InPort::with_outputs([OutPortId::LCR, OutPortId::RDI0]);
        port.rdi_lcr = true;
        let plan = classify_simple(&port).unwrap();
        assert_eq!(plan.rdi_lcr, Some(1));
        assert!(plan.csid_paths.contains(&CsidPath::Rdi(1)));
        assert!(!plan.csid_paths.contains(&CsidPath::Ipp));
    }
}
