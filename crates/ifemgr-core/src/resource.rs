//! Resource identifiers: CSID paths, mux inputs and the output-port table
//!
//! Output ports are identified by the numeric ids clients use in acquire and
//! configuration requests. Every known id carries a family (IFE or SFE bus)
//! and a path category that decides which mux input it must hang from.

use serde::{Deserialize, Serialize};

use crate::hw::HwType;

/// Number of RDI paths a full CSID exposes
pub const CSID_MAX_RDI: u8 = 5;

/// First IFE output port id
pub const IFE_OUT_BASE: u32 = 0x3000;
/// Last id of the IFE output namespace
pub const IFE_OUT_MAX: u32 = 0x30FF;
/// First SFE output port id
pub const SFE_OUT_BASE: u32 = 0x6000;
/// Last id of the SFE output namespace
pub const SFE_OUT_MAX: u32 = 0x60FF;

const IFE_OUT_RDI0: u32 = 0x3006;

/// CSID output path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CsidPath {
    Ipp,
    Ppp,
    Rdi(u8),
}

impl CsidPath {
    pub fn is_rdi(&self) -> bool {
        matches!(self, Self::Rdi(_))
    }
}

impl std::fmt::Display for CsidPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ipp => f.write_str("IPP"),
            Self::Ppp => f.write_str("PPP"),
            Self::Rdi(n) => write!(f, "RDI{}", n),
        }
    }
}

/// IFE mux input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IfeSrc {
    Camif,
    Pdlib,
    Lcr,
    Rdi(u8),
}

impl std::fmt::Display for IfeSrc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Camif => f.write_str("CAMIF"),
            Self::Pdlib => f.write_str("PDLIB"),
            Self::Lcr => f.write_str("LCR"),
            Self::Rdi(n) => write!(f, "RDI{}", n),
        }
    }
}

/// SFE source path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SfeSrc {
    Pix,
    Rdi(u8),
}

impl std::fmt::Display for SfeSrc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pix => f.write_str("PIX"),
            Self::Rdi(n) => write!(f, "RDI{}", n),
        }
    }
}

/// The logical resource a graph node stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRes {
    Csid(CsidPath),
    SfeSrc(SfeSrc),
    IfeSrc(IfeSrc),
    /// Fetch-engine read path (hosted on an IFE, or on an SFE for SFE contexts)
    BusRead,
    IfeOut(OutPortId),
    SfeOut(OutPortId),
}

impl NodeRes {
    /// Family that hosts this resource, where it is fixed by the resource kind
    pub fn hw_type(&self) -> Option<HwType> {
        match self {
            Self::Csid(_) => Some(HwType::Csid),
            Self::SfeSrc(_) | Self::SfeOut(_) => Some(HwType::Sfe),
            Self::IfeSrc(_) | Self::IfeOut(_) => Some(HwType::Ife),
            Self::BusRead => None,
        }
    }

    pub fn out_port(&self) -> Option<OutPortId> {
        match self {
            Self::IfeOut(id) | Self::SfeOut(id) => Some(*id),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeRes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Csid(p) => write!(f, "csid:{}", p),
            Self::SfeSrc(s) => write!(f, "sfe_src:{}", s),
            Self::IfeSrc(s) => write!(f, "ife_src:{}", s),
            Self::BusRead => f.write_str("bus_rd"),
            Self::IfeOut(id) => write!(f, "ife_out:{}", id),
            Self::SfeOut(id) => write!(f, "sfe_out:{}", id),
        }
    }
}

/// Output bus family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutFamily {
    Ife,
    Sfe,
}

/// Pixel path category an output belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathCategory {
    Ipp,
    Ppp,
    Lcr,
    Rdi(u8),
}

/// Client-visible output port id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutPortId(pub u32);

impl OutPortId {
    pub const FULL: OutPortId = OutPortId(0x3000);
    pub const DS4: OutPortId = OutPortId(0x3001);
    pub const DS16: OutPortId = OutPortId(0x3002);
    pub const RAW_DUMP: OutPortId = OutPortId(0x3003);
    pub const FD: OutPortId = OutPortId(0x3004);
    pub const PDAF: OutPortId = OutPortId(0x3005);
    pub const RDI0: OutPortId = OutPortId(IFE_OUT_RDI0);
    pub const RDI1: OutPortId = OutPortId(IFE_OUT_RDI0 + 1);
    pub const RDI2: OutPortId = OutPortId(IFE_OUT_RDI0 + 2);
    pub const RDI3: OutPortId = OutPortId(IFE_OUT_RDI0 + 3);
    pub const STATS_HDR_BE: OutPortId = OutPortId(0x300A);
    pub const STATS_AWB_BG: OutPortId = OutPortId(0x300E);
    pub const TWO_PD: OutPortId = OutPortId(0x3016);
    pub const LCR: OutPortId = OutPortId(0x3017);
    pub const SFE_RDI0: OutPortId = OutPortId(SFE_OUT_BASE);
    pub const SFE_RDI1: OutPortId = OutPortId(SFE_OUT_BASE + 1);
    pub const SFE_RDI2: OutPortId = OutPortId(SFE_OUT_BASE + 2);
    pub const SFE_RAW_DUMP: OutPortId = OutPortId(0x6005);
    pub const SFE_BE_0: OutPortId = OutPortId(0x6006);

    /// IFE RDI output for the given RDI index
    pub const fn ife_rdi(n: u8) -> Self {
        Self(IFE_OUT_RDI0 + n as u32)
    }

    /// SFE RDI output for the given RDI index
    pub const fn sfe_rdi(n: u8) -> Self {
        Self(SFE_OUT_BASE + n as u32)
    }

    /// Family by id range; `None` outside both namespaces
    pub fn family(&self) -> Option<OutFamily> {
        match self.0 {
            IFE_OUT_BASE..=IFE_OUT_MAX => Some(OutFamily::Ife),
            SFE_OUT_BASE..=SFE_OUT_MAX => Some(OutFamily::Sfe),
            _ => None,
        }
    }

    /// Offset inside the family namespace
    pub fn namespace_index(&self) -> u32 {
        self.0 & 0xFF
    }

    /// Table entry for this id, if the id is known
    pub fn info(&self) -> Option<&'static OutPortInfo> {
        OUT_PORT_TABLE.iter().find(|p| p.id == *self)
    }

    /// RDI index for RDI outputs of either family
    pub fn rdi_index(&self) -> Option<u8> {
        match self.info()?.category {
            PathCategory::Rdi(n) => Some(n),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.info().map(|p| p.name).unwrap_or("UNKNOWN")
    }
}

impl std::fmt::Display for OutPortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}({})", self.0, self.name())
    }
}

/// One row of the output-port table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutPortInfo {
    pub id: OutPortId,
    pub name: &'static str,
    pub family: OutFamily,
    pub category: PathCategory,
}

const fn ife(id: u32, name: &'static str, category: PathCategory) -> OutPortInfo {
    OutPortInfo {
        id: OutPortId(id),
        name,
        family: OutFamily::Ife,
        category,
    }
}

const fn sfe(id: u32, name: &'static str, category: PathCategory) -> OutPortInfo {
    OutPortInfo {
        id: OutPortId(id),
        name,
        family: OutFamily::Sfe,
        category,
    }
}

/// Every output port the manager knows how to bind
pub static OUT_PORT_TABLE: &[OutPortInfo] = &[
    ife(0x3000, "FULL", PathCategory::Ipp),
    ife(0x3001, "DS4", PathCategory::Ipp),
    ife(0x3002, "DS16", PathCategory::Ipp),
    ife(0x3003, "RAW_DUMP", PathCategory::Ipp),
    ife(0x3004, "FD", PathCategory::Ipp),
    ife(0x3005, "PDAF", PathCategory::Ppp),
    ife(0x3006, "RDI_0", PathCategory::Rdi(0)),
    ife(0x3007, "RDI_1", PathCategory::Rdi(1)),
    ife(0x3008, "RDI_2", PathCategory::Rdi(2)),
    ife(0x3009, "RDI_3", PathCategory::Rdi(3)),
    ife(0x300A, "STATS_HDR_BE", PathCategory::Ipp),
    ife(0x300B, "STATS_HDR_BHIST", PathCategory::Ipp),
    ife(0x300C, "STATS_TL_BG", PathCategory::Ipp),
    ife(0x300D, "STATS_BF", PathCategory::Ipp),
    ife(0x300E, "STATS_AWB_BG", PathCategory::Ipp),
    ife(0x300F, "STATS_BHIST", PathCategory::Ipp),
    ife(0x3010, "STATS_RS", PathCategory::Ipp),
    ife(0x3011, "STATS_CS", PathCategory::Ipp),
    ife(0x3012, "STATS_IHIST", PathCategory::Ipp),
    ife(0x3013, "FULL_DISP", PathCategory::Ipp),
    ife(0x3014, "DS4_DISP", PathCategory::Ipp),
    ife(0x3015, "DS16_DISP", PathCategory::Ipp),
    ife(0x3016, "2PD", PathCategory::Ppp),
    ife(0x3017, "LCR", PathCategory::Lcr),
    sfe(0x6000, "SFE_RDI0", PathCategory::Rdi(0)),
    sfe(0x6001, "SFE_RDI1", PathCategory::Rdi(1)),
    sfe(0x6002, "SFE_RDI2", PathCategory::Rdi(2)),
    sfe(0x6003, "SFE_RDI3", PathCategory::Rdi(3)),
    sfe(0x6004, "SFE_RDI4", PathCategory::Rdi(4)),
    sfe(0x6005, "SFE_RAW_DUMP", PathCategory::Ipp),
    sfe(0x6006, "SFE_BE_0", PathCategory::Ipp),
    sfe(0x6007, "SFE_BHIST_0", PathCategory::Ipp),
    sfe(0x6008, "SFE_BE_1", PathCategory::Ipp),
    sfe(0x6009, "SFE_BHIST_1", PathCategory::Ipp),
    sfe(0x600A, "SFE_BE_2", PathCategory::Ipp),
    sfe(0x600B, "SFE_BHIST_2", PathCategory::Ipp),
];
