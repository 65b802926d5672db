//! Hardware instance identifiers and capability descriptors

use serde::{Deserialize, Serialize};

/// Hardware block family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwType {
    /// Channel splitter/synchronizer
    Csid,
    /// Front-end stage (staggered HDR, line buffering)
    Sfe,
    /// Main per-pixel engine
    Ife,
}

impl HwType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csid => "csid",
            Self::Sfe => "sfe",
            Self::Ife => "ife",
        }
    }

    /// All families, in registry enumeration order
    pub const ALL: [HwType; 3] = [HwType::Csid, HwType::Sfe, HwType::Ife];
}

impl std::fmt::Display for HwType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identifier for one physical instance: family plus hardware index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HwId {
    pub hw_type: HwType,
    pub index: u32,
}

impl HwId {
    pub const fn new(hw_type: HwType, index: u32) -> Self {
        Self { hw_type, index }
    }

    pub const fn csid(index: u32) -> Self {
        Self::new(HwType::Csid, index)
    }

    pub const fn ife(index: u32) -> Self {
        Self::new(HwType::Ife, index)
    }

    pub const fn sfe(index: u32) -> Self {
        Self::new(HwType::Sfe, index)
    }
}

impl std::fmt::Display for HwId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.hw_type, self.index)
    }
}

/// Left/right half of a dual-ISP resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Left,
    Right,
}

impl Split {
    pub const BOTH: [Split; 2] = [Split::Left, Split::Right];

    pub const fn index(self) -> usize {
        match self {
            Self::Left => 0,
            Self::Right => 1,
        }
    }

    /// The left split is the master of a dual pair
    pub const fn is_master(self) -> bool {
        matches!(self, Self::Left)
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Left => f.write_str("left"),
            Self::Right => f.write_str("right"),
        }
    }
}

/// Dual-ISP synchronization role programmed at reserve time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    None,
    Master,
    Slave,
}

/// Bus (write-master) capabilities of an IFE or SFE instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BusCaps {
    /// Hardware reports the last consumed buffer address on buf-done
    pub support_consumed_addr: bool,
    /// Maximum FIFO depth
    pub fifo_depth: u32,
}

/// Capabilities reported by `get_hw_caps` for one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwCaps {
    pub id: HwId,
    /// Lite instance (RDI-only CSID, RDI/stats-only IFE)
    pub is_lite: bool,
    /// Instance is controlled by a remote processor
    pub is_virtual: bool,
    /// Can act as one half of a dual-ISP pair
    pub supports_dual: bool,
    /// Size of the family's output-port namespace (IFE/SFE)
    pub max_out_res: u32,
    /// Number of RDI paths (CSID) or RDI mux inputs (IFE/SFE)
    pub num_rdi: u8,
    /// Number of pixel paths (IPP on CSID, CAMIF on IFE, PIX on SFE)
    pub num_pix: u8,
    /// Number of secondary pixel paths (PPP on CSID, PDLIB on IFE)
    pub num_ppp: u8,
    /// Downstream instance indices this CSID can feed (IFE and SFE share the index space)
    #[serde(default)]
    pub links: Vec<u32>,
    /// Bus features (IFE/SFE only)
    #[serde(default)]
    pub bus: BusCaps,
    /// CSID supports a global (all paths) reset
    #[serde(default)]
    pub global_reset: bool,
}

impl HwCaps {
    /// Capabilities for a full instance of the given family
    pub fn full(id: HwId) -> Self {
        let (num_rdi, num_pix, num_ppp, max_out_res) = match id.hw_type {
            HwType::Csid => (5, 1, 1, 0),
            HwType::Sfe => (5, 1, 0, 0x20),
            HwType::Ife => (4, 1, 1, 0x30),
        };
        Self {
            id,
            is_lite: false,
            is_virtual: false,
            supports_dual: true,
            max_out_res,
            num_rdi,
            num_pix,
            num_ppp,
            links: vec![id.index],
            bus: BusCaps {
                support_consumed_addr: id.hw_type != HwType::Csid,
                fifo_depth: if id.hw_type == HwType::Csid { 0 } else { 64 },
            },
            global_reset: id.hw_type == HwType::Csid,
        }
    }

    /// Capabilities for a lite instance (no pixel paths, no dual)
    pub fn lite(id: HwId) -> Self {
        Self {
            is_lite: true,
            supports_dual: false,
            num_pix: 0,
            num_ppp: 0,
            num_rdi: 4,
            max_out_res: if id.hw_type == HwType::Csid { 0 } else { 0x10 },
            ..Self::full(id)
        }
    }

    /// Mark these capabilities as belonging to a remotely controlled instance
    pub fn into_virtual(mut self) -> Self {
        self.is_virtual = true;
        self
    }

    pub fn has_pixel_path(&self) -> bool {
        self.num_pix > 0
    }

    /// Whether this CSID can feed the downstream instance with the given index
    pub fn feeds(&self, index: u32) -> bool {
        self.links.contains(&index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hw_id_display() {
        assert_eq!(HwId::csid(2).to_string(), "csid2");
        assert_eq!(HwId::ife(0).to_string(), "ife0");
        assert_eq!(HwId::sfe(1).to_string(), "sfe1");
    }

    #[test]
    fn test_lite_caps_have_no_pixel_path() {
        let caps = HwCaps::lite(HwId::ife(4));
        assert!(caps.is_lite);
        assert!(!caps.has_pixel_path());
        assert!(!caps.supports_dual);
        assert!(caps.feeds(4));
    }

    #[test]
    fn test_split_master() {
        assert!(Split::Left.is_master());
        assert!(!Split::Right.is_master());
        assert_eq!(Split::Right.index(), 1);
    }
}
