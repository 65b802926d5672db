//! Simulated platform: a set of instances plus one command-DMA engine

use std::sync::Arc;

use ifemgr_core::{CdmService, HwCaps, HwId, HwType, IspHw, Platform};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::cdm::SimCdm;
use crate::hw::SimHw;
use crate::log::CallLog;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error("CSID {csid} links to missing IFE/SFE index {target}")]
    InvalidLink { csid: u32, target: u32 },
    #[error("No CSID with index {0}")]
    UnknownCsid(u32),
}

/// Extra CSID to downstream connectivity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub csid: u32,
    pub targets: Vec<u32>,
}

/// Platform shape, loadable from TOML
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimPlatformConfig {
    /// Full CSID/IFE pairs
    #[serde(default = "default_num_full")]
    pub num_full: u32,
    /// Lite CSID/IFE pairs, indexed after the full ones
    #[serde(default)]
    pub num_lite: u32,
    /// SFE instances, sharing indices with the first full IFEs
    #[serde(default)]
    pub num_sfe: u32,
    /// Remote-controlled CSID/IFE pairs, indexed last
    #[serde(default)]
    pub num_virtual: u32,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

fn default_num_full() -> u32 {
    2
}

impl Default for SimPlatformConfig {
    fn default() -> Self {
        Self {
            num_full: default_num_full(),
            num_lite: 0,
            num_sfe: 0,
            num_virtual: 0,
            links: Vec::new(),
        }
    }
}

/// Builder for [`SimPlatform`]
#[derive(Debug, Clone, Default)]
pub struct SimPlatformBuilder {
    config: SimPlatformConfig,
}

impl SimPlatformBuilder {
    pub fn full(mut self, n: u32) -> Self {
        self.config.num_full = n;
        self
    }

    pub fn lite(mut self, n: u32) -> Self {
        self.config.num_lite = n;
        self
    }

    pub fn sfe(mut self, n: u32) -> Self {
        self.config.num_sfe = n;
        self
    }

    pub fn virtual_pairs(mut self, n: u32) -> Self {
        self.config.num_virtual = n;
        self
    }

    /// Let `csid` also feed the given IFE/SFE indices
    pub fn link(mut self, csid: u32, targets: impl IntoIterator<Item = u32>) -> Self {
        self.config.links.push(LinkConfig {
            csid,
            targets: targets.into_iter().collect(),
        });
        self
    }

    pub fn build(self) -> Result<SimPlatform, SimError> {
        SimPlatform::from_config(&self.config)
    }
}

/// All simulated hardware plus the shared call log
#[derive(Debug, Clone)]
pub struct SimPlatform {
    pub log: CallLog,
    pub cdm: Arc<SimCdm>,
    instances: Vec<Arc<SimHw>>,
}

impl SimPlatform {
    pub fn builder() -> SimPlatformBuilder {
        SimPlatformBuilder {
            config: SimPlatformConfig {
                num_full: 0,
                ..SimPlatformConfig::default()
            },
        }
    }

    pub fn from_config(config: &SimPlatformConfig) -> Result<Self, SimError> {
        let log = CallLog::new();
        let mut csids = Vec::new();
        let mut downstream = Vec::new();

        let lite_base = config.num_full;
        let virtual_base = lite_base + config.num_lite;
        let total = virtual_base + config.num_virtual;

        for index in 0..total {
            let (csid, ife) = if index < lite_base {
                (HwCaps::full(HwId::csid(index)), HwCaps::full(HwId::ife(index)))
            } else if index < virtual_base {
                (HwCaps::lite(HwId::csid(index)), HwCaps::lite(HwId::ife(index)))
            } else {
                (
                    HwCaps::full(HwId::csid(index)).into_virtual(),
                    HwCaps::full(HwId::ife(index)).into_virtual(),
                )
            };
            csids.push(csid);
            downstream.push(ife);
        }
        for index in 0..config.num_sfe.min(config.num_full) {
            downstream.push(HwCaps::full(HwId::sfe(index)));
        }

        for link in &config.links {
            let csid = csids
                .iter_mut()
                .find(|c| c.id.index == link.csid)
                .ok_or(SimError::UnknownCsid(link.csid))?;
            for &target in &link.targets {
                if target >= total {
                    return Err(SimError::InvalidLink {
                        csid: link.csid,
                        target,
                    });
                }
                if !csid.links.contains(&target) {
                    csid.links.push(target);
                }
            }
        }

        let instances: Vec<Arc<SimHw>> = csids
            .into_iter()
            .chain(downstream)
            .map(|caps| Arc::new(SimHw::new(caps, log.clone())))
            .collect();

        info!(
            full = config.num_full,
            lite = config.num_lite,
            sfe = config.num_sfe,
            remote = config.num_virtual,
            "simulated platform built"
        );

        Ok(Self {
            cdm: Arc::new(SimCdm::new(log.clone())),
            log,
            instances,
        })
    }

    /// Platform handle for the manager
    pub fn platform(&self) -> Platform {
        Platform {
            instances: self
                .instances
                .iter()
                .map(|hw| hw.clone() as Arc<dyn IspHw>)
                .collect(),
            cdm: self.cdm.clone() as Arc<dyn CdmService>,
        }
    }

    pub fn hw(&self, id: HwId) -> Option<&Arc<SimHw>> {
        self.instances.iter().find(|hw| hw.id() == id)
    }

    pub fn instances(&self) -> &[Arc<SimHw>] {
        &self.instances
    }

    /// Instances of one family
    pub fn of_type(&self, hw_type: HwType) -> impl Iterator<Item = &Arc<SimHw>> + '_ {
        self.instances.iter().filter(move |hw| hw.id().hw_type == hw_type)
    }
}
