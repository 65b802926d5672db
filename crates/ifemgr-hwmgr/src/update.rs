//! Update preparation
//!
//! Turns an owner's configuration packet into per-instance update entries
//! for [`HwManager::config`]. Blob contents are opaque here; only their
//! target and kind matter.

use ifemgr_core::{ContextState, HwCmd, HwType, HwUpdateEntry, IspError, OutPortId, Result, Split, UpdateKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::manager::HwManager;

/// Whether a packet is the stream's initial configuration or a per-frame update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketOpcode {
    Init,
    #[default]
    Update,
}

impl PacketOpcode {
    /// Decode the opcode carried in the low byte of a packet header word
    pub fn from_header(word: u32) -> Result<Self> {
        match word & 0xff {
            0 => Ok(Self::Init),
            1 => Ok(Self::Update),
            op => Err(IspError::rejected(format!("unknown packet opcode {}", op))),
        }
    }
}

/// One configuration blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ConfigBlob {
    /// Register writes for every instance of a family, or one split of it
    Registers {
        hw_type: HwType,
        #[serde(default)]
        split: Option<Split>,
        payload: Vec<u32>,
    },
    Clock { hw_type: HwType, rate_hz: u64 },
    Bandwidth { ab: u64, ib: u64 },
    /// Scratch buffer for a front-end output
    Scratch { port: OutPortId, addr: u64 },
    Mup { mup: u32 },
    /// Active exposure count for multi-exposure sensors
    Exposures { count: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPacket {
    pub request_id: u64,
    #[serde(default)]
    pub opcode: PacketOpcode,
    pub blobs: Vec<ConfigBlob>,
}

pub(crate) fn split_u64(value: u64) -> [u32; 2] {
    [value as u32, (value >> 32) as u32]
}

pub(crate) fn join_u64(lo: u32, hi: u32) -> u64 {
    u64::from(lo) | (u64::from(hi) << 32)
}

/// Command an instance needs for a clock, bandwidth or scratch entry
pub(crate) fn resource_cmd(entry: &HwUpdateEntry) -> Result<HwCmd> {
    let malformed = || IspError::rejected(format!("malformed {:?} entry for {}", entry.kind, entry.hw));
    match (entry.kind, entry.payload.as_slice()) {
        (UpdateKind::Clock, [lo, hi]) => Ok(HwCmd::Clock {
            rate_hz: join_u64(*lo, *hi),
        }),
        (UpdateKind::Bandwidth, [ab_lo, ab_hi, ib_lo, ib_hi]) => Ok(HwCmd::Bandwidth {
            ab: join_u64(*ab_lo, *ab_hi),
            ib: join_u64(*ib_lo, *ib_hi),
        }),
        (UpdateKind::Scratch, [port, lo, hi]) => Ok(HwCmd::Scratch {
            port: OutPortId(*port),
            addr: join_u64(*lo, *hi),
        }),
        _ => Err(malformed()),
    }
}

impl HwManager {
    /// Build the update entries for one packet. Scratch, MUP and exposure
    /// blobs also update the context's bookkeeping.
    pub fn prepare_update(&self, index: usize, packet: &ConfigPacket) -> Result<Vec<HwUpdateEntry>> {
        let slot = self.slot(index)?;
        let mut guard = slot.ctx.lock();
        let ctx = &mut *guard;
        if ctx.state == ContextState::Free {
            return Err(IspError::invalid_state(index, ctx.state.to_string()));
        }
        if packet.opcode == PacketOpcode::Init && ctx.is_streaming() {
            return Err(IspError::rejected("init packet on a streaming context"));
        }

        let mut entries = Vec::new();
        for blob in &packet.blobs {
            match blob {
                ConfigBlob::Registers {
                    hw_type,
                    split,
                    payload,
                } => {
                    let targets: Vec<_> = ctx
                        .base
                        .iter()
                        .filter(|b| b.hw.hw_type == *hw_type && split.map_or(true, |s| s == b.split))
                        .collect();
                    if targets.is_empty() {
                        return Err(IspError::rejected(format!("context {} has no {} to configure", index, hw_type)));
                    }
                    entries.extend(targets.into_iter().map(|b| HwUpdateEntry {
                        hw: b.hw,
                        kind: UpdateKind::Registers,
                        payload: payload.clone(),
                    }));
                }
                ConfigBlob::Clock { hw_type, rate_hz } => {
                    entries.extend(ctx.base.iter().filter(|b| b.hw.hw_type == *hw_type).map(|b| {
                        HwUpdateEntry {
                            hw: b.hw,
                            kind: UpdateKind::Clock,
                            payload: split_u64(*rate_hz).to_vec(),
                        }
                    }));
                }
                ConfigBlob::Bandwidth { ab, ib } => {
                    let payload: Vec<u32> = split_u64(*ab).into_iter().chain(split_u64(*ib)).collect();
                    entries.extend(ctx.base.iter().filter(|b| b.hw.hw_type != HwType::Csid).map(|b| {
                        HwUpdateEntry {
                            hw: b.hw,
                            kind: UpdateKind::Bandwidth,
                            payload: payload.clone(),
                        }
                    }));
                }
                ConfigBlob::Scratch { port, addr } => {
                    let handle = ctx
                        .lists
                        .ife_out
                        .get(port)
                        .or_else(|| ctx.lists.sfe_out.get(port))
                        .copied()
                        .ok_or_else(|| IspError::rejected(format!("scratch for unacquired output {}", port)))?;
                    let hw = ctx
                        .node(handle)?
                        .left()
                        .map(|b| b.hw())
                        .ok_or_else(|| IspError::rejected(format!("output {} is unbound", port)))?;
                    let [lo, hi] = split_u64(*addr);
                    entries.push(HwUpdateEntry {
                        hw,
                        kind: UpdateKind::Scratch,
                        payload: vec![port.0, lo, hi],
                    });
                    ctx.scratch.insert(*port, *addr);
                    slot.route.write().scratch.insert(*port, *addr);
                }
                ConfigBlob::Mup { mup } => ctx.current_mup = *mup,
                ConfigBlob::Exposures { count: n } => {
                    if *n == 0 || *n > ctx.num_exposures {
                        return Err(IspError::rejected(format!(
                            "{} exposures requested, context supports {}",
                            n, ctx.num_exposures
                        )));
                    }
                    ctx.curr_num_exp = *n;
                }
            }
        }

        debug!(
            ctx = index,
            request_id = packet.request_id,
            opcode = ?packet.opcode,
            entries = entries.len(),
            "update prepared"
        );
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{manager, Recorder};
    use ifemgr_core::{AcquireRequest, HwId, InPort, SfeMode};
    use ifemgr_sim::{HwOp, SimPlatform};

    fn packet(blobs: Vec<ConfigBlob>) -> ConfigPacket {
        ConfigPacket {
            request_id: 1,
            opcode: PacketOpcode::Update,
            blobs,
        }
    }

    #[test]
    fn test_opcode_from_header() {
        assert_eq!(PacketOpcode::from_header(0x0100).unwrap(), PacketOpcode::Init);
        assert_eq!(PacketOpcode::from_header(0xab01).unwrap(), PacketOpcode::Update);
        assert!(PacketOpcode::from_header(7).is_err());
    }

    #[test]
    fn test_resource_cmd_round_trips_wide_values() {
        let entry = HwUpdateEntry {
            hw: HwId::ife(0),
            kind: UpdateKind::Bandwidth,
            payload: split_u64(5_000_000_000).into_iter().chain(split_u64(7)).collect(),
        };
        assert_eq!(
            resource_cmd(&entry).unwrap(),
            HwCmd::Bandwidth {
                ab: 5_000_000_000,
                ib: 7
            }
        );
        let bad = HwUpdateEntry {
            payload: vec![1],
            ..entry
        };
        assert!(resource_cmd(&bad).is_err());
    }

    #[test]
    fn test_entries_target_base_instances() {
        let (_sim, mgr) = manager(SimPlatform::builder().full(2).sfe(2));
        let mut port = InPort::with_outputs([OutPortId::FULL, OutPortId::SFE_RDI0]);
        port.sfe_mode = SfeMode::Shdr;
        let idx = mgr.acquire(&AcquireRequest::new(vec![port]), Recorder::new()).unwrap();

        let entries = mgr
            .prepare_update(
                idx,
                &packet(vec![
                    ConfigBlob::Registers {
                        hw_type: HwType::Ife,
                        split: None,
                        payload: vec![0x40, 1],
                    },
                    ConfigBlob::Bandwidth { ab: 100, ib: 200 },
                ]),
            )
            .unwrap();
        let regs: Vec<_> = entries.iter().filter(|e| e.kind == UpdateKind::Registers).collect();
        assert_eq!(regs.len(), 1);
        assert_eq!(regs[0].hw.hw_type, HwType::Ife);
        // IFE and SFE, never CSID
        let bw: Vec<_> = entries.iter().filter(|e| e.kind == UpdateKind::Bandwidth).collect();
        assert_eq!(bw.len(), 2);
        assert!(bw.iter().all(|e| e.hw.hw_type != HwType::Csid));
    }

    #[test]
    fn test_registers_for_missing_family_rejected() {
        let (_sim, mgr) = manager(SimPlatform::builder().full(1));
        let idx = mgr
            .acquire(&AcquireRequest::new(vec![InPort::with_outputs([OutPortId::FULL])]), Recorder::new())
            .unwrap();
        let err = mgr
            .prepare_update(
                idx,
                &packet(vec![ConfigBlob::Registers {
                    hw_type: HwType::Sfe,
                    split: None,
                    payload: vec![],
                }]),
            )
            .unwrap_err();
        assert!(matches!(err, IspError::Rejected { .. }));
    }

    #[test]
    fn test_scratch_recorded_and_cleared_on_stop() {
        let (sim, mgr) = manager(SimPlatform::builder().full(1));
        let idx = mgr
            .acquire(&AcquireRequest::new(vec![InPort::with_outputs([OutPortId::RDI0])]), Recorder::new())
            .unwrap();
        let entries = mgr
            .prepare_update(
                idx,
                &packet(vec![ConfigBlob::Scratch {
                    port: OutPortId::RDI0,
                    addr: 0x1_0000_2000,
                }]),
            )
            .unwrap();
        assert_eq!(entries[0].payload, vec![OutPortId::RDI0.0, 0x2000, 1]);
        mgr.config(idx, &entries, 1).unwrap();
        assert_eq!(sim.log.count(HwOp::Cmd("scratch")), 1);
        mgr.start(idx).unwrap();
        assert_eq!(
            mgr.slot(idx).unwrap().route.read().scratch.get(&OutPortId::RDI0),
            Some(&0x1_0000_2000)
        );

        mgr.stop(idx, ifemgr_core::StopMode::AtFrameBoundary).unwrap();
        assert!(mgr.slot(idx).unwrap().route.read().scratch.is_empty());
        assert!(mgr.slot(idx).unwrap().ctx.lock().scratch.is_empty());

        let err = mgr
            .prepare_update(
                idx,
                &packet(vec![ConfigBlob::Scratch {
                    port: OutPortId::FULL,
                    addr: 1,
                }]),
            )
            .unwrap_err();
        assert!(matches!(err, IspError::Rejected { .. }));
    }

    #[test]
    fn test_exposures_bounded_by_port() {
        let (_sim, mgr) = manager(SimPlatform::builder().full(2).sfe(2));
        let mut port = InPort::with_outputs([OutPortId::FULL, OutPortId::SFE_RDI0]);
        port.sfe_mode = SfeMode::Shdr;
        port.num_exposures = 2;
        let idx = mgr.acquire(&AcquireRequest::new(vec![port]), Recorder::new()).unwrap();

        mgr.prepare_update(idx, &packet(vec![ConfigBlob::Exposures { count: 2 }, ConfigBlob::Mup { mup: 3 }]))
            .unwrap();
        {
            let ctx = mgr.slot(idx).unwrap().ctx.lock();
            assert_eq!(ctx.curr_num_exp, 2);
            assert_eq!(ctx.current_mup, 3);
        }
        assert!(mgr.prepare_update(idx, &packet(vec![ConfigBlob::Exposures { count: 3 }])).is_err());
    }

    #[test]
    fn test_blob_json_shape() {
        let packet: ConfigPacket = serde_json::from_str(
            r#"{"request_id": 4, "blobs": [{"type": "clock", "hw_type": "ife", "rate_hz": 480000000}]}"#,
        )
        .unwrap();
        assert_eq!(packet.opcode, PacketOpcode::Update);
        assert_eq!(
            packet.blobs[0],
            ConfigBlob::Clock {
                hw_type: HwType::Ife,
                rate_hz: 480_000_000
            }
        );
    }
}
