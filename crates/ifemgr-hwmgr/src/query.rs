//! Generic query escape hatch

use ifemgr_core::{
    AcquireKind, BaseEntry, ContextState, CtxFlags, HwCmd, HwCmdResult, HwId, IspError, Result,
};
use serde::{Deserialize, Serialize};

use crate::context::{ContextSlot, IfeContext};
use crate::manager::HwManager;
use crate::stream_group::StreamGroupStatus;
use crate::update::PacketOpcode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "cmd")]
pub enum QueryCmd {
    ActiveContextCount,
    /// Decode the opcode of a raw packet header word
    PacketOpcode { header: u32 },
    AcquireKind,
    SofTimestamp,
    Flags,
    Base,
    HwIdxPair,
    StreamGroup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum QueryResult {
    ActiveContextCount(usize),
    PacketOpcode(PacketOpcode),
    AcquireKind(AcquireKind),
    SofTimestamp(u64),
    Flags(CtxFlags),
    Base(Vec<BaseEntry>),
    HwIdxPair { left: Option<HwId>, right: Option<HwId> },
    StreamGroup(Vec<StreamGroupStatus>),
}

impl HwManager {
    fn with_ctx<T>(&self, index: usize, f: impl FnOnce(&ContextSlot, &IfeContext) -> T) -> Result<T> {
        let slot = self.slot(index)?;
        let ctx = slot.ctx.lock();
        if ctx.state == ContextState::Free {
            return Err(IspError::invalid_state(index, ctx.state.to_string()));
        }
        Ok(f(slot, &ctx))
    }

    /// Answer a query about the manager or one context. Context-free
    /// queries ignore `index`.
    pub fn query(&self, index: usize, cmd: QueryCmd) -> Result<QueryResult> {
        match cmd {
            QueryCmd::ActiveContextCount => Ok(QueryResult::ActiveContextCount(self.active_context_count())),
            QueryCmd::PacketOpcode { header } => Ok(QueryResult::PacketOpcode(PacketOpcode::from_header(header)?)),
            QueryCmd::AcquireKind => self.with_ctx(index, |_, ctx| QueryResult::AcquireKind(ctx.kind)),
            QueryCmd::Flags => self.with_ctx(index, |_, ctx| QueryResult::Flags(ctx.flags)),
            QueryCmd::Base => self.with_ctx(index, |_, ctx| QueryResult::Base(ctx.base.clone())),
            QueryCmd::HwIdxPair => self.with_ctx(index, |_, ctx| {
                let (left, right) = ctx.hw_idx_pair();
                QueryResult::HwIdxPair { left, right }
            }),
            QueryCmd::SofTimestamp => self.with_ctx(index, |slot, ctx| {
                // Hardware timestamp of the master IFE, else the last SOF routed
                let hw_ts = ctx.hw_idx_pair().0.and_then(|id| {
                    match self.registry.hw(id).ok()?.process_cmd(HwCmd::GetTimestamp) {
                        Ok(HwCmdResult::Timestamp { sof_ns }) => Some(sof_ns),
                        _ => None,
                    }
                });
                QueryResult::SofTimestamp(hw_ts.unwrap_or_else(|| slot.counters.lock().last_sof_ns))
            }),
            QueryCmd::StreamGroup => {
                let groups: Vec<usize> = self.with_ctx(index, |_, ctx| ctx.groups.iter().map(|l| l.group).collect())?;
                Ok(QueryResult::StreamGroup(
                    groups.into_iter().filter_map(|g| self.stream_group(g)).collect(),
                ))
            }
        }
    }
}
