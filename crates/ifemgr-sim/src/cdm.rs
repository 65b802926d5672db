//! Simulated command-DMA engine

use std::collections::BTreeMap;
use std::time::Duration;

use ifemgr_core::{CdmHandle, CdmService, HwError, HwUpdateEntry};
use parking_lot::Mutex;
use tracing::debug;

use crate::log::{CallLog, HwCall, HwOp};

#[derive(Debug, Default)]
struct Channel {
    ctx: usize,
    streaming: bool,
    last_submitted: u64,
    entries: usize,
}

#[derive(Debug, Default)]
struct CdmState {
    next_handle: u32,
    channels: BTreeMap<u32, Channel>,
    /// Completions never arrive while set
    stalled: bool,
    /// Engine reports itself hung
    hung: bool,
    resets: u32,
}

/// Command-DMA engine that applies batches immediately unless stalled
#[derive(Debug)]
pub struct SimCdm {
    log: CallLog,
    state: Mutex<CdmState>,
}

impl SimCdm {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            state: Mutex::new(CdmState::default()),
        }
    }

    /// Stop completing batches; `hung` decides what the hang probe reports
    pub fn stall(&self, hung: bool) {
        let mut state = self.state.lock();
        state.stalled = true;
        state.hung = hung;
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn is_streaming(&self, handle: CdmHandle) -> bool {
        self.state
            .lock()
            .channels
            .get(&handle.0)
            .is_some_and(|c| c.streaming)
    }

    pub fn reset_count(&self) -> u32 {
        self.state.lock().resets
    }

    fn record(&self, op: HwOp, ok: bool) {
        self.log.record(HwCall {
            hw: None,
            op,
            res: None,
            rsv_id: None,
            ok,
        });
    }

    fn with_channel<F>(&self, op: HwOp, handle: CdmHandle, f: F) -> Result<(), HwError>
    where
        F: FnOnce(&mut Channel),
    {
        let result = match self.state.lock().channels.get_mut(&handle.0) {
            Some(channel) => {
                f(channel);
                Ok(())
            }
            None => Err(HwError::invalid_state(format!("no cdm channel {}", handle.0))),
        };
        self.record(op, result.is_ok());
        result
    }
}

impl CdmService for SimCdm {
    fn acquire(&self, ctx: usize, num_bases: usize) -> Result<CdmHandle, HwError> {
        let handle = {
            let mut state = self.state.lock();
            let id = state.next_handle;
            state.next_handle += 1;
            state.channels.insert(
                id,
                Channel {
                    ctx,
                    ..Channel::default()
                },
            );
            CdmHandle(id)
        };
        debug!(ctx, num_bases, handle = handle.0, "cdm acquired");
        self.record(HwOp::CdmAcquire, true);
        Ok(handle)
    }

    fn submit(&self, handle: CdmHandle, request_id: u64, batch: &[HwUpdateEntry]) -> Result<(), HwError> {
        self.with_channel(HwOp::CdmSubmit, handle, |c| {
            c.last_submitted = request_id;
            c.entries += batch.len();
        })
    }

    fn wait(&self, handle: CdmHandle, request_id: u64, timeout: Duration) -> Result<(), HwError> {
        let state = self.state.lock();
        let channel = state
            .channels
            .get(&handle.0)
            .ok_or_else(|| HwError::invalid_state(format!("no cdm channel {}", handle.0)))?;
        if state.stalled || channel.last_submitted < request_id {
            debug!(ctx = channel.ctx, request_id, "cdm wait timed out");
            return Err(HwError::Timeout {
                duration_ms: timeout.as_millis() as u64,
            });
        }
        Ok(())
    }

    fn detect_hang(&self, _handle: CdmHandle) -> bool {
        self.state.lock().hung
    }

    fn reset(&self, _handle: CdmHandle) -> Result<(), HwError> {
        {
            let mut state = self.state.lock();
            state.stalled = false;
            state.hung = false;
            state.resets += 1;
        }
        self.record(HwOp::CdmReset, true);
        Ok(())
    }

    fn stream_on(&self, handle: CdmHandle) -> Result<(), HwError> {
        self.with_channel(HwOp::CdmStreamOn, handle, |c| c.streaming = true)
    }

    fn stream_off(&self, handle: CdmHandle) -> Result<(), HwError> {
        self.with_channel(HwOp::CdmStreamOff, handle, |c| c.streaming = false)
    }

    fn release(&self, handle: CdmHandle) -> Result<(), HwError> {
        let removed = self.state.lock().channels.remove(&handle.0).is_some();
        self.record(HwOp::CdmRelease, removed);
        if removed {
            Ok(())
        } else {
            Err(HwError::invalid_state(format!("no cdm channel {}", handle.0)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stalled_wait_times_out_until_reset() {
        let cdm = SimCdm::new(CallLog::new());
        let handle = cdm.acquire(0, 2).unwrap();
        cdm.submit(handle, 1, &[]).unwrap();
        assert!(cdm.wait(handle, 1, Duration::from_millis(10)).is_ok());

        cdm.stall(true);
        cdm.submit(handle, 2, &[]).unwrap();
        assert!(matches!(
            cdm.wait(handle, 2, Duration::from_millis(10)),
            Err(HwError::Timeout { duration_ms: 10 })
        ));
        assert!(cdm.detect_hang(handle));

        cdm.reset(handle).unwrap();
        assert!(cdm.wait(handle, 2, Duration::from_millis(10)).is_ok());
        assert_eq!(cdm.reset_count(), 1);
    }

    #[test]
    fn test_release_closes_channel() {
        let cdm = SimCdm::new(CallLog::new());
        let handle = cdm.acquire(3, 1).unwrap();
        cdm.stream_on(handle).unwrap();
        assert!(cdm.is_streaming(handle));
        cdm.release(handle).unwrap();
        assert_eq!(cdm.open_channels(), 0);
        assert!(cdm.release(handle).is_err());
    }
}
