//! Frame pump: pull-style access to device frames.
//!
//! The pump owns a [`CaptureDevice`] and the [`BufferSlotPool`] over its
//! buffers. Each [`acquire_frame`](FramePump::acquire_frame) waits for the
//! hardware, moves the ready slot to the consumer and returns a [`FrameGuard`].
//! The guard hands the slot back to the hardware exactly once: explicitly via
//! [`FrameGuard::release`], or implicitly when it is dropped (early returns and
//! `?` included).
//!
//! Because the guard mutably borrows the pump, at most one frame is lent out at
//! a time and the pump cannot be used from two places at once.

use super::{
    BufferSlotPool, CaptureDevice, DeviceClock, DeviceParameter, Frame, FrameFormat, SlotState,
};
use crate::error::{CaptureError, CaptureResult};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default per-poll timeout used when discarding backlog.
pub const DEFAULT_DRAIN_POLL: Duration = Duration::from_millis(4);

/// Upper bound on frames discarded by a single drain.
pub const DEFAULT_DRAIN_MAX_FRAMES: usize = 64;

/// Limits for [`FramePump::drain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainBudget {
    /// How long each poll waits for another stale frame.
    pub poll_timeout: Duration,
    /// Stop after discarding this many frames even if more are ready.
    pub max_frames: usize,
}

impl Default for DrainBudget {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_DRAIN_POLL,
            max_frames: DEFAULT_DRAIN_MAX_FRAMES,
        }
    }
}

/// Owns a capture device and lends its buffers out one frame at a time.
pub struct FramePump<D: CaptureDevice> {
    device: D,
    pool: BufferSlotPool<D::Region>,
    format: FrameFormat,
    clock: DeviceClock,
    streaming: bool,
}

impl<D: CaptureDevice> FramePump<D> {
    /// Map `requested_slots` buffers on `device` and build the pump.
    ///
    /// Fails with [`CaptureError::InsufficientBuffers`] if the device grants
    /// fewer than two slots.
    pub fn open(mut device: D, requested_slots: usize) -> CaptureResult<Self> {
        let regions = device.map_buffers(requested_slots)?;
        if regions.len() < 2 {
            return Err(CaptureError::InsufficientBuffers {
                granted: regions.len(),
            });
        }
        let format = device.format();
        let clock = device.clock();

        info!(
            device = device.name(),
            slots = regions.len(),
            width = format.width,
            height = format.height,
            pixel_format = format.pixel_format.as_str(),
            "Opened frame pump"
        );

        Ok(Self {
            device,
            pool: BufferSlotPool::new(regions),
            format,
            clock,
            streaming: false,
        })
    }

    /// Queue every free slot to the hardware and start streaming.
    pub fn start(&mut self) -> CaptureResult<()> {
        if self.streaming {
            return Ok(());
        }
        self.queue_free_slots()?;
        self.device.stream_on()?;
        self.streaming = true;
        debug!(device = self.device.name(), "Streaming started");
        Ok(())
    }

    /// Stop streaming. The hardware drops its queue, so every slot becomes `Free`.
    pub fn stop(&mut self) -> CaptureResult<()> {
        if !self.streaming {
            return Ok(());
        }
        self.streaming = false;
        self.pool.reset();
        self.device.stream_off()?;
        debug!(device = self.device.name(), "Streaming stopped");
        Ok(())
    }

    /// True between [`start`](Self::start) and [`stop`](Self::stop).
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Negotiated frame format.
    #[must_use]
    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Device name for logging.
    #[must_use]
    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Ownership ledger, for diagnostics.
    #[must_use]
    pub fn pool(&self) -> &BufferSlotPool<D::Region> {
        &self.pool
    }

    /// Pass a control value through to the device.
    pub fn set_parameter(&mut self, parameter: DeviceParameter, value: i32) -> CaptureResult<()> {
        self.device.set_parameter(parameter, value)
    }

    /// Wait up to `timeout` for the next frame.
    ///
    /// Returns `Ok(None)` on timeout. An error means the readiness wait or the
    /// dequeue itself failed, or the hardware signalled a slot it does not own;
    /// callers treat that as a capture-loop error.
    pub fn acquire_frame(&mut self, timeout: Duration) -> CaptureResult<Option<FrameGuard<'_, D>>> {
        if !self.streaming {
            return Err(CaptureError::NotStreaming);
        }
        if self.pool.count_in(SlotState::Free) > 0 {
            self.queue_free_slots()?;
        }
        if !self.device.wait_ready(timeout)? {
            return Ok(None);
        }

        let ready = self.device.dequeue()?;
        let region = self.pool.hardware_region_mut(ready.index)?;
        self.device.complete_transfer(ready.index, region);
        self.pool.take(ready.index)?;

        let timestamp_us = self.clock.to_wall_us(ready.timestamp);
        Ok(Some(FrameGuard {
            pump: self,
            index: ready.index,
            timestamp_us,
            released: false,
        }))
    }

    /// Return a frame to the hardware, surfacing any enqueue error.
    pub fn release_frame(frame: FrameGuard<'_, D>) -> CaptureResult<()> {
        frame.release()
    }

    /// Discard stale frames until a poll comes back empty.
    ///
    /// Returns how many frames were dropped.
    pub fn drain(&mut self, budget: DrainBudget) -> CaptureResult<usize> {
        let mut drained = 0;
        while drained < budget.max_frames {
            match self.acquire_frame(budget.poll_timeout)? {
                Some(frame) => {
                    frame.release()?;
                    drained += 1;
                }
                None => break,
            }
        }
        Ok(drained)
    }

    /// Hand every `Free` slot to the hardware.
    fn queue_free_slots(&mut self) -> CaptureResult<()> {
        for index in self.pool.free_indices() {
            self.device.enqueue(index)?;
            self.pool.mark_queued(index)?;
        }
        Ok(())
    }

    /// Return a consumer slot to the hardware. If the device refuses it the
    /// slot is left `Free` and queued again by the next acquisition.
    fn requeue(&mut self, index: usize) -> CaptureResult<()> {
        match self.pool.state(index)? {
            SlotState::OwnedByConsumer => {}
            state => return Err(CaptureError::SlotNotOwned { index, state }),
        }
        if let Err(e) = self.device.enqueue(index) {
            self.pool.abandon(index)?;
            warn!(device = self.device.name(), slot = index, error = %e, "Enqueue failed, slot parked as free");
            return Err(e);
        }
        self.pool.give_back(index)
    }
}

impl<D: CaptureDevice> Drop for FramePump<D> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(device = self.device.name(), error = %e, "Failed to stop streaming on drop");
        }
    }
}

/// A frame lent out by the pump.
///
/// Read it with [`frame`](Self::frame). The slot goes back to the hardware when
/// the guard is released or dropped.
pub struct FrameGuard<'p, D: CaptureDevice> {
    pump: &'p mut FramePump<D>,
    index: usize,
    timestamp_us: i64,
    released: bool,
}

impl<'p, D: CaptureDevice> FrameGuard<'p, D> {
    /// Borrowed view over the slot memory.
    #[must_use]
    pub fn frame(&self) -> Frame<'_> {
        let data = self.pump.pool.region(self.index).unwrap_or_default();
        Frame::from_slot(data, self.pump.format, self.timestamp_us, self.index)
    }

    /// Slot backing this frame.
    #[must_use]
    pub fn slot_index(&self) -> usize {
        self.index
    }

    /// Wall-clock capture time in microseconds.
    #[must_use]
    pub fn timestamp_us(&self) -> i64 {
        self.timestamp_us
    }

    /// Hand the slot back to the hardware.
    pub fn release(mut self) -> CaptureResult<()> {
        self.released = true;
        self.pump.requeue(self.index)
    }
}

impl<D: CaptureDevice> Drop for FrameGuard<'_, D> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.pump.requeue(self.index) {
            error!(slot = self.index, error = %e, "Failed to return frame slot to hardware");
        }
    }
}
