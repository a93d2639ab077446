//! Simulated capture device.
//!
//! [`SimulatedCamera`] honours the same slot-ownership contract as real
//! hardware: it only ever delivers slots that were enqueued to it, and it writes
//! pixel data into a slot only during [`complete_transfer`](CaptureDevice::complete_transfer),
//! while the pool still records the slot as hardware-owned.
//!
//! Frame content comes from a [`SyntheticScene`]. A [`SimulationProbe`] shares
//! counters and failure-injection switches with tests after the camera has been
//! moved into a pump or worker thread.

use super::{
    clock::monotonic_now, CaptureDevice, DeviceClock, DeviceParameter, FrameFormat, PixelFormat,
    ReadySlot,
};
use crate::error::{CaptureError, CaptureResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Chroma value written into the U/V bytes of simulated YUYV frames.
const NEUTRAL_CHROMA: u8 = 128;

/// Slots a simulated camera grants when no limit is set.
const DEFAULT_SLOT_LIMIT: usize = 4;

// =============================================================================
// SyntheticScene
// =============================================================================

/// Rectangular bright feature rendered into a synthetic frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spot {
    /// Left column.
    pub x: u32,
    /// Top row.
    pub y: u32,
    /// Width in columns.
    pub width: u32,
    /// Height in rows.
    pub height: u32,
    /// Luma inside the spot.
    pub level: u8,
}

/// Scripted sequence of luma frames.
///
/// Each frame is `width * height` samples in row-major order. Shorter frames
/// are padded with zero.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    width: u32,
    height: u32,
    frames: Vec<Vec<u8>>,
    cursor: usize,
    looping: bool,
    limit: Option<usize>,
    produced: usize,
}

impl SyntheticScene {
    /// Play `frames` once, in order.
    #[must_use]
    pub fn from_frames(width: u32, height: u32, frames: Vec<Vec<u8>>) -> Self {
        Self {
            width,
            height,
            frames,
            cursor: 0,
            looping: false,
            limit: None,
            produced: 0,
        }
    }

    /// Endless frames of a single level.
    #[must_use]
    pub fn uniform(width: u32, height: u32, level: u8) -> Self {
        let frame = vec![level; width as usize * height as usize];
        Self::from_frames(width, height, vec![frame]).looping()
    }

    /// Endless frames showing `spots` on a flat background.
    #[must_use]
    pub fn spots(width: u32, height: u32, background: u8, spots: &[Spot]) -> Self {
        let frame = Self::render_spots(width, height, background, spots);
        Self::from_frames(width, height, vec![frame]).looping()
    }

    /// Render one luma frame with `spots` on a flat background. Spots are clipped.
    #[must_use]
    pub fn render_spots(width: u32, height: u32, background: u8, spots: &[Spot]) -> Vec<u8> {
        let mut frame = vec![background; width as usize * height as usize];
        for spot in spots {
            let x_end = spot.x.saturating_add(spot.width).min(width);
            let y_end = spot.y.saturating_add(spot.height).min(height);
            for y in spot.y..y_end {
                let row = y as usize * width as usize;
                for x in spot.x..x_end {
                    frame[row + x as usize] = spot.level;
                }
            }
        }
        frame
    }

    /// Restart from the first frame after the last one.
    #[must_use]
    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }

    /// Stop after `frames` frames in total.
    #[must_use]
    pub fn limit(mut self, frames: usize) -> Self {
        self.limit = Some(frames);
        self
    }

    /// True when no further frame will be produced.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        if self.frames.is_empty() {
            return true;
        }
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return true;
        }
        !self.looping && self.cursor >= self.frames.len()
    }

    fn next_frame(&mut self) -> Option<&[u8]> {
        if self.is_exhausted() {
            return None;
        }
        if self.cursor >= self.frames.len() {
            self.cursor = 0;
        }
        let index = self.cursor;
        self.cursor += 1;
        self.produced += 1;
        self.frames.get(index).map(Vec::as_slice)
    }
}

// =============================================================================
// SimulationProbe
// =============================================================================

/// Shared view into a [`SimulatedCamera`] for tests and diagnostics.
#[derive(Debug, Clone, Default)]
pub struct SimulationProbe {
    delivered: Arc<AtomicUsize>,
    fail_next_wait: Arc<AtomicBool>,
    fail_next_enqueue: Arc<AtomicBool>,
    parameters: Arc<Mutex<Vec<(DeviceParameter, i32)>>>,
}

impl SimulationProbe {
    /// Frames dequeued so far.
    #[must_use]
    pub fn frames_delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Make the next readiness wait fail with an I/O error.
    pub fn fail_next_wait(&self) {
        self.fail_next_wait.store(true, Ordering::SeqCst);
    }

    /// Make the next enqueue fail with an I/O error.
    pub fn fail_next_enqueue(&self) {
        self.fail_next_enqueue.store(true, Ordering::SeqCst);
    }

    /// Every parameter written to the device, oldest first.
    #[must_use]
    pub fn parameters(&self) -> Vec<(DeviceParameter, i32)> {
        self.parameters.lock().clone()
    }
}

// =============================================================================
// SimulatedCamera
// =============================================================================

/// Software frame grabber.
///
/// Readiness is immediate while the scene has frames left and a slot is
/// queued; once the scene is exhausted every wait reports a timeout without
/// sleeping. An optional frame interval paces delivery like a real sensor.
pub struct SimulatedCamera {
    name: String,
    format: FrameFormat,
    scene: SyntheticScene,
    clock: DeviceClock,
    slot_limit: usize,
    granted: usize,
    queued: VecDeque<usize>,
    streaming: bool,
    frame_interval: Option<Duration>,
    last_delivery: Option<Instant>,
    probe: SimulationProbe,
}

impl SimulatedCamera {
    /// Camera delivering `scene` in `format`, granting up to four slots.
    pub fn new(name: impl Into<String>, format: FrameFormat, scene: SyntheticScene) -> Self {
        Self {
            name: name.into(),
            format,
            scene,
            clock: DeviceClock::capture(),
            slot_limit: DEFAULT_SLOT_LIMIT,
            granted: 0,
            queued: VecDeque::new(),
            streaming: false,
            frame_interval: None,
            last_delivery: None,
            probe: SimulationProbe::default(),
        }
    }

    /// Grant at most `slots` buffers.
    #[must_use]
    pub fn with_slot_limit(mut self, slots: usize) -> Self {
        self.slot_limit = slots;
        self
    }

    /// Deliver at most one frame per `interval`.
    #[must_use]
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    /// Shared counters and failure switches.
    #[must_use]
    pub fn probe(&self) -> SimulationProbe {
        self.probe.clone()
    }

    fn injected(flag: &AtomicBool, what: &str) -> CaptureResult<()> {
        if flag.swap(false, Ordering::SeqCst) {
            return Err(CaptureError::Io(io::Error::other(format!(
                "injected {what} failure"
            ))));
        }
        Ok(())
    }
}

impl CaptureDevice for SimulatedCamera {
    type Region = Vec<u8>;

    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> FrameFormat {
        self.format
    }

    fn clock(&self) -> DeviceClock {
        self.clock
    }

    fn map_buffers(&mut self, requested: usize) -> CaptureResult<Vec<Self::Region>> {
        self.granted = requested.min(self.slot_limit);
        Ok((0..self.granted)
            .map(|_| vec![0u8; self.format.frame_bytes()])
            .collect())
    }

    fn enqueue(&mut self, index: usize) -> CaptureResult<()> {
        Self::injected(&self.probe.fail_next_enqueue, "enqueue")?;
        if index >= self.granted {
            return Err(CaptureError::SlotOutOfRange {
                index,
                count: self.granted,
            });
        }
        self.queued.push_back(index);
        Ok(())
    }

    fn stream_on(&mut self) -> CaptureResult<()> {
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> CaptureResult<()> {
        self.streaming = false;
        self.queued.clear();
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> CaptureResult<bool> {
        if !self.streaming {
            return Err(CaptureError::NotStreaming);
        }
        Self::injected(&self.probe.fail_next_wait, "readiness wait")?;
        if self.queued.is_empty() || self.scene.is_exhausted() {
            return Ok(false);
        }

        if let (Some(interval), Some(last)) = (self.frame_interval, self.last_delivery) {
            let due = last + interval;
            let now = Instant::now();
            if due > now {
                let remaining = due - now;
                if remaining > timeout {
                    std::thread::sleep(timeout);
                    return Ok(false);
                }
                std::thread::sleep(remaining);
            }
        }
        Ok(true)
    }

    fn dequeue(&mut self) -> CaptureResult<ReadySlot> {
        let index = self
            .queued
            .pop_front()
            .ok_or_else(|| CaptureError::Io(io::ErrorKind::WouldBlock.into()))?;
        self.last_delivery = Some(Instant::now());
        self.probe.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(ReadySlot {
            index,
            timestamp: monotonic_now(),
        })
    }

    fn complete_transfer(&mut self, index: usize, region: &mut Self::Region) {
        let format = self.format;
        let scene_width = self.scene.width;
        match self.scene.next_frame() {
            Some(luma) => {
                render(format, scene_width, luma, region);
                trace!(device = %self.name, slot = index, "Rendered synthetic frame");
            }
            None => region.fill(0),
        }
    }

    fn set_parameter(&mut self, parameter: DeviceParameter, value: i32) -> CaptureResult<()> {
        self.probe.parameters.lock().push((parameter, value));
        Ok(())
    }
}

/// Write luma samples into a device-layout buffer.
fn render(format: FrameFormat, scene_width: u32, luma: &[u8], region: &mut [u8]) {
    let stride = format.pixel_format.sample_stride();
    for y in 0..format.height as usize {
        let row_start = y * format.bytes_per_line;
        for x in 0..format.width as usize {
            let sample = if (x as u32) < scene_width {
                luma.get(y * scene_width as usize + x).copied().unwrap_or(0)
            } else {
                0
            };
            let offset = row_start + x * stride;
            if let Some(byte) = region.get_mut(offset) {
                *byte = sample;
            }
            if format.pixel_format == PixelFormat::Yuyv {
                if let Some(byte) = region.get_mut(offset + 1) {
                    *byte = NEUTRAL_CHROMA;
                }
            }
        }
    }
}
