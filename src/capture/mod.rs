//! Frame capture pipeline.
//!
//! The pipeline is split along the hardware boundary:
//!
//! - [`CaptureDevice`]: the narrow ready/dequeue/enqueue contract a frame grabber
//!   has to provide. Implemented by [`SimulatedCamera`] and, with the
//!   `v4l2_hardware` feature, by `V4l2Camera`.
//! - [`BufferSlotPool`]: the ownership ledger for the device's frame buffers.
//! - [`FramePump`]: pulls ready slots from the device, lends them to the consumer
//!   as a [`Frame`] and returns them to the hardware afterwards.
//!
//! # Data Flow
//!
//! ```text
//! device --[ready slot]--> FramePump --[FrameGuard / Frame]--> consumer
//!    ^                                                      |
//!    +-------------------- enqueue on release --------------+
//! ```
//!
//! No pixel data is copied on this path; the consumer reads the slot memory in
//! place for as long as it holds the guard.

pub mod clock;
pub mod frame;
pub mod mock;
pub mod pump;
pub mod slot_pool;
#[cfg(all(feature = "v4l2_hardware", target_os = "linux"))]
pub mod v4l2;

pub use clock::DeviceClock;
pub use frame::Frame;
pub use mock::{SimulatedCamera, SimulationProbe, Spot, SyntheticScene};
pub use pump::{DrainBudget, FrameGuard, FramePump};
pub use slot_pool::{BufferSlotPool, SlotState};
#[cfg(all(feature = "v4l2_hardware", target_os = "linux"))]
pub use v4l2::V4l2Camera;

use crate::error::{CaptureError, CaptureResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pixel layout of a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed 4:2:2, luma at every even byte.
    Yuyv,
    /// 8-bit monochrome.
    Grey,
}

impl PixelFormat {
    /// Bytes between the luma samples of two neighbouring columns.
    #[must_use]
    pub fn sample_stride(self) -> usize {
        match self {
            PixelFormat::Yuyv => 2,
            PixelFormat::Grey => 1,
        }
    }

    /// V4L2 fourcc spelling, for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Grey => "GREY",
        }
    }
}

/// Negotiated geometry of every frame a device delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    /// Width in samples.
    pub width: u32,
    /// Height in rows.
    pub height: u32,
    /// Buffer layout.
    pub pixel_format: PixelFormat,
    /// Row pitch in bytes (may exceed `width * sample_stride` on real hardware).
    pub bytes_per_line: usize,
}

impl FrameFormat {
    /// Tightly packed format with no row padding.
    #[must_use]
    pub fn packed(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
            bytes_per_line: width as usize * pixel_format.sample_stride(),
        }
    }

    /// Bytes needed to hold one frame.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.bytes_per_line * self.height as usize
    }

    /// Number of samples in one frame.
    #[must_use]
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// A slot the hardware has finished filling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadySlot {
    /// Slot the hardware filled.
    pub index: usize,
    /// Device-local (monotonic) capture time.
    pub timestamp: Duration,
}

/// Device controls that can be passed through to the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceParameter {
    /// Absolute exposure time, id 0.
    Exposure,
    /// Id 1.
    Brightness,
    /// Id 2.
    Contrast,
    /// Id 3.
    Gain,
}

impl TryFrom<u32> for DeviceParameter {
    type Error = CaptureError;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        match id {
            0 => Ok(DeviceParameter::Exposure),
            1 => Ok(DeviceParameter::Brightness),
            2 => Ok(DeviceParameter::Contrast),
            3 => Ok(DeviceParameter::Gain),
            other => Err(CaptureError::UnsupportedParameter(other)),
        }
    }
}

/// Hardware capture boundary.
///
/// Implementations only move slot indices across the boundary; the buffer
/// memory itself is handed out once by [`map_buffers`](Self::map_buffers) and
/// owned by the [`BufferSlotPool`] from then on.
///
/// All methods are called from the single thread that owns the
/// [`FramePump`], so implementations need no internal locking.
pub trait CaptureDevice: Send {
    /// Backing memory of one slot.
    type Region: AsRef<[u8]> + AsMut<[u8]> + Send;

    /// Device name for logging.
    fn name(&self) -> &str;

    /// Negotiated frame format.
    fn format(&self) -> FrameFormat;

    /// Clock translation captured when the device handle was created.
    fn clock(&self) -> DeviceClock;

    /// Request `requested` buffer slots and map them.
    ///
    /// Returns the regions actually granted; fewer than two is an error.
    fn map_buffers(&mut self, requested: usize) -> CaptureResult<Vec<Self::Region>>;

    /// Return slot `index` to the hardware.
    fn enqueue(&mut self, index: usize) -> CaptureResult<()>;

    /// Start filling queued slots.
    fn stream_on(&mut self) -> CaptureResult<()>;

    /// Stop streaming. The hardware forgets every queued slot.
    fn stream_off(&mut self) -> CaptureResult<()>;

    /// Wait up to `timeout` for a filled slot. `Ok(false)` means timeout.
    fn wait_ready(&mut self, timeout: Duration) -> CaptureResult<bool>;

    /// Take the next filled slot from the hardware.
    fn dequeue(&mut self) -> CaptureResult<ReadySlot>;

    /// Called after [`dequeue`](Self::dequeue), before the slot changes hands.
    ///
    /// DMA-capable hardware has already written the region; software devices
    /// write their frame here.
    fn complete_transfer(&mut self, _index: usize, _region: &mut Self::Region) {}

    /// Write one control value.
    fn set_parameter(&mut self, parameter: DeviceParameter, value: i32) -> CaptureResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_format_sizes() {
        let fmt = FrameFormat::packed(640, 480, PixelFormat::Yuyv);
        assert_eq!(fmt.bytes_per_line, 1280);
        assert_eq!(fmt.frame_bytes(), 1280 * 480);
        assert_eq!(fmt.pixel_count(), 640 * 480);
    }

    #[test]
    fn test_parameter_ids() {
        assert_eq!(DeviceParameter::try_from(3).ok(), Some(DeviceParameter::Gain));
        assert!(matches!(
            DeviceParameter::try_from(9),
            Err(CaptureError::UnsupportedParameter(9))
        ));
    }
}
