//! Video4Linux2 capture device.
//!
//! Implements [`CaptureDevice`] on top of the `v4l` crate:
//!
//! - [`v4l::Device`] opens the node, reports capabilities, negotiates the YUYV
//!   format and writes controls
//! - `VIDIOC_REQBUFS` + `VIDIOC_QUERYBUF` + `mmap` for each slot
//! - `VIDIOC_QBUF` / `VIDIOC_DQBUF` / `VIDIOC_STREAMON` / `VIDIOC_STREAMOFF`
//!   issued one at a time through [`v4l::v4l2::ioctl`], since the slot pool
//!   decides when each buffer changes hands
//! - `poll(2)` on the device handle for readiness
//!
//! `v4l`'s own `MmapStream` requeues a buffer as soon as the next one is
//! dequeued, which cannot express a slot held by the consumer across calls.
//!
//! Only compiled with the `v4l2_hardware` feature on Linux.

#![allow(unsafe_code)] // buffer ioctls and mmap of device memory

use super::{CaptureDevice, DeviceClock, DeviceParameter, FrameFormat, PixelFormat, ReadySlot};
use crate::error::{CaptureError, CaptureResult};
use memmap2::{MmapMut, MmapOptions};
use std::io;
use std::os::raw::{c_int, c_void};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::control::{Control, Value};
use v4l::device::Handle;
use v4l::memory::Memory;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::{Device, Format, FourCC, Timestamp};

/// Control ids from `linux/v4l2-controls.h`.
mod cid {
    const BASE: u32 = 0x0098_0900;
    const CAMERA_CLASS_BASE: u32 = 0x009a_0900;

    pub const BRIGHTNESS: u32 = BASE;
    pub const CONTRAST: u32 = BASE + 1;
    pub const SATURATION: u32 = BASE + 2;
    pub const HUE: u32 = BASE + 3;
    pub const EXPOSURE: u32 = BASE + 17;
    pub const GAIN: u32 = BASE + 19;
    pub const POWER_LINE_FREQUENCY: u32 = BASE + 24;
    pub const WHITE_BALANCE_TEMPERATURE: u32 = BASE + 26;
    pub const SHARPNESS: u32 = BASE + 27;
    pub const AUTOBRIGHTNESS: u32 = BASE + 32;
    pub const EXPOSURE_AUTO: u32 = CAMERA_CLASS_BASE + 1;
    pub const LOCK_3A: u32 = CAMERA_CLASS_BASE + 27;

    pub const EXPOSURE_MANUAL: i64 = 1;
    pub const LOCK_ALL: i64 = 0x7;
}

/// Controls applied once after the format is set. Failures are ignored; not
/// every sensor exposes every control.
const MANUAL_CONTROLS: &[(u32, i64, &str)] = &[
    (cid::LOCK_3A, cid::LOCK_ALL, "3a_lock"),
    (cid::EXPOSURE_AUTO, cid::EXPOSURE_MANUAL, "exposure_auto"),
    (cid::EXPOSURE, 40, "exposure"),
    (cid::BRIGHTNESS, 65, "brightness"),
    (cid::CONTRAST, 64, "contrast"),
    (cid::GAIN, 15, "gain"),
    (cid::HUE, 0, "hue"),
    (cid::SATURATION, 0, "saturation"),
    (cid::POWER_LINE_FREQUENCY, 0, "power_line_frequency"),
    (cid::WHITE_BALANCE_TEMPERATURE, 1600, "white_balance_temperature"),
    (cid::SHARPNESS, 24, "sharpness"),
    (cid::AUTOBRIGHTNESS, 0, "autobrightness"),
];

fn control_id(parameter: DeviceParameter) -> u32 {
    match parameter {
        DeviceParameter::Exposure => cid::EXPOSURE,
        DeviceParameter::Brightness => cid::BRIGHTNESS,
        DeviceParameter::Contrast => cid::CONTRAST,
        DeviceParameter::Gain => cid::GAIN,
    }
}

fn pixel_format_of(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"YUYV" => Some(PixelFormat::Yuyv),
        b"GREY" => Some(PixelFormat::Grey),
        _ => None,
    }
}

/// Frame geometry from a negotiated format. The driver's stride wins when it
/// pads rows.
fn frame_format_of(format: &Format) -> Option<FrameFormat> {
    let pixel_format = pixel_format_of(format.fourcc)?;
    let packed = FrameFormat::packed(format.width, format.height, pixel_format);
    Some(FrameFormat {
        bytes_per_line: (format.stride as usize).max(packed.bytes_per_line),
        ..packed
    })
}

// =============================================================================
// V4l2Camera
// =============================================================================

/// A V4L2 video capture node such as `/dev/video0`.
pub struct V4l2Camera {
    name: String,
    device: Device,
    handle: Arc<Handle>,
    format: FrameFormat,
    clock: DeviceClock,
    granted: usize,
}

impl V4l2Camera {
    /// Open `path` and negotiate a YUYV format of `width` x `height`.
    pub fn open(path: impl AsRef<Path>, width: u32, height: u32) -> CaptureResult<Self> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let clock = DeviceClock::capture();
        let open_error = |source| CaptureError::DeviceOpen {
            device: name.clone(),
            source,
        };

        let device = Device::with_path(path).map_err(open_error)?;
        let caps = device.query_caps().map_err(open_error)?;
        if !caps
            .capabilities
            .contains(Flags::VIDEO_CAPTURE | Flags::STREAMING)
        {
            return Err(CaptureError::UnsupportedFormat {
                device: name,
                format: "streaming video capture".to_string(),
            });
        }

        let unsupported = || CaptureError::UnsupportedFormat {
            device: name.clone(),
            format: format!("YUYV {width}x{height}"),
        };
        let requested = Format::new(width, height, FourCC::new(b"YUYV"));
        let negotiated = Capture::set_format(&device, &requested).map_err(|_| unsupported())?;
        let format = frame_format_of(&negotiated).ok_or_else(unsupported)?;

        let handle = device.handle();
        let camera = Self {
            name,
            device,
            handle,
            format,
            clock,
            granted: 0,
        };
        camera.apply_manual_controls();

        info!(
            device = %camera.name,
            driver = %caps.driver,
            card = %caps.card,
            width = format.width,
            height = format.height,
            bytes_per_line = format.bytes_per_line,
            "Opened V4L2 device"
        );
        Ok(camera)
    }

    fn apply_manual_controls(&self) {
        for &(id, value, label) in MANUAL_CONTROLS {
            if let Err(e) = self.set_control(id, value) {
                debug!(device = %self.name, control = label, error = %e, "Control not applied");
            }
        }
    }

    fn set_control(&self, id: u32, value: i64) -> io::Result<()> {
        self.device.set_control(Control {
            id,
            value: Value::Integer(value),
        })
    }

    fn stream_ioctl(&self, request: vidioc::_IOC_TYPE) -> CaptureResult<()> {
        let mut buf_type = Type::VideoCapture as u32;
        xioctl(&self.handle, request, &mut buf_type)?;
        Ok(())
    }

    fn mmap_buffer(index: u32) -> v4l2_buffer {
        v4l2_buffer {
            index,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: v4l2_buffer is plain old data; all-zero is a valid value.
            ..unsafe { std::mem::zeroed() }
        }
    }
}

/// Buffer ioctl through `v4l`, retried on `EINTR`.
fn xioctl<T>(handle: &Handle, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
    loop {
        // SAFETY: `arg` is the live argument struct `v4l` defines for `request`.
        let result = unsafe { v4l::v4l2::ioctl(handle.fd(), request, (arg as *mut T).cast::<c_void>()) };
        match result {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

impl CaptureDevice for V4l2Camera {
    type Region = MmapMut;

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
        let mut req = v4l2_requestbuffers {
            count: u32::try_from(requested).unwrap_or(u32::MAX),
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: v4l2_requestbuffers is plain old data; all-zero is a valid value.
            ..unsafe { std::mem::zeroed() }
        };
        xioctl(&self.handle, vidioc::VIDIOC_REQBUFS, &mut req)?;

        let granted = req.count as usize;
        if granted < 2 {
            return Err(CaptureError::InsufficientBuffers { granted });
        }

        let mut regions = Vec::with_capacity(granted);
        for index in 0..req.count {
            let mut buf = Self::mmap_buffer(index);
            xioctl(&self.handle, vidioc::VIDIOC_QUERYBUF, &mut buf)?;

            // SAFETY: the driver set `offset` for MMAP buffers.
            let offset = unsafe { buf.m.offset };
            // SAFETY: the mapping covers exactly the buffer the driver exported
            // at `offset`. The pool only exposes it while the slot is owned by
            // the consumer, when the hardware is not writing to it.
            let region = unsafe {
                MmapOptions::new()
                    .len(buf.length as usize)
                    .offset(u64::from(offset))
                    .map_mut(self.handle.fd())?
            };
            regions.push(region);
        }

        self.granted = granted;
        debug!(device = %self.name, requested, granted, "Mapped capture buffers");
        Ok(regions)
    }

    fn enqueue(&mut self, index: usize) -> CaptureResult<()> {
        let slot = u32::try_from(index).ok().filter(|_| index < self.granted);
        let Some(slot) = slot else {
            return Err(CaptureError::SlotOutOfRange {
                index,
                count: self.granted,
            });
        };
        let mut buf = Self::mmap_buffer(slot);
        xioctl(&self.handle, vidioc::VIDIOC_QBUF, &mut buf)?;
        Ok(())
    }

    fn stream_on(&mut self) -> CaptureResult<()> {
        self.stream_ioctl(vidioc::VIDIOC_STREAMON)
    }

    fn stream_off(&mut self) -> CaptureResult<()> {
        self.stream_ioctl(vidioc::VIDIOC_STREAMOFF)
    }

    fn wait_ready(&mut self, timeout: Duration) -> CaptureResult<bool> {
        let timeout_ms = c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);
        match self.handle.poll(libc::POLLIN, timeout_ms) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(CaptureError::Io(e)),
        }
    }

    fn dequeue(&mut self) -> CaptureResult<ReadySlot> {
        let mut buf = Self::mmap_buffer(0);
        xioctl(&self.handle, vidioc::VIDIOC_DQBUF, &mut buf)?;

        let index = buf.index as usize;
        if index >= self.granted {
            warn!(device = %self.name, index, "Driver returned out-of-range buffer");
            return Err(CaptureError::SlotOutOfRange {
                index,
                count: self.granted,
            });
        }
        let stamp = Timestamp::from(buf.timestamp);
        let timestamp = Duration::new(
            u64::try_from(stamp.sec).unwrap_or(0),
            u32::try_from(stamp.usec).unwrap_or(0).saturating_mul(1_000),
        );
        Ok(ReadySlot { index, timestamp })
    }

    fn set_parameter(&mut self, parameter: DeviceParameter, value: i32) -> CaptureResult<()> {
        self.set_control(control_id(parameter), i64::from(value))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_formats() {
        assert_eq!(pixel_format_of(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(pixel_format_of(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(pixel_format_of(FourCC::new(b"MJPG")), None);
    }

    #[test]
    fn test_driver_stride_is_kept() {
        let mut format = Format::new(640, 480, FourCC::new(b"YUYV"));
        format.stride = 1344;
        let frame = frame_format_of(&format).unwrap();
        assert_eq!(frame.bytes_per_line, 1344);
        assert_eq!(frame.pixel_count(), 640 * 480);

        format.stride = 0;
        assert_eq!(frame_format_of(&format).unwrap().bytes_per_line, 1280);
    }

    #[test]
    fn test_control_ids() {
        assert_eq!(control_id(DeviceParameter::Brightness), 0x0098_0900);
        assert_eq!(control_id(DeviceParameter::Gain), 0x0098_0913);
    }

    #[test]
    fn test_missing_device_reports_open_error() {
        let result = V4l2Camera::open("/dev/this-device-does-not-exist", 640, 480);
        assert!(matches!(result, Err(CaptureError::DeviceOpen { .. })));
    }
}
