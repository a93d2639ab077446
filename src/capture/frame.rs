//! Borrowed frame view.
//!
//! A [`Frame`] is a window onto one slot of device memory plus the metadata the
//! pump injected when the slot was dequeued. It never owns pixel data; the
//! borrow ties its lifetime to the [`FrameGuard`](super::FrameGuard) (or any
//! other byte slice, in tests) it was built from.

use super::{FrameFormat, PixelFormat};

/// Read-only view over one captured frame.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    data: &'a [u8],
    format: FrameFormat,
    timestamp_us: i64,
    slot: usize,
}

impl<'a> Frame<'a> {
    /// Wrap raw frame bytes.
    ///
    /// `data` shorter than `format.frame_bytes()` is accepted; rows beyond the
    /// end of the data are simply reported empty.
    #[must_use]
    pub fn new(data: &'a [u8], format: FrameFormat, timestamp_us: i64) -> Self {
        Self {
            data,
            format,
            timestamp_us,
            slot: 0,
        }
    }

    pub(crate) fn from_slot(
        data: &'a [u8],
        format: FrameFormat,
        timestamp_us: i64,
        slot: usize,
    ) -> Self {
        Self {
            data,
            format,
            timestamp_us,
            slot,
        }
    }

    /// Width in samples.
    #[inline]
    #[must_use]
    pub fn width(&self) -> u32 {
        self.format.width
    }

    /// Height in rows.
    #[inline]
    #[must_use]
    pub fn height(&self) -> u32 {
        self.format.height
    }

    /// Geometry of the underlying buffer.
    #[must_use]
    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Layout of the underlying buffer.
    #[must_use]
    pub fn pixel_format(&self) -> PixelFormat {
        self.format.pixel_format
    }

    /// Wall-clock capture time in microseconds.
    #[must_use]
    pub fn timestamp_us(&self) -> i64 {
        self.timestamp_us
    }

    /// Index of the buffer slot this frame lives in.
    #[must_use]
    pub fn slot_index(&self) -> usize {
        self.slot
    }

    /// Raw slot bytes, including chroma and row padding.
    #[must_use]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Luma samples of row `y`, one per column.
    pub fn row(&self, y: u32) -> impl Iterator<Item = u8> + 'a {
        let stride = self.format.pixel_format.sample_stride();
        let start = (y as usize).saturating_mul(self.format.bytes_per_line);
        let len = self.format.width as usize * stride;
        let row = self
            .data
            .get(start..start.saturating_add(len))
            .unwrap_or(&[]);
        row.iter().step_by(stride).copied()
    }

    /// Luma samples of the whole frame in row-major order.
    pub fn samples(&self) -> impl Iterator<Item = u8> + 'a {
        let frame = *self;
        (0..frame.format.height).flat_map(move |y| frame.row(y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_row_reads_luma_only() {
        // Two rows of 3 pixels: Y U Y V Y U
        let data = [10, 128, 20, 128, 30, 128, 40, 128, 50, 128, 60, 128];
        let frame = Frame::new(&data, FrameFormat::packed(3, 2, PixelFormat::Yuyv), 0);

        assert_eq!(frame.row(0).collect::<Vec<_>>(), vec![10, 20, 30]);
        assert_eq!(frame.row(1).collect::<Vec<_>>(), vec![40, 50, 60]);
    }

    #[test]
    fn test_row_padding_is_skipped() {
        let format = FrameFormat {
            width: 2,
            height: 2,
            pixel_format: PixelFormat::Grey,
            bytes_per_line: 4,
        };
        let data = [1, 2, 0xee, 0xee, 3, 4, 0xee, 0xee];
        let frame = Frame::new(&data, format, 0);

        assert_eq!(frame.samples().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_short_buffer_yields_empty_rows() {
        let data = [1, 2];
        let frame = Frame::new(&data, FrameFormat::packed(2, 3, PixelFormat::Grey), 0);
        assert_eq!(frame.row(2).count(), 0);
    }
}
