//! Persistence of captured and accumulated frames.
//!
//! The worker hands raw frames and finished accumulations to a [`CaptureSink`].
//! [`GrayFileSink`] writes headerless 8-bit grey images, one byte per pixel,
//! which standard tools read given the dimensions:
//!
//! ```text
//! convert -depth 8 -size 640x480 a0.gray a0.png
//! ```

use crate::capture::Frame;
use crate::error::CaptureResult;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Receives the output of CAPTURE and ACCUMULATE actions.
pub trait CaptureSink: Send {
    /// Store the luma samples of one frame from `device`.
    fn store_frame(&mut self, device: usize, frame: &Frame<'_>) -> CaptureResult<()>;

    /// Store the normalized image of `accumulation`.
    fn store_accumulation(&mut self, device: usize, accumulation: &Accumulation)
        -> CaptureResult<()>;
}

// =============================================================================
// Accumulation
// =============================================================================

/// Per-pixel sum of several frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accumulation {
    width: u32,
    height: u32,
    frames: u32,
    sums: Vec<u32>,
}

impl Accumulation {
    /// Empty accumulation sized to `width` x `height`.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frames: 0,
            sums: vec![0; width as usize * height as usize],
        }
    }

    /// Add every sample of `frame`. Samples beyond the accumulation size are ignored.
    pub fn add_frame(&mut self, frame: &Frame<'_>) {
        for (sum, sample) in self.sums.iter_mut().zip(frame.samples()) {
            *sum += u32::from(sample);
        }
        self.frames += 1;
    }

    /// Width in samples.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in rows.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Frames actually added.
    #[must_use]
    pub fn frames(&self) -> u32 {
        self.frames
    }

    /// Raw per-pixel sums, row-major.
    #[must_use]
    pub fn sums(&self) -> &[u32] {
        &self.sums
    }

    /// Largest per-pixel sum.
    #[must_use]
    pub fn max_sum(&self) -> u32 {
        self.sums.iter().copied().max().unwrap_or(0)
    }

    /// Mean sample per pixel, `sum / frames`. All zero if no frame was added.
    #[must_use]
    pub fn normalized(&self) -> Vec<u8> {
        if self.frames == 0 {
            return vec![0; self.sums.len()];
        }
        self.sums
            .iter()
            .map(|&sum| u8::try_from(sum / self.frames).unwrap_or(u8::MAX))
            .collect()
    }
}

// =============================================================================
// GrayFileSink
// =============================================================================

/// Writes `<dir>/<stem><device>.gray`, overwriting the previous image.
#[derive(Debug, Clone)]
pub struct GrayFileSink {
    dir: PathBuf,
    stem: String,
}

impl GrayFileSink {
    /// Sink writing into `dir` with file names starting with `stem`.
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
        }
    }

    /// Output file for `device`.
    #[must_use]
    pub fn path_for(&self, device: usize) -> PathBuf {
        self.dir.join(format!("{}{}.gray", self.stem, device))
    }

    fn write(path: &Path, bytes: impl IntoIterator<Item = u8>) -> CaptureResult<()> {
        let mut out = BufWriter::new(File::create(path)?);
        for byte in bytes {
            out.write_all(&[byte])?;
        }
        out.flush()?;
        Ok(())
    }
}

impl CaptureSink for GrayFileSink {
    fn store_frame(&mut self, device: usize, frame: &Frame<'_>) -> CaptureResult<()> {
        let path = self.path_for(device);
        Self::write(&path, frame.samples())?;
        info!(
            path = %path.display(),
            width = frame.width(),
            height = frame.height(),
            timestamp_us = frame.timestamp_us(),
            "Stored frame"
        );
        Ok(())
    }

    fn store_accumulation(
        &mut self,
        device: usize,
        accumulation: &Accumulation,
    ) -> CaptureResult<()> {
        let path = self.path_for(device);
        Self::write(&path, accumulation.normalized())?;
        let max = accumulation.max_sum();
        info!(
            path = %path.display(),
            frames = accumulation.frames(),
            max,
            max_normalized = max / accumulation.frames().max(1),
            "Stored accumulation"
        );
        Ok(())
    }
}

// =============================================================================
// MemorySink
// =============================================================================

/// Luma copy of a stored frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFrame {
    /// Device index the frame was stored for.
    pub device: usize,
    /// Frame width in samples.
    pub width: u32,
    /// Frame height in rows.
    pub height: u32,
    /// Wall-clock capture time.
    pub timestamp_us: i64,
    /// Row-major luma.
    pub samples: Vec<u8>,
}

#[derive(Debug, Default)]
struct MemoryStore {
    frames: Vec<StoredFrame>,
    accumulations: Vec<(usize, Accumulation)>,
}

/// Keeps everything in memory; clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemorySink {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored frames, oldest first.
    #[must_use]
    pub fn frames(&self) -> Vec<StoredFrame> {
        self.store.lock().frames.clone()
    }

    /// Stored accumulations with their device index, oldest first.
    #[must_use]
    pub fn accumulations(&self) -> Vec<(usize, Accumulation)> {
        self.store.lock().accumulations.clone()
    }
}

impl CaptureSink for MemorySink {
    fn store_frame(&mut self, device: usize, frame: &Frame<'_>) -> CaptureResult<()> {
        self.store.lock().frames.push(StoredFrame {
            device,
            width: frame.width(),
            height: frame.height(),
            timestamp_us: frame.timestamp_us(),
            samples: frame.samples().collect(),
        });
        Ok(())
    }

    fn store_accumulation(
        &mut self,
        device: usize,
        accumulation: &Accumulation,
    ) -> CaptureResult<()> {
        self.store
            .lock()
            .accumulations
            .push((device, accumulation.clone()));
        Ok(())
    }
}
