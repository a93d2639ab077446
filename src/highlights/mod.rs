//! Single-pass scanline blob tracking.
//!
//! [`HighlightTracker::track_frame`] walks a frame top to bottom. Each row is
//! reduced to bright intervals by the [`scanner`], every interval is merged
//! into each overlapping live track or opens a new one in the bounded
//! [`arena`], and tracks that were not extended on a row are finalized.
//!
//! Tracks carry running sums only; consumers recover the centroid with
//! [`HighlightTrack::centroid`].

pub mod arena;
pub mod scanner;
pub mod sink;

pub use arena::{Placement, TrackArena};
pub use scanner::{scan_row, Band, Interval, Thresholds};
pub use sink::{CollectingSink, HighlightEvent, HighlightSink, TextHighlightWriter};

use crate::capture::Frame;
use crate::error::{CaptureError, CaptureResult};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Default number of concurrently live tracks.
pub const DEFAULT_MAX_TRACKS: usize = 4;

/// Tracker tuning, loaded from the `[tracker]` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Size of the live-track arena.
    pub max_tracks: usize,
    /// Band edges for the row scanner.
    pub thresholds: Thresholds,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_tracks: DEFAULT_MAX_TRACKS,
            thresholds: Thresholds::default(),
        }
    }
}

impl TrackerConfig {
    /// Reject inverted thresholds and an empty arena.
    pub fn validate(&self) -> CaptureResult<()> {
        if self.thresholds.high <= self.thresholds.low {
            return Err(CaptureError::Configuration(format!(
                "tracker.thresholds.high ({}) must be greater than tracker.thresholds.low ({})",
                self.thresholds.high, self.thresholds.low
            )));
        }
        if self.max_tracks == 0 {
            return Err(CaptureError::Configuration(
                "tracker.max_tracks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One bright feature aggregated over consecutive rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HighlightTrack {
    /// Interval on the most recent row.
    pub lx: u32,
    /// End of that interval, exclusive.
    pub rx: u32,
    /// Row the track was last extended on.
    pub last_row: u32,
    /// Sum of interval widths.
    pub total_points: u64,
    /// Sum of `width * (lx + rx)`, i.e. twice the x moment.
    pub x_moment: u64,
    /// Sum of `width * row`.
    pub y_sum: u64,
}

impl HighlightTrack {
    pub(crate) fn open(interval: Interval, row: u32) -> Self {
        let mut track = Self {
            lx: interval.lx,
            rx: interval.rx,
            last_row: row,
            ..Self::default()
        };
        track.accumulate(interval, row);
        track
    }

    pub(crate) fn absorb(&mut self, interval: Interval, row: u32) {
        self.lx = interval.lx;
        self.rx = interval.rx;
        self.last_row = row;
        self.accumulate(interval, row);
    }

    fn accumulate(&mut self, interval: Interval, row: u32) {
        let width = u64::from(interval.width());
        self.total_points += width;
        self.x_moment += width * u64::from(interval.lx + interval.rx);
        self.y_sum += width * u64::from(row);
    }

    /// Mean `(x, y)` of the feature, or `None` for an empty track.
    ///
    /// Column `x` covers `[x, x + 1)`, so a single-column feature at `x`
    /// reports `x + 0.5`.
    #[must_use]
    pub fn centroid(&self) -> Option<(f64, f64)> {
        if self.total_points == 0 {
            return None;
        }
        let points = self.total_points as f64;
        Some((
            self.x_moment as f64 / (2.0 * points),
            self.y_sum as f64 / points,
        ))
    }
}

/// Per-device tracking state, reused across frames.
#[derive(Debug)]
pub struct HighlightTracker {
    config: TrackerConfig,
    arena: TrackArena,
    intervals: Vec<Interval>,
    emitted: Vec<HighlightTrack>,
    dropped: u64,
}

impl HighlightTracker {
    /// Tracker with an empty arena sized from `config`.
    #[must_use]
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            arena: TrackArena::new(config.max_tracks),
            intervals: Vec::new(),
            emitted: Vec::with_capacity(config.max_tracks),
            dropped: 0,
        }
    }

    /// Tuning in use.
    #[must_use]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Intervals discarded because the arena was full, since creation.
    #[must_use]
    pub fn dropped_intervals(&self) -> u64 {
        self.dropped
    }

    /// Track one frame and return its finalized highlights in the order they
    /// completed. The returned slice is overwritten by the next call.
    pub fn track_frame(&mut self, frame: &Frame<'_>) -> &[HighlightTrack] {
        self.emitted.clear();
        self.arena.clear();

        for row in 0..frame.height() {
            self.intervals.clear();
            scan_row(&self.config.thresholds, frame.row(row), &mut self.intervals);

            for &interval in &self.intervals {
                if self.arena.place(interval, row) == Placement::Dropped {
                    self.dropped += 1;
                    trace!(row, lx = interval.lx, rx = interval.rx, "Track arena full, interval dropped");
                }
            }
            self.arena.retire_stale(row, &mut self.emitted);
        }
        self.arena.retire_all(&mut self.emitted);

        &self.emitted
    }
}

impl Default for HighlightTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}
