//! Row scanner: turns one row of samples into bright intervals.
//!
//! Samples are classified against two thresholds into [`Band`]s, and a small
//! state machine with hysteresis extracts half-open `[lx, rx)` intervals. A run
//! that dips into the middling band and comes back to bright stays a single
//! interval; a dark sample always closes it.

use serde::{Deserialize, Serialize};

/// Default lower edge of the bright band.
pub const DEFAULT_HIGH_THRESHOLD: u8 = 200;

/// Default lower edge of the middling band.
pub const DEFAULT_LOW_THRESHOLD: u8 = 150;

/// Band edges used to classify samples. `high` must be greater than `low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Samples at or above this level are bright.
    pub high: u8,
    /// Samples at or above this level, and below `high`, are middling.
    pub low: u8,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            high: DEFAULT_HIGH_THRESHOLD,
            low: DEFAULT_LOW_THRESHOLD,
        }
    }
}

impl Thresholds {
    /// Band of one sample.
    #[inline]
    #[must_use]
    pub fn classify(&self, sample: u8) -> Band {
        if sample >= self.high {
            Band::Bright
        } else if sample >= self.low {
            Band::Middling
        } else {
            Band::Dark
        }
    }
}

/// Three-way classification of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// Below `low`; closes any open interval.
    Dark,
    /// Between the thresholds; extends an interval but never opens one.
    Middling,
    /// At or above `high`.
    Bright,
}

/// Half-open column range `[lx, rx)` of one bright run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    /// First column of the run.
    pub lx: u32,
    /// One past the last column.
    pub rx: u32,
}

impl Interval {
    /// Number of columns covered.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.rx - self.lx
    }

    /// True if the two ranges share at least one column.
    #[must_use]
    pub fn overlaps(&self, lx: u32, rx: u32) -> bool {
        self.lx < rx && lx < self.rx
    }
}

#[derive(Debug, Clone, Copy)]
enum ScanState {
    Idle,
    Tentative,
    Confirmed { lx: u32 },
    PendingClose { lx: u32, rx: u32 },
}

/// Append the bright intervals of one row to `out`, left to right.
pub fn scan_row<I>(thresholds: &Thresholds, samples: I, out: &mut Vec<Interval>)
where
    I: IntoIterator<Item = u8>,
{
    let mut state = ScanState::Idle;
    let mut width = 0u32;

    for (x, sample) in (0u32..).zip(samples) {
        width = x + 1;
        state = match (state, thresholds.classify(sample)) {
            (ScanState::Idle | ScanState::Tentative, Band::Dark) => ScanState::Idle,
            (ScanState::Idle | ScanState::Tentative, Band::Middling) => ScanState::Tentative,
            (ScanState::Idle | ScanState::Tentative, Band::Bright) => ScanState::Confirmed { lx: x },

            (ScanState::Confirmed { lx }, Band::Dark) => {
                out.push(Interval { lx, rx: x });
                ScanState::Idle
            }
            (ScanState::Confirmed { lx }, Band::Middling) => ScanState::PendingClose { lx, rx: x },
            (confirmed @ ScanState::Confirmed { .. }, Band::Bright) => confirmed,

            (ScanState::PendingClose { lx, rx }, Band::Dark) => {
                out.push(Interval { lx, rx });
                ScanState::Idle
            }
            (pending @ ScanState::PendingClose { .. }, Band::Middling) => pending,
            (ScanState::PendingClose { lx, .. }, Band::Bright) => ScanState::Confirmed { lx },
        };
    }

    match state {
        ScanState::Confirmed { lx } => out.push(Interval { lx, rx: width }),
        ScanState::PendingClose { lx, rx } => out.push(Interval { lx, rx }),
        ScanState::Idle | ScanState::Tentative => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const B: u8 = 255;
    const M: u8 = 170;
    const D: u8 = 0;

    fn scan(samples: &[u8]) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        scan_row(&Thresholds::default(), samples.iter().copied(), &mut out);
        out.into_iter().map(|i| (i.lx, i.rx)).collect()
    }

    #[test]
    fn test_classify_band_edges() {
        let t = Thresholds::default();
        assert_eq!(t.classify(149), Band::Dark);
        assert_eq!(t.classify(150), Band::Middling);
        assert_eq!(t.classify(199), Band::Middling);
        assert_eq!(t.classify(200), Band::Bright);
    }

    #[test]
    fn test_dark_row_has_no_intervals() {
        assert!(scan(&[D; 16]).is_empty());
    }

    #[test]
    fn test_bright_run_closed_by_dark() {
        assert_eq!(scan(&[D, B, B, B, D]), vec![(1, 4)]);
    }

    #[test]
    fn test_middling_dip_does_not_split() {
        assert_eq!(scan(&[B, M, B]), vec![(0, 3)]);
    }

    #[test]
    fn test_middling_tail_closes_at_first_middling_column() {
        assert_eq!(scan(&[D, B, B, M, M, D]), vec![(1, 3)]);
    }

    #[test]
    fn test_middling_alone_is_not_an_interval() {
        assert!(scan(&[M, M, M, D, M]).is_empty());
    }

    #[test]
    fn test_middling_lead_in_starts_at_first_bright() {
        assert_eq!(scan(&[M, M, B, D]), vec![(2, 3)]);
    }

    #[test]
    fn test_open_interval_closes_at_row_end() {
        assert_eq!(scan(&[D, D, B, B]), vec![(2, 4)]);
        assert_eq!(scan(&[D, B, M, M]), vec![(1, 2)]);
    }

    #[test]
    fn test_two_runs() {
        assert_eq!(scan(&[B, B, D, D, B, D]), vec![(0, 2), (4, 5)]);
    }

    #[test]
    fn test_overlap_is_strict() {
        let interval = Interval { lx: 2, rx: 5 };
        assert!(interval.overlaps(4, 6));
        assert!(!interval.overlaps(5, 8));
        assert!(!interval.overlaps(0, 2));
    }
}
