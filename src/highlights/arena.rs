//! Bounded set of live tracks.
//!
//! At most `capacity` tracks are live at once. A track is identified only by
//! its slot. When every slot is taken, new non-overlapping intervals are
//! dropped; existing tracks are never evicted.

use super::scanner::Interval;
use super::HighlightTrack;

/// Result of offering one interval to the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Absorbed by this many overlapping live tracks.
    Merged(usize),
    /// Opened a new track in this slot.
    Opened(usize),
    /// Arena full and nothing overlapped.
    Dropped,
}

/// Fixed-capacity slots holding the live tracks of one frame.
#[derive(Debug)]
pub struct TrackArena {
    slots: Vec<Option<HighlightTrack>>,
    free: Vec<usize>,
}

impl TrackArena {
    /// Empty arena with `capacity` slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut arena = Self {
            slots: vec![None; capacity],
            free: Vec::with_capacity(capacity),
        };
        arena.clear();
        arena
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live tracks.
    #[must_use]
    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Forget every live track without emitting it.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.free.clear();
        // Popped from the back, so the lowest slot is reused first.
        self.free.extend((0..self.slots.len()).rev());
    }

    /// Merge `interval` on `row` into every overlapping live track, or open a
    /// new track for it when none overlaps.
    ///
    /// A run bridging two tracks is counted by both, which keeps both live.
    pub fn place(&mut self, interval: Interval, row: u32) -> Placement {
        let mut merged = 0;
        for track in self.slots.iter_mut().flatten() {
            if interval.overlaps(track.lx, track.rx) {
                track.absorb(interval, row);
                merged += 1;
            }
        }
        if merged > 0 {
            return Placement::Merged(merged);
        }

        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(HighlightTrack::open(interval, row));
                Placement::Opened(index)
            }
            None => Placement::Dropped,
        }
    }

    /// Finalize every live track not updated on `row`, in slot order.
    pub fn retire_stale(&mut self, row: u32, out: &mut Vec<HighlightTrack>) {
        self.retire_where(out, |track| track.last_row != row);
    }

    /// Finalize every live track, in slot order.
    pub fn retire_all(&mut self, out: &mut Vec<HighlightTrack>) {
        self.retire_where(out, |_| true);
    }

    fn retire_where<F>(&mut self, out: &mut Vec<HighlightTrack>, mut stale: F)
    where
        F: FnMut(&HighlightTrack) -> bool,
    {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if !slot.as_ref().is_some_and(&mut stale) {
                continue;
            }
            if let Some(track) = slot.take() {
                if track.total_points > 0 {
                    out.push(track);
                }
                self.free.push(index);
            }
        }
    }
}
