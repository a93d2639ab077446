//! Destinations for finalized highlights.
//!
//! Each tracking iteration is bracketed by session markers for the device it
//! came from, so a reader can group emissions per frame and per device.

use super::HighlightTrack;
use crate::error::CaptureResult;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;

/// Receives tracker output.
pub trait HighlightSink: Send {
    /// A frame from `device` is about to be tracked.
    fn session_start(&mut self, device: usize) -> CaptureResult<()>;
    /// One finalized track from the current frame.
    fn highlight(&mut self, device: usize, track: &HighlightTrack) -> CaptureResult<()>;
    /// The frame from `device` is done.
    fn session_end(&mut self, device: usize) -> CaptureResult<()>;
}

/// Line-oriented text stream understood by existing point-resolving tools.
///
/// One line per session group:
///
/// ```text
/// [(0,12,480,60);(0,3,27,33);];
/// ```
///
/// `[` opens the group when device 0 starts, each highlight is
/// `(device,total_points,x_moment,y_sum);`, and `];` plus a newline closes the
/// group after the last device.
pub struct TextHighlightWriter<W: Write + Send> {
    out: W,
    devices: usize,
}

impl<W: Write + Send> TextHighlightWriter<W> {
    /// Writer for sessions that cycle through `devices` devices.
    pub fn new(out: W, devices: usize) -> Self {
        Self {
            out,
            devices: devices.max(1),
        }
    }

    /// Recover the underlying writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> HighlightSink for TextHighlightWriter<W> {
    fn session_start(&mut self, device: usize) -> CaptureResult<()> {
        if device == 0 {
            self.out.write_all(b"[")?;
        }
        Ok(())
    }

    fn highlight(&mut self, device: usize, track: &HighlightTrack) -> CaptureResult<()> {
        write!(
            self.out,
            "({},{},{},{});",
            device, track.total_points, track.x_moment, track.y_sum
        )?;
        Ok(())
    }

    fn session_end(&mut self, device: usize) -> CaptureResult<()> {
        if device + 1 >= self.devices {
            self.out.write_all(b"];\n")?;
            self.out.flush()?;
        }
        Ok(())
    }
}

/// One recorded sink call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HighlightEvent {
    /// `session_start(device)`
    SessionStart(usize),
    /// `highlight(device, track)`
    Highlight(usize, HighlightTrack),
    /// `session_end(device)`
    SessionEnd(usize),
}

/// In-memory sink; clones share the same event log.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<HighlightEvent>>>,
}

impl CollectingSink {
    /// Sink with an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<HighlightEvent> {
        self.events.lock().clone()
    }

    /// Highlights only, without session markers.
    #[must_use]
    pub fn highlights(&self) -> Vec<HighlightTrack> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                HighlightEvent::Highlight(_, track) => Some(*track),
                _ => None,
            })
            .collect()
    }

    /// Number of completed sessions.
    #[must_use]
    pub fn sessions(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, HighlightEvent::SessionEnd(_)))
            .count()
    }
}

impl HighlightSink for CollectingSink {
    fn session_start(&mut self, device: usize) -> CaptureResult<()> {
        self.events.lock().push(HighlightEvent::SessionStart(device));
        Ok(())
    }

    fn highlight(&mut self, device: usize, track: &HighlightTrack) -> CaptureResult<()> {
        self.events.lock().push(HighlightEvent::Highlight(device, *track));
        Ok(())
    }

    fn session_end(&mut self, device: usize) -> CaptureResult<()> {
        self.events.lock().push(HighlightEvent::SessionEnd(device));
        Ok(())
    }
}
