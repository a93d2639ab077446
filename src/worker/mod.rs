//! Capture worker coordination.
//!
//! A single background thread owns the [`FramePump`](crate::capture::FramePump),
//! the [`HighlightTracker`](crate::highlights::HighlightTracker) and the sinks.
//! Controllers talk to it through a cloneable [`WorkerHandle`]: they submit one
//! [`ActionRequest`] at a time and wait for its [`ActionOutcome`].
//!
//! # States
//!
//! ```text
//!            submit                 worker picks up
//!   Idle -----------> ActionPending ---------------> Executing
//!    ^                                                   |
//!    |  submit (outcome discarded)                       | outcome published
//!    +------------------- ActionComplete <---------------+
//! ```
//!
//! Halting is cooperative: the worker finishes the action it is executing,
//! publishes the outcome, then exits. From then on every submit is rejected.

mod cell;
mod runner;

pub use cell::WorkerHandle;
pub use runner::{WorkerConfig, WorkerCoordinator};

use crate::capture::DeviceParameter;
use bitflags::bitflags;

/// Reply code for a command whose arguments could not be parsed.
pub const REPLY_MALFORMED: i64 = -2;

/// Reply code for a request abandoned because the worker stopped.
pub const REPLY_ABORTED: i64 = -3;

bitflags! {
    /// Work items of one request, executed in bit order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ActionFlags: u32 {
        /// Discard stale frames before the primary action.
        const FLUSH = 1;
        /// Store one raw frame.
        const CAPTURE = 2;
        /// Sum N frames per pixel and store the normalized result.
        const ACCUMULATE = 4;
        /// Run the highlight tracker over N frames.
        const TRACK_HIGHLIGHTS = 8;
        /// Count samples above a level, maximum over N frames.
        const THRESHOLD = 16;
        /// Write one device control.
        const SET_PARAMETER = 32;
    }
}

/// Contents of the action cell written by a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionRequest {
    /// Work items to run.
    pub actions: ActionFlags,
    /// Frame count for ACCUMULATE, TRACK_HIGHLIGHTS and THRESHOLD.
    pub frames: u32,
    /// Sample level for THRESHOLD.
    pub level: u8,
    /// Control and value for SET_PARAMETER.
    pub parameter: Option<(DeviceParameter, i32)>,
}

impl ActionRequest {
    fn with_actions(actions: ActionFlags) -> Self {
        Self {
            actions,
            frames: 0,
            level: 0,
            parameter: None,
        }
    }

    /// FLUSH only.
    #[must_use]
    pub fn flush() -> Self {
        Self::with_actions(ActionFlags::FLUSH)
    }

    /// Store one raw frame.
    #[must_use]
    pub fn capture() -> Self {
        Self::with_actions(ActionFlags::CAPTURE)
    }

    /// Sum `frames` frames.
    #[must_use]
    pub fn accumulate(frames: u32) -> Self {
        Self {
            frames,
            ..Self::with_actions(ActionFlags::ACCUMULATE)
        }
    }

    /// Track highlights over `frames` frames.
    #[must_use]
    pub fn track(frames: u32) -> Self {
        Self {
            frames,
            ..Self::with_actions(ActionFlags::TRACK_HIGHLIGHTS)
        }
    }

    /// Maximum count of samples above `level` over `frames` frames.
    #[must_use]
    pub fn threshold(level: u8, frames: u32) -> Self {
        Self {
            frames,
            level,
            ..Self::with_actions(ActionFlags::THRESHOLD)
        }
    }

    /// Write one device control.
    #[must_use]
    pub fn set_parameter(parameter: DeviceParameter, value: i32) -> Self {
        Self {
            parameter: Some((parameter, value)),
            ..Self::with_actions(ActionFlags::SET_PARAMETER)
        }
    }

    /// Prefix the request with a flush.
    #[must_use]
    pub fn with_flush(mut self) -> Self {
        self.actions |= ActionFlags::FLUSH;
        self
    }
}

/// Result the worker publishes for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// All work items ran to completion.
    Completed,
    /// Completed with a measured value (THRESHOLD).
    Measured(u64),
    /// No frame arrived within the capture timeout.
    TimedOut,
    /// A device, pump or sink error aborted the request.
    Failed,
}

impl ActionOutcome {
    /// Numeric code sent back to command clients.
    #[must_use]
    pub fn reply_code(&self) -> i64 {
        match self {
            ActionOutcome::Completed => 1,
            ActionOutcome::Measured(value) => i64::try_from(*value).unwrap_or(i64::MAX),
            ActionOutcome::TimedOut => 0,
            ActionOutcome::Failed => -1,
        }
    }

    /// True for outcomes that stop the remaining work items of a request.
    #[must_use]
    pub fn is_abort(&self) -> bool {
        matches!(self, ActionOutcome::TimedOut | ActionOutcome::Failed)
    }
}

/// Observable state of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No request submitted yet.
    Idle,
    /// Request written, not yet picked up.
    ActionPending,
    /// The worker is running the request.
    Executing,
    /// Outcome published; the cell accepts a new request.
    ActionComplete,
    /// The worker thread has exited.
    Stopped,
}
