//! Custom error types for the capture pipeline.
//!
//! This module defines the primary error type, `CaptureError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failure the capture worker can run into.
//!
//! ## Error Hierarchy
//!
//! - **`Io`**: A single readiness wait, dequeue or enqueue failed. The worker reports
//!   these as a negative action outcome and never retries them itself.
//! - **`Config`** / **`Configuration`**: Loading or validating [`Settings`](crate::config::Settings).
//! - **`DeviceOpen`**, **`UnsupportedFormat`**, **`InsufficientBuffers`**: Device
//!   bring-up failures. These are fatal at startup.
//! - **`SlotOutOfRange`**, **`SlotNotQueued`**, **`SlotNotOwned`**, **`SlotNotFree`**:
//!   Violations of the buffer slot ownership contract between the hardware and
//!   the consumer.
//! - **`ActionInProgress`**, **`WorkerStopped`**: Controller-side coordination errors.
//!
//! An acquisition timeout is *not* an error: `FramePump::acquire_frame` reports it
//! as `Ok(None)`.

use crate::capture::SlotState;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type CaptureResult<T> = std::result::Result<T, CaptureError>;

/// Every failure the capture pipeline reports.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// A device or file operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Figment could not load or extract the settings.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Settings loaded but are out of range.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The device node could not be opened or queried.
    #[error("Failed to open capture device '{device}': {source}")]
    DeviceOpen {
        device: String,
        #[source]
        source: std::io::Error,
    },

    /// The device cannot stream the requested format.
    #[error("Capture device '{device}' does not support {format}")]
    UnsupportedFormat { device: String, format: String },

    /// Fewer than two buffer slots were granted.
    #[error("Insufficient buffer memory: {granted} slot(s) granted, at least 2 required")]
    InsufficientBuffers { granted: usize },

    /// A slot index beyond the pool.
    #[error("Slot index {index} out of range ({count} slots)")]
    SlotOutOfRange { index: usize, count: usize },

    /// The hardware reported a slot it does not own.
    #[error("Slot {index} is not queued to hardware (state {state:?})")]
    SlotNotQueued { index: usize, state: SlotState },

    /// A slot was released or read without being lent out.
    #[error("Slot {index} is not owned by the consumer (state {state:?})")]
    SlotNotOwned { index: usize, state: SlotState },

    /// Only `Free` slots can be queued.
    #[error("Slot {index} is not free (state {state:?})")]
    SlotNotFree { index: usize, state: SlotState },

    /// A frame was requested before streaming started.
    #[error("Frame pump is not streaming")]
    NotStreaming,

    /// `set` named a parameter id with no device control.
    #[error("Unsupported device parameter {0}")]
    UnsupportedParameter(u32),

    /// The action cell is busy.
    #[error("An action is already pending or executing")]
    ActionInProgress,

    /// The worker thread has exited.
    #[error("Capture worker has stopped")]
    WorkerStopped,
}

impl From<figment::Error> for CaptureError {
    fn from(err: figment::Error) -> Self {
        CaptureError::Config(Box::new(err))
    }
}
