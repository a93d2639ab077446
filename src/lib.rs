//! Frame capture worker with online highlight tracking.
//!
//! The crate drives a streaming camera through a fixed pool of hardware
//! buffers, finds bright blobs in each frame with a single scanline pass, and
//! exposes capture, accumulation, tracking and threshold actions to a TCP
//! command interface through a one-request-at-a-time worker.
//!
//! - [`capture`]: buffer slot ledger, frame pump and the device backends
//! - [`highlights`]: scanline blob tracker and its output sinks
//! - [`worker`]: the capture worker thread and its action cell
//! - [`server`] / [`protocol`]: the line-based TCP command interface
//! - [`storage`]: `.gray` image output for dumps and accumulations

pub mod capture;
pub mod config;
pub mod error;
pub mod highlights;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod worker;

pub use error::{CaptureError, CaptureResult};
