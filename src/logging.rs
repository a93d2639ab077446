//! Tracing subscriber setup.

use crate::error::{CaptureError, CaptureResult};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `level` when it is set. With `json` every
/// event is written as one JSON object per line. Output goes to stderr; stdout
/// carries highlight records.
pub fn init(level: &str, json: bool) -> CaptureResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| CaptureError::Configuration(format!("Invalid log filter: {e}")))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_writer(std::io::stderr);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| CaptureError::Configuration(format!("Logging already initialized: {e}")))
}
