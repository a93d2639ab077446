//! Configuration loading using Figment.
//!
//! Settings are layered, lowest precedence first:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. environment variables prefixed with `HIGHLIGHT_`, with `__` separating
//!    nested keys
//!
//! # Environment Variable Overrides
//!
//! ```text
//! HIGHLIGHT_DEVICE__PATH=/dev/video2
//! HIGHLIGHT_TRACKER__THRESHOLDS__HIGH=220
//! HIGHLIGHT_LOGGING__LEVEL=debug
//! ```
//!
//! # Example file
//!
//! ```toml
//! [device]
//! path = "/dev/video1"
//! buffers = 4
//!
//! [tracker]
//! max_tracks = 4
//! thresholds = { high = 200, low = 150 }
//!
//! [server]
//! port_base = 1234
//! ```

use crate::error::{CaptureError, CaptureResult};
use crate::highlights::TrackerConfig;
use crate::worker::WorkerConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "HIGHLIGHT_";

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// `[device]`
    pub device: DeviceSettings,
    /// `[tracker]`
    pub tracker: TrackerConfig,
    /// `[worker]`
    pub worker: WorkerSettings,
    /// `[server]`
    pub server: ServerSettings,
    /// `[storage]`
    pub storage: StorageSettings,
    /// `[logging]`
    pub logging: LoggingSettings,
}

/// Capture device selection and format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Device node, e.g. `/dev/video0`.
    pub path: PathBuf,
    /// Index used for the listening port and output file names. Derived from
    /// the trailing digit of `path` when unset.
    pub index: Option<usize>,
    /// Requested frame width.
    pub width: u32,
    /// Requested frame height.
    pub height: u32,
    /// Buffer slots requested from the driver.
    pub buffers: usize,
    /// Use the simulated camera instead of the device node.
    pub simulate: bool,
}

/// Worker timings, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Bound on idle waits.
    pub poll_interval_ms: u64,
    /// Per-frame timeout of capturing actions.
    pub capture_timeout_ms: u64,
    /// Per-poll timeout while flushing.
    pub flush_poll_ms: u64,
    /// Pause between the two flush passes.
    pub flush_settle_ms: u64,
    /// Frames discarded per flush pass at most.
    pub flush_max_frames: usize,
}

/// Command server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Listening interface.
    pub bind_address: IpAddr,
    /// The server listens on `port_base + device index`.
    pub port_base: u16,
}

/// Dump and accumulation output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory for `.gray` files.
    pub output_dir: PathBuf,
    /// Files are named `<file_stem><device index>.gray`.
    pub file_stem: String,
}

/// Log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

// ============================================================================
// Defaults
// ============================================================================

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/video0"),
            index: None,
            width: 640,
            height: 480,
            buffers: 4,
            simulate: false,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        let defaults = WorkerConfig::default();
        Self {
            poll_interval_ms: duration_ms(defaults.poll_interval),
            capture_timeout_ms: duration_ms(defaults.capture_timeout),
            flush_poll_ms: duration_ms(defaults.flush_poll),
            flush_settle_ms: duration_ms(defaults.flush_settle),
            flush_max_frames: defaults.flush_max_frames,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_base: 1234,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            file_stem: "a".to_string(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl Settings {
    /// Defaults, then `path` if given, then environment overrides. Validated.
    pub fn load(path: Option<&Path>) -> CaptureResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the worker or tracker cannot run with.
    pub fn validate(&self) -> CaptureResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(CaptureError::Configuration(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.device.width == 0 || self.device.height == 0 {
            return Err(CaptureError::Configuration(format!(
                "Invalid device format {}x{}",
                self.device.width, self.device.height
            )));
        }

        if self.device.buffers < 2 {
            return Err(CaptureError::Configuration(format!(
                "device.buffers must be at least 2, got {}",
                self.device.buffers
            )));
        }

        if self.worker.poll_interval_ms == 0 || self.worker.capture_timeout_ms == 0 {
            return Err(CaptureError::Configuration(
                "worker.poll_interval_ms and worker.capture_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.storage.file_stem.is_empty() {
            return Err(CaptureError::Configuration(
                "storage.file_stem cannot be empty".to_string(),
            ));
        }

        self.tracker.validate()
    }

    /// Explicit `device.index`, else the trailing digit of the device path, else 0.
    #[must_use]
    pub fn device_index(&self) -> usize {
        self.device.index.unwrap_or_else(|| {
            self.device
                .path
                .to_string_lossy()
                .chars()
                .last()
                .and_then(|c| c.to_digit(10))
                .map_or(0, |digit| digit as usize)
        })
    }

    /// Address the command server listens on.
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        let offset = u16::try_from(self.device_index()).unwrap_or(0);
        SocketAddr::new(
            self.server.bind_address,
            self.server.port_base.saturating_add(offset),
        )
    }

    /// Worker timings and the device index for file names.
    #[must_use]
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            device_index: self.device_index(),
            session_device: 0,
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            capture_timeout: Duration::from_millis(self.worker.capture_timeout_ms),
            flush_poll: Duration::from_millis(self.worker.flush_poll_ms),
            flush_settle: Duration::from_millis(self.worker.flush_settle_ms),
            flush_max_frames: self.worker.flush_max_frames,
        }
    }

    /// Effective settings as TOML.
    pub fn to_toml(&self) -> CaptureResult<String> {
        toml::to_string_pretty(self).map_err(|e| CaptureError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.device.buffers, 4);
        assert_eq!(settings.tracker.thresholds.high, 200);
        assert_eq!(settings.tracker.thresholds.low, 150);
        assert_eq!(settings.worker_config(), WorkerConfig::default());
    }

    #[test]
    fn test_device_index_and_port() {
        let mut settings = Settings::default();
        settings.device.path = PathBuf::from("/dev/video3");
        assert_eq!(settings.device_index(), 3);
        assert_eq!(settings.listen_addr().port(), 1237);

        settings.device.index = Some(1);
        assert_eq!(settings.listen_addr().port(), 1235);
        assert_eq!(settings.worker_config().device_index, 1);
        assert_eq!(settings.worker_config().session_device, 0);

        settings.device.path = PathBuf::from("/dev/camera");
        settings.device.index = None;
        assert_eq!(settings.device_index(), 0);
    }

    #[test]
    fn test_load_file_and_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "highlight.toml",
                r#"
                [device]
                path = "/dev/video2"
                buffers = 3

                [tracker.thresholds]
                high = 220
                "#,
            )?;
            jail.set_env("HIGHLIGHT_LOGGING__LEVEL", "debug");
            jail.set_env("HIGHLIGHT_SERVER__PORT_BASE", "4000");

            let settings = Settings::load(Some(Path::new("highlight.toml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(settings.device.path, PathBuf::from("/dev/video2"));
            assert_eq!(settings.device.buffers, 3);
            assert_eq!(settings.tracker.thresholds.high, 220);
            assert_eq!(settings.tracker.thresholds.low, 150);
            assert_eq!(settings.logging.level, "debug");
            assert_eq!(settings.listen_addr().port(), 4002);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("HIGHLIGHT_TRACKER__THRESHOLDS__LOW", "250");
            let result = Settings::load(None);
            assert!(matches!(result, Err(CaptureError::Configuration(_))));
            Ok(())
        });
    }

    #[test]
    fn test_validation_errors() {
        let mut settings = Settings::default();
        settings.device.buffers = 1;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.logging.level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_round_trips_through_toml() {
        let text = Settings::default().to_toml().unwrap();
        assert!(text.contains("port_base = 1234"));
    }
}
