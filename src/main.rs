//! Command-line entry point.
//!
//! ```bash
//! # Serve the TCP command interface for /dev/video1 on port 1235
//! highlight_daq serve --device /dev/video1
//!
//! # Write one frame to a0.gray
//! highlight_daq capture
//!
//! # Stream highlight records from two cameras to stdout
//! highlight_daq track /dev/video0 /dev/video1
//!
//! # Same, without hardware
//! highlight_daq --simulate track --iterations 10
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use highlight_daq::capture::{
    CaptureDevice, FrameFormat, FramePump, PixelFormat, SimulatedCamera, Spot, SyntheticScene,
};
use highlight_daq::config::Settings;
use highlight_daq::highlights::{HighlightSink, HighlightTracker, TextHighlightWriter};
use highlight_daq::server::CommandServer;
use highlight_daq::storage::GrayFileSink;
use highlight_daq::worker::{ActionOutcome, ActionRequest, WorkerCoordinator};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// Frame period of the simulated camera (about 30 fps).
const SIMULATED_FRAME_INTERVAL: Duration = Duration::from_millis(33);

#[derive(Parser)]
#[command(name = "highlight_daq")]
#[command(about = "Camera capture worker with online highlight tracking", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use a simulated camera instead of V4L2 hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the TCP command interface for one device
    Serve {
        /// Device node, overrides device.path
        #[arg(long)]
        device: Option<PathBuf>,
    },

    /// Capture one frame into <stem><device>.gray
    Capture {
        /// Device node, overrides device.path
        #[arg(long)]
        device: Option<PathBuf>,
    },

    /// Track highlights on one or more devices, records to stdout
    Track {
        /// Frames per device
        #[arg(long, default_value = "2000")]
        iterations: u64,

        /// Device nodes, in output order. Defaults to device.path
        devices: Vec<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;
    settings.device.simulate |= cli.simulate;
    highlight_daq::logging::init(&settings.logging.level, settings.logging.json)?;
    if !settings.device.simulate && !cfg!(all(feature = "v4l2_hardware", target_os = "linux")) {
        warn!("Built without the v4l2_hardware feature, using the simulated camera");
        settings.device.simulate = true;
    }

    match cli.command {
        Commands::Serve { device } => {
            override_device(&mut settings, device);
            serve(settings).await
        }
        Commands::Capture { device } => {
            override_device(&mut settings, device);
            tokio::task::spawn_blocking(move || capture(&settings)).await?
        }
        Commands::Track {
            iterations,
            devices,
        } => tokio::task::spawn_blocking(move || track(&settings, devices, iterations)).await?,
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

fn override_device(settings: &mut Settings, device: Option<PathBuf>) {
    if let Some(path) = device {
        settings.device.path = path;
    }
}

// =============================================================================
// Device selection
// =============================================================================

fn simulated_camera(name: String, settings: &Settings) -> SimulatedCamera {
    let (width, height) = (settings.device.width, settings.device.height);
    let scene = SyntheticScene::spots(
        width,
        height,
        16,
        &[
            Spot {
                x: width / 4,
                y: height / 3,
                width: 12,
                height: 8,
                level: 240,
            },
            Spot {
                x: width * 2 / 3,
                y: height / 2,
                width: 6,
                height: 6,
                level: 225,
            },
        ],
    );
    SimulatedCamera::new(name, FrameFormat::packed(width, height, PixelFormat::Yuyv), scene)
        .with_slot_limit(settings.device.buffers)
        .with_frame_interval(SIMULATED_FRAME_INTERVAL)
}

fn simulated_pump(name: String, settings: &Settings) -> Result<FramePump<SimulatedCamera>> {
    FramePump::open(simulated_camera(name, settings), settings.device.buffers)
        .context("Failed to open simulated camera")
}

#[cfg(all(feature = "v4l2_hardware", target_os = "linux"))]
fn hardware_pump(
    path: &std::path::Path,
    settings: &Settings,
) -> Result<FramePump<highlight_daq::capture::V4l2Camera>> {
    let camera =
        highlight_daq::capture::V4l2Camera::open(path, settings.device.width, settings.device.height)
            .with_context(|| format!("Failed to open {}", path.display()))?;
    FramePump::open(camera, settings.device.buffers)
        .with_context(|| format!("Failed to map buffers of {}", path.display()))
}

// =============================================================================
// serve
// =============================================================================

async fn serve(settings: Settings) -> Result<()> {
    #[cfg(all(feature = "v4l2_hardware", target_os = "linux"))]
    if !settings.device.simulate {
        let pump = hardware_pump(&settings.device.path, &settings)?;
        return serve_with(pump, &settings).await;
    }

    let name = format!("sim{}", settings.device_index());
    let pump = simulated_pump(name, &settings)?;
    serve_with(pump, &settings).await
}

async fn serve_with<D: CaptureDevice + 'static>(pump: FramePump<D>, settings: &Settings) -> Result<()> {
    let device = settings.device_index();
    let coordinator = WorkerCoordinator::spawn(
        pump,
        HighlightTracker::new(settings.tracker),
        Box::new(TextHighlightWriter::new(std::io::stdout(), 1)),
        Box::new(GrayFileSink::new(
            settings.storage.output_dir.clone(),
            settings.storage.file_stem.clone(),
        )),
        settings.worker_config(),
    )
    .context("Failed to start capture worker")?;

    let server = CommandServer::bind(settings.listen_addr(), coordinator.handle())
        .await
        .with_context(|| format!("Failed to bind {}", settings.listen_addr()))?;
    info!(device, addr = %server.local_addr()?, "Ready");

    let shutdown = server.shutdown_handle();
    let worker = coordinator.handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Signal received, shutting down");
        worker.halt();
        shutdown.trigger();
    });

    let served = server.run().await;
    tokio::task::spawn_blocking(move || coordinator.shutdown()).await?;
    served.context("Command server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

// =============================================================================
// capture
// =============================================================================

fn capture(settings: &Settings) -> Result<()> {
    #[cfg(all(feature = "v4l2_hardware", target_os = "linux"))]
    if !settings.device.simulate {
        return capture_with(hardware_pump(&settings.device.path, settings)?, settings);
    }

    let name = format!("sim{}", settings.device_index());
    capture_with(simulated_pump(name, settings)?, settings)
}

fn capture_with<D: CaptureDevice + 'static>(pump: FramePump<D>, settings: &Settings) -> Result<()> {
    let storage = GrayFileSink::new(
        settings.storage.output_dir.clone(),
        settings.storage.file_stem.clone(),
    );
    let path = storage.path_for(settings.device_index());
    let coordinator = WorkerCoordinator::spawn(
        pump,
        HighlightTracker::new(settings.tracker),
        Box::new(TextHighlightWriter::new(std::io::sink(), 1)),
        Box::new(storage),
        settings.worker_config(),
    )
    .context("Failed to start capture worker")?;

    let outcome = coordinator
        .handle()
        .execute(ActionRequest::capture().with_flush())?;
    coordinator.shutdown();

    match outcome {
        ActionOutcome::Completed => {
            info!(path = %path.display(), "Frame captured");
            Ok(())
        }
        ActionOutcome::TimedOut => bail!("No frame within {:?}", settings.worker_config().capture_timeout),
        other => bail!("Capture failed: {other:?}"),
    }
}

// =============================================================================
// track
// =============================================================================

fn track(settings: &Settings, devices: Vec<PathBuf>, iterations: u64) -> Result<()> {
    let devices = if devices.is_empty() {
        vec![settings.device.path.clone()]
    } else {
        devices
    };

    #[cfg(all(feature = "v4l2_hardware", target_os = "linux"))]
    if !settings.device.simulate {
        let pumps = devices
            .iter()
            .map(|path| hardware_pump(path, settings))
            .collect::<Result<Vec<_>>>()?;
        return track_with(pumps, settings, iterations);
    }
    let pumps = (0..devices.len())
        .map(|index| simulated_pump(format!("sim{index}"), settings))
        .collect::<Result<Vec<_>>>()?;
    track_with(pumps, settings, iterations)
}

/// Round-robin over the devices, one frame each per iteration, writing one
/// record line per iteration.
fn track_with<D: CaptureDevice>(
    mut pumps: Vec<FramePump<D>>,
    settings: &Settings,
    iterations: u64,
) -> Result<()> {
    let timeout = settings.worker_config().capture_timeout;
    let mut trackers: Vec<HighlightTracker> = pumps
        .iter()
        .map(|_| HighlightTracker::new(settings.tracker))
        .collect();
    let mut sink = TextHighlightWriter::new(std::io::stdout(), pumps.len());

    for pump in &mut pumps {
        pump.start()
            .with_context(|| format!("Failed to start {}", pump.device_name()))?;
    }
    info!(devices = pumps.len(), iterations, "Tracking highlights");

    for _ in 0..iterations {
        for (device, (pump, tracker)) in pumps.iter_mut().zip(&mut trackers).enumerate() {
            sink.session_start(device)?;
            let Some(guard) = pump.acquire_frame(timeout)? else {
                bail!("Device {device}: no frame within {timeout:?}");
            };
            for highlight in tracker.track_frame(&guard.frame()) {
                sink.highlight(device, highlight)?;
            }
            guard.release()?;
            sink.session_end(device)?;
        }
    }

    for (device, tracker) in trackers.iter().enumerate() {
        if tracker.dropped_intervals() > 0 {
            warn!(
                device,
                dropped = tracker.dropped_intervals(),
                "Intervals dropped because the track arena was full"
            );
        }
    }
    Ok(())
}
