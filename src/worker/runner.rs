//! The worker thread and its action implementations.

use super::cell::{SharedContext, WorkerHandle};
use super::{ActionFlags, ActionOutcome, ActionRequest};
use crate::capture::{CaptureDevice, DeviceParameter, DrainBudget, FrameGuard, FramePump};
use crate::error::{CaptureError, CaptureResult};
use crate::highlights::{HighlightSink, HighlightTracker};
use crate::storage::{Accumulation, CaptureSink};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Worker timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Device index reported to the capture sink (file names).
    pub device_index: usize,
    /// Device number used in highlight session markers. A single-device
    /// worker always writes complete groups as device 0.
    pub session_device: usize,
    /// Bound on every idle wait, worker and controller side.
    pub poll_interval: Duration,
    /// Timeout for each frame of CAPTURE, ACCUMULATE, TRACK and THRESHOLD.
    pub capture_timeout: Duration,
    /// Per-poll timeout while flushing.
    pub flush_poll: Duration,
    /// Pause between the two flush passes.
    pub flush_settle: Duration,
    /// Upper bound on frames discarded by one flush pass.
    pub flush_max_frames: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            session_device: 0,
            poll_interval: Duration::from_millis(1),
            capture_timeout: Duration::from_secs(4),
            flush_poll: Duration::from_millis(4),
            flush_settle: Duration::from_millis(100),
            flush_max_frames: 64,
        }
    }
}

/// Owns the worker thread.
///
/// Dropping the coordinator halts the worker and joins it.
pub struct WorkerCoordinator {
    handle: WorkerHandle,
    thread: Option<JoinHandle<()>>,
}

impl WorkerCoordinator {
    /// Start streaming on `pump` and move it into a new worker thread.
    pub fn spawn<D>(
        mut pump: FramePump<D>,
        tracker: HighlightTracker,
        highlights: Box<dyn HighlightSink>,
        storage: Box<dyn CaptureSink>,
        config: WorkerConfig,
    ) -> CaptureResult<Self>
    where
        D: CaptureDevice + 'static,
    {
        pump.start()?;

        let shared = Arc::new(SharedContext::new());
        shared.mark_running();
        let worker = Worker {
            pump,
            tracker,
            highlights,
            storage,
            config,
            shared: Arc::clone(&shared),
        };

        let spawned = std::thread::Builder::new()
            .name(format!("capture-worker-{}", config.device_index))
            .spawn(move || worker.run());
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                shared.mark_stopped();
                return Err(CaptureError::Io(e));
            }
        };

        Ok(Self {
            handle: WorkerHandle::new(shared, config.poll_interval),
            thread: Some(thread),
        })
    }

    /// Controller handle; clones share the action cell.
    #[must_use]
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Halt the worker and wait for its thread to exit.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.handle.halt();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Capture worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerCoordinator {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Marks the worker stopped however its thread exits, so controllers waiting
/// on an outcome are released even after a panic.
struct StopOnExit(Arc<SharedContext>);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        self.0.mark_stopped();
    }
}

/// One work item of a request.
type Step<D> = fn(&mut Worker<D>, &ActionRequest) -> ActionOutcome;

struct Worker<D: CaptureDevice> {
    pump: FramePump<D>,
    tracker: HighlightTracker,
    highlights: Box<dyn HighlightSink>,
    storage: Box<dyn CaptureSink>,
    config: WorkerConfig,
    shared: Arc<SharedContext>,
}

impl<D: CaptureDevice> Worker<D> {
    fn run(mut self) {
        let _stopped = StopOnExit(Arc::clone(&self.shared));
        info!(device = self.pump.device_name(), "Capture worker started");

        while !self.shared.halted() {
            let Some(request) = self.shared.next_request(self.config.poll_interval) else {
                continue;
            };
            debug!(actions = ?request.actions, frames = request.frames, "Executing action");
            let outcome = self.execute(&request);
            debug!(?outcome, "Action complete");
            self.shared.complete(outcome);
        }

        if let Err(e) = self.pump.stop() {
            warn!(error = %e, "Failed to stop streaming");
        }
        info!(device = self.pump.device_name(), "Capture worker stopped");
    }

    /// Run the work items in bit order. A timeout or failure skips the rest.
    fn execute(&mut self, request: &ActionRequest) -> ActionOutcome {
        let steps: [(ActionFlags, Step<D>); 6] = [
            (ActionFlags::FLUSH, |w, _| w.flush()),
            (ActionFlags::CAPTURE, |w, _| w.capture_one()),
            (ActionFlags::ACCUMULATE, |w, r| w.accumulate(r.frames)),
            (ActionFlags::TRACK_HIGHLIGHTS, |w, r| w.track(r.frames)),
            (ActionFlags::THRESHOLD, |w, r| w.threshold(r.level, r.frames)),
            (ActionFlags::SET_PARAMETER, |w, r| w.set_parameter(r.parameter)),
        ];

        let mut outcome = ActionOutcome::Completed;
        for (flag, step) in steps {
            if !request.actions.contains(flag) {
                continue;
            }
            outcome = step(self, request);
            if outcome.is_abort() {
                break;
            }
        }
        outcome
    }

    fn flush(&mut self) -> ActionOutcome {
        let budget = DrainBudget {
            poll_timeout: self.config.flush_poll,
            max_frames: self.config.flush_max_frames,
        };
        for pass in 0..2 {
            if pass > 0 {
                std::thread::sleep(self.config.flush_settle);
            }
            match self.pump.drain(budget) {
                Ok(drained) => debug!(pass, drained, "Flushed"),
                Err(e) => {
                    error!(pass, error = %e, "Flush failed");
                    return ActionOutcome::Failed;
                }
            }
        }
        ActionOutcome::Completed
    }

    fn capture_one(&mut self) -> ActionOutcome {
        let guard = match acquire(&mut self.pump, self.config.capture_timeout) {
            Ok(guard) => guard,
            Err(outcome) => return outcome,
        };
        let stored = self
            .storage
            .store_frame(self.config.device_index, &guard.frame());
        let released = guard.release();
        finish(stored.and(released), "capture")
    }

    fn accumulate(&mut self, frames: u32) -> ActionOutcome {
        let mut accumulation: Option<Accumulation> = None;
        let mut outcome = ActionOutcome::Completed;

        for _ in 0..frames {
            let guard = match acquire(&mut self.pump, self.config.capture_timeout) {
                Ok(guard) => guard,
                Err(aborted) => {
                    outcome = aborted;
                    break;
                }
            };
            {
                let frame = guard.frame();
                accumulation
                    .get_or_insert_with(|| Accumulation::new(frame.width(), frame.height()))
                    .add_frame(&frame);
            }
            if let Err(e) = guard.release() {
                error!(error = %e, "Failed to release frame during accumulation");
                outcome = ActionOutcome::Failed;
                break;
            }
        }

        if let Some(accumulation) = accumulation {
            let stored = self
                .storage
                .store_accumulation(self.config.device_index, &accumulation);
            if finish(stored, "accumulate") == ActionOutcome::Failed {
                outcome = ActionOutcome::Failed;
            }
        }
        outcome
    }

    fn track(&mut self, frames: u32) -> ActionOutcome {
        let device = self.config.session_device;

        for _ in 0..frames {
            if let Err(e) = self.highlights.session_start(device) {
                return finish(Err(e), "track");
            }
            let guard = match acquire(&mut self.pump, self.config.capture_timeout) {
                Ok(guard) => guard,
                Err(aborted) => {
                    if let Err(e) = self.highlights.session_end(device) {
                        warn!(error = %e, "Failed to close highlight session");
                    }
                    return aborted;
                }
            };

            let mut emitted = Ok(());
            {
                let frame = guard.frame();
                for track in self.tracker.track_frame(&frame) {
                    emitted = self.highlights.highlight(device, track);
                    if emitted.is_err() {
                        break;
                    }
                }
            }
            let result = emitted
                .and(guard.release())
                .and_then(|()| self.highlights.session_end(device));
            if finish(result, "track") == ActionOutcome::Failed {
                return ActionOutcome::Failed;
            }
        }
        ActionOutcome::Completed
    }

    fn threshold(&mut self, level: u8, frames: u32) -> ActionOutcome {
        let mut max_count = 0u64;

        for _ in 0..frames {
            let guard = match acquire(&mut self.pump, self.config.capture_timeout) {
                Ok(guard) => guard,
                Err(aborted) => return aborted,
            };
            let count = guard.frame().samples().filter(|&s| s > level).count() as u64;
            max_count = max_count.max(count);
            if let Err(e) = guard.release() {
                return finish(Err(e), "threshold");
            }
        }
        debug!(level, frames, max_count, "Threshold measured");
        ActionOutcome::Measured(max_count)
    }

    fn set_parameter(&mut self, parameter: Option<(DeviceParameter, i32)>) -> ActionOutcome {
        let Some((parameter, value)) = parameter else {
            warn!("SET_PARAMETER requested without a parameter");
            return ActionOutcome::Failed;
        };
        let result = self.pump.set_parameter(parameter, value);
        if result.is_ok() {
            info!(?parameter, value, "Device parameter set");
        }
        finish(result, "set_parameter")
    }
}

/// Acquire one frame, mapping timeout and errors to the outcome that ends the action.
fn acquire<D: CaptureDevice>(
    pump: &mut FramePump<D>,
    timeout: Duration,
) -> Result<FrameGuard<'_, D>, ActionOutcome> {
    match pump.acquire_frame(timeout) {
        Ok(Some(guard)) => Ok(guard),
        Ok(None) => {
            debug!(?timeout, "No frame within timeout");
            Err(ActionOutcome::TimedOut)
        }
        Err(e) => {
            error!(error = %e, "Frame acquisition failed");
            Err(ActionOutcome::Failed)
        }
    }
}

fn finish(result: CaptureResult<()>, action: &str) -> ActionOutcome {
    match result {
        Ok(()) => ActionOutcome::Completed,
        Err(e) => {
            error!(action, error = %e, "Action failed");
            ActionOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameFormat, PixelFormat, SimulatedCamera, SyntheticScene};
    use crate::highlights::CollectingSink;
    use crate::storage::MemorySink;

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            capture_timeout: Duration::from_millis(20),
            flush_poll: Duration::from_millis(1),
            flush_settle: Duration::from_millis(1),
            ..WorkerConfig::default()
        }
    }

    fn spawn(scene: SyntheticScene) -> (WorkerCoordinator, MemorySink, CollectingSink) {
        let format = FrameFormat::packed(4, 2, PixelFormat::Yuyv);
        let camera = SimulatedCamera::new("sim0", format, scene);
        let pump = FramePump::open(camera, 4).unwrap();
        let storage = MemorySink::new();
        let highlights = CollectingSink::new();
        let coordinator = WorkerCoordinator::spawn(
            pump,
            HighlightTracker::default(),
            Box::new(highlights.clone()),
            Box::new(storage.clone()),
            fast_config(),
        )
        .unwrap();
        (coordinator, storage, highlights)
    }

    #[test]
    fn test_capture_stores_one_frame() {
        let (worker, storage, _) = spawn(SyntheticScene::uniform(4, 2, 33));
        let outcome = worker.handle().execute(ActionRequest::capture()).unwrap();
        assert_eq!(outcome, ActionOutcome::Completed);

        let frames = storage.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples, vec![33; 8]);
    }

    #[test]
    fn test_capture_times_out_without_frames() {
        let (worker, storage, _) = spawn(SyntheticScene::uniform(4, 2, 0).limit(0));
        let outcome = worker.handle().execute(ActionRequest::capture()).unwrap();
        assert_eq!(outcome, ActionOutcome::TimedOut);
        assert!(storage.frames().is_empty());
    }

    #[test]
    fn test_threshold_reports_max_count() {
        let frames = vec![vec![0, 120, 0, 0, 0, 0, 0, 0], vec![120, 120, 120, 0, 0, 0, 0, 0]];
        let (worker, _, _) = spawn(SyntheticScene::from_frames(4, 2, frames));
        let outcome = worker
            .handle()
            .execute(ActionRequest::threshold(100, 2))
            .unwrap();
        assert_eq!(outcome, ActionOutcome::Measured(3));
    }

    #[test]
    fn test_track_zero_frames_completes() {
        let (worker, _, highlights) = spawn(SyntheticScene::uniform(4, 2, 255));
        let outcome = worker.handle().execute(ActionRequest::track(0)).unwrap();
        assert_eq!(outcome, ActionOutcome::Completed);
        assert!(highlights.events().is_empty());
    }

    #[test]
    fn test_timeout_skips_remaining_actions() {
        let (worker, storage, _) = spawn(SyntheticScene::uniform(4, 2, 0).limit(0));
        let request = ActionRequest {
            actions: ActionFlags::CAPTURE | ActionFlags::ACCUMULATE,
            frames: 2,
            ..ActionRequest::capture()
        };
        assert_eq!(
            worker.handle().execute(request).unwrap(),
            ActionOutcome::TimedOut
        );
        assert!(storage.accumulations().is_empty());
    }

    #[test]
    fn test_flush_failure_is_reported() {
        let format = FrameFormat::packed(4, 2, PixelFormat::Yuyv);
        let camera = SimulatedCamera::new("sim0", format, SyntheticScene::uniform(4, 2, 9));
        let probe = camera.probe();
        let storage = MemorySink::new();
        let worker = WorkerCoordinator::spawn(
            FramePump::open(camera, 4).unwrap(),
            HighlightTracker::default(),
            Box::new(CollectingSink::new()),
            Box::new(storage.clone()),
            fast_config(),
        )
        .unwrap();
        let handle = worker.handle();

        probe.fail_next_wait();
        assert_eq!(
            handle.execute(ActionRequest::flush()).unwrap(),
            ActionOutcome::Failed
        );

        probe.fail_next_wait();
        assert_eq!(
            handle.execute(ActionRequest::capture().with_flush()).unwrap(),
            ActionOutcome::Failed
        );
        assert!(storage.frames().is_empty());

        assert_eq!(
            handle.execute(ActionRequest::capture().with_flush()).unwrap(),
            ActionOutcome::Completed
        );
    }

    #[test]
    fn test_drop_stops_worker() {
        let (worker, _, _) = spawn(SyntheticScene::uniform(4, 2, 0));
        let handle = worker.handle();
        drop(worker);
        assert!(!handle.is_running());
        assert!(matches!(
            handle.submit(ActionRequest::flush()),
            Err(CaptureError::WorkerStopped)
        ));
    }
}
