//! The action cell and the controller-side handle.
//!
//! All cross-thread state lives in [`SharedContext`]: the cell itself behind a
//! mutex that is only held for field reads and writes, a condvar for wakeups,
//! and two atomic flags. Waits on both sides are bounded by the poll interval,
//! so a missed notification costs at most one interval.

use super::{ActionOutcome, ActionRequest, WorkerState};
use crate::error::{CaptureError, CaptureResult};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default)]
struct ActionCell {
    pending: Option<ActionRequest>,
    executing: bool,
    outcome: Option<ActionOutcome>,
}

#[derive(Debug)]
pub(crate) struct SharedContext {
    cell: Mutex<ActionCell>,
    wake: Condvar,
    halt: AtomicBool,
    running: AtomicBool,
}

impl SharedContext {
    pub(crate) fn new() -> Self {
        Self {
            cell: Mutex::new(ActionCell::default()),
            wake: Condvar::new(),
            halt: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn mark_running(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_all();
    }

    pub(crate) fn halted(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }

    /// Worker side: take the pending request, waiting at most `idle` for one.
    pub(crate) fn next_request(&self, idle: Duration) -> Option<ActionRequest> {
        let mut cell = self.cell.lock();
        if cell.pending.is_none() && !self.halted() {
            self.wake.wait_for(&mut cell, idle);
        }
        let request = cell.pending.take()?;
        cell.executing = true;
        Some(request)
    }

    /// Worker side: publish the outcome of the request being executed.
    pub(crate) fn complete(&self, outcome: ActionOutcome) {
        let mut cell = self.cell.lock();
        cell.executing = false;
        cell.outcome = Some(outcome);
        drop(cell);
        self.wake.notify_all();
    }
}

/// Controller-side view of a running worker. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    shared: Arc<SharedContext>,
    poll_interval: Duration,
}

impl WorkerHandle {
    pub(crate) fn new(shared: Arc<SharedContext>, poll_interval: Duration) -> Self {
        Self {
            shared,
            poll_interval,
        }
    }

    /// Write a request into the cell.
    ///
    /// Rejects with [`CaptureError::ActionInProgress`] while another request is
    /// pending or executing and with [`CaptureError::WorkerStopped`] once the
    /// worker has been halted. An unconsumed previous outcome is discarded.
    pub fn submit(&self, request: ActionRequest) -> CaptureResult<()> {
        if self.shared.halted() || !self.shared.running.load(Ordering::SeqCst) {
            return Err(CaptureError::WorkerStopped);
        }
        let mut cell = self.shared.cell.lock();
        if cell.pending.is_some() || cell.executing {
            return Err(CaptureError::ActionInProgress);
        }
        cell.outcome = None;
        cell.pending = Some(request);
        drop(cell);

        debug!(actions = ?request.actions, frames = request.frames, "Action submitted");
        self.shared.wake.notify_all();
        Ok(())
    }

    /// Block until the submitted request completes and consume its outcome.
    ///
    /// Returns [`CaptureError::WorkerStopped`] if the worker exits while the
    /// request is still outstanding. An outcome that was published before the
    /// worker stopped is still returned.
    pub fn wait_for_completion(&self) -> CaptureResult<ActionOutcome> {
        let mut cell = self.shared.cell.lock();
        loop {
            if cell.pending.is_none() && !cell.executing {
                if let Some(outcome) = cell.outcome.take() {
                    return Ok(outcome);
                }
            }
            if !self.shared.running.load(Ordering::SeqCst) {
                return Err(CaptureError::WorkerStopped);
            }
            self.shared.wake.wait_for(&mut cell, self.poll_interval);
        }
    }

    /// Submit and wait.
    pub fn execute(&self, request: ActionRequest) -> CaptureResult<ActionOutcome> {
        self.submit(request)?;
        self.wait_for_completion()
    }

    /// Ask the worker to exit after its current action.
    pub fn halt(&self) {
        if !self.shared.halt.swap(true, Ordering::SeqCst) {
            debug!("Worker halt requested");
        }
        self.shared.wake.notify_all();
    }

    /// False once the worker thread has exited.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the action cell.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        if !self.is_running() {
            return WorkerState::Stopped;
        }
        let cell = self.shared.cell.lock();
        if cell.executing {
            WorkerState::Executing
        } else if cell.pending.is_some() {
            WorkerState::ActionPending
        } else if cell.outcome.is_some() {
            WorkerState::ActionComplete
        } else {
            WorkerState::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_handle() -> (Arc<SharedContext>, WorkerHandle) {
        let shared = Arc::new(SharedContext::new());
        shared.mark_running();
        let handle = WorkerHandle::new(Arc::clone(&shared), Duration::from_millis(1));
        (shared, handle)
    }

    #[test]
    fn test_submit_moves_to_pending() {
        let (_shared, handle) = running_handle();
        assert_eq!(handle.state(), WorkerState::Idle);
        handle.submit(ActionRequest::flush()).unwrap();
        assert_eq!(handle.state(), WorkerState::ActionPending);
    }

    #[test]
    fn test_second_submit_rejected_while_pending_or_executing() {
        let (shared, handle) = running_handle();
        handle.submit(ActionRequest::capture()).unwrap();
        assert!(matches!(
            handle.submit(ActionRequest::flush()),
            Err(CaptureError::ActionInProgress)
        ));

        let taken = shared.next_request(Duration::ZERO).unwrap();
        assert_eq!(taken, ActionRequest::capture());
        assert_eq!(handle.state(), WorkerState::Executing);
        assert!(matches!(
            handle.submit(ActionRequest::flush()),
            Err(CaptureError::ActionInProgress)
        ));
    }

    #[test]
    fn test_outcome_is_consumed_once() {
        let (shared, handle) = running_handle();
        handle.submit(ActionRequest::capture()).unwrap();
        shared.next_request(Duration::ZERO).unwrap();
        shared.complete(ActionOutcome::Completed);

        assert_eq!(handle.state(), WorkerState::ActionComplete);
        assert_eq!(handle.wait_for_completion().unwrap(), ActionOutcome::Completed);
        assert_eq!(handle.state(), WorkerState::Idle);
    }

    #[test]
    fn test_submit_discards_stale_outcome() {
        let (shared, handle) = running_handle();
        handle.submit(ActionRequest::capture()).unwrap();
        shared.next_request(Duration::ZERO).unwrap();
        shared.complete(ActionOutcome::Failed);

        handle.submit(ActionRequest::flush()).unwrap();
        shared.next_request(Duration::ZERO).unwrap();
        shared.complete(ActionOutcome::Completed);
        assert_eq!(handle.wait_for_completion().unwrap(), ActionOutcome::Completed);
    }

    #[test]
    fn test_wait_aborts_when_worker_stops() {
        let (shared, handle) = running_handle();
        handle.submit(ActionRequest::capture()).unwrap();
        shared.mark_stopped();
        assert!(matches!(
            handle.wait_for_completion(),
            Err(CaptureError::WorkerStopped)
        ));
    }

    #[test]
    fn test_published_outcome_survives_stop() {
        let (shared, handle) = running_handle();
        handle.submit(ActionRequest::capture()).unwrap();
        shared.next_request(Duration::ZERO).unwrap();
        shared.complete(ActionOutcome::TimedOut);
        shared.mark_stopped();
        assert_eq!(handle.wait_for_completion().unwrap(), ActionOutcome::TimedOut);
    }

    #[test]
    fn test_halt_rejects_new_requests() {
        let (_shared, handle) = running_handle();
        handle.halt();
        assert!(matches!(
            handle.submit(ActionRequest::flush()),
            Err(CaptureError::WorkerStopped)
        ));
    }

    #[test]
    fn test_idle_wait_is_bounded() {
        let (shared, _handle) = running_handle();
        assert!(shared.next_request(Duration::from_millis(1)).is_none());
    }
}
