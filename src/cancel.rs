//! Cooperative cancellation for batch runs.
//!
//! Each run gets a fresh [`CancellationToken`]. The orchestrator checks it at
//! item boundaries; a cancel request also forwards a stop signal to the
//! encoder invocation that is running at that moment.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::encoder::Encoder;

pub type RunId = u64;

struct RunState {
    run_id: RunId,
    token: CancellationToken,
    active_job: Option<u64>,
}

pub struct CancellationController {
    encoder: Arc<dyn Encoder>,
    next_run_id: Mutex<RunId>,
    current: Mutex<Option<RunState>>,
}

impl CancellationController {
    pub fn new(encoder: Arc<dyn Encoder>) -> Self {
        Self {
            encoder,
            next_run_id: Mutex::new(1),
            current: Mutex::new(None),
        }
    }

    /// Start tracking a new run. Any previous run's token is dropped, so the
    /// flag starts out clear.
    pub fn begin_run(&self) -> (RunId, CancellationToken) {
        let run_id = {
            let mut next = self.next_run_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        let token = CancellationToken::new();
        *self.current.lock() = Some(RunState {
            run_id,
            token: token.clone(),
            active_job: None,
        });
        (run_id, token)
    }

    /// Register `job_id` as the run's active encoder invocation. Returns
    /// false, registering nothing, when the run was already cancelled.
    pub fn begin_job(&self, run_id: RunId, job_id: u64) -> bool {
        let mut current = self.current.lock();
        match current.as_mut() {
            Some(state) if state.run_id == run_id && !state.token.is_cancelled() => {
                state.active_job = Some(job_id);
                true
            }
            _ => false,
        }
    }

    pub fn finish_job(&self, run_id: RunId, job_id: u64) {
        let mut current = self.current.lock();
        if let Some(state) = current.as_mut()
            && state.run_id == run_id
            && state.active_job == Some(job_id)
        {
            state.active_job = None;
        }
    }

    /// Set the run's flag and ask the active job to stop. Returns true only
    /// for the call that actually flipped the flag.
    pub fn request_cancel(&self, run_id: RunId) -> bool {
        let active_job = {
            let current = self.current.lock();
            match current.as_ref() {
                Some(state) if state.run_id == run_id && !state.token.is_cancelled() => {
                    state.token.cancel();
                    state.active_job
                }
                _ => return false,
            }
        };
        log::info!(
            target: "compresso::cancel",
            "Cancellation requested for run {} (active job: {:?})",
            run_id,
            active_job
        );
        if let Some(job_id) = active_job {
            self.encoder.cancel(job_id);
        }
        true
    }

    pub fn is_cancelled(&self, run_id: RunId) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|state| state.run_id == run_id && state.token.is_cancelled())
    }
}
