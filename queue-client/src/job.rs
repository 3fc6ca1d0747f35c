//! Caller-facing handle of a submitted call.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

use crate::communicator::Communicator;
use crate::config::ClientOptions;
use crate::endpoint::Output;
use crate::error::{ClientError, ClientResult};
use crate::invoke::Canceller;
use crate::status::{Status, StatusUpdate, Update};

pub(crate) const PENDING: u8 = 0;
pub(crate) const RUNNING: u8 = 1;
pub(crate) const CANCELLED: u8 = 2;

/// Move a job from pending to running. Fails if it was cancelled first.
pub(crate) fn try_start(state: &AtomicU8) -> bool {
    state
        .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

type ResultSlot = Option<ClientResult<Output>>;

/// A submitted call.
///
/// `result` waits for the final output. `status`, `outputs` and `is_done`
/// never block. Intermediate outputs of generator endpoints can be consumed
/// with [`Job::iter`] (blocking) or [`Job::updates`] (async).
pub struct Job {
    communicator: Option<Arc<Communicator>>,
    result: watch::Receiver<ResultSlot>,
    state: Arc<AtomicU8>,
    canceller: Option<Canceller>,
    runtime: Handle,
    backoff_min: Duration,
    backoff_max: Duration,
    update_poll: Duration,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("event_id", &self.event_id())
            .field("done", &self.is_done())
            .finish()
    }
}

impl Job {
    pub(crate) fn new(
        communicator: Option<Arc<Communicator>>,
        result: watch::Receiver<ResultSlot>,
        state: Arc<AtomicU8>,
        canceller: Option<Canceller>,
        runtime: Handle,
        options: &ClientOptions,
    ) -> Self {
        Self {
            communicator,
            result,
            state,
            canceller,
            runtime,
            backoff_min: Duration::from_millis(options.iteration_backoff_min_ms),
            backoff_max: Duration::from_millis(options.iteration_backoff_max_ms),
            update_poll: options.update_poll(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.result.borrow().is_some()
    }

    /// Event id assigned by the server, once known.
    pub fn event_id(&self) -> Option<String> {
        self.communicator.as_ref().and_then(|c| c.event_id())
    }

    fn cancel_requested(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
            || self
                .communicator
                .as_ref()
                .map(|c| c.should_cancel())
                .unwrap_or(false)
    }

    /// Latest known status. Never blocks and never fails: a failed job
    /// reports `Finished` with `success == Some(false)`. A requested cancel
    /// reports `Cancelled` unless the job already delivered its output.
    pub fn status(&self) -> StatusUpdate {
        let cancel_requested = self.cancel_requested();
        match self.result.borrow().as_ref() {
            Some(Ok(_)) => return StatusUpdate::finished(true),
            Some(Err(ClientError::Cancelled)) => return StatusUpdate::new(Status::Cancelled),
            Some(Err(_)) if !cancel_requested => return StatusUpdate::finished(false),
            _ => {}
        }
        if cancel_requested {
            return StatusUpdate::new(Status::Cancelled);
        }
        match &self.communicator {
            Some(comm) => comm.latest_status(),
            None => StatusUpdate::new(Status::Processing),
        }
    }

    fn delivered_output(&self) -> bool {
        matches!(self.result.borrow().as_ref(), Some(Ok(_)))
    }

    /// Wait for the final output. Calling it again returns the same value or
    /// error. A timeout only stops waiting; the job keeps running.
    pub async fn result(&self, timeout: Option<Duration>) -> ClientResult<Output> {
        let mut result = self.result.clone();
        let wait = async move {
            match result.wait_for(Option::is_some).await {
                Ok(slot) => slot.clone().unwrap_or(Err(ClientError::Cancelled)),
                Err(_) => Err(ClientError::Cancelled),
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| ClientError::Timeout)?,
            None => wait.await,
        }
    }

    /// Blocking form of [`Job::result`]. Must not be called from async code.
    pub fn wait(&self, timeout: Option<Duration>) -> ClientResult<Output> {
        self.runtime.block_on(self.result(timeout))
    }

    /// Outputs produced so far, final output included once the job is done.
    pub fn outputs(&self) -> Vec<Output> {
        self.communicator
            .as_ref()
            .map(|c| c.outputs())
            .unwrap_or_default()
    }

    /// Request cancellation. Always succeeds locally for streaming jobs; the
    /// remote side is asked to stop but may not. Cancelling a finished job
    /// keeps its result. Jobs without a communicator can only be cancelled
    /// before they start.
    pub fn cancel(&self) -> bool {
        match (&self.communicator, &self.canceller) {
            (Some(comm), canceller) => {
                if self.is_done() {
                    return true;
                }
                let _ = self.state.compare_exchange(
                    PENDING,
                    CANCELLED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                comm.mark_cancel_requested();
                if self.delivered_output() {
                    // Finished while the flag was being set.
                    return true;
                }
                if let Some(canceller) = canceller {
                    canceller.fire();
                }
                true
            }
            (None, _) => self
                .state
                .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
        }
    }

    /// Blocking iterator over outputs as they arrive. Must be driven from a
    /// thread that may block (for example inside `spawn_blocking`).
    pub fn iter(&self) -> JobIter<'_> {
        JobIter {
            job: self,
            next: 0,
        }
    }

    /// Stream of status changes and outputs. Only the first call receives
    /// updates; later calls get an empty stream.
    pub fn updates(&self) -> impl Stream<Item = Update> + Send + 'static {
        let receiver = self.communicator.as_ref().and_then(|c| c.take_updates());
        let state = UpdateState {
            receiver,
            result: self.result.clone(),
            poll: self.update_poll,
        };
        futures::stream::unfold(state, |mut state| async move {
            let update = state.next().await?;
            Some((update, state))
        })
    }
}

struct UpdateState {
    receiver: Option<mpsc::UnboundedReceiver<Update>>,
    result: watch::Receiver<ResultSlot>,
    poll: Duration,
}

impl UpdateState {
    /// Wait for the next update, checking for completion every `poll`.
    async fn next(&mut self) -> Option<Update> {
        let receiver = self.receiver.as_mut()?;
        loop {
            tokio::select! {
                biased;
                update = receiver.recv() => return update,
                _ = tokio::time::sleep(self.poll) => {}
            }
            if self.result.borrow().is_some() {
                return receiver.try_recv().ok();
            }
        }
    }
}

/// Iterator returned by [`Job::iter`].
pub struct JobIter<'a> {
    job: &'a Job,
    next: usize,
}

impl Iterator for JobIter<'_> {
    type Item = Output;

    /// Poll for the next unread output with capped exponential backoff. Ends
    /// once the job is finished or cancelled and every output has been read.
    fn next(&mut self) -> Option<Output> {
        let comm = self.job.communicator.as_ref()?;
        let mut delay = self.job.backoff_min;
        loop {
            if let Some(output) = comm.output_at(self.next) {
                self.next += 1;
                return Some(output);
            }
            if self.job.is_done() || self.job.cancel_requested() {
                let output = comm.output_at(self.next)?;
                self.next += 1;
                return Some(output);
            }
            std::thread::sleep(delay);
            delay = (delay * 2).min(self.job.backoff_max);
        }
    }
}
