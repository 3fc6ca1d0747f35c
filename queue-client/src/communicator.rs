//! Per-job state shared between the invocation task and the caller's `Job`.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::{mpsc, Notify};

use crate::endpoint::Output;
use crate::status::{OutputUpdate, Status, StatusUpdate, Update};

/// Read-only copy of a communicator's state.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub latest_status: StatusUpdate,
    pub outputs: Vec<Output>,
    pub should_cancel: bool,
    pub event_id: Option<String>,
}

#[derive(Debug)]
struct State {
    latest_status: StatusUpdate,
    /// A status was recorded since the job started.
    status_recorded: bool,
    outputs: Vec<Output>,
    /// The last output is the final one.
    has_final: bool,
    should_cancel: bool,
    event_id: Option<String>,
    /// Live update channel, present once an observer subscribed.
    updates: Option<mpsc::UnboundedSender<Update>>,
    subscribed: bool,
}

impl State {
    fn publish(&mut self, update: Update) {
        if let Some(tx) = &self.updates {
            if tx.send(update).is_err() {
                // The observer went away.
                self.updates = None;
            }
        }
    }
}

/// Lock-guarded status and output record for one job.
///
/// Every mutation goes through the lock; none of the methods block beyond it.
/// Observers that want to wait use [`Communicator::take_updates`] or poll.
#[derive(Debug)]
pub struct Communicator {
    state: Mutex<State>,
    cancel: Notify,
}

impl Default for Communicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Communicator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                latest_status: StatusUpdate::new(Status::Starting),
                status_recorded: false,
                outputs: Vec::new(),
                has_final: false,
                should_cancel: false,
                event_id: None,
                updates: None,
                subscribed: false,
            }),
            cancel: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave State half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Overwrite the latest status. Last write wins.
    pub fn record(&self, update: StatusUpdate) {
        let mut state = self.lock();
        state.latest_status = update.clone();
        state.status_recorded = true;
        state.publish(Update::Status(update));
    }

    /// Append an output. Returns its iteration index.
    pub fn append_output(&self, output: Output, is_final: bool) -> usize {
        let mut state = self.lock();
        state.outputs.push(output.clone());
        state.has_final = is_final;
        state.publish(Update::Output(OutputUpdate { output, is_final }));
        state.outputs.len() - 1
    }

    /// Append the final output unless the job already produced one.
    pub fn append_final_if_empty(&self, output: &Output) -> bool {
        let mut state = self.lock();
        if !state.outputs.is_empty() {
            return false;
        }
        state.outputs.push(output.clone());
        state.has_final = true;
        state.publish(Update::Output(OutputUpdate {
            output: output.clone(),
            is_final: true,
        }));
        true
    }

    /// Set the cancellation flag and wake the invocation task.
    pub fn mark_cancel_requested(&self) {
        self.lock().should_cancel = true;
        self.cancel.notify_one();
    }

    pub fn should_cancel(&self) -> bool {
        self.lock().should_cancel
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.cancel.notified();
            if self.should_cancel() {
                return;
            }
            notified.await;
        }
    }

    /// Record the event id. Only the first call has an effect.
    pub fn set_event_id(&self, event_id: &str) {
        let mut state = self.lock();
        if state.event_id.is_none() {
            state.event_id = Some(event_id.to_string());
        }
    }

    pub fn event_id(&self) -> Option<String> {
        self.lock().event_id.clone()
    }

    pub fn latest_status(&self) -> StatusUpdate {
        self.lock().latest_status.clone()
    }

    pub fn outputs(&self) -> Vec<Output> {
        self.lock().outputs.clone()
    }

    pub fn output_at(&self, index: usize) -> Option<Output> {
        self.lock().outputs.get(index).cloned()
    }

    pub fn read_snapshot(&self) -> Snapshot {
        let state = self.lock();
        Snapshot {
            latest_status: state.latest_status.clone(),
            outputs: state.outputs.clone(),
            should_cancel: state.should_cancel,
            event_id: state.event_id.clone(),
        }
    }

    /// Subscribe to updates. Only one subscriber may exist. Nothing is
    /// queued before this call: the receiver starts with the latest recorded
    /// status and the outputs so far, then follows live.
    pub fn take_updates(&self) -> Option<mpsc::UnboundedReceiver<Update>> {
        let mut state = self.lock();
        if state.subscribed {
            return None;
        }
        state.subscribed = true;

        let (tx, rx) = mpsc::unbounded_channel();
        if state.status_recorded {
            let _ = tx.send(Update::Status(state.latest_status.clone()));
        }
        let last = state.outputs.len().saturating_sub(1);
        for (index, output) in state.outputs.iter().enumerate() {
            let _ = tx.send(Update::Output(OutputUpdate {
                output: output.clone(),
                is_final: state.has_final && index == last,
            }));
        }
        state.updates = Some(tx);
        Some(rx)
    }
}
