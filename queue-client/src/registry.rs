//! Session-scoped registry of pending events.
//!
//! The shared event stream writes into per-event inboxes; each job's driver
//! reads from its own inbox. The registry also owns the "is a stream open"
//! flag so that registering a job and deciding whether to open a connection
//! happen under one lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::ClientError;
use crate::protocol::ServerMessage;

/// An entry in a job's inbox.
#[derive(Debug, Clone)]
pub enum InboxItem {
    Message(ServerMessage),
    /// The stream ended before this job's terminal message.
    Closed(ClientError),
}

pub type InboxReceiver = mpsc::UnboundedReceiver<InboxItem>;

#[derive(Debug)]
struct Inbox {
    tx: mpsc::UnboundedSender<InboxItem>,
    rx: Option<InboxReceiver>,
}

impl Inbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }

    fn push(&self, item: InboxItem) {
        // The job may have been dropped already.
        let _ = self.tx.send(item);
    }
}

#[derive(Debug, Default)]
struct Inner {
    inboxes: HashMap<String, Inbox>,
    awaiting: HashSet<String>,
    completed: HashSet<String>,
    /// Submissions that posted their payload but have not registered yet.
    in_flight: usize,
    stream_open: bool,
    generation: u64,
    /// Bumped by every session reset.
    session: u64,
    stream_task: Option<JoinHandle<()>>,
}

impl Inner {
    fn inbox(&mut self, event_id: &str) -> &mut Inbox {
        self.inboxes
            .entry(event_id.to_string())
            .or_insert_with(Inbox::new)
    }

    fn drained(&self) -> bool {
        self.awaiting.is_empty() && self.in_flight == 0
    }

    fn sentinel_awaiting(&mut self, error: &ClientError) -> usize {
        let awaiting: Vec<String> = self.awaiting.drain().collect();
        for id in &awaiting {
            if let Some(inbox) = self.inboxes.get(id) {
                inbox.push(InboxItem::Closed(error.clone()));
            }
            self.completed.insert(id.clone());
        }
        awaiting.len()
    }
}

/// Outcome of delivering a job message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Buffered,
    /// The message was a duplicate terminal and was dropped.
    Dropped,
    /// Delivered, and the stream is now closed because nothing is pending.
    Drained,
}

/// Pending-event registry owned by one client.
#[derive(Debug, Default)]
pub struct PendingEvents {
    inner: Mutex<Inner>,
}

/// A submission that has not registered its event id yet. Keeps a
/// drain-closing stream open until the id is known.
#[derive(Debug)]
pub struct Reservation {
    registry: Arc<PendingEvents>,
    session: u64,
    active: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.active {
            let mut inner = self.registry.lock();
            inner.in_flight = inner.in_flight.saturating_sub(1);
        }
    }
}

impl PendingEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Announce a submission whose event id is not known yet.
    pub fn reserve(self: &Arc<Self>) -> Reservation {
        let mut inner = self.lock();
        inner.in_flight += 1;
        Reservation {
            registry: self.clone(),
            session: inner.session,
            active: true,
        }
    }

    /// Register `event_id` as awaiting its terminal message and make sure a
    /// stream is running. `spawn` is called with the new stream generation
    /// only when no stream is open. Returns the job's inbox.
    ///
    /// A submission that posted under a session which has since been reset
    /// gets an inbox that already holds `SessionReset`.
    pub fn register<F>(&self, mut reservation: Reservation, event_id: &str, spawn: F) -> InboxReceiver
    where
        F: FnOnce(u64) -> JoinHandle<()>,
    {
        let mut inner = self.lock();
        reservation.active = false;
        inner.in_flight = inner.in_flight.saturating_sub(1);

        if reservation.session != inner.session {
            debug!(event_id, "session reset before registration");
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(InboxItem::Closed(ClientError::SessionReset));
            return rx;
        }

        if !inner.completed.contains(event_id) {
            inner.awaiting.insert(event_id.to_string());
        }
        let rx = match inner.inbox(event_id).rx.take() {
            Some(rx) => rx,
            None => {
                // Registered twice: hand out a fresh inbox.
                let (tx, rx) = mpsc::unbounded_channel();
                inner
                    .inboxes
                    .insert(event_id.to_string(), Inbox { tx, rx: None });
                rx
            }
        };

        if !inner.stream_open && inner.awaiting.contains(event_id) {
            inner.stream_open = true;
            inner.generation += 1;
            debug!(generation = inner.generation, "opening event stream");
            let handle = spawn(inner.generation);
            inner.stream_task = Some(handle);
        }
        rx
    }

    /// Route a job message to its inbox.
    pub fn deliver(
        &self,
        generation: u64,
        event_id: &str,
        message: ServerMessage,
        terminal: bool,
        close_when_drained: bool,
    ) -> Delivery {
        let mut inner = self.lock();
        if inner.generation != generation {
            return Delivery::Dropped;
        }
        let delivery = if terminal {
            if inner.awaiting.remove(event_id) {
                inner.completed.insert(event_id.to_string());
                Delivery::Buffered
            } else if inner.completed.contains(event_id) {
                debug!(event_id, "dropping duplicate terminal message");
                Delivery::Dropped
            } else {
                // Completed before the submitter registered the id.
                inner.completed.insert(event_id.to_string());
                Delivery::Buffered
            }
        } else if inner.completed.contains(event_id) {
            Delivery::Dropped
        } else {
            Delivery::Buffered
        };
        if delivery == Delivery::Buffered {
            inner.inbox(event_id).push(InboxItem::Message(message));
        }

        // Abandoned jobs never deliver, so a dropped message can be the one
        // that drains the stream.
        if close_when_drained && inner.drained() {
            inner.stream_open = false;
            inner.stream_task = None;
            return Delivery::Drained;
        }
        delivery
    }

    /// Forget a job that stopped reading before its terminal message, for
    /// example because it was cancelled. Later messages for the id are
    /// dropped.
    pub fn abandon(&self, event_id: &str) {
        let mut inner = self.lock();
        if inner.awaiting.remove(event_id) {
            debug!(event_id, "job abandoned before its terminal message");
            inner.completed.insert(event_id.to_string());
        }
        inner.inboxes.remove(event_id);
    }

    /// Give every awaiting job the server-stopped message and close the stream.
    pub fn fan_out(&self, generation: u64, message: &ServerMessage) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        let awaiting: Vec<String> = inner.awaiting.drain().collect();
        for id in awaiting {
            inner.inbox(&id).push(InboxItem::Message(message.clone()));
            inner.completed.insert(id);
        }
        inner.stream_open = false;
        inner.stream_task = None;
    }

    /// Handle a graceful `close_stream`: the connection ends and the next
    /// submission opens a new one. Jobs still awaiting on this connection
    /// are unblocked with `StreamClosed`.
    pub fn close_requested(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        let count = inner.sentinel_awaiting(&ClientError::StreamClosed(
            "server closed the stream".to_string(),
        ));
        if count > 0 {
            debug!(count, "close_stream with jobs still awaiting");
        }
        inner.stream_open = false;
        inner.stream_task = None;
    }

    /// The stream failed or ended without a close message: every awaiting job
    /// receives `error`.
    pub fn fail_stream(&self, generation: u64, error: ClientError) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        let count = inner.sentinel_awaiting(&error);
        debug!(count, %error, "event stream lost");
        inner.stream_open = false;
        inner.stream_task = None;
    }

    /// Forget the session: fail awaiting jobs with `SessionReset` and stop the
    /// current stream.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.sentinel_awaiting(&ClientError::SessionReset);
        if let Some(task) = inner.stream_task.take() {
            task.abort();
        }
        inner.stream_open = false;
        inner.generation += 1;
        inner.session += 1;
        inner.inboxes.retain(|_, inbox| inbox.rx.is_none());
        inner.completed.clear();
    }

    /// Stop the stream task without touching pending jobs.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        if let Some(task) = inner.stream_task.take() {
            task.abort();
        }
        inner.stream_open = false;
        inner.generation += 1;
        inner.sentinel_awaiting(&ClientError::StreamClosed("client closed".into()));
    }

    pub fn is_stream_open(&self) -> bool {
        self.lock().stream_open
    }

    pub fn awaiting_count(&self) -> usize {
        self.lock().awaiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(json: &str) -> ServerMessage {
        ServerMessage::parse(json).unwrap()
    }

    fn completed(id: &str) -> ServerMessage {
        message(&format!(
            r#"{{"msg":"process_completed","event_id":"{}","output":{{"data":[1]}},"success":true}}"#,
            id
        ))
    }

    fn noop_task(_generation: u64) -> JoinHandle<()> {
        tokio::spawn(async {})
    }

    #[tokio::test]
    async fn test_single_stream_for_many_registrations() {
        let registry = PendingEvents::new();
        let spawned = Arc::new(AtomicUsize::new(0));
        let mut inboxes = Vec::new();
        for id in ["a", "b", "c"] {
            let reservation = registry.reserve();
            let spawned = spawned.clone();
            inboxes.push(registry.register(reservation, id, move |g| {
                spawned.fetch_add(1, Ordering::SeqCst);
                noop_task(g)
            }));
        }
        assert_eq!(spawned.load(Ordering::SeqCst), 1);
        assert_eq!(registry.awaiting_count(), 3);
        assert!(registry.is_stream_open());
    }

    #[tokio::test]
    async fn test_terminal_delivered_once() {
        let registry = PendingEvents::new();
        let mut rx = registry.register(registry.reserve(), "a", noop_task);

        assert_eq!(registry.deliver(1, "a", completed("a"), true, false), Delivery::Buffered);
        assert_eq!(registry.deliver(1, "a", completed("a"), true, false), Delivery::Dropped);

        assert!(matches!(rx.try_recv(), Ok(InboxItem::Message(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_messages_partitioned_by_event_id() {
        let registry = PendingEvents::new();
        let mut rx_a = registry.register(registry.reserve(), "a", noop_task);
        let mut rx_b = registry.register(registry.reserve(), "b", noop_task);

        registry.deliver(1, "b", message(r#"{"msg":"estimation","event_id":"b","rank":0}"#), false, false);
        registry.deliver(1, "a", completed("a"), true, false);

        match rx_a.try_recv() {
            Ok(InboxItem::Message(m)) => assert_eq!(m.event_id.as_deref(), Some("a")),
            other => panic!("Unexpected inbox item: {:?}", other),
        }
        match rx_b.try_recv() {
            Ok(InboxItem::Message(m)) => assert_eq!(m.event_id.as_deref(), Some("b")),
            other => panic!("Unexpected inbox item: {:?}", other),
        }
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_message_before_registration_is_buffered() {
        let registry = PendingEvents::new();
        let _first = registry.register(registry.reserve(), "x", noop_task);

        let reservation = registry.reserve();
        registry.deliver(1, "late", completed("late"), true, true);
        let mut rx = registry.register(reservation, "late", noop_task);

        assert!(matches!(rx.try_recv(), Ok(InboxItem::Message(_))));
        assert_eq!(registry.awaiting_count(), 1);
    }

    #[tokio::test]
    async fn test_drain_closes_only_when_requested() {
        let registry = PendingEvents::new();
        let _rx = registry.register(registry.reserve(), "a", noop_task);
        assert_eq!(registry.deliver(1, "a", completed("a"), true, true), Delivery::Drained);
        assert!(!registry.is_stream_open());

        let _rx = registry.register(registry.reserve(), "b", noop_task);
        assert_eq!(registry.deliver(2, "b", completed("b"), true, false), Delivery::Buffered);
        assert!(registry.is_stream_open());
    }

    #[tokio::test]
    async fn test_in_flight_submission_keeps_stream_open() {
        let registry = PendingEvents::new();
        let _rx = registry.register(registry.reserve(), "a", noop_task);
        let pending = registry.reserve();
        assert_eq!(registry.deliver(1, "a", completed("a"), true, true), Delivery::Buffered);
        assert!(registry.is_stream_open());
        drop(pending);
        registry.close_requested(1);
        assert!(!registry.is_stream_open());
    }

    #[tokio::test]
    async fn test_close_stream_unblocks_awaiting_jobs() {
        let registry = PendingEvents::new();
        let mut rx = registry.register(registry.reserve(), "a", noop_task);

        registry.close_requested(1);

        assert!(matches!(
            rx.try_recv(),
            Ok(InboxItem::Closed(ClientError::StreamClosed(_)))
        ));
        assert_eq!(registry.awaiting_count(), 0);
        assert!(!registry.is_stream_open());

        // The next submission opens a fresh stream.
        let _rx = registry.register(registry.reserve(), "b", noop_task);
        assert!(registry.is_stream_open());
    }

    #[tokio::test]
    async fn test_abandoned_job_leaves_awaiting_set() {
        let registry = PendingEvents::new();
        let _rx_a = registry.register(registry.reserve(), "a", noop_task);
        let mut rx_b = registry.register(registry.reserve(), "b", noop_task);

        registry.abandon("a");
        assert_eq!(registry.awaiting_count(), 1);

        // A late terminal for the abandoned job is dropped.
        assert_eq!(registry.deliver(1, "a", completed("a"), true, false), Delivery::Dropped);
        registry.deliver(1, "b", completed("b"), true, false);
        assert!(matches!(rx_b.try_recv(), Ok(InboxItem::Message(_))));
        assert_eq!(registry.awaiting_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoning_last_job_lets_stream_drain() {
        let registry = PendingEvents::new();
        let _rx = registry.register(registry.reserve(), "a", noop_task);
        registry.abandon("a");
        assert!(registry.is_stream_open());

        // The server still reports the cancelled job; that drains the stream.
        assert_eq!(registry.deliver(1, "a", completed("a"), true, true), Delivery::Drained);
        assert!(!registry.is_stream_open());
    }

    #[tokio::test]
    async fn test_reset_before_registration_fails_the_job() {
        let registry = PendingEvents::new();
        let spawned = Arc::new(AtomicUsize::new(0));
        let reservation = registry.reserve();

        registry.reset();

        let counter = spawned.clone();
        let mut rx = registry.register(reservation, "a", move |g| {
            counter.fetch_add(1, Ordering::SeqCst);
            noop_task(g)
        });
        assert!(matches!(
            rx.try_recv(),
            Ok(InboxItem::Closed(ClientError::SessionReset))
        ));
        assert_eq!(spawned.load(Ordering::SeqCst), 0);
        assert_eq!(registry.awaiting_count(), 0);
        assert!(!registry.is_stream_open());
    }

    #[tokio::test]
    async fn test_fail_stream_sentinels_awaiting_jobs() {
        let registry = PendingEvents::new();
        let mut rx_a = registry.register(registry.reserve(), "a", noop_task);
        let mut rx_b = registry.register(registry.reserve(), "b", noop_task);
        registry.deliver(1, "b", completed("b"), true, false);

        registry.fail_stream(1, ClientError::Transport("reset by peer".into()));

        assert!(matches!(
            rx_a.try_recv(),
            Ok(InboxItem::Closed(ClientError::Transport(_)))
        ));
        assert!(matches!(rx_b.try_recv(), Ok(InboxItem::Message(_))));
        assert!(rx_b.try_recv().is_err());
        assert!(!registry.is_stream_open());
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let registry = PendingEvents::new();
        let mut rx = registry.register(registry.reserve(), "a", noop_task);
        registry.reset();
        assert!(matches!(
            rx.try_recv(),
            Ok(InboxItem::Closed(ClientError::SessionReset))
        ));
        assert_eq!(registry.deliver(1, "a", completed("a"), true, false), Delivery::Dropped);
    }

    #[tokio::test]
    async fn test_fan_out_server_stopped() {
        let registry = PendingEvents::new();
        let mut rx_a = registry.register(registry.reserve(), "a", noop_task);
        let mut rx_b = registry.register(registry.reserve(), "b", noop_task);
        let stopped = message(r#"{"msg":"server_stopped"}"#);
        registry.fan_out(1, &stopped);
        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv() {
                Ok(InboxItem::Message(m)) => assert!(m.is_server_stopped()),
                other => panic!("Unexpected inbox item: {:?}", other),
            }
        }
        assert_eq!(registry.awaiting_count(), 0);
    }
}
