//! Supervised consumer loop
//!
//! One loop runs per subscribed stream:
//!
//! ```text
//! Starting ──▶ Running ──▶ Stopping ──▶ Stopped
//! ```
//!
//! In `Running` each raw delivery is decoded and handed to the stream's
//! callback. A delivery that cannot be decoded is acknowledged and dropped,
//! since retrying a structurally invalid message cannot succeed. A callback
//! that panics is contained and its message is dead-lettered; the loop keeps
//! going. Stopping lets the in-flight message finish and pulls nothing new.

use crate::envelope::Envelope;
use crate::port::{Acknowledgement, Delivery, EnvelopeCallback, Inbox};
use crate::stats::StatsRecorder;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    /// Spawned, not yet pulling.
    Starting,
    /// Pulling and dispatching messages.
    Running,
    /// Finishing the in-flight message; no new pulls.
    Stopping,
    /// Exited.
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsumerState::Starting => "starting",
            ConsumerState::Running => "running",
            ConsumerState::Stopping => "stopping",
            ConsumerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Consumer loop for one stream, ready to be spawned.
pub struct ConsumerLoop {
    stream: String,
    inbox: Box<dyn Inbox>,
    callback: Arc<dyn EnvelopeCallback>,
    stats: StatsRecorder,
}

impl ConsumerLoop {
    /// Create a loop pulling from `inbox` and dispatching to `callback`.
    pub fn new(
        stream: impl Into<String>,
        inbox: Box<dyn Inbox>,
        callback: Arc<dyn EnvelopeCallback>,
    ) -> Self {
        Self {
            stream: stream.into(),
            inbox,
            callback,
            stats: StatsRecorder::new(),
        }
    }

    /// Record counters into a shared recorder.
    pub fn with_stats(mut self, stats: StatsRecorder) -> Self {
        self.stats = stats;
        self
    }

    /// Spawn the loop on the current runtime.
    pub fn spawn(self) -> ConsumerHandle {
        let (state, _) = watch::channel(ConsumerState::Starting);
        let state = Arc::new(state);
        let in_flight = InFlight::default();
        let stream = self.stream.clone();
        let task = tokio::spawn(self.run(state.clone(), in_flight.clone()));

        ConsumerHandle {
            stream,
            state,
            task,
            in_flight,
        }
    }

    async fn run(self, state: Arc<watch::Sender<ConsumerState>>, in_flight: InFlight) {
        let ConsumerLoop {
            stream,
            mut inbox,
            callback,
            stats,
        } = self;
        let processor = Processor {
            stream,
            callback,
            stats,
            in_flight,
        };
        let mut signal = state.subscribe();

        state.send_if_modified(|s| {
            if *s == ConsumerState::Starting {
                *s = ConsumerState::Running;
                true
            } else {
                false
            }
        });
        info!(stream = %processor.stream, "Consumer loop running");

        loop {
            if *signal.borrow_and_update() == ConsumerState::Stopping {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = signal.changed() => continue,
                next = inbox.next() => next,
            };

            match next {
                Some(delivery) => processor.process(delivery).await,
                None => {
                    warn!(stream = %processor.stream, "Message source closed, consumer loop exiting");
                    break;
                }
            }
        }

        state.send_replace(ConsumerState::Stopped);
        info!(stream = %processor.stream, "Consumer loop stopped");
    }
}

/// Abort handle of the callback task currently running, if any.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<Option<AbortHandle>>>);

impl InFlight {
    fn set(&self, handle: Option<AbortHandle>) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = handle;
        }
    }

    fn abort(&self) -> bool {
        let handle = match self.0.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match handle {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

/// Decode, dispatch and settle side of the loop.
struct Processor {
    stream: String,
    callback: Arc<dyn EnvelopeCallback>,
    stats: StatsRecorder,
    in_flight: InFlight,
}

impl Processor {
    async fn process(&self, delivery: Delivery) {
        self.stats.delivered();

        let envelope = match Envelope::decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    stream = %self.stream,
                    error = %e,
                    redelivered = delivery.redelivered,
                    "Discarding malformed message"
                );
                self.stats.decode_failed();
                self.settle(delivery, Acknowledgement::Ack).await;
                return;
            }
        };

        let event_type = envelope.event_type().to_string();
        let correlation_id = envelope.correlation_id().to_string();
        debug!(
            stream = %self.stream,
            event_type = %event_type,
            correlation_id = %correlation_id,
            "Dispatching envelope"
        );

        // A separate task keeps a panicking callback from unwinding the loop
        let callback = self.callback.clone();
        let task = tokio::spawn(async move { callback.on_envelope(envelope).await });
        self.in_flight.set(Some(task.abort_handle()));
        let result = task.await;
        self.in_flight.set(None);

        let ack = match result {
            Ok(ack) => ack,
            Err(e) => {
                error!(
                    stream = %self.stream,
                    event_type = %event_type,
                    correlation_id = %correlation_id,
                    error = %e,
                    "Callback aborted, dead-lettering message"
                );
                Acknowledgement::DeadLetter
            }
        };

        self.settle(delivery, ack).await;
    }

    async fn settle(&self, delivery: Delivery, ack: Acknowledgement) {
        match ack {
            Acknowledgement::DeadLetter => self.stats.dead_lettered(),
            Acknowledgement::Requeue => self.stats.requeued(),
            Acknowledgement::Ack => {}
        }

        if let Err(e) = delivery.settle(ack).await {
            warn!(stream = %self.stream, ack = %ack, error = %e, "Failed to settle delivery");
        }
    }
}

/// Handle to a running consumer loop.
pub struct ConsumerHandle {
    stream: String,
    state: Arc<watch::Sender<ConsumerState>>,
    task: JoinHandle<()>,
    in_flight: InFlight,
}

impl fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("stream", &self.stream)
            .field("state", &self.state())
            .finish()
    }
}

impl ConsumerHandle {
    /// Stream this loop consumes.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Current state.
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Receiver for state transitions.
    pub fn watch(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Wait until the loop reaches `target` or has stopped.
    pub async fn wait_for(&self, target: ConsumerState) -> ConsumerState {
        let mut rx = self.state.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current == target || current == ConsumerState::Stopped {
                return current;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    /// Ask the loop to stop after its in-flight message.
    pub fn request_stop(&self) {
        self.state.send_if_modified(|s| match s {
            ConsumerState::Starting | ConsumerState::Running => {
                *s = ConsumerState::Stopping;
                true
            }
            _ => false,
        });
    }

    /// Stop gracefully and wait for the loop to exit.
    pub async fn stop(self) {
        self.request_stop();
        if let Err(e) = self.task.await {
            warn!(stream = %self.stream, error = %e, "Consumer task ended abnormally");
        }
    }

    /// Stop gracefully, abandoning the loop if it has not exited within `timeout`.
    ///
    /// An abandoned loop is aborted together with its in-flight callback.
    /// Returns `true` if the loop drained in time.
    pub async fn stop_within(self, timeout: Duration) -> bool {
        self.request_stop();

        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                task.abort();
                let callback_aborted = self.in_flight.abort();
                self.state.send_replace(ConsumerState::Stopped);
                warn!(
                    stream = %self.stream,
                    timeout_ms = timeout.as_millis() as u64,
                    callback_aborted,
                    "Consumer loop did not drain in time, abandoned"
                );
                false
            }
        }
    }
}
