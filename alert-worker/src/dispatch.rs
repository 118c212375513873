use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time;

use alert_common::event::Event;
use alert_common::metrics::{SINK_DELIVERIES, SINK_DELIVERY_DURATION, SINK_QUEUE_DROPPED};
use alert_common::sink::{AlertSink, SinkError, SinkRegistry};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of handing one event to one sink.
#[derive(Debug)]
pub struct SinkOutcome {
    pub sink_id: String,
    pub result: Result<(), SinkError>,
    pub elapsed: time::Duration,
}

const DEFAULT_SINK_QUEUE_CAPACITY: usize = 1024;

/// Fans admitted events out to every registered sink.
///
/// Sinks are called concurrently and each call is bounded by `sink_timeout`. A sink that fails,
/// panics or hangs only affects its own outcome. Deliveries are not retried.
#[derive(Clone)]
pub struct Dispatcher {
    registry: SinkRegistry,
    sink_timeout: time::Duration,
    queue_capacity: usize,
}

impl Dispatcher {
    pub fn new(registry: SinkRegistry, sink_timeout: time::Duration) -> Self {
        Self {
            registry,
            sink_timeout,
            queue_capacity: DEFAULT_SINK_QUEUE_CAPACITY,
        }
    }

    /// Number of events that may wait for any one sink. A sink that falls further behind
    /// loses new events; the other sinks are not affected.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Hand a single event to every sink at once and wait for all outcomes.
    pub async fn dispatch(&self, event: Arc<Event>) -> Vec<SinkOutcome> {
        let mut deliveries = JoinSet::new();

        for registration in self.registry.iter() {
            let sink_id = registration.id().to_owned();
            let sink = registration.sink();
            let event = event.clone();
            let sink_timeout = self.sink_timeout;

            deliveries.spawn(async move {
                deliver(sink_id, sink.as_ref(), &event, sink_timeout).await
            });
        }

        let mut outcomes = Vec::with_capacity(self.registry.len());
        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok(outcome) => {
                    record(&event, &outcome);
                    outcomes.push(outcome);
                }
                Err(e) => error!("sink delivery task failed: {}", e),
            }
        }

        outcomes
    }

    /// Deliver queued events until the queue closes.
    ///
    /// Every sink is served by its own task reading its own bounded queue, so each sink sees
    /// events in arrival order and a slow sink never holds back the others. Once `shutdown`
    /// fires the remaining events and in-flight deliveries get `grace` to complete, then they
    /// are abandoned.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<Arc<Event>>,
        shutdown: CancellationToken,
        grace: time::Duration,
    ) {
        let mut workers = JoinSet::new();
        let mut queues = Vec::with_capacity(self.registry.len());

        for registration in self.registry.iter() {
            let (tx, rx) = mpsc::channel(self.queue_capacity);
            workers.spawn(sink_worker(
                registration.id().to_owned(),
                registration.sink(),
                rx,
                self.sink_timeout,
            ));
            queues.push((registration.id().to_owned(), tx));
        }

        let distribute = async {
            while let Some(event) = events.recv().await {
                for (sink_id, queue) in queues.iter() {
                    if let Err(error) = queue.try_send(event.clone()) {
                        let reason = match error {
                            mpsc::error::TrySendError::Full(_) => "full",
                            mpsc::error::TrySendError::Closed(_) => "closed",
                        };
                        warn!(
                            sink = %sink_id,
                            reason,
                            kind = %event.kind(),
                            "sink queue unavailable, dropping event"
                        );
                        let labels = [("sink", sink_id.clone()), ("reason", reason.to_owned())];
                        metrics::counter!(SINK_QUEUE_DROPPED, &labels).increment(1);
                    }
                }
            }

            // Closed queues let every worker finish what it already holds.
            queues.clear();
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    error!("sink worker failed: {}", e);
                }
            }
        };
        let deadline = async {
            shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            _ = distribute => info!("event queue closed, all events dispatched"),
            _ = deadline => warn!(grace = ?grace, "abandoning undelivered events after grace period"),
        }

        workers.abort_all();
    }
}

async fn sink_worker(
    sink_id: String,
    sink: Arc<dyn AlertSink>,
    mut queue: mpsc::Receiver<Arc<Event>>,
    sink_timeout: time::Duration,
) {
    while let Some(event) = queue.recv().await {
        let outcome = deliver(sink_id.clone(), sink.as_ref(), &event, sink_timeout).await;
        record(&event, &outcome);
    }
}

async fn deliver(
    sink_id: String,
    sink: &dyn AlertSink,
    event: &Event,
    sink_timeout: time::Duration,
) -> SinkOutcome {
    let start = time::Instant::now();
    let delivery = AssertUnwindSafe(sink.accept(event)).catch_unwind();

    let result = match tokio::time::timeout(sink_timeout, delivery).await {
        Err(_) => Err(SinkError::Timeout(sink_timeout)),
        Ok(Err(panic)) => Err(SinkError::Crashed(panic_message(panic))),
        Ok(Ok(result)) => result,
    };

    SinkOutcome {
        sink_id,
        result,
        elapsed: start.elapsed(),
    }
}

fn record(event: &Event, outcome: &SinkOutcome) {
    let label = match &outcome.result {
        Ok(()) => "delivered",
        Err(e) => e.as_label(),
    };
    let labels = [
        ("sink", outcome.sink_id.clone()),
        ("outcome", label.to_owned()),
    ];

    metrics::counter!(SINK_DELIVERIES, &labels).increment(1);
    metrics::histogram!(SINK_DELIVERY_DURATION, &labels).record(outcome.elapsed.as_secs_f64());

    match &outcome.result {
        Ok(()) => debug!(
            sink = %outcome.sink_id,
            kind = %event.kind(),
            elapsed = ?outcome.elapsed,
            "event delivered"
        ),
        Err(e) => warn!(
            sink = %outcome.sink_id,
            kind = %event.kind(),
            error = %e,
            "event delivery failed"
        ),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "sink panicked".to_owned()
    }
}
