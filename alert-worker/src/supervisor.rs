use std::fmt;
use std::sync::Arc;
use std::time;

use alert_common::dedup::Deduplicator;
use alert_common::event::Event;
use alert_common::metrics::{CONNECTION_STATE, CONNECTION_TRANSITIONS, RECONNECT_DELAY};
use alert_common::multipart::FrameSplitter;
use alert_common::retry::{Backoff, RetryPolicy};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::health::HealthHandle;
use crate::pipeline::{EventStage, Pipeline, StreamEnd};
use crate::reader::{ByteStreamReader, Connector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    Stalled,
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Stalled => "stalled",
            ConnectionState::Closing => "closing",
        }
    }

    fn as_gauge(&self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Streaming => 2.0,
            ConnectionState::Stalled => 3.0,
            ConnectionState::Closing => 4.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub retry_policy: RetryPolicy,
    pub read_idle_timeout: time::Duration,
    pub max_frame_size: usize,
    pub dedup_quiet_window: time::Duration,
    pub dedup_max_entries: usize,
    pub forward_inactive: bool,
}

/// Keeps the alert stream open for as long as the worker runs.
///
/// Every connection attempt gets a fresh reader and splitter. Failures, stalls and the device
/// closing the stream all lead to a reconnect after a backoff; only shutdown ends the loop. The
/// `Deduplicator` is kept across connections so a burst spanning a reconnect is still debounced.
pub struct Supervisor<C> {
    connector: C,
    settings: SupervisorSettings,
    dedup: Deduplicator,
    events: mpsc::Sender<Arc<Event>>,
    state: watch::Sender<ConnectionState>,
    liveness: HealthHandle,
    shutdown: CancellationToken,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(
        connector: C,
        settings: SupervisorSettings,
        events: mpsc::Sender<Arc<Event>>,
        liveness: HealthHandle,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            connector,
            dedup: Deduplicator::new(settings.dedup_quiet_window, settings.dedup_max_entries),
            settings,
            events,
            state,
            liveness,
            shutdown,
        }
    }

    /// Observe the connection state, e.g. for readiness probes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Run until shutdown is requested. Ends in `ConnectionState::Closing`.
    pub async fn run(mut self) {
        let mut backoff = Backoff::new(self.settings.retry_policy);

        while !self.shutdown.is_cancelled() {
            self.transition(ConnectionState::Connecting);

            let connected = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,
                connected = self.connector.connect() => connected,
            };

            match connected {
                Ok(connection) => {
                    self.dedup.reset_sequences();
                    self.transition(ConnectionState::Streaming);

                    let mut pipeline = Pipeline::new(
                        ByteStreamReader::new(
                            connection.body,
                            self.settings.read_idle_timeout,
                            self.shutdown.clone(),
                        ),
                        FrameSplitter::new(&connection.boundary, self.settings.max_frame_size),
                        EventStage::new(self.events.clone(), self.settings.forward_inactive),
                    );

                    let end = pipeline.run(&mut self.dedup, &self.liveness).await;
                    if pipeline.streamed_for() >= backoff.policy().maximum_interval() {
                        backoff.reset();
                    }
                    drop(pipeline);

                    match end {
                        StreamEnd::Cancelled => break,
                        StreamEnd::Ended => info!("device closed the alert stream"),
                        StreamEnd::Failed(error) => {
                            warn!(error = %error, "alert stream failed")
                        }
                        StreamEnd::Stalled(stall) => {
                            warn!(error = %stall, "alert stream stalled");
                            self.transition(ConnectionState::Stalled);
                        }
                    }
                }
                Err(error) => {
                    warn!(error = %error, attempt = backoff.attempt(), "failed to connect to device")
                }
            }

            self.transition(ConnectionState::Disconnected);

            let delay = backoff.next_delay();
            metrics::histogram!(RECONNECT_DELAY).record(delay.as_secs_f64());
            info!(delay = ?delay, "reconnecting to device");

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.transition(ConnectionState::Closing);
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        info!(from = %previous, to = %next, "connection state changed");

        metrics::counter!(CONNECTION_TRANSITIONS, &[("state", next.as_str())]).increment(1);
        metrics::gauge!(CONNECTION_STATE).set(next.as_gauge());
        self.liveness.report_healthy();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream::{self, StreamExt};
    use http::StatusCode;

    use alert_common::event::EventKind;

    use super::*;
    use crate::error::TransportError;
    use crate::health::HealthRegistry;
    use crate::reader::{ChunkStream, Connection};

    enum Step {
        Refuse,
        /// Send the chunks, then close the stream.
        Stream(Vec<String>),
        /// Send the chunks, then fail mid-stream.
        StreamThenFail(Vec<String>),
        /// Send one chunk every `gap`, then close the stream.
        Paced(Vec<String>, time::Duration),
        /// Accept the connection but never send anything.
        Silent,
    }

    /// Plays a script of connection attempts. Once the script is exhausted every connection
    /// stays open forever.
    struct ScriptedConnector {
        steps: Mutex<VecDeque<Step>>,
        attempts: Arc<Mutex<Vec<tokio::time::Instant>>>,
    }

    impl ScriptedConnector {
        fn new(steps: Vec<Step>) -> (Self, Arc<Mutex<Vec<tokio::time::Instant>>>) {
            let attempts = Arc::new(Mutex::new(Vec::new()));
            let connector = Self {
                steps: Mutex::new(steps.into()),
                attempts: attempts.clone(),
            };
            (connector, attempts)
        }
    }

    fn chunks(frames: Vec<String>) -> Vec<Result<Bytes, TransportError>> {
        frames.into_iter().map(|f| Ok(Bytes::from(f))).collect()
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self) -> Result<Connection, TransportError> {
            self.attempts
                .lock()
                .unwrap()
                .push(tokio::time::Instant::now());
            let step = self.steps.lock().unwrap().pop_front();

            let body: ChunkStream = match step {
                Some(Step::Refuse) => {
                    return Err(TransportError::UnexpectedStatus(
                        StatusCode::SERVICE_UNAVAILABLE,
                    ))
                }
                Some(Step::Stream(frames)) => stream::iter(chunks(frames)).boxed(),
                Some(Step::StreamThenFail(frames)) => {
                    let mut chunks = chunks(frames);
                    chunks.push(Err(TransportError::ReadError("connection reset".to_owned())));
                    stream::iter(chunks).boxed()
                }
                Some(Step::Paced(frames, gap)) => stream::iter(chunks(frames))
                    .then(move |chunk| async move {
                        tokio::time::sleep(gap).await;
                        chunk
                    })
                    .boxed(),
                Some(Step::Silent) | None => stream::pending().boxed(),
            };

            Ok(Connection {
                boundary: "boundary".to_owned(),
                body,
            })
        }
    }

    fn frame(event_type: &str, channel: u32) -> String {
        let body = format!(
            "<EventNotificationAlert><channelID>{channel}</channelID><eventType>{event_type}</eventType></EventNotificationAlert>"
        );
        format!(
            "--boundary\r\nContent-Type: application/xml\r\nContent-Length: {}\r\n\r\n{}\r\n",
            body.len(),
            body
        )
    }

    fn settings(retry_policy: RetryPolicy) -> SupervisorSettings {
        SupervisorSettings {
            retry_policy,
            read_idle_timeout: time::Duration::from_secs(30),
            max_frame_size: 64 * 1024,
            dedup_quiet_window: time::Duration::from_secs(5),
            dedup_max_entries: 128,
            forward_inactive: false,
        }
    }

    fn supervisor(
        connector: ScriptedConnector,
        retry_policy: RetryPolicy,
        shutdown: CancellationToken,
    ) -> (Supervisor<ScriptedConnector>, mpsc::Receiver<Arc<Event>>) {
        let (tx, rx) = mpsc::channel(16);
        let liveness = HealthRegistry::new("liveness")
            .register("supervisor".to_owned(), time::Duration::from_secs(60));
        let supervisor = Supervisor::new(connector, settings(retry_policy), tx, liveness, shutdown);
        (supervisor, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_transport_failure() {
        let (connector, attempts) = ScriptedConnector::new(vec![
            Step::Refuse,
            Step::StreamThenFail(vec![frame("doorbell", 1)]),
            Step::Stream(vec![frame("VMD", 2)]),
        ]);
        let shutdown = CancellationToken::new();
        let (supervisor, mut events) =
            supervisor(connector, RetryPolicy::default(), shutdown.clone());
        let mut state = supervisor.subscribe();
        let handle = tokio::spawn(supervisor.run());

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(first.kind(), &EventKind::DoorbellRing);
        assert_eq!(second.kind(), &EventKind::Motion);

        // The script is exhausted: the fourth connection stays open.
        state
            .wait_for(|s| *s == ConnectionState::Streaming && attempts.lock().unwrap().len() == 4)
            .await
            .unwrap();

        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Closing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_until_maximum() {
        let (connector, attempts) = ScriptedConnector::new(
            std::iter::repeat_with(|| Step::Refuse).take(6).collect(),
        );
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_millis(100),
            time::Duration::from_secs(1),
        );
        let shutdown = CancellationToken::new();
        let (supervisor, _events) = supervisor(connector, policy, shutdown.clone());
        let mut state = supervisor.subscribe();
        let handle = tokio::spawn(supervisor.run());

        state
            .wait_for(|s| *s == ConnectionState::Streaming)
            .await
            .unwrap();
        shutdown.cancel();
        handle.await.unwrap();

        let attempts = attempts.lock().unwrap();
        let gaps: Vec<_> = attempts
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect();
        let expected = [100, 200, 400, 800, 1000, 1000].map(time::Duration::from_millis);

        assert_eq!(gaps.len(), expected.len());
        for (gap, expected) in gaps.iter().zip(expected) {
            assert!(*gap >= expected, "{:?}", gaps);
            assert!(*gap < expected + time::Duration::from_millis(10), "{:?}", gaps);
        }
    }

    fn gaps(attempts: &[tokio::time::Instant]) -> Vec<time::Duration> {
        attempts.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_sustained_streaming() {
        let (connector, attempts) = ScriptedConnector::new(vec![
            Step::Refuse,
            Step::Refuse,
            Step::Refuse,
            Step::Paced(
                vec![frame("doorbell", 1), frame("VMD", 1), frame("tamper", 1)],
                time::Duration::from_millis(600),
            ),
        ]);
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_millis(100),
            time::Duration::from_secs(1),
        );
        let shutdown = CancellationToken::new();
        let (supervisor, _events) = supervisor(connector, policy, shutdown.clone());
        let mut state = supervisor.subscribe();
        let handle = tokio::spawn(supervisor.run());

        state
            .wait_for(|s| *s == ConnectionState::Streaming && attempts.lock().unwrap().len() == 5)
            .await
            .unwrap();
        shutdown.cancel();
        handle.await.unwrap();

        let gaps = gaps(&attempts.lock().unwrap());
        let expected = [100, 200, 400].map(time::Duration::from_millis);
        for (gap, expected) in gaps.iter().zip(expected) {
            assert!(*gap >= expected && *gap < expected + time::Duration::from_millis(10));
        }
        // Three chunks 600ms apart, then the initial 100ms delay instead of 800ms.
        let after_streaming = gaps[3];
        assert!(after_streaming >= time::Duration::from_millis(1900), "{:?}", gaps);
        assert!(after_streaming < time::Duration::from_millis(1910), "{:?}", gaps);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_does_not_reset_backoff() {
        let (connector, attempts) =
            ScriptedConnector::new(vec![Step::Refuse, Step::Refuse, Step::Silent]);
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_millis(100),
            time::Duration::from_secs(1),
        );
        let shutdown = CancellationToken::new();
        let (supervisor, _events) = supervisor(connector, policy, shutdown.clone());
        let mut state = supervisor.subscribe();
        let handle = tokio::spawn(supervisor.run());

        state
            .wait_for(|s| *s == ConnectionState::Streaming && attempts.lock().unwrap().len() == 4)
            .await
            .unwrap();
        shutdown.cancel();
        handle.await.unwrap();

        // The silent connection stayed open past the maximum interval but sent nothing, so the
        // streak continues at 400ms after the 30s idle timeout.
        let gaps = gaps(&attempts.lock().unwrap());
        let after_stall = gaps[2];
        assert!(after_stall >= time::Duration::from_millis(30_400), "{:?}", gaps);
        assert!(after_stall < time::Duration::from_millis(30_410), "{:?}", gaps);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_stream_is_reconnected() {
        let (connector, attempts) = ScriptedConnector::new(vec![Step::Silent]);
        let shutdown = CancellationToken::new();
        let (supervisor, _events) = supervisor(connector, RetryPolicy::default(), shutdown.clone());
        let mut state = supervisor.subscribe();
        let handle = tokio::spawn(supervisor.run());

        state
            .wait_for(|s| *s == ConnectionState::Streaming && attempts.lock().unwrap().len() == 2)
            .await
            .unwrap();

        shutdown.cancel();
        handle.await.unwrap();

        // The silent connection was only given up after the idle timeout.
        let attempts = attempts.lock().unwrap();
        assert!(attempts[1] - attempts[0] >= time::Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let (connector, attempts) = ScriptedConnector::new(vec![Step::Refuse]);
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_secs(3600),
            time::Duration::from_secs(3600),
        );
        let shutdown = CancellationToken::new();
        let (supervisor, _events) = supervisor(connector, policy, shutdown.clone());
        let mut state = supervisor.subscribe();
        let handle = tokio::spawn(supervisor.run());

        state
            .wait_for(|s| {
                *s == ConnectionState::Disconnected && attempts.lock().unwrap().len() == 1
            })
            .await
            .unwrap();
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(attempts.lock().unwrap().len(), 1);
        assert_eq!(*state.borrow(), ConnectionState::Closing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_alarm_across_reconnect_is_debounced() {
        let (connector, _attempts) = ScriptedConnector::new(vec![
            Step::Stream(vec![frame("doorbell", 1)]),
            Step::Stream(vec![frame("doorbell", 1), frame("tamper", 1)]),
        ]);
        let shutdown = CancellationToken::new();
        let (supervisor, mut events) =
            supervisor(connector, RetryPolicy::default(), shutdown.clone());
        let handle = tokio::spawn(supervisor.run());

        assert_eq!(events.recv().await.unwrap().kind(), &EventKind::DoorbellRing);
        assert_eq!(events.recv().await.unwrap().kind(), &EventKind::Tamper);

        shutdown.cancel();
        handle.await.unwrap();
        assert!(events.try_recv().is_err());
    }
}
