//! Connection manager actor
//!
//! One task owns the transport handle, the pending retry timer and the
//! connection state. Commands from [`ConnectionHandle`], transport events and
//! the retry timer are all consumed by that task, so at most one handle is
//! ever alive and at most one retry is ever pending.

use super::health::{ConnectionStats, HealthMetrics, HealthMonitor};
use super::state::{
    determine_transition, log_state_transition, Action, ConnectionEvent, ConnectionState,
    RetryPolicy, RetryReason,
};
use crate::config::{ClientConfig, Endpoint};
use crate::error::{TelemetryError, TelemetryResult};
use crate::observability::metrics;
use crate::protocol::Reading;
use crate::transport::{
    DeliveryQos, EventSender, TaggedEvent, Transport, TransportEvent, TransportFactory,
};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn, Instrument};

const COMMAND_CAPACITY: usize = 8;
const TRANSPORT_EVENT_CAPACITY: usize = 64;

/// Output of the connection manager, consumed by the telemetry context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    StateChanged(ConnectionState),
    Reading(Reading),
}

#[derive(Debug)]
enum ManagerCommand {
    Reconnect,
    Shutdown,
}

enum Flow {
    Continue,
    Stop,
}

struct PendingRetry {
    reason: RetryReason,
    sleep: Pin<Box<Sleep>>,
}

/// Resolves when the pending retry fires; never resolves when none is pending
async fn next_retry(slot: &mut Option<PendingRetry>) -> RetryReason {
    match slot {
        Some(pending) => {
            pending.sleep.as_mut().await;
            pending.reason
        }
        None => std::future::pending().await,
    }
}

/// Control surface of a running connection manager
///
/// Dropping the handle stops the manager and disconnects the transport.
pub struct ConnectionHandle {
    commands: mpsc::Sender<ManagerCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    stats_rx: watch::Receiver<ConnectionStats>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Request a clean reconnect
    ///
    /// Requests issued while one is already queued are coalesced.
    pub fn reconnect(&self) -> TelemetryResult<()> {
        match self.commands.try_send(ManagerCommand::Reconnect) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(TelemetryError::ConnectionManagerStopped),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn health(&self) -> HealthMetrics {
        HealthMonitor::calculate_health_metrics(&self.stats_rx.borrow(), Instant::now())
    }

    /// Stop the manager and wait until the transport is released
    pub async fn shutdown(self) {
        let _ = self.commands.send(ManagerCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "Connection manager task ended abnormally");
        }
    }
}

/// Owns the broker session for one topic
pub struct ConnectionManager<F: TransportFactory> {
    factory: F,
    config: ClientConfig,
    endpoint: Endpoint,
    connect_timeout: Duration,
    policy: RetryPolicy,
    state: ConnectionState,
    generation: u64,
    transport: Option<F::Transport>,
    pending_retry: Option<PendingRetry>,
    events_tx: mpsc::Sender<TaggedEvent>,
    events_rx: mpsc::Receiver<TaggedEvent>,
    commands: mpsc::Receiver<ManagerCommand>,
    output: mpsc::Sender<ManagerEvent>,
    output_closed: bool,
    state_tx: watch::Sender<ConnectionState>,
    stats: ConnectionStats,
    stats_tx: watch::Sender<ConnectionStats>,
}

impl<F: TransportFactory> ConnectionManager<F> {
    /// Start the manager task and begin connecting immediately
    pub fn spawn(
        factory: F,
        config: &ClientConfig,
        output: mpsc::Sender<ManagerEvent>,
    ) -> TelemetryResult<ConnectionHandle> {
        config.validate()?;
        let endpoint = config.endpoint()?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (stats_tx, stats_rx) = watch::channel(ConnectionStats::default());

        let manager = Self {
            factory,
            config: config.clone(),
            endpoint,
            connect_timeout: config.connect_timeout(),
            policy: RetryPolicy::from(&config.retry),
            state: ConnectionState::Disconnected,
            generation: 0,
            transport: None,
            pending_retry: None,
            events_tx,
            events_rx,
            commands: commands_rx,
            output,
            output_closed: false,
            state_tx,
            stats: ConnectionStats::default(),
            stats_tx,
        };

        let task = tokio::spawn(manager.run());

        Ok(ConnectionHandle {
            commands: commands_tx,
            state_rx,
            stats_rx,
            task,
        })
    }

    async fn run(mut self) {
        info!(
            broker = %self.endpoint,
            topic = %self.config.mqtt.topic,
            "Connection manager started"
        );

        let mut flow = self.attempt_connect().await;
        while matches!(flow, Flow::Continue) && !self.output_closed {
            flow = tokio::select! {
                command = self.commands.recv() => self.handle_command(command).await,
                Some(tagged) = self.events_rx.recv() => {
                    self.handle_transport_event(tagged).await;
                    Flow::Continue
                }
                reason = next_retry(&mut self.pending_retry) => {
                    self.pending_retry = None;
                    debug!(?reason, "Retry timer fired");
                    self.attempt_connect().await
                }
            };
        }

        self.teardown().await;
    }

    async fn handle_command(&mut self, command: Option<ManagerCommand>) -> Flow {
        match command {
            Some(ManagerCommand::Reconnect) => {
                self.request_reconnect().await;
                Flow::Continue
            }
            Some(ManagerCommand::Shutdown) | None => Flow::Stop,
        }
    }

    /// Tear down any existing handle, then perform one handshake on a fresh one
    async fn attempt_connect(&mut self) -> Flow {
        self.release_transport().await;
        self.apply(ConnectionEvent::ConnectRequested).await;

        self.generation += 1;
        let generation = self.generation;
        metrics().connection_attempt();

        let mut transport = self
            .factory
            .create(EventSender::new(generation, self.events_tx.clone()));
        let endpoint = self.endpoint.clone();
        let credentials = self.config.credentials();
        let connect_timeout = self.connect_timeout;

        let span = crate::connection_span!(generation, broker = %endpoint);
        let outcome = tokio::select! {
            result = tokio::time::timeout(
                connect_timeout,
                transport.connect(&endpoint, credentials.as_ref()),
            )
            .instrument(span) => Ok(result),
            command = self.commands.recv() => Err(command),
        };

        match outcome {
            Ok(Ok(Ok(()))) => {
                self.transport = Some(transport);
                self.on_handshake_succeeded().await;
                Flow::Continue
            }
            Ok(Ok(Err(e))) => {
                drop(transport);
                self.on_handshake_failed(e.to_string()).await;
                Flow::Continue
            }
            Ok(Err(_)) => {
                drop(transport);
                self.on_handshake_failed(format!(
                    "handshake timed out after {}s",
                    connect_timeout.as_secs()
                ))
                .await;
                Flow::Continue
            }
            Err(command) => {
                debug!(generation, "Connection attempt interrupted");
                drop(transport);
                self.handle_command(command).await
            }
        }
    }

    async fn on_handshake_succeeded(&mut self) {
        if self
            .apply(ConnectionEvent::HandshakeSucceeded)
            .await
            .is_none()
        {
            return;
        }

        metrics().connection_established();
        self.stats.record_connected(Instant::now());
        self.publish_stats();

        let topic = self.config.mqtt.topic.clone();
        let result = match self.transport.as_mut() {
            Some(transport) => transport
                .subscribe(&topic, DeliveryQos::AtMostOnce)
                .await
                .map_err(|e| e.to_string()),
            None => Err("no transport".to_string()),
        };

        if let Err(reason) = result {
            warn!(topic = %topic, error = %reason, "Subscribe failed");
            self.on_connection_lost(format!("subscribe failed: {reason}"))
                .await;
        }
    }

    async fn on_handshake_failed(&mut self, reason: String) {
        metrics().connection_failed();
        self.apply(ConnectionEvent::HandshakeFailed(reason)).await;
    }

    async fn on_connection_lost(&mut self, reason: String) {
        if self
            .apply(ConnectionEvent::ConnectionLost(reason))
            .await
            .is_none()
        {
            return;
        }

        metrics().connection_lost();
        self.stats.record_disconnected();
        self.publish_stats();
        self.release_transport().await;
    }

    /// Supersede any pending retry with a clean reconnect
    async fn request_reconnect(&mut self) {
        if let Some(pending) = self.pending_retry.take() {
            debug!(reason = ?pending.reason, "Cancelled pending retry");
        }

        self.release_transport().await;
        self.stats.record_disconnected();
        self.publish_stats();
        self.apply(ConnectionEvent::ReconnectRequested).await;
    }

    async fn handle_transport_event(&mut self, tagged: TaggedEvent) {
        if tagged.generation != self.generation || self.transport.is_none() {
            debug!(
                event_generation = tagged.generation,
                current_generation = self.generation,
                "Ignoring event from a released transport"
            );
            return;
        }

        match tagged.event {
            TransportEvent::Message { topic, payload } => {
                if self.state != ConnectionState::Connected {
                    return;
                }
                self.stats.record_message(Instant::now());

                match Reading::decode(&payload) {
                    Ok(reading) => {
                        metrics().reading_received();
                        self.send_output(ManagerEvent::Reading(reading)).await;
                    }
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Dropping malformed reading");
                        metrics().decode_failed();
                        self.stats.record_dropped();
                    }
                }
                self.publish_stats();
            }
            TransportEvent::ConnectionLost { reason } => {
                self.on_connection_lost(reason).await;
            }
        }
    }

    /// Apply a state machine event; performs retry scheduling itself
    async fn apply(&mut self, event: ConnectionEvent) -> Option<Action> {
        let transition = match determine_transition(self.state, &event) {
            Some(transition) => transition,
            None => {
                debug!(state = %self.state, ?event, "Event does not apply in current state");
                return None;
            }
        };

        let previous = self.state;
        self.state = transition.next;
        if previous != self.state || matches!(event, ConnectionEvent::ReconnectRequested) {
            log_state_transition(previous, self.state, &event);
        }

        self.state_tx.send_replace(self.state);
        metrics().set_connection_state(self.state.as_str());
        if previous != self.state {
            self.send_output(ManagerEvent::StateChanged(self.state))
                .await;
        }

        if let Action::ScheduleRetry(reason) = transition.action {
            self.schedule_retry(reason);
        }

        Some(transition.action)
    }

    /// Fill the single retry slot, replacing whatever was pending
    fn schedule_retry(&mut self, reason: RetryReason) {
        let delay = self.policy.delay_for(reason);
        let replaced = self.pending_retry.replace(PendingRetry {
            reason,
            sleep: Box::pin(tokio::time::sleep(delay)),
        });

        if let Some(previous) = replaced {
            debug!(reason = ?previous.reason, "Replaced pending retry");
        }
        info!(?reason, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
    }

    /// Disconnect and drop the current handle; events it already queued become stale
    async fn release_transport(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };

        if transport.is_connected() {
            if let Err(e) = transport.disconnect().await {
                warn!(generation = self.generation, error = %e, "Disconnect failed");
            }
        }
        drop(transport);
        self.generation += 1;
    }

    async fn teardown(&mut self) {
        if let Some(pending) = self.pending_retry.take() {
            debug!(reason = ?pending.reason, "Cancelled pending retry on shutdown");
        }
        self.release_transport().await;
        self.stats.record_disconnected();
        self.publish_stats();

        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Disconnected;
            self.state_tx.send_replace(self.state);
            metrics().set_connection_state(self.state.as_str());
            if !self.output_closed {
                let _ = self
                    .output
                    .try_send(ManagerEvent::StateChanged(self.state));
            }
        }

        info!("Connection manager stopped");
    }

    async fn send_output(&mut self, event: ManagerEvent) {
        if self.output_closed {
            return;
        }
        if self.output.send(event).await.is_err() {
            debug!("Manager output closed");
            self.output_closed = true;
        }
    }

    fn publish_stats(&self) {
        self.stats_tx.send_replace(self.stats.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ConnectOutcome, MockBroker, MockTransportFactory};
    use std::sync::Arc;

    struct Harness {
        handle: ConnectionHandle,
        broker: Arc<MockBroker>,
        output: mpsc::Receiver<ManagerEvent>,
    }

    fn start(outcomes: &[ConnectOutcome]) -> Harness {
        let (factory, broker) = MockTransportFactory::new();
        broker.script(outcomes.iter().copied());
        let (tx, output) = mpsc::channel(64);
        let handle = ConnectionManager::spawn(factory, &ClientConfig::test_config(), tx)
            .expect("manager should start");
        Harness {
            handle,
            broker,
            output,
        }
    }

    /// Let spawned tasks run without advancing the paused clock
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn advance(duration: Duration) {
        tokio::time::sleep(duration).await;
        settle().await;
    }

    fn reading_json(co2_1: i32) -> Vec<u8> {
        format!(
            r#"{{"timestamp":1000,"co2_1":{co2_1},"co2_2":400,"wifi_rssi":-60,"heap_free":100000,"device":"esp32-co2-01"}}"#
        )
        .into_bytes()
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_connect_subscribes_at_most_once() {
        // Arrange
        let h = start(&[ConnectOutcome::Succeed]);

        // Act
        settle().await;

        // Assert
        assert_eq!(h.handle.state(), ConnectionState::Connected);
        assert_eq!(
            h.broker.subscriptions(),
            vec![(
                "sensors/esp32-co2-01/data".to_string(),
                DeliveryQos::AtMostOnce
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_schedules_exactly_one_retry() {
        let h = start(&[ConnectOutcome::Fail]);
        settle().await;

        assert_eq!(h.handle.state(), ConnectionState::Error);
        assert_eq!(h.broker.connect_attempts(), 1);

        // Nothing happens before the 10s delay elapses
        advance(Duration::from_millis(9_900)).await;
        assert_eq!(h.broker.connect_attempts(), 1);

        advance(Duration::from_millis(200)).await;
        assert_eq!(h.broker.connect_attempts(), 2);
        assert_eq!(h.handle.state(), ConnectionState::Connected);

        // No further attempt is pending once connected
        advance(Duration::from_secs(60)).await;
        assert_eq!(h.broker.connect_attempts(), 2);
        assert_eq!(h.broker.max_live_handles(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_reconnect_cancels_pending_retry() {
        let h = start(&[ConnectOutcome::Fail]);
        settle().await;
        assert_eq!(h.handle.state(), ConnectionState::Error);

        // Two reconnect requests before the automatic retry fires
        h.handle.reconnect().unwrap();
        settle().await;
        h.handle.reconnect().unwrap();
        settle().await;
        assert_eq!(h.handle.state(), ConnectionState::Connecting);

        advance(Duration::from_millis(1_100)).await;
        assert_eq!(h.broker.connect_attempts(), 2);
        assert_eq!(h.handle.state(), ConnectionState::Connected);

        // The cancelled 10s retry never fires
        advance(Duration::from_secs(20)).await;
        assert_eq!(h.broker.connect_attempts(), 2);
        assert_eq!(h.broker.max_live_handles(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_while_connected_disconnects_first() {
        let h = start(&[ConnectOutcome::Succeed, ConnectOutcome::Succeed]);
        settle().await;
        assert_eq!(h.handle.state(), ConnectionState::Connected);

        h.handle.reconnect().unwrap();
        settle().await;

        assert_eq!(h.broker.disconnects(), 1);
        assert_eq!(h.broker.live_handles(), 0);
        assert_eq!(h.handle.state(), ConnectionState::Connecting);

        advance(Duration::from_millis(1_000)).await;
        assert_eq!(h.handle.state(), ConnectionState::Connected);
        assert_eq!(h.broker.handles_created(), 2);
        assert_eq!(h.broker.max_live_handles(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_retries_after_five_seconds() {
        let h = start(&[]);
        settle().await;
        assert_eq!(h.handle.state(), ConnectionState::Connected);

        assert!(h.broker.drop_connection("network down").await);
        settle().await;
        assert_eq!(h.handle.state(), ConnectionState::Disconnected);

        advance(Duration::from_millis(4_900)).await;
        assert_eq!(h.broker.connect_attempts(), 1);

        advance(Duration::from_millis(200)).await;
        assert_eq!(h.broker.connect_attempts(), 2);
        assert_eq!(h.handle.state(), ConnectionState::Connected);
        assert_eq!(h.handle.health().reconnect_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readings_are_forwarded_and_malformed_dropped() {
        let mut h = start(&[]);
        settle().await;

        assert!(h.broker.deliver(b"not json".to_vec()).await);
        assert!(h.broker.deliver(reading_json(1500)).await);
        settle().await;

        let mut readings = Vec::new();
        while let Ok(event) = h.output.try_recv() {
            if let ManagerEvent::Reading(reading) = event {
                readings.push(reading);
            }
        }
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].co2_1, 1500);

        // Decode failures never affect the connection
        assert_eq!(h.handle.state(), ConnectionState::Connected);
        assert_eq!(h.handle.health().dropped_messages, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_from_released_handle_are_ignored() {
        let mut h = start(&[ConnectOutcome::Succeed, ConnectOutcome::Succeed]);
        settle().await;
        let stale = h.broker.current_sender().expect("connected handle");

        h.handle.reconnect().unwrap();
        advance(Duration::from_millis(1_000)).await;
        assert_eq!(h.handle.state(), ConnectionState::Connected);
        while h.output.try_recv().is_ok() {}

        // Arrange: the old handle reports a loss and a message late
        stale
            .emit(TransportEvent::ConnectionLost {
                reason: "late".to_string(),
            })
            .await;
        stale
            .emit(TransportEvent::Message {
                topic: "sensors/esp32-co2-01/data".to_string(),
                payload: reading_json(900),
            })
            .await;
        settle().await;

        // Assert: neither affects the live session
        assert_eq!(h.handle.state(), ConnectionState::Connected);
        assert!(h.output.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_is_treated_as_loss() {
        let h = start(&[]);
        h.broker.set_fail_subscribe(true);
        settle().await;

        assert_eq!(h.handle.state(), ConnectionState::Disconnected);
        assert_eq!(h.broker.live_handles(), 0);

        h.broker.set_fail_subscribe(false);
        advance(Duration::from_secs(5)).await;
        assert_eq!(h.handle.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_subscription_after_ack_retries_as_loss() {
        // Arrange: subscribe call succeeds, SubAck refuses the topic
        let mut h = start(&[]);
        h.broker.set_reject_subscribe(true);

        // Act
        settle().await;

        // Assert: the session is dropped instead of sitting silently connected
        assert_eq!(h.handle.state(), ConnectionState::Disconnected);
        assert_eq!(h.broker.subscriptions().len(), 1);
        let mut states = Vec::new();
        while let Ok(ManagerEvent::StateChanged(state)) = h.output.try_recv() {
            states.push(state);
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
            ]
        );

        // The loss delay applies, then the next session subscribes normally
        h.broker.set_reject_subscribe(false);
        advance(Duration::from_millis(4_900)).await;
        assert_eq!(h.broker.connect_attempts(), 1);
        advance(Duration::from_millis(200)).await;
        assert_eq!(h.handle.state(), ConnectionState::Connected);
        assert_eq!(h.broker.connect_attempts(), 2);
        assert_eq!(h.broker.max_live_handles(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_handshake_times_out() {
        let h = start(&[ConnectOutcome::Hang]);
        settle().await;
        assert_eq!(h.handle.state(), ConnectionState::Connecting);

        // Default connect timeout is 30s, then the 10s failure delay
        advance(Duration::from_secs(30)).await;
        assert_eq!(h.handle.state(), ConnectionState::Error);

        advance(Duration::from_secs(10)).await;
        assert_eq!(h.handle.state(), ConnectionState::Connected);
        assert_eq!(h.broker.max_live_handles(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_transport() {
        let h = start(&[]);
        settle().await;
        let broker = h.broker.clone();
        let state = h.handle.watch_state();

        h.handle.shutdown().await;

        assert_eq!(broker.disconnects(), 1);
        assert_eq!(broker.live_handles(), 0);
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_shutdown_errors() {
        let h = start(&[]);
        settle().await;
        let ConnectionHandle {
            commands,
            state_rx: _,
            stats_rx: _,
            task,
        } = h.handle;
        commands.send(ManagerCommand::Shutdown).await.unwrap();
        task.await.unwrap();

        assert!(matches!(
            commands.try_send(ManagerCommand::Reconnect),
            Err(TrySendError::Closed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_changes_are_reported() {
        let mut h = start(&[ConnectOutcome::Fail]);
        settle().await;

        let mut states = Vec::new();
        while let Ok(ManagerEvent::StateChanged(state)) = h.output.try_recv() {
            states.push(state);
        }
        assert_eq!(
            states,
            vec![ConnectionState::Connecting, ConnectionState::Error]
        );
    }
}
