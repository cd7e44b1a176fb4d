//! Mock implementations for testing
//!
//! Provides a scriptable in-process broker with a matching transport and
//! factory, plus a notification sink that records what it was asked to show.

use crate::alert::Alert;
use crate::config::{Credentials, Endpoint};
use crate::error::TelemetryError;
use crate::notify::{NotificationSink, NotifyError};
use crate::transport::{DeliveryQos, EventSender, Transport, TransportEvent, TransportFactory};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// How the mock broker answers a handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Succeed,
    Fail,
    /// Never answer; the caller's timeout or cancellation decides
    Hang,
}

#[derive(Debug)]
struct BrokerState {
    script: VecDeque<ConnectOutcome>,
    default_outcome: ConnectOutcome,
    handles_created: usize,
    connect_attempts: usize,
    live_handles: usize,
    max_live_handles: usize,
    disconnects: usize,
    subscriptions: Vec<(String, DeliveryQos)>,
    fail_subscribe: bool,
    reject_subscribe: bool,
    current: Option<(EventSender, Arc<AtomicBool>)>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            script: VecDeque::new(),
            default_outcome: ConnectOutcome::Succeed,
            handles_created: 0,
            connect_attempts: 0,
            live_handles: 0,
            max_live_handles: 0,
            disconnects: 0,
            subscriptions: Vec::new(),
            fail_subscribe: false,
            reject_subscribe: false,
            current: None,
        }
    }
}

/// Scriptable in-process broker shared by every [`MockTransport`] a factory creates
#[derive(Debug, Default)]
pub struct MockBroker {
    state: Mutex<BrokerState>,
}

impl MockBroker {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue handshake outcomes; consumed one per connect call
    pub fn script(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.lock().script.extend(outcomes);
    }

    /// Outcome used once the script is exhausted
    pub fn set_default_outcome(&self, outcome: ConnectOutcome) {
        self.lock().default_outcome = outcome;
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.lock().fail_subscribe = fail;
    }

    /// Accept subscribe calls but answer with a refusing SubAck afterwards
    pub fn set_reject_subscribe(&self, reject: bool) {
        self.lock().reject_subscribe = reject;
    }

    pub fn handles_created(&self) -> usize {
        self.lock().handles_created
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn live_handles(&self) -> usize {
        self.lock().live_handles
    }

    /// Highest number of handles that were alive at the same time
    pub fn max_live_handles(&self) -> usize {
        self.lock().max_live_handles
    }

    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }

    pub fn subscriptions(&self) -> Vec<(String, DeliveryQos)> {
        self.lock().subscriptions.clone()
    }

    /// Event sender of the currently connected handle
    pub fn current_sender(&self) -> Option<EventSender> {
        self.lock().current.as_ref().map(|(sender, _)| sender.clone())
    }

    /// Publish a payload to the connected handle on the last subscribed topic
    pub async fn deliver(&self, payload: impl Into<Vec<u8>>) -> bool {
        let (sender, topic) = {
            let state = self.lock();
            let Some((sender, _)) = state.current.as_ref() else {
                return false;
            };
            let topic = state
                .subscriptions
                .last()
                .map(|(topic, _)| topic.clone())
                .unwrap_or_default();
            (sender.clone(), topic)
        };

        sender
            .emit(TransportEvent::Message {
                topic,
                payload: payload.into(),
            })
            .await
    }

    /// Simulate the broker dropping the connected handle
    pub async fn drop_connection(&self, reason: &str) -> bool {
        let current = self.lock().current.take();
        let Some((sender, connected)) = current else {
            return false;
        };
        connected.store(false, Ordering::SeqCst);
        sender
            .emit(TransportEvent::ConnectionLost {
                reason: reason.to_string(),
            })
            .await
    }
}

/// Transport handle backed by a [`MockBroker`]
#[derive(Debug)]
pub struct MockTransport {
    broker: Arc<MockBroker>,
    events: EventSender,
    connected: Arc<AtomicBool>,
}

impl MockTransport {
    fn release_current(&self) {
        let mut state = self.broker.lock();
        let is_current = state
            .current
            .as_ref()
            .is_some_and(|(sender, _)| sender.generation() == self.events.generation());
        if is_current {
            state.current = None;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = TelemetryError;

    async fn connect(
        &mut self,
        _endpoint: &Endpoint,
        _credentials: Option<&Credentials>,
    ) -> Result<(), TelemetryError> {
        let outcome = {
            let mut state = self.broker.lock();
            state.connect_attempts += 1;
            let default_outcome = state.default_outcome;
            state.script.pop_front().unwrap_or(default_outcome)
        };

        match outcome {
            ConnectOutcome::Succeed => {
                self.connected.store(true, Ordering::SeqCst);
                self.broker.lock().current = Some((self.events.clone(), self.connected.clone()));
                Ok(())
            }
            ConnectOutcome::Fail => Err(TelemetryError::internal_error(
                "mock broker refused connection",
            )),
            ConnectOutcome::Hang => std::future::pending().await,
        }
    }

    async fn subscribe(&mut self, topic: &str, qos: DeliveryQos) -> Result<(), TelemetryError> {
        let rejected = {
            let mut state = self.broker.lock();
            if state.fail_subscribe || !self.connected.load(Ordering::SeqCst) {
                return Err(TelemetryError::internal_error("mock subscribe failed"));
            }
            state.subscriptions.push((topic.to_string(), qos));
            state.reject_subscribe
        };

        // The request itself succeeds; the refusal arrives as a later event
        if rejected {
            self.connected.store(false, Ordering::SeqCst);
            self.release_current();
            self.events
                .emit(TransportEvent::ConnectionLost {
                    reason: "subscription rejected: NotAuthorized".to_string(),
                })
                .await;
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TelemetryError> {
        self.connected.store(false, Ordering::SeqCst);
        self.broker.lock().disconnects += 1;
        self.release_current();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.release_current();
        let mut state = self.broker.lock();
        state.live_handles = state.live_handles.saturating_sub(1);
    }
}

/// Factory producing [`MockTransport`] handles for one shared broker
#[derive(Debug, Clone)]
pub struct MockTransportFactory {
    broker: Arc<MockBroker>,
}

impl MockTransportFactory {
    pub fn new() -> (Self, Arc<MockBroker>) {
        let broker = Arc::new(MockBroker::default());
        (
            Self {
                broker: broker.clone(),
            },
            broker,
        )
    }
}

impl TransportFactory for MockTransportFactory {
    type Transport = MockTransport;

    fn create(&self, events: EventSender) -> MockTransport {
        {
            let mut state = self.broker.lock();
            state.handles_created += 1;
            state.live_handles += 1;
            state.max_live_handles = state.max_live_handles.max(state.live_handles);
        }
        MockTransport {
            broker: self.broker.clone(),
            events,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Notification sink that records every alert it receives
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    alerts: Mutex<Vec<Alert>>,
    fail: AtomicBool,
    delivered: Notify,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink that records alerts but reports every delivery as failed
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.fail.store(true, Ordering::SeqCst);
        sink
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .map(|alerts| alerts.clone())
            .unwrap_or_default()
    }

    /// Wait until at least `count` alerts were received
    pub async fn wait_for_alerts(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.delivered.notified();
            if self.alerts().len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.alerts().len() >= count;
            }
        }
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert.clone());
        }
        self.delivered.notify_waiters();

        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::DeliveryFailed("recording sink set to fail".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "localhost".to_string(),
            port: 1883,
            tls: false,
        }
    }

    #[tokio::test]
    async fn test_mock_transport_follows_script() {
        let (factory, broker) = MockTransportFactory::new();
        broker.script([ConnectOutcome::Fail]);
        let (tx, _rx) = mpsc::channel(8);

        let mut first = factory.create(EventSender::new(1, tx.clone()));
        assert!(first.connect(&endpoint(), None).await.is_err());
        drop(first);

        let mut second = factory.create(EventSender::new(2, tx));
        assert!(second.connect(&endpoint(), None).await.is_ok());
        assert!(second.is_connected());

        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.handles_created(), 2);
        assert_eq!(broker.live_handles(), 1);
        assert_eq!(broker.max_live_handles(), 1);
    }

    #[tokio::test]
    async fn test_deliver_reaches_connected_handle() {
        let (factory, broker) = MockTransportFactory::new();
        let (tx, mut rx) = mpsc::channel(8);

        let mut transport = factory.create(EventSender::new(5, tx));
        transport.connect(&endpoint(), None).await.unwrap();
        transport
            .subscribe("sensors/esp32-co2-01/data", DeliveryQos::AtMostOnce)
            .await
            .unwrap();

        assert!(broker.deliver(b"{}".to_vec()).await);
        let tagged = rx.recv().await.unwrap();
        assert_eq!(tagged.generation, 5);
        assert_eq!(
            tagged.event,
            TransportEvent::Message {
                topic: "sensors/esp32-co2-01/data".to_string(),
                payload: b"{}".to_vec()
            }
        );

        assert!(broker.drop_connection("network down").await);
        assert!(!transport.is_connected());
        assert!(!broker.deliver(b"{}".to_vec()).await);
    }

    #[tokio::test]
    async fn test_recording_sink_wait() {
        let sink = Arc::new(RecordingNotificationSink::failing());
        let alert = Alert {
            title: "t".to_string(),
            body: "b".to_string(),
            level: 1500,
        };

        let waiter = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.wait_for_alerts(1, Duration::from_secs(5)).await })
        };
        assert!(sink.notify(&alert).await.is_err());

        assert!(waiter.await.unwrap());
        assert_eq!(sink.alerts(), vec![alert]);
    }
}
