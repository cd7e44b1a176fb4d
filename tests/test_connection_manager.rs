//! Connection manager integration tests
//!
//! Long-running failure and recovery scenarios against the scriptable broker.
//! All tests run on paused time so retry delays are exact.


use co2_telemetry::connection::{ConnectionManager, ConnectionState, ManagerEvent};
use co2_telemetry::testing::{ConnectOutcome, MockTransportFactory};
use std::time::Duration;
use test_helpers::{advance, reading_payload, settle, test_config};
use tokio::sync::mpsc;

#[tokio::test(start_paused = true)]
async fn test_repeated_failures_retry_at_fixed_interval() {
    // Arrange: broker refuses three times, then accepts
    let (factory, broker) = MockTransportFactory::new();
    broker.script([
        ConnectOutcome::Fail,
        ConnectOutcome::Fail,
        ConnectOutcome::Fail,
    ]);
    let (output_tx, _output_rx) = mpsc::channel(64);

    // Act
    let handle = ConnectionManager::spawn(factory, &test_config(), output_tx).unwrap();
    settle().await;

    // Assert: one attempt per 10s, never more than one handle alive
    for expected in 1..=3 {
        assert_eq!(broker.connect_attempts(), expected);
        assert_eq!(handle.state(), ConnectionState::Error);
        advance(Duration::from_secs(10)).await;
    }
    assert_eq!(broker.connect_attempts(), 4);
    assert_eq!(handle.state(), ConnectionState::Connected);
    assert_eq!(broker.max_live_handles(), 1);
    assert_eq!(broker.live_handles(), 1);

    handle.shutdown().await;
    assert_eq!(broker.live_handles(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_storm_keeps_a_single_handle() {
    // Arrange
    let (factory, broker) = MockTransportFactory::new();
    let (output_tx, _output_rx) = mpsc::channel(64);
    let handle = ConnectionManager::spawn(factory, &test_config(), output_tx).unwrap();
    settle().await;
    assert_eq!(handle.state(), ConnectionState::Connected);

    // Act: many reconnect requests in quick succession
    for _ in 0..20 {
        handle.reconnect().unwrap();
    }
    settle().await;
    advance(Duration::from_secs(2)).await;

    // Assert
    assert_eq!(handle.state(), ConnectionState::Connected);
    assert_eq!(broker.max_live_handles(), 1);
    assert_eq!(broker.live_handles(), 1);

    // Quiet afterwards: no stray retry fires later
    let attempts = broker.connect_attempts();
    advance(Duration::from_secs(60)).await;
    assert_eq!(broker.connect_attempts(), attempts);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_hung_handshake_then_recovery_delivers_readings() {
    // Arrange: first handshake never answers
    let (factory, broker) = MockTransportFactory::new();
    broker.script([ConnectOutcome::Hang]);
    let (output_tx, mut output_rx) = mpsc::channel(64);
    let handle = ConnectionManager::spawn(factory, &test_config(), output_tx).unwrap();
    settle().await;
    assert_eq!(handle.state(), ConnectionState::Connecting);

    // Act: connect timeout (5s) then the failure delay (10s)
    advance(Duration::from_secs(5)).await;
    assert_eq!(handle.state(), ConnectionState::Error);
    advance(Duration::from_secs(10)).await;
    assert_eq!(handle.state(), ConnectionState::Connected);

    broker.deliver(reading_payload(42, 700, 650)).await;
    settle().await;

    // Assert: the state history and the reading reached the consumer
    let mut states = Vec::new();
    let mut readings = Vec::new();
    while let Ok(event) = output_rx.try_recv() {
        match event {
            ManagerEvent::StateChanged(state) => states.push(state),
            ManagerEvent::Reading(reading) => readings.push(reading),
        }
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Error,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].timestamp, 42);
    assert_eq!(broker.max_live_handles(), 1);

    handle.shutdown().await;
}
