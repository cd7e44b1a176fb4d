//! Telemetry context
//!
//! The composition root: loads settings and history, starts the connection
//! manager, and runs the single worker through which every mutation flows.
//! Connection state changes, reading arrivals, settings updates and
//! reconnect requests are all handled one at a time by that worker.
//! Consumers read the latest values through cheap `watch` snapshots.

use crate::alert::{AirQuality, AlertEvaluator};
use crate::config::ClientConfig;
use crate::connection::{
    ConnectionHandle, ConnectionManager, ConnectionState, HealthMetrics, ManagerEvent,
};
use crate::error::{TelemetryError, TelemetryResult};
use crate::history::{HistoryBuffer, HistoryStats};
use crate::notify::NotificationSink;
use crate::observability::metrics;
use crate::protocol::Reading;
use crate::settings::{Settings, SettingsPatch, SettingsStore};
use crate::storage::KeyValueStore;
use crate::transport::TransportFactory;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const MANAGER_EVENT_CAPACITY: usize = 64;
const COMMAND_CAPACITY: usize = 16;

enum ContextCommand {
    UpdateSettings {
        patch: SettingsPatch,
        reply: oneshot::Sender<TelemetryResult<Settings>>,
    },
    Reconnect {
        reply: oneshot::Sender<TelemetryResult<()>>,
    },
    Health {
        reply: oneshot::Sender<HealthMetrics>,
    },
    Shutdown,
}

/// Live telemetry session
///
/// Dropping the context stops the worker, which in turn stops the
/// connection manager and releases the transport.
pub struct TelemetryContext {
    commands: mpsc::Sender<ContextCommand>,
    reading_rx: watch::Receiver<Option<Reading>>,
    state_rx: watch::Receiver<ConnectionState>,
    history_rx: watch::Receiver<Arc<Vec<Reading>>>,
    settings_rx: watch::Receiver<Settings>,
    worker: JoinHandle<()>,
}

impl TelemetryContext {
    /// Load persisted state, start connecting, and spawn the worker
    pub async fn start<F: TransportFactory>(
        config: &ClientConfig,
        factory: F,
        storage: Arc<dyn KeyValueStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> TelemetryResult<Self> {
        let settings = SettingsStore::load(storage.clone()).await;
        let history = HistoryBuffer::load(storage).await;

        let (reading_tx, reading_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (history_tx, history_rx) = watch::channel(Arc::new(history.snapshot()));
        let (settings_tx, settings_rx) = watch::channel(settings.current().clone());

        let (manager_tx, manager_rx) = mpsc::channel(MANAGER_EVENT_CAPACITY);
        let connection = ConnectionManager::spawn(factory, config, manager_tx)?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let worker = Worker {
            settings,
            history,
            connection,
            manager_events: manager_rx,
            commands: commands_rx,
            sink,
            reading_tx,
            state_tx,
            history_tx,
            settings_tx,
        };

        info!(
            history_len = history_rx.borrow().len(),
            "Telemetry context started"
        );

        Ok(Self {
            commands: commands_tx,
            reading_rx,
            state_rx,
            history_rx,
            settings_rx,
            worker: tokio::spawn(worker.run()),
        })
    }

    /// Most recent reading; `None` until the first message arrives
    pub fn current_reading(&self) -> Option<Reading> {
        self.reading_rx.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Full history, oldest first
    pub fn history(&self) -> Arc<Vec<Reading>> {
        self.history_rx.borrow().clone()
    }

    /// The most recent `last_n` readings, oldest first
    pub fn history_slice(&self, last_n: usize) -> Vec<Reading> {
        let history = self.history();
        let skip = history.len().saturating_sub(last_n);
        history[skip..].to_vec()
    }

    pub fn settings(&self) -> Settings {
        self.settings_rx.borrow().clone()
    }

    pub fn watch_reading(&self) -> watch::Receiver<Option<Reading>> {
        self.reading_rx.clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn watch_history(&self) -> watch::Receiver<Arc<Vec<Reading>>> {
        self.history_rx.clone()
    }

    pub fn watch_settings(&self) -> watch::Receiver<Settings> {
        self.settings_rx.clone()
    }

    /// Classification of the current reading against the current thresholds
    pub fn air_quality(&self) -> Option<AirQuality> {
        let settings = self.settings();
        self.reading_rx
            .borrow()
            .as_ref()
            .map(|reading| AirQuality::classify(reading, &settings))
    }

    pub fn history_stats(&self) -> Option<HistoryStats> {
        HistoryStats::compute(&self.history(), &self.settings())
    }

    pub async fn connection_health(&self) -> TelemetryResult<HealthMetrics> {
        let (reply, rx) = oneshot::channel();
        self.send(ContextCommand::Health { reply }).await?;
        rx.await.map_err(|_| TelemetryError::ContextStopped)
    }

    /// Merge `patch` into the current settings after validating the result
    ///
    /// Invalid combinations are rejected with
    /// [`TelemetryError::InvalidSettings`] and nothing is persisted.
    pub async fn update_settings(&self, patch: SettingsPatch) -> TelemetryResult<Settings> {
        let (reply, rx) = oneshot::channel();
        self.send(ContextCommand::UpdateSettings { patch, reply })
            .await?;
        rx.await.map_err(|_| TelemetryError::ContextStopped)?
    }

    /// Drop the current session and reconnect after a short pause
    pub async fn reconnect(&self) -> TelemetryResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ContextCommand::Reconnect { reply }).await?;
        rx.await.map_err(|_| TelemetryError::ContextStopped)?
    }

    /// Stop the worker and the connection manager, releasing the transport
    pub async fn shutdown(self) {
        let _ = self.commands.send(ContextCommand::Shutdown).await;
        if let Err(e) = self.worker.await {
            warn!(error = %e, "Telemetry worker ended abnormally");
        }
    }

    async fn send(&self, command: ContextCommand) -> TelemetryResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TelemetryError::ContextStopped)
    }
}

/// Owns every mutable cell of the session
struct Worker {
    settings: SettingsStore,
    history: HistoryBuffer,
    connection: ConnectionHandle,
    manager_events: mpsc::Receiver<ManagerEvent>,
    commands: mpsc::Receiver<ContextCommand>,
    sink: Arc<dyn NotificationSink>,
    reading_tx: watch::Sender<Option<Reading>>,
    state_tx: watch::Sender<ConnectionState>,
    history_tx: watch::Sender<Arc<Vec<Reading>>>,
    settings_tx: watch::Sender<Settings>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(event) = self.manager_events.recv() => {
                    self.handle_manager_event(event).await;
                }
                command = self.commands.recv() => match command {
                    Some(ContextCommand::UpdateSettings { patch, reply }) => {
                        let _ = reply.send(self.update_settings(patch).await);
                    }
                    Some(ContextCommand::Reconnect { reply }) => {
                        let _ = reply.send(self.connection.reconnect());
                    }
                    Some(ContextCommand::Health { reply }) => {
                        let _ = reply.send(self.connection.health());
                    }
                    Some(ContextCommand::Shutdown) | None => break,
                },
            }
        }

        // Unblock the manager before waiting for it to release the transport
        self.manager_events.close();
        self.connection.shutdown().await;
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("Telemetry context stopped");
    }

    async fn handle_manager_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::StateChanged(state) => {
                debug!(state = %state, "Connection state published");
                self.state_tx.send_replace(state);
            }
            ManagerEvent::Reading(reading) => {
                let span = crate::ingest_span!(
                    device = %reading.device,
                    timestamp = reading.timestamp
                );
                self.ingest(reading).instrument(span).await;
            }
        }
    }

    async fn ingest(&mut self, reading: Reading) {
        self.reading_tx.send_replace(Some(reading.clone()));

        self.history.append(reading.clone()).await;
        self.history_tx
            .send_replace(Arc::new(self.history.snapshot()));

        debug!(
            co2_1 = reading.co2_1,
            co2_2 = reading.co2_2,
            history_len = self.history.len(),
            "Reading ingested"
        );

        if let Some(alert) = AlertEvaluator::evaluate(&reading, self.settings.current()) {
            metrics().alert_raised();
            info!(level = alert.level, "High CO2 alert raised");

            let sink = self.sink.clone();
            tokio::spawn(
                async move {
                    if let Err(e) = sink.notify(&alert).await {
                        error!(error = %e, "Notification delivery failed");
                        metrics().notification_failed();
                    }
                }
                .in_current_span(),
            );
        }
    }

    async fn update_settings(&mut self, patch: SettingsPatch) -> TelemetryResult<Settings> {
        let candidate = self.settings.current().merge(&patch);
        if let Err(e) = candidate.validate() {
            warn!(error = %e, "Rejected settings update");
            return Err(e.into());
        }

        let updated = self.settings.update(&patch).await;
        self.settings_tx.send_replace(updated.clone());
        Ok(updated)
    }
}
