//! Thread-safe metrics collection
//!
//! Process-wide atomic counters for the connection lifecycle, reading
//! ingestion, alerting and persistence.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<TelemetryMetrics> = Lazy::new(TelemetryMetrics::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static TelemetryMetrics {
    &METRICS
}

/// Thread-safe metrics collector using atomics
pub struct TelemetryMetrics {
    // Connection metrics
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connection_losses: AtomicU64,
    connection_start_time: AtomicU64,
    connection_state: Mutex<String>,
    state_transitions: AtomicU64,

    // Ingestion metrics
    readings_received: AtomicU64,
    decode_failures: AtomicU64,
    last_reading_at: AtomicU64,

    // Alerting and persistence
    alerts_raised: AtomicU64,
    notification_failures: AtomicU64,
    persistence_failures: AtomicU64,

    uptime_start: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connection_losses: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            connection_state: Mutex::new("disconnected".to_string()),
            state_transitions: AtomicU64::new(0),
            readings_received: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            last_reading_at: AtomicU64::new(0),
            alerts_raised: AtomicU64::new(0),
            notification_failures: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Connection metrics
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connection_losses.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    /// Record the connection manager's current state label
    pub fn set_connection_state(&self, state: &str) {
        if let Ok(mut current) = self.connection_state.lock() {
            if *current != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current = state.to_string();
            }
        }
        if state != "connected" {
            self.connected.store(false, Ordering::Relaxed);
        }
    }

    // Ingestion metrics
    pub fn reading_received(&self) {
        self.readings_received.fetch_add(1, Ordering::Relaxed);
        self.last_reading_at
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn decode_failed(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alert_raised(&self) {
        self.alerts_raised.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_failed(&self) {
        self.notification_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn persistence_failed(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        let now = current_timestamp();
        self.connected.store(false, Ordering::Relaxed);
        self.connection_attempts.store(0, Ordering::Relaxed);
        self.connections_established.store(0, Ordering::Relaxed);
        self.connection_failures.store(0, Ordering::Relaxed);
        self.connection_losses.store(0, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
        self.state_transitions.store(0, Ordering::Relaxed);
        self.readings_received.store(0, Ordering::Relaxed);
        self.decode_failures.store(0, Ordering::Relaxed);
        self.last_reading_at.store(0, Ordering::Relaxed);
        self.alerts_raised.store(0, Ordering::Relaxed);
        self.notification_failures.store(0, Ordering::Relaxed);
        self.persistence_failures.store(0, Ordering::Relaxed);
        self.uptime_start.store(now, Ordering::Relaxed);
        if let Ok(mut state) = self.connection_state.lock() {
            *state = "disconnected".to_string();
        }
    }

    /// Calculate connection duration (pure function)
    fn calculate_connection_duration(&self, now: u64) -> u64 {
        if !self.connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let current_state = self
            .connection_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string());

        MetricsSnapshot {
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                current_state,
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connection_losses: self.connection_losses.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            readings: ReadingMetrics {
                readings_received: self.readings_received.load(Ordering::Relaxed),
                decode_failures: self.decode_failures.load(Ordering::Relaxed),
                last_reading_at: self.last_reading_at.load(Ordering::Relaxed),
                alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
                notification_failures: self.notification_failures.load(Ordering::Relaxed),
                persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub connection: ConnectionMetrics,
    pub readings: ReadingMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub current_state: String,
    pub state_transitions: u64,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connection_losses: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct ReadingMetrics {
    pub readings_received: u64,
    pub decode_failures: u64,
    pub last_reading_at: u64,
    pub alerts_raised: u64,
    pub notification_failures: u64,
    pub persistence_failures: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
