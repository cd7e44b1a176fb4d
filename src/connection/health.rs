//! Connection health metrics
//!
//! Pure calculations over [`ConnectionStats`], which the connection manager
//! keeps current as it connects, receives and drops messages.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// A connection with no message for this long is considered unhealthy
pub const MESSAGE_SILENCE_THRESHOLD: Duration = Duration::from_secs(300);

/// Raw bookkeeping maintained by the connection manager
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Set on handshake success, cleared when the connection goes away
    pub connected_since: Option<Instant>,
    pub last_message_at: Option<Instant>,
    /// Successful connections after the first one
    pub reconnect_count: u32,
    /// Messages received but dropped because they failed to decode
    pub dropped_messages: u64,
    pub(crate) ever_connected: bool,
}

impl ConnectionStats {
    pub(crate) fn record_connected(&mut self, now: Instant) {
        if self.ever_connected {
            self.reconnect_count += 1;
        }
        self.ever_connected = true;
        self.connected_since = Some(now);
        self.last_message_at = None;
    }

    pub(crate) fn record_disconnected(&mut self) {
        self.connected_since = None;
    }

    pub(crate) fn record_message(&mut self, now: Instant) {
        self.last_message_at = Some(now);
    }

    pub(crate) fn record_dropped(&mut self) {
        self.dropped_messages += 1;
    }
}

/// Derived health view of the connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthMetrics {
    pub uptime: Option<Duration>,
    pub time_since_last_message: Option<Duration>,
    pub reconnect_count: u32,
    pub dropped_messages: u64,
    pub is_healthy: bool,
}

/// Pure health monitoring logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Calculate health metrics for connection (pure function)
    pub fn calculate_health_metrics(stats: &ConnectionStats, now: Instant) -> HealthMetrics {
        let uptime = stats
            .connected_since
            .map(|t| now.saturating_duration_since(t));
        let time_since_last_message = stats
            .last_message_at
            .map(|t| now.saturating_duration_since(t));

        HealthMetrics {
            uptime,
            time_since_last_message,
            reconnect_count: stats.reconnect_count,
            dropped_messages: stats.dropped_messages,
            is_healthy: Self::determine_health_status(uptime, time_since_last_message),
        }
    }

    /// Determine overall health status (pure function)
    fn determine_health_status(
        uptime: Option<Duration>,
        time_since_last_message: Option<Duration>,
    ) -> bool {
        // Healthy when connected and either silent since connecting or recently active
        match (uptime, time_since_last_message) {
            (Some(_), None) => true,
            (Some(_), Some(last_msg)) => last_msg < MESSAGE_SILENCE_THRESHOLD,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_is_unhealthy() {
        let stats = ConnectionStats::default();
        let metrics = HealthMonitor::calculate_health_metrics(&stats, Instant::now());
        assert!(!metrics.is_healthy);
        assert_eq!(metrics.uptime, None);
    }

    #[test]
    fn test_connected_without_messages_is_healthy() {
        let now = Instant::now();
        let mut stats = ConnectionStats::default();
        stats.record_connected(now);

        let metrics =
            HealthMonitor::calculate_health_metrics(&stats, now + Duration::from_secs(600));
        assert!(metrics.is_healthy);
        assert_eq!(metrics.uptime, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_silent_connection_becomes_unhealthy() {
        let now = Instant::now();
        let mut stats = ConnectionStats::default();
        stats.record_connected(now);
        stats.record_message(now);

        let recent = HealthMonitor::calculate_health_metrics(&stats, now + Duration::from_secs(60));
        assert!(recent.is_healthy);

        let stale =
            HealthMonitor::calculate_health_metrics(&stats, now + Duration::from_secs(301));
        assert!(!stale.is_healthy);
    }

    #[test]
    fn test_reconnect_count_excludes_first_connection() {
        let now = Instant::now();
        let mut stats = ConnectionStats::default();

        stats.record_connected(now);
        assert_eq!(stats.reconnect_count, 0);

        stats.record_disconnected();
        stats.record_connected(now);
        stats.record_disconnected();
        stats.record_connected(now);
        assert_eq!(stats.reconnect_count, 2);
    }

    #[test]
    fn test_dropped_messages_counted() {
        let mut stats = ConnectionStats::default();
        stats.record_dropped();
        stats.record_dropped();

        let metrics = HealthMonitor::calculate_health_metrics(&stats, Instant::now());
        assert_eq!(metrics.dropped_messages, 2);
    }
}
