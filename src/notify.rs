//! Notification delivery
//!
//! The core decides that an alert should fire; a [`NotificationSink`]
//! delivers it. Delivery is fire-and-forget from the caller's side: errors
//! are logged by the caller and never propagated.

use crate::alert::Alert;
use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// Delivers a user-visible alert
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Notification delivery errors
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Writes alerts to the log at WARN level
#[derive(Debug, Default, Clone)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        warn!(
            title = %alert.title,
            level_ppm = alert.level,
            "{}",
            alert.body
        );
        Ok(())
    }
}

/// Shows alerts through the desktop notification service
#[cfg(feature = "desktop-notifications")]
#[derive(Debug, Default, Clone)]
pub struct DesktopNotificationSink;

#[cfg(feature = "desktop-notifications")]
#[async_trait]
impl NotificationSink for DesktopNotificationSink {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        let title = alert.title.clone();
        let body = alert.body.clone();

        tokio::task::spawn_blocking(move || {
            notify_rust::Notification::new()
                .summary(&title)
                .body(&body)
                .show()
                .map(|_| ())
                .map_err(|e| NotifyError::DeliveryFailed(e.to_string()))
        })
        .await
        .map_err(|e| NotifyError::DeliveryFailed(e.to_string()))?
    }
}
