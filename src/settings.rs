//! User-tunable settings and their store
//!
//! [`SettingsStore`] is a plain merge-and-persist primitive: it never
//! validates. Threshold ordering and the refresh-interval floor are checked
//! by [`Settings::validate`], which callers run before handing an update to
//! the store.

use crate::observability::metrics;
use crate::storage::{KeyValueStore, SETTINGS_KEY};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Smallest refresh interval accepted while auto-refresh is enabled
pub const MIN_REFRESH_INTERVAL_MS: u64 = 5_000;

/// User configuration for thresholds and refresh policy
///
/// Serialized with the camelCase field names of the persisted record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Below this level air quality is "good" (ppm)
    pub low_threshold: i32,
    /// Above this level an alert may fire (ppm)
    pub high_threshold: i32,
    pub notifications_enabled: bool,
    pub auto_refresh: bool,
    /// Refresh interval in milliseconds
    pub refresh_interval: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            low_threshold: 800,
            high_threshold: 1200,
            notifications_enabled: true,
            auto_refresh: true,
            refresh_interval: 10_000,
        }
    }
}

impl Settings {
    /// Apply a partial update; fields absent from `patch` keep their value
    pub fn merge(&self, patch: &SettingsPatch) -> Settings {
        Settings {
            low_threshold: patch.low_threshold.unwrap_or(self.low_threshold),
            high_threshold: patch.high_threshold.unwrap_or(self.high_threshold),
            notifications_enabled: patch
                .notifications_enabled
                .unwrap_or(self.notifications_enabled),
            auto_refresh: patch.auto_refresh.unwrap_or(self.auto_refresh),
            refresh_interval: patch.refresh_interval.unwrap_or(self.refresh_interval),
        }
    }

    /// Check the invariants callers must uphold before updating the store
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.low_threshold >= self.high_threshold {
            return Err(SettingsError::ThresholdOrder {
                low: self.low_threshold,
                high: self.high_threshold,
            });
        }
        if self.auto_refresh && self.refresh_interval < MIN_REFRESH_INTERVAL_MS {
            return Err(SettingsError::RefreshIntervalTooShort {
                interval_ms: self.refresh_interval,
                min_ms: MIN_REFRESH_INTERVAL_MS,
            });
        }
        Ok(())
    }
}

/// Partial settings update; also the shape of the persisted record on read
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_threshold: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_threshold: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_refresh: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<u64>,
}

impl SettingsPatch {
    /// Patch that restores every field to its default
    pub fn reset() -> Self {
        Settings::default().into()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl From<Settings> for SettingsPatch {
    fn from(settings: Settings) -> Self {
        Self {
            low_threshold: Some(settings.low_threshold),
            high_threshold: Some(settings.high_threshold),
            notifications_enabled: Some(settings.notifications_enabled),
            auto_refresh: Some(settings.auto_refresh),
            refresh_interval: Some(settings.refresh_interval),
        }
    }
}

/// Settings rule violations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Low threshold ({low} ppm) must be less than high threshold ({high} ppm)")]
    ThresholdOrder { low: i32, high: i32 },
    #[error("Refresh interval must be at least {min_ms} ms, got {interval_ms} ms")]
    RefreshIntervalTooShort { interval_ms: u64, min_ms: u64 },
}

/// Holds the current settings and persists them after every update
pub struct SettingsStore {
    storage: Arc<dyn KeyValueStore>,
    current: Settings,
}

impl SettingsStore {
    /// Read persisted settings and overlay them onto the defaults
    ///
    /// Missing fields fall back to defaults. An unreadable or corrupt record
    /// is logged and replaced by the defaults.
    pub async fn load(storage: Arc<dyn KeyValueStore>) -> Self {
        let current = match storage.get(SETTINGS_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<SettingsPatch>(&raw) {
                Ok(persisted) => {
                    debug!("Loaded persisted settings");
                    Settings::default().merge(&persisted)
                }
                Err(e) => {
                    warn!(error = %e, "Persisted settings are corrupt, using defaults");
                    Settings::default()
                }
            },
            Ok(None) => Settings::default(),
            Err(e) => {
                warn!(error = %e, "Failed to read settings, using defaults");
                metrics().persistence_failed();
                Settings::default()
            }
        };

        Self { storage, current }
    }

    pub fn current(&self) -> &Settings {
        &self.current
    }

    /// Merge `patch` into the current settings, persist, and return the result
    ///
    /// A failed write is logged; the in-memory value is still updated.
    pub async fn update(&mut self, patch: &SettingsPatch) -> Settings {
        self.current = self.current.merge(patch);

        match serde_json::to_string(&self.current) {
            Ok(json) => {
                if let Err(e) = self.storage.set(SETTINGS_KEY, &json).await {
                    warn!(error = %e, "Failed to persist settings");
                    metrics().persistence_failed();
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize settings"),
        }

        info!(settings = ?self.current, "Settings updated");
        self.current.clone()
    }
}
