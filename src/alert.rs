//! Threshold evaluation for incoming readings
//!
//! Everything here is a pure function of a [`Reading`] and the current
//! [`Settings`], so it can be exercised without a broker connection.

use crate::protocol::Reading;
use crate::settings::Settings;
use serde::Serialize;

/// Title used for every high-CO2 alert
pub const HIGH_CO2_ALERT_TITLE: &str = "High CO2 Level Alert!";

/// Notification payload produced when a reading crosses the high threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub title: String,
    pub body: String,
    /// The CO2 level (ppm) that triggered the alert
    pub level: i32,
}

impl Alert {
    fn high_co2(level: i32) -> Self {
        Self {
            title: HIGH_CO2_ALERT_TITLE.to_string(),
            body: format!("CO2 level is {level} ppm. Please ventilate the area."),
            level,
        }
    }
}

/// Decides whether a reading warrants a notification
pub struct AlertEvaluator;

impl AlertEvaluator {
    /// Return an alert iff notifications are enabled and the highest valid
    /// channel strictly exceeds the high threshold
    ///
    /// Negative channel values are sensor failures and never count; when
    /// both channels failed no alert is possible.
    pub fn evaluate(reading: &Reading, settings: &Settings) -> Option<Alert> {
        if !settings.notifications_enabled {
            return None;
        }

        let level = reading.max_valid_co2()?;
        (level > settings.high_threshold).then(|| Alert::high_co2(level))
    }
}

/// Air-quality band of a reading relative to the user thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AirQuality {
    /// Neither channel produced a valid value
    SensorError,
    Good,
    Moderate,
    High,
}

impl AirQuality {
    pub fn classify(reading: &Reading, settings: &Settings) -> Self {
        match reading.max_valid_co2() {
            None => AirQuality::SensorError,
            Some(level) if level < settings.low_threshold => AirQuality::Good,
            Some(level) if level < settings.high_threshold => AirQuality::Moderate,
            Some(_) => AirQuality::High,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AirQuality::SensorError => "Sensor reading error",
            AirQuality::Good => "Air quality is excellent",
            AirQuality::Moderate => "Consider improving ventilation",
            AirQuality::High => "Poor air quality - ventilate immediately",
        }
    }
}

impl std::fmt::Display for AirQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AirQuality::SensorError => "Error",
            AirQuality::Good => "Good",
            AirQuality::Moderate => "Moderate",
            AirQuality::High => "High",
        };
        f.write_str(label)
    }
}
