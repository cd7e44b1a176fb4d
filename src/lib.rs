//! CO2 Telemetry - Rust Implementation
//!
//! A real-time telemetry client for an embedded CO2 sensor publishing over
//! MQTT.
//!
//! # Overview
//!
//! This crate provides:
//! - Reading decoding and topic validation
//! - A connection manager that keeps one subscription alive, retrying with
//!   fixed delays and never holding more than one transport handle
//! - A bounded, persisted history of readings with summary statistics
//! - Threshold-based alert evaluation and pluggable notification sinks
//! - User settings persisted through a key-value store
//! - A telemetry context that serializes every state change through one worker
//!
//! # Quick Start
//!
//! ```rust
//! use co2_telemetry::alert::{AirQuality, AlertEvaluator};
//! use co2_telemetry::protocol::Reading;
//! use co2_telemetry::settings::Settings;
//!
//! let payload = br#"{"timestamp":1000,"co2_1":1500,"co2_2":400,
//!     "wifi_rssi":-60,"heap_free":120000,"device":"esp32-co2-01"}"#;
//! let reading = Reading::decode(payload).unwrap();
//! let settings = Settings::default();
//!
//! let alert = AlertEvaluator::evaluate(&reading, &settings).unwrap();
//! assert!(alert.body.contains("1500"));
//! assert_eq!(AirQuality::classify(&reading, &settings), AirQuality::High);
//! ```
//!
//! Running a live session:
//!
//! ```no_run
//! use co2_telemetry::config::ClientConfig;
//! use co2_telemetry::context::TelemetryContext;
//! use co2_telemetry::notify::LogNotificationSink;
//! use co2_telemetry::storage::FileStore;
//! use co2_telemetry::transport::mqtt::{MqttTransportFactory, MqttTransportOptions};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::load_from_file(Path::new("co2-telemetry.toml"))?;
//! let factory = MqttTransportFactory::new(MqttTransportOptions::from(&config));
//! let storage = Arc::new(FileStore::new(&config.storage.data_dir));
//!
//! let context =
//!     TelemetryContext::start(&config, factory, storage, Arc::new(LogNotificationSink)).await?;
//! println!("state: {}", context.connection_state());
//! context.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod alert;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod history;
pub mod notify;
pub mod observability;
pub mod protocol;
pub mod settings;
pub mod storage;
pub mod testing;
pub mod transport;

pub use alert::{AirQuality, Alert, AlertEvaluator};
pub use config::{ClientConfig, ConfigError};
pub use connection::ConnectionState;
pub use context::TelemetryContext;
pub use error::{TelemetryError, TelemetryResult};
pub use history::{HistoryBuffer, HistoryStats};
pub use protocol::Reading;
pub use settings::{Settings, SettingsPatch, SettingsStore};
