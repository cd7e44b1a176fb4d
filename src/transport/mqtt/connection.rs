//! Pure MQTT option construction
//!
//! This module contains pure functions for building rumqttc options from
//! the configured endpoint and credentials, plus the transport error type.

use crate::config::{ClientConfig, Credentials, Endpoint};
use crate::transport::DeliveryQos;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;

/// Per-handle MQTT settings that do not depend on the endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttTransportOptions {
    /// Prefix for generated client ids
    pub client_id_prefix: String,
    pub keep_alive: Duration,
}

impl Default for MqttTransportOptions {
    fn default() -> Self {
        Self {
            client_id_prefix: "co2-telemetry".to_string(),
            keep_alive: Duration::from_secs(60),
        }
    }
}

impl From<&ClientConfig> for MqttTransportOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            client_id_prefix: config.mqtt.client_id_prefix.clone(),
            keep_alive: Duration::from_secs(config.mqtt.keep_alive_secs),
        }
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Disconnect failed")]
    DisconnectFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Not connected")]
    NotConnected,
    #[error("Transport handle already used for a connection")]
    AlreadyStarted,
}

/// Generate a client id unique per connection attempt to prevent broker session conflicts
pub fn generate_client_id(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..8])
}

/// Pure function to build rumqttc options for one connection attempt
pub fn configure_mqtt_options(
    client_id: &str,
    endpoint: &Endpoint,
    credentials: Option<&Credentials>,
    options: &MqttTransportOptions,
) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);

    if endpoint.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(credentials) = credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_start(true);

    mqtt_options
}

/// Map the transport-neutral QoS onto rumqttc's
pub fn to_mqtt_qos(qos: DeliveryQos) -> QoS {
    match qos {
        DeliveryQos::AtMostOnce => QoS::AtMostOnce,
    }
}
