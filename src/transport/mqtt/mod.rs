//! MQTT v5 transport built on rumqttc
//!
//! The module separates pure functions from I/O for testability:
//!
//! - [`connection`] - Pure option construction, client ids and errors
//! - [`message_handler`] - Pure routing of rumqttc events
//! - [`client`] - Impure I/O: the event loop task and the [`Transport`](crate::transport::Transport) impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use co2_telemetry::config::Endpoint;
//! use co2_telemetry::transport::mqtt::{MqttTransportFactory, MqttTransportOptions};
//! use co2_telemetry::transport::{DeliveryQos, EventSender, Transport, TransportFactory};
//! use tokio::sync::mpsc;
//!
//! # tokio_test::block_on(async {
//! let (tx, _rx) = mpsc::channel(100);
//! let factory = MqttTransportFactory::new(MqttTransportOptions::default());
//! let mut transport = factory.create(EventSender::new(1, tx));
//!
//! let endpoint = Endpoint::parse("mqtt://localhost:1883")?;
//! transport.connect(&endpoint, None).await?;
//! transport.subscribe("sensors/esp32-co2-01/data", DeliveryQos::AtMostOnce).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttTransport, MqttTransportFactory};
pub use connection::{MqttError, MqttTransportOptions};
pub use message_handler::{EventRoute, MessageHandler};
