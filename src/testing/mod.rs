//! Testing utilities and mock implementations
//!
//! Scriptable broker, transport and notification doubles so the connection
//! manager and telemetry context can be exercised without a live MQTT broker.

pub mod mocks;

pub use mocks::*;
