//! Wire types for the sensor feed
//!
//! This module defines the reading published by the CO2 device and the
//! rules for the topic the client subscribes to.

pub mod reading;
pub mod topics;

pub use reading::*;
pub use topics::*;
