//! Connection manager for the sensor feed
//!
//! - `state`: pure state machine and retry policy
//! - `health`: connection health calculations
//! - `manager`: the async actor that owns the transport handle

pub mod health;
pub mod manager;
pub mod state;

pub use health::{ConnectionStats, HealthMetrics, HealthMonitor};
pub use manager::{ConnectionHandle, ConnectionManager, ManagerEvent};
pub use state::{
    determine_transition, Action, ConnectionEvent, ConnectionState, RetryPolicy, RetryReason,
    Transition,
};
