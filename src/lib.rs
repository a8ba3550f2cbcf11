//! telemetry-agent: host metrics agent for a central collector
//!
//! Keeps one authenticated WebSocket connection to the collector, streams a
//! system snapshot on a fixed interval, applies ping-target configuration
//! pushed by the server, and replaces its own binary on request.

pub mod config;
pub mod connection;
pub mod metrics;
pub mod platform;
pub mod protocol;
pub mod update;

pub use config::Config;
pub use connection::{ConnectionManager, ExitReason};
