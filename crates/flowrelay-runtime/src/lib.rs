//! FlowRelay Runtime
//!
//! This crate drives a `flowrelay-core` engine over TCP with tokio:
//! - `Driver`: the single event-processing task that owns the engine
//! - per-connection reader and writer tasks exchanging frames with the driver
//! - `DriverConfig`: frame limits, default port and the pluggable idle timeout

pub mod config;
pub mod driver;
mod transport;

pub use config::DriverConfig;
pub use driver::Driver;

// Re-export core types for convenience
pub use flowrelay_core::{Engine, EventHandler, RelayError, Result};
