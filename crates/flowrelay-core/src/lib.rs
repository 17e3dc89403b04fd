//! FlowRelay Core
//!
//! This crate provides the store-and-forward relay logic, a compact
//! credit-flow-controlled link engine modeled on AMQP 1.0, and the client
//! handlers that consume from and publish to the relay. Everything runs on a
//! single event-processing thread: the engine posts notifications and the
//! handlers react to them synchronously.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod pool;
pub mod store;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    BacklogConfig, BacklogPolicy, DrainConfig, EngineConfig, RelayConfig, SelectionPolicy,
    SpoutConfig,
};
pub use engine::{
    ConnectionId, DeliveryId, Endpoint, Engine, Event, EventHandler, Frame, LinkId, Loopback,
    Performative, SessionId, FRAME_HEADER_SIZE,
};
pub use errors::{EngineError, RelayError, RelayResult, Result, StoreError};
pub use handlers::{Drain, FlowController, Handshaker, Relay, RelayStats, Router, Routes, Spout};
pub use pool::Pool;
pub use store::{MessageStore, MessageStoreStats};
pub use types::{
    Address, DeliveryTag, EndpointState, Message, Outcome, Role, TagGenerator, Terminus,
};
