//! Event handlers
//!
//! Each handler reacts to the subset of engine notifications it cares about.
//! Handlers are composed by listing them in dispatch order; the relay server
//! runs `Handshaker`, `FlowController` and `Relay`, while the clients pair a
//! `Handshaker` with either `Drain` or `Spout`.

pub mod drain;
pub mod flow_controller;
pub mod handshaker;
pub mod relay;
pub mod router;
pub mod spout;

pub use drain::Drain;
pub use flow_controller::FlowController;
pub use handshaker::Handshaker;
pub use relay::{Relay, RelayStats};
pub use router::{Router, Routes};
pub use spout::Spout;
