//! Endpoint lifecycle mirror
//!
//! Answers every remote open or close with the matching local operation, so
//! the peer always sees a symmetric handshake.

use tracing::debug;

use crate::engine::{Endpoint, Engine, EventHandler};
use crate::types::EndpointState;
use crate::Result;

/// Mirrors remote open/close onto the local half of each endpoint
#[derive(Debug, Default, Clone, Copy)]
pub struct Handshaker;

impl Handshaker {
    pub fn new() -> Self {
        Self
    }
}

impl EventHandler for Handshaker {
    fn on_remote_open(&mut self, engine: &mut Engine, endpoint: Endpoint) -> Result<()> {
        if engine.local_state(endpoint)? != EndpointState::Uninitialized {
            return Ok(());
        }

        // A link's addressing is unset until the peer declares it
        if let Endpoint::Link(link) = endpoint {
            let source = engine.remote_source(link)?.clone();
            let target = engine.remote_target(link)?.clone();
            engine.set_source(link, source)?;
            engine.set_target(link, target)?;
        }

        debug!("Mirroring remote open of {}", endpoint);
        engine.open(endpoint)
    }

    fn on_remote_close(&mut self, engine: &mut Engine, endpoint: Endpoint) -> Result<()> {
        if engine.local_state(endpoint)? == EndpointState::Closed {
            return Ok(());
        }
        debug!("Mirroring remote close of {}", endpoint);
        engine.close(endpoint)
    }
}
