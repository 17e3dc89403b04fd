//! Engine notifications and the handler trait
//!
//! Every lifecycle and I/O change in the engine is posted as an `Event`.
//! Handlers implement `EventHandler` and override only the notifications they
//! care about; endpoint kinds are distinguished by matching on `Endpoint`.

use core::fmt;

use tracing::error;

use super::{ConnectionId, DeliveryId, Engine, LinkId, SessionId};
use crate::Result;

// ----------------------------------------------------------------------------
// Endpoint
// ----------------------------------------------------------------------------

/// Any entity with an independent local/remote open/close lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Connection(ConnectionId),
    Session(SessionId),
    Link(LinkId),
}

impl Endpoint {
    pub fn kind(&self) -> &'static str {
        match self {
            Endpoint::Connection(_) => "connection",
            Endpoint::Session(_) => "session",
            Endpoint::Link(_) => "link",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Connection(id) => write!(f, "connection {}", id),
            Endpoint::Session(id) => write!(f, "session {}", id),
            Endpoint::Link(id) => write!(f, "link {}", id),
        }
    }
}

impl From<ConnectionId> for Endpoint {
    fn from(id: ConnectionId) -> Self {
        Endpoint::Connection(id)
    }
}

impl From<SessionId> for Endpoint {
    fn from(id: SessionId) -> Self {
        Endpoint::Session(id)
    }
}

impl From<LinkId> for Endpoint {
    fn from(id: LinkId) -> Self {
        Endpoint::Link(id)
    }
}

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Notification posted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Endpoint created
    Init(Endpoint),
    /// Endpoint opened locally
    Open(Endpoint),
    /// Peer opened its half of the endpoint
    RemoteOpen(Endpoint),
    /// Endpoint closed locally
    Close(Endpoint),
    /// Peer closed its half of the endpoint
    RemoteClose(Endpoint),
    /// Both halves closed; the endpoint will be released
    Final(Endpoint),
    /// Credit or drain state of a link changed by the peer
    Flow(LinkId),
    /// Connection has output waiting for the transport
    Transport(ConnectionId),
    /// Delivery data or state arrived
    Delivery(DeliveryId),
}

impl Event {
    /// Route this event to the matching handler method
    ///
    /// Handler errors are logged and do not stop dispatch to other handlers.
    pub fn dispatch(&self, engine: &mut Engine, handler: &mut dyn EventHandler) {
        let result = match *self {
            Event::Init(endpoint) => handler.on_init(engine, endpoint),
            Event::Open(endpoint) => handler.on_open(engine, endpoint),
            Event::RemoteOpen(endpoint) => handler.on_remote_open(engine, endpoint),
            Event::Close(endpoint) => handler.on_close(engine, endpoint),
            Event::RemoteClose(endpoint) => handler.on_remote_close(engine, endpoint),
            Event::Final(endpoint) => handler.on_final(engine, endpoint),
            Event::Flow(link) => handler.on_flow(engine, link),
            Event::Transport(connection) => handler.on_transport(engine, connection),
            Event::Delivery(delivery) => handler.on_delivery(engine, delivery),
        };

        if let Err(e) = result {
            error!("Handler failed on {:?}: {}", self, e);
        }
    }
}

// ----------------------------------------------------------------------------
// Event Handler Trait
// ----------------------------------------------------------------------------

/// Reacts to engine notifications
///
/// Handlers run synchronously on the event-processing thread and must not
/// re-enter the event loop.
#[allow(unused_variables)]
pub trait EventHandler {
    fn on_init(&mut self, engine: &mut Engine, endpoint: Endpoint) -> Result<()> {
        Ok(())
    }

    fn on_open(&mut self, engine: &mut Engine, endpoint: Endpoint) -> Result<()> {
        Ok(())
    }

    fn on_remote_open(&mut self, engine: &mut Engine, endpoint: Endpoint) -> Result<()> {
        Ok(())
    }

    fn on_close(&mut self, engine: &mut Engine, endpoint: Endpoint) -> Result<()> {
        Ok(())
    }

    fn on_remote_close(&mut self, engine: &mut Engine, endpoint: Endpoint) -> Result<()> {
        Ok(())
    }

    fn on_final(&mut self, engine: &mut Engine, endpoint: Endpoint) -> Result<()> {
        Ok(())
    }

    fn on_flow(&mut self, engine: &mut Engine, link: LinkId) -> Result<()> {
        Ok(())
    }

    fn on_transport(&mut self, engine: &mut Engine, connection: ConnectionId) -> Result<()> {
        Ok(())
    }

    fn on_delivery(&mut self, engine: &mut Engine, delivery: DeliveryId) -> Result<()> {
        Ok(())
    }
}
