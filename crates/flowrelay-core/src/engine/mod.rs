//! Credit-flow-controlled link engine
//!
//! A compact connection/session/link/delivery engine modeled on AMQP 1.0 flow
//! control. The engine owns every endpoint in an arena addressed by typed ids,
//! queues outbound frames per connection, and posts an `Event` for every
//! lifecycle or I/O change. It performs no I/O itself: a driver moves frames
//! between `take_output`/`input` and a transport, and pumps `next_event`.
//!
//! Credit arithmetic follows the AMQP link model. A receiver's credit limit is
//! `delivery_count + credit`; a sender recomputes its credit from each
//! receiver flow as `limit - sender.delivery_count`. A draining sender with no
//! more data calls `drained()`, which consumes the remaining credit by
//! advancing its delivery count and echoes the result back to the receiver.

mod event;
mod frame;
mod input;
pub mod loopback;

pub use event::{Endpoint, Event, EventHandler};
pub use frame::{Frame, Performative, FRAME_HEADER_SIZE};
pub use loopback::Loopback;

use core::fmt;
use std::collections::VecDeque;

use hashbrown::{HashMap, HashSet};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::types::{DeliveryTag, EndpointState, Outcome, Role, Terminus};
use crate::Result;

// ----------------------------------------------------------------------------
// Endpoint Identifiers
// ----------------------------------------------------------------------------

macro_rules! engine_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u32);

        impl $name {
            /// Raw arena index
            pub fn raw(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "#{}", self.0)
            }
        }
    };
}

engine_id!(
    /// Handle to a connection owned by an `Engine`
    ConnectionId
);
engine_id!(
    /// Handle to a session owned by an `Engine`
    SessionId
);
engine_id!(
    /// Handle to a link owned by an `Engine`
    LinkId
);
engine_id!(
    /// Handle to a delivery owned by an `Engine`
    DeliveryId
);

// ----------------------------------------------------------------------------
// Endpoint Records
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct ConnectionRecord {
    local: EndpointState,
    remote: EndpointState,
    hostname: Option<String>,
    container_id: String,
    remote_container_id: Option<String>,
    sessions: Vec<SessionId>,
    next_channel: u16,
    /// Peer channel -> session
    remote_channels: HashMap<u16, SessionId>,
    output: VecDeque<Frame>,
    /// No further frames are accepted once close is sent or the transport died
    output_closed: bool,
    finalized: bool,
}

#[derive(Debug)]
struct SessionRecord {
    connection: ConnectionId,
    local: EndpointState,
    remote: EndpointState,
    channel: u16,
    remote_channel: Option<u16>,
    links: Vec<LinkId>,
    next_handle: u32,
    /// Peer handle -> link
    remote_handles: HashMap<u32, LinkId>,
    finalized: bool,
}

#[derive(Debug)]
struct LinkRecord {
    session: SessionId,
    connection: ConnectionId,
    name: String,
    role: Role,
    handle: u32,
    remote_handle: Option<u32>,
    local: EndpointState,
    remote: EndpointState,
    source: Terminus,
    target: Terminus,
    remote_source: Terminus,
    remote_target: Terminus,
    credit: u32,
    delivery_count: u32,
    drain: bool,
    /// Outgoing delivery being written, or incoming delivery still partial
    current: Option<DeliveryId>,
    next_delivery_number: u32,
    /// Unsettled deliveries by sender-assigned number
    unsettled: HashMap<u32, DeliveryId>,
    finalized: bool,
}

#[derive(Debug)]
struct DeliveryRecord {
    link: LinkId,
    number: u32,
    tag: DeliveryTag,
    buffer: Vec<u8>,
    partial: bool,
    local_settled: bool,
    remote_settled: bool,
    local_outcome: Option<Outcome>,
    remote_outcome: Option<Outcome>,
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

/// Arena of endpoints plus the event collector
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    connections: HashMap<ConnectionId, ConnectionRecord>,
    sessions: HashMap<SessionId, SessionRecord>,
    links: HashMap<LinkId, LinkRecord>,
    deliveries: HashMap<DeliveryId, DeliveryRecord>,
    events: VecDeque<Event>,
    /// Settled deliveries freed before the next event is handed out
    reclaim: Vec<DeliveryId>,
    /// Connections whose final event has been handed out
    finished: HashSet<ConnectionId>,
    next_id: u32,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Create an engine with default configuration
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create an engine with custom configuration
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            connections: HashMap::default(),
            sessions: HashMap::default(),
            links: HashMap::default(),
            deliveries: HashMap::default(),
            events: VecDeque::new(),
            reclaim: Vec::new(),
            finished: HashSet::default(),
            next_id: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    fn post(&mut self, event: Event) {
        trace!("Posting {:?}", event);
        self.events.push_back(event);
    }

    // ------------------------------------------------------------------------
    // Collector
    // ------------------------------------------------------------------------

    /// Pop the next live event
    ///
    /// Deliveries settled while the previous event was dispatched are freed
    /// first; events that refer to freed or released endpoints are skipped.
    pub fn next_event(&mut self) -> Option<Event> {
        for delivery in self.reclaim.drain(..) {
            self.deliveries.remove(&delivery);
        }

        while let Some(event) = self.events.pop_front() {
            if !self.is_live(&event) {
                trace!("Skipping stale {:?}", event);
                continue;
            }
            if let Event::Final(Endpoint::Connection(connection)) = event {
                self.finished.insert(connection);
            }
            return Some(event);
        }
        None
    }

    /// Check whether events are waiting
    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Dispatch every pending event to each handler in order
    ///
    /// Returns the number of events dispatched.
    pub fn process_events(&mut self, handlers: &mut [&mut dyn EventHandler]) -> usize {
        let mut dispatched = 0;
        while let Some(event) = self.next_event() {
            for handler in handlers.iter_mut() {
                event.dispatch(self, &mut **handler);
            }
            dispatched += 1;
        }
        dispatched
    }

    fn is_live(&self, event: &Event) -> bool {
        match *event {
            Event::Init(endpoint)
            | Event::Open(endpoint)
            | Event::RemoteOpen(endpoint)
            | Event::Close(endpoint)
            | Event::RemoteClose(endpoint)
            | Event::Final(endpoint) => self.contains(endpoint),
            Event::Flow(link) => self.links.contains_key(&link),
            Event::Transport(connection) => self.connections.contains_key(&connection),
            Event::Delivery(delivery) => self.deliveries.contains_key(&delivery),
        }
    }

    // ------------------------------------------------------------------------
    // Record Lookup
    // ------------------------------------------------------------------------

    fn connection_record(&self, id: ConnectionId) -> Result<&ConnectionRecord> {
        self.connections.get(&id).ok_or_else(|| {
            EngineError::UnknownEndpoint {
                kind: "connection",
                id: id.0,
            }
            .into()
        })
    }

    fn connection_record_mut(&mut self, id: ConnectionId) -> Result<&mut ConnectionRecord> {
        self.connections.get_mut(&id).ok_or_else(|| {
            EngineError::UnknownEndpoint {
                kind: "connection",
                id: id.0,
            }
            .into()
        })
    }

    fn session_record(&self, id: SessionId) -> Result<&SessionRecord> {
        self.sessions.get(&id).ok_or_else(|| {
            EngineError::UnknownEndpoint {
                kind: "session",
                id: id.0,
            }
            .into()
        })
    }

    fn session_record_mut(&mut self, id: SessionId) -> Result<&mut SessionRecord> {
        self.sessions.get_mut(&id).ok_or_else(|| {
            EngineError::UnknownEndpoint {
                kind: "session",
                id: id.0,
            }
            .into()
        })
    }

    fn link_record(&self, id: LinkId) -> Result<&LinkRecord> {
        self.links.get(&id).ok_or_else(|| {
            EngineError::UnknownEndpoint {
                kind: "link",
                id: id.0,
            }
            .into()
        })
    }

    fn link_record_mut(&mut self, id: LinkId) -> Result<&mut LinkRecord> {
        self.links.get_mut(&id).ok_or_else(|| {
            EngineError::UnknownEndpoint {
                kind: "link",
                id: id.0,
            }
            .into()
        })
    }

    fn delivery_record(&self, id: DeliveryId) -> Result<&DeliveryRecord> {
        self.deliveries
            .get(&id)
            .ok_or_else(|| EngineError::UnknownDelivery { id: id.0 }.into())
    }

    fn delivery_record_mut(&mut self, id: DeliveryId) -> Result<&mut DeliveryRecord> {
        self.deliveries
            .get_mut(&id)
            .ok_or_else(|| EngineError::UnknownDelivery { id: id.0 }.into())
    }

    fn require_role(&self, link: LinkId, expected: Role) -> Result<&LinkRecord> {
        let record = self.link_record(link)?;
        if record.role != expected {
            return Err(EngineError::WrongRole {
                link: link.0,
                expected: expected.as_str(),
                actual: record.role.as_str(),
            }
            .into());
        }
        Ok(record)
    }

    // ------------------------------------------------------------------------
    // Endpoint Creation
    // ------------------------------------------------------------------------

    /// Create a connection
    pub fn connection(&mut self) -> ConnectionId {
        let id = ConnectionId(self.allocate_id());
        let container_id = format!("{}-{}", self.config.container_prefix, Uuid::new_v4());
        self.connections.insert(
            id,
            ConnectionRecord {
                local: EndpointState::Uninitialized,
                remote: EndpointState::Uninitialized,
                hostname: None,
                container_id,
                remote_container_id: None,
                sessions: Vec::new(),
                next_channel: 0,
                remote_channels: HashMap::default(),
                output: VecDeque::new(),
                output_closed: false,
                finalized: false,
            },
        );
        self.post(Event::Init(Endpoint::Connection(id)));
        id
    }

    /// Create a session on a connection
    pub fn session(&mut self, connection: ConnectionId) -> Result<SessionId> {
        let id = SessionId(self.allocate_id());
        let record = self.connection_record_mut(connection)?;
        let channel = record.next_channel;
        record.next_channel = record.next_channel.wrapping_add(1);
        record.sessions.push(id);

        self.sessions.insert(
            id,
            SessionRecord {
                connection,
                local: EndpointState::Uninitialized,
                remote: EndpointState::Uninitialized,
                channel,
                remote_channel: None,
                links: Vec::new(),
                next_handle: 0,
                remote_handles: HashMap::default(),
                finalized: false,
            },
        );
        self.post(Event::Init(Endpoint::Session(id)));
        Ok(id)
    }

    /// Create an outgoing link on a session
    pub fn sender(&mut self, session: SessionId, name: &str) -> Result<LinkId> {
        self.create_link(session, name, Role::Sender)
    }

    /// Create an incoming link on a session
    pub fn receiver(&mut self, session: SessionId, name: &str) -> Result<LinkId> {
        self.create_link(session, name, Role::Receiver)
    }

    fn create_link(&mut self, session: SessionId, name: &str, role: Role) -> Result<LinkId> {
        let id = LinkId(self.allocate_id());
        let record = self.session_record_mut(session)?;
        let handle = record.next_handle;
        record.next_handle = record.next_handle.wrapping_add(1);
        record.links.push(id);
        let connection = record.connection;

        self.links.insert(
            id,
            LinkRecord {
                session,
                connection,
                name: name.to_string(),
                role,
                handle,
                remote_handle: None,
                local: EndpointState::Uninitialized,
                remote: EndpointState::Uninitialized,
                source: Terminus::default(),
                target: Terminus::default(),
                remote_source: Terminus::default(),
                remote_target: Terminus::default(),
                credit: 0,
                delivery_count: 0,
                drain: false,
                current: None,
                next_delivery_number: 0,
                unsettled: HashMap::default(),
                finalized: false,
            },
        );
        self.post(Event::Init(Endpoint::Link(id)));
        Ok(id)
    }

    // ------------------------------------------------------------------------
    // Endpoint Queries
    // ------------------------------------------------------------------------

    /// Check whether the endpoint still exists
    pub fn contains(&self, endpoint: Endpoint) -> bool {
        match endpoint {
            Endpoint::Connection(id) => self.connections.contains_key(&id),
            Endpoint::Session(id) => self.sessions.contains_key(&id),
            Endpoint::Link(id) => self.links.contains_key(&id),
        }
    }

    /// Number of connections not yet released
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Ids of all connections not yet released
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Local lifecycle state of an endpoint
    pub fn local_state(&self, endpoint: Endpoint) -> Result<EndpointState> {
        Ok(match endpoint {
            Endpoint::Connection(id) => self.connection_record(id)?.local,
            Endpoint::Session(id) => self.session_record(id)?.local,
            Endpoint::Link(id) => self.link_record(id)?.local,
        })
    }

    /// Remote lifecycle state of an endpoint
    pub fn remote_state(&self, endpoint: Endpoint) -> Result<EndpointState> {
        Ok(match endpoint {
            Endpoint::Connection(id) => self.connection_record(id)?.remote,
            Endpoint::Session(id) => self.session_record(id)?.remote,
            Endpoint::Link(id) => self.link_record(id)?.remote,
        })
    }

    /// Connection that owns the endpoint
    pub fn connection_of(&self, endpoint: Endpoint) -> Result<ConnectionId> {
        Ok(match endpoint {
            Endpoint::Connection(id) => {
                self.connection_record(id)?;
                id
            }
            Endpoint::Session(id) => self.session_record(id)?.connection,
            Endpoint::Link(id) => self.link_record(id)?.connection,
        })
    }

    /// Session that owns the link
    pub fn session_of(&self, link: LinkId) -> Result<SessionId> {
        Ok(self.link_record(link)?.session)
    }

    /// Check whether the endpoint and every endpoint above it are open both ways
    pub fn is_usable(&self, endpoint: Endpoint) -> bool {
        let open = |local: EndpointState, remote: EndpointState| {
            local == EndpointState::Active && remote == EndpointState::Active
        };
        match endpoint {
            Endpoint::Connection(id) => self
                .connections
                .get(&id)
                .is_some_and(|c| open(c.local, c.remote) && !c.output_closed),
            Endpoint::Session(id) => self.sessions.get(&id).is_some_and(|s| {
                open(s.local, s.remote) && self.is_usable(Endpoint::Connection(s.connection))
            }),
            Endpoint::Link(id) => self.links.get(&id).is_some_and(|l| {
                open(l.local, l.remote) && self.is_usable(Endpoint::Session(l.session))
            }),
        }
    }

    pub fn set_hostname(&mut self, connection: ConnectionId, hostname: &str) -> Result<()> {
        self.connection_record_mut(connection)?.hostname = Some(hostname.to_string());
        Ok(())
    }

    pub fn hostname(&self, connection: ConnectionId) -> Result<Option<&str>> {
        Ok(self.connection_record(connection)?.hostname.as_deref())
    }

    pub fn container_id(&self, connection: ConnectionId) -> Result<&str> {
        Ok(&self.connection_record(connection)?.container_id)
    }

    pub fn remote_container_id(&self, connection: ConnectionId) -> Result<Option<&str>> {
        Ok(self
            .connection_record(connection)?
            .remote_container_id
            .as_deref())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Open the local half of an endpoint
    ///
    /// Opening an endpoint that is already open or closed does nothing.
    pub fn open(&mut self, endpoint: Endpoint) -> Result<()> {
        if self.local_state(endpoint)? != EndpointState::Uninitialized {
            return Ok(());
        }

        match endpoint {
            Endpoint::Connection(id) => {
                let record = self.connection_record_mut(id)?;
                record.local = EndpointState::Active;
                let frame = Frame::connection(Performative::Open {
                    container_id: record.container_id.clone(),
                    hostname: record.hostname.clone(),
                });
                self.push_frame(id, frame);
            }
            Endpoint::Session(id) => {
                let record = self.session_record_mut(id)?;
                record.local = EndpointState::Active;
                let connection = record.connection;
                let frame = Frame::session(
                    record.channel,
                    Performative::Begin {
                        remote_channel: record.remote_channel,
                    },
                );
                self.push_frame(connection, frame);
            }
            Endpoint::Link(id) => {
                let session = self.link_record(id)?.session;
                let channel = self.session_record(session)?.channel;
                let record = self.link_record_mut(id)?;
                record.local = EndpointState::Active;
                let connection = record.connection;
                let attach = Frame::session(
                    channel,
                    Performative::Attach {
                        name: record.name.clone(),
                        handle: record.handle,
                        role: record.role,
                        source: record.source.clone(),
                        target: record.target.clone(),
                    },
                );
                let pending_flow =
                    record.role == Role::Receiver && (record.credit > 0 || record.drain);
                self.push_frame(connection, attach);
                if pending_flow {
                    self.push_flow(id)?;
                }
            }
        }

        debug!("Opened {}", endpoint);
        self.post(Event::Open(endpoint));
        Ok(())
    }

    /// Close the local half of an endpoint
    ///
    /// Closing an endpoint that is already closed does nothing.
    pub fn close(&mut self, endpoint: Endpoint) -> Result<()> {
        let previous = self.local_state(endpoint)?;
        if previous == EndpointState::Closed {
            return Ok(());
        }

        match endpoint {
            Endpoint::Connection(id) => {
                self.connection_record_mut(id)?.local = EndpointState::Closed;
                self.push_frame(id, Frame::connection(Performative::Close));
                self.connection_record_mut(id)?.output_closed = true;
            }
            Endpoint::Session(id) => {
                let record = self.session_record_mut(id)?;
                record.local = EndpointState::Closed;
                let (connection, channel) = (record.connection, record.channel);
                if previous == EndpointState::Active {
                    self.push_frame(connection, Frame::session(channel, Performative::End));
                }
            }
            Endpoint::Link(id) => {
                let session = self.link_record(id)?.session;
                let channel = self.session_record(session)?.channel;
                let record = self.link_record_mut(id)?;
                record.local = EndpointState::Closed;
                let (connection, handle) = (record.connection, record.handle);
                if previous == EndpointState::Active {
                    self.push_frame(
                        connection,
                        Frame::session(channel, Performative::Detach { handle }),
                    );
                }
            }
        }

        debug!("Closed {}", endpoint);
        self.post(Event::Close(endpoint));
        self.check_final(endpoint);
        Ok(())
    }

    /// Post final events once both halves of an endpoint are closed
    ///
    /// A connection going final takes its sessions and links with it.
    fn check_final(&mut self, endpoint: Endpoint) {
        let closed = |local: EndpointState, remote: EndpointState| {
            local == EndpointState::Closed && remote == EndpointState::Closed
        };
        match endpoint {
            Endpoint::Link(id) => {
                if let Some(record) = self.links.get_mut(&id) {
                    if !record.finalized && closed(record.local, record.remote) {
                        record.finalized = true;
                        self.post(Event::Final(endpoint));
                    }
                }
            }
            Endpoint::Session(id) => {
                let ready = self
                    .sessions
                    .get(&id)
                    .is_some_and(|s| !s.finalized && closed(s.local, s.remote));
                if ready {
                    self.finalize_session(id);
                }
            }
            Endpoint::Connection(id) => {
                let ready = self
                    .connections
                    .get(&id)
                    .is_some_and(|c| !c.finalized && closed(c.local, c.remote));
                if ready {
                    let sessions = self
                        .connections
                        .get(&id)
                        .map(|c| c.sessions.clone())
                        .unwrap_or_default();
                    for session in sessions {
                        self.finalize_session(session);
                    }
                    if let Some(record) = self.connections.get_mut(&id) {
                        record.finalized = true;
                    }
                    self.post(Event::Final(endpoint));
                }
            }
        }
    }

    fn finalize_session(&mut self, id: SessionId) {
        let links = match self.sessions.get(&id) {
            Some(record) if !record.finalized => record.links.clone(),
            _ => return,
        };
        for link in links {
            if let Some(record) = self.links.get_mut(&link) {
                if !record.finalized {
                    record.finalized = true;
                    self.post(Event::Final(Endpoint::Link(link)));
                }
            }
        }
        if let Some(record) = self.sessions.get_mut(&id) {
            record.finalized = true;
        }
        self.post(Event::Final(Endpoint::Session(id)));
    }

    // ------------------------------------------------------------------------
    // Link Attributes
    // ------------------------------------------------------------------------

    pub fn role(&self, link: LinkId) -> Result<Role> {
        Ok(self.link_record(link)?.role)
    }

    pub fn link_name(&self, link: LinkId) -> Result<&str> {
        Ok(&self.link_record(link)?.name)
    }

    pub fn source(&self, link: LinkId) -> Result<&Terminus> {
        Ok(&self.link_record(link)?.source)
    }

    pub fn target(&self, link: LinkId) -> Result<&Terminus> {
        Ok(&self.link_record(link)?.target)
    }

    pub fn remote_source(&self, link: LinkId) -> Result<&Terminus> {
        Ok(&self.link_record(link)?.remote_source)
    }

    pub fn remote_target(&self, link: LinkId) -> Result<&Terminus> {
        Ok(&self.link_record(link)?.remote_target)
    }

    pub fn set_source(&mut self, link: LinkId, source: Terminus) -> Result<()> {
        self.link_record_mut(link)?.source = source;
        Ok(())
    }

    pub fn set_target(&mut self, link: LinkId, target: Terminus) -> Result<()> {
        self.link_record_mut(link)?.target = target;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Credit
    // ------------------------------------------------------------------------

    /// Outstanding credit on the link
    ///
    /// For a receiver this is the credit granted to the peer; for a sender it
    /// is the credit the peer granted and that is still unused.
    pub fn credit(&self, link: LinkId) -> Result<u32> {
        Ok(self.link_record(link)?.credit)
    }

    /// Delivery count of the link
    pub fn delivery_count(&self, link: LinkId) -> Result<u32> {
        Ok(self.link_record(link)?.delivery_count)
    }

    /// Grant `credit` more transfers to the peer sender
    pub fn flow(&mut self, link: LinkId, credit: u32) -> Result<()> {
        self.require_role(link, Role::Receiver)?;
        let record = self.link_record_mut(link)?;
        record.credit = record.credit.saturating_add(credit);
        if record.local == EndpointState::Active {
            self.push_flow(link)?;
        }
        Ok(())
    }

    /// Grant `credit` more transfers and ask the peer to return what it cannot use
    pub fn drain(&mut self, link: LinkId, credit: u32) -> Result<()> {
        self.require_role(link, Role::Receiver)?;
        let record = self.link_record_mut(link)?;
        record.drain = true;
        record.credit = record.credit.saturating_add(credit);
        if record.local == EndpointState::Active {
            self.push_flow(link)?;
        }
        Ok(())
    }

    /// Check whether a drain round is in progress on the link
    pub fn draining(&self, link: LinkId) -> Result<bool> {
        let record = self.link_record(link)?;
        Ok(record.drain && record.credit > 0)
    }

    /// Declare that the sender has nothing more to send
    ///
    /// During a drain round the remaining credit is consumed and echoed back
    /// to the receiver. Returns the amount of credit drained.
    pub fn drained(&mut self, link: LinkId) -> Result<u32> {
        self.require_role(link, Role::Sender)?;
        let record = self.link_record_mut(link)?;
        if !record.drain || record.credit == 0 {
            return Ok(0);
        }

        let drained = record.credit;
        record.delivery_count = record.delivery_count.wrapping_add(drained);
        record.credit = 0;
        debug!("Link {} drained {} credit", link, drained);
        self.push_flow(link)?;
        Ok(drained)
    }

    fn push_flow(&mut self, link: LinkId) -> Result<()> {
        let session = self.link_record(link)?.session;
        let channel = self.session_record(session)?.channel;
        let record = self.link_record(link)?;
        let frame = Frame::session(
            channel,
            Performative::Flow {
                handle: record.handle,
                delivery_count: record.delivery_count,
                link_credit: record.credit,
                drain: record.drain,
            },
        );
        let connection = record.connection;
        self.push_frame(connection, frame);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Start a new outgoing delivery; it becomes the link's current delivery
    pub fn delivery(&mut self, link: LinkId, tag: DeliveryTag) -> Result<DeliveryId> {
        self.require_role(link, Role::Sender)?;
        if self.link_record(link)?.current.is_some() {
            return Err(EngineError::Protocol {
                reason: format!("link {} already has a delivery in progress", link),
            }
            .into());
        }

        let id = DeliveryId(self.allocate_id());
        let record = self.link_record_mut(link)?;
        let number = record.next_delivery_number;
        record.next_delivery_number = record.next_delivery_number.wrapping_add(1);
        record.current = Some(id);

        self.deliveries.insert(
            id,
            DeliveryRecord {
                link,
                number,
                tag,
                buffer: Vec::new(),
                partial: true,
                local_settled: false,
                remote_settled: false,
                local_outcome: None,
                remote_outcome: None,
            },
        );
        Ok(id)
    }

    /// Append bytes to the link's current delivery
    pub fn send(&mut self, link: LinkId, bytes: &[u8]) -> Result<usize> {
        let current = self
            .require_role(link, Role::Sender)?
            .current
            .ok_or(EngineError::NoCurrentDelivery { link: link.0 })?;
        self.delivery_record_mut(current)?
            .buffer
            .extend_from_slice(bytes);
        Ok(bytes.len())
    }

    /// Transmit the current delivery unsettled and move on to the next one
    pub fn advance(&mut self, link: LinkId) -> Result<Option<DeliveryId>> {
        let current = match self.require_role(link, Role::Sender)?.current {
            Some(current) => current,
            None => return Ok(None),
        };
        self.transmit(link, current, false)?;
        let number = self.delivery_record(current)?.number;
        self.link_record_mut(link)?.unsettled.insert(number, current);
        Ok(Some(current))
    }

    /// Split a delivery into transfer frames and consume one unit of credit
    fn transmit(&mut self, link: LinkId, delivery: DeliveryId, settled: bool) -> Result<()> {
        let session = self.link_record(link)?.session;
        let channel = self.session_record(session)?.channel;

        let record = self.link_record_mut(link)?;
        if record.credit == 0 {
            return Err(EngineError::NoCredit { link: link.0 }.into());
        }
        record.credit -= 1;
        record.delivery_count = record.delivery_count.wrapping_add(1);
        record.current = None;
        let (connection, handle) = (record.connection, record.handle);

        let max_payload = self.config.max_frame_payload.max(1);
        let delivery_record = self.delivery_record_mut(delivery)?;
        delivery_record.partial = false;
        let payload = core::mem::take(&mut delivery_record.buffer);
        let (number, tag) = (delivery_record.number, delivery_record.tag.clone());

        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![&payload[..]]
        } else {
            payload.chunks(max_payload).collect()
        };
        let last = chunks.len() - 1;
        let frames: Vec<Frame> = chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                Frame::session(
                    channel,
                    Performative::Transfer {
                        handle,
                        delivery_number: number,
                        tag: tag.clone(),
                        settled,
                        more: index < last,
                        payload: chunk.to_vec(),
                    },
                )
            })
            .collect();

        trace!("Transmitting delivery {} as {} frame(s)", delivery, frames.len());
        for frame in frames {
            self.push_frame(connection, frame);
        }
        Ok(())
    }

    /// The link's current delivery: being written (sender) or still partial (receiver)
    pub fn current(&self, link: LinkId) -> Result<Option<DeliveryId>> {
        Ok(self.link_record(link)?.current)
    }

    // ------------------------------------------------------------------------
    // Deliveries
    // ------------------------------------------------------------------------

    /// Link the delivery travels on
    pub fn delivery_link(&self, delivery: DeliveryId) -> Result<LinkId> {
        Ok(self.delivery_record(delivery)?.link)
    }

    pub fn tag(&self, delivery: DeliveryId) -> Result<&DeliveryTag> {
        Ok(&self.delivery_record(delivery)?.tag)
    }

    /// Number of received bytes not yet read
    pub fn pending(&self, delivery: DeliveryId) -> Result<usize> {
        Ok(self.delivery_record(delivery)?.buffer.len())
    }

    /// Take the received bytes of a delivery
    pub fn recv(&mut self, delivery: DeliveryId) -> Result<Vec<u8>> {
        Ok(core::mem::take(&mut self.delivery_record_mut(delivery)?.buffer))
    }

    /// Check whether more transfer frames are expected for the delivery
    pub fn is_partial(&self, delivery: DeliveryId) -> Result<bool> {
        Ok(self.delivery_record(delivery)?.partial)
    }

    pub fn remote_outcome(&self, delivery: DeliveryId) -> Result<Option<Outcome>> {
        Ok(self.delivery_record(delivery)?.remote_outcome)
    }

    pub fn remote_settled(&self, delivery: DeliveryId) -> Result<bool> {
        Ok(self.delivery_record(delivery)?.remote_settled)
    }

    pub fn local_outcome(&self, delivery: DeliveryId) -> Result<Option<Outcome>> {
        Ok(self.delivery_record(delivery)?.local_outcome)
    }

    /// Record the local outcome and report it to the peer
    pub fn disposition(&mut self, delivery: DeliveryId, outcome: Outcome) -> Result<()> {
        let record = self.delivery_record_mut(delivery)?;
        record.local_outcome = Some(outcome);
        let notify = !record.local_settled && !record.remote_settled && !record.partial;
        if notify {
            self.push_disposition(delivery, false)?;
        }
        Ok(())
    }

    /// Settle a delivery locally
    ///
    /// Settling a sender's current delivery transmits it pre-settled. The
    /// delivery is freed once the event being dispatched has reached every
    /// handler.
    pub fn settle(&mut self, delivery: DeliveryId) -> Result<()> {
        let record = self.delivery_record(delivery)?;
        if record.local_settled {
            return Ok(());
        }
        let (link, number, remote_settled, partial) =
            (record.link, record.number, record.remote_settled, record.partial);
        let link_record = self.link_record(link)?;
        let (role, is_current) = (link_record.role, link_record.current == Some(delivery));

        match role {
            Role::Sender if is_current => self.transmit(link, delivery, true)?,
            _ if !remote_settled => self.push_disposition(delivery, true)?,
            _ => {}
        }

        self.delivery_record_mut(delivery)?.local_settled = true;
        self.link_record_mut(link)?.unsettled.remove(&number);

        // An incoming delivery settled mid-transfer keeps absorbing its
        // remaining frames and is freed when the last one arrives.
        if !(role == Role::Receiver && partial) {
            self.reclaim.push(delivery);
        }
        Ok(())
    }

    /// Check whether the delivery has been settled locally
    pub fn is_settled(&self, delivery: DeliveryId) -> Result<bool> {
        Ok(self.delivery_record(delivery)?.local_settled)
    }

    fn push_disposition(&mut self, delivery: DeliveryId, settled: bool) -> Result<()> {
        let record = self.delivery_record(delivery)?;
        let (link, number, outcome) = (record.link, record.number, record.local_outcome);
        let link_record = self.link_record(link)?;
        let (session, connection, handle) =
            (link_record.session, link_record.connection, link_record.handle);
        let channel = self.session_record(session)?.channel;
        self.push_frame(
            connection,
            Frame::session(
                channel,
                Performative::Disposition {
                    handle,
                    delivery_number: number,
                    settled,
                    outcome,
                },
            ),
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Transport Boundary
    // ------------------------------------------------------------------------

    fn push_frame(&mut self, connection: ConnectionId, frame: Frame) {
        let Some(record) = self.connections.get_mut(&connection) else {
            return;
        };
        if record.output_closed {
            trace!("Dropping {} frame for closed connection {}", frame.name(), connection);
            return;
        }
        let was_idle = record.output.is_empty();
        record.output.push_back(frame);
        if was_idle {
            self.post(Event::Transport(connection));
        }
    }

    /// Take every frame queued for the connection's transport
    pub fn take_output(&mut self, connection: ConnectionId) -> Vec<Frame> {
        self.connections
            .get_mut(&connection)
            .map(|record| record.output.drain(..).collect())
            .unwrap_or_default()
    }

    /// Check whether the connection has frames waiting
    pub fn has_output(&self, connection: ConnectionId) -> bool {
        self.connections
            .get(&connection)
            .is_some_and(|record| !record.output.is_empty())
    }

    /// The transport under a connection is gone
    ///
    /// Every endpoint the peer had not closed is marked remotely closed,
    /// links first, then sessions, then the connection.
    pub fn transport_closed(&mut self, connection: ConnectionId) {
        let Some(record) = self.connections.get_mut(&connection) else {
            return;
        };
        record.output_closed = true;
        record.output.clear();
        let sessions = record.sessions.clone();
        debug!("Transport closed for connection {}", connection);

        let mut endpoints: Vec<Endpoint> = Vec::new();
        for session in &sessions {
            if let Some(session_record) = self.sessions.get(session) {
                endpoints.extend(session_record.links.iter().map(|l| Endpoint::Link(*l)));
            }
        }
        endpoints.extend(sessions.iter().map(|s| Endpoint::Session(*s)));
        endpoints.push(Endpoint::Connection(connection));

        for endpoint in endpoints {
            let remote = match endpoint {
                Endpoint::Connection(id) => self.connections.get_mut(&id).map(|r| &mut r.remote),
                Endpoint::Session(id) => self.sessions.get_mut(&id).map(|r| &mut r.remote),
                Endpoint::Link(id) => self.links.get_mut(&id).map(|r| &mut r.remote),
            };
            if let Some(remote) = remote {
                if *remote != EndpointState::Closed {
                    *remote = EndpointState::Closed;
                    self.post(Event::RemoteClose(endpoint));
                    self.check_final(endpoint);
                }
            }
        }
    }

    /// Connections whose final event has been dispatched and that can be released
    pub fn finished_connections(&self) -> Vec<ConnectionId> {
        self.finished.iter().copied().collect()
    }

    /// Free a connection and everything it owns
    pub fn release(&mut self, connection: ConnectionId) {
        let Some(record) = self.connections.remove(&connection) else {
            return;
        };
        self.finished.remove(&connection);

        let mut released_links: HashSet<LinkId> = HashSet::default();
        for session in record.sessions {
            if let Some(session_record) = self.sessions.remove(&session) {
                for link in session_record.links {
                    self.links.remove(&link);
                    released_links.insert(link);
                }
            }
        }
        self.deliveries
            .retain(|_, delivery| !released_links.contains(&delivery.link));
        debug!("Released connection {}", connection);
    }
}
