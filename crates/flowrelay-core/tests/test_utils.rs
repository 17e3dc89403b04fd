//! Test utilities for driving relay and client engines in memory
//!
//! A `RelayServer` bundles the relay's engine with its handler stack. Each
//! `Client` owns its own engine, a pool and a loopback to the server, so
//! several clients can be stepped against one relay deterministically.

#![allow(dead_code)]

use flowrelay_core::{
    Address, Endpoint, Engine, EngineConfig, EventHandler, FlowController, Frame, Handshaker,
    LinkId, Loopback, Performative, Pool, Relay, RelayConfig, Role, Terminus,
};

/// Rounds allowed before a scenario is considered stuck
pub const MAX_ROUNDS: usize = 1_000;

// ----------------------------------------------------------------------------
// Relay Server
// ----------------------------------------------------------------------------

pub struct RelayServer {
    pub engine: Engine,
    pub handshaker: Handshaker,
    pub flow: FlowController,
    pub relay: Relay,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self::with_engine(config, EngineConfig::default())
    }

    pub fn with_engine(config: RelayConfig, engine: EngineConfig) -> Self {
        Self {
            engine: Engine::with_config(engine),
            handshaker: Handshaker::new(),
            flow: FlowController::new(config.credit_window).unwrap(),
            relay: Relay::new(&config),
        }
    }
}

// ----------------------------------------------------------------------------
// Clients
// ----------------------------------------------------------------------------

pub trait Peer {
    /// Run one loopback round against the server; true if anything moved
    fn step(&mut self, server: &mut RelayServer) -> bool;
}

pub struct Client<H> {
    pub engine: Engine,
    pub handshaker: Handshaker,
    pub handler: H,
    pub pool: Pool,
    pub link: LinkId,
    loopback: Loopback,
}

impl<H: EventHandler> Client<H> {
    /// Client consuming from `address` through the relay
    pub fn incoming(server: &mut RelayServer, address: &str, handler: H) -> Self {
        Self::connect(server, address, handler, false, EngineConfig::default())
    }

    /// Client publishing to `address` through the relay
    pub fn outgoing(server: &mut RelayServer, address: &str, handler: H) -> Self {
        Self::connect(server, address, handler, true, EngineConfig::default())
    }

    pub fn connect(
        server: &mut RelayServer,
        address: &str,
        handler: H,
        outgoing: bool,
        config: EngineConfig,
    ) -> Self {
        let mut engine = Engine::with_config(config);
        let mut pool = Pool::new();
        let link = pool.resolve(&mut engine, address, None, outgoing).unwrap();
        let connection = engine.connection_of(Endpoint::Link(link)).unwrap();

        let mut loopback = Loopback::new();
        loopback.connect(connection, &mut server.engine);

        Self {
            engine,
            handshaker: Handshaker::new(),
            handler,
            pool,
            link,
            loopback,
        }
    }

    /// True once the client connection has been released on both ends
    pub fn is_disconnected(&self) -> bool {
        self.loopback.is_empty() && self.engine.connection_count() == 0
    }
}

impl<H: EventHandler> Peer for Client<H> {
    fn step(&mut self, server: &mut RelayServer) -> bool {
        let mut server_handlers: [&mut dyn EventHandler; 3] =
            [&mut server.handshaker, &mut server.flow, &mut server.relay];
        let mut client_handlers: [&mut dyn EventHandler; 2] =
            [&mut self.handshaker, &mut self.handler];
        self.loopback
            .step(
                &mut self.engine,
                &mut client_handlers,
                &mut server.engine,
                &mut server_handlers,
            )
            .unwrap()
    }
}

/// Step every peer until nothing moves
pub fn run(server: &mut RelayServer, peers: &mut [&mut dyn Peer]) {
    for _ in 0..MAX_ROUNDS {
        let mut progressed = false;
        for peer in peers.iter_mut() {
            progressed |= peer.step(server);
        }
        if !progressed {
            return;
        }
    }
    panic!("scenario did not settle within {} rounds", MAX_ROUNDS);
}

// ----------------------------------------------------------------------------
// Engine Fixtures
// ----------------------------------------------------------------------------

/// Sending link attached by a scripted peer that granted `credit`
pub fn credited_sender(engine: &mut Engine, address: &str, credit: u32, drain: bool) -> LinkId {
    let connection = engine.connection();
    engine.open(Endpoint::Connection(connection)).unwrap();
    let session = engine.session(connection).unwrap();
    engine.open(Endpoint::Session(session)).unwrap();
    let link = engine.sender(session, "out").unwrap();
    engine
        .set_source(link, Terminus::new(Address::from(address)))
        .unwrap();
    engine.open(Endpoint::Link(link)).unwrap();

    let frames = [
        Frame::connection(Performative::Open {
            container_id: "scripted-peer".to_string(),
            hostname: None,
        }),
        Frame::session(0, Performative::Begin { remote_channel: Some(0) }),
        Frame::session(
            0,
            Performative::Attach {
                name: "out".to_string(),
                handle: 0,
                role: Role::Receiver,
                source: Terminus::new(Address::from(address)),
                target: Terminus::default(),
            },
        ),
        Frame::session(
            0,
            Performative::Flow {
                handle: 0,
                delivery_count: 0,
                link_credit: credit,
                drain,
            },
        ),
    ];
    for frame in frames {
        engine.input(connection, frame).unwrap();
    }
    link
}
