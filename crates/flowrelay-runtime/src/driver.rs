//! Event-processing driver
//!
//! The driver owns the engine and is the only task that touches it. Each
//! iteration dispatches every pending engine event, flushes queued frames to
//! the transport tasks and releases connections that reached their final
//! state. It then waits for the next accepted socket, transport input or idle
//! tick. The loop returns once there is no listener and no live connection.

use std::future;
use std::io;
use std::net::SocketAddr;

use flowrelay_core::{ConnectionId, Endpoint, Engine, Event, EventHandler, Result};
use hashbrown::{HashMap, HashSet};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::DriverConfig;
use crate::transport::{InputSender, Transport, TransportInput};

/// Single-task driver pumping one engine over TCP
pub struct Driver {
    engine: Engine,
    config: DriverConfig,
    listener: Option<TcpListener>,
    transports: HashMap<ConnectionId, Transport>,
    connecting: HashSet<ConnectionId>,
    inbound_tx: InputSender,
    inbound_rx: mpsc::UnboundedReceiver<TransportInput>,
    idle: Option<Interval>,
    connect_error: Option<io::Error>,
}

impl Driver {
    /// Create a driver for `engine`
    pub fn new(engine: Engine, config: DriverConfig) -> Result<Self> {
        config.validate(engine.config().max_frame_payload)?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Ok(Self {
            engine,
            config,
            listener: None,
            transports: HashMap::default(),
            connecting: HashSet::default(),
            inbound_tx,
            inbound_rx,
            idle: None,
            connect_error: None,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Engine access for setting up connections before `run`
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Accept incoming connections on `host:port`, returning the bound address
    pub async fn listen(&mut self, host: &str, port: u16) -> Result<SocketAddr> {
        let listener = TcpListener::bind((host, port)).await?;
        let local = listener.local_addr()?;
        info!("Listening on {}", local);
        self.listener = Some(listener);
        Ok(local)
    }

    /// Drive the engine until no listener and no connection remain
    ///
    /// Handlers see every event in the order given, after the driver's own
    /// hook. A failed outbound connect is reported once the loop ends.
    pub async fn run(&mut self, handlers: &mut [&mut dyn EventHandler]) -> Result<()> {
        if let Some(timeout) = self.config.idle_timeout() {
            let mut ticker = interval(timeout / 2);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.idle = Some(ticker);
        }

        loop {
            self.process_events(handlers);
            self.flush();
            self.release_finished();

            if self.engine.has_events() {
                continue;
            }
            if self.listener.is_none() && self.engine.connection_count() == 0 {
                debug!("No connections left, driver exiting");
                return match self.connect_error.take() {
                    Some(e) => Err(e.into()),
                    None => Ok(()),
                };
            }

            tokio::select! {
                accepted = accept(&self.listener) => {
                    match accepted {
                        Ok((stream, peer)) => self.accept(stream, peer),
                        Err(e) => warn!("Accept failed: {}", e),
                    }
                }
                Some(input) = self.inbound_rx.recv() => {
                    self.handle_input(input);
                }
                _ = tick(&mut self.idle) => {
                    self.expire_idle();
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Event Processing
    // ------------------------------------------------------------------------

    fn process_events(&mut self, handlers: &mut [&mut dyn EventHandler]) {
        while let Some(event) = self.engine.next_event() {
            if let Event::Open(Endpoint::Connection(connection)) = event {
                self.connect(connection);
            }
            for handler in handlers.iter_mut() {
                event.dispatch(&mut self.engine, &mut **handler);
            }
        }
    }

    fn flush(&mut self) {
        for (connection, transport) in &self.transports {
            for frame in self.engine.take_output(*connection) {
                if !transport.send(frame) {
                    debug!("Writer for connection {} is gone", connection);
                    break;
                }
            }
        }
    }

    fn release_finished(&mut self) {
        for connection in self.engine.finished_connections() {
            self.engine.release(connection);
            self.connecting.remove(&connection);
            if self.transports.remove(&connection).is_some() {
                debug!("Dropped transport for connection {}", connection);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------------

    /// Start an outbound connect for a locally opened connection with a hostname
    fn connect(&mut self, connection: ConnectionId) {
        if self.transports.contains_key(&connection) || self.connecting.contains(&connection) {
            return;
        }
        let address = match self.engine.hostname(connection) {
            Ok(Some(host)) => self.config.socket_address(host),
            _ => return,
        };

        info!("Connecting {} to {}", connection, address);
        self.connecting.insert(connection);
        let inbound = self.inbound_tx.clone();
        tokio::spawn(async move {
            let input = match TcpStream::connect(&address).await {
                Ok(stream) => TransportInput::Connected(connection, stream),
                Err(e) => TransportInput::ConnectFailed(connection, e),
            };
            let _ = inbound.send(input);
        });
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let connection = self.engine.connection();
        info!("Accepted connection {} from {}", connection, peer);
        self.attach(connection, stream);
    }

    fn attach(&mut self, connection: ConnectionId, stream: TcpStream) {
        let transport = Transport::spawn(
            connection,
            stream,
            self.inbound_tx.clone(),
            self.config.max_frame_size,
        );
        self.transports.insert(connection, transport);
    }

    fn drop_transport(&mut self, connection: ConnectionId) {
        self.transports.remove(&connection);
        self.engine.transport_closed(connection);
    }

    fn handle_input(&mut self, input: TransportInput) {
        match input {
            TransportInput::Frame(connection, frame) => {
                let Some(transport) = self.transports.get_mut(&connection) else {
                    return;
                };
                transport.touch();
                if let Err(e) = self.engine.input(connection, frame) {
                    error!("Connection {} sent an invalid frame: {}", connection, e);
                    self.drop_transport(connection);
                }
            }
            TransportInput::Closed(connection, reason) => {
                if self.transports.contains_key(&connection) {
                    debug!(
                        "Connection {} transport closed{}",
                        connection,
                        reason.map(|r| format!(": {}", r)).unwrap_or_default()
                    );
                    self.drop_transport(connection);
                }
            }
            TransportInput::Connected(connection, stream) => {
                self.connecting.remove(&connection);
                if self.engine.contains(Endpoint::Connection(connection)) {
                    debug!("Connection {} established", connection);
                    self.attach(connection, stream);
                }
            }
            TransportInput::ConnectFailed(connection, e) => {
                self.connecting.remove(&connection);
                error!("Connection {} could not connect: {}", connection, e);
                self.connect_error = Some(e);
                self.engine.transport_closed(connection);
            }
        }
    }

    fn expire_idle(&mut self) {
        let Some(timeout) = self.config.idle_timeout() else {
            return;
        };
        let expired: Vec<ConnectionId> = self
            .transports
            .iter()
            .filter(|(_, transport)| transport.last_input().elapsed() >= timeout)
            .map(|(connection, _)| *connection)
            .collect();

        for connection in expired {
            warn!("Connection {} idle for {:?}, closing", connection, timeout);
            self.drop_transport(connection);
        }
    }
}

async fn accept(listener: &Option<TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => future::pending().await,
    }
}

async fn tick(idle: &mut Option<Interval>) {
    match idle {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending().await,
    }
}
