//! In-memory transport between two engines
//!
//! Pairs a connection on one engine with a connection on another and moves
//! frames between them without sockets. Used to exercise full handler stacks
//! deterministically.

use tracing::trace;

use super::{ConnectionId, Engine, EventHandler};
use crate::{RelayError, Result};

/// Upper bound on rounds before `run` gives up
pub const MAX_ROUNDS: usize = 10_000;

/// Frame shuttle between a client engine and a server engine
#[derive(Debug, Default)]
pub struct Loopback {
    /// (client connection, server connection)
    pairs: Vec<(ConnectionId, ConnectionId)>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `client` on the server engine, returning the server-side connection
    pub fn connect(&mut self, client: ConnectionId, server: &mut Engine) -> ConnectionId {
        let accepted = server.connection();
        self.pairs.push((client, accepted));
        accepted
    }

    /// Number of connection pairs still carried
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// One round: dispatch events on both sides, move frames, release finished
    /// connections and report transport loss to the surviving peer
    ///
    /// Returns whether anything happened.
    pub fn step(
        &mut self,
        client: &mut Engine,
        client_handlers: &mut [&mut dyn EventHandler],
        server: &mut Engine,
        server_handlers: &mut [&mut dyn EventHandler],
    ) -> Result<bool> {
        let mut progressed = client.process_events(client_handlers) > 0;
        progressed |= server.process_events(server_handlers) > 0;

        for &(client_conn, server_conn) in &self.pairs {
            for frame in client.take_output(client_conn) {
                trace!("loopback -> {}", frame.name());
                server.input(server_conn, frame)?;
                progressed = true;
            }
            for frame in server.take_output(server_conn) {
                trace!("loopback <- {}", frame.name());
                client.input(client_conn, frame)?;
                progressed = true;
            }
        }

        for connection in client.finished_connections() {
            client.release(connection);
            progressed = true;
        }
        for connection in server.finished_connections() {
            server.release(connection);
            progressed = true;
        }

        let before = self.pairs.len();
        self.pairs.retain(|&(client_conn, server_conn)| {
            let client_alive = client.contains(client_conn.into());
            let server_alive = server.contains(server_conn.into());
            if client_alive && !server_alive {
                client.transport_closed(client_conn);
            } else if server_alive && !client_alive {
                server.transport_closed(server_conn);
            }
            client_alive || server_alive
        });
        progressed |= self.pairs.len() != before;

        Ok(progressed)
    }

    /// Step until nothing happens, returning the number of productive rounds
    pub fn run(
        &mut self,
        client: &mut Engine,
        client_handlers: &mut [&mut dyn EventHandler],
        server: &mut Engine,
        server_handlers: &mut [&mut dyn EventHandler],
    ) -> Result<usize> {
        let mut rounds = 0;
        while self.step(client, client_handlers, server, server_handlers)? {
            rounds += 1;
            if rounds > MAX_ROUNDS {
                return Err(RelayError::protocol("loopback did not settle"));
            }
        }
        Ok(rounds)
    }
}
