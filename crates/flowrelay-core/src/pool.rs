//! Client link pool
//!
//! Caches one connection per remote host and lazily creates links on it.
//! Remote addresses have the form `//host[:port]/path`; the host part picks
//! the connection. Several links may share one cached connection: links are
//! keyed by host, local address, remote address and direction.

use hashbrown::HashMap;
use tracing::debug;

use crate::engine::{ConnectionId, Endpoint, Engine, LinkId, SessionId};
use crate::types::{Address, EndpointState, Role, Terminus};
use crate::{RelayError, Result};

#[derive(Debug, Clone, Copy)]
struct PooledConnection {
    connection: ConnectionId,
    session: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LinkKey {
    host: String,
    local: Option<Address>,
    remote: Address,
    role: Role,
}

/// Connection and link cache for client handlers
#[derive(Debug, Default)]
pub struct Pool {
    connections: HashMap<String, PooledConnection>,
    links: HashMap<LinkKey, LinkId>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host part of a `//host/path` address
    pub fn host(remote: &str) -> Result<&str> {
        let rest = remote
            .strip_prefix("//")
            .ok_or_else(|| RelayError::invalid_address(remote, "expected //host/path"))?;
        match rest.split('/').next() {
            Some(host) if !host.is_empty() => Ok(host),
            _ => Err(RelayError::invalid_address(remote, "missing host")),
        }
    }

    /// Sending link towards `remote`
    pub fn outgoing(&mut self, engine: &mut Engine, remote: &str, local: Option<&str>) -> Result<LinkId> {
        self.resolve(engine, remote, local, true)
    }

    /// Receiving link from `remote`
    pub fn incoming(&mut self, engine: &mut Engine, remote: &str, local: Option<&str>) -> Result<LinkId> {
        self.resolve(engine, remote, local, false)
    }

    /// Return the cached link for this address pair, creating and opening the
    /// connection, session and link as needed
    pub fn resolve(
        &mut self,
        engine: &mut Engine,
        remote: &str,
        local: Option<&str>,
        outgoing: bool,
    ) -> Result<LinkId> {
        let host = Self::host(remote)?.to_string();
        let role = if outgoing { Role::Sender } else { Role::Receiver };
        let key = LinkKey {
            host: host.clone(),
            local: local.map(Address::from),
            remote: Address::from(remote),
            role,
        };

        if let Some(&link) = self.links.get(&key) {
            if is_live(engine, Endpoint::Link(link)) {
                return Ok(link);
            }
            self.links.remove(&key);
        }

        let pooled = self.connection_for(engine, &host)?;
        let local_name = local.unwrap_or("");
        let link = if outgoing {
            let link = engine.sender(pooled.session, &format!("{}-{}", local_name, remote))?;
            engine.set_source(link, Terminus::from_optional(local))?;
            engine.set_target(link, Terminus::new(Address::from(remote)))?;
            link
        } else {
            let link = engine.receiver(pooled.session, &format!("{}-{}", remote, local_name))?;
            engine.set_source(link, Terminus::new(Address::from(remote)))?;
            engine.set_target(link, Terminus::from_optional(local))?;
            link
        };
        engine.open(Endpoint::Link(link))?;

        debug!("Pooled {} link {} for {} on {}", role, link, remote, host);
        self.links.insert(key, link);
        Ok(link)
    }

    fn connection_for(&mut self, engine: &mut Engine, host: &str) -> Result<PooledConnection> {
        if let Some(&pooled) = self.connections.get(host) {
            if is_live(engine, Endpoint::Connection(pooled.connection))
                && is_live(engine, Endpoint::Session(pooled.session))
            {
                return Ok(pooled);
            }
            self.connections.remove(host);
        }

        let connection = engine.connection();
        engine.set_hostname(connection, host)?;
        engine.open(Endpoint::Connection(connection))?;
        let session = engine.session(connection)?;
        engine.open(Endpoint::Session(session))?;

        debug!("Pooled connection {} for {}", connection, host);
        let pooled = PooledConnection {
            connection,
            session,
        };
        self.connections.insert(host.to_string(), pooled);
        Ok(pooled)
    }

    /// Cached connection for a host
    pub fn connection(&self, host: &str) -> Option<ConnectionId> {
        self.connections.get(host).map(|p| p.connection)
    }

    /// Number of cached links
    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}

/// Still present and not closed locally
fn is_live(engine: &Engine, endpoint: Endpoint) -> bool {
    engine
        .local_state(endpoint)
        .is_ok_and(|state| state != EndpointState::Closed)
}
