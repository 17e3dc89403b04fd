//! Address routing table
//!
//! Indexes locally opened links by address so that the relay can find an
//! outgoing link for a stored message. A sending link is bound to its source
//! address, falling back to its target; a receiving link is bound to its
//! target address.

use hashbrown::HashMap;
use tracing::debug;

use crate::config::SelectionPolicy;
use crate::engine::{Endpoint, Engine, EventHandler, LinkId};
use crate::types::{Address, Role};
use crate::Result;

// ----------------------------------------------------------------------------
// Candidate Set
// ----------------------------------------------------------------------------

/// Links bound to one address in one direction
#[derive(Debug, Clone)]
pub struct Routes {
    links: Vec<LinkId>,
    policy: SelectionPolicy,
    cursor: usize,
}

impl Routes {
    fn new(policy: SelectionPolicy) -> Self {
        Self {
            links: Vec::new(),
            policy,
            cursor: 0,
        }
    }

    /// Pick a link for which `usable` holds, following the selection policy
    pub fn choose<F>(&mut self, mut usable: F) -> Option<LinkId>
    where
        F: FnMut(LinkId) -> bool,
    {
        let len = self.links.len();
        let start = match self.policy {
            SelectionPolicy::RoundRobin => self.cursor % len.max(1),
            SelectionPolicy::Sticky => 0,
        };

        let index = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&index| usable(self.links[index]))?;
        self.cursor = index + 1;
        Some(self.links[index])
    }

    pub fn links(&self) -> &[LinkId] {
        &self.links
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, link: LinkId) -> bool {
        self.links.contains(&link)
    }
}

// ----------------------------------------------------------------------------
// Router
// ----------------------------------------------------------------------------

/// Routing table maintained from link open/close notifications
#[derive(Debug, Clone, Default)]
pub struct Router {
    outgoing: HashMap<Address, Routes>,
    incoming: HashMap<Address, Routes>,
    /// Reverse index used to unbind links
    bound: HashMap<LinkId, (Role, Address)>,
    policy: SelectionPolicy,
}

impl Router {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Address a link is bound to, derived from its local termini
    pub fn address(engine: &Engine, link: LinkId) -> Result<Option<Address>> {
        let address = match engine.role(link)? {
            Role::Sender => engine
                .source(link)?
                .address
                .clone()
                .or_else(|| engine.target(link).ok().and_then(|t| t.address.clone())),
            Role::Receiver => engine.target(link)?.address.clone(),
        };
        Ok(address)
    }

    /// Outgoing links bound to `address`
    pub fn outgoing(&mut self, address: &Address) -> Option<&mut Routes> {
        self.outgoing.get_mut(address)
    }

    /// Incoming links bound to `address`
    pub fn incoming(&self, address: &Address) -> Option<&Routes> {
        self.incoming.get(address)
    }

    /// Address a routed link was bound to
    pub fn bound_address(&self, link: LinkId) -> Option<&Address> {
        self.bound.get(&link).map(|(_, address)| address)
    }

    fn table(&mut self, role: Role) -> &mut HashMap<Address, Routes> {
        match role {
            Role::Sender => &mut self.outgoing,
            Role::Receiver => &mut self.incoming,
        }
    }

    fn add(&mut self, engine: &Engine, link: LinkId) -> Result<()> {
        if self.bound.contains_key(&link) {
            return Ok(());
        }
        let Some(address) = Self::address(engine, link)? else {
            debug!("Link {} has no address, not routed", link);
            return Ok(());
        };
        let role = engine.role(link)?;
        let policy = self.policy;

        debug!("Routing {} link {} for {}", role, link, address);
        self.table(role)
            .entry(address.clone())
            .or_insert_with(|| Routes::new(policy))
            .links
            .push(link);
        self.bound.insert(link, (role, address));
        Ok(())
    }

    fn remove(&mut self, link: LinkId) {
        let Some((role, address)) = self.bound.remove(&link) else {
            return;
        };
        let table = self.table(role);
        if let Some(routes) = table.get_mut(&address) {
            routes.links.retain(|l| *l != link);
            if routes.links.is_empty() {
                table.remove(&address);
            }
        }
        debug!("Unrouted link {} for {}", link, address);
    }
}

impl EventHandler for Router {
    fn on_open(&mut self, engine: &mut Engine, endpoint: Endpoint) -> Result<()> {
        if let Endpoint::Link(link) = endpoint {
            self.add(engine, link)?;
        }
        Ok(())
    }

    fn on_close(&mut self, _engine: &mut Engine, endpoint: Endpoint) -> Result<()> {
        if let Endpoint::Link(link) = endpoint {
            self.remove(link);
        }
        Ok(())
    }

    fn on_final(&mut self, _engine: &mut Engine, endpoint: Endpoint) -> Result<()> {
        if let Endpoint::Link(link) = endpoint {
            self.remove(link);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Terminus;

    fn open_sender(engine: &mut Engine, router: &mut Router, address: &str) -> LinkId {
        let connection = engine.connection();
        let session = engine.session(connection).unwrap();
        let link = engine.sender(session, address).unwrap();
        engine
            .set_source(link, Terminus::new(Address::from(address)))
            .unwrap();
        engine.open(Endpoint::Link(link)).unwrap();
        router.on_open(engine, Endpoint::Link(link)).unwrap();
        link
    }

    #[test]
    fn test_sender_address_falls_back_to_target() {
        let mut engine = Engine::new();
        let connection = engine.connection();
        let session = engine.session(connection).unwrap();
        let link = engine.sender(session, "out").unwrap();
        engine
            .set_target(link, Terminus::new(Address::from("target")))
            .unwrap();

        assert_eq!(
            Router::address(&engine, link).unwrap(),
            Some(Address::from("target"))
        );
    }

    #[test]
    fn test_round_robin_rotates() {
        let mut engine = Engine::new();
        let mut router = Router::new(SelectionPolicy::RoundRobin);
        let a = open_sender(&mut engine, &mut router, "queue");
        let b = open_sender(&mut engine, &mut router, "queue");
        let routes = router.outgoing(&Address::from("queue")).unwrap();

        assert_eq!(routes.choose(|_| true), Some(a));
        assert_eq!(routes.choose(|_| true), Some(b));
        assert_eq!(routes.choose(|_| true), Some(a));
    }

    #[test]
    fn test_sticky_prefers_first_usable() {
        let mut engine = Engine::new();
        let mut router = Router::new(SelectionPolicy::Sticky);
        let a = open_sender(&mut engine, &mut router, "queue");
        let b = open_sender(&mut engine, &mut router, "queue");
        let routes = router.outgoing(&Address::from("queue")).unwrap();

        assert_eq!(routes.choose(|_| true), Some(a));
        assert_eq!(routes.choose(|_| true), Some(a));
        assert_eq!(routes.choose(|link| link != a), Some(b));
        assert_eq!(routes.choose(|_| false), None);
    }

    #[test]
    fn test_close_unroutes_link() {
        let mut engine = Engine::new();
        let mut router = Router::new(SelectionPolicy::RoundRobin);
        let link = open_sender(&mut engine, &mut router, "queue");

        router.on_close(&mut engine, Endpoint::Link(link)).unwrap();

        assert!(router.outgoing(&Address::from("queue")).is_none());
        assert!(router.bound_address(link).is_none());
    }
}
