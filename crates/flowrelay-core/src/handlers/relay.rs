//! Store-and-forward relay
//!
//! Buffers every message received on an incoming link in the message store
//! under the link's address and forwards stored messages on outgoing links
//! bound to the same address as credit allows.
//!
//! The send loop runs whenever an outgoing link reports new credit and right
//! after a message is stored. Messages are sent pre-settled: once a message
//! has been handed to a link it is no longer the relay's concern.

use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::engine::{DeliveryId, Endpoint, Engine, EventHandler, LinkId};
use crate::handlers::router::Router;
use crate::store::MessageStore;
use crate::types::{Address, EndpointState, Message, Outcome, Role, TagGenerator};
use crate::Result;

/// Relay counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Messages accepted into the store
    pub received: u64,
    /// Messages forwarded on outgoing links
    pub sent: u64,
    /// Messages refused because their backlog was full
    pub rejected: u64,
    /// Queued messages discarded to make room
    pub evicted: u64,
}

/// Relay server handler
#[derive(Debug)]
pub struct Relay {
    store: MessageStore,
    router: Router,
    tags: TagGenerator,
    stats: RelayStats,
}

impl Relay {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            store: MessageStore::with_config(config.backlog.clone()),
            router: Router::new(config.selection),
            tags: TagGenerator::new(),
            stats: RelayStats::default(),
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Store a message and push it towards any credited outgoing link
    pub fn publish(&mut self, engine: &mut Engine, address: &Address, message: Message) -> Result<usize> {
        self.store_message(address, message)?;
        self.send(engine, address, None)
    }

    fn store_message(&mut self, address: &Address, message: Message) -> Result<()> {
        if let Some(evicted) = self.store.put(address, message)? {
            self.stats.evicted += 1;
            warn!(
                "Backlog for {} full, dropped oldest message ({} bytes)",
                address,
                evicted.len()
            );
        }
        self.stats.received += 1;
        Ok(())
    }

    /// Forward stored messages for `address`
    ///
    /// Uses `link` when given, otherwise asks the router for a usable outgoing
    /// link. Sends while the link has credit; when the backlog runs out first
    /// the link is marked drained. Returns the number of messages sent.
    pub fn send(&mut self, engine: &mut Engine, address: &Address, link: Option<LinkId>) -> Result<usize> {
        let link = match link {
            Some(link) => link,
            None => {
                let chosen = self
                    .router
                    .outgoing(address)
                    .and_then(|routes| routes.choose(|link| Self::usable(engine, link)));
                match chosen {
                    Some(link) => link,
                    None => return Ok(0),
                }
            }
        };

        let mut sent = 0;
        while engine.credit(link)? > 0 {
            let Some(message) = self.store.take(address) else {
                engine.drained(link)?;
                break;
            };

            let delivery = engine.delivery(link, self.tags.next_tag())?;
            engine.send(link, message.payload())?;
            engine.settle(delivery)?;
            sent += 1;
        }

        if sent > 0 {
            self.stats.sent += sent as u64;
            info!("Forwarded {} message(s) for {} on link {}", sent, address, link);
        }
        Ok(sent)
    }

    /// An outgoing link that can take a transfer right now
    fn usable(engine: &Engine, link: LinkId) -> bool {
        engine.is_usable(Endpoint::Link(link)) && engine.credit(link).is_ok_and(|c| c > 0)
    }

    fn receive(&mut self, engine: &mut Engine, link: LinkId, delivery: DeliveryId) -> Result<()> {
        if engine.is_partial(delivery)? {
            return Ok(());
        }

        let Some(address) = Router::address(engine, link)? else {
            warn!("Delivery on unaddressed link {}, rejecting", link);
            engine.disposition(delivery, Outcome::Rejected)?;
            return engine.settle(delivery);
        };

        let message = Message::new(engine.recv(delivery)?);
        debug!("Received {} byte message for {}", message.len(), address);

        match self.store_message(&address, message) {
            Ok(()) => {
                engine.disposition(delivery, Outcome::Accepted)?;
                engine.settle(delivery)?;
                self.send(engine, &address, None)?;
                Ok(())
            }
            Err(e) if e.is_backlog_full() => {
                self.stats.rejected += 1;
                warn!("{}", e);
                engine.disposition(delivery, Outcome::Rejected)?;
                engine.settle(delivery)
            }
            Err(e) => Err(e),
        }
    }
}

impl EventHandler for Relay {
    fn on_open(&mut self, engine: &mut Engine, endpoint: Endpoint) -> Result<()> {
        self.router.on_open(engine, endpoint)
    }

    fn on_close(&mut self, engine: &mut Engine, endpoint: Endpoint) -> Result<()> {
        self.router.on_close(engine, endpoint)
    }

    fn on_final(&mut self, engine: &mut Engine, endpoint: Endpoint) -> Result<()> {
        self.router.on_final(engine, endpoint)
    }

    fn on_flow(&mut self, engine: &mut Engine, link: LinkId) -> Result<()> {
        if engine.role(link)? != Role::Sender
            || engine.local_state(Endpoint::Link(link))? != EndpointState::Active
        {
            return Ok(());
        }
        if let Some(address) = Router::address(engine, link)? {
            self.send(engine, &address, Some(link))?;
        }
        Ok(())
    }

    fn on_delivery(&mut self, engine: &mut Engine, delivery: DeliveryId) -> Result<()> {
        let link = engine.delivery_link(delivery)?;
        match engine.role(link)? {
            Role::Receiver => self.receive(engine, link, delivery),
            Role::Sender => engine.settle(delivery),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BacklogConfig;
    use crate::engine::{Frame, Performative};
    use crate::types::Terminus;

    /// Sending link attached by a peer that granted `credit`
    fn credited_sender(engine: &mut Engine, address: &str, credit: u32, drain: bool) -> LinkId {
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
                container_id: "peer".to_string(),
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

    fn queue() -> Address {
        Address::from("queue")
    }

    #[test]
    fn test_send_without_route_is_noop() {
        let mut engine = Engine::new();
        let mut relay = Relay::new(&RelayConfig::default());

        assert_eq!(relay.publish(&mut engine, &queue(), Message::from("m")).unwrap(), 0);
        assert_eq!(relay.store().backlog(&queue()), 1);
    }

    #[test]
    fn test_credit_limits_send_loop() {
        let mut engine = Engine::new();
        let mut relay = Relay::new(&RelayConfig::default());
        for i in 0..5 {
            relay
                .publish(&mut engine, &queue(), Message::new(vec![i]))
                .unwrap();
        }

        let link = credited_sender(&mut engine, "queue", 3, false);
        engine.process_events(&mut [&mut relay]);

        assert_eq!(relay.stats().sent, 3);
        assert_eq!(relay.store().backlog(&queue()), 2);
        assert_eq!(engine.credit(link).unwrap(), 0);
    }

    #[test]
    fn test_exhausted_backlog_drains_link() {
        let mut engine = Engine::new();
        let mut relay = Relay::new(&RelayConfig::default());
        relay.publish(&mut engine, &queue(), Message::from("only")).unwrap();

        let link = credited_sender(&mut engine, "queue", 4, true);
        engine.process_events(&mut [&mut relay]);

        assert_eq!(relay.stats().sent, 1);
        assert!(!relay.store().contains(&queue()));
        assert_eq!(engine.credit(link).unwrap(), 0);
        assert_eq!(engine.delivery_count(link).unwrap(), 4);
        assert!(!engine.draining(link).unwrap());
    }

    #[test]
    fn test_publish_uses_credited_route() {
        let mut engine = Engine::new();
        let mut relay = Relay::new(&RelayConfig::default());
        let link = credited_sender(&mut engine, "queue", 2, false);
        engine.process_events(&mut [&mut relay]);

        let sent = relay.publish(&mut engine, &queue(), Message::from("m")).unwrap();

        assert_eq!(sent, 1);
        assert_eq!(engine.credit(link).unwrap(), 1);
    }

    #[test]
    fn test_drop_oldest_counts_evictions() {
        let mut engine = Engine::new();
        let config = RelayConfig {
            backlog: BacklogConfig::drop_oldest_after(1),
            ..RelayConfig::default()
        };
        let mut relay = Relay::new(&config);

        relay.publish(&mut engine, &queue(), Message::from("old")).unwrap();
        relay.publish(&mut engine, &queue(), Message::from("new")).unwrap();

        assert_eq!(relay.stats().evicted, 1);
        assert_eq!(relay.store().backlog(&queue()), 1);
    }
}
