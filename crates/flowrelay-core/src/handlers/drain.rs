//! Bounded drain consumer
//!
//! Client handler that consumes up to `count` messages from one incoming link
//! and then closes its connection. In blocking mode it grants `count` plain
//! credits and waits for all of them to be used. Otherwise it asks the peer
//! to drain `count` credits, so the peer returns whatever credit it cannot
//! use and the consumer learns that nothing more is coming.

use tracing::{debug, info};

use crate::config::DrainConfig;
use crate::engine::{DeliveryId, Endpoint, Engine, EventHandler, LinkId};
use crate::types::{Message, Role};
use crate::Result;

/// One-shot consumer for a single incoming link
#[derive(Debug, Clone)]
pub struct Drain {
    count: u32,
    block: bool,
    received: u32,
    messages: Vec<Message>,
    done: bool,
}

impl Drain {
    pub fn new(config: &DrainConfig) -> Self {
        Self {
            count: config.count,
            block: config.block,
            received: 0,
            messages: Vec::new(),
            done: false,
        }
    }

    /// Number of complete messages received
    pub fn received(&self) -> u32 {
        self.received
    }

    /// Messages received so far, in arrival order
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// True once the consumer has closed its connection
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn finish(&mut self, engine: &mut Engine, link: LinkId) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        debug!(
            "Drain finished with {}/{} message(s)",
            self.received, self.count
        );
        let connection = engine.connection_of(Endpoint::Link(link))?;
        engine.close(Endpoint::Connection(connection))
    }
}

impl EventHandler for Drain {
    fn on_open(&mut self, engine: &mut Engine, endpoint: Endpoint) -> Result<()> {
        let Endpoint::Link(link) = endpoint else {
            return Ok(());
        };
        if engine.role(link)? != Role::Receiver {
            return Ok(());
        }

        if self.count == 0 {
            return self.finish(engine, link);
        }
        if self.block {
            engine.flow(link, self.count)
        } else {
            engine.drain(link, self.count)
        }
    }

    fn on_flow(&mut self, engine: &mut Engine, link: LinkId) -> Result<()> {
        if engine.role(link)? != Role::Receiver {
            return Ok(());
        }
        // Plain credit is never echoed back, so only a drain round ends here
        if !self.block && !engine.draining(link)? {
            self.finish(engine, link)?;
        }
        Ok(())
    }

    fn on_delivery(&mut self, engine: &mut Engine, delivery: DeliveryId) -> Result<()> {
        let link = engine.delivery_link(delivery)?;
        if engine.role(link)? != Role::Receiver || engine.is_partial(delivery)? {
            return Ok(());
        }

        let message = Message::new(engine.recv(delivery)?);
        self.received += 1;
        info!("{}", message);
        self.messages.push(message);
        engine.settle(delivery)?;

        if self.received >= self.count || (!self.block && !engine.draining(link)?) {
            self.finish(engine, link)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Frame, Performative};
    use crate::types::{DeliveryTag, EndpointState};

    fn open_link(engine: &mut Engine, drain: &mut Drain) -> (crate::engine::ConnectionId, LinkId) {
        let connection = engine.connection();
        let session = engine.session(connection).unwrap();
        let link = engine.receiver(session, "in").unwrap();
        engine.open(Endpoint::Connection(connection)).unwrap();
        engine.open(Endpoint::Session(session)).unwrap();
        engine.open(Endpoint::Link(link)).unwrap();
        drain.on_open(engine, Endpoint::Link(link)).unwrap();
        (connection, link)
    }

    #[test]
    fn test_blocking_grants_plain_credit() {
        let mut engine = Engine::new();
        let mut drain = Drain::new(&DrainConfig { count: 3, block: true });
        let (_, link) = open_link(&mut engine, &mut drain);

        assert_eq!(engine.credit(link).unwrap(), 3);
        assert!(!engine.draining(link).unwrap());
    }

    #[test]
    fn test_non_blocking_requests_drain() {
        let mut engine = Engine::new();
        let mut drain = Drain::new(&DrainConfig { count: 5, block: false });
        let (_, link) = open_link(&mut engine, &mut drain);

        assert!(engine.draining(link).unwrap());
        assert!(!drain.is_done());
    }

    #[test]
    fn test_zero_count_closes_on_open() {
        let mut engine = Engine::new();
        let mut drain = Drain::new(&DrainConfig { count: 0, block: true });
        let (connection, _) = open_link(&mut engine, &mut drain);

        assert!(drain.is_done());
        assert_eq!(
            engine.local_state(Endpoint::Connection(connection)).unwrap(),
            EndpointState::Closed
        );
    }

    /// Peer frames that open the connection and session and attach `name`
    fn peer_attach(name: &str, handle: u32, role: Role) -> Vec<Frame> {
        vec![
            Frame::connection(Performative::Open {
                container_id: "peer".to_string(),
                hostname: None,
            }),
            Frame::session(0, Performative::Begin { remote_channel: Some(0) }),
            Frame::session(
                0,
                Performative::Attach {
                    name: name.to_string(),
                    handle,
                    role,
                    source: Default::default(),
                    target: Default::default(),
                },
            ),
        ]
    }

    #[test]
    fn test_blocking_ignores_peer_flow() {
        let mut engine = Engine::new();
        let mut drain = Drain::new(&DrainConfig { count: 3, block: true });
        let (connection, link) = open_link(&mut engine, &mut drain);
        while engine.next_event().is_some() {}

        let mut frames = peer_attach("in", 0, Role::Sender);
        frames.push(Frame::session(
            0,
            Performative::Flow {
                handle: 0,
                delivery_count: 0,
                link_credit: 0,
                drain: false,
            },
        ));
        for frame in frames {
            engine.input(connection, frame).unwrap();
        }
        engine.process_events(&mut [&mut drain]);

        assert!(!drain.is_done());
        assert_eq!(engine.credit(link).unwrap(), 3);
        assert_eq!(
            engine.local_state(Endpoint::Connection(connection)).unwrap(),
            EndpointState::Active
        );
    }

    #[test]
    fn test_flow_on_sibling_sender_is_ignored() {
        let mut engine = Engine::new();
        let mut drain = Drain::new(&DrainConfig { count: 3, block: false });
        let (connection, link) = open_link(&mut engine, &mut drain);
        let session = engine.session_of(link).unwrap();
        let sender = engine.sender(session, "out").unwrap();
        engine.open(Endpoint::Link(sender)).unwrap();
        while engine.next_event().is_some() {}

        let mut frames = peer_attach("out", 5, Role::Receiver);
        frames.push(Frame::session(
            0,
            Performative::Flow {
                handle: 5,
                delivery_count: 0,
                link_credit: 2,
                drain: false,
            },
        ));
        for frame in frames {
            engine.input(connection, frame).unwrap();
        }
        engine.process_events(&mut [&mut drain]);

        assert_eq!(engine.credit(sender).unwrap(), 2);
        assert!(engine.draining(link).unwrap());
        assert!(!drain.is_done());
        assert_eq!(
            engine.local_state(Endpoint::Connection(connection)).unwrap(),
            EndpointState::Active
        );
    }

    #[test]
    fn test_partial_delivery_is_not_counted() {
        let mut engine = Engine::new();
        let mut drain = Drain::new(&DrainConfig { count: 1, block: true });
        let (connection, link) = open_link(&mut engine, &mut drain);
        while engine.next_event().is_some() {}

        for frame in [
            Frame::connection(Performative::Open {
                container_id: "peer".to_string(),
                hostname: None,
            }),
            Frame::session(0, Performative::Begin { remote_channel: Some(0) }),
            Frame::session(
                0,
                Performative::Attach {
                    name: "in".to_string(),
                    handle: 0,
                    role: Role::Sender,
                    source: Default::default(),
                    target: Default::default(),
                },
            ),
            Frame::session(
                0,
                Performative::Transfer {
                    handle: 0,
                    delivery_number: 0,
                    tag: DeliveryTag::new(b"0".to_vec()),
                    settled: true,
                    more: true,
                    payload: b"hel".to_vec(),
                },
            ),
        ] {
            engine.input(connection, frame).unwrap();
        }
        engine.process_events(&mut [&mut drain]);
        assert_eq!(drain.received(), 0);

        engine
            .input(
                connection,
                Frame::session(
                    0,
                    Performative::Transfer {
                        handle: 0,
                        delivery_number: 0,
                        tag: DeliveryTag::new(b"0".to_vec()),
                        settled: true,
                        more: false,
                        payload: b"lo".to_vec(),
                    },
                ),
            )
            .unwrap();
        engine.process_events(&mut [&mut drain]);

        assert_eq!(drain.received(), 1);
        assert_eq!(drain.messages()[0].payload(), b"hello");
        assert!(drain.is_done());
        assert_eq!(engine.credit(link).unwrap(), 0);
    }
}
