//! Bounded producer
//!
//! Client handler that publishes `count` messages on one outgoing link,
//! unsettled, and closes its connection once the peer has settled or
//! decided every one of them.

use tracing::{debug, warn};

use crate::config::SpoutConfig;
use crate::engine::{DeliveryId, Endpoint, Engine, EventHandler, LinkId};
use crate::types::{Outcome, Role, TagGenerator};
use crate::Result;

/// One-shot producer for a single outgoing link
#[derive(Debug, Clone)]
pub struct Spout {
    count: u32,
    body: String,
    tags: TagGenerator,
    sent: u32,
    confirmed: u32,
    rejected: u32,
    done: bool,
}

impl Spout {
    pub fn new(config: &SpoutConfig) -> Self {
        Self {
            count: config.count,
            body: config.body.clone(),
            tags: TagGenerator::new(),
            sent: 0,
            confirmed: 0,
            rejected: 0,
            done: false,
        }
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }

    /// Deliveries the peer has settled or decided
    pub fn confirmed(&self) -> u32 {
        self.confirmed
    }

    /// Confirmed deliveries the peer refused
    pub fn rejected(&self) -> u32 {
        self.rejected
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Body of the `index`-th message
    fn message(&self, index: u32) -> String {
        if self.count == 1 {
            self.body.clone()
        } else {
            format!("{} {}", self.body, index)
        }
    }

    fn pump(&mut self, engine: &mut Engine, link: LinkId) -> Result<()> {
        while self.sent < self.count && engine.credit(link)? > 0 {
            let body = self.message(self.sent);
            engine.delivery(link, self.tags.next_tag())?;
            engine.send(link, body.as_bytes())?;
            engine.advance(link)?;
            self.sent += 1;
        }
        Ok(())
    }

    fn finish(&mut self, engine: &mut Engine, link: LinkId) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        debug!(
            "Spout finished: {} confirmed, {} rejected",
            self.confirmed, self.rejected
        );
        let connection = engine.connection_of(Endpoint::Link(link))?;
        engine.close(Endpoint::Connection(connection))
    }
}

impl EventHandler for Spout {
    fn on_open(&mut self, engine: &mut Engine, endpoint: Endpoint) -> Result<()> {
        if let Endpoint::Link(link) = endpoint {
            if self.count == 0 && engine.role(link)? == Role::Sender {
                self.finish(engine, link)?;
            }
        }
        Ok(())
    }

    fn on_flow(&mut self, engine: &mut Engine, link: LinkId) -> Result<()> {
        if engine.role(link)? == Role::Sender && !self.done {
            self.pump(engine, link)?;
        }
        Ok(())
    }

    fn on_delivery(&mut self, engine: &mut Engine, delivery: DeliveryId) -> Result<()> {
        let link = engine.delivery_link(delivery)?;
        if engine.role(link)? != Role::Sender {
            return Ok(());
        }

        let outcome = engine.remote_outcome(delivery)?;
        if outcome.is_none() && !engine.remote_settled(delivery)? {
            return Ok(());
        }
        if outcome == Some(Outcome::Rejected) {
            self.rejected += 1;
            warn!("Message {} rejected by peer", engine.tag(delivery)?);
        }
        engine.settle(delivery)?;
        self.confirmed += 1;

        if self.confirmed >= self.count {
            self.finish(engine, link)?;
        }
        Ok(())
    }
}
