//! Credit replenisher
//!
//! Keeps the outstanding credit of every receiving link at a fixed window.
//! Top-ups are level-triggered: each one grants exactly the shortfall, so
//! redundant calls grant nothing.

use tracing::trace;

use crate::engine::{DeliveryId, Endpoint, Engine, EventHandler, LinkId};
use crate::types::Role;
use crate::{RelayError, Result};

/// Tops receiving links up to `window` credits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowController {
    window: u32,
}

impl FlowController {
    /// Create a controller with the given window; the window must be positive
    pub fn new(window: u32) -> Result<Self> {
        if window == 0 {
            return Err(RelayError::config_error("credit window must be at least 1"));
        }
        Ok(Self { window })
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    /// Grant the shortfall between the window and the link's current credit
    ///
    /// Returns the credit granted. Sending links and links already at or above
    /// the window are left alone.
    pub fn top_up(&self, engine: &mut Engine, link: LinkId) -> Result<u32> {
        if engine.role(link)? != Role::Receiver {
            return Ok(0);
        }

        let delta = self.window.saturating_sub(engine.credit(link)?);
        if delta > 0 {
            trace!("Granting {} credit on link {}", delta, link);
            engine.flow(link, delta)?;
        }
        Ok(delta)
    }
}

impl EventHandler for FlowController {
    fn on_open(&mut self, engine: &mut Engine, endpoint: Endpoint) -> Result<()> {
        if let Endpoint::Link(link) = endpoint {
            self.top_up(engine, link)?;
        }
        Ok(())
    }

    fn on_remote_open(&mut self, engine: &mut Engine, endpoint: Endpoint) -> Result<()> {
        if let Endpoint::Link(link) = endpoint {
            self.top_up(engine, link)?;
        }
        Ok(())
    }

    fn on_flow(&mut self, engine: &mut Engine, link: LinkId) -> Result<()> {
        self.top_up(engine, link)?;
        Ok(())
    }

    fn on_delivery(&mut self, engine: &mut Engine, delivery: DeliveryId) -> Result<()> {
        if engine.is_partial(delivery)? {
            return Ok(());
        }
        let link = engine.delivery_link(delivery)?;
        self.top_up(engine, link)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receiver(engine: &mut Engine) -> LinkId {
        let connection = engine.connection();
        let session = engine.session(connection).unwrap();
        engine.receiver(session, "in").unwrap()
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(FlowController::new(0).is_err());
    }

    #[test]
    fn test_top_up_fills_window() {
        let mut engine = Engine::new();
        let link = receiver(&mut engine);
        let controller = FlowController::new(10).unwrap();

        assert_eq!(controller.top_up(&mut engine, link).unwrap(), 10);
        assert_eq!(engine.credit(link).unwrap(), 10);
    }

    #[test]
    fn test_top_up_is_idempotent() {
        let mut engine = Engine::new();
        let link = receiver(&mut engine);
        let controller = FlowController::new(10).unwrap();

        controller.top_up(&mut engine, link).unwrap();
        assert_eq!(controller.top_up(&mut engine, link).unwrap(), 0);
        assert_eq!(engine.credit(link).unwrap(), 10);
    }

    #[test]
    fn test_top_up_never_grants_above_window() {
        let mut engine = Engine::new();
        let link = receiver(&mut engine);
        engine.flow(link, 25).unwrap();

        let controller = FlowController::new(10).unwrap();
        assert_eq!(controller.top_up(&mut engine, link).unwrap(), 0);
        assert_eq!(engine.credit(link).unwrap(), 25);
    }

    #[test]
    fn test_senders_are_ignored() {
        let mut engine = Engine::new();
        let connection = engine.connection();
        let session = engine.session(connection).unwrap();
        let sender = engine.sender(session, "out").unwrap();

        let controller = FlowController::new(10).unwrap();
        assert_eq!(controller.top_up(&mut engine, sender).unwrap(), 0);
    }
}
