//! Centralized Configuration Management
//!
//! This module consolidates the configuration structures used by the relay
//! handlers, the link engine and the client handlers.

use serde::{Deserialize, Serialize};

use crate::{RelayError, Result};

// ----------------------------------------------------------------------------
// Relay Configuration
// ----------------------------------------------------------------------------

/// How the router picks among several outgoing links for one address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// Rotate through usable links
    #[default]
    RoundRobin,
    /// Always prefer the earliest attached usable link
    Sticky,
}

/// What to do when an address backlog reaches its limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BacklogPolicy {
    /// Refuse the incoming message; the producer sees a `Rejected` outcome
    #[default]
    Reject,
    /// Evict the oldest queued message to make room
    DropOldest,
}

/// Per-address backlog limits for the message store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacklogConfig {
    /// Maximum queued messages per address (`None` = unbounded)
    pub max_messages_per_address: Option<usize>,
    /// Policy applied once the limit is reached
    pub policy: BacklogPolicy,
}

impl BacklogConfig {
    /// Unbounded queues, the store's native behavior
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Bounded queues that reject new messages when full
    pub fn reject_after(limit: usize) -> Self {
        Self {
            max_messages_per_address: Some(limit),
            policy: BacklogPolicy::Reject,
        }
    }

    /// Bounded queues that evict the oldest message when full
    pub fn drop_oldest_after(limit: usize) -> Self {
        Self {
            max_messages_per_address: Some(limit),
            policy: BacklogPolicy::DropOldest,
        }
    }
}

/// Configuration for the relay server handlers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Credit window kept open on every incoming link
    pub credit_window: u32,
    /// Outgoing link selection policy
    pub selection: SelectionPolicy,
    /// Backlog limits for the message store
    pub backlog: BacklogConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            credit_window: 1024,
            selection: SelectionPolicy::RoundRobin,
            backlog: BacklogConfig::unbounded(),
        }
    }
}

impl RelayConfig {
    /// Small window, useful for exercising credit replenishment in tests
    pub fn testing() -> Self {
        Self {
            credit_window: 4,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.credit_window == 0 {
            return Err(RelayError::config_error("credit_window must be at least 1"));
        }
        if self.backlog.max_messages_per_address == Some(0) {
            return Err(RelayError::config_error(
                "backlog.max_messages_per_address must be at least 1",
            ));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Client Configuration
// ----------------------------------------------------------------------------

/// Configuration for the bounded drain consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    /// Number of messages to consume
    pub count: u32,
    /// Plain credit instead of a drain round; stays open until `count` arrive
    pub block: bool,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            count: 1,
            block: false,
        }
    }
}

/// Configuration for the bounded producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoutConfig {
    /// Number of messages to publish
    pub count: u32,
    /// Message body; numbered when more than one message is sent
    pub body: String,
}

impl Default for SpoutConfig {
    fn default() -> Self {
        Self {
            count: 1,
            body: "Hello World!".to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Engine Configuration
// ----------------------------------------------------------------------------

/// Configuration for the link engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Largest payload carried by a single transfer frame
    pub max_frame_payload: usize,
    /// Prefix for generated container identifiers
    pub container_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: 16 * 1024,
            container_prefix: "flowrelay".to_string(),
        }
    }
}

impl EngineConfig {
    /// Tiny frames so that every multi-byte message arrives in pieces
    pub fn fragmenting(max_frame_payload: usize) -> Self {
        Self {
            max_frame_payload,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frame_payload == 0 {
            return Err(RelayError::config_error(
                "max_frame_payload must be at least 1 byte",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_relay_config_is_valid() {
        let config = RelayConfig::default();
        assert_eq!(config.credit_window, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_window_rejected() {
        let config = RelayConfig {
            credit_window: 0,
            ..RelayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RelayError::Configuration { .. })
        ));
    }

    #[test]
    fn test_zero_backlog_limit_rejected() {
        let config = RelayConfig {
            backlog: BacklogConfig::reject_after(0),
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_frame_payload_rejected() {
        assert!(EngineConfig::fragmenting(0).validate().is_err());
        assert!(EngineConfig::fragmenting(1).validate().is_ok());
    }
}
