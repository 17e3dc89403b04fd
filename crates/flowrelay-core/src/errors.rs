//! Error types for the flowrelay core
//!
//! This module contains the error types used throughout the relay core,
//! including link engine errors, message store errors, and the main
//! RelayError type that unifies them all.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Specific link engine error types
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Unknown {kind} endpoint: {id}")]
    UnknownEndpoint { kind: &'static str, id: u32 },
    #[error("Unknown delivery: {id}")]
    UnknownDelivery { id: u32 },
    #[error("Link {link} is a {actual}, operation requires a {expected}")]
    WrongRole {
        link: u32,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Link {link} has no current delivery")]
    NoCurrentDelivery { link: u32 },
    #[error("Link {link} has no credit to transfer a delivery")]
    NoCredit { link: u32 },
    #[error("Frame references unknown channel {channel}")]
    UnknownChannel { channel: u16 },
    #[error("Frame references unknown handle {handle} on channel {channel}")]
    UnknownHandle { channel: u16, handle: u32 },
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Protocol violation: {reason}")]
    Protocol { reason: String },
}

/// Specific message store error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Backlog for address {address} is full ({limit} messages)")]
    BacklogFull { address: String, limit: usize },
}

// ----------------------------------------------------------------------------
// Relay Error
// ----------------------------------------------------------------------------

/// Core error types for the relay
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Address could not be parsed into a peer identity
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl RelayError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        RelayError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create an invalid address error
    pub fn invalid_address<A: Into<String>, R: Into<String>>(address: A, reason: R) -> Self {
        RelayError::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a protocol violation error
    pub fn protocol<T: Into<String>>(reason: T) -> Self {
        RelayError::Engine(EngineError::Protocol {
            reason: reason.into(),
        })
    }

    /// True for errors caused by a backlog limit rather than a broken link
    pub fn is_backlog_full(&self) -> bool {
        matches!(self, RelayError::Store(StoreError::BacklogFull { .. }))
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, RelayError>;
pub type RelayResult<T> = Result<T>;
