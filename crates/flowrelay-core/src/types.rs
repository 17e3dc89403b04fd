//! Core types for the relay
//!
//! This module defines the fundamental value types shared by the engine, the
//! message store and the handlers, using newtype patterns for type safety.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Address
// ----------------------------------------------------------------------------

/// Opaque name of a logical message source or destination
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Create a new address
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self(address.into())
    }

    /// Get the address as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(address: &str) -> Self {
        Self(address.to_string())
    }
}

impl From<String> for Address {
    fn from(address: String) -> Self {
        Self(address)
    }
}

impl FromStr for Address {
    type Err = core::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// Immutable opaque message payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Vec<u8>,
}

impl Message {
    /// Create a message that owns the given bytes
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    /// Borrow the payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True for a zero-length payload
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Give up ownership of the payload bytes
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

impl From<&str> for Message {
    fn from(body: &str) -> Self {
        Self::new(body.as_bytes().to_vec())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.payload))
    }
}

// ----------------------------------------------------------------------------
// Delivery Tags
// ----------------------------------------------------------------------------

/// Opaque tag identifying one delivery on a link
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTag(Vec<u8>);

impl DeliveryTag {
    /// Create a tag from raw bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Monotonic source of delivery tags, rendered as decimal bytes
///
/// Tags are never reused, even after the delivery they named is settled.
#[derive(Debug, Default, Clone)]
pub struct TagGenerator {
    next: u64,
}

impl TagGenerator {
    /// Create a generator starting at tag "0"
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next tag
    pub fn next_tag(&mut self) -> DeliveryTag {
        let tag = DeliveryTag::new(self.next.to_string().into_bytes());
        self.next += 1;
        tag
    }

    /// Number of tags handed out so far
    pub fn issued(&self) -> u64 {
        self.next
    }
}

// ----------------------------------------------------------------------------
// Endpoint Attributes
// ----------------------------------------------------------------------------

/// Lifecycle state of one side (local or remote) of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointState {
    Uninitialized,
    Active,
    Closed,
}

/// Direction of a link, seen from the side that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    /// The role the peer's half of the same link plays
    pub fn opposite(self) -> Self {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source or target of a link
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terminus {
    pub address: Option<Address>,
}

impl Terminus {
    /// A terminus naming the given address
    pub fn new(address: Address) -> Self {
        Self {
            address: Some(address),
        }
    }

    /// A terminus with optional addressing
    pub fn from_optional(address: Option<&str>) -> Self {
        Self {
            address: address.map(Address::from),
        }
    }
}

/// Terminal outcome a receiver reports for a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Accepted,
    Rejected,
    Released,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_generator_is_monotonic() {
        let mut tags = TagGenerator::new();
        assert_eq!(tags.next_tag().as_bytes(), b"0");
        assert_eq!(tags.next_tag().as_bytes(), b"1");
        assert_eq!(tags.next_tag().to_string(), "2");
        assert_eq!(tags.issued(), 3);
    }

    #[test]
    fn test_role_opposite() {
        assert_eq!(Role::Sender.opposite(), Role::Receiver);
        assert_eq!(Role::Receiver.opposite(), Role::Sender);
    }

    #[test]
    fn test_message_display_is_lossy_utf8() {
        let message = Message::new(vec![b'h', b'i', 0xFF]);
        assert_eq!(message.len(), 3);
        assert!(message.to_string().starts_with("hi"));
    }
}
