//! Address Message Store
//!
//! Per-address FIFO queues of opaque messages. An address is present in the
//! store exactly when it has at least one queued message: queues are created
//! on first insert and removed as soon as the last message is taken.

use std::collections::VecDeque;

use hashbrown::HashMap;

use crate::config::{BacklogConfig, BacklogPolicy};
use crate::errors::StoreError;
use crate::types::{Address, Message};
use crate::Result;

// ----------------------------------------------------------------------------
// Message Store Implementation
// ----------------------------------------------------------------------------

/// Store-and-forward buffer keyed by address
#[derive(Debug, Default)]
pub struct MessageStore {
    /// Non-empty queues indexed by address
    queues: HashMap<Address, VecDeque<Message>>,
    /// Optional backlog limits
    config: BacklogConfig,
    /// Statistics
    stats: MessageStoreStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageStoreStats {
    pub stored: u64,
    pub taken: u64,
    pub rejected: u64,
    pub evicted: u64,
}

impl MessageStore {
    /// Create an unbounded store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with backlog limits
    pub fn with_config(config: BacklogConfig) -> Self {
        Self {
            queues: HashMap::default(),
            config,
            stats: MessageStoreStats::default(),
        }
    }

    /// Append a message to the address queue, creating the queue if needed
    ///
    /// Returns the evicted message when a `DropOldest` limit made room.
    pub fn put(&mut self, address: &Address, message: Message) -> Result<Option<Message>> {
        let mut evicted = None;

        if let Some(limit) = self.config.max_messages_per_address {
            let queued = self.queues.get(address).map_or(0, VecDeque::len);
            if queued >= limit {
                match self.config.policy {
                    BacklogPolicy::Reject => {
                        self.stats.rejected += 1;
                        return Err(StoreError::BacklogFull {
                            address: address.to_string(),
                            limit,
                        }
                        .into());
                    }
                    BacklogPolicy::DropOldest => {
                        evicted = self.queues.get_mut(address).and_then(VecDeque::pop_front);
                        self.stats.evicted += 1;
                    }
                }
            }
        }

        self.queues
            .entry(address.clone())
            .or_default()
            .push_back(message);
        self.stats.stored += 1;
        Ok(evicted)
    }

    /// Pop the oldest message for the address
    pub fn take(&mut self, address: &Address) -> Option<Message> {
        let queue = self.queues.get_mut(address)?;
        let message = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(address);
        }
        if message.is_some() {
            self.stats.taken += 1;
        }
        message
    }

    /// Number of messages queued for the address
    pub fn backlog(&self, address: &Address) -> usize {
        self.queues.get(address).map_or(0, VecDeque::len)
    }

    /// Check whether the address has any pending backlog
    pub fn contains(&self, address: &Address) -> bool {
        self.queues.contains_key(address)
    }

    /// Number of addresses with pending backlog
    pub fn address_count(&self) -> usize {
        self.queues.len()
    }

    /// Total number of queued messages across all addresses
    pub fn message_count(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Get store statistics
    pub fn stats(&self) -> &MessageStoreStats {
        &self.stats
    }
}
