//! Live message table
//!
//! Keeps, per identifier, how many times a message was seen, when it was last
//! seen, and the latest value of each of its signals.

use crate::types::{DecodedMessage, DecodedSignal};
use std::collections::BTreeMap;

/// Latest state of one identifier
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedMessage {
    pub can_id: u32,
    pub message_name: String,
    pub count: u64,
    pub last_timestamp_ns: u64,
    /// Signals from the most recent frame, in definition order
    pub signals: Vec<DecodedSignal>,
    pub truncated: bool,
}

#[derive(Debug, Default)]
pub struct MessageTracker {
    entries: BTreeMap<u32, TrackedMessage>,
}

impl MessageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, message: &DecodedMessage) {
        let entry = self
            .entries
            .entry(message.can_id)
            .or_insert_with(|| TrackedMessage {
                can_id: message.can_id,
                message_name: message.message_name.clone(),
                count: 0,
                last_timestamp_ns: 0,
                signals: Vec::new(),
                truncated: false,
            });

        entry.count += 1;
        entry.last_timestamp_ns = message.timestamp_ns;
        entry.truncated = message.is_truncated();

        // Multiplexed messages only carry some signals per frame; keep the rest
        for signal in &message.signals {
            match entry.signals.iter_mut().find(|s| s.name == signal.name) {
                Some(existing) => *existing = signal.clone(),
                None => entry.signals.push(signal.clone()),
            }
        }
    }

    /// Entries sorted by identifier
    pub fn snapshot(&self) -> Vec<TrackedMessage> {
        self.entries.values().cloned().collect()
    }

    pub fn get(&self, can_id: u32) -> Option<&TrackedMessage> {
        self.entries.get(&can_id)
    }

    pub fn remove(&mut self, can_id: u32) -> Option<TrackedMessage> {
        self.entries.remove(&can_id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
