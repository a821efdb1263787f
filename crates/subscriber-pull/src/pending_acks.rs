use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;

use proven_subscriber::AckId;
use tokio::time::Instant;
use tracing::error;

/// Bookkeeping for one delivered, unresolved message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PendingAck {
    /// When the message was handed to the application.
    pub received_at: Instant,

    /// Whether an ack or nack for it is in flight.
    pub resolving: bool,

    /// Size recorded at delivery.
    pub size: usize,
}

/// Outstanding deliveries keyed by ack id.
#[derive(Debug, Default)]
pub struct PendingAckRegistry {
    duplicates: u64,
    entries: HashMap<AckId, PendingAck>,
}

impl PendingAckRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a delivery. Returns false, leaving the existing entry untouched,
    /// if the ack id is already outstanding.
    pub fn insert(&mut self, ack_id: AckId, size: usize, received_at: Instant) -> bool {
        match self.entries.entry(ack_id) {
            Entry::Occupied(entry) => {
                self.duplicates += 1;
                error!("ack id {} delivered twice while outstanding", entry.key());
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(PendingAck {
                    received_at,
                    resolving: false,
                    size,
                });
                true
            }
        }
    }

    /// True if the ack id is outstanding.
    #[must_use]
    pub fn contains(&self, ack_id: &AckId) -> bool {
        self.entries.contains_key(ack_id)
    }

    /// Marks an entry as resolving and returns its recorded size.
    ///
    /// Returns `None` for unknown ids and for ids already being resolved.
    pub fn begin_resolve(&mut self, ack_id: &AckId) -> Option<usize> {
        let entry = self.entries.get_mut(ack_id)?;

        if entry.resolving {
            return None;
        }

        entry.resolving = true;
        Some(entry.size)
    }

    /// Removes an entry once its resolution has returned, whatever the outcome.
    pub fn complete(&mut self, ack_id: &AckId) -> Option<PendingAck> {
        self.entries.remove(ack_id)
    }

    /// Ack ids whose lease should still be extended at `now`.
    ///
    /// Excludes entries being resolved and entries older than `max_lease`.
    #[must_use]
    pub fn leases_to_extend(&self, now: Instant, max_lease: Duration) -> Vec<AckId> {
        self.entries
            .iter()
            .filter(|(_, entry)| {
                !entry.resolving && now.saturating_duration_since(entry.received_at) < max_lease
            })
            .map(|(ack_id, _)| ack_id.clone())
            .collect()
    }

    /// Number of outstanding entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of recorded sizes.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.entries.values().map(|entry| entry.size).sum()
    }

    /// Number of duplicate insertions rejected.
    #[must_use]
    pub const fn duplicates(&self) -> u64 {
        self.duplicates
    }
}
