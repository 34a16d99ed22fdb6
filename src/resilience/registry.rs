//! Process-wide ownership of logical queues
//!
//! Constructed once at the process root and shared by reference with every
//! connection. An entry records which connection instance holds the queue,
//! so a stale release from a previous holder cannot free a newer one.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

/// At most one live connection per queue identity
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    holders: DashMap<String, Uuid>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic test-and-set; true only if nobody holds `queue_id`
    pub fn try_register(&self, queue_id: &str, holder: Uuid) -> bool {
        match self.holders.entry(queue_id.to_string()) {
            Entry::Occupied(existing) => {
                debug!(queue = queue_id, holder = %existing.get(), "Queue already held");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(holder);
                true
            }
        }
    }

    /// Idempotent release; only the current holder can free the slot
    pub fn unregister(&self, queue_id: &str, holder: Uuid) -> bool {
        self.holders
            .remove_if(queue_id, |_, current| *current == holder)
            .is_some()
    }

    pub fn is_registered(&self, queue_id: &str) -> bool {
        self.holders.contains_key(queue_id)
    }

    pub fn holder(&self, queue_id: &str) -> Option<Uuid> {
        self.holders.get(queue_id).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}
