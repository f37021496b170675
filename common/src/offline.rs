use serde::{Deserialize, Serialize};

/// A manual transition recorded while the coordinator was unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineEvent {
    pub pin: i32,
    #[serde(rename = "previousState")]
    pub previous_state: bool,
    #[serde(rename = "newState")]
    pub new_state: bool,
    pub timestamp: i64,
}

/// Fixed-capacity queue of manual transitions accumulated while not fully
/// synced. Overflow evicts the oldest unflushed entry. The whole buffer is
/// snapshotted to persistent storage after every mutation, so loss across a
/// crash is bounded to unflushed writes, not to connectivity gaps.
#[derive(Debug, Clone)]
pub struct OfflineEventBuffer {
    events: Vec<OfflineEvent>,
    capacity: usize,
    evicted: u64,
}

impl OfflineEventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    /// Rebuilds the buffer from a persisted snapshot, clamped to capacity
    /// (oldest entries beyond capacity are discarded).
    pub fn from_snapshot(snapshot: Vec<OfflineEvent>, capacity: usize) -> Self {
        let mut events = snapshot;
        let excess = events.len().saturating_sub(capacity);
        if excess > 0 {
            events.drain(..excess);
        }
        Self {
            events,
            capacity,
            evicted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events evicted to make room since boot.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn append(&mut self, event: OfflineEvent) {
        if self.events.len() >= self.capacity {
            self.events.remove(0);
            self.evicted += 1;
        }
        self.events.push(event);
    }

    /// Removes and returns all buffered events in record order. Called
    /// exactly once per transition to FullySynced.
    pub fn drain_in_order(&mut self) -> Vec<OfflineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Serializable view for persistence.
    pub fn snapshot(&self) -> &[OfflineEvent] {
        &self.events
    }
}
