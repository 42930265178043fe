//! Bounded ring of recent events.

use relay_protocol::Event;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

pub const DEFAULT_CAPACITY: usize = 1000;

/// Thread-safe bounded event log; the oldest events drop on overflow.
#[derive(Clone)]
pub struct EventManager {
    inner: Arc<RwLock<Ring>>,
}

struct Ring {
    events: VecDeque<Event>,
    capacity: usize,
}

impl EventManager {
    /// A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(RwLock::new(Ring {
                events: VecDeque::with_capacity(capacity),
                capacity,
            })),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().unwrap().capacity
    }

    pub fn add_event(&self, event: Event) {
        let mut ring = self.inner.write().unwrap();
        if ring.events.len() == ring.capacity {
            ring.events.pop_front();
        }
        ring.events.push_back(event);
    }

    /// Snapshot copy, oldest first.  Callers may mutate freely.
    pub fn events(&self) -> Vec<Event> {
        self.inner.read().unwrap().events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().events.is_empty()
    }

    pub fn clear(&self) {
        self.inner.write().unwrap().events.clear();
    }

    /// Replace the ring contents with events loaded from the store, keeping
    /// only the newest `capacity` entries.
    pub fn load_from_db(&self, events: Vec<Event>) {
        let mut ring = self.inner.write().unwrap();
        ring.events.clear();
        let skip = events.len().saturating_sub(ring.capacity);
        ring.events.extend(events.into_iter().skip(skip));
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
