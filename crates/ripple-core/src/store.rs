//! Bounded in-memory message log.
//!
//! The store keeps the most recent messages in insertion order, evicting the
//! oldest entry once capacity is reached. It is the process-lifetime record
//! that newly arriving subscribers read to catch up.

use crate::message::Message;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::info;

/// Default number of retained messages.
///
/// Chosen in tandem with [`MESSAGE_ID_SPACE`] so that client-generated IDs
/// within the retained window have a negligible collision probability.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Number of distinct IDs the client-side generator can produce.
pub const MESSAGE_ID_SPACE: u64 = 68_719_476_736;

/// Bounded, insertion-ordered log of chat messages.
///
/// Appends may come from concurrent request handler tasks; the sequence is
/// guarded by a mutex with short critical sections, and reads are
/// copy-on-read so a snapshot never observes a torn write.
#[derive(Debug)]
pub struct MessageStore {
    messages: Mutex<VecDeque<Message>>,
    capacity: usize,
    collision_probability: f64,
}

impl MessageStore {
    /// Create a store with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a store retaining at most `capacity` messages.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let probability = collision_probability(capacity, MESSAGE_ID_SPACE);
        info!(
            capacity,
            collision_probability = probability,
            "Message store initialized"
        );

        Self {
            messages: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            collision_probability: probability,
        }
    }

    /// Append a message, evicting the single oldest entry when full.
    ///
    /// Always succeeds; the length never exceeds the configured capacity.
    /// The store does not deduplicate or validate IDs.
    pub fn append(&self, msg: Message) {
        let mut messages = self.messages.lock().unwrap();
        if messages.len() == self.capacity {
            messages.pop_front();
        }
        messages.push_back(msg);
    }

    /// All stored messages, oldest first, as a point-in-time copy.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.lock().unwrap().iter().cloned().collect()
    }

    /// Number of currently stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    /// Check if the store holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of retained messages.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Chance that two client-generated IDs in a full store collide.
    ///
    /// Computed once at construction; diagnostic only.
    #[must_use]
    pub fn collision_probability(&self) -> f64 {
        self.collision_probability
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Birthday-problem approximation for `capacity` IDs drawn uniformly from a
/// space of `id_space` possibilities.
///
/// <https://en.wikipedia.org/wiki/Birthday_problem>
#[must_use]
pub fn collision_probability(capacity: usize, id_space: u64) -> f64 {
    let id_space = id_space as f64;
    let mut no_collision = 1.0_f64;
    for i in 0..capacity {
        no_collision *= 1.0 - i as f64 / id_space;
    }
    1.0 - no_collision
}
