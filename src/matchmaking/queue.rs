//! FIFO of matches waiting for a second player

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::game::MatchKey;

/// A waiting match in the queue
#[derive(Debug, Clone)]
pub struct QueuedMatch {
    pub key: MatchKey,
    pub queued_at: Instant,
}

impl QueuedMatch {
    /// How long the host has been waiting
    pub fn wait_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.queued_at)
    }
}

/// Waiting matches, oldest first
#[derive(Debug, Default)]
pub struct WaitingQueue {
    queue: VecDeque<QueuedMatch>,
}

impl WaitingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, key: MatchKey, now: Instant) {
        // Re-queue replaces any stale entry for the same key
        self.queue.retain(|q| q.key != key);
        self.queue.push_back(QueuedMatch {
            key,
            queued_at: now,
        });
    }

    /// Oldest waiting match
    pub fn pop_front(&mut self) -> Option<QueuedMatch> {
        self.queue.pop_front()
    }

    pub fn remove(&mut self, key: &MatchKey) -> Option<QueuedMatch> {
        let pos = self.queue.iter().position(|q| &q.key == key)?;
        self.queue.remove(pos)
    }

    /// Remove and return every entry that has waited at least `max_wait`
    pub fn drain_stale(&mut self, now: Instant, max_wait: Duration) -> Vec<QueuedMatch> {
        let mut stale = Vec::new();
        self.queue.retain(|q| {
            if q.wait_time(now) >= max_wait {
                stale.push(q.clone());
                false
            } else {
                true
            }
        });
        stale
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
