//! Bounded admission queue for background directory reloads.

use std::collections::{HashSet, VecDeque};

pub const DEFAULT_MAX_ITEMS: usize = 64;

/// Result of [`RefreshQueue::enqueue`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub queued: bool,
    /// Oldest key evicted to make room. The caller decides whether that work
    /// must be recovered some other way.
    pub dropped: Option<String>,
}

/// FIFO of directory ids with O(1) duplicate suppression.
///
/// When full, the oldest key is evicted, not the least recently touched one.
#[derive(Debug, Clone)]
pub struct RefreshQueue {
    max_items: usize,
    items: VecDeque<String>,
    present: HashSet<String>,
}

impl Default for RefreshQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITEMS)
    }
}

impl RefreshQueue {
    pub fn new(max_items: usize) -> Self {
        Self {
            max_items: max_items.max(1),
            items: VecDeque::new(),
            present: HashSet::new(),
        }
    }

    pub fn enqueue(&mut self, key: &str) -> EnqueueOutcome {
        if key.is_empty() || self.present.contains(key) {
            return EnqueueOutcome::default();
        }

        let mut dropped = None;
        if self.items.len() >= self.max_items
            && let Some(oldest) = self.items.pop_front()
        {
            self.present.remove(&oldest);
            dropped = Some(oldest);
        }

        self.items.push_back(key.to_string());
        self.present.insert(key.to_string());
        EnqueueOutcome {
            queued: true,
            dropped,
        }
    }

    pub fn shift(&mut self) -> Option<String> {
        let key = self.items.pop_front()?;
        self.present.remove(&key);
        Some(key)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.present.clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.present.contains(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
