//! Debounced preference persistence.
//!
//! Local preference edits are coalesced into a single remote write. The
//! scheduler owns no timer: the caller asks for the next deadline, sleeps
//! until then, and takes whatever is due.

use crate::preferences::UiPrefs;

pub const DEFAULT_PERSIST_DEBOUNCE_MS: u64 = 400;

/// Trailing-edge debounce for preference writes.
#[derive(Debug, Clone)]
pub struct PersistScheduler {
    delay_ms: u64,
    due_at: Option<u64>,
    pending: Option<UiPrefs>,
}

impl Default for PersistScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_PERSIST_DEBOUNCE_MS)
    }
}

impl PersistScheduler {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            due_at: None,
            pending: None,
        }
    }

    /// Queue `prefs` for writing. A later call replaces the pending value and
    /// pushes the deadline out again.
    pub fn schedule(&mut self, prefs: UiPrefs, now_ms: u64) {
        self.pending = Some(prefs);
        self.due_at = Some(now_ms.saturating_add(self.delay_ms));
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.due_at
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the pending value if its deadline has passed.
    pub fn take_due(&mut self, now_ms: u64) -> Option<UiPrefs> {
        match self.due_at {
            Some(due) if now_ms >= due => {
                self.due_at = None;
                self.pending.take()
            }
            _ => None,
        }
    }

    /// Take the pending value regardless of the deadline (shutdown).
    pub fn flush(&mut self) -> Option<UiPrefs> {
        self.due_at = None;
        self.pending.take()
    }

    pub fn cancel(&mut self) {
        self.due_at = None;
        self.pending = None;
    }
}
