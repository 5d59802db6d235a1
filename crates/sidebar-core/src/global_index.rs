//! Bounded, recency-ordered session indices.
//!
//! The recent and running indices share one shape and one upsert contract.
//! Ordering is `updated_at` descending, then `session_id` ascending, so pages
//! are stable. The cap is not enforced during upsert: only the first `cap`
//! entries are visible at the read boundary, and [`GlobalIndex::compact`]
//! drops the rest once a batch is fully applied.

use crate::paging::{Page, page};
use crate::runtime::SessionRuntimeState;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;

pub const RECENT_INDEX_CAP: usize = 40;
pub const RUNNING_INDEX_CAP: usize = 400;

/// One denormalized row of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub session_id: String,
    pub directory_id: Option<String>,
    pub directory_path: Option<String>,
    pub updated_at: i64,
    /// Only carried by the running index.
    pub runtime: Option<SessionRuntimeState>,
}

pub type RecentIndexEntry = IndexEntry;
pub type RunningIndexEntry = IndexEntry;

impl IndexEntry {
    /// Decode one item of a backend index page.
    pub fn from_value(value: &Value) -> Option<Self> {
        let session_id = value
            .get("sessionId")
            .or_else(|| value.get("sessionID"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())?
            .to_string();
        let text = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let updated_at = value
            .get("updatedAt")
            .and_then(Value::as_f64)
            .filter(|v| v.is_finite())
            .map(|v| v.floor() as i64)
            .unwrap_or(0);
        let runtime = value
            .get("runtime")
            .and_then(|raw| SessionRuntimeState::from_value(Some(session_id.as_str()), raw));

        Some(Self {
            directory_id: text("directoryId"),
            directory_path: text("directoryPath"),
            session_id,
            updated_at,
            runtime,
        })
    }
}

/// Partial update for one index row. `None` fields keep the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexPatch {
    pub session_id: String,
    pub directory_id: Option<String>,
    pub directory_path: Option<String>,
    pub runtime: Option<SessionRuntimeState>,
    pub now_ms: i64,
}

fn compare_entries(a: &IndexEntry, b: &IndexEntry) -> std::cmp::Ordering {
    b.updated_at
        .cmp(&a.updated_at)
        .then_with(|| a.session_id.cmp(&b.session_id))
}

#[derive(Debug, Clone)]
pub struct GlobalIndex {
    entries: Vec<IndexEntry>,
    total: usize,
    cap: usize,
}

impl GlobalIndex {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: Vec::new(),
            total: 0,
            cap,
        }
    }

    pub fn recent() -> Self {
        Self::new(RECENT_INDEX_CAP)
    }

    pub fn running() -> Self {
        Self::new(RUNNING_INDEX_CAP)
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn get(&self, session_id: &str) -> Option<&IndexEntry> {
        self.entries.iter().find(|e| e.session_id == session_id)
    }

    /// The bounded prefix surfaces may observe.
    pub fn visible(&self) -> &[IndexEntry] {
        &self.entries[..self.entries.len().min(self.cap)]
    }

    /// Every tracked entry, including those past the cap.
    pub fn all(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Find-or-insert by session id, merging only the fields the patch
    /// carries. Returns `false` when the row is unchanged.
    pub fn upsert(&mut self, patch: IndexPatch) -> bool {
        let session_id = patch.session_id.trim();
        if session_id.is_empty() {
            return false;
        }

        match self.entries.iter_mut().find(|e| e.session_id == session_id) {
            Some(existing) => {
                let before = existing.clone();
                if patch.directory_id.is_some() {
                    existing.directory_id = patch.directory_id;
                }
                if patch.directory_path.is_some() {
                    existing.directory_path = patch.directory_path;
                }
                if patch.runtime.is_some() {
                    existing.runtime = patch.runtime;
                }
                existing.updated_at = existing.updated_at.max(patch.now_ms);
                if *existing == before {
                    return false;
                }
            }
            None => {
                self.entries.push(IndexEntry {
                    session_id: session_id.to_string(),
                    directory_id: patch.directory_id,
                    directory_path: patch.directory_path,
                    updated_at: patch.now_ms,
                    runtime: patch.runtime,
                });
                self.total = self.total.max(self.entries.len());
            }
        }

        self.entries.sort_by(compare_entries);
        true
    }

    pub fn remove(&mut self, session_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.session_id != session_id);
        if self.entries.len() == before {
            return false;
        }
        self.total = self.total.saturating_sub(1);
        true
    }

    /// Replace everything with a page loaded from the backend.
    pub fn replace_all(&mut self, mut entries: Vec<IndexEntry>, total: usize) {
        let mut seen = HashSet::new();
        entries.retain(|e| seen.insert(e.session_id.clone()));
        entries.sort_by(compare_entries);
        self.total = total.max(entries.len());
        self.entries = entries;
    }

    /// Drop everything past the cap.
    pub fn compact(&mut self) {
        self.entries.truncate(self.cap);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn page(&self, offset: usize, limit: usize) -> Page<IndexEntry> {
        page(self.visible(), offset, limit)
    }
}
