//! Per-directory page cache of root sessions and their descendants.
//!
//! Sessions are stored flat with a parent id reference. Trees are resolved by
//! iterative walks with a visited set, so a corrupt parent cycle can never
//! loop. Two invariants hold after every mutation:
//!
//! - no cached session has a parent id that is missing from the same page
//! - the number of distinct roots never exceeds the page's root cap
//!
//! Both are enforced by dropping or trimming, never by refusing an update.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Anything that can live in a [`SessionPage`].
pub trait PageItem: Clone + PartialEq {
    fn item_id(&self) -> &str;
    /// `None` for a root.
    fn parent_id(&self) -> Option<&str>;
    fn updated_at(&self) -> i64;
}

/// Backend staleness marker for a page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageConsistency {
    /// The backend served a partial page and wants a retry.
    pub degraded: bool,
    pub retry_after_ms: Option<u64>,
}

/// Precomputed tree layout supplied by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeHint {
    pub root_session_ids: Vec<String>,
    pub children_by_parent_session_id: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOptions {
    /// Count a newly inserted root towards `total_roots`.
    pub increment_root_total: bool,
    /// Root cap for this page. `0` disables the cap.
    pub max_root_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPage<T> {
    /// Zero-based page index.
    pub page: usize,
    pub offset: usize,
    pub limit: usize,
    /// Root count reported by the backend, independent of what is cached.
    pub total_roots: usize,
    pub sessions: Vec<T>,
    pub consistency: Option<PageConsistency>,
    pub tree_hint: Option<TreeHint>,
}

impl<T> Default for SessionPage<T> {
    fn default() -> Self {
        Self {
            page: 0,
            offset: 0,
            limit: 0,
            total_roots: 0,
            sessions: Vec::new(),
            consistency: None,
            tree_hint: None,
        }
    }
}

impl<T: PageItem> SessionPage<T> {
    pub fn new(page: usize, limit: usize) -> Self {
        Self {
            page,
            offset: page * limit,
            limit,
            ..Self::default()
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.iter().any(|s| s.item_id() == id)
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.sessions.iter().find(|s| s.item_id() == id)
    }

    pub fn is_degraded(&self) -> bool {
        self.consistency.as_ref().is_some_and(|c| c.degraded)
    }

    /// Insert or replace one session.
    ///
    /// Returns `false` when nothing changed: the stored copy was equal, or the
    /// session could not be placed yet (a root outside page 0, or a child
    /// whose parent is not cached). Deferred children arrive with their
    /// parent's next reload.
    pub fn upsert(&mut self, item: T, opts: UpsertOptions) -> bool {
        if let Some(pos) = self.sessions.iter().position(|s| s.item_id() == item.item_id()) {
            if self.sessions[pos] == item {
                return false;
            }
            self.sessions[pos] = item;
        } else {
            match item.parent_id() {
                None => {
                    if self.page != 0 {
                        return false;
                    }
                    self.sessions.insert(0, item);
                    if opts.increment_root_total {
                        self.total_roots += 1;
                    }
                }
                Some(parent) => {
                    if !self.contains(parent) {
                        return false;
                    }
                    self.sessions.push(item);
                }
            }
        }

        self.prune_orphans();
        self.enforce_root_cap(opts.max_root_count);
        self.tree_hint = None;
        true
    }

    /// Remove a session and its cached descendants.
    ///
    /// Returns `false` when the id was not cached.
    pub fn remove(&mut self, id: &str, decrement_root_total: bool) -> bool {
        let Some(target) = self.get(id) else {
            return false;
        };
        let was_root = target.parent_id().is_none();

        self.sessions.retain(|s| s.item_id() != id);
        self.prune_orphans();
        if was_root && decrement_root_total {
            self.total_roots = self.total_roots.saturating_sub(1);
        }
        self.tree_hint = None;
        true
    }

    /// Fold a freshly loaded page into this one.
    ///
    /// Paging metadata, consistency and tree hint come from `loaded`. For ids
    /// on both sides the newer `updated_at` wins, so a slow reload cannot undo
    /// a patch applied while it was in flight. Cached-only sessions survive if
    /// they are newer than anything the reload saw, or if the reload is
    /// degraded.
    pub fn merge_loaded(&mut self, loaded: SessionPage<T>, max_root_count: usize) {
        let degraded = loaded.is_degraded();
        let watermark = loaded.sessions.iter().map(PageItem::updated_at).max();
        let mut current: HashMap<String, T> = self
            .sessions
            .drain(..)
            .map(|s| (s.item_id().to_string(), s))
            .collect();
        let loaded_ids: HashSet<String> = loaded
            .sessions
            .iter()
            .map(|s| s.item_id().to_string())
            .collect();

        let mut merged = Vec::with_capacity(loaded.sessions.len() + current.len());
        for incoming in loaded.sessions {
            match current.remove(incoming.item_id()) {
                Some(cached) if cached.updated_at() > incoming.updated_at() => merged.push(cached),
                _ => merged.push(incoming),
            }
        }

        let mut survivors: Vec<T> = current
            .into_values()
            .filter(|cached| degraded || watermark.is_none_or(|w| cached.updated_at() > w))
            .collect();
        survivors.sort_by(|a, b| {
            b.updated_at()
                .cmp(&a.updated_at())
                .then_with(|| a.item_id().cmp(b.item_id()))
        });
        survivors.append(&mut merged);

        self.page = loaded.page;
        self.offset = loaded.offset;
        self.limit = loaded.limit;
        self.total_roots = loaded.total_roots;
        self.consistency = loaded.consistency;
        self.sessions = survivors;
        self.prune_orphans();
        self.enforce_root_cap(max_root_count);
        // The hint only describes the loaded set.
        let same_set = self.sessions.len() == loaded_ids.len()
            && self.sessions.iter().all(|s| loaded_ids.contains(s.item_id()));
        self.tree_hint = if same_set { loaded.tree_hint } else { None };
    }

    /// Root sessions in display order.
    pub fn roots(&self) -> Vec<&T> {
        if let Some(hint) = &self.tree_hint {
            return hint
                .root_session_ids
                .iter()
                .filter_map(|id| self.get(id))
                .collect();
        }
        self.sessions
            .iter()
            .filter(|s| s.parent_id().is_none())
            .collect()
    }

    /// Direct children of `parent_id` in display order.
    pub fn children_of(&self, parent_id: &str) -> Vec<&T> {
        if let Some(hint) = &self.tree_hint {
            return hint
                .children_by_parent_session_id
                .get(parent_id)
                .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
                .unwrap_or_default();
        }
        self.sessions
            .iter()
            .filter(|s| s.parent_id() == Some(parent_id))
            .collect()
    }

    /// Number of distinct roots among cached sessions, counting cycle
    /// members as one self-rooted tree.
    pub fn root_count(&self) -> usize {
        resolve_roots(&self.sessions)
            .values()
            .collect::<HashSet<_>>()
            .len()
    }

    fn prune_orphans(&mut self) {
        let roots = resolve_roots(&self.sessions);
        let ids: HashSet<&str> = self.sessions.iter().map(PageItem::item_id).collect();
        let orphaned: HashSet<String> = self
            .sessions
            .iter()
            .filter(|s| {
                let Some(root_id) = roots.get(s.item_id()) else {
                    return false;
                };
                self.get(root_id)
                    .and_then(PageItem::parent_id)
                    .is_some_and(|parent| !ids.contains(parent))
            })
            .map(|s| s.item_id().to_string())
            .collect();
        if !orphaned.is_empty() {
            self.sessions.retain(|s| !orphaned.contains(s.item_id()));
        }
    }

    /// Trim whole subtrees, oldest root first, until the cap holds.
    fn enforce_root_cap(&mut self, max_root_count: usize) {
        if max_root_count == 0 {
            return;
        }
        let roots = resolve_roots(&self.sessions);
        let mut root_ids: Vec<(&str, i64, usize)> = Vec::new();
        let mut seen = HashSet::new();
        for (position, session) in self.sessions.iter().enumerate() {
            if let Some(root_id) = roots.get(session.item_id())
                && seen.insert(root_id.as_str())
            {
                let updated = self.get(root_id).map(PageItem::updated_at).unwrap_or(0);
                root_ids.push((root_id.as_str(), updated, position));
            }
        }
        if root_ids.len() <= max_root_count {
            return;
        }

        // Oldest first; among equals, the one further down the list goes first.
        root_ids.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| b.2.cmp(&a.2)));
        let excess = root_ids.len() - max_root_count;
        let evicted: HashSet<String> = root_ids
            .iter()
            .take(excess)
            .map(|(id, _, _)| id.to_string())
            .collect();
        self.sessions.retain(|s| {
            roots
                .get(s.item_id())
                .is_none_or(|root_id| !evicted.contains(root_id))
        });
    }
}

/// Map every session id to the id at the top of its parent chain.
///
/// The walk stops at a session without a parent, at a parent that is not in
/// `sessions`, or when it revisits a node. In the last case the session the
/// walk started from becomes the root of the whole cycle.
pub fn resolve_roots<T: PageItem>(sessions: &[T]) -> HashMap<String, String> {
    let parents: HashMap<&str, Option<&str>> = sessions
        .iter()
        .map(|s| (s.item_id(), s.parent_id()))
        .collect();
    let mut memo: HashMap<&str, &str> = HashMap::with_capacity(sessions.len());

    for session in sessions {
        let start = session.item_id();
        if memo.contains_key(start) {
            continue;
        }
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = start;
        let root = loop {
            if let Some(root) = memo.get(cursor) {
                break *root;
            }
            if !visited.insert(cursor) {
                break start;
            }
            chain.push(cursor);
            match parents.get(cursor).copied().flatten() {
                Some(parent) if parents.contains_key(parent) => cursor = parent,
                _ => break cursor,
            }
        };
        for id in chain {
            memo.insert(id, root);
        }
    }

    memo.into_iter()
        .map(|(id, root)| (id.to_string(), root.to_string()))
        .collect()
}
