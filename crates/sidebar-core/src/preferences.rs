//! User-scoped sidebar preferences.
//!
//! Preferences are last-writer-wins, ordered by `(version, updated_at)`.
//! Version is compared first so a client with a skewed clock cannot override
//! a deliberate version bump made by the backend.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UiPrefs {
    pub version: u64,
    /// Milliseconds since epoch.
    pub updated_at: u64,
    pub collapsed_directory_ids: Vec<String>,
    pub expanded_parent_session_ids: Vec<String>,
    pub pinned_session_ids: Vec<String>,
    pub directories_page: usize,
    pub session_root_page_by_directory_id: BTreeMap<String, usize>,
    pub pinned_sessions_open: bool,
    pub pinned_sessions_page: usize,
    pub recent_sessions_open: bool,
    pub recent_sessions_page: usize,
    pub running_sessions_open: bool,
    pub running_sessions_page: usize,
}

fn sanitize_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

impl UiPrefs {
    /// Trim and de-duplicate id lists (first occurrence wins) and drop empty
    /// page-map keys.
    pub fn sanitized(mut self) -> Self {
        self.collapsed_directory_ids = sanitize_ids(self.collapsed_directory_ids);
        self.expanded_parent_session_ids = sanitize_ids(self.expanded_parent_session_ids);
        self.pinned_session_ids = sanitize_ids(self.pinned_session_ids);
        self.session_root_page_by_directory_id = self
            .session_root_page_by_directory_id
            .into_iter()
            .filter_map(|(key, page)| {
                let key = key.trim().to_string();
                (!key.is_empty()).then_some((key, page))
            })
            .collect();
        self
    }

    pub fn is_pinned(&self, session_id: &str) -> bool {
        self.pinned_session_ids.iter().any(|id| id == session_id)
    }

    pub fn is_collapsed(&self, directory_id: &str) -> bool {
        self.collapsed_directory_ids.iter().any(|id| id == directory_id)
    }

    pub fn is_expanded(&self, session_id: &str) -> bool {
        self.expanded_parent_session_ids.iter().any(|id| id == session_id)
    }

    pub fn root_page_for(&self, directory_id: &str) -> usize {
        self.session_root_page_by_directory_id
            .get(directory_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Order two preference values by recency: version first, then `updated_at`.
pub fn compare_recency(a: &UiPrefs, b: &UiPrefs) -> Ordering {
    a.version
        .cmp(&b.version)
        .then_with(|| a.updated_at.cmp(&b.updated_at))
}

/// Field-by-field equality ignoring the recency stamp.
pub fn body_equals(a: &UiPrefs, b: &UiPrefs) -> bool {
    a.collapsed_directory_ids == b.collapsed_directory_ids
        && a.expanded_parent_session_ids == b.expanded_parent_session_ids
        && a.pinned_session_ids == b.pinned_session_ids
        && a.directories_page == b.directories_page
        && a.session_root_page_by_directory_id == b.session_root_page_by_directory_id
        && a.pinned_sessions_open == b.pinned_sessions_open
        && a.pinned_sessions_page == b.pinned_sessions_page
        && a.recent_sessions_open == b.recent_sessions_open
        && a.recent_sessions_page == b.recent_sessions_page
        && a.running_sessions_open == b.running_sessions_open
        && a.running_sessions_page == b.running_sessions_page
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// Strictly newer with a different body; now current.
    Applied,
    /// Strictly newer but the same body. Only the stamp was adopted.
    Unchanged,
    /// Equal or older; ignored.
    Stale,
}

/// Paged list a page cursor belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefsList {
    Directories,
    Pinned,
    Recent,
    Running,
    DirectoryRoots(String),
}

#[derive(Debug, Clone, Default)]
pub struct PreferencesStore {
    current: UiPrefs,
}

impl PreferencesStore {
    pub fn new(initial: UiPrefs) -> Self {
        Self {
            current: initial.sanitized(),
        }
    }

    pub fn current(&self) -> &UiPrefs {
        &self.current
    }

    /// Wholesale replacement from another writer.
    pub fn replace(&mut self, incoming: UiPrefs) -> ReplaceOutcome {
        let incoming = incoming.sanitized();
        if compare_recency(&incoming, &self.current) != Ordering::Greater {
            tracing::debug!(
                "Ignoring stale preferences: version {} at {}",
                incoming.version,
                incoming.updated_at
            );
            return ReplaceOutcome::Stale;
        }
        if body_equals(&incoming, &self.current) {
            self.current.version = incoming.version;
            self.current.updated_at = incoming.updated_at;
            return ReplaceOutcome::Unchanged;
        }
        self.current = incoming;
        ReplaceOutcome::Applied
    }

    /// Pin or unpin a session. Returns whether it is now pinned.
    pub fn toggle_pin(&mut self, session_id: &str, now_ms: u64) -> bool {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return false;
        }
        let pinned = !self.current.is_pinned(session_id);
        set_membership(&mut self.current.pinned_session_ids, session_id, pinned);
        self.touch(now_ms);
        pinned
    }

    /// Returns `false` when the state already matched.
    pub fn set_collapsed(&mut self, directory_id: &str, collapsed: bool, now_ms: u64) -> bool {
        let changed = set_membership(
            &mut self.current.collapsed_directory_ids,
            directory_id.trim(),
            collapsed,
        );
        if changed {
            self.touch(now_ms);
        }
        changed
    }

    pub fn set_expanded(&mut self, session_id: &str, expanded: bool, now_ms: u64) -> bool {
        let changed = set_membership(
            &mut self.current.expanded_parent_session_ids,
            session_id.trim(),
            expanded,
        );
        if changed {
            self.touch(now_ms);
        }
        changed
    }

    pub fn set_page(&mut self, list: &PrefsList, page: usize, now_ms: u64) -> bool {
        let prefs = &mut self.current;
        let slot = match list {
            PrefsList::Directories => &mut prefs.directories_page,
            PrefsList::Pinned => &mut prefs.pinned_sessions_page,
            PrefsList::Recent => &mut prefs.recent_sessions_page,
            PrefsList::Running => &mut prefs.running_sessions_page,
            PrefsList::DirectoryRoots(directory_id) => {
                let key = directory_id.trim();
                if key.is_empty() {
                    return false;
                }
                prefs
                    .session_root_page_by_directory_id
                    .entry(key.to_string())
                    .or_insert(0)
            }
        };
        if *slot == page {
            return false;
        }
        *slot = page;
        self.touch(now_ms);
        true
    }

    /// Only the pinned, recent and running lists can be opened.
    pub fn set_open(&mut self, list: &PrefsList, open: bool, now_ms: u64) -> bool {
        let prefs = &mut self.current;
        let slot = match list {
            PrefsList::Pinned => &mut prefs.pinned_sessions_open,
            PrefsList::Recent => &mut prefs.recent_sessions_open,
            PrefsList::Running => &mut prefs.running_sessions_open,
            PrefsList::Directories | PrefsList::DirectoryRoots(_) => return false,
        };
        if *slot == open {
            return false;
        }
        *slot = open;
        self.touch(now_ms);
        true
    }

    /// Move the version forward after the backend stored an older body,
    /// keeping local edits made in the meantime for the next write.
    pub fn rebase(&mut self, version: u64) {
        self.current.version = self.current.version.max(version);
    }

    /// Local edits keep the version (the backend bumps it on write) and move
    /// `updated_at` strictly forward.
    fn touch(&mut self, now_ms: u64) {
        self.current.updated_at = now_ms.max(self.current.updated_at.saturating_add(1));
    }
}

fn set_membership(ids: &mut Vec<String>, id: &str, present: bool) -> bool {
    if id.is_empty() {
        return false;
    }
    let position = ids.iter().position(|existing| existing == id);
    match (position, present) {
        (None, true) => {
            ids.push(id.to_string());
            true
        }
        (Some(index), false) => {
            ids.remove(index);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamped(version: u64, updated_at: u64) -> UiPrefs {
        UiPrefs {
            version,
            updated_at,
            ..UiPrefs::default()
        }
    }

    #[test]
    fn test_rebase_keeps_local_body() {
        let mut store = PreferencesStore::new(stamped(1, 10));
        store.toggle_pin("s_1", 20);
        store.rebase(4);
        assert_eq!(store.current().version, 4);
        assert!(store.current().is_pinned("s_1"));
        store.rebase(2);
        assert_eq!(store.current().version, 4);
    }

    #[test]
    fn test_older_version_rejected_despite_newer_clock() {
        let mut store = PreferencesStore::new(stamped(2, 0));
        let incoming = UiPrefs {
            pinned_session_ids: vec!["s_1".into()],
            ..stamped(1, 100)
        };
        assert_eq!(store.replace(incoming), ReplaceOutcome::Stale);
        assert!(store.current().pinned_session_ids.is_empty());
    }

    #[test]
    fn test_same_version_newer_timestamp_accepted() {
        let mut store = PreferencesStore::new(stamped(2, 10));
        let incoming = UiPrefs {
            pinned_session_ids: vec!["s_1".into()],
            ..stamped(2, 50)
        };
        assert_eq!(store.replace(incoming), ReplaceOutcome::Applied);
        assert!(store.current().is_pinned("s_1"));
        assert_eq!(store.current().updated_at, 50);
    }

    #[test]
    fn test_equal_stamp_ignored() {
        let mut store = PreferencesStore::new(stamped(3, 30));
        let incoming = UiPrefs {
            recent_sessions_open: true,
            ..stamped(3, 30)
        };
        assert_eq!(store.replace(incoming), ReplaceOutcome::Stale);
    }

    #[test]
    fn test_newer_identical_body_adopts_stamp_only() {
        let mut store = PreferencesStore::new(stamped(1, 10));
        assert_eq!(store.replace(stamped(2, 20)), ReplaceOutcome::Unchanged);
        assert_eq!(store.current().version, 2);
        assert_eq!(store.current().updated_at, 20);
    }

    #[test]
    fn test_sanitize_trims_and_dedups() {
        let prefs = UiPrefs {
            pinned_session_ids: vec![" a ".into(), "b".into(), "a".into(), "  ".into()],
            session_root_page_by_directory_id: BTreeMap::from([
                (" ".to_string(), 3),
                ("d1".to_string(), 2),
            ]),
            ..UiPrefs::default()
        }
        .sanitized();
        assert_eq!(prefs.pinned_session_ids, vec!["a", "b"]);
        assert_eq!(prefs.session_root_page_by_directory_id.len(), 1);
        assert_eq!(prefs.root_page_for("d1"), 2);
    }

    #[test]
    fn test_toggle_pin_round_trip_moves_clock_forward() {
        let mut store = PreferencesStore::new(stamped(1, 500));
        assert!(store.toggle_pin("s_1", 100));
        assert_eq!(store.current().updated_at, 501);
        assert!(!store.toggle_pin("s_1", 1000));
        assert_eq!(store.current().updated_at, 1000);
        assert_eq!(store.current().version, 1);
        assert!(store.current().pinned_session_ids.is_empty());
    }

    #[test]
    fn test_set_collapsed_reports_noop() {
        let mut store = PreferencesStore::default();
        assert!(store.set_collapsed("d1", true, 1));
        assert!(!store.set_collapsed("d1", true, 2));
        assert_eq!(store.current().updated_at, 1);
        assert!(store.set_collapsed("d1", false, 3));
        assert!(!store.current().is_collapsed("d1"));
    }

    #[test]
    fn test_set_page_per_directory() {
        let mut store = PreferencesStore::default();
        assert!(store.set_page(&PrefsList::DirectoryRoots("d1".into()), 2, 1));
        assert!(!store.set_page(&PrefsList::DirectoryRoots("d1".into()), 2, 2));
        assert!(store.set_page(&PrefsList::Recent, 1, 3));
        assert_eq!(store.current().root_page_for("d1"), 2);
        assert_eq!(store.current().recent_sessions_page, 1);
    }

    #[test]
    fn test_set_open_only_for_session_lists() {
        let mut store = PreferencesStore::default();
        assert!(store.set_open(&PrefsList::Running, true, 1));
        assert!(!store.set_open(&PrefsList::Directories, true, 2));
        assert!(store.current().running_sessions_open);
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let prefs: UiPrefs = serde_json::from_str(r#"{"version":4,"pinnedSessionIds":["x"]}"#).unwrap();
        assert_eq!(prefs.version, 4);
        assert!(prefs.is_pinned("x"));
        assert!(!prefs.recent_sessions_open);
    }
}
