//! The sidebar synchronization engine.
//!
//! One owned state value with one mutation surface: bootstrap, patch batches,
//! and the results of background reloads all go through `&mut self` methods
//! and are applied in arrival order. Every op is an idempotent upsert or
//! remove by id, so arrival order is enough. Surfaces read through the
//! getters and learn about changes from the [`EventBus`].
//!
//! Methods that stamp time have an `_at` variant taking `now_ms`; the plain
//! variant reads the wall clock.

use crate::events::{EventBuffer, EventBus, SidebarEvent};
use crate::global_index::{GlobalIndex, IndexEntry, IndexPatch};
use crate::page_state::{SessionPage, UpsertOptions};
use crate::paging::{LimitRange, Page, RECENT_LIMIT, RUNNING_LIMIT, clamp_limit};
use crate::persist::PersistScheduler;
use crate::planner::{PlannerContext, RefreshPlan, plan};
use crate::preferences::{PreferencesStore, PrefsList, ReplaceOutcome, UiPrefs, body_equals};
use crate::refresh_queue::RefreshQueue;
use crate::resolver::match_directory_entry_for_path;
use crate::runtime::SessionRuntimeState;
use crate::seq::{SeqDecision, SequenceTracker};
use crate::wire::{
    Bootstrap, DirectoryEntry, DirectorySessionPage, PatchBatch, PatchOp, SessionSummary,
    StreamMessage,
};
use crate::now_millis;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

pub const MIN_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 200;
/// How long a deleted session id shadows late upserts from reloads.
pub const SESSION_TOMBSTONE_TTL_MS: i64 = 10 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Root cap per directory page, clamped to `MIN_PAGE_SIZE..=MAX_PAGE_SIZE`.
    pub page_size: usize,
    pub refresh_queue_max_items: usize,
    pub persist_debounce_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: MIN_PAGE_SIZE,
            refresh_queue_max_items: crate::refresh_queue::DEFAULT_MAX_ITEMS,
            persist_debounce_ms: crate::persist::DEFAULT_PERSIST_DEBOUNCE_MS,
        }
    }
}

/// Which global indices should be reloaded from the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexRefresh {
    pub recent: bool,
    pub running: bool,
}

impl IndexRefresh {
    pub fn any(&self) -> bool {
        self.recent || self.running
    }
}

/// What happened to one patch batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub decision: SeqDecision,
    pub plan: RefreshPlan,
    /// The caller should fetch a bootstrap before trusting local state.
    pub needs_bootstrap: bool,
}

/// What happened to one background page load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageLoadOutcome {
    pub applied: bool,
    /// Set when the backend served a degraded page and wants a retry.
    pub retry_after_ms: Option<u64>,
}

pub struct SidebarEngine {
    config: EngineConfig,
    directories: Vec<DirectoryEntry>,
    /// Directory id -> page index -> cached page.
    pages: HashMap<String, BTreeMap<usize, DirectorySessionPage>>,
    /// Session id -> owning directory id.
    session_directory: HashMap<String, String>,
    runtime: HashMap<String, SessionRuntimeState>,
    recent: GlobalIndex,
    running: GlobalIndex,
    prefs: PreferencesStore,
    persist: PersistScheduler,
    seq: SequenceTracker,
    refresh_queue: RefreshQueue,
    /// Directories whose reload was evicted from the queue; reloaded when
    /// next shown.
    stale_directories: HashSet<String>,
    index_refresh: IndexRefresh,
    /// Session id -> deletion time.
    tombstones: HashMap<String, i64>,
    events: Arc<EventBus>,
    pending_events: EventBuffer,
    bootstrapped: bool,
}

impl SidebarEngine {
    pub fn new(config: EngineConfig) -> Self {
        let config = EngineConfig {
            page_size: config.page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE),
            ..config
        };
        Self {
            refresh_queue: RefreshQueue::new(config.refresh_queue_max_items),
            persist: PersistScheduler::new(config.persist_debounce_ms),
            config,
            directories: Vec::new(),
            pages: HashMap::new(),
            session_directory: HashMap::new(),
            runtime: HashMap::new(),
            recent: GlobalIndex::recent(),
            running: GlobalIndex::running(),
            prefs: PreferencesStore::default(),
            seq: SequenceTracker::new(),
            stale_directories: HashSet::new(),
            index_refresh: IndexRefresh::default(),
            tombstones: HashMap::new(),
            events: Arc::new(EventBus::new()),
            pending_events: EventBuffer::default(),
            bootstrapped: false,
        }
    }

    pub fn with_preferences(mut self, prefs: UiPrefs) -> Self {
        self.prefs = PreferencesStore::new(prefs);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // ==================== Bootstrap ====================

    pub fn apply_bootstrap(&mut self, bootstrap: Bootstrap) {
        self.apply_bootstrap_at(bootstrap, now_millis());
    }

    /// Replace all directory, page and runtime state with a snapshot.
    ///
    /// Preferences and tombstones survive; the recent and running indices are
    /// rebuilt from the snapshot and flagged for a backend reload.
    pub fn apply_bootstrap_at(&mut self, bootstrap: Bootstrap, now_ms: i64) {
        self.prune_tombstones(now_ms);
        let seq = self.seq.complete_bootstrap(bootstrap.seq);
        tracing::info!(
            "Applying bootstrap: {} directories at seq {}",
            bootstrap.directory_entries.len(),
            seq
        );

        self.directories = bootstrap.directory_entries;
        self.pages.clear();
        self.session_directory.clear();
        self.refresh_queue.clear();
        self.stale_directories.clear();

        for (directory_id, mut page) in bootstrap.session_summaries_by_directory_id {
            if !self.directories.iter().any(|d| d.id == directory_id) {
                tracing::debug!("Bootstrap page for unknown directory: {}", directory_id);
                continue;
            }
            page.sessions.retain(|s| !self.tombstones.contains_key(&s.id));
            self.install_page(&directory_id, page);
        }

        self.runtime = bootstrap.runtime_by_session_id.into_iter().collect();
        self.running.clear();
        let active: Vec<SessionRuntimeState> =
            self.runtime.values().filter(|r| r.is_active()).cloned().collect();
        for state in active {
            self.track_running(&state);
        }

        self.recent.clear();
        let summaries: Vec<SessionSummary> = self
            .pages
            .values()
            .flat_map(|pages| pages.values())
            .flat_map(|page| page.sessions.iter().cloned())
            .collect();
        for summary in &summaries {
            self.track_recent(summary);
        }
        self.recent.compact();
        self.running.compact();

        self.index_refresh = IndexRefresh {
            recent: true,
            running: true,
        };
        self.bootstrapped = true;
        self.pending_events.push(SidebarEvent::FullRefreshRequested);
        self.flush_events();
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    pub fn seq(&self) -> u64 {
        self.seq.current()
    }

    pub fn needs_bootstrap(&self) -> bool {
        !self.bootstrapped || self.seq.needs_bootstrap()
    }

    // ==================== Patch stream ====================

    pub fn apply_stream_message(&mut self, message: StreamMessage) -> Option<ApplyOutcome> {
        self.apply_stream_message_at(message, now_millis())
    }

    /// Returns `None` for a replay-gap frame, which only marks the stream out
    /// of sync.
    pub fn apply_stream_message_at(
        &mut self,
        message: StreamMessage,
        now_ms: i64,
    ) -> Option<ApplyOutcome> {
        match message {
            StreamMessage::Patch(batch) => Some(self.apply_batch_at(batch, now_ms)),
            StreamMessage::ReplayGap => {
                tracing::warn!("Backend reported a replay gap at seq {}", self.seq.current());
                self.seq.mark_out_of_sync();
                self.events.emit(SidebarEvent::ResyncRequired { reset: false });
                None
            }
        }
    }

    pub fn apply_batch(&mut self, batch: PatchBatch) -> ApplyOutcome {
        self.apply_batch_at(batch, now_millis())
    }

    pub fn apply_batch_at(&mut self, batch: PatchBatch, now_ms: i64) -> ApplyOutcome {
        let decision = self.seq.observe(batch.seq, batch.reset);
        match decision {
            SeqDecision::Stale => {
                return ApplyOutcome {
                    decision,
                    plan: RefreshPlan::default(),
                    needs_bootstrap: self.seq.needs_bootstrap(),
                };
            }
            SeqDecision::Reset => {
                // The ops belong to a timeline the next bootstrap will carry.
                self.events.emit(SidebarEvent::ResyncRequired { reset: true });
                return ApplyOutcome {
                    decision,
                    plan: RefreshPlan::default(),
                    needs_bootstrap: true,
                };
            }
            SeqDecision::Apply | SeqDecision::Gap => {}
        }

        // Plan against the pre-batch ownership mapping.
        let refresh = plan(
            &batch,
            &PlannerContext {
                directories: &self.directories,
                session_directory: &self.session_directory,
            },
        );

        for op in batch.ops {
            self.apply_op(op, now_ms);
        }
        self.recent.compact();
        self.running.compact();
        self.schedule_refresh(&refresh);

        if decision == SeqDecision::Gap {
            self.pending_events
                .push(SidebarEvent::ResyncRequired { reset: false });
        }
        self.flush_events();

        ApplyOutcome {
            decision,
            plan: refresh,
            needs_bootstrap: self.seq.needs_bootstrap(),
        }
    }

    fn apply_op(&mut self, op: PatchOp, now_ms: i64) {
        match op {
            PatchOp::DirectoryUpsert(entry) => self.upsert_directory(entry),
            PatchOp::DirectoryRemove { directory_id } => self.remove_directory(&directory_id),
            PatchOp::SessionUpsert(session) => {
                // An explicit upsert outranks an earlier delete.
                self.tombstones.remove(&session.id);
                self.upsert_session(session);
            }
            PatchOp::SessionRemove { session_id } => self.remove_session(&session_id, now_ms),
            PatchOp::RuntimeUpsert(state) => self.upsert_runtime(state, now_ms),
            PatchOp::RuntimeRemove { session_id } => self.remove_runtime(&session_id),
            PatchOp::PreferencesReplace(prefs) => {
                self.apply_remote_preferences(prefs);
            }
        }
    }

    fn schedule_refresh(&mut self, refresh: &RefreshPlan) {
        if refresh.refresh_all {
            tracing::info!("Refreshing all directories");
            self.pending_events.push(SidebarEvent::FullRefreshRequested);
            let loaded: Vec<String> = self
                .directories
                .iter()
                .filter(|d| self.pages.contains_key(&d.id))
                .map(|d| d.id.clone())
                .collect();
            for directory_id in loaded {
                self.enqueue_refresh(&directory_id);
            }
        } else {
            for directory_id in &refresh.directory_ids {
                if self.pages.contains_key(directory_id) {
                    self.enqueue_refresh(directory_id);
                }
            }
        }
        self.index_refresh.recent |= refresh.recent_index;
        self.index_refresh.running |= refresh.running_index;
    }

    // ==================== Directories ====================

    fn upsert_directory(&mut self, entry: DirectoryEntry) {
        match self.directories.iter_mut().find(|d| d.id == entry.id) {
            Some(existing) if *existing == entry => return,
            Some(existing) => *existing = entry.clone(),
            None => self.directories.push(entry.clone()),
        }
        self.pending_events.push(SidebarEvent::DirectoryChanged {
            directory_id: entry.id,
        });
    }

    fn remove_directory(&mut self, directory_id: &str) {
        let before = self.directories.len();
        self.directories.retain(|d| d.id != directory_id);
        if self.directories.len() == before {
            return;
        }
        self.pages.remove(directory_id);
        self.session_directory
            .retain(|_, owner| owner.as_str() != directory_id);
        self.stale_directories.remove(directory_id);
        self.pending_events.push(SidebarEvent::DirectoryChanged {
            directory_id: directory_id.to_string(),
        });
    }

    /// Reconcile against a complete directory listing: listed entries are
    /// upserted, unlisted ones removed.
    pub fn apply_directory_listing(&mut self, entries: Vec<DirectoryEntry>) {
        let listed: HashSet<String> = entries.iter().map(|e| e.id.clone()).collect();
        let removed: Vec<String> = self
            .directories
            .iter()
            .filter(|d| !listed.contains(&d.id))
            .map(|d| d.id.clone())
            .collect();
        for directory_id in &removed {
            self.remove_directory(directory_id);
        }
        for entry in entries {
            self.upsert_directory(entry);
        }
        self.flush_events();
    }

    pub fn directories(&self) -> &[DirectoryEntry] {
        &self.directories
    }

    pub fn directory(&self, directory_id: &str) -> Option<&DirectoryEntry> {
        self.directories.iter().find(|d| d.id == directory_id)
    }

    /// Resolve a free-form path to a configured directory.
    pub fn resolve_directory(&self, path: &str) -> Option<&DirectoryEntry> {
        match_directory_entry_for_path(&self.directories, path)
    }

    // ==================== Sessions ====================

    /// `previous` is the owner recorded before this upsert. A root already
    /// owned by `directory_id` is counted in `total_roots` even when no page
    /// caches it.
    fn upsert_options(
        &self,
        directory_id: &str,
        session_id: &str,
        previous: Option<&str>,
    ) -> UpsertOptions {
        let known = self
            .pages
            .get(directory_id)
            .is_some_and(|pages| pages.values().any(|p| p.contains(session_id)));
        UpsertOptions {
            increment_root_total: !known && previous != Some(directory_id),
            max_root_count: self.config.page_size,
        }
    }

    fn upsert_session(&mut self, session: SessionSummary) {
        let owner = self.resolve_directory(&session.directory).map(|d| d.id.clone());
        let previous = self.session_directory.get(&session.id).cloned();

        if let Some(previous) = previous.as_deref()
            && owner.as_deref() != Some(previous)
            && self.remove_from_pages(previous, &session.id)
        {
            self.pending_events.push(SidebarEvent::DirectoryChanged {
                directory_id: previous.to_string(),
            });
        }

        let Some(owner) = owner else {
            tracing::debug!(
                "Session {} is outside tracked directories: {}",
                session.id,
                session.directory
            );
            self.session_directory.remove(&session.id);
            return;
        };
        self.session_directory
            .insert(session.id.clone(), owner.clone());

        let opts = self.upsert_options(&owner, &session.id, previous.as_deref());
        let mut changed = false;
        if let Some(pages) = self.pages.get_mut(&owner) {
            let holders: Vec<usize> = pages
                .iter()
                .filter(|(_, page)| page.contains(&session.id))
                .map(|(index, _)| *index)
                .collect();
            let targets: Vec<usize> = if holders.is_empty() {
                pages.keys().copied().collect()
            } else {
                holders
            };
            for index in targets {
                if let Some(page) = pages.get_mut(&index) {
                    changed |= page.upsert(session.clone(), opts);
                }
            }
        }
        if changed {
            self.pending_events
                .push(SidebarEvent::DirectoryChanged { directory_id: owner });
        }

        self.track_recent(&session);
        if self.running.get(&session.id).is_some()
            && let Some(state) = self.runtime.get(&session.id).cloned()
        {
            self.track_running(&state);
        }
    }

    fn remove_from_pages(&mut self, directory_id: &str, session_id: &str) -> bool {
        let Some(pages) = self.pages.get_mut(directory_id) else {
            return false;
        };
        let mut changed = false;
        for page in pages.values_mut() {
            changed |= page.remove(session_id, true);
        }
        changed
    }

    fn remove_session(&mut self, session_id: &str, now_ms: i64) {
        self.tombstones.insert(session_id.to_string(), now_ms);

        let owners: Vec<String> = match self.session_directory.remove(session_id) {
            Some(owner) => vec![owner],
            None => self.pages.keys().cloned().collect(),
        };
        for owner in owners {
            if self.remove_from_pages(&owner, session_id) {
                self.pending_events
                    .push(SidebarEvent::DirectoryChanged { directory_id: owner });
            }
        }
        // Descendants pruned with the subtree lose their owner too.
        let cached: HashSet<&str> = self
            .pages
            .values()
            .flat_map(|pages| pages.values())
            .flat_map(|page| page.sessions.iter().map(|s| s.id.as_str()))
            .collect();
        let dropped: Vec<String> = self
            .session_directory
            .keys()
            .filter(|id| !cached.contains(id.as_str()))
            .cloned()
            .collect();
        for id in dropped {
            self.session_directory.remove(&id);
        }

        if self.recent.remove(session_id) {
            self.pending_events.push(SidebarEvent::RecentIndexChanged);
        }
        if self.running.remove(session_id) {
            self.pending_events.push(SidebarEvent::RunningIndexChanged);
        }
        if self.runtime.remove(session_id).is_some() {
            self.pending_events.push(SidebarEvent::RuntimeChanged {
                session_id: session_id.to_string(),
            });
        }
    }

    /// Upsert into the recent index when the session's directory resolves.
    fn track_recent(&mut self, session: &SessionSummary) {
        let Some(directory) = self.resolve_directory(&session.directory) else {
            return;
        };
        let patch = IndexPatch {
            session_id: session.id.clone(),
            directory_id: Some(directory.id.clone()),
            directory_path: Some(directory.path.clone()),
            runtime: None,
            now_ms: session.updated_at,
        };
        if self.recent.upsert(patch) {
            self.pending_events.push(SidebarEvent::RecentIndexChanged);
        }
    }

    /// Cached page `page` of a directory, if loaded.
    pub fn sessions_for_directory(&self, directory_id: &str, page: usize) -> Option<&DirectorySessionPage> {
        self.pages.get(directory_id)?.get(&page)
    }

    pub fn session(&self, session_id: &str) -> Option<&SessionSummary> {
        let owner = self.session_directory.get(session_id)?;
        self.pages
            .get(owner)?
            .values()
            .find_map(|page| page.get(session_id))
    }

    pub fn session_owner(&self, session_id: &str) -> Option<&str> {
        self.session_directory.get(session_id).map(String::as_str)
    }

    pub fn is_tombstoned(&self, session_id: &str) -> bool {
        self.tombstones.contains_key(session_id)
    }

    // ==================== Runtime ====================

    fn upsert_runtime(&mut self, mut state: SessionRuntimeState, now_ms: i64) {
        if let Some(existing) = self.runtime.get(&state.session_id)
            && existing.same_state(&state)
        {
            return;
        }
        if state.updated_at <= 0 {
            state.updated_at = now_ms;
        }
        let session_id = state.session_id.clone();
        self.runtime.insert(session_id.clone(), state.clone());
        self.pending_events
            .push(SidebarEvent::RuntimeChanged { session_id: session_id.clone() });

        if state.is_active() {
            self.track_running(&state);
        } else if self.running.remove(&session_id) {
            self.pending_events.push(SidebarEvent::RunningIndexChanged);
        }
    }

    fn remove_runtime(&mut self, session_id: &str) {
        if self.runtime.remove(session_id).is_some() {
            self.pending_events.push(SidebarEvent::RuntimeChanged {
                session_id: session_id.to_string(),
            });
        }
        if self.running.remove(session_id) {
            self.pending_events.push(SidebarEvent::RunningIndexChanged);
        }
    }

    fn track_running(&mut self, state: &SessionRuntimeState) {
        let directory = self
            .session_directory
            .get(&state.session_id)
            .and_then(|id| self.directory(id));
        let patch = IndexPatch {
            session_id: state.session_id.clone(),
            directory_id: directory.map(|d| d.id.clone()),
            directory_path: directory.map(|d| d.path.clone()),
            runtime: Some(state.clone()),
            now_ms: state.updated_at,
        };
        if self.running.upsert(patch) {
            self.pending_events.push(SidebarEvent::RunningIndexChanged);
        }
    }

    pub fn runtime(&self, session_id: &str) -> Option<&SessionRuntimeState> {
        self.runtime.get(session_id)
    }

    pub fn is_session_active(&self, session_id: &str) -> bool {
        self.runtime
            .get(session_id)
            .is_some_and(SessionRuntimeState::is_active)
    }

    pub fn needs_attention(&self, session_id: &str) -> bool {
        self.runtime
            .get(session_id)
            .is_some_and(SessionRuntimeState::needs_attention)
    }

    // ==================== Global indices ====================

    pub fn recent_page(&self, page: usize, limit: Option<usize>) -> Page<IndexEntry> {
        index_page(&self.recent, page, limit, RECENT_LIMIT)
    }

    pub fn running_page(&self, page: usize, limit: Option<usize>) -> Page<IndexEntry> {
        index_page(&self.running, page, limit, RUNNING_LIMIT)
    }

    /// Replace the recent index with a page loaded from the backend.
    pub fn apply_recent_index(&mut self, loaded: Page<IndexEntry>) {
        let items = self.without_tombstoned(loaded.items);
        self.recent.replace_all(items, loaded.total);
        self.recent.compact();
        self.pending_events.push(SidebarEvent::RecentIndexChanged);
        self.flush_events();
    }

    /// Replace the running index with a page loaded from the backend.
    pub fn apply_running_index(&mut self, loaded: Page<IndexEntry>) {
        let items = self.without_tombstoned(loaded.items);
        for entry in &items {
            let Some(state) = &entry.runtime else {
                continue;
            };
            let newer = self
                .runtime
                .get(&entry.session_id)
                .is_none_or(|known| state.updated_at >= known.updated_at);
            if newer {
                self.runtime.insert(entry.session_id.clone(), state.clone());
            }
        }
        self.running.replace_all(items, loaded.total);
        self.running.compact();
        self.pending_events.push(SidebarEvent::RunningIndexChanged);
        self.flush_events();
    }

    fn without_tombstoned(&self, mut items: Vec<IndexEntry>) -> Vec<IndexEntry> {
        items.retain(|e| !self.tombstones.contains_key(&e.session_id));
        items
    }

    /// Re-arm index reloads, e.g. after a failed fetch.
    pub fn request_index_refresh(&mut self, refresh: IndexRefresh) {
        self.index_refresh.recent |= refresh.recent;
        self.index_refresh.running |= refresh.running;
    }

    /// Take and clear the pending index reload flags.
    pub fn take_index_refresh(&mut self) -> IndexRefresh {
        std::mem::take(&mut self.index_refresh)
    }

    // ==================== Background reloads ====================

    /// Queue a background reload. Evicted work is remembered and retried
    /// when the directory is next shown.
    pub fn enqueue_refresh(&mut self, directory_id: &str) {
        let outcome = self.refresh_queue.enqueue(directory_id);
        if let Some(dropped) = outcome.dropped {
            tracing::debug!("Refresh evicted, deferring until visible: {}", dropped);
            self.stale_directories.insert(dropped);
        }
        if outcome.queued {
            self.stale_directories.remove(directory_id);
        }
    }

    pub fn next_refresh(&mut self) -> Option<String> {
        self.refresh_queue.shift()
    }

    pub fn pending_refreshes(&self) -> usize {
        self.refresh_queue.len()
    }

    pub fn is_directory_stale(&self, directory_id: &str) -> bool {
        self.stale_directories.contains(directory_id)
    }

    /// A surface is about to show `directory_id`; reload it if stale.
    pub fn mark_directory_visible(&mut self, directory_id: &str) -> bool {
        if self.stale_directories.contains(directory_id) {
            self.enqueue_refresh(directory_id);
            return true;
        }
        false
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Offsets of every cached page of a directory (always includes page 0).
    pub fn cached_pages(&self, directory_id: &str) -> Vec<usize> {
        let mut pages: Vec<usize> = self
            .pages
            .get(directory_id)
            .map(|pages| pages.keys().copied().collect())
            .unwrap_or_default();
        if pages.is_empty() {
            pages.push(0);
        }
        pages
    }

    pub fn apply_directory_page(
        &mut self,
        directory_id: &str,
        loaded: DirectorySessionPage,
    ) -> PageLoadOutcome {
        self.apply_directory_page_at(directory_id, loaded, now_millis())
    }

    /// Fold a background reload into the cache.
    ///
    /// A result for a directory removed in the meantime is discarded. Late
    /// copies of deleted sessions are filtered out by tombstone.
    pub fn apply_directory_page_at(
        &mut self,
        directory_id: &str,
        mut loaded: DirectorySessionPage,
        now_ms: i64,
    ) -> PageLoadOutcome {
        if self.directory(directory_id).is_none() {
            tracing::debug!("Discarding reload for removed directory: {}", directory_id);
            return PageLoadOutcome::default();
        }
        self.prune_tombstones(now_ms);
        loaded.sessions.retain(|s| !self.tombstones.contains_key(&s.id));

        let retry_after_ms = loaded
            .consistency
            .as_ref()
            .filter(|c| c.degraded)
            .map(|c| c.retry_after_ms.unwrap_or(0));
        if retry_after_ms.is_some() {
            tracing::info!("Backend served a degraded page for {}", directory_id);
        }

        let page_size = self.config.page_size;
        let index = loaded.page;
        let page = self
            .pages
            .entry(directory_id.to_string())
            .or_default()
            .entry(index)
            .or_insert_with(|| SessionPage::new(index, page_size));
        page.merge_loaded(loaded, page_size);
        let sessions: Vec<SessionSummary> = page.sessions.clone();

        for session in &sessions {
            self.session_directory
                .insert(session.id.clone(), directory_id.to_string());
            self.track_recent(session);
        }
        self.recent.compact();

        self.pending_events.push(SidebarEvent::DirectoryChanged {
            directory_id: directory_id.to_string(),
        });
        self.flush_events();
        PageLoadOutcome {
            applied: true,
            retry_after_ms,
        }
    }

    fn install_page(&mut self, directory_id: &str, page: DirectorySessionPage) {
        for session in &page.sessions {
            self.session_directory
                .insert(session.id.clone(), directory_id.to_string());
        }
        let page_size = self.config.page_size;
        let mut installed = SessionPage::new(page.page, page_size);
        installed.merge_loaded(page, page_size);
        self.pages
            .entry(directory_id.to_string())
            .or_default()
            .insert(installed.page, installed);
    }

    // ==================== Preferences ====================

    pub fn preferences(&self) -> &UiPrefs {
        self.prefs.current()
    }

    /// Adopt preferences from another writer if strictly newer.
    pub fn apply_remote_preferences(&mut self, prefs: UiPrefs) -> ReplaceOutcome {
        let outcome = self.prefs.replace(prefs);
        if outcome == ReplaceOutcome::Applied {
            // A pending local write is based on what was just replaced.
            self.persist.cancel();
            let current = self.prefs.current();
            self.pending_events.push(SidebarEvent::PreferencesChanged {
                version: current.version,
                updated_at: current.updated_at,
            });
            self.flush_events();
        }
        outcome
    }

    /// The backend stored `written` as `stored`. Local edits made while the
    /// write was in flight stay pending on top of the new version.
    pub fn acknowledge_persisted(&mut self, written: &UiPrefs, stored: UiPrefs) {
        if body_equals(self.prefs.current(), written) {
            self.apply_remote_preferences(stored);
            return;
        }
        self.prefs.rebase(stored.version);
        if let Some(pending) = self.persist.flush() {
            let now_ms = pending.updated_at;
            let rebased = UiPrefs {
                version: self.prefs.current().version,
                ..pending
            };
            self.persist.schedule(rebased, now_ms);
        }
    }

    pub fn toggle_pin(&mut self, session_id: &str) -> bool {
        self.toggle_pin_at(session_id, now_millis() as u64)
    }

    pub fn toggle_pin_at(&mut self, session_id: &str, now_ms: u64) -> bool {
        let before = self.prefs.current().clone();
        let pinned = self.prefs.toggle_pin(session_id, now_ms);
        if *self.prefs.current() != before {
            self.local_preferences_changed(now_ms);
        }
        pinned
    }

    pub fn set_collapsed(&mut self, directory_id: &str, collapsed: bool) -> bool {
        self.set_collapsed_at(directory_id, collapsed, now_millis() as u64)
    }

    pub fn set_collapsed_at(&mut self, directory_id: &str, collapsed: bool, now_ms: u64) -> bool {
        let changed = self.prefs.set_collapsed(directory_id, collapsed, now_ms);
        if changed {
            self.local_preferences_changed(now_ms);
        }
        changed
    }

    pub fn set_expanded(&mut self, session_id: &str, expanded: bool) -> bool {
        self.set_expanded_at(session_id, expanded, now_millis() as u64)
    }

    pub fn set_expanded_at(&mut self, session_id: &str, expanded: bool, now_ms: u64) -> bool {
        let changed = self.prefs.set_expanded(session_id, expanded, now_ms);
        if changed {
            self.local_preferences_changed(now_ms);
        }
        changed
    }

    pub fn set_page(&mut self, list: &PrefsList, page: usize) -> bool {
        self.set_page_at(list, page, now_millis() as u64)
    }

    pub fn set_page_at(&mut self, list: &PrefsList, page: usize, now_ms: u64) -> bool {
        let changed = self.prefs.set_page(list, page, now_ms);
        if changed {
            self.local_preferences_changed(now_ms);
        }
        changed
    }

    pub fn set_open(&mut self, list: &PrefsList, open: bool) -> bool {
        self.set_open_at(list, open, now_millis() as u64)
    }

    pub fn set_open_at(&mut self, list: &PrefsList, open: bool, now_ms: u64) -> bool {
        let changed = self.prefs.set_open(list, open, now_ms);
        if changed {
            self.local_preferences_changed(now_ms);
        }
        changed
    }

    fn local_preferences_changed(&mut self, now_ms: u64) {
        let current = self.prefs.current().clone();
        self.events.emit(SidebarEvent::PreferencesChanged {
            version: current.version,
            updated_at: current.updated_at,
        });
        self.persist.schedule(current, now_ms);
    }

    pub fn next_persist_deadline(&self) -> Option<u64> {
        self.persist.next_deadline()
    }

    /// Preferences whose debounce has elapsed and should be written.
    pub fn take_due_persist(&mut self, now_ms: u64) -> Option<UiPrefs> {
        self.persist.take_due(now_ms)
    }

    pub fn flush_persist(&mut self) -> Option<UiPrefs> {
        self.persist.flush()
    }

    // ==================== Maintenance ====================

    fn prune_tombstones(&mut self, now_ms: i64) {
        let cutoff = now_ms.saturating_sub(SESSION_TOMBSTONE_TTL_MS);
        self.tombstones.retain(|_, deleted_at| *deleted_at >= cutoff);
    }

    /// Drop expired tombstones and idle runtime entries older than
    /// `max_idle_age_ms`. A zero age keeps runtime entries.
    pub fn prune_at(&mut self, now_ms: i64, max_idle_age_ms: i64) {
        self.prune_tombstones(now_ms);
        if max_idle_age_ms <= 0 {
            return;
        }
        let cutoff = now_ms.saturating_sub(max_idle_age_ms);
        self.runtime
            .retain(|_, state| state.is_active() || state.updated_at >= cutoff);
    }

    fn flush_events(&mut self) {
        self.events.flush(&mut self.pending_events);
    }
}

fn index_page(index: &GlobalIndex, page: usize, limit: Option<usize>, range: LimitRange) -> Page<IndexEntry> {
    let limit = clamp_limit(limit, range);
    index.page(page.saturating_mul(limit), limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global_index::RUNNING_INDEX_CAP;
    use crate::runtime::{Attention, RuntimeStatus};
    use crate::wire::RefreshHint;
    use std::sync::Mutex;

    fn session(id: &str, directory: &str, parent: Option<&str>, updated_at: i64) -> SessionSummary {
        SessionSummary {
            id: id.into(),
            directory: directory.into(),
            parent_id: parent.map(str::to_string),
            title: id.into(),
            slug: None,
            updated_at,
        }
    }

    fn busy(id: &str, updated_at: i64) -> SessionRuntimeState {
        SessionRuntimeState {
            status: RuntimeStatus::Busy,
            updated_at,
            ..SessionRuntimeState::idle(id)
        }
    }

    fn batch(seq: u64, ops: Vec<PatchOp>) -> PatchBatch {
        PatchBatch {
            seq,
            ops,
            ..PatchBatch::default()
        }
    }

    fn engine() -> SidebarEngine {
        let mut engine = SidebarEngine::new(EngineConfig::default());
        let mut page = SessionPage::new(0, 10);
        page.sessions = vec![session("r1", "/repo", None, 10)];
        page.total_roots = 1;
        engine.apply_bootstrap_at(
            Bootstrap {
                directory_entries: vec![
                    DirectoryEntry::new("a", "/repo"),
                    DirectoryEntry::new("b", "/repo/sub"),
                ],
                session_summaries_by_directory_id: BTreeMap::from([
                    ("a".to_string(), page),
                    ("b".to_string(), SessionPage::new(0, 10)),
                ]),
                runtime_by_session_id: BTreeMap::new(),
                seq: Some(5),
            },
            1_000,
        );
        engine.take_index_refresh();
        engine
    }

    #[test]
    fn test_bootstrap_builds_state() {
        let engine = engine();
        assert_eq!(engine.seq(), 5);
        assert!(!engine.needs_bootstrap());
        assert_eq!(engine.session_owner("r1"), Some("a"));
        assert_eq!(engine.recent_page(0, None).items.len(), 1);
        assert_eq!(engine.page_size(), MIN_PAGE_SIZE);
    }

    #[test]
    fn test_bootstrap_seeds_runtime() {
        let mut engine = SidebarEngine::new(EngineConfig::default());
        engine.apply_bootstrap_at(
            Bootstrap {
                directory_entries: vec![DirectoryEntry::new("a", "/repo")],
                runtime_by_session_id: BTreeMap::from([
                    ("r1".to_string(), busy("r1", 40)),
                    ("r2".to_string(), SessionRuntimeState::idle("r2")),
                ]),
                seq: Some(2),
                ..Bootstrap::default()
            },
            1_000,
        );
        assert!(engine.is_session_active("r1"));
        assert!(engine.runtime("r2").is_some());
        let running = engine.running_page(0, None);
        assert_eq!(running.items.len(), 1);
        assert_eq!(running.items[0].session_id, "r1");
    }

    #[test]
    fn test_page_size_clamped() {
        let engine = SidebarEngine::new(EngineConfig {
            page_size: 5000,
            ..EngineConfig::default()
        });
        assert_eq!(engine.page_size(), MAX_PAGE_SIZE);
    }

    #[test]
    fn test_session_upsert_lands_in_owner_page() {
        let mut engine = engine();
        let outcome = engine.apply_batch_at(
            batch(6, vec![PatchOp::SessionUpsert(session("s2", "/repo/sub/pkg", None, 20))]),
            2_000,
        );
        assert_eq!(outcome.decision, SeqDecision::Apply);
        assert!(outcome.plan.directory_ids.contains("b"));
        let page = engine.sessions_for_directory("b", 0).unwrap();
        assert!(page.contains("s2"));
        assert_eq!(page.total_roots, 1);
        assert_eq!(engine.pending_refreshes(), 1);
    }

    #[test]
    fn test_session_moves_between_directories() {
        let mut engine = engine();
        engine.apply_batch_at(
            batch(6, vec![PatchOp::SessionUpsert(session("r1", "/repo/sub", None, 30))]),
            2_000,
        );
        assert!(!engine.sessions_for_directory("a", 0).unwrap().contains("r1"));
        assert!(engine.sessions_for_directory("b", 0).unwrap().contains("r1"));
        assert_eq!(engine.session_owner("r1"), Some("b"));
    }

    #[test]
    fn test_stale_batch_ignored() {
        let mut engine = engine();
        let outcome = engine.apply_batch_at(
            batch(5, vec![PatchOp::SessionRemove { session_id: "r1".into() }]),
            2_000,
        );
        assert_eq!(outcome.decision, SeqDecision::Stale);
        assert!(engine.session("r1").is_some());
    }

    #[test]
    fn test_gap_applies_and_requests_bootstrap() {
        let mut engine = engine();
        let outcome = engine.apply_batch_at(
            batch(9, vec![PatchOp::SessionRemove { session_id: "r1".into() }]),
            2_000,
        );
        assert_eq!(outcome.decision, SeqDecision::Gap);
        assert!(outcome.needs_bootstrap);
        assert!(engine.session("r1").is_none());
    }

    #[test]
    fn test_reset_skips_ops_and_bootstrap_adopts_smaller_seq() {
        let mut engine = engine();
        let mut reset = batch(2, vec![PatchOp::SessionRemove { session_id: "r1".into() }]);
        reset.reset = true;
        let outcome = engine.apply_batch_at(reset, 2_000);
        assert_eq!(outcome.decision, SeqDecision::Reset);
        assert!(engine.session("r1").is_some());
        assert!(engine.needs_bootstrap());

        engine.apply_bootstrap_at(
            Bootstrap {
                directory_entries: vec![DirectoryEntry::new("a", "/repo")],
                seq: Some(2),
                ..Bootstrap::default()
            },
            3_000,
        );
        assert_eq!(engine.seq(), 2);
        assert!(!engine.needs_bootstrap());
    }

    #[test]
    fn test_runtime_fast_path_and_running_index() {
        let mut engine = engine();
        let outcome = engine.apply_batch_at(batch(6, vec![PatchOp::RuntimeUpsert(busy("r1", 50))]), 2_000);
        assert!(outcome.plan.is_quiet());
        assert_eq!(engine.pending_refreshes(), 0);
        assert!(engine.is_session_active("r1"));

        let running = engine.running_page(0, None);
        assert_eq!(running.items.len(), 1);
        assert_eq!(running.items[0].directory_id.as_deref(), Some("a"));

        engine.apply_batch_at(
            batch(7, vec![PatchOp::RuntimeUpsert(SessionRuntimeState::idle("r1"))]),
            3_000,
        );
        assert!(!engine.is_session_active("r1"));
        assert!(engine.running_page(0, None).items.is_empty());
    }

    #[test]
    fn test_identical_runtime_does_not_bump() {
        let mut engine = engine();
        engine.apply_batch_at(batch(6, vec![PatchOp::RuntimeUpsert(busy("r1", 50))]), 2_000);
        engine.apply_batch_at(batch(7, vec![PatchOp::RuntimeUpsert(busy("r1", 90))]), 3_000);
        assert_eq!(engine.runtime("r1").unwrap().updated_at, 50);
    }

    #[test]
    fn test_attention_flag() {
        let mut engine = engine();
        let state = SessionRuntimeState {
            attention: Some(Attention::Permission),
            ..SessionRuntimeState::idle("r1")
        };
        engine.apply_batch_at(batch(6, vec![PatchOp::RuntimeUpsert(state)]), 2_000);
        assert!(engine.needs_attention("r1"));
        assert!(engine.is_session_active("r1"));
    }

    #[test]
    fn test_summary_bump_reorders_recent_index() {
        let mut engine = engine();
        engine.apply_batch_at(
            batch(6, vec![PatchOp::SessionUpsert(session("r2", "/repo", None, 20))]),
            2_000,
        );
        assert_eq!(engine.recent_page(0, None).items[0].session_id, "r2");

        engine.apply_batch_at(
            batch(7, vec![PatchOp::SessionUpsert(session("r1", "/repo", None, 99))]),
            3_000,
        );
        let order: Vec<String> = engine
            .recent_page(0, None)
            .items
            .into_iter()
            .map(|e| e.session_id)
            .collect();
        assert_eq!(order, vec!["r1", "r2"]);
    }

    #[test]
    fn test_tombstone_blocks_late_reload() {
        let mut engine = engine();
        engine.apply_batch_at(batch(6, vec![PatchOp::SessionRemove { session_id: "r1".into() }]), 2_000);
        assert!(engine.is_tombstoned("r1"));

        let mut stale = SessionPage::new(0, 10);
        stale.sessions = vec![session("r1", "/repo", None, 10)];
        stale.total_roots = 1;
        engine.apply_directory_page_at("a", stale, 2_500);
        assert!(!engine.sessions_for_directory("a", 0).unwrap().contains("r1"));

        engine.apply_batch_at(
            batch(7, vec![PatchOp::SessionUpsert(session("r1", "/repo", None, 11))]),
            3_000,
        );
        assert!(!engine.is_tombstoned("r1"));
        assert!(engine.sessions_for_directory("a", 0).unwrap().contains("r1"));
    }

    #[test]
    fn test_tombstones_expire() {
        let mut engine = engine();
        engine.apply_batch_at(batch(6, vec![PatchOp::SessionRemove { session_id: "r1".into() }]), 2_000);
        engine.prune_at(2_000 + SESSION_TOMBSTONE_TTL_MS + 1, 0);
        assert!(!engine.is_tombstoned("r1"));
    }

    #[test]
    fn test_prune_drops_only_old_idle_runtime() {
        let mut engine = engine();
        engine.apply_batch_at(
            batch(
                6,
                vec![
                    PatchOp::RuntimeUpsert(SessionRuntimeState {
                        updated_at: 100,
                        phase: crate::runtime::RuntimePhase::Idle,
                        ..SessionRuntimeState::idle("old-idle")
                    }),
                    PatchOp::RuntimeUpsert(busy("old-busy", 100)),
                    PatchOp::RuntimeUpsert(SessionRuntimeState {
                        updated_at: 100_000,
                        ..SessionRuntimeState::idle("fresh-idle")
                    }),
                ],
            ),
            2_000,
        );
        engine.prune_at(120_000, 30_000);
        assert!(engine.runtime("old-idle").is_none());
        assert!(engine.runtime("old-busy").is_some());
        assert!(engine.runtime("fresh-idle").is_some());
    }

    #[test]
    fn test_directory_remove_discards_late_reload() {
        let mut engine = engine();
        let outcome = engine.apply_batch_at(
            batch(6, vec![PatchOp::DirectoryRemove { directory_id: "a".into() }]),
            2_000,
        );
        assert!(outcome.plan.refresh_all);
        assert!(engine.sessions_for_directory("a", 0).is_none());

        let applied = engine.apply_directory_page_at("a", SessionPage::new(0, 10), 2_100);
        assert!(!applied.applied);
    }

    #[test]
    fn test_hint_drives_refresh() {
        let mut engine = engine();
        let mut hinted = batch(6, vec![PatchOp::SessionUpsert(session("x", "/elsewhere", None, 1))]);
        hinted.hint = Some(RefreshHint {
            refresh_directory_ids: vec!["a".into()],
            refresh_running_index: true,
            ..RefreshHint::default()
        });
        engine.apply_batch_at(hinted, 2_000);
        assert_eq!(engine.next_refresh().as_deref(), Some("a"));
        assert_eq!(
            engine.take_index_refresh(),
            IndexRefresh {
                recent: false,
                running: true
            }
        );
    }

    #[test]
    fn test_evicted_refresh_retried_on_visibility() {
        let mut engine = SidebarEngine::new(EngineConfig {
            refresh_queue_max_items: 1,
            ..EngineConfig::default()
        });
        engine.apply_bootstrap_at(
            Bootstrap {
                directory_entries: vec![DirectoryEntry::new("a", "/a"), DirectoryEntry::new("b", "/b")],
                session_summaries_by_directory_id: BTreeMap::from([
                    ("a".to_string(), SessionPage::new(0, 10)),
                    ("b".to_string(), SessionPage::new(0, 10)),
                ]),
                ..Bootstrap::default()
            },
            0,
        );
        engine.enqueue_refresh("a");
        engine.enqueue_refresh("b");
        assert!(engine.is_directory_stale("a"));
        assert_eq!(engine.next_refresh().as_deref(), Some("b"));

        assert!(engine.mark_directory_visible("a"));
        assert!(!engine.is_directory_stale("a"));
        assert_eq!(engine.next_refresh().as_deref(), Some("a"));
    }

    #[test]
    fn test_degraded_reload_reports_retry() {
        let mut engine = engine();
        let mut page = SessionPage::new(0, 10);
        page.consistency = Some(crate::page_state::PageConsistency {
            degraded: true,
            retry_after_ms: Some(180),
        });
        let outcome = engine.apply_directory_page_at("a", page, 2_000);
        assert_eq!(outcome.retry_after_ms, Some(180));
        assert!(engine.sessions_for_directory("a", 0).unwrap().contains("r1"));
    }

    #[test]
    fn test_local_pin_schedules_persist_and_emits() {
        let mut engine = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = engine
            .events()
            .subscribe(move |event| sink.lock().unwrap().push(event.clone()));

        assert!(engine.toggle_pin_at("r1", 5_000));
        assert!(engine.preferences().is_pinned("r1"));
        assert_eq!(engine.next_persist_deadline(), Some(5_400));
        assert!(engine.take_due_persist(5_399).is_none());
        let due = engine.take_due_persist(5_400).unwrap();
        assert!(due.is_pinned("r1"));
        assert!(matches!(
            seen.lock().unwrap().as_slice(),
            [SidebarEvent::PreferencesChanged { .. }]
        ));
    }

    #[test]
    fn test_remote_preferences_follow_recency() {
        let mut engine = SidebarEngine::new(EngineConfig::default()).with_preferences(UiPrefs {
            version: 2,
            ..UiPrefs::default()
        });
        let older = UiPrefs {
            version: 1,
            updated_at: 100,
            pinned_session_ids: vec!["x".into()],
            ..UiPrefs::default()
        };
        engine.apply_batch_at(batch(1, vec![PatchOp::PreferencesReplace(older)]), 0);
        assert!(!engine.preferences().is_pinned("x"));

        let newer = UiPrefs {
            version: 3,
            pinned_session_ids: vec!["x".into()],
            ..UiPrefs::default()
        };
        assert_eq!(engine.apply_remote_preferences(newer), ReplaceOutcome::Applied);
        assert!(engine.preferences().is_pinned("x"));
    }

    #[test]
    fn test_replay_gap_marks_out_of_sync() {
        let mut engine = engine();
        assert!(engine.apply_stream_message_at(StreamMessage::ReplayGap, 0).is_none());
        assert!(engine.needs_bootstrap());
        engine.apply_bootstrap_at(
            Bootstrap {
                seq: Some(3),
                ..Bootstrap::default()
            },
            0,
        );
        assert_eq!(engine.seq(), 5);
    }

    #[test]
    fn test_known_root_reinserted_without_recount() {
        let mut engine = engine();
        let roots: Vec<PatchOp> = (2..=10)
            .map(|i| PatchOp::SessionUpsert(session(&format!("r{i}"), "/repo", None, i * 10)))
            .collect();
        engine.apply_batch_at(batch(6, roots), 2_000);
        assert_eq!(engine.sessions_for_directory("a", 0).unwrap().total_roots, 10);

        // Brand-new but older than every cached root: counted, then trimmed.
        engine.apply_batch_at(
            batch(7, vec![PatchOp::SessionUpsert(session("old", "/repo", None, 1))]),
            2_000,
        );
        let page = engine.sessions_for_directory("a", 0).unwrap();
        assert!(!page.contains("old"));
        assert_eq!(page.total_roots, 11);
        assert_eq!(engine.session_owner("old"), Some("a"));

        // Bumped back into page 0: already counted.
        engine.apply_batch_at(
            batch(8, vec![PatchOp::SessionUpsert(session("old", "/repo", None, 500))]),
            2_000,
        );
        let page = engine.sessions_for_directory("a", 0).unwrap();
        assert!(page.contains("old"));
        assert!(!page.contains("r1"));
        assert_eq!(page.root_count(), 10);
        assert_eq!(page.total_roots, 11);
    }

    #[test]
    fn test_running_index_bounded() {
        let mut engine = engine();
        let first: Vec<PatchOp> = (0..300)
            .map(|i| PatchOp::RuntimeUpsert(busy(&format!("s{i:03}"), 1_000 + i)))
            .collect();
        engine.apply_batch_at(batch(6, first), 2_000);
        assert_eq!(engine.running.visible().len(), 300);

        let second: Vec<PatchOp> = (300..450)
            .map(|i| PatchOp::RuntimeUpsert(busy(&format!("s{i:03}"), 1_000 + i)))
            .collect();
        engine.apply_batch_at(batch(7, second), 3_000);

        assert!(engine.running.len() <= RUNNING_INDEX_CAP);
        assert_eq!(engine.running.visible().len(), RUNNING_INDEX_CAP);
        let page = engine.running_page(0, Some(1_000));
        assert_eq!(page.items.len(), RUNNING_INDEX_CAP);
        assert_eq!(page.items[0].session_id, "s449");
        assert_eq!(page.items[RUNNING_INDEX_CAP - 1].session_id, "s050");
        assert!(engine.running.get("s049").is_none());
        assert!(engine.running_page(1, Some(400)).items.is_empty());
    }
}
