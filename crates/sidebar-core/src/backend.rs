//! Backend collaborator abstraction.
//!
//! Implementations:
//! - `InMemoryBackend` - For testing
//! - `HttpBackend` (in sidebar-daemon) - Uses reqwest against the sidebar HTTP API

use crate::global_index::IndexEntry;
use crate::page_state::{PageItem, SessionPage};
use crate::paging::{Page, page};
use crate::preferences::UiPrefs;
use crate::resolver::match_directory_entry_for_path;
use crate::runtime::SessionRuntimeState;
use crate::wire::{Bootstrap, DirectoryEntry, DirectorySessionPage, SessionSummary, WireError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// The stored preferences moved on; `current` is what the backend holds.
    #[error("Preferences version conflict")]
    Conflict { current: Option<Box<UiPrefs>> },

    #[error("Preferences write requires If-Match")]
    PreconditionRequired,

    #[error("Decode error: {0}")]
    Wire(#[from] WireError),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Everything the engine needs from the backend authority.
#[async_trait]
pub trait SidebarBackend: Send + Sync {
    /// Full snapshot for startup and resync.
    async fn bootstrap(&self) -> Result<Bootstrap>;

    async fn directories(&self, offset: usize, limit: usize) -> Result<Page<DirectoryEntry>>;

    /// One page of root sessions (with their descendants) for a directory.
    async fn directory_sessions(
        &self,
        directory_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<DirectorySessionPage>;

    async fn recent_index(&self, offset: usize, limit: usize) -> Result<Page<IndexEntry>>;

    async fn running_index(&self, offset: usize, limit: usize) -> Result<Page<IndexEntry>>;

    async fn get_preferences(&self) -> Result<UiPrefs>;

    /// Conditional write. Returns the stored value with its new version.
    async fn put_preferences(&self, expected_version: u64, prefs: &UiPrefs) -> Result<UiPrefs>;
}

#[derive(Default)]
struct MemoryState {
    directories: Vec<DirectoryEntry>,
    sessions: Vec<SessionSummary>,
    runtime: BTreeMap<String, SessionRuntimeState>,
    recent: Vec<IndexEntry>,
    running: Vec<IndexEntry>,
    prefs: UiPrefs,
    seq: u64,
    failing: HashSet<String>,
}

/// In-memory backend for testing.
#[derive(Default)]
pub struct InMemoryBackend {
    state: RwLock<MemoryState>,
    page_size: usize,
    session_loads: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            ..Self::default()
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_directory(&self, entry: DirectoryEntry) {
        let mut state = self.write();
        state.directories.retain(|d| d.id != entry.id);
        state.directories.push(entry);
    }

    pub fn upsert_session(&self, session: SessionSummary) {
        let mut state = self.write();
        state.sessions.retain(|s| s.id != session.id);
        state.sessions.push(session);
    }

    pub fn remove_session(&self, session_id: &str) {
        self.write().sessions.retain(|s| s.id != session_id);
    }

    pub fn set_runtime(&self, runtime: SessionRuntimeState) {
        self.write()
            .runtime
            .insert(runtime.session_id.clone(), runtime);
    }

    pub fn set_recent(&self, entries: Vec<IndexEntry>) {
        self.write().recent = entries;
    }

    pub fn set_running(&self, entries: Vec<IndexEntry>) {
        self.write().running = entries;
    }

    pub fn set_preferences(&self, prefs: UiPrefs) {
        self.write().prefs = prefs;
    }

    pub fn preferences(&self) -> UiPrefs {
        self.read().prefs.clone()
    }

    pub fn set_seq(&self, seq: u64) {
        self.write().seq = seq;
    }

    /// Make reloads of `directory_id` fail with a network error.
    pub fn fail_directory(&self, directory_id: &str) {
        self.write().failing.insert(directory_id.to_string());
    }

    /// Number of `directory_sessions` calls served so far.
    pub fn session_loads(&self) -> usize {
        self.session_loads.load(Ordering::Relaxed)
    }

    fn page_for(
        &self,
        state: &MemoryState,
        directory_id: &str,
        offset: usize,
        limit: usize,
    ) -> Option<DirectorySessionPage> {
        let directory = state.directories.iter().find(|d| d.id == directory_id)?;
        let owned: Vec<&SessionSummary> = state
            .sessions
            .iter()
            .filter(|s| {
                match_directory_entry_for_path(&state.directories, &s.directory)
                    .is_some_and(|owner| owner.id == directory.id)
            })
            .collect();

        let mut roots: Vec<&SessionSummary> = owned.iter().copied().filter(|s| s.is_root()).collect();
        roots.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        let total_roots = roots.len();
        let limit = limit.max(1);
        let selected: Vec<&SessionSummary> = roots.into_iter().skip(offset).take(limit).collect();

        let mut sessions: Vec<SessionSummary> = selected.iter().map(|s| (*s).clone()).collect();
        let mut frontier: HashSet<String> = selected.iter().map(|s| s.id.clone()).collect();
        while !frontier.is_empty() {
            let children: Vec<&SessionSummary> = owned
                .iter()
                .copied()
                .filter(|s| s.parent_id().is_some_and(|p| frontier.contains(p)))
                .filter(|s| !sessions.iter().any(|known| known.id == s.id))
                .collect();
            frontier = children.iter().map(|s| s.id.clone()).collect();
            sessions.extend(children.into_iter().cloned());
        }

        Some(SessionPage {
            page: offset / limit,
            offset,
            limit,
            total_roots,
            sessions,
            consistency: None,
            tree_hint: None,
        })
    }
}

#[async_trait]
impl SidebarBackend for InMemoryBackend {
    async fn bootstrap(&self) -> Result<Bootstrap> {
        let state = self.read();
        let limit = self.page_size.max(1);
        let session_summaries_by_directory_id = state
            .directories
            .iter()
            .filter_map(|d| {
                self.page_for(&state, &d.id, 0, limit)
                    .map(|page| (d.id.clone(), page))
            })
            .collect();
        Ok(Bootstrap {
            directory_entries: state.directories.clone(),
            session_summaries_by_directory_id,
            runtime_by_session_id: state.runtime.clone(),
            seq: Some(state.seq),
        })
    }

    async fn directories(&self, offset: usize, limit: usize) -> Result<Page<DirectoryEntry>> {
        Ok(page(&self.read().directories, offset, limit))
    }

    async fn directory_sessions(
        &self,
        directory_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<DirectorySessionPage> {
        self.session_loads.fetch_add(1, Ordering::Relaxed);
        let state = self.read();
        if state.failing.contains(directory_id) {
            return Err(BackendError::Network(format!("reload of {directory_id} failed")));
        }
        self.page_for(&state, directory_id, offset, limit)
            .ok_or_else(|| BackendError::NotFound(directory_id.to_string()))
    }

    async fn recent_index(&self, offset: usize, limit: usize) -> Result<Page<IndexEntry>> {
        Ok(page(&self.read().recent, offset, limit))
    }

    async fn running_index(&self, offset: usize, limit: usize) -> Result<Page<IndexEntry>> {
        Ok(page(&self.read().running, offset, limit))
    }

    async fn get_preferences(&self) -> Result<UiPrefs> {
        Ok(self.read().prefs.clone())
    }

    async fn put_preferences(&self, expected_version: u64, prefs: &UiPrefs) -> Result<UiPrefs> {
        let mut state = self.write();
        if state.prefs.version != expected_version {
            return Err(BackendError::Conflict {
                current: Some(Box::new(state.prefs.clone())),
            });
        }
        let mut stored = prefs.clone().sanitized();
        stored.version = state.prefs.version + 1;
        stored.updated_at = stored.updated_at.max(state.prefs.updated_at);
        state.prefs = stored.clone();
        Ok(stored)
    }
}
