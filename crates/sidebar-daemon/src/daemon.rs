//! Daemon state: the engine plus everything that feeds it.

use crate::config::Config;
use crate::persistence::PrefsStorage;
use crate::stream::{StreamEvent, StreamSource};
use anyhow::Result;
use serde_json::{Value, json};
use sidebar_core::worker::{
    bootstrap, drain_refreshes, persist_preferences, refresh_indices, reload_directories,
};
use sidebar_core::{
    PatchOp, ReplaceOutcome, SidebarBackend, SidebarEngine, StreamMessage, Subscription, now_millis,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Daemon<B: SidebarBackend> {
    engine: SidebarEngine,
    backend: Arc<B>,
    storage: PrefsStorage,
    config: Config,
    /// Directory id -> when to retry a degraded reload (ms since epoch).
    retries: BTreeMap<String, i64>,
    _events: Subscription,
}

impl<B: SidebarBackend> Daemon<B> {
    /// Create the daemon, seeding preferences from the local cache.
    pub fn new(config: Config, backend: Arc<B>, storage: PrefsStorage) -> Self {
        let cached = storage.load().unwrap_or_default();
        let engine = SidebarEngine::new(config.engine_config()).with_preferences(cached);
        let _events = engine.events().subscribe(|event| {
            if let Ok(json) = serde_json::to_string(event) {
                debug!("Sidebar event: {}", json);
            }
        });
        Self {
            engine,
            backend,
            storage,
            config,
            retries: BTreeMap::new(),
            _events,
        }
    }

    pub fn engine(&self) -> &SidebarEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SidebarEngine {
        &mut self.engine
    }

    /// Initial sync: snapshot, preferences, global indices.
    pub async fn start(&mut self) -> Result<()> {
        self.resync().await?;
        self.sync_preferences().await;
        Ok(())
    }

    /// Replace local state with a fresh snapshot.
    pub async fn resync(&mut self) -> Result<()> {
        bootstrap(&mut self.engine, self.backend.as_ref()).await?;
        self.retries.clear();
        info!(
            "Bootstrapped {} director(ies) at seq {}",
            self.engine.directories().len(),
            self.engine.seq()
        );
        refresh_indices(&mut self.engine, self.backend.as_ref()).await;
        Ok(())
    }

    /// Re-read preferences from the backend and adopt them if newer.
    pub async fn sync_preferences(&mut self) {
        match self.backend.get_preferences().await {
            Ok(remote) => self.adopt_preferences(remote),
            Err(e) => warn!("Failed to read preferences: {}", e),
        }
    }

    fn adopt_preferences(&mut self, prefs: sidebar_core::UiPrefs) {
        if self.engine.apply_remote_preferences(prefs) == ReplaceOutcome::Applied {
            self.save_local();
        }
    }

    fn save_local(&self) {
        if let Err(e) = self.storage.save(self.engine.preferences()) {
            warn!("Failed to cache preferences: {:#}", e);
        }
    }

    pub async fn on_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Connected(source) => debug!("{:?} stream connected", source),
            StreamEvent::Disconnected(source) => debug!("{:?} stream disconnected", source),
            StreamEvent::Message(StreamSource::Sidebar, message) => {
                self.on_sidebar_message(message).await;
            }
            StreamEvent::Message(StreamSource::Preferences, message) => {
                self.on_preferences_message(message).await;
            }
        }
    }

    async fn on_sidebar_message(&mut self, message: StreamMessage) {
        let mut refresh_all = false;
        if let Some(outcome) = self.engine.apply_stream_message(message) {
            debug!("Applied batch: {:?}", outcome.decision);
            refresh_all = outcome.plan.refresh_all;
        }
        if self.engine.needs_bootstrap() {
            info!("Patch stream out of sync, bootstrapping");
            if let Err(e) = self.resync().await {
                warn!("Bootstrap failed, will retry: {:#}", e);
                return;
            }
        } else if refresh_all {
            // Ownership may hinge on a directory this client has not seen.
            if let Err(e) = reload_directories(&mut self.engine, self.backend.as_ref()).await {
                warn!("Failed to reload directories: {}", e);
            }
        }
        self.refresh().await;
    }

    /// The preferences stream is sequenced separately; its ops go straight
    /// through the recency rule.
    async fn on_preferences_message(&mut self, message: StreamMessage) {
        match message {
            StreamMessage::Patch(batch) => {
                for op in batch.ops {
                    if let PatchOp::PreferencesReplace(prefs) = op {
                        self.adopt_preferences(prefs);
                    }
                }
            }
            StreamMessage::ReplayGap => self.sync_preferences().await,
        }
    }

    /// Reload queued directories and flagged indices.
    pub async fn refresh(&mut self) {
        let report = drain_refreshes(
            &mut self.engine,
            self.backend.as_ref(),
            self.config.refresh_concurrency,
        )
        .await;
        if report.loaded > 0 || !report.failed.is_empty() {
            debug!(
                "Reloaded {} page(s), {} failed",
                report.loaded,
                report.failed.len()
            );
        }
        let now = now_millis();
        for (directory_id, delay) in report.retry_after {
            self.retries
                .insert(directory_id, now.saturating_add(delay.max(1) as i64));
        }
        refresh_indices(&mut self.engine, self.backend.as_ref()).await;
    }

    /// How long until the pending preferences write is due.
    pub fn next_persist_delay(&self, now_ms: u64) -> Option<Duration> {
        self.engine
            .next_persist_deadline()
            .map(|due| Duration::from_millis(due.saturating_sub(now_ms)))
    }

    /// Write preferences whose debounce elapsed, locally then remotely.
    pub async fn persist_due(&mut self, now_ms: u64) {
        let Some(prefs) = self.engine.take_due_persist(now_ms) else {
            return;
        };
        self.write_preferences(prefs).await;
    }

    async fn write_preferences(&mut self, prefs: sidebar_core::UiPrefs) {
        if let Err(e) = self.storage.save(&prefs) {
            warn!("Failed to cache preferences: {:#}", e);
        }
        match persist_preferences(&mut self.engine, self.backend.as_ref(), prefs).await {
            Ok(()) => self.save_local(),
            Err(e) => warn!("Failed to store preferences: {}", e),
        }
    }

    /// Periodic housekeeping: retry a failed bootstrap, re-queue degraded
    /// reloads that are due, prune expired state.
    pub async fn tick(&mut self, now_ms: i64) {
        if self.engine.needs_bootstrap() {
            if let Err(e) = self.resync().await {
                warn!("Bootstrap retry failed: {:#}", e);
                return;
            }
        }

        let due: Vec<String> = self
            .retries
            .iter()
            .filter(|(_, at)| **at <= now_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for directory_id in &due {
            self.retries.remove(directory_id);
            self.engine.enqueue_refresh(directory_id);
        }

        self.engine
            .prune_at(now_ms, self.config.idle_runtime_max_age_ms);
        if !due.is_empty() || self.engine.pending_refreshes() > 0 {
            self.refresh().await;
        }
    }

    /// Flush a pending preferences write before exit.
    pub async fn shutdown(&mut self) {
        if let Some(prefs) = self.engine.flush_persist() {
            info!("Flushing pending preferences");
            self.write_preferences(prefs).await;
        }
    }

    /// Machine-readable snapshot of what the engine holds.
    pub fn summary(&self) -> Value {
        let directories: Vec<Value> = self
            .engine
            .directories()
            .iter()
            .map(|d| {
                let sessions = self
                    .engine
                    .sessions_for_directory(&d.id, 0)
                    .map(|page| page.sessions.len())
                    .unwrap_or(0);
                let total_roots = self
                    .engine
                    .sessions_for_directory(&d.id, 0)
                    .map(|page| page.total_roots)
                    .unwrap_or(0);
                json!({
                    "id": d.id,
                    "name": d.display_name(),
                    "path": d.path,
                    "cachedSessions": sessions,
                    "totalRoots": total_roots,
                })
            })
            .collect();
        json!({
            "seq": self.engine.seq(),
            "directories": directories,
            "recent": self.engine.recent_page(0, None),
            "running": self.engine.running_page(0, None),
            "preferences": self.engine.preferences(),
        })
    }
}
