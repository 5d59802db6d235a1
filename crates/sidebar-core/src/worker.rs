//! Async drivers that move data between a [`SidebarBackend`] and a
//! [`SidebarEngine`].
//!
//! Fetches run concurrently; their results are folded into the engine one
//! at a time once every fetch in the round has settled, so the engine never
//! needs to be shared across tasks.

use crate::backend::{BackendError, Result, SidebarBackend};
use crate::engine::{IndexRefresh, SidebarEngine};
use crate::paging::{DIRECTORIES_LIMIT, RECENT_LIMIT, RUNNING_LIMIT};
use crate::preferences::UiPrefs;
use futures::stream::{self, StreamExt};

pub const DEFAULT_REFRESH_CONCURRENCY: usize = 4;

/// Summary of one [`drain_refreshes`] round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub loaded: usize,
    pub failed: Vec<String>,
    /// Directories served degraded, with the backend's retry delay.
    pub retry_after: Vec<(String, u64)>,
}

/// Fetch a snapshot and replace engine state with it.
pub async fn bootstrap<B: SidebarBackend + ?Sized>(
    engine: &mut SidebarEngine,
    backend: &B,
) -> Result<()> {
    let snapshot = backend.bootstrap().await?;
    engine.apply_bootstrap(snapshot);
    Ok(())
}

/// Reload every queued directory, `concurrency` fetches at a time.
///
/// Each cached page of a directory is refetched. Failures are logged and
/// dropped; the next patch touching the directory queues it again.
pub async fn drain_refreshes<B: SidebarBackend + ?Sized>(
    engine: &mut SidebarEngine,
    backend: &B,
    concurrency: usize,
) -> RefreshReport {
    let limit = engine.page_size();
    let mut requests = Vec::new();
    while let Some(directory_id) = engine.next_refresh() {
        for page in engine.cached_pages(&directory_id) {
            requests.push((directory_id.clone(), page));
        }
    }
    if requests.is_empty() {
        return RefreshReport::default();
    }
    tracing::debug!("Reloading {} directory page(s)", requests.len());

    let results = stream::iter(requests)
        .map(|(directory_id, page)| async move {
            let result = backend
                .directory_sessions(&directory_id, page * limit, limit)
                .await;
            (directory_id, result)
        })
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut report = RefreshReport::default();
    for (directory_id, result) in results {
        match result {
            Ok(loaded) => {
                let outcome = engine.apply_directory_page(&directory_id, loaded);
                if outcome.applied {
                    report.loaded += 1;
                }
                if let Some(delay) = outcome.retry_after_ms {
                    report.retry_after.push((directory_id, delay));
                }
            }
            Err(e) => {
                tracing::warn!("Reload of directory {} failed: {}", directory_id, e);
                report.failed.push(directory_id);
            }
        }
    }
    report
}

/// Reload whichever global indices the engine flagged.
pub async fn refresh_indices<B: SidebarBackend + ?Sized>(
    engine: &mut SidebarEngine,
    backend: &B,
) -> IndexRefresh {
    let wanted = engine.take_index_refresh();
    let mut failed = IndexRefresh::default();

    if wanted.recent {
        match backend.recent_index(0, RECENT_LIMIT.max).await {
            Ok(page) => engine.apply_recent_index(page),
            Err(e) => {
                tracing::warn!("Recent index reload failed: {}", e);
                failed.recent = true;
            }
        }
    }
    if wanted.running {
        match backend.running_index(0, RUNNING_LIMIT.max).await {
            Ok(page) => engine.apply_running_index(page),
            Err(e) => {
                tracing::warn!("Running index reload failed: {}", e);
                failed.running = true;
            }
        }
    }

    if failed.any() {
        engine.request_index_refresh(failed);
    }
    failed
}

/// Page through the backend's directory listing and reconcile the engine
/// against it. Nothing is applied unless every page loaded.
pub async fn reload_directories<B: SidebarBackend + ?Sized>(
    engine: &mut SidebarEngine,
    backend: &B,
) -> Result<usize> {
    let mut entries = Vec::new();
    let mut offset = 0;
    loop {
        let page = backend.directories(offset, DIRECTORIES_LIMIT.max).await?;
        entries.extend(page.items);
        match page.next_offset {
            Some(next) if page.has_more && next > offset => offset = next,
            _ => break,
        }
    }
    let count = entries.len();
    tracing::debug!("Directory listing has {} entries", count);
    engine.apply_directory_listing(entries);
    Ok(count)
}

/// Write `prefs` to the backend and reconcile the answer.
///
/// A version conflict is not an error: the backend's copy wins and is
/// adopted.
pub async fn persist_preferences<B: SidebarBackend + ?Sized>(
    engine: &mut SidebarEngine,
    backend: &B,
    prefs: UiPrefs,
) -> Result<()> {
    match backend.put_preferences(prefs.version, &prefs).await {
        Ok(stored) => {
            tracing::debug!("Preferences stored at version {}", stored.version);
            engine.acknowledge_persisted(&prefs, stored);
            Ok(())
        }
        Err(BackendError::Conflict { current }) => {
            let current = match current {
                Some(current) => *current,
                None => backend.get_preferences().await?,
            };
            tracing::info!(
                "Preferences conflict, adopting backend copy at version {}",
                current.version
            );
            engine.apply_remote_preferences(current);
            Ok(())
        }
        Err(BackendError::PreconditionRequired) => {
            let current = backend.get_preferences().await?;
            engine.apply_remote_preferences(current);
            Ok(())
        }
        Err(e) => Err(e),
    }
}
