//! sidebar-core: client-side state for a multi-directory chat sidebar.
//!
//! This crate provides:
//! - Cached, paginated session trees per directory with degraded-page merges
//! - Sequenced patch application with gap and reset detection
//! - Recent and running global indices
//! - Versioned user preferences with debounced persistence
//! - The `SidebarBackend` trait and an in-memory implementation for tests

pub mod backend;
pub mod engine;
pub mod events;
pub mod global_index;
pub mod page_state;
pub mod paging;
pub mod persist;
pub mod planner;
pub mod preferences;
pub mod refresh_queue;
pub mod resolver;
pub mod runtime;
pub mod seq;
pub mod wire;
pub mod worker;

pub use backend::{BackendError, InMemoryBackend, SidebarBackend};
pub use engine::{ApplyOutcome, EngineConfig, IndexRefresh, PageLoadOutcome, SidebarEngine};
pub use events::{EventBus, SidebarEvent, Subscription};
pub use global_index::{GlobalIndex, IndexEntry, RecentIndexEntry, RunningIndexEntry};
pub use page_state::{SessionPage, TreeHint};
pub use paging::Page;
pub use preferences::{PrefsList, ReplaceOutcome, UiPrefs};
pub use runtime::{Attention, EffectiveStatus, RuntimePhase, RuntimeStatus, SessionRuntimeState};
pub use seq::{SeqDecision, SequenceTracker};
pub use wire::{
    Bootstrap, DirectoryEntry, DirectorySessionPage, PatchBatch, PatchOp, SessionSummary,
    StreamMessage,
};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
