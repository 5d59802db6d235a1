//! Decide which derived views a patch batch invalidates.
//!
//! Runtime ops take a fast path and never touch directory scope. Topology
//! changes refresh everything. Session ops refresh the directories that
//! owned the session before and after the change; if neither side can be
//! resolved, everything is refreshed. A backend hint replaces the local
//! inference outright.

use crate::resolver::match_directory_entry_for_path;
use crate::wire::{DirectoryEntry, PatchBatch, PatchOp};
use std::collections::{BTreeSet, HashMap};

/// What the planner may consult.
pub struct PlannerContext<'a> {
    pub directories: &'a [DirectoryEntry],
    /// Known owner directory id per session id.
    pub session_directory: &'a HashMap<String, String>,
}

impl PlannerContext<'_> {
    fn known_directory(&self, directory_id: &str) -> bool {
        self.directories.iter().any(|d| d.id == directory_id)
    }

    fn owner_by_mapping(&self, session_id: &str) -> Option<String> {
        self.session_directory
            .get(session_id)
            .filter(|id| self.known_directory(id))
            .cloned()
    }

    fn owner_by_path(&self, path: &str) -> Option<String> {
        match_directory_entry_for_path(self.directories, path).map(|entry| entry.id.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshPlan {
    pub refresh_all: bool,
    pub directory_ids: BTreeSet<String>,
    pub recent_index: bool,
    pub running_index: bool,
    /// Sessions whose runtime changed; served by the fast path.
    pub runtime_session_ids: BTreeSet<String>,
    pub preferences: bool,
}

impl RefreshPlan {
    /// No view needs reloading.
    pub fn is_quiet(&self) -> bool {
        !self.refresh_all
            && self.directory_ids.is_empty()
            && !self.recent_index
            && !self.running_index
    }
}

pub fn plan(batch: &PatchBatch, ctx: &PlannerContext<'_>) -> RefreshPlan {
    let mut plan = RefreshPlan::default();

    for op in &batch.ops {
        match op {
            PatchOp::RuntimeUpsert(state) => {
                plan.runtime_session_ids.insert(state.session_id.clone());
            }
            PatchOp::RuntimeRemove { session_id } => {
                plan.runtime_session_ids.insert(session_id.clone());
            }
            PatchOp::PreferencesReplace(_) => plan.preferences = true,
            _ => {}
        }
    }

    if let Some(hint) = &batch.hint {
        tracing::debug!("Using backend refresh hint for seq {}", batch.seq);
        plan.refresh_all = hint.refresh_all;
        if !hint.refresh_all {
            plan.directory_ids = hint.refresh_directory_ids.iter().cloned().collect();
        }
        plan.recent_index = hint.refresh_recent_index;
        plan.running_index = hint.refresh_running_index;
        return plan;
    }

    for op in &batch.ops {
        match op {
            PatchOp::DirectoryUpsert(_) | PatchOp::DirectoryRemove { .. } => {
                plan.refresh_all = true;
            }
            PatchOp::SessionUpsert(session) => {
                let previous = ctx.owner_by_mapping(&session.id);
                let next = ctx.owner_by_path(&session.directory);
                mark_owners(&mut plan, &session.id, previous, next);
            }
            PatchOp::SessionRemove { session_id } => {
                let previous = ctx.owner_by_mapping(session_id);
                mark_owners(&mut plan, session_id, previous, None);
            }
            PatchOp::RuntimeUpsert(_)
            | PatchOp::RuntimeRemove { .. }
            | PatchOp::PreferencesReplace(_) => {}
        }
    }

    if plan.refresh_all {
        plan.directory_ids.clear();
    }
    if plan.refresh_all || !plan.directory_ids.is_empty() {
        plan.recent_index = true;
        plan.running_index = true;
    }
    plan
}

fn mark_owners(
    plan: &mut RefreshPlan,
    session_id: &str,
    previous: Option<String>,
    next: Option<String>,
) {
    if previous.is_none() && next.is_none() {
        tracing::info!("Owner of session {} unresolved, refreshing everything", session_id);
        plan.refresh_all = true;
        return;
    }
    plan.directory_ids.extend(previous);
    plan.directory_ids.extend(next);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SessionRuntimeState;
    use crate::wire::{RefreshHint, SessionSummary};

    fn summary(id: &str, directory: &str) -> SessionSummary {
        SessionSummary {
            id: id.into(),
            directory: directory.into(),
            parent_id: None,
            title: String::new(),
            slug: None,
            updated_at: 1,
        }
    }

    fn batch(ops: Vec<PatchOp>) -> PatchBatch {
        PatchBatch {
            ops,
            ..PatchBatch::default()
        }
    }

    fn directories() -> Vec<DirectoryEntry> {
        vec![DirectoryEntry::new("a", "/repo"), DirectoryEntry::new("b", "/other")]
    }

    #[test]
    fn test_runtime_only_is_quiet() {
        let dirs = directories();
        let mapping = HashMap::new();
        let ctx = PlannerContext {
            directories: &dirs,
            session_directory: &mapping,
        };
        let plan = plan(
            &batch(vec![
                PatchOp::RuntimeUpsert(SessionRuntimeState::idle("s_1")),
                PatchOp::RuntimeRemove {
                    session_id: "s_2".into(),
                },
            ]),
            &ctx,
        );
        assert!(plan.is_quiet());
        assert_eq!(plan.runtime_session_ids.len(), 2);
    }

    #[test]
    fn test_session_move_marks_both_directories() {
        let dirs = directories();
        let mapping = HashMap::from([("s_1".to_string(), "a".to_string())]);
        let ctx = PlannerContext {
            directories: &dirs,
            session_directory: &mapping,
        };
        let plan = plan(&batch(vec![PatchOp::SessionUpsert(summary("s_1", "/other/x"))]), &ctx);
        assert!(!plan.refresh_all);
        assert_eq!(
            plan.directory_ids.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert!(plan.recent_index && plan.running_index);
    }

    #[test]
    fn test_unresolvable_session_refreshes_everything() {
        let dirs = directories();
        let mapping = HashMap::new();
        let ctx = PlannerContext {
            directories: &dirs,
            session_directory: &mapping,
        };
        let plan = plan(&batch(vec![PatchOp::SessionUpsert(summary("s_1", "/tmp/x"))]), &ctx);
        assert!(plan.refresh_all);
        assert!(plan.recent_index && plan.running_index);
    }

    #[test]
    fn test_remove_unknown_session_refreshes_everything() {
        let dirs = directories();
        let mapping = HashMap::new();
        let ctx = PlannerContext {
            directories: &dirs,
            session_directory: &mapping,
        };
        let plan = plan(
            &batch(vec![PatchOp::SessionRemove {
                session_id: "ghost".into(),
            }]),
            &ctx,
        );
        assert!(plan.refresh_all);
    }

    #[test]
    fn test_directory_change_refreshes_everything() {
        let dirs = directories();
        let mapping = HashMap::new();
        let ctx = PlannerContext {
            directories: &dirs,
            session_directory: &mapping,
        };
        let plan = plan(
            &batch(vec![PatchOp::DirectoryRemove {
                directory_id: "a".into(),
            }]),
            &ctx,
        );
        assert!(plan.refresh_all);
        assert!(plan.directory_ids.is_empty());
    }

    #[test]
    fn test_hint_replaces_inference() {
        let dirs = directories();
        let mapping = HashMap::new();
        let ctx = PlannerContext {
            directories: &dirs,
            session_directory: &mapping,
        };
        let mut hinted = batch(vec![PatchOp::SessionUpsert(summary("s_1", "/nowhere"))]);
        hinted.hint = Some(RefreshHint {
            refresh_directory_ids: vec!["b".into()],
            ..RefreshHint::default()
        });
        let plan = plan(&hinted, &ctx);
        assert!(!plan.refresh_all);
        assert!(plan.directory_ids.contains("b"));
        assert!(!plan.recent_index);
        assert!(!plan.running_index);
    }
}
