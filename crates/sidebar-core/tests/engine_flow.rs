use serde_json::json;
use sidebar_core::wire::{decode_patch_batch, decode_stream_frame};
use sidebar_core::worker::{bootstrap, drain_refreshes, refresh_indices};
use sidebar_core::{
    DirectoryEntry, EngineConfig, InMemoryBackend, SeqDecision, SessionSummary, SidebarEngine,
    SidebarEvent, StreamMessage,
};
use std::sync::{Arc, Mutex};

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

fn seeded_backend() -> InMemoryBackend {
    let backend = InMemoryBackend::new(10);
    backend.add_directory(DirectoryEntry::new("d_repo", "/work/repo"));
    backend.add_directory(DirectoryEntry::new("d_sub", "/work/repo/packages/ui"));
    backend.upsert_session(session("root_a", "/work/repo", None, 100));
    backend.upsert_session(session("child_a", "/work/repo", Some("root_a"), 110));
    backend.upsert_session(session("root_ui", "/work/repo/packages/ui", None, 90));
    backend.set_seq(10);
    backend
}

#[tokio::test]
async fn test_bootstrap_then_patch_stream() {
    let backend = seeded_backend();
    let mut engine = SidebarEngine::new(EngineConfig::default());
    bootstrap(&mut engine, &backend).await.unwrap();

    assert_eq!(engine.seq(), 10);
    assert_eq!(engine.session_owner("child_a"), Some("d_repo"));
    assert_eq!(engine.session_owner("root_ui"), Some("d_sub"));

    let frame = json!({
        "type": "chat-sidebar.patch",
        "seq": 11,
        "ops": [
            {"type": "sessionRuntime.upsert", "runtime": {"sessionID": "root_a", "status": "busy", "updatedAt": 500}}
        ]
    })
    .to_string();
    let message = decode_stream_frame(Some("patch"), &frame).unwrap().unwrap();
    let outcome = engine.apply_stream_message_at(message, 600).unwrap();
    assert_eq!(outcome.decision, SeqDecision::Apply);
    assert!(outcome.plan.is_quiet());
    assert!(engine.is_session_active("root_a"));
    assert_eq!(engine.running_page(0, None).items[0].session_id, "root_a");
}

#[tokio::test]
async fn test_session_move_reloads_both_directories() {
    let backend = seeded_backend();
    let mut engine = SidebarEngine::new(EngineConfig::default());
    bootstrap(&mut engine, &backend).await.unwrap();
    refresh_indices(&mut engine, &backend).await;

    backend.upsert_session(session("root_a", "/work/repo/packages/ui", None, 200));
    backend.remove_session("child_a");
    backend.upsert_session(session("child_a", "/work/repo/packages/ui", Some("root_a"), 210));

    let batch = decode_patch_batch(&json!({
        "seq": 11,
        "ops": [{"type": "sessionSummary.upsert", "session": {
            "id": "root_a",
            "directory": "/work/repo/packages/ui",
            "title": "root_a",
            "time": {"updated": 200}
        }}]
    }))
    .unwrap();
    let outcome = engine.apply_batch_at(batch, 700);
    assert!(outcome.plan.directory_ids.contains("d_repo"));
    assert!(outcome.plan.directory_ids.contains("d_sub"));

    let report = drain_refreshes(&mut engine, &backend, 2).await;
    assert_eq!(report.loaded, 2);
    assert!(report.failed.is_empty());

    let repo = engine.sessions_for_directory("d_repo", 0).unwrap();
    assert!(repo.sessions.is_empty());
    let ui = engine.sessions_for_directory("d_sub", 0).unwrap();
    assert!(ui.contains("root_a"));
    assert!(ui.contains("child_a"));
    assert_eq!(engine.session_owner("child_a"), Some("d_sub"));
}

#[tokio::test]
async fn test_gap_then_bootstrap_recovers() {
    let backend = seeded_backend();
    let mut engine = SidebarEngine::new(EngineConfig::default());
    bootstrap(&mut engine, &backend).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = engine
        .events()
        .subscribe(move |event| sink.lock().unwrap().push(event.clone()));

    let gap = decode_patch_batch(&json!({"seq": 14, "ops": []})).unwrap();
    let outcome = engine.apply_batch_at(gap, 800);
    assert_eq!(outcome.decision, SeqDecision::Gap);
    assert!(engine.needs_bootstrap());
    assert!(seen
        .lock()
        .unwrap()
        .contains(&SidebarEvent::ResyncRequired { reset: false }));

    backend.set_seq(20);
    bootstrap(&mut engine, &backend).await.unwrap();
    assert!(!engine.needs_bootstrap());
    assert_eq!(engine.seq(), 20);
}

#[tokio::test]
async fn test_summary_bump_reorders_recent_index_across_directories() {
    let backend = seeded_backend();
    let mut engine = SidebarEngine::new(EngineConfig::default());
    bootstrap(&mut engine, &backend).await.unwrap();

    let before: Vec<String> = engine
        .recent_page(0, None)
        .items
        .into_iter()
        .map(|e| e.session_id)
        .collect();
    assert_eq!(before, vec!["child_a", "root_a", "root_ui"]);

    let batch = decode_patch_batch(&json!({
        "seq": 11,
        "ops": [{"type": "sessionSummary.upsert", "session": {
            "id": "root_ui",
            "directory": "/work/repo/packages/ui",
            "title": "root_ui",
            "time": {"updated": 999}
        }}]
    }))
    .unwrap();
    engine.apply_batch_at(batch, 1_000);

    let recent = engine.recent_page(0, None);
    assert_eq!(recent.items[0].session_id, "root_ui");
    assert_eq!(recent.items[0].directory_id.as_deref(), Some("d_sub"));
}

#[tokio::test]
async fn test_replay_gap_frame() {
    let backend = seeded_backend();
    let mut engine = SidebarEngine::new(EngineConfig::default());
    bootstrap(&mut engine, &backend).await.unwrap();

    let frame = json!({"type": "opencode-studio:replay-gap"}).to_string();
    let message = decode_stream_frame(None, &frame).unwrap().unwrap();
    assert_eq!(message, StreamMessage::ReplayGap);
    assert!(engine.apply_stream_message_at(message, 0).is_none());
    assert!(engine.needs_bootstrap());
}
