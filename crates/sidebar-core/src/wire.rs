//! Wire decoding for bootstrap snapshots and patch batches.
//!
//! Payloads are walked as `serde_json::Value` rather than deserialized into
//! strict structs: a malformed item is dropped (and logged at `debug`) while
//! the rest of the payload still applies. Only a payload that is not a JSON
//! object at the top level is an error.

use crate::page_state::{PageConsistency, PageItem, SessionPage, TreeHint};
use crate::preferences::UiPrefs;
use crate::runtime::SessionRuntimeState;
use crate::seq::normalize_seq;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Control frame the backend sends when it cannot replay from the client's
/// `Last-Event-ID`.
pub const REPLAY_GAP_TYPE: &str = "opencode-studio:replay-gap";
pub const PREFERENCES_PATCH_TYPE: &str = "chat-sidebar-preferences.patch";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected a JSON object for {0}")]
    NotAnObject(&'static str),
}

pub type Result<T> = std::result::Result<T, WireError>;

fn trimmed(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn first_trimmed(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| trimmed(value.get(*key)))
}

fn millis(value: Option<&Value>) -> Option<i64> {
    value
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
        .map(|v| v.floor() as i64)
}

fn count(value: Option<&Value>) -> Option<usize> {
    value.and_then(Value::as_u64).map(|n| n as usize)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|v| trimmed(Some(v))).collect())
        .unwrap_or_default()
}

// ==================== Entities ====================

/// A configured workspace root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub id: String,
    pub path: String,
    pub label: Option<String>,
    pub added_at: i64,
    pub last_opened_at: i64,
}

impl DirectoryEntry {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            label: None,
            added_at: 0,
            last_opened_at: 0,
        }
    }

    /// `None` when `id` or `path` is missing.
    pub fn from_value(value: &Value) -> Option<Self> {
        Some(Self {
            id: trimmed(value.get("id"))?,
            path: trimmed(value.get("path"))?,
            label: trimmed(value.get("label")),
            added_at: millis(value.get("addedAt")).unwrap_or(0),
            last_opened_at: millis(value.get("lastOpenedAt")).unwrap_or(0),
        })
    }

    /// The label, or the last path component.
    pub fn display_name(&self) -> &str {
        if let Some(label) = &self.label {
            return label;
        }
        self.path
            .trim_end_matches(['/', '\\'])
            .rsplit(['/', '\\'])
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    /// Working directory path; not necessarily a configured entry.
    pub directory: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub slug: Option<String>,
    /// `time.updated` in epoch milliseconds.
    pub updated_at: i64,
}

impl SessionSummary {
    /// `None` when `id` or `directory` is missing.
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = trimmed(value.get("id"))?;
        let directory = trimmed(value.get("directory"))?;
        let slug = trimmed(value.get("slug"));
        let title = trimmed(value.get("title"))
            .or_else(|| slug.clone())
            .unwrap_or_default();
        let updated_at = millis(value.get("time").and_then(|t| t.get("updated")))
            .or_else(|| millis(value.get("updatedAt")))
            .unwrap_or(0);
        Some(Self {
            parent_id: first_trimmed(value, &["parentID", "parentId", "parent_id"]),
            id,
            directory,
            title,
            slug,
            updated_at,
        })
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

impl PageItem for SessionSummary {
    fn item_id(&self) -> &str {
        &self.id
    }

    fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

pub type DirectorySessionPage = SessionPage<SessionSummary>;

// ==================== Pages ====================

fn decode_sessions(items: &[Value]) -> Vec<SessionSummary> {
    items
        .iter()
        .filter_map(|item| {
            let decoded = SessionSummary::from_value(item);
            if decoded.is_none() {
                tracing::debug!("Dropping malformed session summary");
            }
            decoded
        })
        .collect()
}

fn decode_consistency(value: &Value) -> Option<PageConsistency> {
    let obj = value.as_object()?;
    Some(PageConsistency {
        degraded: obj.get("degraded").and_then(Value::as_bool).unwrap_or(false),
        retry_after_ms: obj.get("retryAfterMs").and_then(Value::as_u64),
    })
}

fn decode_tree_hint(value: &Value) -> Option<TreeHint> {
    value.as_object()?;
    let children_by_parent_session_id = value
        .get("childrenByParentSessionId")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter(|(parent, _)| !parent.trim().is_empty())
                .map(|(parent, children)| (parent.trim().to_string(), string_list(Some(children))))
                .collect()
        })
        .unwrap_or_default();
    Some(TreeHint {
        root_session_ids: string_list(value.get("rootSessionIds")),
        children_by_parent_session_id,
    })
}

/// Decode one directory's session page.
///
/// A bare array is accepted as a first page. A missing `total` falls back to
/// the number of roots in the payload.
pub fn decode_session_page(value: &Value, default_limit: usize) -> DirectorySessionPage {
    if let Some(items) = value.as_array() {
        let sessions = decode_sessions(items);
        let total_roots = sessions.iter().filter(|s| s.is_root()).count();
        return SessionPage {
            limit: default_limit,
            total_roots,
            sessions,
            ..SessionPage::default()
        };
    }

    let sessions = value
        .get("sessions")
        .and_then(Value::as_array)
        .map(|items| decode_sessions(items))
        .unwrap_or_default();
    let total_roots = count(value.get("total"))
        .unwrap_or_else(|| sessions.iter().filter(|s| s.is_root()).count());
    let offset = count(value.get("offset")).unwrap_or(0);
    let limit = count(value.get("limit"))
        .filter(|limit| *limit > 0)
        .unwrap_or(default_limit);
    let page = if limit > 0 { offset / limit } else { 0 };

    SessionPage {
        page,
        offset,
        limit,
        total_roots,
        sessions,
        consistency: value.get("consistency").and_then(decode_consistency),
        tree_hint: value.get("treeHint").and_then(decode_tree_hint),
    }
}

// ==================== Bootstrap ====================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bootstrap {
    pub directory_entries: Vec<DirectoryEntry>,
    pub session_summaries_by_directory_id: BTreeMap<String, DirectorySessionPage>,
    pub runtime_by_session_id: BTreeMap<String, SessionRuntimeState>,
    /// `None` when the snapshot carries no counter.
    pub seq: Option<u64>,
}

pub fn decode_bootstrap(value: &Value, default_limit: usize) -> Result<Bootstrap> {
    if !value.is_object() {
        return Err(WireError::NotAnObject("bootstrap"));
    }

    let directory_entries = value
        .get("directoryEntries")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let entry = DirectoryEntry::from_value(item);
                    if entry.is_none() {
                        tracing::debug!("Dropping malformed directory entry");
                    }
                    entry
                })
                .collect()
        })
        .unwrap_or_default();

    let session_summaries_by_directory_id = value
        .get("sessionSummariesByDirectoryId")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter(|(id, _)| !id.trim().is_empty())
                .map(|(id, page)| (id.trim().to_string(), decode_session_page(page, default_limit)))
                .collect()
        })
        .unwrap_or_default();

    let runtime_by_session_id = value
        .get("runtimeBySessionId")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(id, raw)| SessionRuntimeState::from_value(Some(id.as_str()), raw))
                .map(|state| (state.session_id.clone(), state))
                .collect()
        })
        .unwrap_or_default();

    let seq = value.get("seq").map(|raw| normalize_seq(Some(raw)));

    Ok(Bootstrap {
        directory_entries,
        session_summaries_by_directory_id,
        runtime_by_session_id,
        seq,
    })
}

pub fn bootstrap_from_json(bytes: &[u8], default_limit: usize) -> Result<Bootstrap> {
    let value: Value = serde_json::from_slice(bytes)?;
    decode_bootstrap(&value, default_limit)
}

// ==================== Patches ====================

#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    DirectoryUpsert(DirectoryEntry),
    DirectoryRemove { directory_id: String },
    SessionUpsert(SessionSummary),
    SessionRemove { session_id: String },
    RuntimeUpsert(SessionRuntimeState),
    RuntimeRemove { session_id: String },
    PreferencesReplace(UiPrefs),
}

impl PatchOp {
    /// Decode one op. Unknown types and malformed payloads yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let kind = value.get("type").and_then(Value::as_str)?;
        match kind {
            "directoryEntry.upsert" => value
                .get("entry")
                .and_then(DirectoryEntry::from_value)
                .map(Self::DirectoryUpsert),
            "directoryEntry.remove" => trimmed(value.get("directoryId"))
                .map(|directory_id| Self::DirectoryRemove { directory_id }),
            "sessionSummary.upsert" => value
                .get("session")
                .and_then(SessionSummary::from_value)
                .map(Self::SessionUpsert),
            "sessionSummary.remove" => trimmed(value.get("sessionId"))
                .map(|session_id| Self::SessionRemove { session_id }),
            "sessionRuntime.upsert" => value
                .get("runtime")
                .and_then(|raw| {
                    let key = trimmed(value.get("sessionId"));
                    SessionRuntimeState::from_value(key.as_deref(), raw)
                })
                .map(Self::RuntimeUpsert),
            "sessionRuntime.remove" => trimmed(value.get("sessionId"))
                .map(|session_id| Self::RuntimeRemove { session_id }),
            "preferences.replace" => value
                .get("preferences")
                .filter(|raw| raw.is_object())
                .and_then(|raw| serde_json::from_value::<UiPrefs>(raw.clone()).ok())
                .map(|prefs| Self::PreferencesReplace(prefs.sanitized())),
            _ => None,
        }
    }
}

/// Backend statement of which derived views a batch invalidates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshHint {
    pub refresh_all: bool,
    pub refresh_directory_ids: Vec<String>,
    pub refresh_recent_index: bool,
    pub refresh_running_index: bool,
}

impl RefreshHint {
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_object()?;
        let flag = |key: &str| value.get(key).and_then(Value::as_bool).unwrap_or(false);
        Some(Self {
            refresh_all: flag("refreshAll"),
            refresh_directory_ids: string_list(value.get("refreshDirectoryIds")),
            refresh_recent_index: flag("refreshRecentIndex"),
            refresh_running_index: flag("refreshRunningIndex"),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchBatch {
    /// `0` when unsequenced.
    pub seq: u64,
    pub ts: i64,
    pub ops: Vec<PatchOp>,
    pub hint: Option<RefreshHint>,
    /// The backend discarded its timeline; state must be rebuilt.
    pub reset: bool,
}

/// Decode a patch batch, either the sidebar shape (`{seq, ts, ops}`) or the
/// preferences shape (`{type, seq, ts, properties: {ops}}`).
pub fn decode_patch_batch(value: &Value) -> Result<PatchBatch> {
    if !value.is_object() {
        return Err(WireError::NotAnObject("patch batch"));
    }

    let raw_ops = value
        .get("ops")
        .or_else(|| value.get("properties").and_then(|p| p.get("ops")))
        .and_then(Value::as_array);

    let mut ops = Vec::new();
    for raw in raw_ops.into_iter().flatten() {
        match PatchOp::from_value(raw) {
            Some(op) => ops.push(op),
            None => {
                let op_type = raw.get("type").and_then(Value::as_str).unwrap_or("<none>");
                tracing::debug!("Dropping unknown or malformed patch op: {}", op_type);
            }
        }
    }

    Ok(PatchBatch {
        seq: normalize_seq(value.get("seq")),
        ts: millis(value.get("ts")).unwrap_or(0),
        ops,
        hint: value
            .get("hint")
            .or_else(|| value.get("refreshHint"))
            .and_then(RefreshHint::from_value),
        reset: value.get("reset").and_then(Value::as_bool).unwrap_or(false),
    })
}

pub fn patch_batch_from_json(bytes: &[u8]) -> Result<PatchBatch> {
    let value: Value = serde_json::from_slice(bytes)?;
    decode_patch_batch(&value)
}

/// One decoded frame of the patch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Patch(PatchBatch),
    /// The backend could not replay what we missed.
    ReplayGap,
}

/// Decode an SSE frame. Empty frames and keep-alives yield `Ok(None)`.
pub fn decode_stream_frame(event: Option<&str>, data: &str) -> Result<Option<StreamMessage>> {
    match event {
        Some("replay-gap") => return Ok(Some(StreamMessage::ReplayGap)),
        Some("heartbeat") | Some("ping") => return Ok(None),
        _ => {}
    }
    let data = data.trim();
    if data.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(data)?;
    match value.get("type").and_then(Value::as_str) {
        Some(REPLAY_GAP_TYPE) => return Ok(Some(StreamMessage::ReplayGap)),
        Some("heartbeat") | Some("ping") => return Ok(None),
        _ => {}
    }
    decode_patch_batch(&value).map(|batch| Some(StreamMessage::Patch(batch)))
}
