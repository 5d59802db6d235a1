//! Volatile per-session runtime state.
//!
//! Runtime status changes far more often than session summaries, so it lives
//! in its own map and never forces a directory page reload. The backend sends
//! three independent signals (status, phase, attention) which collapse into a
//! single [`EffectiveStatus`] for display.

use serde::Serialize;
use serde_json::Value;

/// Status reported by the agent loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RuntimeStatus {
    #[default]
    Idle,
    Busy,
    Retry,
}

impl RuntimeStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "retry" => Some(Self::Retry),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Retry => "retry",
        }
    }

    /// Busy and retry both mean the session is doing work.
    pub fn is_working(self) -> bool {
        matches!(self, Self::Busy | Self::Retry)
    }
}

/// Activity phase reported by the session activity tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RuntimePhase {
    #[default]
    Idle,
    Busy,
    Cooldown,
}

impl RuntimePhase {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "cooldown" => Some(Self::Cooldown),
            _ => None,
        }
    }
}

/// Why a session is waiting on the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Attention {
    Permission,
    Question,
}

impl Attention {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "permission" => Some(Self::Permission),
            "question" => Some(Self::Question),
            _ => None,
        }
    }
}

/// The single status a UI surface shows for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EffectiveStatus {
    Idle,
    Busy,
    Cooldown,
    Attention,
}

impl EffectiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Cooldown => "cooldown",
            Self::Attention => "attention",
        }
    }
}

/// Runtime state for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRuntimeState {
    pub session_id: String,
    pub status: RuntimeStatus,
    pub phase: RuntimePhase,
    pub attention: Option<Attention>,
    /// Milliseconds since epoch of the last state change.
    pub updated_at: i64,
}

impl SessionRuntimeState {
    pub fn idle(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            status: RuntimeStatus::Idle,
            phase: RuntimePhase::Idle,
            attention: None,
            updated_at: 0,
        }
    }

    /// Attention beats work, work beats cooldown.
    pub fn effective(&self) -> EffectiveStatus {
        if self.attention.is_some() {
            return EffectiveStatus::Attention;
        }
        if self.status.is_working() || self.phase == RuntimePhase::Busy {
            return EffectiveStatus::Busy;
        }
        if self.phase == RuntimePhase::Cooldown {
            return EffectiveStatus::Cooldown;
        }
        EffectiveStatus::Idle
    }

    pub fn is_active(&self) -> bool {
        self.effective() != EffectiveStatus::Idle
    }

    pub fn needs_attention(&self) -> bool {
        self.attention.is_some()
    }

    /// Compares everything except `updated_at`.
    pub fn same_state(&self, other: &Self) -> bool {
        self.status == other.status
            && self.phase == other.phase
            && self.attention == other.attention
    }

    /// Decode a runtime record.
    ///
    /// `key` is the map key the record was found under, if any; it takes
    /// precedence over the embedded `sessionID`. A bare string value is read
    /// as the status. Returns `None` when no session id can be found.
    pub fn from_value(key: Option<&str>, value: &Value) -> Option<Self> {
        let session_id = key
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(|| {
                ["sessionID", "sessionId", "session_id"]
                    .iter()
                    .find_map(|field| value.get(*field).and_then(Value::as_str))
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
            })?;

        if let Some(raw) = value.as_str() {
            let mut state = Self::idle(session_id);
            if let Some(status) = RuntimeStatus::parse(raw) {
                state.status = status;
            } else if let Some(phase) = RuntimePhase::parse(raw) {
                state.phase = phase;
            }
            return Some(state);
        }

        if !value.is_object() {
            return None;
        }

        let effective_type = value.get("type").and_then(Value::as_str).unwrap_or("");

        let status = value
            .get("statusType")
            .and_then(Value::as_str)
            .and_then(RuntimeStatus::parse)
            .or_else(|| match value.get("status") {
                Some(Value::String(raw)) => RuntimeStatus::parse(raw),
                Some(nested) => nested
                    .get("type")
                    .and_then(Value::as_str)
                    .and_then(RuntimeStatus::parse),
                None => None,
            })
            .or_else(|| RuntimeStatus::parse(effective_type))
            .unwrap_or_default();

        let phase = value
            .get("phase")
            .and_then(Value::as_str)
            .and_then(RuntimePhase::parse)
            .or_else(|| (effective_type == "cooldown").then_some(RuntimePhase::Cooldown))
            .unwrap_or_default();

        let attention = match value.get("attention") {
            Some(Value::String(raw)) => Attention::parse(raw),
            _ => None,
        }
        // The effective type alone still says someone is waiting.
        .or_else(|| (effective_type == "attention").then_some(Attention::Permission));

        let updated_at = value
            .get("updatedAt")
            .and_then(Value::as_f64)
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v.floor() as i64)
            .unwrap_or(0);

        Some(Self {
            session_id,
            status,
            phase,
            attention,
            updated_at,
        })
    }
}
