use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// BeadStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    Pending,
    InProgress,
    Passing,
    Skipped,
    NeedsReview,
}

impl BeadStatus {
    /// Bead statuses a `claim` may pick up from.
    pub fn is_claimable(&self) -> bool {
        matches!(self, BeadStatus::Pending | BeadStatus::NeedsReview)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BeadStatus::Pending => "pending",
            BeadStatus::InProgress => "in_progress",
            BeadStatus::Passing => "passing",
            BeadStatus::Skipped => "skipped",
            BeadStatus::NeedsReview => "needs_review",
        }
    }
}

impl std::fmt::Display for BeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Bead
// ---------------------------------------------------------------------------

/// A unit of work tracked by the store. Unknown keys encountered on a file
/// that predates a schema addition are captured in `extra` and written back
/// verbatim so round-tripping never loses data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub test_cases: Vec<String>,
    pub status: BeadStatus,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_state: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convoy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_holder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_deadline: Option<DateTime<Utc>>,
    /// Keys not recognized by this schema version, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Bead {
    pub fn new(id: impl Into<String>, name: impl Into<String>, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            test_cases: Vec::new(),
            status: BeadStatus::Pending,
            priority,
            verification_status: None,
            verification_notes: None,
            quality_state: None,
            created_at: now,
            updated_at: now,
            convoy_id: None,
            assigned_to: None,
            git_commit: None,
            lock_holder: None,
            lock_deadline: None,
            extra: serde_json::Map::new(),
        }
    }

    /// True iff a lock is recorded and its deadline has not yet passed.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_holder, &self.lock_deadline) {
            (Some(_), Some(deadline)) => now < *deadline,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// StoreStats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub passing: usize,
    pub skipped: usize,
    pub needs_review: usize,
    /// Rounded to one decimal place; 0.0 when `total` is zero.
    pub completion_percent: f64,
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Starting,
    Analyzing,
    Planning,
    Implementing,
    Testing,
    Reviewing,
    Completed,
    Failed,
}

impl Stage {
    /// Fixed stage -> percent-complete map from the design.
    pub fn percent_complete(&self) -> u8 {
        match self {
            Stage::Starting => 5,
            Stage::Analyzing => 15,
            Stage::Planning => 30,
            Stage::Implementing => 60,
            Stage::Testing => 80,
            Stage::Reviewing => 90,
            Stage::Completed => 100,
            Stage::Failed => 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Known event-type tags recognized on the stream. `Custom` covers anything
/// a caller wants to emit without extending this enum.
///
/// Serializes/deserializes as the colon-separated tag from `as_str()`
/// (`"board:update"`, `"chat:stream:end"`, ...) rather than a derived
/// `rename_all` string, since §6's wire schema and this type's own
/// `as_str()` both use colons and a derive can't express that for a
/// data-carrying variant like `Custom`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    BoardUpdate,
    ChatMessage,
    ChatStream,
    ChatStreamEnd,
    TaskCreated,
    TaskMoved,
    TaskDeleted,
    AgentStatus,
    LogsNew,
    SystemHealth,
    ClaudeOutput,
    ClaudeDone,
    ClaudeError,
    TaskProgress,
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::BoardUpdate => "board:update",
            EventKind::ChatMessage => "chat:message",
            EventKind::ChatStream => "chat:stream",
            EventKind::ChatStreamEnd => "chat:stream:end",
            EventKind::TaskCreated => "task:created",
            EventKind::TaskMoved => "task:moved",
            EventKind::TaskDeleted => "task:deleted",
            EventKind::AgentStatus => "agent:status",
            EventKind::LogsNew => "logs:new",
            EventKind::SystemHealth => "system:health",
            EventKind::ClaudeOutput => "claude:output",
            EventKind::ClaudeDone => "claude:done",
            EventKind::ClaudeError => "claude:error",
            EventKind::TaskProgress => "task:progress",
            EventKind::Custom(s) => s.as_str(),
        }
    }

    /// Inverse of `as_str`: maps a known colon-tag back to its variant,
    /// falling back to `Custom` for anything unrecognized.
    pub fn from_tag(s: &str) -> Self {
        match s {
            "board:update" => EventKind::BoardUpdate,
            "chat:message" => EventKind::ChatMessage,
            "chat:stream" => EventKind::ChatStream,
            "chat:stream:end" => EventKind::ChatStreamEnd,
            "task:created" => EventKind::TaskCreated,
            "task:moved" => EventKind::TaskMoved,
            "task:deleted" => EventKind::TaskDeleted,
            "agent:status" => EventKind::AgentStatus,
            "logs:new" => EventKind::LogsNew,
            "system:health" => EventKind::SystemHealth,
            "claude:output" => EventKind::ClaudeOutput,
            "claude:done" => EventKind::ClaudeDone,
            "claude:error" => EventKind::ClaudeError,
            "task:progress" => EventKind::TaskProgress,
            other => EventKind::Custom(other.to_string()),
        }
    }
}

impl Serialize for EventKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(EventKind::from_tag(&s))
    }
}

/// A tagged record broadcast through the [`crate::EventBus`]. `data` is an
/// untyped payload map, per the design note that event payloads stay
/// dict-like while the envelope (`kind`, `timestamp`) is strongly typed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_serializes_to_colon_tag() {
        let json = serde_json::to_string(&EventKind::ChatStreamEnd).unwrap();
        assert_eq!(json, "\"chat:stream:end\"");
        let json = serde_json::to_string(&EventKind::BoardUpdate).unwrap();
        assert_eq!(json, "\"board:update\"");
    }

    #[test]
    fn event_kind_custom_serializes_as_bare_string() {
        let json = serde_json::to_string(&EventKind::Custom("widget:moved".to_string())).unwrap();
        assert_eq!(json, "\"widget:moved\"");
    }

    #[test]
    fn event_kind_round_trips_through_json() {
        for kind in [
            EventKind::BoardUpdate,
            EventKind::ChatStreamEnd,
            EventKind::ClaudeOutput,
            EventKind::Custom("widget:moved".to_string()),
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            let back: EventKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn event_envelope_uses_type_field_with_colon_tag() {
        let event = Event::new(EventKind::TaskProgress, serde_json::json!({"n": 1}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "task:progress");
    }
}
