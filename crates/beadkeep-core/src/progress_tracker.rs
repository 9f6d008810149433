//! Single source of truth for each in-flight task's coarse progress.
//! Entries are purely in-memory and transient — they are rebuilt from
//! scratch on process restart, same as the [`crate::retry_controller`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event_bus::EventBus;
use crate::types::{EventKind, Stage};

/// How long a terminal (`completed`) entry lingers before auto-expiry.
pub const COMPLETION_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub task_name: String,
    pub stage: Stage,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub percent_complete: u8,
    pub retro: Option<String>,
    pub error: Option<String>,
    /// Set when `stage` reached `completed`; entries past this instant are
    /// swept by `all()` and any subsequent mutator.
    expires_at: Option<DateTime<Utc>>,
}

pub struct ProgressTracker {
    entries: Mutex<HashMap<String, TaskProgress>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(&self, bus: &EventBus, task_id: &str, task_name: &str) {
        let now = Utc::now();
        let entry = TaskProgress {
            task_id: task_id.to_string(),
            task_name: task_name.to_string(),
            stage: Stage::Starting,
            message: None,
            started_at: now,
            updated_at: now,
            percent_complete: Stage::Starting.percent_complete(),
            retro: None,
            error: None,
            expires_at: None,
        };
        self.entries
            .lock()
            .unwrap()
            .insert(task_id.to_string(), entry.clone());
        emit_progress(bus, &entry);
    }

    pub fn update_stage(
        &self,
        bus: &EventBus,
        task_id: &str,
        stage: Stage,
        message: Option<String>,
    ) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(task_id) else {
            return;
        };
        entry.stage = stage;
        entry.percent_complete = stage.percent_complete();
        entry.message = message;
        entry.updated_at = Utc::now();
        let snapshot = entry.clone();
        drop(entries);
        emit_progress(bus, &snapshot);
    }

    pub fn complete(&self, bus: &EventBus, task_id: &str, retro_text: impl Into<String>) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(task_id) else {
            return;
        };
        entry.stage = Stage::Completed;
        entry.percent_complete = Stage::Completed.percent_complete();
        entry.retro = Some(retro_text.into());
        entry.updated_at = Utc::now();
        entry.expires_at = Some(entry.updated_at + chrono::Duration::seconds(COMPLETION_TTL.as_secs() as i64));
        let snapshot = entry.clone();
        drop(entries);
        emit_progress(bus, &snapshot);
    }

    pub fn fail(&self, bus: &EventBus, task_id: &str, error_text: impl Into<String>) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(task_id) else {
            return;
        };
        entry.stage = Stage::Failed;
        entry.percent_complete = Stage::Failed.percent_complete();
        entry.error = Some(error_text.into());
        entry.updated_at = Utc::now();
        let snapshot = entry.clone();
        drop(entries);
        emit_progress(bus, &snapshot);
    }

    /// Snapshot of all current, non-expired entries. Expired entries are
    /// swept as a side effect.
    pub fn all(&self) -> Vec<TaskProgress> {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, e| e.expires_at.map(|exp| now < exp).unwrap_or(true));
        entries.values().cloned().collect()
    }

    pub fn get(&self, task_id: &str) -> Option<TaskProgress> {
        self.entries.lock().unwrap().get(task_id).cloned()
    }
}

fn emit_progress(bus: &EventBus, entry: &TaskProgress) {
    let payload = serde_json::json!({
        "task_id": entry.task_id,
        "task_name": entry.task_name,
        "stage": entry.stage,
        "message": entry.message,
        "percent_complete": entry.percent_complete,
        "retro": entry.retro,
        "error": entry.error,
    });
    bus.emit_typed(EventKind::TaskProgress, payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_inserts_at_five_percent() {
        let bus = EventBus::new();
        let tracker = ProgressTracker::new();
        tracker.start(&bus, "t-1", "Add login");
        let entry = tracker.get("t-1").unwrap();
        assert_eq!(entry.stage, Stage::Starting);
        assert_eq!(entry.percent_complete, 5);
    }

    #[test]
    fn percent_complete_follows_fixed_map() {
        let bus = EventBus::new();
        let tracker = ProgressTracker::new();
        tracker.start(&bus, "t-1", "name");
        tracker.update_stage(&bus, "t-1", Stage::Implementing, None);
        assert_eq!(tracker.get("t-1").unwrap().percent_complete, 60);
    }

    #[test]
    fn complete_is_terminal_at_100() {
        let bus = EventBus::new();
        let tracker = ProgressTracker::new();
        tracker.start(&bus, "t-1", "name");
        tracker.complete(&bus, "t-1", "did the thing");
        let entry = tracker.get("t-1").unwrap();
        assert_eq!(entry.percent_complete, 100);
        assert_eq!(entry.retro.as_deref(), Some("did the thing"));
    }

    #[test]
    fn fail_records_error_and_zero_percent() {
        let bus = EventBus::new();
        let tracker = ProgressTracker::new();
        tracker.start(&bus, "t-1", "name");
        tracker.update_stage(&bus, "t-1", Stage::Implementing, None);
        tracker.fail(&bus, "t-1", "boom");
        let entry = tracker.get("t-1").unwrap();
        assert_eq!(entry.percent_complete, 0);
        assert_eq!(entry.error.as_deref(), Some("boom"));
    }

    #[test]
    fn repeated_stage_update_is_idempotent() {
        let bus = EventBus::new();
        let tracker = ProgressTracker::new();
        tracker.start(&bus, "t-1", "name");
        tracker.update_stage(&bus, "t-1", Stage::Testing, None);
        tracker.update_stage(&bus, "t-1", Stage::Testing, None);
        assert_eq!(tracker.all().len(), 1);
    }
}
