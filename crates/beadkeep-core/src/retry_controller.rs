//! Bounded retry with requeueing. All state is process-local and resets
//! on restart — deliberate, per the design notes: an operator restart is
//! equivalent to re-admitting failed tasks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use crate::bead_store::BeadStore;
use crate::error::Result;

pub struct RetryController {
    max_retries: u32,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    attempts: HashMap<String, u32>,
    fifo: VecDeque<String>,
    /// Task-ids whose retry budget is exhausted (`queue_for_retry` last
    /// returned `false`). Excluded from the store's priority fallback in
    /// [`RetryController::next_task_id`] so an exhausted Bead does not
    /// get re-selected just because it is still `pending` in the store —
    /// per the design, it stays untouched until an operator clears it.
    exhausted: HashSet<String>,
}

impl RetryController {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            state: Mutex::new(State::default()),
        }
    }

    /// Increments the attempt counter. Returns `true` (and enqueues) iff
    /// the incremented count is within budget; otherwise the count stays
    /// pinned at the limit, the task is marked exhausted (see
    /// `next_task_id`), and it is not requeued.
    pub fn queue_for_retry(&self, task_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let count = state.attempts.entry(task_id.to_string()).or_insert(0);
        if *count >= self.max_retries {
            state.exhausted.insert(task_id.to_string());
            return false;
        }
        *count += 1;
        state.fifo.push_back(task_id.to_string());
        true
    }

    pub fn attempt_count(&self, task_id: &str) -> u32 {
        *self.state.lock().unwrap().attempts.get(task_id).unwrap_or(&0)
    }

    pub fn is_exhausted(&self, task_id: &str) -> bool {
        self.state.lock().unwrap().exhausted.contains(task_id)
    }

    pub fn clear(&self, task_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.attempts.remove(task_id);
        state.fifo.retain(|id| id != task_id);
        state.exhausted.remove(task_id);
    }

    /// Head of the retry FIFO if non-empty; otherwise the store's next
    /// eligible, non-locked Bead by priority, skipping any task-id whose
    /// retry budget is exhausted; otherwise `None`.
    pub fn next_task_id(&self, store: &BeadStore) -> Result<Option<String>> {
        let exhausted = {
            let mut state = self.state.lock().unwrap();
            while let Some(id) = state.fifo.pop_front() {
                if !store.is_locked(&id)? {
                    return Ok(Some(id));
                }
                // Still locked (raced with another claim); drop it from
                // this FIFO pass and keep looking.
            }
            state.exhausted.clone()
        };
        Ok(store.get_next_excluding(&exhausted)?.map(|b| b.id))
    }
}
