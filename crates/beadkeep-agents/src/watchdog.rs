//! Periodic sweep that bounds worker aliveness to bounded output latency.
//! Stateless between sweeps beyond the registry itself — a fresh
//! `Watchdog` can be constructed per process and its `sweep` called on
//! any cadence; the "runs exactly once per lifetime" property belongs to
//! the caller's loop, not to this type.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use beadkeep_core::{BeadStore, EventBus, EventKind, RetryController};

use crate::notification::NotificationSink;
use crate::registry::AgentRegistry;

pub const DEFAULT_STALL: Duration = Duration::from_secs(300);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Watchdog {
    registry: Arc<AgentRegistry>,
    store: Arc<BeadStore>,
    retry: Arc<RetryController>,
    notifier: Arc<NotificationSink>,
    bus: Arc<EventBus>,
    stall: Duration,
}

impl Watchdog {
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<BeadStore>,
        retry: Arc<RetryController>,
        notifier: Arc<NotificationSink>,
        bus: Arc<EventBus>,
        stall: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            retry,
            notifier,
            bus,
            stall,
        }
    }

    /// One sweep of the registry. Returns the agent-ids it killed.
    pub fn sweep(&self) -> Vec<String> {
        let now = Utc::now();
        let mut killed = Vec::new();

        for agent in self.registry.list() {
            let idle = now.signed_duration_since(agent.last_heartbeat);
            if idle.num_seconds() < self.stall.as_secs() as i64 {
                continue;
            }

            warn!(
                agent_id = %agent.agent_id,
                task_id = %agent.task_id,
                idle_secs = idle.num_seconds(),
                "watchdog killing stalled worker"
            );
            kill_pid(agent.pid);

            let _ = self.store.release(&agent.task_id, &agent.agent_id);
            if !self.retry.queue_for_retry(&agent.task_id) {
                warn!(task_id = %agent.task_id, "retries exhausted, bead stays pending until an operator clears it");
            }
            self.notifier.notify(&agent.task_id, "failed", "stalled: no output within stall threshold");
            self.bus.emit_typed(
                EventKind::ClaudeError,
                serde_json::json!({
                    "agent_id": agent.agent_id,
                    "task_id": agent.task_id,
                    "reason": "stall",
                }),
            );
            self.registry.unregister(&agent.agent_id);
            killed.push(agent.agent_id);
        }

        if !killed.is_empty() {
            info!(count = killed.len(), "watchdog sweep killed stalled workers");
        }
        killed
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_pid(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use beadkeep_core::git_runner::test_support::FakeGitRunner;
    use beadkeep_core::git_runner::GitRunner;
    use beadkeep_core::{Bead, BeadStatus};
    use std::path::Path;

    struct ArcGitRunner(Arc<FakeGitRunner>);
    impl GitRunner for ArcGitRunner {
        fn run_git(
            &self,
            dir: &Path,
            args: &[&str],
        ) -> std::result::Result<beadkeep_core::git_runner::GitOutput, String> {
            self.0.run_git(dir, args)
        }
    }

    fn store(dir: &Path) -> Arc<BeadStore> {
        let fake = Arc::new(FakeGitRunner::new());
        Arc::new(BeadStore::with_git_runner(dir, Box::new(ArcGitRunner(fake)), true).unwrap())
    }

    /// Spawns a disposable, harmless child so the sweep has a real pid to
    /// signal without touching the test process itself.
    fn spawn_disposable_child() -> std::process::Child {
        std::process::Command::new("sleep")
            .arg("60")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .expect("failed to spawn disposable child")
    }

    #[test]
    fn sweep_ignores_fresh_heartbeats() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let mut child = spawn_disposable_child();
        let registry = Arc::new(AgentRegistry::new());
        registry.register("agent-1", child.id(), "t-1");

        let wd = Watchdog::new(
            registry,
            store,
            Arc::new(RetryController::new(3)),
            Arc::new(NotificationSink::new(None)),
            Arc::new(EventBus::new()),
            Duration::from_secs(300),
        );
        assert!(wd.sweep().is_empty());
        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn sweep_kills_and_requeues_stalled_agent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let mut bead = Bead::new("t-003", "Stall me", 1);
        store.save(&mut bead, None).unwrap();
        store.claim("t-003", "agent-1", 30).unwrap();

        let mut child = spawn_disposable_child();
        let registry = Arc::new(AgentRegistry::new());
        registry.register("agent-1", child.id(), "t-003");

        let retry = Arc::new(RetryController::new(3));
        let wd = Watchdog::new(
            registry.clone(),
            store.clone(),
            retry.clone(),
            Arc::new(NotificationSink::new(None)),
            Arc::new(EventBus::new()),
            Duration::from_secs(0),
        );

        std::thread::sleep(Duration::from_millis(5));
        let killed = wd.sweep();
        assert_eq!(killed, vec!["agent-1".to_string()]);
        assert_eq!(retry.attempt_count("t-003"), 1);
        assert!(registry.get("agent-1").is_none());

        let loaded = store.load("t-003").unwrap().unwrap();
        assert_eq!(loaded.status, BeadStatus::Pending);

        let _ = child.wait();
    }
}
