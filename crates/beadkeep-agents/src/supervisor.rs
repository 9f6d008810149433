//! End-to-end execution of one task by one worker: claim, spawn, stream,
//! classify, release. The supervisor is re-entrant — any number of
//! instances may call `run_once` concurrently; they cooperate solely
//! through the atomic claim and the retry controller's lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use beadkeep_core::{BeadStore, EventBus, EventKind, ProgressTracker, RetryController, Stage};

use crate::notification::NotificationSink;
use crate::registry::AgentRegistry;
use crate::worker_driver::{ExternalWorkerDriver, WaitOutcome};

/// At most this often, re-run the stage detector over recent output.
const STAGE_SAMPLE_INTERVAL: Duration = Duration::from_secs(3);
/// How many recent lines the stage detector looks at.
const STAGE_WINDOW_LINES: usize = 20;
/// Granularity of the line-reader poll loop.
const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Default wall-clock budget for one worker invocation.
pub const DEFAULT_WALL_CLOCK_TIMEOUT: Duration = Duration::from_secs(600);
/// At most this often, sample the worker's memory usage.
const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);
/// Fraction of the configured memory cap above which a sample warrants a
/// non-fatal warning log.
const MEMORY_WARN_FRACTION: f64 = 0.875;

#[derive(Debug, Clone)]
pub struct WorkerTemplate {
    pub command: String,
    /// `{workdir}` and `{prompt_file}` are substituted before spawn.
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

pub struct SupervisorConfig {
    pub workdir: PathBuf,
    pub worker: WorkerTemplate,
    pub memory_limit_gb: u64,
    pub timeout_minutes: i64,
    pub wall_clock_timeout: Duration,
    /// Rendered with `{name}` and `{description}` substituted; the result
    /// is written to a temporary file the worker template can reference
    /// via `{prompt_file}`.
    pub prompt_template: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            worker: WorkerTemplate {
                command: "echo".to_string(),
                args: vec!["no worker configured".to_string()],
                env: Vec::new(),
            },
            memory_limit_gb: 4,
            timeout_minutes: 30,
            wall_clock_timeout: DEFAULT_WALL_CLOCK_TIMEOUT,
            prompt_template: "Task: {name}\n\n{description}".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Idle,
    Completed { task_id: String },
    Failed { task_id: String, reason: String },
}

pub struct AgentSupervisor {
    store: Arc<BeadStore>,
    bus: Arc<EventBus>,
    tracker: Arc<ProgressTracker>,
    registry: Arc<AgentRegistry>,
    retry: Arc<RetryController>,
    notifier: Arc<NotificationSink>,
    driver: ExternalWorkerDriver,
    config: SupervisorConfig,
}

impl AgentSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<BeadStore>,
        bus: Arc<EventBus>,
        tracker: Arc<ProgressTracker>,
        registry: Arc<AgentRegistry>,
        retry: Arc<RetryController>,
        notifier: Arc<NotificationSink>,
        config: SupervisorConfig,
    ) -> Self {
        let driver = ExternalWorkerDriver::new(config.memory_limit_gb);
        Self {
            store,
            bus,
            tracker,
            registry,
            retry,
            notifier,
            driver,
            config,
        }
    }

    /// Drives exactly one task to a terminal outcome, or returns `Idle`
    /// when there is nothing eligible to claim.
    pub fn run_once(&self) -> Outcome {
        let Ok(Some(task_id)) = self.retry.next_task_id(&self.store) else {
            return Outcome::Idle;
        };

        let Ok(Some(bead)) = self.store.load(&task_id) else {
            return Outcome::Idle;
        };

        let agent_id = format!("agent-{}", Uuid::new_v4());

        let claimed = self
            .store
            .claim(&task_id, &agent_id, self.config.timeout_minutes);
        let Ok(Some(_lock_token)) = claimed else {
            debug!(task_id = %task_id, "claim lost the race, returning idle");
            return Outcome::Idle;
        };

        info!(task_id = %task_id, agent_id = %agent_id, "claimed task");
        self.tracker.start(&self.bus, &task_id, &bead.name);

        let prompt_path = match self.write_prompt_file(&bead) {
            Ok(path) => path,
            Err(e) => {
                return self.terminal_failure(&task_id, &agent_id, &bead.name, &e.to_string());
            }
        };

        let outcome = self.execute(&task_id, &agent_id, &bead.name, &prompt_path);

        let _ = std::fs::remove_file(&prompt_path);
        outcome
    }

    fn write_prompt_file(&self, bead: &beadkeep_core::Bead) -> std::io::Result<PathBuf> {
        let rendered = self
            .config
            .prompt_template
            .replace("{name}", &bead.name)
            .replace("{description}", &bead.description);
        let path = std::env::temp_dir().join(format!("beadkeep-prompt-{}.txt", Uuid::new_v4()));
        std::fs::write(&path, rendered)?;
        Ok(path)
    }

    fn execute(
        &self,
        task_id: &str,
        agent_id: &str,
        task_name: &str,
        prompt_path: &PathBuf,
    ) -> Outcome {
        let args: Vec<String> = self
            .config
            .worker
            .args
            .iter()
            .map(|a| {
                a.replace("{workdir}", &self.config.workdir.display().to_string())
                    .replace("{prompt_file}", &prompt_path.display().to_string())
            })
            .collect();

        let handle = match self.driver.spawn(
            &self.config.worker.command,
            &args,
            &self.config.workdir,
            &self.config.worker.env,
        ) {
            Ok(h) => h,
            Err(e) => {
                return self.terminal_failure(task_id, agent_id, "worker_launch_error", &e.to_string());
            }
        };

        self.registry.register(agent_id, handle.pid(), task_id);

        let mut rolling_buffer: Vec<String> = Vec::new();
        let mut last_stage: Option<Stage> = None;
        let mut last_stage_check = Instant::now();
        let mut last_memory_check = Instant::now();
        let start = Instant::now();
        let deadline = start + self.config.wall_clock_timeout;
        let mut timed_out = false;

        loop {
            if Instant::now() >= deadline {
                timed_out = true;
                break;
            }

            if last_memory_check.elapsed() >= MEMORY_SAMPLE_INTERVAL {
                last_memory_check = Instant::now();
                let cap_bytes = self.config.memory_limit_gb.saturating_mul(1024 * 1024 * 1024);
                if let Some(fraction) = sample_memory_fraction(handle.pid(), cap_bytes) {
                    if fraction >= MEMORY_WARN_FRACTION {
                        warn!(
                            agent_id = %agent_id,
                            task_id = %task_id,
                            fraction = fraction,
                            cap_gb = self.config.memory_limit_gb,
                            "worker memory usage above warning threshold"
                        );
                    }
                }
            }

            match handle.lines.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    rolling_buffer.push(line.clone());
                    self.registry.update_heartbeat(agent_id);
                    self.bus.emit_typed(
                        EventKind::ClaudeOutput,
                        serde_json::json!({
                            "agent_id": agent_id,
                            "task_id": task_id,
                            "line": line,
                            "timestamp": chrono::Utc::now(),
                        }),
                    );

                    if last_stage_check.elapsed() >= STAGE_SAMPLE_INTERVAL {
                        last_stage_check = Instant::now();
                        let window = rolling_buffer
                            .iter()
                            .rev()
                            .take(STAGE_WINDOW_LINES)
                            .cloned()
                            .collect::<Vec<_>>()
                            .join("\n");
                        if let Some(stage) = beadkeep_core::detect_stage(&window) {
                            if Some(stage) != last_stage {
                                last_stage = Some(stage);
                                self.tracker
                                    .update_stage(&self.bus, task_id, stage, None);
                            }
                        }
                    }
                }
                Err(flume::RecvTimeoutError::Timeout) => continue,
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }
        }

        let wait_result = if timed_out {
            handle.kill();
            WaitOutcome::TimedOut
        } else {
            let remaining = deadline.saturating_duration_since(Instant::now());
            handle.wait(remaining.max(Duration::from_millis(1)))
        };

        self.registry.unregister(agent_id);

        match wait_result {
            WaitOutcome::Exited { success: true, .. } => {
                let retro = compose_retro(&rolling_buffer);
                self.tracker.complete(&self.bus, task_id, retro.clone());
                let _ = self.store.complete(task_id, agent_id);
                self.retry.clear(task_id);
                self.notifier.notify(task_name, "passing", &retro);
                self.bus.emit_typed(
                    EventKind::BoardUpdate,
                    serde_json::json!({ "task_id": task_id, "status": "passing" }),
                );
                self.bus.emit_typed(
                    EventKind::ClaudeDone,
                    serde_json::json!({ "agent_id": agent_id, "task_id": task_id, "exit_code": 0 }),
                );
                Outcome::Completed {
                    task_id: task_id.to_string(),
                }
            }
            WaitOutcome::Exited { success: false, code } => {
                let reason = format!("worker exited with code {code:?}");
                self.finish_failure(task_id, agent_id, task_name, &reason)
            }
            WaitOutcome::TimedOut => self.finish_failure(task_id, agent_id, task_name, "timeout"),
        }
    }

    fn finish_failure(
        &self,
        task_id: &str,
        agent_id: &str,
        task_name: &str,
        reason: &str,
    ) -> Outcome {
        self.tracker.fail(&self.bus, task_id, reason);
        let _ = self.store.release(task_id, agent_id);
        if !self.retry.queue_for_retry(task_id) {
            warn!(task_id = %task_id, "retries exhausted, bead stays pending until an operator clears it");
        }
        self.notifier.notify(task_name, "failed", reason);
        self.bus.emit_typed(
            EventKind::ClaudeError,
            serde_json::json!({ "agent_id": agent_id, "task_id": task_id, "reason": reason }),
        );
        Outcome::Failed {
            task_id: task_id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Used for failures that happen before a worker is even spawned
    /// (e.g. the prompt file could not be written).
    fn terminal_failure(
        &self,
        task_id: &str,
        agent_id: &str,
        task_name: &str,
        reason: &str,
    ) -> Outcome {
        warn!(task_id = %task_id, reason = %reason, "task failed before worker spawn");
        self.finish_failure(task_id, agent_id, task_name, reason)
    }
}

/// Best-effort fraction of `cap_bytes` the worker's address space
/// currently occupies, read from `/proc/<pid>/statm` (first field, in
/// pages). Returns `None` when the cap is zero, the process has already
/// exited, or the platform has no `/proc` (matches the `#[cfg(unix)]`
/// best-effort posture `worker_driver`'s memory cap already takes).
#[cfg(target_os = "linux")]
fn sample_memory_fraction(pid: u32, cap_bytes: u64) -> Option<f64> {
    if cap_bytes == 0 {
        return None;
    }
    let text = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let pages: u64 = text.split_whitespace().next()?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    let bytes = pages.saturating_mul(page_size as u64);
    Some(bytes as f64 / cap_bytes as f64)
}

#[cfg(not(target_os = "linux"))]
fn sample_memory_fraction(_pid: u32, _cap_bytes: u64) -> Option<f64> {
    None
}

/// Heuristic two-sentence retro based on keyword presence in the
/// worker's output, matching the supplemented behavior carried over from
/// the original source's retro composer.
fn compose_retro(lines: &[String]) -> String {
    let joined = lines.join(" ").to_lowercase();
    let mut hits = Vec::new();
    if joined.contains("created") {
        hits.push("created new code");
    }
    if joined.contains("fixed") {
        hits.push("fixed an issue");
    }
    if joined.contains("test") {
        hits.push("touched tests");
    }
    if joined.contains("passing") {
        hits.push("tests passing");
    }
    if joined.contains("error") {
        hits.push("encountered an error along the way");
    }

    let first = if hits.is_empty() {
        "Completed the task.".to_string()
    } else {
        format!("Completed the task: {}.", hits.join(", "))
    };
    let second = format!("{} lines of output were produced.", lines.len());
    format!("{first} {second}")
}
