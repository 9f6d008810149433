//! Wires the core and agents crates into a runnable process: loads
//! configuration, constructs the dependency graph once, and drives
//! supervisor and watchdog loops on native threads until asked to stop.
//! Mirrors this lineage's `Daemon` shape (config + shared state +
//! intervals + a shutdown handle) with the HTTP/API surface removed —
//! that surface is this orchestrator's explicit non-goal.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use beadkeep_agents::{
    AgentRegistry, AgentSupervisor, NotificationSink, SupervisorConfig as AgentSupervisorConfig,
    Watchdog, WorkerTemplate,
};
use beadkeep_core::{BeadStore, Config, EventBus, ProgressTracker, RetryController};

use crate::shutdown::ShutdownSignal;

/// How often an idle supervisor re-polls for work, and how often the
/// watchdog sweeps the registry.
#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    pub idle_poll: Duration,
    pub watchdog_sweep: Duration,
}

impl Default for DaemonIntervals {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_secs(2),
            watchdog_sweep: beadkeep_agents::watchdog::DEFAULT_SWEEP_INTERVAL,
        }
    }
}

pub struct Daemon {
    config: Config,
    store: Arc<BeadStore>,
    bus: Arc<EventBus>,
    tracker: Arc<ProgressTracker>,
    registry: Arc<AgentRegistry>,
    retry: Arc<RetryController>,
    notifier: Arc<NotificationSink>,
    intervals: DaemonIntervals,
    shutdown: ShutdownSignal,
}

impl Daemon {
    pub fn new(config: Config) -> crate::error::Result<Self> {
        let store = Arc::new(BeadStore::new(config.repo.path.clone())?);
        Ok(Self {
            bus: Arc::new(EventBus::new()),
            tracker: Arc::new(ProgressTracker::new()),
            registry: Arc::new(AgentRegistry::new()),
            retry: Arc::new(RetryController::new(config.retry.max_retries)),
            notifier: Arc::new(NotificationSink::new(config.notification.webhook_url.clone())),
            store,
            config,
            intervals: DaemonIntervals::default(),
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn agent_supervisor_config(&self) -> AgentSupervisorConfig {
        AgentSupervisorConfig {
            workdir: self.config.repo.path.clone(),
            worker: WorkerTemplate {
                command: self.config.worker.command.clone(),
                args: self.config.worker.args.clone(),
                env: Vec::new(),
            },
            memory_limit_gb: self.config.worker.memory_limit_gb,
            timeout_minutes: self.config.worker.timeout_minutes as i64,
            wall_clock_timeout: Duration::from_secs(self.config.worker.timeout_minutes * 60),
            prompt_template: "Task: {name}\n\n{description}".to_string(),
        }
    }

    fn build_supervisor(&self) -> AgentSupervisor {
        AgentSupervisor::new(
            self.store.clone(),
            self.bus.clone(),
            self.tracker.clone(),
            self.registry.clone(),
            self.retry.clone(),
            self.notifier.clone(),
            self.agent_supervisor_config(),
        )
    }

    fn build_watchdog(&self) -> Watchdog {
        Watchdog::new(
            self.registry.clone(),
            self.store.clone(),
            self.retry.clone(),
            self.notifier.clone(),
            self.bus.clone(),
            Duration::from_secs(self.config.watchdog.stall_seconds),
        )
    }

    /// Runs a single supervisor claim-through-terminal-outcome cycle and
    /// returns, whether or not there was work to do. Used by `--once`.
    pub fn run_once(&self) -> beadkeep_agents::Outcome {
        self.build_supervisor().run_once()
    }

    /// Blocking daemon loop: spawns one thread per configured supervisor
    /// concurrency slot plus one watchdog sweep thread, and joins all of
    /// them once `shutdown` is triggered.
    pub fn run(&self) {
        info!(
            concurrency = self.config.supervisor.concurrency,
            stall_seconds = self.config.watchdog.stall_seconds,
            "daemon starting"
        );

        let mut handles = Vec::new();

        for worker_index in 0..self.config.supervisor.concurrency.max(1) {
            let supervisor = self.build_supervisor();
            let shutdown = self.shutdown.clone();
            let idle_poll = self.intervals.idle_poll;
            handles.push(std::thread::spawn(move || {
                while !shutdown.is_shutting_down() {
                    match supervisor.run_once() {
                        beadkeep_agents::Outcome::Idle => shutdown.wait_timeout(idle_poll),
                        beadkeep_agents::Outcome::Completed { task_id } => {
                            info!(worker_index, task_id = %task_id, "task completed");
                        }
                        beadkeep_agents::Outcome::Failed { task_id, reason } => {
                            warn!(worker_index, task_id = %task_id, reason = %reason, "task failed");
                        }
                    }
                }
            }));
        }

        {
            let watchdog = self.build_watchdog();
            let shutdown = self.shutdown.clone();
            let sweep_interval = self.intervals.watchdog_sweep;
            handles.push(std::thread::spawn(move || {
                while !shutdown.is_shutting_down() {
                    watchdog.sweep();
                    shutdown.wait_timeout(sweep_interval);
                }
            }));
        }

        for handle in handles {
            let _ = handle.join();
        }
        info!("daemon stopped");
    }
}
