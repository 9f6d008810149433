//! Opaque command-template invoker. Spawns a configured executable with a
//! configured argument template, streams merged stdout/stderr line by
//! line to a bounded channel, and exposes `kill()` / `wait(timeout)`. A
//! best-effort pre-exec hook installs a per-process address-space cap on
//! platforms that support `setrlimit`.
//!
//! The merged-stream behavior is built from two reader threads (one per
//! pipe) funneling into one channel rather than a pseudo-terminal, since
//! the worker contract only needs line-oriented output, not an
//! interactive terminal.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of [`WorkerHandle::wait`].
#[derive(Debug, Clone, Copy)]
pub enum WaitOutcome {
    Exited { success: bool, code: Option<i32> },
    TimedOut,
}

pub struct ExternalWorkerDriver {
    memory_limit_gb: u64,
}

impl ExternalWorkerDriver {
    pub fn new(memory_limit_gb: u64) -> Self {
        Self { memory_limit_gb }
    }

    /// Spawns `command` with `args` in `workdir`, merging stdout/stderr
    /// into one line stream. `env` overrides/adds to the inherited
    /// environment.
    pub fn spawn(
        &self,
        command: &str,
        args: &[String],
        workdir: &Path,
        env: &[(String, String)],
    ) -> Result<WorkerHandle, DriverError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());
        for (k, v) in env {
            cmd.env(k, v);
        }

        install_memory_cap(&mut cmd, self.memory_limit_gb);

        let mut child = cmd
            .spawn()
            .map_err(|e| DriverError::SpawnFailed(e.to_string()))?;
        let pid = child.id();

        let (tx, rx) = flume::bounded::<String>(1024);

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let tx_out = tx.clone();
        let out_thread = std::thread::spawn(move || {
            pump_lines(stdout, tx_out);
        });
        let tx_err = tx;
        let err_thread = std::thread::spawn(move || {
            pump_lines(stderr, tx_err);
        });

        Ok(WorkerHandle {
            child: Arc::new(Mutex::new(child)),
            lines: rx,
            pid,
            _readers: vec![out_thread, err_thread],
        })
    }
}

fn pump_lines<R: std::io::Read>(reader: R, tx: flume::Sender<String>) {
    let buf = BufReader::new(reader);
    for line in buf.lines() {
        match line {
            Ok(text) => {
                if tx.send(text).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "worker output stream ended");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn install_memory_cap(cmd: &mut Command, memory_limit_gb: u64) {
    use std::os::unix::process::CommandExt;

    let limit_bytes = memory_limit_gb.saturating_mul(1024 * 1024 * 1024);
    unsafe {
        cmd.pre_exec(move || {
            let rlim = libc::rlimit {
                rlim_cur: limit_bytes as libc::rlim_t,
                rlim_max: limit_bytes as libc::rlim_t,
            };
            // Best-effort: a nonzero return here just means the host
            // does not support the cap; we still want to exec the child.
            libc::setrlimit(libc::RLIMIT_AS, &rlim);
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn install_memory_cap(_cmd: &mut Command, _memory_limit_gb: u64) {}

/// A running (or just-exited) worker process.
pub struct WorkerHandle {
    child: Arc<Mutex<Child>>,
    /// Merged stdout/stderr lines. Iterating (or repeatedly calling
    /// `recv`/`try_recv`) yields an implicit EOF once the process exits
    /// and both reader threads drop their sender halves.
    pub lines: flume::Receiver<String>,
    pid: u32,
    _readers: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Sends a hard-kill signal. Absent/already-exited processes are
    /// logged and ignored, not treated as an error.
    pub fn kill(&self) {
        let mut child = self.child.lock().unwrap();
        if let Err(e) = child.kill() {
            warn!(pid = self.pid, error = %e, "kill failed (process likely already exited)");
        }
        let _ = child.wait();
    }

    /// Blocks up to `timeout` for the child to exit.
    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            {
                let mut child = self.child.lock().unwrap();
                if let Ok(Some(status)) = child.try_wait() {
                    return WaitOutcome::Exited {
                        success: status.success(),
                        code: status.code(),
                    };
                }
            }
            if std::time::Instant::now() >= deadline {
                return WaitOutcome::TimedOut;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}
