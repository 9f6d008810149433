//! Cooperative shutdown coordination for the native supervisor/watchdog
//! threads. Trimmed from the broadcast-channel coordinator this lineage
//! uses elsewhere down to a flag plus a condvar — the orchestrator has no
//! multi-phase drain protocol to confirm, only a handful of blocking
//! threads to wake promptly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Clone)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    pair: Arc<(Mutex<()>, Condvar)>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            pair: Arc::new((Mutex::new(()), Condvar::new())),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let (_, cvar) = &*self.pair;
        cvar.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleeps up to `timeout`, waking early if shutdown is triggered in
    /// the meantime. Worker loops use this instead of a bare `sleep` so
    /// shutdown is prompt rather than bounded by the longest poll.
    pub fn wait_timeout(&self, timeout: Duration) {
        if self.is_shutting_down() {
            return;
        }
        let (lock, cvar) = &*self.pair;
        let guard = lock.lock().unwrap();
        let _ = cvar.wait_timeout_while(guard, timeout, |_| !self.is_shutting_down());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn new_signal_is_not_shutting_down() {
        assert!(!ShutdownSignal::new().is_shutting_down());
    }

    #[test]
    fn trigger_sets_flag() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        assert!(signal.is_shutting_down());
    }

    #[test]
    fn wait_timeout_returns_early_on_trigger() {
        let signal = ShutdownSignal::new();
        let signal2 = signal.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            signal2.trigger();
        });
        let start = Instant::now();
        signal.wait_timeout(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_timeout_elapses_when_never_triggered() {
        let signal = ShutdownSignal::new();
        let start = Instant::now();
        signal.wait_timeout(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
