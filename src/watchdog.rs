// Warden — event-loop watchdog.
// A cooperative task bumps a shared monotonic heartbeat every 5 seconds; an
// independent OS thread checks it every 5 seconds. If the scheduler is starved
// past 30 seconds the sentinel audits a CRITICAL entry and sends the process
// its termination signal so the supervisor restarts it. The sentinel must
// never depend on the cooperative scheduler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::audit::{AuditLog, Severity};

const CHECK_INTERVAL: Duration = Duration::from_secs(5);
const BLOCK_THRESHOLD_SECS: u64 = 30;

pub struct Watchdog {
    origin: Instant,
    // Seconds since `origin` at the last heartbeat.
    heartbeat: AtomicU64,
    running: AtomicBool,
    audit: Arc<AuditLog>,
}

impl Watchdog {
    pub fn new(audit: Arc<AuditLog>) -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            heartbeat: AtomicU64::new(0),
            running: AtomicBool::new(false),
            audit,
        })
    }

    pub fn record_heartbeat(&self) {
        self.heartbeat
            .store(self.origin.elapsed().as_secs(), Ordering::Relaxed);
    }

    fn staleness_secs(&self) -> u64 {
        self.origin
            .elapsed()
            .as_secs()
            .saturating_sub(self.heartbeat.load(Ordering::Relaxed))
    }

    /// Start the sentinel on a plain OS thread.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.record_heartbeat();
        let watchdog = Arc::clone(self);
        std::thread::Builder::new()
            .name("watchdog-sentinel".into())
            .spawn(move || watchdog.sentinel_loop())
            .expect("failed to spawn watchdog thread");
        tracing::info!("watchdog: started (threshold={}s)", BLOCK_THRESHOLD_SECS);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn sentinel_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            std::thread::sleep(CHECK_INTERVAL);
            let stale = self.staleness_secs();
            if stale > BLOCK_THRESHOLD_SECS {
                tracing::error!(
                    "watchdog: event loop starved for {}s (threshold={}s) — signalling restart",
                    stale,
                    BLOCK_THRESHOLD_SECS
                );
                self.audit.log_event(
                    "EVENT_LOOP_STARVED",
                    serde_json::json!({
                        "stalled_secs": stale,
                        "threshold_secs": BLOCK_THRESHOLD_SECS,
                    }),
                    Severity::Critical,
                    None,
                );
                terminate_self();
                return;
            }
        }
    }

    /// The cooperative half: a task that keeps the heartbeat fresh while the
    /// scheduler is healthy.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let watchdog = Arc::clone(self);
        tokio::spawn(async move {
            while watchdog.running.load(Ordering::SeqCst) {
                watchdog.record_heartbeat();
                tokio::time::sleep(CHECK_INTERVAL).await;
            }
        })
    }
}

#[cfg(unix)]
fn terminate_self() {
    unsafe {
        libc::raise(libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_self() {
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_resets_staleness() {
        let tmp = tempfile::tempdir().unwrap();
        let watchdog = Watchdog::new(Arc::new(AuditLog::new(tmp.path())));
        watchdog.record_heartbeat();
        assert!(watchdog.staleness_secs() <= 1);
    }
}
