//! Stall watchdog.
//!
//! Runs off the hot path and watches two things: resident memory against the
//! configured ceiling, and liveness of the consensus loop via a heartbeat.
//! On violation it invokes the shutdown delegate and then the
//! platform-specific restart primitive (a re-exec of the current binary on
//! unix).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// How often checks run.
const CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// How long the consensus loop may go silent before being declared stalled.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(300);

/// Watchdog configuration.
#[derive(Clone, Debug, Default)]
pub struct StallConfig {
    /// Resident-memory ceiling in MiB. Zero disables the memory check.
    pub max_memory_mb: u64,
}

/// Callbacks invoked on a violation, before the restart attempt.
pub struct Delegate {
    pub prepare_shutdown: Box<dyn Fn(&str) + Send + Sync>,
}

impl Default for Delegate {
    fn default() -> Self {
        Delegate {
            prepare_shutdown: Box::new(|reason| {
                tracing::error!(target: "node", %reason, "Shutting down node...");
            }),
        }
    }
}

/// The watchdog itself.
pub struct StallDetector {
    config: StallConfig,
    delegate: Delegate,
    heartbeat: Mutex<Instant>,
    shutdown: CancellationToken,
}

impl StallDetector {
    pub fn new(config: StallConfig, delegate: Delegate) -> Arc<Self> {
        Arc::new(StallDetector {
            config,
            delegate,
            heartbeat: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Record liveness; called by the consensus and sync loops.
    pub fn heartbeat(&self) {
        *self.heartbeat.lock() = Instant::now();
    }

    /// Stop the watchdog loop.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// The watchdog loop. Spawned once at node start.
    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(CHECK_INTERVAL) => {}
            }

            if let Some(violation) = self.check() {
                (self.delegate.prepare_shutdown)(&violation);
                if let Err(e) = self.try_restart() {
                    tracing::error!(target: "node", error = %e, "restart failed");
                }
                return;
            }
        }
    }

    fn check(&self) -> Option<String> {
        if self.config.max_memory_mb > 0 {
            if let Some(rss_mb) = resident_memory_mb() {
                if rss_mb > self.config.max_memory_mb {
                    return Some(format!(
                        "resident memory {rss_mb} MiB exceeds limit {} MiB",
                        self.config.max_memory_mb
                    ));
                }
            }
        }

        let silent_for = self.heartbeat.lock().elapsed();
        if silent_for > LIVENESS_TIMEOUT {
            return Some(format!(
                "consensus loop silent for {}s",
                silent_for.as_secs()
            ));
        }

        None
    }

    /// Restart the current process in place. On unix this replaces the
    /// process image; elsewhere a fresh process is spawned and this one
    /// exits.
    pub fn try_restart(&self) -> std::io::Result<()> {
        let exe = std::env::current_exe()?;
        let args: Vec<String> = std::env::args().skip(1).collect();

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // exec only returns on failure.
            Err(std::process::Command::new(exe).args(args).exec())
        }

        #[cfg(not(unix))]
        {
            std::process::Command::new(exe).args(args).spawn()?;
            std::process::exit(1);
        }
    }
}

/// Resident set size in MiB, read from /proc on linux.
fn resident_memory_mb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb / 1024);
        }
    }
    None
}
