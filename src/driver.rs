//! Lifecycle and retry driver shared by every subscription flavor.
//!
//! A subscription owns exactly one worker task. `start()` spawns it if none
//! is running, `stop()` signals termination and joins the worker with a
//! bounded timeout, `is_running()` reflects the flag rather than task
//! liveness. The worker runs the flavor's session (connect, subscribe, inner
//! poll loop) in an outer loop that recreates the client handles after every
//! intermittent failure, backing off exponentially, and stops on the first
//! fatal one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RetryBackoff;
use crate::error::Result;

/// One run of a flavor's connect-and-consume session.
///
/// A session creates its own client handles, so returning an intermittent
/// error drops them and the next attempt starts from a factory-fresh set.
/// Returning `Ok(())` means the stop flag was observed and the session wound
/// down cleanly.
#[async_trait]
pub(crate) trait SubscriptionTask: Send + 'static {
    async fn session(&mut self, ctx: &SessionContext) -> Result<()>;
}

/// Control surface handed to a session: the stop flag and a progress epoch.
#[derive(Clone)]
pub(crate) struct SessionContext {
    running: Arc<AtomicBool>,
    progress: Arc<AtomicU64>,
}

impl SessionContext {
    pub(crate) fn should_stop(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    /// Record that the inner loop completed a unit of work. The driver resets
    /// its reconnect attempt counter whenever the epoch advanced during a
    /// session, so only consecutive failures count against the bound.
    pub(crate) fn mark_progress(&self) {
        self.progress.fetch_add(1, Ordering::SeqCst);
    }

    fn epoch(&self) -> u64 {
        self.progress.load(Ordering::SeqCst)
    }
}

/// Shared lifecycle state behind every subscription's public API.
pub struct SubscriptionHandle {
    name: String,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stop_timeout: Duration,
    backoff: RetryBackoff,
}

impl SubscriptionHandle {
    pub(crate) fn new(name: impl Into<String>, stop_timeout: Duration, backoff: RetryBackoff) -> Self {
        Self {
            name: name.into(),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            stop_timeout,
            backoff,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the worker if none is running. Idempotent while running.
    pub(crate) fn launch<T: SubscriptionTask>(&self, task: T) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if self.running.swap(true, Ordering::SeqCst) {
            debug!(subscription = %self.name, "already running, start() is a no-op");
            return;
        }
        let name = self.name.clone();
        let running = Arc::clone(&self.running);
        let backoff = self.backoff;
        *worker = Some(tokio::spawn(drive(name, task, running, backoff)));
    }

    /// Signal termination and join the worker. If the worker does not exit
    /// within the stop timeout it is abandoned, not killed.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = {
            let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            worker.take()
        };
        let Some(handle) = handle else {
            return;
        };
        match tokio::time::timeout(self.stop_timeout, handle).await {
            Ok(_) => debug!(subscription = %self.name, "worker stopped"),
            Err(_) => warn!(
                subscription = %self.name,
                timeout_ms = self.stop_timeout.as_millis() as u64,
                "worker did not exit within stop timeout, abandoning it"
            ),
        }
    }
}

async fn drive<T: SubscriptionTask>(
    name: String,
    mut task: T,
    running: Arc<AtomicBool>,
    backoff: RetryBackoff,
) {
    let ctx = SessionContext {
        running: Arc::clone(&running),
        progress: Arc::new(AtomicU64::new(0)),
    };
    let mut attempts: u32 = 0;

    while running.load(Ordering::SeqCst) {
        let epoch_before = ctx.epoch();
        match task.session(&ctx).await {
            Ok(()) => break,
            Err(e) if e.is_intermittent() => {
                if ctx.epoch() > epoch_before {
                    attempts = 0;
                }
                attempts += 1;
                let delay = backoff.delay(attempts - 1);
                warn!(
                    subscription = %name,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "intermittent failure, recreating client handles"
                );
                interruptible_sleep(delay, &running).await;
            }
            Err(e) => {
                error!(subscription = %name, error = %e, "fatal error, stopping subscription");
                break;
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    info!(subscription = %name, "worker exited");
}

/// Sleep in slices so a `stop()` during backoff is observed promptly.
async fn interruptible_sleep(total: Duration, running: &AtomicBool) {
    const SLICE: Duration = Duration::from_millis(50);
    let mut remaining = total;
    while !remaining.is_zero() && running.load(Ordering::SeqCst) {
        let slice = remaining.min(SLICE);
        tokio::time::sleep(slice).await;
        remaining = remaining.saturating_sub(slice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SubscriptionError;
    use std::sync::atomic::AtomicU32;

    struct CountingTask {
        sessions: Arc<AtomicU32>,
        outcome: fn(u32) -> Result<()>,
    }

    #[async_trait]
    impl SubscriptionTask for CountingTask {
        async fn session(&mut self, ctx: &SessionContext) -> Result<()> {
            let n = self.sessions.fetch_add(1, Ordering::SeqCst);
            loop {
                if ctx.should_stop() {
                    return Ok(());
                }
                match (self.outcome)(n) {
                    Ok(()) => tokio::time::sleep(Duration::from_millis(5)).await,
                    Err(e) => return Err(e),
                }
            }
        }
    }

    fn handle() -> SubscriptionHandle {
        SubscriptionHandle::new(
            "test",
            Duration::from_secs(1),
            RetryBackoff {
                base: Duration::from_millis(1),
                max: Duration::from_millis(2),
            },
        )
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_joins() {
        let handle = handle();
        let sessions = Arc::new(AtomicU32::new(0));
        handle.launch(CountingTask {
            sessions: Arc::clone(&sessions),
            outcome: |_| Ok(()),
        });
        assert!(handle.is_running());
        // Second launch while running must not spawn a second worker.
        handle.launch(CountingTask {
            sessions: Arc::clone(&sessions),
            outcome: |_| Ok(()),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop().await;
        assert!(!handle.is_running());
        assert_eq!(sessions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn intermittent_failures_recreate_the_session() {
        let handle = handle();
        let sessions = Arc::new(AtomicU32::new(0));
        // First two sessions fail intermittently, the third runs until stop.
        handle.launch(CountingTask {
            sessions: Arc::clone(&sessions),
            outcome: |n| {
                if n < 2 {
                    Err(SubscriptionError::intermittent("blip"))
                } else {
                    Ok(())
                }
            },
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_running());
        handle.stop().await;
        assert!(sessions.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn fatal_failure_stops_the_subscription() {
        let handle = handle();
        let sessions = Arc::new(AtomicU32::new(0));
        handle.launch(CountingTask {
            sessions: Arc::clone(&sessions),
            outcome: |_| Err(SubscriptionError::fatal("programming error")),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_running());
        assert_eq!(sessions.load(Ordering::SeqCst), 1);
        handle.stop().await;
    }
}
