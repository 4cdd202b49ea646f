//! Periodic task scheduler
//!
//! Each periodic concern (health polling, circuit rotation, failover
//! self-check, redundancy cycle) runs as its own task on its own timer.
//!
//! ## Overlap
//!
//! A task body is awaited inline before the next tick is considered, and
//! missed ticks are skipped rather than bursted. Bodies that can also be
//! started out-of-band (a wake-up notification, a manual call) take a
//! [`TickGuard`] permit so two invocations of the same task never run at
//! once; the second one is skipped.
//!
//! ## Shutdown
//!
//! [`Scheduler::shutdown`] cancels the timers and then waits for any
//! in-flight body to finish on its own. Bodies are never aborted mid-probe;
//! their I/O deadlines bound how long shutdown can take.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Owns a set of cancellable repeating tasks
#[derive(Debug, Default)]
pub struct Scheduler {
    cancel: CancellationToken,
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` every `period`, first firing one period from now.
    ///
    /// If `wake` is given, a notification runs the task early.
    pub fn spawn_periodic<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        wake: Option<Arc<Notify>>,
        task: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            log::debug!("⏱️ Periodic task '{}' started ({:?})", name, period);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = wait_for(&wake) => {
                        log::debug!("⏱️ Periodic task '{}' woken early", name);
                    }
                }

                task().await;
            }

            log::debug!("⏱️ Periodic task '{}' stopped", name);
        });

        self.handles.lock().push((name, handle));
    }

    /// Run a long-lived task that watches the scheduler's cancellation token
    pub fn spawn<F, Fut>(&self, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task(self.cancel.clone()));
        self.handles.lock().push((name, handle));
    }

    /// Number of tasks started on this scheduler
    pub fn task_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop every timer and wait for in-flight bodies to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                log::error!("Periodic task '{}' ended abnormally: {}", name, e);
            }
        }
    }
}

async fn wait_for(wake: &Option<Arc<Notify>>) {
    match wake {
        Some(notify) => notify.notified().await,
        None => std::future::pending::<()>().await,
    }
}

/// Skip-if-running guard for a periodic body
#[derive(Debug, Default)]
pub struct TickGuard {
    running: AtomicBool,
}

impl TickGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard, or `None` if another invocation holds it
    pub fn try_enter(&self) -> Option<TickPermit<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickPermit { guard: self })
    }
}

/// Releases its [`TickGuard`] on drop
#[derive(Debug)]
pub struct TickPermit<'a> {
    guard: &'a TickGuard,
}

impl Drop for TickPermit<'_> {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}
