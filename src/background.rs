//! Cancellable periodic background tasks
//!
//! Health probing, rate-limiter queue draining and cost-ledger pruning all run
//! on fixed intervals independent of request traffic. Each owner holds a
//! [`PeriodicTask`] and stops it explicitly on shutdown; dropping the handle
//! signals the loop to exit as well.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Handle to a spawned interval loop
pub struct PeriodicTask {
    /// Name used in log lines
    name: String,

    /// Shutdown signal for interrupting the interval tick
    shutdown_tx: watch::Sender<bool>,

    /// Handle to the spawned loop, taken on stop
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    /// Spawn `tick` every `period` on the current tokio runtime.
    ///
    /// The first tick fires immediately. A tick that overruns the period
    /// delays the next one instead of bursting to catch up.
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        tick().await;
                    }
                }
            }
            tracing::debug!("Background task {} stopped", task_name);
        });

        tracing::debug!("Background task {} started ({:?} interval)", name, period);

        Self {
            name,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Task name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the loop has been started and not yet stopped
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Signal the loop to exit and wait for it to finish
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::warn!("Background task {} ended abnormally: {}", self.name, e);
                }
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        // Best effort stop on drop (can't await in Drop)
        let _ = self.shutdown_tx.send(true);
    }
}
