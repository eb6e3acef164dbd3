//! Periodic background cleanup
//!
//! A sweeper owns one tokio task that calls a cleanup closure on a fixed
//! period until it is shut down. The closure only ever takes short-lived
//! locks, so request handling is never held up by a sweep.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Handle to a running cleanup task
#[derive(Debug)]
pub struct Sweeper {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn a task that runs `sweep` every `period`.
    ///
    /// `sweep` returns the number of removed entries, used for logging only.
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(name: &'static str, period: Duration, mut sweep: F) -> Self
    where
        F: FnMut() -> usize + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing has expired yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = sweep();
                        if removed > 0 {
                            debug!("{}: removed {} expired entries", name, removed);
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("{}: stopping", name);
                            break;
                        }
                    }
                }
            }
        });

        Self {
            name,
            shutdown_tx,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the task to stop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!("{}: cleanup task ended abnormally: {}", self.name, e);
        }
    }
}
