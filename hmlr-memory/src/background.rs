//! Background task management
//!
//! Fire-and-forget work (the Scribe, Gardener triggers, window
//! compression) runs through this registry so shutdown can drain it:
//! a watch channel signals cancellation, an in-flight counter gates the
//! bounded drain wait.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Registry of cancellable background tasks
pub struct BackgroundTasks {
    in_flight: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundTasks {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Self {
            in_flight: Arc::new(AtomicU64::new(0)),
            shutdown_tx,
        }
    }

    /// Spawn a named task; it is cancelled on shutdown
    pub fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if *self.shutdown_tx.borrow() {
            warn!("Refusing to spawn {name:?} after shutdown");
            return;
        }

        let in_flight = Arc::clone(&self.in_flight);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task_name = name.to_string();

        in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            debug!("Background task {task_name:?} started");
            tokio::select! {
                () = future => {
                    debug!("Background task {task_name:?} finished");
                }
                _ = shutdown_rx.changed() => {
                    debug!("Background task {task_name:?} cancelled on shutdown");
                }
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Tasks currently running
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for in-flight tasks to finish without
    /// signalling shutdown; new spawns remain allowed
    pub async fn wait_idle(&self, timeout: Duration) {
        let start = std::time::Instant::now();
        while self.in_flight() > 0 {
            if start.elapsed() > timeout {
                warn!("wait_idle timeout: {} task(s) still running", self.in_flight());
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Signal shutdown and wait up to `t_drain` for tasks to finish
    pub async fn drain(&self, t_drain: Duration) {
        info!(
            "Draining background tasks ({} in flight)",
            self.in_flight()
        );
        let _ = self.shutdown_tx.send(true);

        let start = std::time::Instant::now();
        while self.in_flight() > 0 {
            if start.elapsed() > t_drain {
                warn!(
                    "Drain timeout after {t_drain:?}: {} task(s) abandoned",
                    self.in_flight()
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        info!("Background tasks drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tasks_complete_and_counter_drops() {
        let tasks = BackgroundTasks::new();
        tasks.spawn("quick", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        });
        assert_eq!(tasks.in_flight(), 1);

        tasks.drain(Duration::from_secs(1)).await;
        assert_eq!(tasks.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_drain_cancels_long_running_tasks() {
        let tasks = BackgroundTasks::new();
        tasks.spawn("slow", async {
            tokio::time::sleep(Duration::from_secs(600)).await;
        });

        // Cancellation through the watch channel beats the sleep.
        tasks.drain(Duration::from_secs(1)).await;
        assert_eq!(tasks.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_no_spawn_after_shutdown() {
        let tasks = BackgroundTasks::new();
        tasks.drain(Duration::from_millis(10)).await;

        tasks.spawn("late", async {});
        assert_eq!(tasks.in_flight(), 0);
    }
}
