//! Shutdown coordination for background tasks.
//!
//! Workers and sweepers hold a [`ShutdownSignal`] and exit their loop once
//! it fires. The signal is level-triggered: a task that subscribes after
//! [`Shutdown::trigger`] still observes it.

use tokio::sync::watch;

/// Coordinator for cooperative shutdown.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side held by each background task.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been triggered.
    ///
    /// Also resolves if the coordinator is dropped, so orphaned tasks exit.
    pub async fn triggered(&mut self) {
        // Err means the sender is gone, which counts as shutdown.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_late_subscriber_sees_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let mut signal = shutdown.subscribe();
        assert!(signal.is_triggered());
        tokio::time::timeout(Duration::from_millis(100), signal.triggered())
            .await
            .expect("signal should already be set");
    }

    #[tokio::test]
    async fn test_waiting_task_wakes_on_trigger() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.subscribe();
        let observer = shutdown.subscribe();

        let task = tokio::spawn(async move {
            signal.triggered().await;
        });

        assert!(!observer.is_triggered());
        shutdown.trigger();
        assert!(observer.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("task should exit")
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_coordinator_releases_waiters() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.subscribe();
        drop(shutdown);

        tokio::time::timeout(Duration::from_millis(100), signal.triggered())
            .await
            .expect("dropped sender should release waiters");
    }
}
