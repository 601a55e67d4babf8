use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Stops the daemon's loops and waits for them to finish.
///
/// Each loop holds a [`ShutdownGuard`] and selects on [`ShutdownSignal::wait`]
/// next to its timer. Dropping the guard reports the loop as drained.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
    drained: Arc<watch::Sender<usize>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        let (drained, _) = watch::channel(0);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
            drained: Arc::new(drained),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Trigger shutdown. Returns `false` if it was already triggered.
    pub fn trigger(&self) -> bool {
        let first = self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            info!("shutdown triggered");
            let _ = self.sender.send(());
        }
        first
    }

    /// Resolve once shutdown is triggered, including before this call.
    pub async fn wait(&self) {
        let mut rx = self.sender.subscribe();
        if self.is_triggered() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Register a loop that must drain before shutdown completes.
    pub fn guard(&self) -> ShutdownGuard {
        ShutdownGuard {
            drained: self.drained.clone(),
        }
    }

    pub fn drained_count(&self) -> usize {
        *self.drained.borrow()
    }

    /// Wait until `expected` guards have been dropped or `timeout` passes.
    pub async fn wait_for_drain(&self, expected: usize, timeout: Duration) -> DrainOutcome {
        let mut rx = self.drained.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let drained = *rx.borrow_and_update();
            if drained >= expected {
                return DrainOutcome::Complete;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return DrainOutcome::Complete,
                Err(_) => {
                    warn!(drained, expected, "loops did not drain before the deadline");
                    return DrainOutcome::TimedOut { drained, expected };
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Complete,
    TimedOut { drained: usize, expected: usize },
}

/// Counts as drained when dropped.
#[derive(Debug)]
pub struct ShutdownGuard {
    drained: Arc<watch::Sender<usize>>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.drained.send_modify(|n| *n += 1);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_idempotent() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(signal.clone().is_triggered());
    }

    #[tokio::test]
    async fn wait_returns_after_late_subscription() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .expect("already triggered");
    }

    #[tokio::test]
    async fn wait_wakes_on_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };
        tokio::task::yield_now().await;
        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken")
            .expect("join");
    }

    #[tokio::test]
    async fn drain_completes_when_guards_drop() {
        let signal = ShutdownSignal::new();
        let first = signal.guard();
        let second = signal.guard();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(first);
            drop(second);
        });
        let outcome = signal.wait_for_drain(2, Duration::from_secs(1)).await;
        assert_eq!(outcome, DrainOutcome::Complete);
        assert_eq!(signal.drained_count(), 2);
    }

    #[tokio::test]
    async fn drain_times_out_with_live_guard() {
        let signal = ShutdownSignal::new();
        let _held = signal.guard();
        let outcome = signal.wait_for_drain(1, Duration::from_millis(20)).await;
        assert_eq!(
            outcome,
            DrainOutcome::TimedOut {
                drained: 0,
                expected: 1
            }
        );
    }
}
