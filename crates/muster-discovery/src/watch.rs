//! Watch loop plumbing: cancellation handles and reconnect budgets

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handle to a running watch loop.
///
/// Every `watch()` call spawns one background task and returns one handle.
/// Dropping the handle leaves the loop running for the life of the process;
/// calling [`WatchHandle::stop`] shuts it down at its next suspension point.
pub struct WatchHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub(crate) fn new(shutdown_tx: mpsc::Sender<()>, task: JoinHandle<()>) -> Self {
        Self { shutdown_tx, task }
    }

    /// Signal the watch loop to stop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }

    /// Whether the underlying loop has already exited on its own.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Reconnect budget for store-backed watch loops.
///
/// Consecutive failures back off exponentially up to a cap; a success resets
/// the budget. Once the budget is exhausted the loop must surface the failure
/// and exit instead of retrying forever.
pub(crate) struct Reconnect {
    failures: u32,
    max_failures: u32,
    delay: Duration,
    max_delay: Duration,
}

impl Reconnect {
    const INITIAL_DELAY: Duration = Duration::from_secs(1);

    pub(crate) fn new() -> Self {
        Self {
            failures: 0,
            max_failures: 5,
            delay: Self::INITIAL_DELAY,
            max_delay: Duration::from_secs(30),
        }
    }

    /// Record a failure and return the delay before the next attempt,
    /// or `None` once the budget is spent.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.max_failures {
            return None;
        }
        let delay = self.delay;
        self.delay = (self.delay * 2).min(self.max_delay);
        Some(delay)
    }

    pub(crate) fn reset(&mut self) {
        self.failures = 0;
        self.delay = Self::INITIAL_DELAY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_backs_off_then_gives_up() {
        let mut reconnect = Reconnect::new();

        assert_eq!(reconnect.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(reconnect.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(reconnect.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(reconnect.next_delay(), Some(Duration::from_secs(8)));
        assert_eq!(reconnect.next_delay(), None);
    }

    #[test]
    fn test_reconnect_reset_restores_budget() {
        let mut reconnect = Reconnect::new();
        for _ in 0..4 {
            reconnect.next_delay();
        }

        reconnect.reset();
        assert_eq!(reconnect.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_reconnect_delay_is_capped() {
        let mut reconnect = Reconnect::new();
        reconnect.max_failures = 100;

        let mut last = Duration::ZERO;
        for _ in 0..10 {
            last = reconnect.next_delay().unwrap();
        }
        assert_eq!(last, Duration::from_secs(30));
    }
}
