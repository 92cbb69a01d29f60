//! Self-rescheduling poll timer
//!
//! At most one timer is pending at any time: scheduling replaces the pending
//! timer. A fired timer checks the destroyed flag before starting the poll, and
//! the poll itself runs detached from the timer so that rescheduling from
//! inside a poll never cancels the running poll.

use serde::Deserialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

/// Delay of the first poll when polling on startup
pub const STARTUP_POLL_DELAY: Duration = Duration::from_millis(1000);

/// Options shared by every polling device
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingOptions {
    /// Milliseconds between the end of one poll and the start of the next
    pub polling_interval: u64,
    #[serde(default)]
    pub poll_on_startup: bool,
}

impl PollingOptions {
    pub fn scheduler(&self) -> PollScheduler {
        PollScheduler::new(
            Duration::from_millis(self.polling_interval),
            self.poll_on_startup,
        )
    }
}

#[derive(Default)]
struct TimerState {
    pending: Option<JoinHandle<()>>,
    scheduled_before: bool,
}

pub struct PollScheduler {
    interval: Duration,
    poll_on_startup: bool,
    destroyed: Arc<AtomicBool>,
    state: Mutex<TimerState>,
}

impl PollScheduler {
    pub fn new(interval: Duration, poll_on_startup: bool) -> Self {
        Self {
            interval,
            poll_on_startup,
            destroyed: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(TimerState::default()),
        }
    }

    /// Cancel the pending timer and arm a new one that runs `poll`
    pub fn schedule<F, Fut>(&self, poll: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_destroyed() {
            return;
        }

        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(pending) = state.pending.take() {
            pending.abort();
        }

        let delay = if !state.scheduled_before && self.poll_on_startup {
            STARTUP_POLL_DELAY
        } else {
            self.interval
        };
        state.scheduled_before = true;

        let destroyed = self.destroyed.clone();
        trace!("Next poll in {:?}", delay);
        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if destroyed.load(Ordering::SeqCst) {
                return;
            }
            tokio::spawn(poll());
        }));
    }

    /// Whether a timer is armed and has not fired yet
    #[cfg(test)]
    pub fn has_pending(&self) -> bool {
        match self.state.lock() {
            Ok(state) => state
                .pending
                .as_ref()
                .map(|handle| !handle.is_finished())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Stop for good: no scheduled poll fires after this returns
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        if let Ok(mut state) = self.state.lock() {
            if let Some(pending) = state.pending.take() {
                pending.abort();
            }
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_poll(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> futures::future::Ready<()> {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_leaves_one_pending_timer() {
        let scheduler = PollScheduler::new(Duration::from_secs(60), false);
        let polls = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(counting_poll(&polls));
        scheduler.schedule(counting_poll(&polls));
        assert!(scheduler.has_pending());

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_does_not_double_fire() {
        let scheduler = PollScheduler::new(Duration::ZERO, false);
        let polls = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(counting_poll(&polls));
        scheduler.schedule(counting_poll(&polls));

        tokio::time::sleep(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_poll_uses_startup_delay() {
        let scheduler = PollScheduler::new(Duration::from_secs(600), true);
        let polls = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(counting_poll(&polls));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;
        assert_eq!(polls.load(Ordering::SeqCst), 1);

        scheduler.schedule(counting_poll(&polls));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_prevents_scheduled_poll() {
        let scheduler = PollScheduler::new(Duration::from_secs(5), false);
        let polls = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(counting_poll(&polls));
        scheduler.destroy();
        scheduler.schedule(counting_poll(&polls));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 0);
        assert!(!scheduler.has_pending());
    }
}
