//! Sliding-window limiter shared by every call site of the external AI
//! service.
//!
//! The limiter only advises. It never performs calls itself; callers ask
//! [`RateLimiter::can_call`] (or suspend in [`RateLimiter::wait_for_slot`])
//! and report each real call with [`RateLimiter::record_call`]. Checking and
//! recording are two separate steps, so two callers racing through the check
//! can overshoot the budget by a call. The queue drains with a single
//! consumer, which keeps that race theoretical.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct CallRecord {
    at: Instant,
    caller: String,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    /// Ordered oldest first, as entries are stamped under the lock.
    calls: Mutex<VecDeque<CallRecord>>,
}

/// Observability snapshot of the limiter.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RateLimitStatus {
    #[serde(rename = "calls-in-window")]
    pub calls_in_window: usize,
    #[serde(rename = "max-calls-per-window")]
    pub max_calls_per_window: usize,
    #[serde(rename = "can-call")]
    pub can_call: bool,
    /// Milliseconds until a slot frees up; 0 when one is free now.
    #[serde(rename = "time-until-next-slot-ms")]
    pub time_until_next_slot_ms: u64,
    /// The same wait rounded up to whole seconds.
    #[serde(rename = "estimated-wait-seconds")]
    pub estimated_wait_seconds: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    /// Records one real call to the external service.
    pub fn record_call(&self, caller_id: &str) {
        let mut calls = self.calls.lock();
        calls.push_back(CallRecord {
            at: Instant::now(),
            caller: caller_id.to_owned(),
        });

        let in_window = self.count_in_window(&calls, Instant::now());
        debug!(
            caller = caller_id,
            calls_in_window = in_window,
            max = self.config.max_calls_per_window,
            "recorded external call"
        );
    }

    /// True iff fewer than `max_calls_per_window` calls fall in the window.
    pub fn can_call(&self) -> bool {
        let calls = self.calls.lock();
        let in_window = self.count_in_window(&calls, Instant::now());
        trace!(
            calls_in_window = in_window,
            max = self.config.max_calls_per_window,
            "checked rate window"
        );
        in_window < self.config.max_calls_per_window
    }

    /// How long until [`Self::can_call`] turns true, assuming no new calls.
    pub fn time_until_next_slot(&self) -> Duration {
        let calls = self.calls.lock();
        self.time_until_next_slot_locked(&calls, Instant::now())
    }

    /// Suspends until a slot is free, re-checking every poll interval.
    /// Returns the time spent waiting.
    pub async fn wait_for_slot(&self) -> Duration {
        let start = Instant::now();

        while !self.can_call() {
            debug!(
                wait_ms = self.config.poll_interval.as_millis() as u64,
                next_slot_ms = self.time_until_next_slot().as_millis() as u64,
                "rate window full, waiting"
            );
            time::sleep(self.config.poll_interval).await;
        }

        start.elapsed()
    }

    /// Number of in-window calls attributed to `caller_id`.
    pub fn calls_by(&self, caller_id: &str) -> usize {
        let now = Instant::now();
        self.calls
            .lock()
            .iter()
            .filter(|c| self.is_in_window(c, now) && c.caller == caller_id)
            .count()
    }

    pub fn status(&self) -> RateLimitStatus {
        let calls = self.calls.lock();
        let now = Instant::now();
        let in_window = self.count_in_window(&calls, now);
        let wait = self.time_until_next_slot_locked(&calls, now);

        RateLimitStatus {
            calls_in_window: in_window,
            max_calls_per_window: self.config.max_calls_per_window,
            can_call: in_window < self.config.max_calls_per_window,
            time_until_next_slot_ms: wait.as_millis() as u64,
            estimated_wait_seconds: div_ceil_secs(wait),
        }
    }

    /// Drops every entry that has left the window, returning how many went.
    pub fn prune(&self) -> usize {
        let mut calls = self.calls.lock();
        let now = Instant::now();
        let before = calls.len();

        while calls.front().is_some_and(|c| !self.is_in_window(c, now)) {
            calls.pop_front();
        }

        before - calls.len()
    }

    /// Entries currently held, expired or not.
    pub fn tracked_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Starts the recurring prune on the current runtime. The task ends when
    /// `cancel` fires.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = limiter.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                select! {
                    _ = ticker.tick() => {},
                    _ = cancel.cancelled() => break,
                }

                let removed = limiter.prune();
                debug!(
                    removed,
                    remaining = limiter.tracked_calls(),
                    "pruned rate window"
                );
            }
        })
    }

    fn is_in_window(&self, call: &CallRecord, now: Instant) -> bool {
        now.saturating_duration_since(call.at) < self.config.window
    }

    fn count_in_window(
        &self,
        calls: &VecDeque<CallRecord>,
        now: Instant,
    ) -> usize {
        calls.iter().filter(|c| self.is_in_window(c, now)).count()
    }

    fn time_until_next_slot_locked(
        &self,
        calls: &VecDeque<CallRecord>,
        now: Instant,
    ) -> Duration {
        let live: Vec<&CallRecord> =
            calls.iter().filter(|c| self.is_in_window(c, now)).collect();
        let max = self.config.max_calls_per_window;

        if live.len() < max {
            return Duration::ZERO;
        }

        // A racing caller may have pushed us past the limit, in which case
        // more than the oldest entry has to expire.
        let blocking = live[live.len() - max];
        self.config
            .window
            .saturating_sub(now.saturating_duration_since(blocking.at))
    }
}

fn div_ceil_secs(d: Duration) -> u64 {
    let ms = d.as_millis() as u64;
    (ms + 999) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: usize) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_calls_per_window: max,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_window_blocks_until_entries_age_out() {
        let rl = limiter(5);

        for _ in 0..5 {
            assert!(rl.can_call());
            rl.record_call("system");
        }
        assert!(!rl.can_call());

        time::advance(Duration::from_secs(59)).await;
        assert!(!rl.can_call());

        time::advance(Duration::from_secs(2)).await;
        assert!(rl.can_call());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_until_next_slot_counts_down() {
        let rl = limiter(2);
        assert_eq!(rl.time_until_next_slot(), Duration::ZERO);

        rl.record_call("a");
        time::advance(Duration::from_secs(10)).await;
        rl.record_call("b");

        // Oldest call is 10s old, so 50s remain.
        let mut last = rl.time_until_next_slot();
        assert_eq!(last, Duration::from_secs(50));

        for _ in 0..10 {
            time::advance(Duration::from_secs(5)).await;
            let next = rl.time_until_next_slot();
            assert!(next <= last);
            assert_eq!(next.is_zero(), rl.can_call());
            last = next;
        }
        assert_eq!(last, Duration::ZERO);
        assert!(rl.can_call());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overshoot_waits_for_enough_expiries() {
        let rl = limiter(1);
        rl.record_call("a");
        time::advance(Duration::from_secs(20)).await;
        // Ignores the advice and calls anyway.
        rl.record_call("b");

        time::advance(Duration::from_secs(45)).await;
        // First call expired, but the second still fills the single slot.
        assert!(!rl.can_call());
        assert_eq!(rl.time_until_next_slot(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_slot_polls() {
        let rl = limiter(1);
        rl.record_call("a");

        let waited = rl.wait_for_slot().await;
        // Polling every 5s, the slot opens exactly at the 60s mark.
        assert_eq!(waited, Duration::from_secs(60));
        assert!(rl.can_call());

        assert_eq!(rl.wait_for_slot().await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_and_calls_by() {
        let rl = limiter(3);
        rl.record_call("alice");
        rl.record_call("alice");
        rl.record_call("bob");
        time::advance(Duration::from_millis(500)).await;

        let status = rl.status();
        assert_eq!(status.calls_in_window, 3);
        assert_eq!(status.max_calls_per_window, 3);
        assert!(!status.can_call);
        assert_eq!(status.time_until_next_slot_ms, 59_500);
        assert_eq!(status.estimated_wait_seconds, 60);

        assert_eq!(rl.calls_by("alice"), 2);
        assert_eq!(rl.calls_by("bob"), 1);
        assert_eq!(rl.calls_by("carol"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_prunes() {
        let rl = Arc::new(limiter(5));
        let cancel = CancellationToken::new();
        let handle = rl.spawn_cleanup(cancel.clone());

        rl.record_call("a");
        rl.record_call("b");
        assert_eq!(rl.tracked_calls(), 2);

        // The first tick at 60s sees the entries exactly at the edge of the
        // window, so they are already expired.
        time::sleep(Duration::from_secs(61)).await;
        assert_eq!(rl.tracked_calls(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
