//! ---
//! ivsim_section: "01-core-functionality"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Runtime helpers supporting the simulation engine."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};
use std::future;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

/// Furthest a deadline is placed; longer delays are treated as "never".
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay.min(FAR_FUTURE))
        .unwrap_or_else(|| now + FAR_FUTURE)
}

/// Fixed-period ticker whose first tick fires one period after creation.
#[derive(Debug)]
pub struct RateLimiter {
    interval: tokio::time::Interval,
}

impl RateLimiter {
    /// Periods are clamped to between one millisecond and thirty years.
    pub fn new(period: Duration) -> Self {
        let period = period.clamp(Duration::from_millis(1), FAR_FUTURE);
        let mut interval = tokio::time::interval_at(deadline_after(period), period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }

    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }
}

/// Handle returned by [`TimerSet::after`], used to cancel a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

/// Set of one-shot timers, each yielding an event when its deadline passes.
///
/// Timers with equal deadlines fire in the order they were armed. Dropping the
/// future returned by [`TimerSet::expired`] before it completes loses nothing,
/// so it can sit in a `tokio::select!` loop.
#[derive(Debug)]
pub struct TimerSet<E> {
    next_token: u64,
    pending: BTreeMap<(Instant, TimerToken), E>,
    deadlines: HashMap<TimerToken, Instant>,
}

impl<E> Default for TimerSet<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> TimerSet<E> {
    pub fn new() -> Self {
        Self {
            next_token: 0,
            pending: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Arm a timer delivering `event` once `delay` has elapsed.
    pub fn after(&mut self, delay: Duration, event: E) -> TimerToken {
        let token = TimerToken(self.next_token);
        self.next_token += 1;
        let deadline = deadline_after(delay);
        self.pending.insert((deadline, token), event);
        self.deadlines.insert(token, deadline);
        trace!(token = token.0, delay_ms = delay.as_millis() as u64, "timer armed");
        token
    }

    /// Disarm a timer; returns its event if it had not fired yet.
    pub fn cancel(&mut self, token: TimerToken) -> Option<E> {
        let deadline = self.deadlines.remove(&token)?;
        self.pending.remove(&(deadline, token))
    }

    pub fn cancel_all(&mut self) {
        self.pending.clear();
        self.deadlines.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Wait for the earliest timer and return its event. Pends forever while
    /// no timer is armed.
    pub async fn expired(&mut self) -> E {
        let Some(&(deadline, _)) = self.pending.keys().next() else {
            return future::pending().await;
        };
        tokio::time::sleep_until(deadline).await;
        match self.pending.pop_first() {
            Some(((_, token), event)) => {
                self.deadlines.remove(&token);
                trace!(token = token.0, "timer fired");
                event
            }
            None => future::pending().await,
        }
    }
}
