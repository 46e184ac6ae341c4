use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::UserId;

/// Per-user admission over a trailing window. A limit or window of zero
/// rejects every request.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    windows: Mutex<HashMap<UserId, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn admit(&self, user_id: UserId, now: DateTime<Utc>) -> bool {
        if self.is_closed() {
            debug!(user_id, "rate limiter is closed, rejecting");
            return false;
        }

        let window_start = self.window_start(now);
        let mut windows = self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entries = windows.entry(user_id).or_default();
        while entries.front().is_some_and(|timestamp| *timestamp <= window_start) {
            entries.pop_front();
        }

        if entries.len() >= self.max_requests {
            return false;
        }

        entries.push_back(now);
        true
    }

    pub fn time_to_reset(&self, user_id: UserId, now: DateTime<Utc>) -> Duration {
        let windows = self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(oldest) = windows.get(&user_id).and_then(|entries| entries.front()) else {
            return Duration::ZERO;
        };

        let elapsed = (now - *oldest).to_std().unwrap_or(Duration::ZERO);
        self.window.saturating_sub(elapsed)
    }

    /// Drops users whose timestamps have all left the window.
    pub fn prune(&self, now: DateTime<Utc>) {
        let window_start = self.window_start(now);
        let mut windows = self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        windows.retain(|_, entries| {
            entries.retain(|timestamp| *timestamp > window_start);
            !entries.is_empty()
        });
    }

    fn is_closed(&self) -> bool {
        self.max_requests == 0 || self.window.is_zero()
    }

    /// Timestamps at or before this instant are outside the window. A window
    /// reaching past the earliest representable date starts there.
    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}
