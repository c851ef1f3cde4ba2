use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use dashmap::DashMap;

use crate::domain::UserId;

// ============== Rate Limiter (Sliding Window) ==============

/// Per-user sliding-window limiter: at most `max_requests` admissions in any
/// trailing `window`.
///
/// Windows live in a sharded map. Each check runs entirely under the user's
/// entry lock, so two simultaneous checks for the same user are serialized and
/// cannot both observe a free slot. Different users only contend when they hash
/// to the same shard.
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    max_requests: usize,
    window: Duration,
    windows: DashMap<UserId, VecDeque<Instant>>,
}

#[derive(Clone, Copy, Debug)]
pub struct RateLimitStatus {
    pub used: usize,
    pub max: usize,
    pub window: Duration,
}

impl RateLimiter {
    pub fn new(enabled: bool, max_requests: u32, window: Duration) -> Self {
        Self {
            enabled,
            max_requests: max_requests as usize,
            window,
            windows: DashMap::new(),
        }
    }

    pub fn admit(&self, user_id: UserId) -> bool {
        self.check(user_id).0
    }

    /// Admit or reject; on rejection also returns how long until a slot frees up.
    pub fn check(&self, user_id: UserId) -> (bool, Option<Duration>) {
        self.check_at(user_id, Instant::now())
    }

    pub fn check_at(&self, user_id: UserId, now: Instant) -> (bool, Option<Duration>) {
        if !self.enabled {
            return (true, None);
        }

        let mut window = self.windows.entry(user_id).or_default();

        // Lazy eviction: keep only entries inside [now - window, now].
        while let Some(&oldest) = window.front() {
            if now.saturating_duration_since(oldest) > self.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() < self.max_requests {
            window.push_back(now);
            return (true, None);
        }

        let retry_after = window
            .front()
            .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
            .unwrap_or(self.window);
        (false, Some(retry_after))
    }

    /// Snapshot of a user's window without mutating it.
    pub fn status_at(&self, user_id: UserId, now: Instant) -> RateLimitStatus {
        let used = self
            .windows
            .get(&user_id)
            .map(|w| {
                w.iter()
                    .filter(|&&t| now.saturating_duration_since(t) <= self.window)
                    .count()
            })
            .unwrap_or(0);

        RateLimitStatus {
            used,
            max: self.max_requests,
            window: self.window,
        }
    }

    pub fn status(&self, user_id: UserId) -> RateLimitStatus {
        self.status_at(user_id, Instant::now())
    }
}
