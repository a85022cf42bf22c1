use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use tokio::time::Instant;

use crate::errors::{Error, RateLimitedResource, Result};
use crate::oauth::token::{chrono_duration, UserId};
use crate::state::RateLimits;

/// Per-user sliding-window quotas for posts and uploads
///
/// An event counts against the window for exactly `limits.window` after it
/// happened, so no rolling window ever holds more than the limit.
pub struct RateLimiter {
    limits: RateLimits,
    events: Mutex<HashMap<(UserId, RateLimitedResource), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            events: Mutex::new(HashMap::new()),
        }
    }

    fn limit_for(&self, resource: RateLimitedResource) -> usize {
        match resource {
            RateLimitedResource::Posts => self.limits.posts_per_hour as usize,
            RateLimitedResource::Uploads => self.limits.uploads_per_hour as usize,
        }
    }

    /// Take one slot, or fail with the time the oldest slot frees up
    ///
    /// The check and the increment happen under one lock.
    pub fn check_and_record(&self, user_id: UserId, resource: RateLimitedResource) -> Result<()> {
        let now = Instant::now();
        let limit = self.limit_for(resource);
        let window = self.limits.window;

        let key = (user_id, resource);
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        // Forget anyone whose newest event has left the window
        events.retain(|_, timestamps| {
            timestamps
                .back()
                .is_some_and(|newest| now.duration_since(*newest) < window)
        });

        let timestamps = events.entry(key).or_default();
        while timestamps
            .front()
            .is_some_and(|oldest| now.duration_since(*oldest) >= window)
        {
            timestamps.pop_front();
        }

        if timestamps.len() >= limit {
            let frees_at = timestamps.front().map_or(now + window, |oldest| *oldest + window);
            if timestamps.is_empty() {
                events.remove(&key);
            }
            let reset_at = Utc::now() + chrono_duration(frees_at.duration_since(now));
            tracing::info!(
                "User {} hit the {} rate limit ({} per window)",
                user_id,
                resource,
                limit
            );
            return Err(Error::RateLimit { resource, reset_at });
        }

        timestamps.push_back(now);
        Ok(())
    }

    /// Slots left in the current window
    pub fn remaining(&self, user_id: UserId, resource: RateLimitedResource) -> usize {
        let now = Instant::now();
        let window = self.limits.window;
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let used = events.get(&(user_id, resource)).map_or(0, |timestamps| {
            timestamps
                .iter()
                .filter(|at| now.duration_since(**at) < window)
                .count()
        });
        self.limit_for(resource).saturating_sub(used)
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
