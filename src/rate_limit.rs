// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Sliding-window rate limiter with cooldown.
//!
//! One generic primitive backs two guards: the deal-grab abuse limiter
//! (keyed by identity) and the payment-code lockout (keyed by terminal).
//! Attempt lists live only in memory and are pruned to the lookback
//! window on every touch; nothing is retained past it.
//!
//! Once a key accumulates `max_attempts` live attempts it is limited
//! until the cooldown, measured from the attempt that tripped the limit,
//! has elapsed. A served cooldown clears the key.

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Per-key attempt counter with cooldown.
pub struct RateLimiter<K: Eq + Hash + Clone> {
    max_attempts: usize,
    window: Option<Duration>,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    attempts: DashMap<K, Vec<DateTime<Utc>>>,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_attempts: config.max_attempts as usize,
            window: config.window,
            cooldown: config.cooldown,
            clock,
            attempts: DashMap::new(),
        }
    }

    /// Drops attempts older than the lookback window, if one is set.
    fn prune(&self, attempts: &mut Vec<DateTime<Utc>>, now: DateTime<Utc>) {
        if let Some(window) = self.window {
            let cutoff = now - window;
            attempts.retain(|t| *t > cutoff);
        }
    }

    /// Appends an attempt timestamp for the key.
    pub fn record_attempt(&self, key: K) {
        let now = self.clock.now();
        let mut entry = self.attempts.entry(key).or_default();
        self.prune(&mut entry, now);
        entry.push(now);
    }

    /// Clears the key. A success resets the counter entirely.
    pub fn record_success(&self, key: &K) {
        self.attempts.remove(key);
    }

    /// Administrative/testing override; identical to [`record_success`].
    ///
    /// [`record_success`]: RateLimiter::record_success
    pub fn reset(&self, key: &K) {
        self.attempts.remove(key);
    }

    /// Whether the key is currently limited.
    ///
    /// A key whose cooldown has fully elapsed is cleared as a side
    /// effect, so the next attempt starts a fresh window.
    pub fn is_limited(&self, key: &K) -> bool {
        self.check(key).is_some()
    }

    /// If limited, the instant the cooldown expires.
    pub fn cooldown_expiry(&self, key: &K) -> Option<DateTime<Utc>> {
        self.check(key)
    }

    fn check(&self, key: &K) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let mut entry = self.attempts.get_mut(key)?;
        self.prune(&mut entry, now);
        if entry.len() < self.max_attempts {
            return None;
        }
        // The attempt that tripped the limit anchors the cooldown.
        let tripped_at = *entry.last()?;
        let expiry = tripped_at + self.cooldown;
        if now < expiry {
            Some(expiry)
        } else {
            entry.clear();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(config: RateLimitConfig) -> (RateLimiter<&'static str>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::start_now());
        (RateLimiter::new(config, clock.clone()), clock)
    }

    #[test]
    fn under_limit_is_not_limited() {
        let (limiter, _clock) = limiter(RateLimitConfig::grab_guard());
        limiter.record_attempt("a");
        limiter.record_attempt("a");
        assert!(!limiter.is_limited(&"a"));
        assert!(limiter.cooldown_expiry(&"a").is_none());
    }

    #[test]
    fn trips_at_max_attempts_with_cooldown_from_last_attempt() {
        let (limiter, clock) = limiter(RateLimitConfig::grab_guard());
        limiter.record_attempt("a");
        clock.advance(Duration::seconds(10));
        limiter.record_attempt("a");
        clock.advance(Duration::seconds(10));
        limiter.record_attempt("a");
        let third_attempt = clock.now();

        assert!(limiter.is_limited(&"a"));
        assert_eq!(
            limiter.cooldown_expiry(&"a"),
            Some(third_attempt + Duration::minutes(15))
        );
    }

    #[test]
    fn window_ages_out_attempts() {
        let (limiter, clock) = limiter(RateLimitConfig::grab_guard());
        limiter.record_attempt("a");
        limiter.record_attempt("a");
        clock.advance(Duration::minutes(16));
        limiter.record_attempt("a");
        // Only one attempt left inside the 15-minute window.
        assert!(!limiter.is_limited(&"a"));
    }

    #[test]
    fn served_cooldown_clears_the_key() {
        let (limiter, clock) = limiter(RateLimitConfig::terminal_lockout());
        for _ in 0..5 {
            limiter.record_attempt("t");
        }
        assert!(limiter.is_limited(&"t"));
        clock.advance(Duration::seconds(61));
        assert!(!limiter.is_limited(&"t"));
        // Fresh window after the lockout was served.
        limiter.record_attempt("t");
        assert!(!limiter.is_limited(&"t"));
    }

    #[test]
    fn no_window_attempts_never_age_out() {
        let (limiter, clock) = limiter(RateLimitConfig::terminal_lockout());
        for _ in 0..4 {
            limiter.record_attempt("t");
            clock.advance(Duration::minutes(10));
        }
        limiter.record_attempt("t");
        // Attempts spread over 40 minutes still count: no lookback window.
        assert!(limiter.is_limited(&"t"));
    }

    #[test]
    fn success_resets_counter() {
        let (limiter, _clock) = limiter(RateLimitConfig::terminal_lockout());
        for _ in 0..4 {
            limiter.record_attempt("t");
        }
        limiter.record_success(&"t");
        limiter.record_attempt("t");
        assert!(!limiter.is_limited(&"t"));
    }

    #[test]
    fn keys_are_independent() {
        let (limiter, _clock) = limiter(RateLimitConfig::grab_guard());
        for _ in 0..3 {
            limiter.record_attempt("a");
        }
        assert!(limiter.is_limited(&"a"));
        assert!(!limiter.is_limited(&"b"));
    }
}
