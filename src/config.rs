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

//! Engine configuration.
//!
//! Every duration the engine enforces is a named value here; nothing is
//! inferred from a single hard-coded constant. Client-side countdowns are
//! display-only; these values are the authoritative ones.

use chrono::Duration;

/// Parameters for one [`RateLimiter`](crate::RateLimiter) instance.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Attempts allowed before the limiter trips.
    pub max_attempts: u32,
    /// Sliding lookback window. `None` means attempts never age out on
    /// their own; only a served cooldown or an explicit reset clears them.
    pub window: Option<Duration>,
    /// How long the key stays limited once tripped.
    pub cooldown: Duration,
}

impl RateLimitConfig {
    /// Deal-grab abuse guard: 3 attempts per 15 minutes, 15-minute cooldown.
    pub fn grab_guard() -> Self {
        Self {
            max_attempts: 3,
            window: Some(Duration::minutes(15)),
            cooldown: Duration::minutes(15),
        }
    }

    /// Terminal code-guess lockout: 5 consecutive failures, 60-second
    /// lockout, counter reset on any success.
    pub fn terminal_lockout() -> Self {
        Self {
            max_attempts: 5,
            window: None,
            cooldown: Duration::seconds(60),
        }
    }
}

/// Tunable engine parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a freshly created payment code stays redeemable.
    pub code_ttl: Duration,
    /// How long a merchant has to confirm cash collection after
    /// authorizing a code. Shared with the serving queue's no-show timer.
    pub payment_window: Duration,
    /// How long a grab holds a deal before expiring.
    pub grab_hold_ttl: Duration,
    /// Collision retries when generating a payment code.
    pub code_max_attempts: u32,
    /// Horizon after which unredeemed local credits stop counting.
    pub local_credit_expiry: Duration,
    /// Share of earned cashback posted as merchant-local credit, in
    /// percent. The remainder goes to network credit.
    pub local_share_pct: i64,
    /// Limiter for deal-grab attempts, keyed by identity.
    pub grab_guard: RateLimitConfig,
    /// Lockout for failed code validations, keyed by terminal.
    pub terminal_lockout: RateLimitConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            code_ttl: Duration::minutes(10),
            payment_window: Duration::minutes(5),
            grab_hold_ttl: Duration::minutes(30),
            code_max_attempts: 32,
            local_credit_expiry: Duration::days(90),
            local_share_pct: 70,
            grab_guard: RateLimitConfig::grab_guard(),
            terminal_lockout: RateLimitConfig::terminal_lockout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let config = EngineConfig::default();
        assert_eq!(config.payment_window, Duration::minutes(5));
        assert_eq!(config.local_credit_expiry, Duration::days(90));
        assert_eq!(config.local_share_pct, 70);
        assert_eq!(config.grab_guard.max_attempts, 3);
        assert_eq!(config.terminal_lockout.max_attempts, 5);
        assert_eq!(config.terminal_lockout.cooldown, Duration::seconds(60));
        assert!(config.terminal_lockout.window.is_none());
    }
}
