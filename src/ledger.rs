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

//! Two-tier credit ledger.
//!
//! Per `(user, merchant)` pair the ledger keeps an append-only log of
//! [`CreditEvent`]s; the [`CreditBalance`] is always the left-to-right
//! fold of that log. No balance mutation bypasses an event row.
//!
//! Local credits are usable only at the issuing merchant and stop
//! counting once older than the expiry horizon; the fold tracks them as
//! FIFO lots and excludes stale lots lazily at read time, so the log
//! itself stays append-only. Network credits are portable and do not
//! expire.
//!
//! [`allocate`](CreditLedger::allocate) is a non-binding projection;
//! only [`post_redeem`](CreditLedger::post_redeem) and
//! [`post_earn`](CreditLedger::post_earn) at capture time bind, and
//! `post_redeem` re-checks sufficiency against the live balance because
//! it can drift between quote and capture.

use crate::base::{Cents, GrabId, MerchantId, UserId};
use crate::clock::Clock;
use crate::error::EngineError;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Kind of ledger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreditEventKind {
    /// Cashback earned at capture.
    Earn,
    /// Credits spent against a bill at capture.
    Redeem,
    /// Manual operator correction.
    Adjust,
}

/// One append-only ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditEvent {
    pub id: u64,
    pub user: UserId,
    pub merchant: MerchantId,
    pub grab: Option<GrabId>,
    pub kind: CreditEventKind,
    pub local_cents_change: Cents,
    pub network_cents_change: Cents,
    pub created_at: DateTime<Utc>,
    pub description: String,
}

/// Derived balance for a `(user, merchant)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    pub local_cents: Cents,
    pub network_cents: Cents,
    pub updated_at: DateTime<Utc>,
}

/// Result of a credit allocation quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub local_used: Cents,
    pub network_used: Cents,
    /// Remainder of the bill after credits: what the customer still pays.
    pub balance_cents: Cents,
}

/// Append-only credit ledger with derived balances.
pub struct CreditLedger {
    clock: Arc<dyn Clock>,
    local_expiry: Duration,
    local_share_pct: i64,
    /// Event logs per (user, merchant); the Mutex serializes the
    /// balance-fold-then-append sequence that redeem requires.
    events: DashMap<(UserId, MerchantId), Mutex<Vec<CreditEvent>>>,
    next_event_id: AtomicU64,
}

impl CreditLedger {
    pub fn new(local_expiry: Duration, local_share_pct: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            local_expiry,
            local_share_pct,
            events: DashMap::new(),
            next_event_id: AtomicU64::new(1),
        }
    }

    /// Folds an event log into a balance as of `as_of`.
    ///
    /// Local credit is replayed as FIFO lots: positive deltas open a lot,
    /// negative deltas consume the oldest live lots first (lots already
    /// past the horizon at spend time are skipped, matching what the
    /// spender could actually see). Lots still past the horizon at
    /// `as_of` are excluded from the result.
    fn fold(&self, events: &[CreditEvent], as_of: DateTime<Utc>) -> CreditBalance {
        let mut network: Cents = 0;
        let mut lots: VecDeque<(DateTime<Utc>, Cents)> = VecDeque::new();

        for event in events {
            network += event.network_cents_change;
            if event.local_cents_change > 0 {
                lots.push_back((event.created_at, event.local_cents_change));
            } else if event.local_cents_change < 0 {
                let cutoff = event.created_at - self.local_expiry;
                while lots.front().is_some_and(|(opened, _)| *opened < cutoff) {
                    lots.pop_front();
                }
                let mut need = -event.local_cents_change;
                while need > 0 {
                    let Some((_, remaining)) = lots.front_mut() else {
                        break;
                    };
                    let take = need.min(*remaining);
                    *remaining -= take;
                    need -= take;
                    if *remaining == 0 {
                        lots.pop_front();
                    }
                }
            }
        }

        let cutoff = as_of - self.local_expiry;
        let local = lots
            .iter()
            .filter(|(opened, _)| *opened >= cutoff)
            .map(|(_, remaining)| *remaining)
            .sum();

        CreditBalance {
            local_cents: local,
            network_cents: network,
            updated_at: events.last().map(|e| e.created_at).unwrap_or(as_of),
        }
    }

    /// Current balance: the fold of all events for the pair.
    pub fn balance_of(&self, user: UserId, merchant: MerchantId) -> CreditBalance {
        let as_of = self.clock.now();
        match self.events.get(&(user, merchant)) {
            Some(log) => self.fold(&log.lock(), as_of),
            None => CreditBalance {
                local_cents: 0,
                network_cents: 0,
                updated_at: as_of,
            },
        }
    }

    /// Audit read of the append-only log for a pair.
    pub fn events_of(&self, user: UserId, merchant: MerchantId) -> Vec<CreditEvent> {
        self.events
            .get(&(user, merchant))
            .map(|log| log.lock().clone())
            .unwrap_or_default()
    }

    /// Quotes how much of `bill_cents` credits would cover, without
    /// posting anything. Local credit is drawn before network credit.
    pub fn allocate(
        &self,
        user: UserId,
        merchant: MerchantId,
        bill_cents: Cents,
        apply_credits: bool,
    ) -> Allocation {
        if !apply_credits {
            return Allocation {
                local_used: 0,
                network_used: 0,
                balance_cents: bill_cents,
            };
        }
        self.allocate_capped(user, merchant, bill_cents, Cents::MAX, Cents::MAX)
    }

    /// [`allocate`](CreditLedger::allocate) with per-tier caps, used when
    /// the customer asks to spend at most so much of each tier.
    pub fn allocate_capped(
        &self,
        user: UserId,
        merchant: MerchantId,
        bill_cents: Cents,
        local_cap: Cents,
        network_cap: Cents,
    ) -> Allocation {
        if bill_cents <= 0 {
            return Allocation {
                local_used: 0,
                network_used: 0,
                balance_cents: bill_cents,
            };
        }
        let balance = self.balance_of(user, merchant);
        let local_used = balance
            .local_cents
            .min(bill_cents)
            .min(local_cap)
            .max(0);
        let network_used = balance
            .network_cents
            .min(bill_cents - local_used)
            .min(network_cap)
            .max(0);
        Allocation {
            local_used,
            network_used,
            balance_cents: bill_cents - local_used - network_used,
        }
    }

    fn next_id(&self) -> u64 {
        self.next_event_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Posts the binding REDEEM event at capture.
    ///
    /// Sufficiency is re-checked against the live balance under the same
    /// lock that appends the event; the quote from allocation time is not
    /// trusted.
    pub fn post_redeem(
        &self,
        user: UserId,
        merchant: MerchantId,
        local_used: Cents,
        network_used: Cents,
        grab: Option<GrabId>,
    ) -> Result<CreditEvent, EngineError> {
        if local_used < 0 || network_used < 0 {
            return Err(EngineError::InvalidAmount);
        }
        let now = self.clock.now();
        let entry = self.events.entry((user, merchant)).or_default();
        let mut log = entry.lock();

        let live = self.fold(&log, now);
        if live.local_cents < local_used || live.network_cents < network_used {
            return Err(EngineError::InsufficientBalance {
                local_available: live.local_cents,
                network_available: live.network_cents,
            });
        }

        let event = CreditEvent {
            id: self.next_id(),
            user,
            merchant,
            grab,
            kind: CreditEventKind::Redeem,
            local_cents_change: -local_used,
            network_cents_change: -network_used,
            created_at: now,
            description: format!(
                "redeemed {local_used} local + {network_used} network cents at capture"
            ),
        };
        log.push(event.clone());
        debug!(%user, %merchant, local_used, network_used, "posted redeem event");
        Ok(event)
    }

    /// Posts the cashback EARN event at capture.
    ///
    /// `total = floor(paid * pct / 100)`; the local share is floored and
    /// the remainder goes to network credit, so rounding never loses a
    /// cent.
    pub fn post_earn(
        &self,
        user: UserId,
        merchant: MerchantId,
        paid_cents: Cents,
        cashback_pct: i64,
        grab: Option<GrabId>,
    ) -> Result<CreditEvent, EngineError> {
        if paid_cents < 0 || !(0..=100).contains(&cashback_pct) {
            return Err(EngineError::InvalidAmount);
        }
        let total = paid_cents
            .checked_mul(cashback_pct)
            .ok_or(EngineError::InvalidAmount)?
            / 100;
        let local = total
            .checked_mul(self.local_share_pct)
            .ok_or(EngineError::InvalidAmount)?
            / 100;
        let network = total - local;

        let now = self.clock.now();
        let event = CreditEvent {
            id: self.next_id(),
            user,
            merchant,
            grab,
            kind: CreditEventKind::Earn,
            local_cents_change: local,
            network_cents_change: network,
            created_at: now,
            description: format!("cashback {cashback_pct}% on {paid_cents} cents paid"),
        };
        self.events
            .entry((user, merchant))
            .or_default()
            .lock()
            .push(event.clone());
        debug!(%user, %merchant, total, local, network, "posted earn event");
        Ok(event)
    }

    /// Posts a manual ADJUST event. Deltas may be negative; this is the
    /// operator's override and is not balance-checked.
    pub fn post_adjust(
        &self,
        user: UserId,
        merchant: MerchantId,
        local_delta: Cents,
        network_delta: Cents,
        description: impl Into<String>,
    ) -> CreditEvent {
        let event = CreditEvent {
            id: self.next_id(),
            user,
            merchant,
            grab: None,
            kind: CreditEventKind::Adjust,
            local_cents_change: local_delta,
            network_cents_change: network_delta,
            created_at: self.clock.now(),
            description: description.into(),
        };
        self.events
            .entry((user, merchant))
            .or_default()
            .lock()
            .push(event.clone());
        event
    }
}
