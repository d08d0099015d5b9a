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

//! Property-based tests for the credit ledger's algebra.
//!
//! These verify invariants that must hold for any bill, balance, and
//! event sequence: allocation bounds, exact cashback splits, and the
//! balance-equals-fold consistency rule.

use chrono::Duration;
use paycode_engine::{Cents, CreditLedger, ManualClock, MerchantId, UserId};
use proptest::prelude::*;
use std::sync::Arc;

const USER: UserId = UserId(1);
const MERCHANT: MerchantId = MerchantId(1);

fn ledger() -> CreditLedger {
    CreditLedger::new(Duration::days(90), 70, Arc::new(ManualClock::start_now()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    /// Allocation never overdraws the bill or either balance, and local
    /// credit is always drawn first.
    #[test]
    fn allocation_bounds(
        local in 0i64..1_000_000,
        network in 0i64..1_000_000,
        bill in 1i64..1_000_000,
    ) {
        let ledger = ledger();
        ledger.post_adjust(USER, MERCHANT, local, network, "seed");

        let allocation = ledger.allocate(USER, MERCHANT, bill, true);
        prop_assert!(allocation.local_used + allocation.network_used <= bill);
        prop_assert!(allocation.local_used <= local);
        prop_assert!(allocation.network_used <= network);
        prop_assert_eq!(allocation.local_used, local.min(bill));
        prop_assert_eq!(
            allocation.balance_cents,
            bill - allocation.local_used - allocation.network_used
        );
    }

    /// The cashback split is exact: no cent is lost to rounding.
    #[test]
    fn earn_split_is_exact(
        paid in 0i64..10_000_000,
        pct in 0i64..=100,
    ) {
        let ledger = ledger();
        let event = ledger.post_earn(USER, MERCHANT, paid, pct, None).unwrap();

        let total = paid * pct / 100;
        prop_assert_eq!(
            event.local_cents_change + event.network_cents_change,
            total
        );
        prop_assert_eq!(event.local_cents_change, total * 70 / 100);
        prop_assert!(event.local_cents_change >= 0);
        prop_assert!(event.network_cents_change >= 0);
    }

    /// With no expiry in play, the balance is exactly the sum of event
    /// deltas, whatever mix of earns, redeems, and adjusts was posted.
    #[test]
    fn balance_equals_event_fold(
        seeds in prop::collection::vec((0i64..10_000, 0i64..10_000), 1..8),
        earns in prop::collection::vec((0i64..100_000, 0i64..=100), 0..8),
        redeem_fraction in 0u32..=100,
    ) {
        let ledger = ledger();
        for (local, network) in &seeds {
            ledger.post_adjust(USER, MERCHANT, *local, *network, "seed");
        }
        for (paid, pct) in &earns {
            ledger.post_earn(USER, MERCHANT, *paid, *pct, None).unwrap();
        }

        // Redeem a fraction of whatever is live; always covered.
        let live = ledger.balance_of(USER, MERCHANT);
        let local_used = live.local_cents * i64::from(redeem_fraction) / 100;
        let network_used = live.network_cents * i64::from(redeem_fraction) / 100;
        if local_used > 0 || network_used > 0 {
            ledger
                .post_redeem(USER, MERCHANT, local_used, network_used, None)
                .unwrap();
        }

        let events = ledger.events_of(USER, MERCHANT);
        let local_sum: Cents = events.iter().map(|e| e.local_cents_change).sum();
        let network_sum: Cents = events.iter().map(|e| e.network_cents_change).sum();

        let balance = ledger.balance_of(USER, MERCHANT);
        prop_assert_eq!(balance.local_cents, local_sum);
        prop_assert_eq!(balance.network_cents, network_sum);
    }

    /// Redeeming more than the live balance always fails, and a failed
    /// redeem posts nothing.
    #[test]
    fn overdraw_is_rejected_without_side_effects(
        local in 0i64..10_000,
        network in 0i64..10_000,
        excess in 1i64..10_000,
    ) {
        let ledger = ledger();
        ledger.post_adjust(USER, MERCHANT, local, network, "seed");

        let before = ledger.events_of(USER, MERCHANT).len();
        let result = ledger.post_redeem(USER, MERCHANT, local + excess, network, None);
        prop_assert!(result.is_err());
        prop_assert_eq!(ledger.events_of(USER, MERCHANT).len(), before);
    }
}

proptest! {
    /// Lazy local expiry: lots older than the horizon never count, and
    /// the network balance is untouched by time.
    #[test]
    fn expired_local_lots_never_count(
        local in 1i64..10_000,
        network in 0i64..10_000,
        age_days in 0i64..200,
    ) {
        let clock = Arc::new(ManualClock::start_now());
        let ledger = CreditLedger::new(Duration::days(90), 70, clock.clone());
        ledger.post_adjust(USER, MERCHANT, local, network, "seed");
        clock.advance(Duration::days(age_days));

        let balance = ledger.balance_of(USER, MERCHANT);
        let expected_local = if age_days > 90 { 0 } else { local };
        prop_assert_eq!(balance.local_cents, expected_local);
        prop_assert_eq!(balance.network_cents, network);
    }
}
