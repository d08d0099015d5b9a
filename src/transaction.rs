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

//! Pending transactions and their state machine.
//!
//! Lifecycle:
//!
//! ```text
//! PENDING ──validate(capture)──────────────► CAPTURED
//! PENDING ──validate──► AUTHORIZED ──confirm─► CAPTURED
//! PENDING | AUTHORIZED ──void──► VOIDED
//! PENDING | AUTHORIZED ──ttl/window──► EXPIRED
//! ```
//!
//! CAPTURED, VOIDED, and EXPIRED are terminal; terminal rows are never
//! deleted, only retired from the live-code index.

use crate::base::{Cents, DealId, GrabId, MerchantId, TxId, UserId};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a pending transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    Authorized,
    Captured,
    Voided,
    Expired,
}

impl TxStatus {
    /// Terminal states absorb; no transition leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, TxStatus::Captured | TxStatus::Voided | TxStatus::Expired)
    }
}

/// Human-presentable 6-digit payment code.
///
/// Unique among non-terminal transactions at one merchant; codes of
/// terminal transactions may be reissued.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentCode(String);

impl PaymentCode {
    /// Draws a uniformly random code from the 10^6 code space.
    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        Self(format!("{:06}", rng.gen_range(0..1_000_000u32)))
    }

    /// Accepts exactly 6 ASCII digits.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() == 6 && raw.chars().all(|c| c.is_ascii_digit()) {
            Some(Self(raw.to_owned()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PaymentCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single attempted payment, from creation to terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub id: TxId,
    pub merchant: MerchantId,
    /// `None` for anonymous customers; they carry and earn no credits.
    pub user: Option<UserId>,
    pub deal: Option<DealId>,
    pub grab: Option<GrabId>,
    pub code: PaymentCode,
    pub original_amount_cents: Cents,
    pub discount_applied_cents: Cents,
    pub local_credits_used_cents: Cents,
    pub network_credits_used_cents: Cents,
    pub final_amount_cents: Cents,
    pub status: TxStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub authorized_at: Option<DateTime<Utc>>,
    /// Deadline for cash confirmation, set when authorized.
    pub payment_window_expires_at: Option<DateTime<Utc>>,
    pub captured_at: Option<DateTime<Utc>>,
    pub voided_at: Option<DateTime<Utc>>,
    pub void_reason: Option<String>,
    /// Card-network capture reference for in-app payments.
    pub payment_ref: Option<String>,
}

impl PendingTransaction {
    /// Checks the amount identity that must hold at all times.
    pub(crate) fn assert_invariants(&self) {
        debug_assert_eq!(
            self.final_amount_cents,
            (self.original_amount_cents
                - self.discount_applied_cents
                - self.local_credits_used_cents
                - self.network_credits_used_cents)
                .max(0),
            "final amount does not match discount/credit breakdown"
        );
        debug_assert!(self.local_credits_used_cents >= 0);
        debug_assert!(self.network_credits_used_cents >= 0);
    }
}
