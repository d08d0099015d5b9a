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

//! Payment code lifecycle engine.
//!
//! The [`PaymentEngine`] owns the pending-transaction state machine and
//! wires it to the credit ledger, the grab manager, and the per-terminal
//! lockout guard.
//!
//! # Exactly-once validation
//!
//! `validate` and `confirm_cash_collection` execute as if serialized per
//! `(code, merchant)`: each transaction sits behind its own
//! [`Mutex`], and the status check and the status write happen under one
//! lock acquisition. Of N concurrent validations of one code, exactly
//! one wins; the rest observe [`EngineError::AlreadyProcessed`].
//!
//! # Credits
//!
//! Credit allocation at creation time is a non-binding quote recorded on
//! the transaction. Only capture binds: REDEEM is posted first (re-checked
//! against the live balance), then the cashback EARN on the amount
//! actually paid. A failed redeem leaves the transaction un-captured and
//! no events posted.

use crate::base::{Cents, DealId, GrabId, Identity, MerchantId, TerminalId, TxId, UserId};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::grab::{Grab, GrabManager};
use crate::ledger::{Allocation, CreditLedger};
use crate::rate_limit::RateLimiter;
use crate::transaction::{PaymentCode, PendingTransaction, TxStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// A merchant accepting payment codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Merchant {
    pub id: MerchantId,
    pub name: String,
    /// Inactive merchants reject new transactions.
    pub active: bool,
    /// Cashback earned on captured payments, in percent.
    pub cashback_pct: i64,
}

/// A discounted deal offered by a merchant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    pub id: DealId,
    pub merchant: MerchantId,
    /// Discount off the bill, in percent.
    pub discount_pct: i64,
}

/// Parameters for creating a pending transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub merchant: MerchantId,
    /// `None` for anonymous customers (no credits either way).
    pub user: Option<UserId>,
    pub original_amount_cents: Cents,
    pub deal: Option<DealId>,
    /// An ACTIVE grab to redeem; locked for the lifetime of the attempt.
    pub grab: Option<GrabId>,
    /// Cap on local credits to apply. Use 0 to pay without credits.
    pub local_credits_requested: Cents,
    /// Cap on network credits to apply.
    pub network_credits_requested: Cents,
    /// Card-network reference for the in-app capture callback.
    pub payment_ref: Option<String>,
}

/// Largest accepted bill, in cents. Keeps every percentage product on
/// the money path well inside `i64` range.
pub const MAX_AMOUNT_CENTS: Cents = 100_000_000_000;

/// The payment code and credit settlement engine.
pub struct PaymentEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    ledger: CreditLedger,
    grabs: GrabManager,
    merchants: DashMap<MerchantId, Merchant>,
    deals: DashMap<DealId, Deal>,
    /// All transactions ever created, terminal rows included (audit).
    transactions: DashMap<TxId, Mutex<PendingTransaction>>,
    /// Codes of non-terminal transactions; the uniqueness domain.
    live_codes: DashMap<(MerchantId, PaymentCode), TxId>,
    /// Card-network references of non-terminal transactions.
    payment_refs: DashMap<String, TxId>,
    /// Brute-force guard for code validation, keyed by terminal.
    lockout: RateLimiter<TerminalId>,
    next_tx_id: AtomicU64,
}

impl PaymentEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Engine with an injected time source; tests drive expiry with a
    /// [`ManualClock`](crate::clock::ManualClock).
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger: CreditLedger::new(
                config.local_credit_expiry,
                config.local_share_pct,
                clock.clone(),
            ),
            grabs: GrabManager::new(
                config.grab_hold_ttl,
                config.grab_guard.clone(),
                clock.clone(),
            ),
            lockout: RateLimiter::new(config.terminal_lockout.clone(), clock.clone()),
            merchants: DashMap::new(),
            deals: DashMap::new(),
            transactions: DashMap::new(),
            live_codes: DashMap::new(),
            payment_refs: DashMap::new(),
            next_tx_id: AtomicU64::new(1),
            config,
            clock,
        }
    }

    /// Registers a merchant. The cashback percentage is validated here so
    /// settlement can never fail halfway through posting its events.
    pub fn register_merchant(&self, merchant: Merchant) -> Result<(), EngineError> {
        if !(0..=100).contains(&merchant.cashback_pct) {
            return Err(EngineError::InvalidAmount);
        }
        self.merchants.insert(merchant.id, merchant);
        Ok(())
    }

    /// Registers a deal. Rejects discount percentages outside `0..=100`.
    pub fn register_deal(&self, deal: Deal) -> Result<(), EngineError> {
        if !(0..=100).contains(&deal.discount_pct) {
            return Err(EngineError::InvalidAmount);
        }
        self.deals.insert(deal.id, deal);
        Ok(())
    }

    /// The credit ledger backing this engine.
    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    /// The grab manager backing this engine.
    pub fn grabs(&self) -> &GrabManager {
        &self.grabs
    }

    /// Takes a grab on a deal, resolving the deal's merchant.
    pub fn create_grab(&self, deal: DealId, identity: Identity) -> Result<Grab, EngineError> {
        let merchant = self
            .deals
            .get(&deal)
            .map(|d| d.merchant)
            .ok_or(EngineError::DealNotFound)?;
        self.grabs.grab(deal, merchant, identity)
    }

    /// Creates a pending transaction with a fresh payment code.
    ///
    /// The code is unique among non-terminal transactions at the
    /// merchant; generation retries on collision up to a bounded number
    /// of attempts. Credits are quoted (not posted) against the
    /// discounted bill, capped by the caller's requested amounts.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidAmount`] — amount is zero, negative, or
    ///   above [`MAX_AMOUNT_CENTS`].
    /// - [`EngineError::MerchantNotActive`] — merchant unknown or inactive.
    /// - [`EngineError::DealNotFound`] — deal unknown or owned by another
    ///   merchant.
    /// - [`EngineError::GrabNotActive`] — the referenced grab cannot back
    ///   this payment.
    /// - [`EngineError::CodeSpaceExhausted`] — no free code after bounded
    ///   retries (practically unreachable at 10^6 codes).
    pub fn create(&self, req: CreateRequest) -> Result<PendingTransaction, EngineError> {
        if req.original_amount_cents <= 0 || req.original_amount_cents > MAX_AMOUNT_CENTS {
            return Err(EngineError::InvalidAmount);
        }
        let active = self
            .merchants
            .get(&req.merchant)
            .map(|m| m.active)
            .ok_or(EngineError::MerchantNotActive)?;
        if !active {
            return Err(EngineError::MerchantNotActive);
        }

        let discount_applied = match req.deal {
            Some(deal_id) => {
                let deal = self.deals.get(&deal_id).ok_or(EngineError::DealNotFound)?;
                if deal.merchant != req.merchant {
                    return Err(EngineError::DealNotFound);
                }
                req.original_amount_cents * deal.discount_pct / 100
            }
            None => 0,
        };
        let billable = req.original_amount_cents - discount_applied;

        let allocation = match req.user {
            Some(user) => self.ledger.allocate_capped(
                user,
                req.merchant,
                billable,
                req.local_credits_requested,
                req.network_credits_requested,
            ),
            None => Allocation {
                local_used: 0,
                network_used: 0,
                balance_cents: billable,
            },
        };

        let id = TxId(self.next_tx_id.fetch_add(1, Ordering::Relaxed));
        let code = self.reserve_code(req.merchant, id)?;

        // Lock the grab last so earlier failures leave it untouched.
        if let Some(grab_id) = req.grab {
            if let Err(err) = self.grabs.lock_for_payment(grab_id) {
                self.live_codes.remove(&(req.merchant, code));
                return Err(err);
            }
        }

        let now = self.clock.now();
        let tx = PendingTransaction {
            id,
            merchant: req.merchant,
            user: req.user,
            deal: req.deal,
            grab: req.grab,
            code,
            original_amount_cents: req.original_amount_cents,
            discount_applied_cents: discount_applied,
            local_credits_used_cents: allocation.local_used,
            network_credits_used_cents: allocation.network_used,
            final_amount_cents: allocation.balance_cents.max(0),
            status: TxStatus::Pending,
            created_at: now,
            expires_at: now + self.config.code_ttl,
            authorized_at: None,
            payment_window_expires_at: None,
            captured_at: None,
            voided_at: None,
            void_reason: None,
            payment_ref: req.payment_ref,
        };
        tx.assert_invariants();

        if let Some(ref payment_ref) = tx.payment_ref {
            self.payment_refs.insert(payment_ref.clone(), id);
        }
        self.transactions.insert(id, Mutex::new(tx.clone()));
        info!(
            tx = %id,
            merchant = %req.merchant,
            code = %tx.code,
            final_cents = tx.final_amount_cents,
            "pending transaction created"
        );
        Ok(tx)
    }

    /// Atomically claims a code that no live transaction at the merchant
    /// holds.
    fn reserve_code(&self, merchant: MerchantId, id: TxId) -> Result<PaymentCode, EngineError> {
        let mut rng = rand::thread_rng();
        for _ in 0..self.config.code_max_attempts {
            let candidate = PaymentCode::generate(&mut rng);
            match self.live_codes.entry((merchant, candidate.clone())) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    vacant.insert(id);
                    return Ok(candidate);
                }
            }
        }
        warn!(%merchant, "code space exhausted after bounded retries");
        Err(EngineError::CodeSpaceExhausted)
    }

    /// Validates a presented code at a terminal.
    ///
    /// With `capture_now` the transaction settles immediately (one-tap
    /// mode); otherwise it moves to AUTHORIZED and the payment window
    /// opens. Every failed validation counts against the terminal's
    /// lockout; a success resets the counter.
    ///
    /// # Errors
    ///
    /// - [`EngineError::RateLimited`] — terminal locked out; carries the
    ///   retry instant.
    /// - [`EngineError::CodeNotFound`] — no live transaction matches.
    /// - [`EngineError::CodeExpired`] — TTL elapsed; row moved to EXPIRED.
    /// - [`EngineError::AlreadyProcessed`] — another caller won the
    ///   transition.
    /// - [`EngineError::InsufficientBalance`] — capture-time redeem no
    ///   longer covered; the transaction stays PENDING.
    pub fn validate(
        &self,
        code: &str,
        merchant: MerchantId,
        terminal: TerminalId,
        capture_now: bool,
    ) -> Result<PendingTransaction, EngineError> {
        if let Some(retry_at) = self.lockout.cooldown_expiry(&terminal) {
            return Err(EngineError::RateLimited {
                retry_at: Some(retry_at),
            });
        }

        let Some(tx_id) = self.lookup_live(code, merchant) else {
            self.lockout.record_attempt(terminal);
            return Err(EngineError::CodeNotFound);
        };
        let entry = self
            .transactions
            .get(&tx_id)
            .ok_or(EngineError::CodeNotFound)?;
        let mut tx = entry.lock();
        let now = self.clock.now();

        if tx.status == TxStatus::Pending && now > tx.expires_at {
            self.expire_locked(&mut tx);
            self.lockout.record_attempt(terminal);
            return Err(EngineError::CodeExpired);
        }
        if tx.status != TxStatus::Pending {
            self.lockout.record_attempt(terminal);
            return Err(EngineError::AlreadyProcessed);
        }

        self.lockout.record_success(&terminal);
        if capture_now {
            self.capture_locked(&mut tx, now)?;
            self.retire(&tx);
        } else {
            tx.status = TxStatus::Authorized;
            tx.authorized_at = Some(now);
            tx.payment_window_expires_at = Some(now + self.config.payment_window);
            info!(tx = %tx.id, merchant = %merchant, "code authorized, payment window open");
        }
        Ok(tx.clone())
    }

    /// Confirms cash was collected for an AUTHORIZED code.
    ///
    /// # Errors
    ///
    /// - [`EngineError::CodeNotFound`] — no live transaction matches.
    /// - [`EngineError::NotAuthorized`] — transaction is not AUTHORIZED.
    /// - [`EngineError::PaymentWindowExpired`] — window lapsed; the row is
    ///   demoted to EXPIRED instead of completing.
    pub fn confirm_cash_collection(
        &self,
        code: &str,
        merchant: MerchantId,
    ) -> Result<PendingTransaction, EngineError> {
        let tx_id = self
            .lookup_live(code, merchant)
            .ok_or(EngineError::CodeNotFound)?;
        let entry = self
            .transactions
            .get(&tx_id)
            .ok_or(EngineError::CodeNotFound)?;
        let mut tx = entry.lock();

        if tx.status != TxStatus::Authorized {
            return Err(EngineError::NotAuthorized);
        }
        let now = self.clock.now();
        if tx.payment_window_expires_at.is_some_and(|t| now > t) {
            self.expire_locked(&mut tx);
            return Err(EngineError::PaymentWindowExpired);
        }

        self.capture_locked(&mut tx, now)?;
        self.retire(&tx);
        Ok(tx.clone())
    }

    /// Voids a PENDING or AUTHORIZED transaction. No credit events are
    /// posted; quoted credits were never binding. A linked grab returns
    /// to ACTIVE.
    pub fn void(
        &self,
        code: &str,
        merchant: MerchantId,
        reason: Option<&str>,
    ) -> Result<PendingTransaction, EngineError> {
        let tx_id = self
            .lookup_live(code, merchant)
            .ok_or(EngineError::CodeNotFound)?;
        let entry = self
            .transactions
            .get(&tx_id)
            .ok_or(EngineError::CodeNotFound)?;
        let mut tx = entry.lock();

        if tx.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal);
        }
        tx.status = TxStatus::Voided;
        tx.voided_at = Some(self.clock.now());
        tx.void_reason = reason.map(str::to_owned);
        self.release_grab(&tx);
        self.retire(&tx);
        info!(tx = %tx.id, merchant = %merchant, "transaction voided");
        Ok(tx.clone())
    }

    /// Card-network capture callback for in-app payments.
    ///
    /// A successful capture settles the transaction from PENDING or
    /// AUTHORIZED (the funds are already taken); a failed one voids it.
    pub fn confirm_card_capture(
        &self,
        payment_ref: &str,
        captured: bool,
    ) -> Result<PendingTransaction, EngineError> {
        let tx_id = *self
            .payment_refs
            .get(payment_ref)
            .ok_or(EngineError::CodeNotFound)?;
        let entry = self
            .transactions
            .get(&tx_id)
            .ok_or(EngineError::CodeNotFound)?;
        let mut tx = entry.lock();

        if tx.status.is_terminal() {
            return Err(EngineError::AlreadyProcessed);
        }
        let now = self.clock.now();
        if captured {
            self.capture_locked(&mut tx, now)?;
        } else {
            tx.status = TxStatus::Voided;
            tx.voided_at = Some(now);
            tx.void_reason = Some("card capture failed".to_owned());
            self.release_grab(&tx);
        }
        self.retire(&tx);
        Ok(tx.clone())
    }

    /// Time-triggered sweep: PENDING rows past their TTL and AUTHORIZED
    /// rows past their payment window move to EXPIRED. Idempotent, and
    /// loses gracefully to any operation that already transitioned a row.
    /// Returns how many rows transitioned.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut swept = 0;
        for entry in self.transactions.iter() {
            let mut tx = entry.lock();
            let lapsed = match tx.status {
                TxStatus::Pending => now > tx.expires_at,
                TxStatus::Authorized => {
                    tx.payment_window_expires_at.is_some_and(|t| now > t)
                }
                _ => false,
            };
            if lapsed {
                self.expire_locked(&mut tx);
                swept += 1;
            }
        }
        if swept > 0 {
            info!(swept, "expiry sweep transitioned transactions");
        }
        swept
    }

    /// Looks up a live (non-terminal) transaction by code.
    pub fn get(&self, code: &str, merchant: MerchantId) -> Option<PendingTransaction> {
        let tx_id = self.lookup_live(code, merchant)?;
        self.get_by_id(tx_id)
    }

    /// Looks up any transaction, terminal rows included.
    pub fn get_by_id(&self, id: TxId) -> Option<PendingTransaction> {
        self.transactions.get(&id).map(|entry| entry.lock().clone())
    }

    fn lookup_live(&self, code: &str, merchant: MerchantId) -> Option<TxId> {
        let code = PaymentCode::parse(code)?;
        self.live_codes.get(&(merchant, code)).map(|id| *id)
    }

    /// Settles a transaction: binding REDEEM (re-checked), then cashback
    /// EARN on the amount actually paid, then CAPTURED. Caller holds the
    /// transaction lock.
    fn capture_locked(
        &self,
        tx: &mut PendingTransaction,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if let Some(user) = tx.user {
            // Resolve the cashback rate before the REDEEM so nothing can
            // fail between the two postings. Registration already bounds
            // the percentage; the lookup cannot surface a bad one.
            let cashback_pct = self
                .merchants
                .get(&tx.merchant)
                .map(|m| m.cashback_pct)
                .unwrap_or(0);
            if tx.local_credits_used_cents > 0 || tx.network_credits_used_cents > 0 {
                self.ledger.post_redeem(
                    user,
                    tx.merchant,
                    tx.local_credits_used_cents,
                    tx.network_credits_used_cents,
                    tx.grab,
                )?;
            }
            self.ledger
                .post_earn(user, tx.merchant, tx.final_amount_cents, cashback_pct, tx.grab)?;
        }
        if let Some(grab_id) = tx.grab {
            // Funds are settled at this point; a grab in an unexpected
            // state must not unwind the capture.
            if let Err(err) = self.grabs.mark_used(grab_id) {
                warn!(tx = %tx.id, grab = %grab_id, %err, "could not mark grab used");
            }
        }
        tx.status = TxStatus::Captured;
        tx.captured_at = Some(now);
        info!(tx = %tx.id, merchant = %tx.merchant, paid_cents = tx.final_amount_cents, "captured");
        Ok(())
    }

    /// Moves a row to EXPIRED and retires its indexes. Caller holds the
    /// transaction lock.
    fn expire_locked(&self, tx: &mut PendingTransaction) {
        tx.status = TxStatus::Expired;
        self.release_grab(tx);
        self.retire(tx);
    }

    /// Returns a linked LOCKED grab to ACTIVE so the hold survives a
    /// failed payment attempt until its own TTL.
    fn release_grab(&self, tx: &PendingTransaction) {
        if let Some(grab_id) = tx.grab {
            if let Err(err) = self.grabs.release(grab_id) {
                warn!(tx = %tx.id, grab = %grab_id, %err, "could not release grab");
            }
        }
    }

    /// Removes a transaction from the live-code and payment-ref indexes
    /// once it reaches a terminal state. The audit row remains.
    fn retire(&self, tx: &PendingTransaction) {
        self.live_codes.remove(&(tx.merchant, tx.code.clone()));
        if let Some(ref payment_ref) = tx.payment_ref {
            self.payment_refs.remove(payment_ref);
        }
    }
}
