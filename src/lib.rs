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

//! # Paycode Engine
//!
//! A payment code and credit settlement engine: customers generate a
//! short-lived 6-digit code, the merchant validates it against a bill,
//! and the transaction settles atomically against a two-tier credit
//! ledger (merchant-local and network-wide credits).
//!
//! ## Core Components
//!
//! - [`PaymentEngine`]: the pending-transaction state machine
//!   (`PENDING → AUTHORIZED → CAPTURED`, with `VOIDED`/`EXPIRED`)
//! - [`CreditLedger`]: append-only event log with derived balances,
//!   local-before-network allocation, and the 70/30 cashback split
//! - [`GrabManager`]: rate-limited, PIN-guarded holds on deals
//! - [`ServingQueue`]: terminal-scoped FIFO with a single serving slot
//! - [`RateLimiter`]: sliding-window attempt guard with cooldown
//!
//! ## Example
//!
//! ```
//! use paycode_engine::{
//!     CreateRequest, EngineConfig, Merchant, MerchantId, PaymentEngine, TerminalId, TxStatus,
//!     UserId,
//! };
//!
//! let engine = PaymentEngine::new(EngineConfig::default());
//! engine
//!     .register_merchant(Merchant {
//!         id: MerchantId(1),
//!         name: "Corner Cafe".into(),
//!         active: true,
//!         cashback_pct: 5,
//!     })
//!     .unwrap();
//!
//! let tx = engine
//!     .create(CreateRequest {
//!         merchant: MerchantId(1),
//!         user: Some(UserId(1)),
//!         original_amount_cents: 2_000,
//!         deal: None,
//!         grab: None,
//!         local_credits_requested: 0,
//!         network_credits_requested: 0,
//!         payment_ref: None,
//!     })
//!     .unwrap();
//!
//! // Merchant scans the code and captures in one tap.
//! let captured = engine
//!     .validate(tx.code.as_str(), MerchantId(1), TerminalId(1), true)
//!     .unwrap();
//! assert_eq!(captured.status, TxStatus::Captured);
//! ```
//!
//! ## Thread Safety
//!
//! All components are safe for concurrent use. Each pending transaction
//! sits behind its own lock, so concurrent validations of one code
//! yield exactly one winner; per-pair ledger locks make the
//! balance-check-then-append sequence atomic.

pub mod base;
pub mod clock;
pub mod config;
mod engine;
pub mod error;
mod grab;
mod ledger;
mod payload;
mod queue;
mod rate_limit;
mod transaction;

pub use base::{Cents, DealId, GrabId, Identity, MerchantId, TerminalId, TxId, UserId};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, RateLimitConfig};
pub use engine::{CreateRequest, Deal, MAX_AMOUNT_CENTS, Merchant, PaymentEngine};
pub use error::EngineError;
pub use grab::{Grab, GrabManager, GrabStatus};
pub use ledger::{Allocation, CreditBalance, CreditEvent, CreditEventKind, CreditLedger};
pub use payload::{CodePayload, PayloadMode};
pub use queue::{QueueEntry, ServingQueue};
pub use rate_limit::RateLimiter;
pub use transaction::{PaymentCode, PendingTransaction, TxStatus};
