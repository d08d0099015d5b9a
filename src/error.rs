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

//! Error types for the payment code and credit settlement engine.
//!
//! Every fallible operation returns a typed [`EngineError`]; nothing in
//! this crate fails by panicking past its boundary. State-conflict
//! variants (`AlreadyProcessed`, `AlreadyTerminal`, `NotAuthorized`) must
//! be surfaced to the caller unretried. Expiry variants (`CodeExpired`,
//! `PaymentWindowExpired`) are side-effecting: the record has already
//! been driven to its EXPIRED state when they are returned. Resource
//! variants carry the data the caller needs to recover.

use crate::base::Cents;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors returned by engine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Bill amount is zero or negative
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    /// Merchant is unknown or not accepting payments
    #[error("merchant is not active")]
    MerchantNotActive,

    /// Referenced deal does not exist
    #[error("deal not found")]
    DealNotFound,

    /// No live transaction matches the code at this merchant
    #[error("payment code not found")]
    CodeNotFound,

    /// Code TTL elapsed; the transaction has been moved to EXPIRED
    #[error("payment code expired")]
    CodeExpired,

    /// Transaction already left the PENDING state
    #[error("payment code already processed")]
    AlreadyProcessed,

    /// Operation requires the AUTHORIZED state
    #[error("transaction is not authorized")]
    NotAuthorized,

    /// Payment window elapsed; the transaction has been moved to EXPIRED
    #[error("payment window expired")]
    PaymentWindowExpired,

    /// Transaction is already in a terminal state
    #[error("transaction already terminal")]
    AlreadyTerminal,

    /// Could not find a free 6-digit code after bounded retries
    #[error("payment code space exhausted")]
    CodeSpaceExhausted,

    /// Live balance no longer covers the credits allocated at quote time
    #[error("insufficient credit balance (local {local_available}, network {network_available})")]
    InsufficientBalance {
        local_available: Cents,
        network_available: Cents,
    },

    /// Attempt window exhausted; retry after the cooldown expires
    #[error("rate limited")]
    RateLimited { retry_at: Option<DateTime<Utc>> },

    /// Grab is missing, expired, or not in the ACTIVE state
    #[error("grab is not active")]
    GrabNotActive,

    /// Wrong PIN presented for the grab
    #[error("grab PIN does not match")]
    PinMismatch,

    /// Identity already has an outstanding queue entry at this terminal
    #[error("identity already queued")]
    AlreadyQueued,

    /// Terminal is already serving another customer
    #[error("serving slot occupied")]
    SlotOccupied,

    /// No queue entry with the given ID
    #[error("queue entry not found")]
    EntryNotFound,
}

#[cfg(test)]
mod tests {
    use super::EngineError;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            EngineError::InvalidAmount.to_string(),
            "invalid amount (must be positive)"
        );
        assert_eq!(EngineError::MerchantNotActive.to_string(), "merchant is not active");
        assert_eq!(EngineError::CodeNotFound.to_string(), "payment code not found");
        assert_eq!(EngineError::CodeExpired.to_string(), "payment code expired");
        assert_eq!(
            EngineError::AlreadyProcessed.to_string(),
            "payment code already processed"
        );
        assert_eq!(
            EngineError::NotAuthorized.to_string(),
            "transaction is not authorized"
        );
        assert_eq!(
            EngineError::PaymentWindowExpired.to_string(),
            "payment window expired"
        );
        assert_eq!(
            EngineError::AlreadyTerminal.to_string(),
            "transaction already terminal"
        );
        assert_eq!(
            EngineError::CodeSpaceExhausted.to_string(),
            "payment code space exhausted"
        );
        assert_eq!(
            EngineError::InsufficientBalance {
                local_available: 100,
                network_available: 250,
            }
            .to_string(),
            "insufficient credit balance (local 100, network 250)"
        );
        assert_eq!(
            EngineError::RateLimited { retry_at: None }.to_string(),
            "rate limited"
        );
        assert_eq!(EngineError::GrabNotActive.to_string(), "grab is not active");
        assert_eq!(EngineError::PinMismatch.to_string(), "grab PIN does not match");
        assert_eq!(EngineError::AlreadyQueued.to_string(), "identity already queued");
        assert_eq!(EngineError::SlotOccupied.to_string(), "serving slot occupied");
        assert_eq!(EngineError::EntryNotFound.to_string(), "queue entry not found");
    }

    #[test]
    fn errors_are_cloneable() {
        let error = EngineError::InsufficientBalance {
            local_available: 1,
            network_available: 2,
        };
        let cloned = error.clone();
        assert_eq!(error, cloned);
    }
}
