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

//! Grab reservations.
//!
//! A grab is an exclusive, time-boxed hold on a deal, identified by a
//! 6-digit PIN. Grabs move `ACTIVE → LOCKED` when a payment attempt
//! starts (so one grab can never back two concurrent payments),
//! `LOCKED → USED` when the linked transaction captures, and
//! `ACTIVE → EXPIRED` when the hold TTL runs out. Creation is
//! rate-limited per identity to stop deal-grabbing abuse.

use crate::base::{DealId, GrabId, Identity, MerchantId};
use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::error::EngineError;
use crate::rate_limit::RateLimiter;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Lifecycle state of a grab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrabStatus {
    /// Held; redeemable until the TTL elapses.
    Active,
    /// A payment attempt references it.
    Locked,
    /// The linked transaction captured.
    Used,
    /// Hold TTL elapsed while still active.
    Expired,
}

/// An exclusive, time-boxed hold on a deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grab {
    pub id: GrabId,
    pub deal: DealId,
    pub merchant: MerchantId,
    pub identity: Identity,
    /// 6-digit PIN presented at the merchant.
    pub pin: String,
    pub grabbed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: GrabStatus,
}

/// Creates, locks, and expires grabs.
pub struct GrabManager {
    clock: Arc<dyn Clock>,
    hold_ttl: Duration,
    guard: RateLimiter<Identity>,
    grabs: DashMap<GrabId, Mutex<Grab>>,
    next_id: AtomicU64,
}

impl GrabManager {
    pub fn new(hold_ttl: Duration, guard: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock: clock.clone(),
            hold_ttl,
            guard: RateLimiter::new(guard, clock),
            grabs: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn generate_pin() -> String {
        format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
    }

    /// Takes a hold on a deal for the given identity.
    ///
    /// # Errors
    ///
    /// [`EngineError::RateLimited`] (with the cooldown expiry) when the
    /// identity has exhausted its attempt window.
    pub fn grab(
        &self,
        deal: DealId,
        merchant: MerchantId,
        identity: Identity,
    ) -> Result<Grab, EngineError> {
        if self.guard.is_limited(&identity) {
            return Err(EngineError::RateLimited {
                retry_at: self.guard.cooldown_expiry(&identity),
            });
        }
        self.guard.record_attempt(identity.clone());

        let now = self.clock.now();
        let grab = Grab {
            id: GrabId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            deal,
            merchant,
            identity,
            pin: Self::generate_pin(),
            grabbed_at: now,
            expires_at: now + self.hold_ttl,
            status: GrabStatus::Active,
        };
        info!(grab = %grab.id, %deal, %merchant, "grab created");
        self.grabs.insert(grab.id, Mutex::new(grab.clone()));
        Ok(grab)
    }

    /// Releases a hold early. Does not refund the rate-limit attempt.
    pub fn cancel(&self, id: GrabId) {
        self.grabs.remove(&id);
    }

    /// Moves ACTIVE grabs past their TTL to EXPIRED. Idempotent; returns
    /// how many transitioned.
    pub fn expire_sweep(&self) -> usize {
        let now = self.clock.now();
        let mut expired = 0;
        for entry in self.grabs.iter() {
            let mut grab = entry.lock();
            if grab.status == GrabStatus::Active && now > grab.expires_at {
                grab.status = GrabStatus::Expired;
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired, "grab sweep expired holds");
        }
        expired
    }

    /// Locks an ACTIVE grab for a starting payment attempt.
    ///
    /// # Errors
    ///
    /// [`EngineError::GrabNotActive`] if the grab is missing, already
    /// locked or used, or past its TTL (in which case it is expired as a
    /// side effect).
    pub fn lock_for_payment(&self, id: GrabId) -> Result<Grab, EngineError> {
        let entry = self.grabs.get(&id).ok_or(EngineError::GrabNotActive)?;
        let mut grab = entry.lock();
        if grab.status == GrabStatus::Active && self.clock.now() > grab.expires_at {
            grab.status = GrabStatus::Expired;
        }
        if grab.status != GrabStatus::Active {
            return Err(EngineError::GrabNotActive);
        }
        grab.status = GrabStatus::Locked;
        Ok(grab.clone())
    }

    /// PIN-checked variant of [`lock_for_payment`], used by the
    /// merchant-facing redeem path.
    ///
    /// [`lock_for_payment`]: GrabManager::lock_for_payment
    pub fn use_grab(&self, id: GrabId, pin: &str) -> Result<Grab, EngineError> {
        {
            let entry = self.grabs.get(&id).ok_or(EngineError::GrabNotActive)?;
            let grab = entry.lock();
            if grab.pin != pin {
                return Err(EngineError::PinMismatch);
            }
        }
        self.lock_for_payment(id)
    }

    /// Returns a LOCKED grab to ACTIVE when its payment attempt was
    /// voided or expired without capturing. The original TTL stands.
    pub fn release(&self, id: GrabId) -> Result<Grab, EngineError> {
        let entry = self.grabs.get(&id).ok_or(EngineError::GrabNotActive)?;
        let mut grab = entry.lock();
        if grab.status != GrabStatus::Locked {
            return Err(EngineError::GrabNotActive);
        }
        grab.status = GrabStatus::Active;
        Ok(grab.clone())
    }

    /// Marks a LOCKED grab USED once the linked transaction captured.
    pub fn mark_used(&self, id: GrabId) -> Result<Grab, EngineError> {
        let entry = self.grabs.get(&id).ok_or(EngineError::GrabNotActive)?;
        let mut grab = entry.lock();
        if grab.status != GrabStatus::Locked {
            return Err(EngineError::GrabNotActive);
        }
        grab.status = GrabStatus::Used;
        info!(grab = %grab.id, "grab used");
        Ok(grab.clone())
    }

    pub fn get(&self, id: GrabId) -> Option<Grab> {
        self.grabs.get(&id).map(|entry| entry.lock().clone())
    }

    /// All grabs held by an identity, newest first.
    pub fn grabs_of(&self, identity: &Identity) -> Vec<Grab> {
        let mut grabs: Vec<Grab> = self
            .grabs
            .iter()
            .map(|entry| entry.lock().clone())
            .filter(|grab| &grab.identity == identity)
            .collect();
        grabs.sort_by(|a, b| b.grabbed_at.cmp(&a.grabbed_at));
        grabs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const DEAL: DealId = DealId(7);
    const MERCHANT: MerchantId = MerchantId(1);

    fn manager() -> (GrabManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::start_now());
        (
            GrabManager::new(
                Duration::minutes(30),
                RateLimitConfig::grab_guard(),
                clock.clone(),
            ),
            clock,
        )
    }

    fn identity() -> Identity {
        Identity::User(crate::base::UserId(1))
    }

    #[test]
    fn grab_generates_six_digit_pin() {
        let (manager, _clock) = manager();
        let grab = manager.grab(DEAL, MERCHANT, identity()).unwrap();
        assert_eq!(grab.pin.len(), 6);
        assert!(grab.pin.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(grab.status, GrabStatus::Active);
    }

    #[test]
    fn fourth_grab_within_window_is_rate_limited() {
        let (manager, clock) = manager();
        for _ in 0..3 {
            clock.advance(Duration::seconds(5));
            manager.grab(DEAL, MERCHANT, identity()).unwrap();
        }
        let third_attempt = clock.now();

        let err = manager.grab(DEAL, MERCHANT, identity()).unwrap_err();
        assert_eq!(
            err,
            EngineError::RateLimited {
                retry_at: Some(third_attempt + Duration::minutes(15)),
            }
        );
    }

    #[test]
    fn lock_for_payment_takes_active_to_locked() {
        let (manager, _clock) = manager();
        let grab = manager.grab(DEAL, MERCHANT, identity()).unwrap();
        let locked = manager.lock_for_payment(grab.id).unwrap();
        assert_eq!(locked.status, GrabStatus::Locked);

        // A second concurrent payment attempt loses.
        assert_eq!(
            manager.lock_for_payment(grab.id),
            Err(EngineError::GrabNotActive)
        );
    }

    #[test]
    fn lock_expires_stale_grab_as_side_effect() {
        let (manager, clock) = manager();
        let grab = manager.grab(DEAL, MERCHANT, identity()).unwrap();
        clock.advance(Duration::minutes(31));
        assert_eq!(
            manager.lock_for_payment(grab.id),
            Err(EngineError::GrabNotActive)
        );
        assert_eq!(manager.get(grab.id).unwrap().status, GrabStatus::Expired);
    }

    #[test]
    fn use_grab_checks_pin() {
        let (manager, _clock) = manager();
        let grab = manager.grab(DEAL, MERCHANT, identity()).unwrap();
        let wrong = if grab.pin == "000000" { "000001" } else { "000000" };
        assert_eq!(
            manager.use_grab(grab.id, wrong),
            Err(EngineError::PinMismatch)
        );
        let locked = manager.use_grab(grab.id, &grab.pin).unwrap();
        assert_eq!(locked.status, GrabStatus::Locked);
    }

    #[test]
    fn release_returns_locked_grab_to_active() {
        let (manager, _clock) = manager();
        let grab = manager.grab(DEAL, MERCHANT, identity()).unwrap();
        manager.lock_for_payment(grab.id).unwrap();
        let released = manager.release(grab.id).unwrap();
        assert_eq!(released.status, GrabStatus::Active);
        // Redeemable again.
        manager.lock_for_payment(grab.id).unwrap();
    }

    #[test]
    fn mark_used_requires_locked() {
        let (manager, _clock) = manager();
        let grab = manager.grab(DEAL, MERCHANT, identity()).unwrap();
        assert_eq!(manager.mark_used(grab.id), Err(EngineError::GrabNotActive));
        manager.lock_for_payment(grab.id).unwrap();
        assert_eq!(manager.mark_used(grab.id).unwrap().status, GrabStatus::Used);
    }

    #[test]
    fn expire_sweep_is_idempotent() {
        let (manager, clock) = manager();
        let grab = manager.grab(DEAL, MERCHANT, identity()).unwrap();
        clock.advance(Duration::minutes(31));
        assert_eq!(manager.expire_sweep(), 1);
        assert_eq!(manager.expire_sweep(), 0);
        assert_eq!(manager.get(grab.id).unwrap().status, GrabStatus::Expired);
    }

    #[test]
    fn cancel_removes_the_hold() {
        let (manager, _clock) = manager();
        let grab = manager.grab(DEAL, MERCHANT, identity()).unwrap();
        manager.cancel(grab.id);
        assert!(manager.get(grab.id).is_none());
    }
}
