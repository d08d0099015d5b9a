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

//! Terminal-scoped serving queue.
//!
//! A physical terminal picks one customer at a time from the set of
//! simultaneously held payment codes. A [`SegQueue`] preserves FIFO
//! order while a [`DashMap`] holds the live entries; removals (skip,
//! completion, no-show) simply delete the map entry, and the stale ID
//! left in the queue is discarded as a tombstone when popped.
//!
//! The "currently serving" slot is a single mutable resource per
//! terminal, guarded by one mutex so `call_next` and `call_specific`
//! can never double-assign it. Calling an entry opens the same payment
//! window the lifecycle enforces on authorized codes; a window that
//! lapses while serving counts as a no-show.

use crate::base::{DealId, Identity, TxId};
use crate::clock::Clock;
use crate::error::EngineError;
use crate::transaction::PaymentCode;
use chrono::{DateTime, Duration, Utc};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

/// A customer waiting at one terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Pending-transaction ID, or a pre-allocation placeholder.
    pub id: TxId,
    pub display_name: String,
    pub deal_ref: Option<DealId>,
    pub code: PaymentCode,
    pub joined_at: DateTime<Utc>,
    /// Set when the entry is called; cleared by completion or no-show.
    pub payment_window_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Queued {
    entry: QueueEntry,
    identity: Identity,
}

/// FIFO dispatcher for one terminal.
pub struct ServingQueue {
    clock: Arc<dyn Clock>,
    payment_window: Duration,
    /// FIFO of entry IDs; may contain tombstones of removed entries.
    order: SegQueue<TxId>,
    /// Live entries indexed by ID.
    entries: DashMap<TxId, Queued>,
    /// One outstanding entry per identity.
    identities: DashMap<Identity, TxId>,
    /// The single "currently serving" slot.
    serving: Mutex<Option<TxId>>,
    no_shows: AtomicU32,
}

impl ServingQueue {
    pub fn new(payment_window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            payment_window,
            order: SegQueue::new(),
            entries: DashMap::new(),
            identities: DashMap::new(),
            serving: Mutex::new(None),
            no_shows: AtomicU32::new(0),
        }
    }

    /// Appends a customer to the tail.
    ///
    /// # Errors
    ///
    /// [`EngineError::AlreadyQueued`] if the identity already has an
    /// outstanding entry.
    pub fn enqueue(
        &self,
        id: TxId,
        identity: Identity,
        display_name: impl Into<String>,
        deal_ref: Option<DealId>,
        code: PaymentCode,
    ) -> Result<QueueEntry, EngineError> {
        // Entry API gives an atomic check-and-claim on the identity.
        match self.identities.entry(identity.clone()) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyQueued),
            Entry::Vacant(vacant) => {
                vacant.insert(id);
            }
        }

        let entry = QueueEntry {
            id,
            display_name: display_name.into(),
            deal_ref,
            code,
            joined_at: self.clock.now(),
            payment_window_expires_at: None,
        };
        self.entries.insert(id, Queued {
            entry: entry.clone(),
            identity,
        });
        self.order.push(id);
        Ok(entry)
    }

    /// Pops the head of the queue into the serving slot and opens its
    /// payment window. Returns `None` when nobody is waiting.
    ///
    /// # Errors
    ///
    /// [`EngineError::SlotOccupied`] while another entry is being served.
    pub fn call_next(&self) -> Result<Option<QueueEntry>, EngineError> {
        let mut serving = self.serving.lock();
        if serving.is_some() {
            return Err(EngineError::SlotOccupied);
        }
        loop {
            let Some(id) = self.order.pop() else {
                return Ok(None);
            };
            if let Some(mut queued) = self.entries.get_mut(&id) {
                let deadline = self.clock.now() + self.payment_window;
                queued.entry.payment_window_expires_at = Some(deadline);
                *serving = Some(id);
                info!(entry = %id, "serving next in queue");
                return Ok(Some(queued.entry.clone()));
            }
            // Tombstone of a removed entry; keep popping.
        }
    }

    /// Serves a specific entry, out of FIFO order, for merchant-directed
    /// selection.
    pub fn call_specific(&self, id: TxId) -> Result<QueueEntry, EngineError> {
        let mut serving = self.serving.lock();
        if serving.is_some() {
            return Err(EngineError::SlotOccupied);
        }
        let mut queued = self.entries.get_mut(&id).ok_or(EngineError::EntryNotFound)?;
        let deadline = self.clock.now() + self.payment_window;
        queued.entry.payment_window_expires_at = Some(deadline);
        *serving = Some(id);
        info!(entry = %id, "serving directed pick");
        Ok(queued.entry.clone())
    }

    fn remove(&self, id: TxId) -> Result<QueueEntry, EngineError> {
        let (_, queued) = self.entries.remove(&id).ok_or(EngineError::EntryNotFound)?;
        self.identities.remove(&queued.identity);
        let mut serving = self.serving.lock();
        if *serving == Some(id) {
            *serving = None;
        }
        Ok(queued.entry)
    }

    /// Removes an entry without processing it, releasing the serving
    /// slot if it held it. The tombstoned ID ages out of the FIFO.
    pub fn skip(&self, id: TxId) -> Result<QueueEntry, EngineError> {
        self.remove(id)
    }

    /// Removes an entry whose payment completed.
    pub fn complete(&self, id: TxId) -> Result<QueueEntry, EngineError> {
        self.remove(id)
    }

    /// No-show check: if the served entry's payment window lapsed, it is
    /// removed, the no-show counter bumped, and the slot released.
    /// Idempotent; safe to run from a timer alongside other calls.
    pub fn expire_serving(&self) -> Option<QueueEntry> {
        let now = self.clock.now();
        let expired_id = {
            let serving = self.serving.lock();
            let id = (*serving)?;
            let queued = self.entries.get(&id)?;
            if queued.entry.payment_window_expires_at.is_some_and(|t| now > t) {
                Some(id)
            } else {
                None
            }
        }?;
        let entry = self.remove(expired_id).ok()?;
        self.no_shows.fetch_add(1, Ordering::Relaxed);
        info!(entry = %expired_id, "no-show: payment window lapsed while serving");
        Some(entry)
    }

    /// Live entries, including the one being served.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn currently_serving(&self) -> Option<QueueEntry> {
        let serving = self.serving.lock();
        let id = (*serving)?;
        self.entries.get(&id).map(|queued| queued.entry.clone())
    }

    pub fn no_show_count(&self) -> u32 {
        self.no_shows.load(Ordering::Relaxed)
    }
}
