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

//! Benchmarks for the payment engine.
//!
//! Run with: cargo bench
//!
//! Covers the create/validate/capture hot path, balance folds over long
//! event logs, and multi-threaded creation across customers.

use chrono::Duration;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use paycode_engine::{
    CreateRequest, CreditLedger, EngineConfig, ManualClock, Merchant, MerchantId, PaymentEngine,
    TerminalId, UserId,
};
use rayon::prelude::*;
use std::sync::Arc;

const MERCHANT: MerchantId = MerchantId(1);

fn engine() -> PaymentEngine {
    let engine = PaymentEngine::new(EngineConfig::default());
    engine
        .register_merchant(Merchant {
            id: MERCHANT,
            name: "Bench Cafe".into(),
            active: true,
            cashback_pct: 5,
        })
        .unwrap();
    engine
}

fn request(user: u32, amount_cents: i64) -> CreateRequest {
    CreateRequest {
        merchant: MERCHANT,
        user: Some(UserId(user)),
        original_amount_cents: amount_cents,
        deal: None,
        grab: None,
        local_credits_requested: 0,
        network_credits_requested: 0,
        payment_ref: None,
    }
}

fn bench_create(c: &mut Criterion) {
    c.bench_function("create_pending_transaction", |b| {
        let engine = engine();
        let mut user = 0u32;
        b.iter(|| {
            user = user.wrapping_add(1);
            engine.create(black_box(request(user, 2000))).unwrap()
        })
    });
}

fn bench_create_capture_cycle(c: &mut Criterion) {
    c.bench_function("create_validate_capture", |b| {
        let engine = engine();
        let mut user = 0u32;
        b.iter(|| {
            user = user.wrapping_add(1);
            let tx = engine.create(request(user, 2000)).unwrap();
            engine
                .validate(tx.code.as_str(), MERCHANT, TerminalId(1), true)
                .unwrap()
        })
    });
}

fn bench_balance_fold(c: &mut Criterion) {
    let mut group = c.benchmark_group("balance_fold");
    for events in [100usize, 1_000, 10_000] {
        let ledger = CreditLedger::new(
            Duration::days(90),
            70,
            Arc::new(ManualClock::start_now()),
        );
        for _ in 0..events {
            ledger.post_earn(UserId(1), MERCHANT, 2000, 5, None).unwrap();
        }
        group.throughput(Throughput::Elements(events as u64));
        group.bench_with_input(BenchmarkId::from_parameter(events), &events, |b, _| {
            b.iter(|| black_box(ledger.balance_of(UserId(1), MERCHANT)))
        });
    }
    group.finish();
}

fn bench_parallel_creates(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_creates");
    group.throughput(Throughput::Elements(1_000));
    group.bench_function("rayon_1000", |b| {
        b.iter(|| {
            let engine = engine();
            (0u32..1_000).into_par_iter().for_each(|user| {
                engine.create(request(user, 1500)).unwrap();
            });
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_create,
    bench_create_capture_cycle,
    bench_balance_fold,
    bench_parallel_creates
);
criterion_main!(benches);
