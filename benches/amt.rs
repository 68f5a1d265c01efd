// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! ```console
//! $ cargo bench --bench amt
//! ```

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use fvm_ipld_blockstore::MemoryBlockstore;
use ipld_amt::{Amt, diff};
use std::hint::black_box;

const ITEM_COUNT: u64 = 1000;

fn bench_amt(c: &mut Criterion) {
    let mut group = c.benchmark_group("amt");
    for bit_width in [3, 5, 8] {
        group.bench_with_input(BenchmarkId::new("set", bit_width), &bit_width, |b, &bw| {
            b.iter(|| {
                let db = MemoryBlockstore::default();
                let mut a = Amt::new_with_bit_width(&db, bw).unwrap();
                for i in 0..black_box(ITEM_COUNT) {
                    a.set(i, i).unwrap();
                }
            })
        });

        group.bench_with_input(BenchmarkId::new("flush", bit_width), &bit_width, |b, &bw| {
            b.iter(|| {
                let db = MemoryBlockstore::default();
                let mut a = Amt::new_with_bit_width(&db, bw).unwrap();
                a.batch_set(0..black_box(ITEM_COUNT)).unwrap();
                a.flush().unwrap()
            })
        });
    }

    let db = MemoryBlockstore::default();
    let cid = Amt::new_from_iter(&db, 0..ITEM_COUNT).unwrap();
    group.bench_function("load+for_each", |b| {
        b.iter(|| {
            let a: Amt<u64, _> = Amt::load(black_box(&cid), &db).unwrap();
            let mut sum = 0;
            a.for_each(|_, v| {
                sum += *v;
                Ok(())
            })
            .unwrap();
            sum
        })
    });

    let mut changed: Amt<u64, _> = Amt::load(&cid, &db).unwrap();
    for i in (0..ITEM_COUNT).step_by(10) {
        changed.set(i, i + 1).unwrap();
    }
    changed.flush().unwrap();
    group.bench_function("diff", |b| {
        b.iter(|| {
            let prev: Amt<u64, _> = Amt::load(black_box(&cid), &db).unwrap();
            diff(&prev, &changed).unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_amt);
criterion_main!(benches);
