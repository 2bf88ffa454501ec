use std::hint::black_box;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use tinyredis::dict::{BytesType, Dict};
use tinyredis::skiplist::SkipList;

const N: usize = 10_000;

fn keys() -> Vec<Vec<u8>> {
    (0..N).map(|i| format!("key:{i}").into_bytes()).collect()
}

fn bench_dict(c: &mut Criterion) {
    let keys = keys();

    c.bench_function("dict_insert_10k", |b| {
        b.iter_batched(
            || keys.clone(),
            |keys| {
                let mut d: Dict<Vec<u8>, u64, BytesType> = Dict::new(BytesType);
                for (i, k) in keys.into_iter().enumerate() {
                    let _ = d.add(k, i as u64);
                }
                d
            },
            BatchSize::SmallInput,
        )
    });

    let mut d: Dict<Vec<u8>, u64, BytesType> = Dict::new(BytesType);
    for (i, k) in keys.iter().enumerate() {
        let _ = d.add(k.clone(), i as u64);
    }
    while d.rehash(100) {}
    c.bench_function("dict_find_10k", |b| {
        b.iter(|| {
            for k in &keys {
                black_box(d.get(k));
            }
        })
    });
}

fn bench_skiplist(c: &mut Criterion) {
    let keys = keys();

    c.bench_function("skiplist_insert_10k", |b| {
        b.iter_batched(
            || keys.clone(),
            |keys| {
                let mut zsl = SkipList::new();
                for (i, k) in keys.into_iter().enumerate() {
                    zsl.insert((i * 7 % N) as f64, k);
                }
                zsl
            },
            BatchSize::SmallInput,
        )
    });

    let mut zsl = SkipList::new();
    for (i, k) in keys.iter().enumerate() {
        zsl.insert((i * 7 % N) as f64, k.clone());
    }
    c.bench_function("skiplist_rank_10k", |b| {
        b.iter(|| {
            for (i, k) in keys.iter().enumerate() {
                black_box(zsl.get_rank((i * 7 % N) as f64, k));
            }
        })
    });
}

criterion_group!(benches, bench_dict, bench_skiplist);
criterion_main!(benches);
