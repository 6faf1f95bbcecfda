//! Benchmarks for range decomposition and list lookups.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use edgeacl::cidr::range_to_cidrs;
use edgeacl::iplist::{IpItem, IpList};
use std::hint::black_box;
use std::net::{IpAddr, Ipv4Addr};

/// Worst-case ranges: unaligned on both ends
fn generate_ranges(count: usize) -> Vec<(u32, u32)> {
    (0..count)
        .map(|i| {
            let from = (i as u32).wrapping_mul(2_654_435_761) | 1;
            let span = 1 + (i as u32 % 65_000) * 97;
            (from, from.saturating_add(span))
        })
        .collect()
}

fn bench_range_to_cidrs(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_to_cidrs");

    for size in [100, 1000, 10000] {
        let ranges = generate_ranges(size);
        group.bench_with_input(BenchmarkId::new("unaligned", size), &ranges, |b, ranges| {
            b.iter(|| {
                for (from, to) in ranges {
                    black_box(range_to_cidrs(*from, *to));
                }
            });
        });
    }

    group.bench_function("full_space", |b| {
        b.iter(|| black_box(range_to_cidrs(black_box(1), black_box(u32::MAX - 1))))
    });

    group.finish();
}

/// A list with `count` /24-sized ranges and as many single addresses
fn build_list(count: usize) -> IpList {
    let list = IpList::new(1);
    for i in 0..count {
        let base = 0x0A00_0000u32 + (i as u32) * 512;
        let from = Ipv4Addr::from(base).to_string();
        let to = Ipv4Addr::from(base + 255).to_string();
        if let Ok(item) = IpItem::from_strings(i as u64 * 2, "ipv4", &from, &to) {
            list.add_delay(item);
        }
        let single = Ipv4Addr::from(base + 300).to_string();
        if let Ok(item) = IpItem::from_strings(i as u64 * 2 + 1, "ipv4", &single, "") {
            list.add_delay(item);
        }
    }
    list.sort();
    list
}

fn bench_contains(c: &mut Criterion) {
    let mut group = c.benchmark_group("contains");

    for size in [1000, 10000, 100000] {
        let list = build_list(size);
        let hit = IpAddr::V4(Ipv4Addr::from(0x0A00_0000u32 + (size as u32 / 2) * 512 + 7));
        let miss = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));

        group.bench_with_input(BenchmarkId::new("range_hit", size), &list, |b, list| {
            b.iter(|| black_box(list.contains_ip(black_box(hit))))
        });
        group.bench_with_input(BenchmarkId::new("miss", size), &list, |b, list| {
            b.iter(|| black_box(list.contains_ip(black_box(miss))))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_range_to_cidrs, bench_contains);
criterion_main!(benches);
