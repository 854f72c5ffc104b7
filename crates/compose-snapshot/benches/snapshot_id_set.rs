use compose_snapshot::{with_mutable_snapshot, MutableState, Snapshot, SnapshotId, SnapshotIdSet};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const SET_SIZE_SAMPLES: &[u64] = &[16, 128, 1024, 8192];
const CELL_COUNT: usize = 256;

/// Ids spread the way long-lived open snapshots leave them: mostly dense near
/// the top, with stragglers far below.
fn open_ids(count: u64) -> SnapshotIdSet {
    let base: SnapshotId = 1_000_000;
    (0..count)
        .map(|i| if i % 8 == 0 { base - i * 97 } else { base + i })
        .collect()
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_id_set_with");
    for &count in SET_SIZE_SAMPLES {
        group.bench_with_input(BenchmarkId::new("ids", count), &count, |b, &count| {
            b.iter(|| {
                let mut set = SnapshotIdSet::new();
                for id in 2..2 + count {
                    set = set.with(id);
                }
                black_box(set);
            });
        });
    }
    group.finish();
}

fn bench_contains(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_id_set_contains");
    for &count in SET_SIZE_SAMPLES {
        let set = open_ids(count);
        group.bench_with_input(BenchmarkId::new("ids", count), &set, |b, set| {
            b.iter(|| {
                let mut hits = 0;
                for id in (1_000_000 - 4096)..(1_000_000 + 4096) {
                    if set.contains(black_box(id)) {
                        hits += 1;
                    }
                }
                black_box(hits);
            });
        });
    }
    group.finish();
}

fn bench_algebra(c: &mut Criterion) {
    let left = open_ids(1024);
    let right: SnapshotIdSet = (999_000..1_001_000).step_by(3).collect();

    c.bench_function("snapshot_id_set_union_subtract", |b| {
        b.iter(|| {
            let merged = left.union(&right).subtract(&right);
            black_box(merged);
        });
    });
}

fn bench_cell_reads(c: &mut Criterion) {
    let cells: Vec<MutableState<usize>> = (0..CELL_COUNT).map(MutableState::new).collect();
    for _ in 0..4 {
        with_mutable_snapshot(|| {
            for cell in &cells {
                cell.update(|value| *value += 1).ok();
            }
        })
        .ok();
    }
    let snapshot = Snapshot::take_snapshot(None);

    c.bench_function("mutable_state_get_in", |b| {
        b.iter(|| {
            let mut sum = 0;
            for cell in &cells {
                sum += cell.get_in(&snapshot).unwrap_or_default();
            }
            black_box(sum);
        });
    });
    snapshot.dispose();
}

criterion_group!(
    snapshot_id_set,
    bench_insert,
    bench_contains,
    bench_algebra,
    bench_cell_reads
);
criterion_main!(snapshot_id_set);
