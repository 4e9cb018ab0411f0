use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use tempfile::TempDir;

use pointwal::{IndexWriter, Point, PointsByKey, Wal, WalConfig};

#[derive(Debug)]
struct NullIndex;

impl IndexWriter for NullIndex {
    fn write_index(&self, _points_by_key: PointsByKey) -> pointwal::Result<()> {
        Ok(())
    }
}

fn bench_config() -> WalConfig {
    WalConfig {
        // Keep the background monitor out of the measurement.
        flush_interval: Duration::from_secs(60 * 60),
        ..Default::default()
    }
}

fn make_batch(points: usize, payload: usize) -> Vec<Point> {
    (0..points)
        .map(|i| {
            Point::new(
                format!("series-{}", i % 8).into_bytes(),
                i as i64,
                vec![0xAB; payload],
            )
        })
        .collect()
}

fn bench_write_points(c: &mut Criterion) {
    struct Fixture {
        _dir: TempDir,
        wal: Wal,
    }

    let batch = make_batch(100, 64);

    c.bench_function("write_10x100_point_batches", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().expect("tempdir");
                let wal =
                    Wal::open(dir.path(), bench_config(), Arc::new(NullIndex)).expect("wal open");
                Fixture { _dir: dir, wal }
            },
            |fx| {
                for _ in 0..10 {
                    fx.wal.write_points(black_box(&batch)).unwrap();
                }
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_recovery(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    {
        let wal = Wal::open(dir.path(), bench_config(), Arc::new(NullIndex)).expect("wal open");
        for chunk in make_batch(2000, 64).chunks(100) {
            wal.write_points(chunk).unwrap();
        }
        wal.close().expect("clean close");
    }

    c.bench_function("recover_2000_points", |b| {
        b.iter(|| {
            let wal =
                Wal::open(dir.path(), bench_config(), Arc::new(NullIndex)).expect("wal open");
            black_box(&wal);
            wal.close().expect("clean close");
        })
    });
}

criterion_group!(benches, bench_write_points, bench_recovery);
criterion_main!(benches);
