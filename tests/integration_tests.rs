use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use pointwal::{IndexWriter, Point, Wal, WalConfig};

mod support;
use support::{collect, wait_for, wal_files, MockIndexWriter};

fn quiet_config(partition_count: u64) -> WalConfig {
    // Thresholds high enough that the background monitor never flushes.
    WalConfig {
        partition_count,
        flush_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

#[test]
fn test_scenario_single_write_cursor_reads_it() {
    let dir = tempdir().unwrap();
    let index = MockIndexWriter::new_shared();
    let wal = Wal::open(dir.path(), quiet_config(1), index).unwrap();

    wal.write_points(&[Point::new(b"cpu".to_vec(), 1000, vec![0x41])])
        .unwrap();

    let mut cursor = wal.cursor(b"cpu").unwrap();
    let (ts, data) = cursor.seek(&0u64.to_be_bytes()).unwrap();
    assert_eq!(ts, &1000u64.to_be_bytes());
    assert_eq!(data, &[0x41]);
    assert!(cursor.next().is_none());
}

#[test]
fn test_scenario_cross_partition() {
    let dir = tempdir().unwrap();
    let index = MockIndexWriter::new_shared();
    let wal = Wal::open(dir.path(), quiet_config(4), index).unwrap();

    wal.write_points(&[
        Point::new(b"a".to_vec(), 1, vec![1]),
        Point::new(b"b".to_vec(), 2, vec![2]),
    ])
    .unwrap();

    let mut cursor = wal.cursor(b"a").unwrap();
    assert_eq!(collect(&mut cursor), vec![(1, vec![1])]);
    let mut cursor = wal.cursor(b"b").unwrap();
    assert_eq!(collect(&mut cursor), vec![(2, vec![2])]);

    // The two keys hash to different partitions, one segment each.
    let files = wal_files(dir.path());
    assert_eq!(files, vec!["01.000001.wal", "02.000001.wal"]);
}

#[test]
fn test_scenario_rotation() {
    let dir = tempdir().unwrap();
    let index = MockIndexWriter::new_shared();
    let config = WalConfig {
        segment_size: 64,
        ..quiet_config(1)
    };
    let wal = Wal::open(dir.path(), config, index).unwrap();

    for i in 0..10i64 {
        wal.write_points(&[Point::new(b"k".to_vec(), i, vec![0u8; 32])])
            .unwrap();
    }

    assert!(
        wal_files(dir.path()).len() >= 2,
        "expected segment rotation to leave multiple files: {:?}",
        wal_files(dir.path())
    );

    let mut cursor = wal.cursor(b"k").unwrap();
    let got = collect(&mut cursor);
    assert_eq!(got.len(), 10);
    assert!(
        got.windows(2).all(|w| w[0].0 < w[1].0),
        "cursor must return points in timestamp order"
    );
}

#[test]
fn test_scenario_background_flush() {
    let dir = tempdir().unwrap();
    let index = MockIndexWriter::new_shared();
    let config = WalConfig {
        ready_series_size: 64,
        compaction_threshold: 0.0,
        ..quiet_config(1)
    };
    let wal = Wal::open(dir.path(), config, Arc::clone(&index) as Arc<dyn IndexWriter>).unwrap();

    // 100 cached bytes for "hot" (8-byte timestamp prefix + 92 payload);
    // "cold" stays far below the ready size.
    wal.write_points(&[
        Point::new(b"hot".to_vec(), 1, vec![7u8; 92]),
        Point::new(b"cold".to_vec(), 5, vec![9]),
    ])
    .unwrap();

    assert!(
        wait_for(|| index.write_count() > 0, Duration::from_secs(5)),
        "background monitor never flushed the hot series"
    );

    let flushed = index.flushed();
    assert_eq!(flushed.len(), 1, "only the hot series should flush");
    let hot = &flushed[b"hot".as_slice()];
    assert_eq!(hot.len(), 1);
    assert!(
        hot.windows(2).all(|w| w[0] <= w[1]),
        "index input must be sorted"
    );

    // Flushed data no longer shows up in cursors; the cold key is untouched.
    assert!(wait_for(
        || {
            let mut c = wal.cursor(b"hot").unwrap();
            c.next().is_none()
        },
        Duration::from_secs(5)
    ));
    let mut cursor = wal.cursor(b"cold").unwrap();
    assert_eq!(collect(&mut cursor), vec![(5, vec![9])]);
}

#[test]
fn test_round_trip_across_close_and_open() {
    let dir = tempdir().unwrap();

    let mut written: Vec<Point> = Vec::new();
    for i in 0..50i64 {
        written.push(Point::new(
            format!("series-{}", i % 7).into_bytes(),
            i * 10,
            i.to_be_bytes().to_vec(),
        ));
    }

    {
        let index = MockIndexWriter::new_shared();
        let wal = Wal::open(dir.path(), quiet_config(4), index).unwrap();
        wal.write_points(&written).unwrap();
        wal.close().unwrap();
    }

    let index = MockIndexWriter::new_shared();
    let wal = Wal::open(dir.path(), quiet_config(4), index).unwrap();
    for series in 0..7 {
        let key = format!("series-{}", series).into_bytes();
        let expected: Vec<(i64, Vec<u8>)> = written
            .iter()
            .filter(|p| p.key == key)
            .map(|p| (p.timestamp, p.data.clone()))
            .collect();

        let mut cursor = wal.cursor(&key).unwrap();
        assert_eq!(collect(&mut cursor), expected, "series {} mismatch", series);
    }
}

#[test]
fn test_per_key_order_with_ties() {
    let dir = tempdir().unwrap();
    let index = MockIndexWriter::new_shared();
    let wal = Wal::open(dir.path(), quiet_config(1), index).unwrap();

    // Out of order, with three writes at t=50.
    wal.write_points(&[
        Point::new(b"k".to_vec(), 100, b"d".to_vec()),
        Point::new(b"k".to_vec(), 50, b"a".to_vec()),
        Point::new(b"k".to_vec(), 50, b"b".to_vec()),
    ])
    .unwrap();
    wal.write_points(&[
        Point::new(b"k".to_vec(), 50, b"c".to_vec()),
        Point::new(b"k".to_vec(), 75, b"e".to_vec()),
    ])
    .unwrap();

    let mut cursor = wal.cursor(b"k").unwrap();
    assert_eq!(
        collect(&mut cursor),
        vec![
            (50, b"a".to_vec()),
            (50, b"b".to_vec()),
            (50, b"c".to_vec()),
            (75, b"e".to_vec()),
            (100, b"d".to_vec()),
        ]
    );
}

#[test]
fn test_round_trip_with_shuffled_timestamps() {
    use rand::seq::SliceRandom;

    let dir = tempdir().unwrap();
    let index = MockIndexWriter::new_shared();
    let wal = Wal::open(dir.path(), quiet_config(1), index).unwrap();

    let mut timestamps: Vec<i64> = (0..100).collect();
    timestamps.shuffle(&mut rand::thread_rng());
    for chunk in timestamps.chunks(7) {
        let batch: Vec<Point> = chunk
            .iter()
            .map(|&ts| Point::new(b"k".to_vec(), ts, ts.to_be_bytes().to_vec()))
            .collect();
        wal.write_points(&batch).unwrap();
    }

    let mut cursor = wal.cursor(b"k").unwrap();
    let got = collect(&mut cursor);
    let expected: Vec<(i64, Vec<u8>)> = (0..100)
        .map(|ts: i64| (ts, ts.to_be_bytes().to_vec()))
        .collect();
    assert_eq!(got, expected);
}

#[test]
fn test_routing_is_stable_across_batches() {
    let dir = tempdir().unwrap();
    let index = MockIndexWriter::new_shared();
    let wal = Wal::open(dir.path(), quiet_config(10), index).unwrap();

    wal.write_points(&[Point::new(b"stable-key".to_vec(), 1, vec![1])])
        .unwrap();
    wal.write_points(&[Point::new(b"stable-key".to_vec(), 2, vec![2])])
        .unwrap();

    // Both writes landed in the same partition: exactly one segment file.
    let files = wal_files(dir.path());
    assert_eq!(files.len(), 1, "unexpected files: {:?}", files);

    let mut cursor = wal.cursor(b"stable-key").unwrap();
    assert_eq!(collect(&mut cursor).len(), 2);
}

#[test]
fn test_write_after_close_is_rejected() {
    let dir = tempdir().unwrap();
    let index = MockIndexWriter::new_shared();
    let wal = Wal::open(dir.path(), quiet_config(1), index).unwrap();
    wal.close().unwrap();

    let err = wal
        .write_points(&[Point::new(b"k".to_vec(), 1, vec![1])])
        .unwrap_err();
    assert!(matches!(err, pointwal::WalError::Closed));
}

#[test]
fn test_empty_batch_is_a_noop() {
    let dir = tempdir().unwrap();
    let index = MockIndexWriter::new_shared();
    let wal = Wal::open(dir.path(), quiet_config(1), index).unwrap();

    wal.write_points(&[]).unwrap();
    assert!(wal_files(dir.path()).is_empty());
}
