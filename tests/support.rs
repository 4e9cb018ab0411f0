//! Shared test doubles and helpers for the integration suites.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pointwal::{Cursor, IndexWriter, PointsByKey, Result, WalEvent, WalEventListener};

/// Index writer double that records every flush it receives.
#[derive(Debug, Default)]
pub struct MockIndexWriter {
    pub writes: Mutex<Vec<PointsByKey>>,
}

impl MockIndexWriter {
    pub fn new_shared() -> Arc<MockIndexWriter> {
        Arc::new(MockIndexWriter::default())
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    /// All series flushed so far, merged across calls.
    pub fn flushed(&self) -> PointsByKey {
        let mut merged = PointsByKey::new();
        for write in self.writes.lock().unwrap().iter() {
            for (key, values) in write {
                merged.entry(key.clone()).or_default().extend(values.iter().cloned());
            }
        }
        merged
    }
}

impl IndexWriter for MockIndexWriter {
    fn write_index(&self, points_by_key: PointsByKey) -> Result<()> {
        self.writes.lock().unwrap().push(points_by_key);
        Ok(())
    }
}

/// Event listener double that records everything the WAL emits.
#[derive(Debug, Default)]
pub struct CapturingListener {
    pub events: Mutex<Vec<WalEvent>>,
}

impl CapturingListener {
    pub fn new_shared() -> Arc<CapturingListener> {
        Arc::new(CapturingListener::default())
    }

    pub fn compaction_count(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, WalEvent::CompactionCompleted { .. }))
            .count()
    }
}

impl WalEventListener for CapturingListener {
    fn on_event(&self, event: WalEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Drains a cursor into decoded `(timestamp, payload)` pairs.
pub fn collect(cursor: &mut Cursor) -> Vec<(i64, Vec<u8>)> {
    let mut out = Vec::new();
    while let Some((ts, data)) = cursor.next() {
        out.push((
            u64::from_be_bytes(ts.try_into().unwrap()) as i64,
            data.to_vec(),
        ));
    }
    out
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    cond()
}

/// Lists `.wal` file names in a directory, sorted.
pub fn wal_files(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".wal"))
        .collect();
    names.sort();
    names
}
