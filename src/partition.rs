//! One shard of the WAL: its segment files, in-memory cache, and the
//! flush-and-compact engine.
//!
//! All partition state lives behind a single mutex. The mutex is held across
//! the segment append and fsync so per-key entry order on disk matches the
//! order in which writes returned, and is released for the long phases of a
//! flush (the index write and the segment rewrite) so writers keep going.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cursor::Cursor;
use crate::encoding::{encode_cache_entry, encode_wal_entry_into};
use crate::error::Result;
use crate::limiter::ThroughputLimiter;
use crate::segment::{
    self, compaction_file_path, segment_file_path, BlockRead, SegmentFile,
};
use crate::telemetry::{wal_metrics, WalEvent, WalEventListener};
use crate::types::{IndexWriter, Point, PointsByKey, Timestamp};

/// Flush trigger knobs, passed in by the owning log on every check.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlushThresholds {
    pub max_series_size: usize,
    pub ready_series_size: usize,
    pub compaction_threshold: f64,
    pub partition_size_threshold: u64,
}

/// Result of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushOutcome {
    Flushed {
        series: usize,
        entries: usize,
        segments_removed: usize,
    },
    /// A flush was already in progress; the call was a no-op.
    AlreadyRunning,
    /// Nothing in the cache met the flush criteria.
    Nothing,
}

pub(crate) struct Partition {
    id: u8,
    dir: PathBuf,
    max_segment_size: u64,
    events: Arc<dyn WalEventListener>,
    state: Mutex<State>,
}

struct State {
    current: Option<SegmentFile>,
    current_segment_id: u32,
    /// Encoded cache entries per key, in insertion order unless sorted.
    cache: HashMap<Vec<u8>, Vec<Vec<u8>>>,
    cache_sizes: HashMap<Vec<u8>, usize>,
    /// Keys whose list is no longer timestamp-ascending. Sticky until sorted.
    cache_dirty: HashSet<Vec<u8>>,
    /// Snapshot of series mid-flush; merged into cursors until the index
    /// writer acknowledges them.
    flush_cache: PointsByKey,
    total_size: u64,
    last_write: Instant,
    compaction_running: bool,
}

impl State {
    fn add_to_cache(&mut self, key: &[u8], timestamp: Timestamp, data: &[u8]) {
        let v = encode_cache_entry(timestamp, data);
        let len = v.len();

        if let Some(last) = self.cache.get(key).and_then(|list| list.last()) {
            if last.as_slice() >= v.as_slice() {
                self.cache_dirty.insert(key.to_vec());
            }
        }
        self.cache.entry(key.to_vec()).or_default().push(v);
        *self.cache_sizes.entry(key.to_vec()).or_insert(0) += len;
        self.total_size += len as u64;
    }
}

/// Stable sort by the 8-byte timestamp prefix, so entries with equal
/// timestamps keep their insertion order.
fn sort_entries(entries: &mut [Vec<u8>]) {
    entries.sort_by(|a, b| a[0..8].cmp(&b[0..8]));
}

impl Partition {
    pub fn new(
        id: u8,
        dir: &Path,
        max_segment_size: usize,
        events: Arc<dyn WalEventListener>,
    ) -> Self {
        Partition {
            id,
            dir: dir.to_path_buf(),
            max_segment_size: max_segment_size as u64,
            events,
            state: Mutex::new(State {
                current: None,
                current_segment_id: 0,
                cache: HashMap::new(),
                cache_sizes: HashMap::new(),
                cache_dirty: HashSet::new(),
                flush_cache: HashMap::new(),
                total_size: 0,
                last_write: Instant::now(),
                compaction_running: false,
            }),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Appends `points` as one compressed block to the active segment
    /// (rotating first if it outgrew its limit), then mirrors them into the
    /// cache. Returns only after the block is fsynced.
    pub fn write(&self, points: &[&Point]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let mut block = Vec::new();
        for p in points {
            encode_wal_entry_into(&mut block, &p.key, p.timestamp, &p.data);
        }

        let mut state = self.state.lock()?;

        let needs_rotate = match &state.current {
            None => true,
            Some(seg) => seg.size() > self.max_segment_size,
        };
        if needs_rotate {
            self.rotate_segment(&mut state)?;
        }

        state
            .current
            .as_mut()
            .expect("active segment exists after rotation")
            .append_block(&block)?;

        for p in points {
            state.add_to_cache(&p.key, p.timestamp, &p.data);
        }
        state.last_write = Instant::now();

        wal_metrics::record_points_written(points.len() as u64, block.len() as u64);
        Ok(())
    }

    fn rotate_segment(&self, state: &mut State) -> Result<()> {
        state.current_segment_id += 1;
        // Dropping the previous handle closes it; its file stays on disk
        // until compaction rewrites it.
        let path = segment_file_path(&self.dir, self.id, state.current_segment_id);
        state.current = Some(SegmentFile::create(&path)?);
        self.events.on_event(WalEvent::SegmentRotated {
            partition: self.id,
            segment_id: state.current_segment_id,
        });
        Ok(())
    }

    /// Builds a snapshot cursor for `key`, merging in-flight flush data when a
    /// flush is running and sorting the cache list first if it is dirty.
    pub fn cursor(&self, key: &[u8]) -> Result<Cursor> {
        let mut state = self.state.lock()?;

        if let Some(flushing) = state.flush_cache.get(key) {
            let mut merged = flushing.clone();
            if let Some(current) = state.cache.get(key) {
                merged.extend(current.iter().cloned());
            }
            sort_entries(&mut merged);
            return Ok(Cursor::new(merged));
        }

        if !state.cache.contains_key(key) {
            return Ok(Cursor::empty());
        }
        if state.cache_dirty.remove(key) {
            let list = state.cache.get_mut(key).expect("dirty key is cached");
            sort_entries(list);
        }
        Ok(Cursor::new(state.cache[key].clone()))
    }

    /// Whether this partition has crossed any of the flush thresholds.
    /// An empty partition never needs flushing.
    pub fn should_flush(&self, t: &FlushThresholds) -> Result<bool> {
        let state = self.state.lock()?;

        if state.cache_sizes.is_empty() {
            return Ok(false);
        }
        if state.total_size > t.partition_size_threshold {
            return Ok(true);
        }

        let mut ready = 0usize;
        for &size in state.cache_sizes.values() {
            if size > t.max_series_size {
                return Ok(true);
            }
            if size > t.ready_series_size {
                ready += 1;
            }
        }
        Ok(ready as f64 / state.cache_sizes.len() as f64 > t.compaction_threshold)
    }

    /// Whether the partition holds data but has not been written to for
    /// `interval`; such partitions get a full flush.
    pub fn needs_idle_flush(&self, interval: Duration) -> Result<bool> {
        let state = self.state.lock()?;
        Ok(!state.cache.is_empty() && state.last_write.elapsed() >= interval)
    }

    /// Flushes every series whose cache size reached `ready_series_size` (or
    /// `max_series_size`) to the index writer, then rewrites the segment
    /// files written before the flush began, dropping the flushed series.
    ///
    /// Reentrant calls while a flush is running return
    /// [`FlushOutcome::AlreadyRunning`] without touching anything.
    pub fn flush_and_compact(
        &self,
        index: &dyn IndexWriter,
        max_series_size: usize,
        ready_series_size: usize,
        throughput: Option<&ThroughputLimiter>,
    ) -> Result<FlushOutcome> {
        let flush_started = Instant::now();

        // Phase 1: pick victims and publish them as the flush cache, under
        // the lock. Rotating here lets writers continue into a fresh segment
        // while everything older is rewritten.
        let (series_to_flush, compact_files_less_than) = {
            let mut state = self.state.lock()?;
            if state.compaction_running {
                return Ok(FlushOutcome::AlreadyRunning);
            }

            let victims: Vec<Vec<u8>> = state
                .cache_sizes
                .iter()
                .filter(|(_, &size)| size >= max_series_size || size >= ready_series_size)
                .map(|(key, _)| key.clone())
                .collect();
            if victims.is_empty() {
                return Ok(FlushOutcome::Nothing);
            }
            state.compaction_running = true;

            let mut series_to_flush: PointsByKey = HashMap::with_capacity(victims.len());
            for key in victims {
                let size = state.cache_sizes.remove(&key).unwrap_or(0);
                state.total_size = state.total_size.saturating_sub(size as u64);
                let mut values = state.cache.remove(&key).unwrap_or_default();
                // The index writer contract requires time-ascending entries.
                if state.cache_dirty.remove(&key) {
                    sort_entries(&mut values);
                }
                series_to_flush.insert(key, values);
            }
            state.flush_cache = series_to_flush.clone();

            if let Err(e) = self.rotate_segment(&mut state) {
                state.flush_cache.clear();
                state.compaction_running = false;
                return Err(e);
            }
            (series_to_flush, state.current_segment_id)
        };

        let series = series_to_flush.len();
        let entries: usize = series_to_flush.values().map(|v| v.len()).sum();
        let bytes: u64 = series_to_flush
            .values()
            .flat_map(|v| v.iter())
            .map(|e| e.len() as u64)
            .sum();
        self.events.on_event(WalEvent::FlushStarted {
            partition: self.id,
            series,
            bytes,
        });

        let flushed_keys: HashSet<Vec<u8>> = series_to_flush.keys().cloned().collect();

        // Phase 2: hand the data to the index. A failure here is fatal: the
        // segments still hold every entry, so a restart replays them.
        if let Err(e) = index.write_index(series_to_flush) {
            panic!(
                "error writing WAL partition {} to the index (restart will replay): {}",
                self.id, e
            );
        }
        wal_metrics::record_flush(flush_started.elapsed(), entries as u64);

        // Phase 3: flushed data is the index's responsibility now.
        {
            let mut state = self.state.lock()?;
            state.flush_cache.clear();
        }

        // Phase 4/5: rewrite old segments without the flushed series. Always
        // return the partition to idle, even on error, so the next tick can
        // retry.
        let rewrite = self.rewrite_segments(&flushed_keys, compact_files_less_than, throughput);
        {
            let mut state = self.state.lock()?;
            state.compaction_running = false;
        }
        let segments_removed = rewrite?;

        self.events.on_event(WalEvent::CompactionCompleted {
            partition: self.id,
            segments_removed,
        });
        Ok(FlushOutcome::Flushed {
            series,
            entries,
            segments_removed,
        })
    }

    /// Rewrites every segment older than `compact_files_less_than` into a
    /// single compaction file holding only entries whose key was not flushed,
    /// then renames it into place as the new oldest segment.
    fn rewrite_segments(
        &self,
        flushed_keys: &HashSet<Vec<u8>>,
        compact_files_less_than: u32,
        throughput: Option<&ThroughputLimiter>,
    ) -> Result<usize> {
        let compaction_started = Instant::now();
        let files = segment::list_segment_files(&self.dir, self.id)?;

        let cpt_path = compaction_file_path(&self.dir, self.id);
        let mut output = SegmentFile::create_truncated(&cpt_path)?;
        let mut removed = 0usize;

        for (id, path) in files {
            if id >= compact_files_less_than {
                break;
            }

            let mut source = SegmentFile::open(&path)?;
            let mut survivors = Vec::new();
            loop {
                match source.read_next_block()? {
                    BlockRead::Entries(entries) => {
                        for e in entries {
                            if !flushed_keys.contains(&e.key) {
                                encode_wal_entry_into(&mut survivors, &e.key, e.timestamp, &e.data);
                            }
                        }
                    }
                    BlockRead::CompactionMarker(_) => continue,
                    BlockRead::Truncated { zeroed_bytes } => {
                        self.events.on_event(WalEvent::CorruptBlockRecovered {
                            path: path.clone(),
                            zeroed_bytes,
                        });
                    }
                    BlockRead::EndOfFile => break,
                }
            }

            let source_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            // Bracket each source's surviving block with markers naming it,
            // then make the triple durable before deleting the source.
            let mut written = output.append_marker(&source_name)?;
            written += output.append_block(&survivors)?;
            written += output.append_marker(&source_name)?;
            output.sync()?;
            if let Some(limiter) = throughput {
                // Billed with on-disk frame bytes, post compression.
                limiter.take(written as u64);
            }

            drop(source);
            std::fs::remove_file(&path)?;
            removed += 1;
        }

        let bytes_written = output.size();
        drop(output);

        if removed == 0 {
            // Nothing was rewritten; do not clobber a live segment with an
            // empty file.
            std::fs::remove_file(&cpt_path)?;
        } else {
            std::fs::rename(&cpt_path, segment_file_path(&self.dir, self.id, 1))?;
        }

        wal_metrics::record_compaction(compaction_started.elapsed(), bytes_written);
        Ok(removed)
    }

    /// Replays this partition's segment files into the cache. The highest
    /// segment stays open as the active one, positioned at its clean tail.
    pub fn recover(&self) -> Result<()> {
        let mut state = self.state.lock()?;

        // A leftover compaction file means a crash mid-compaction. Adopt it
        // as the oldest segment so its surviving entries stay durable; when a
        // segment with id 1 also survived, slot the adoptee in front of it.
        let cpt_path = compaction_file_path(&self.dir, self.id);
        if cpt_path.exists() {
            let preferred = segment_file_path(&self.dir, self.id, 1);
            let dest = if preferred.exists() {
                segment_file_path(&self.dir, self.id, 0)
            } else {
                preferred
            };
            std::fs::rename(&cpt_path, dest)?;
        }

        let files = segment::list_segment_files(&self.dir, self.id)?;
        let segments = files.len();
        let mut entries_replayed = 0usize;

        for (position, (segment_id, path)) in files.iter().enumerate() {
            let mut file = SegmentFile::open(path)?;
            loop {
                match file.read_next_block()? {
                    BlockRead::Entries(entries) => {
                        entries_replayed += entries.len();
                        for e in entries {
                            state.add_to_cache(&e.key, e.timestamp, &e.data);
                        }
                    }
                    BlockRead::CompactionMarker(_) => continue,
                    BlockRead::Truncated { zeroed_bytes } => {
                        self.events.on_event(WalEvent::CorruptBlockRecovered {
                            path: path.clone(),
                            zeroed_bytes,
                        });
                    }
                    BlockRead::EndOfFile => break,
                }
            }

            if position == segments - 1 {
                state.current_segment_id = *segment_id;
                state.current = Some(file);
            }
        }

        self.events.on_event(WalEvent::RecoveryCompleted {
            partition: self.id,
            segments,
            entries: entries_replayed,
        });
        Ok(())
    }

    /// Drops the caches and closes the active segment. Files stay on disk.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        state.cache.clear();
        state.cache_sizes.clear();
        state.cache_dirty.clear();
        state.flush_cache.clear();
        state.total_size = 0;
        state.current = None;
        Ok(())
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("id", &self.id)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}
