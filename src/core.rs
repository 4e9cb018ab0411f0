//! Top-level WAL: partition routing, open/close lifecycle, and the background
//! flush monitor.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::cursor::Cursor;
use crate::encoding::fnv1a_64;
use crate::error::{Result, WalError};
use crate::limiter::{Limiter, ThroughputLimiter};
use crate::partition::{FlushThresholds, Partition};
use crate::telemetry::{noop_event_listener, WalEvent, WalEventListener};
use crate::types::{IndexWriter, Point};

/// Default size a segment file may grow to before rotation (2 MiB).
pub const DEFAULT_SEGMENT_SIZE: usize = 2 * 1024 * 1024;
/// Default cache size at which a series becomes eligible for flush (32 KiB).
pub const DEFAULT_READY_SERIES_SIZE: usize = 32 * 1024;
/// Default ratio of ready series that triggers a partition flush.
pub const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.5;
/// Default cache size at which a single series forces a flush (2 MiB).
pub const DEFAULT_MAX_SERIES_SIZE: usize = 2 * 1024 * 1024;
/// Default in-memory size at which a partition flushes for backpressure
/// (200 MiB). The WAL accepts writes much faster than the index absorbs them;
/// without this bound the cache would grow until the process dies.
pub const DEFAULT_PARTITION_SIZE_THRESHOLD: u64 = 200 * 1024 * 1024;
/// Default idle window after which a non-empty partition is fully flushed.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Default number of partitions. Flushes and compactions happen per
/// partition, so this controls roughly what share of the WAL compacts at once.
pub const DEFAULT_PARTITION_COUNT: u64 = 10;

/// How often the monitor checks whether partitions need flushing.
const FLUSH_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration for a [`Wal`]. All knobs have workable defaults.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Rotate the active segment once its size exceeds this many bytes.
    pub segment_size: usize,
    /// A series whose cache reaches this size is ready to flush.
    pub ready_series_size: usize,
    /// Flush a partition once this ratio of its series is ready.
    pub compaction_threshold: f64,
    /// A single series reaching this size forces a partition flush.
    pub max_series_size: usize,
    /// Flush a partition once its total cache reaches this many bytes.
    pub partition_size_threshold: u64,
    /// Fully flush a partition with no writes for this long.
    pub flush_interval: Duration,
    /// Number of partitions; must stay constant for a given WAL directory.
    pub partition_count: u64,
    /// Maximum concurrent partition flushes. Defaults to half the CPUs,
    /// clamped to `[1, CPU]`.
    pub compaction_concurrency: Option<usize>,
    /// Optional cap on compaction write throughput, in bytes per second.
    pub compaction_throughput: Option<u64>,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn WalEventListener>,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            segment_size: DEFAULT_SEGMENT_SIZE,
            ready_series_size: DEFAULT_READY_SERIES_SIZE,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            max_series_size: DEFAULT_MAX_SERIES_SIZE,
            partition_size_threshold: DEFAULT_PARTITION_SIZE_THRESHOLD,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            partition_count: DEFAULT_PARTITION_COUNT,
            compaction_concurrency: None,
            compaction_throughput: None,
            event_listener: noop_event_listener(),
        }
    }
}

enum FlusherCommand {
    Shutdown,
}

/// Partitioned write-ahead log for time-series points.
///
/// Writes are routed to partitions by an FNV-1a hash of the key, appended as
/// compressed blocks to per-partition segment files (fsynced before the write
/// returns), and mirrored into an in-memory cache served to [`Cursor`]s. A
/// background monitor flushes hot series to the injected [`IndexWriter`] and
/// compacts old segments in place.
#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    config: WalConfig,
    partitions: Arc<RwLock<HashMap<u8, Arc<Partition>>>>,
    // The sender lives under the mutex so `Wal` stays `Sync`.
    flusher: Mutex<Option<(mpsc::Sender<FlusherCommand>, JoinHandle<()>)>>,
}

impl Wal {
    /// Opens (or creates) the WAL at `path`, recovering any existing segment
    /// files, and starts the background flush monitor.
    pub fn open(
        path: impl Into<PathBuf>,
        config: WalConfig,
        index: Arc<dyn IndexWriter>,
    ) -> Result<Self> {
        let path = path.into();
        if config.partition_count == 0 || config.partition_count > 99 {
            // Two-digit partition ids are baked into the segment file names.
            return Err(WalError::Config(format!(
                "partition_count must be in [1, 99], got {}",
                config.partition_count
            )));
        }

        std::fs::create_dir_all(&path)?;
        let events = config.event_listener.clone();

        let mut map = HashMap::with_capacity(config.partition_count as usize);
        for id in 1..=config.partition_count {
            let p = Partition::new(id as u8, &path, config.segment_size, events.clone());
            map.insert(id as u8, Arc::new(p));
        }

        // Replay all partitions in parallel, bounded by the CPU count so a
        // wide WAL does not open hundreds of files at once.
        let open_limiter = Limiter::new(
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        );
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(map.len());
            for partition in map.values() {
                let limiter = &open_limiter;
                handles.push(scope.spawn(move || {
                    let _permit = limiter.acquire();
                    partition.recover()
                }));
            }
            for handle in handles {
                handle
                    .join()
                    .map_err(|_| WalError::Lock("recovery thread panicked".to_string()))??;
            }
            Ok::<(), WalError>(())
        })?;

        let partitions = Arc::new(RwLock::new(map));

        let (flusher_tx, flusher_rx) = mpsc::channel();
        let monitor_partitions = Arc::clone(&partitions);
        let monitor_config = config.clone();
        let monitor_index = Arc::clone(&index);
        let flusher = thread::Builder::new()
            .name("pointwal-flusher".to_string())
            .spawn(move || {
                flusher_loop(flusher_rx, monitor_partitions, monitor_config, monitor_index)
            })?;

        Ok(Wal {
            path,
            config,
            partitions,
            flusher: Mutex::new(Some((flusher_tx, flusher))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a batch of points. Points are grouped by partition; each
    /// partition's group is appended and fsynced as one block, all-or-nothing
    /// for that partition.
    pub fn write_points(&self, points: &[Point]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let partitions = self.partitions.read()?;
        if partitions.is_empty() {
            return Err(WalError::Closed);
        }

        let mut grouped: HashMap<u8, Vec<&Point>> = HashMap::new();
        for point in points {
            let id = partition_id(&point.key, self.config.partition_count);
            grouped.entry(id).or_default().push(point);
        }

        // A failed partition rejects only its own group; the rest of the
        // batch still goes through. The first error is reported once every
        // group has been attempted.
        let mut first_error = None;
        for (id, group) in grouped {
            let result = match partitions.get(&id) {
                Some(partition) => partition.write(&group),
                None => Err(WalError::Config(format!(
                    "no partition {} (count changed?)",
                    id
                ))),
            };
            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Returns a snapshot cursor over the cached values for `key`, merged
    /// with any in-flight flush data.
    pub fn cursor(&self, key: &[u8]) -> Result<Cursor> {
        let partitions = self.partitions.read()?;
        if partitions.is_empty() {
            return Err(WalError::Closed);
        }
        let id = partition_id(key, self.config.partition_count);
        match partitions.get(&id) {
            Some(partition) => partition.cursor(key),
            None => Ok(Cursor::empty()),
        }
    }

    /// Stops the flush monitor, waits for in-flight flushes, and closes every
    /// partition. Segment files stay on disk for the next open.
    pub fn close(&self) -> Result<()> {
        let flusher = self.flusher.lock()?.take();
        if let Some((tx, handle)) = flusher {
            let _ = tx.send(FlusherCommand::Shutdown);
            handle
                .join()
                .map_err(|_| WalError::Lock("flush monitor panicked".to_string()))?;
        }

        let mut partitions = self.partitions.write()?;
        for partition in partitions.values() {
            partition.close()?;
        }
        partitions.clear();
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Deterministic partition routing: `(fnv1a_64(key) % partition_count) + 1`.
pub(crate) fn partition_id(key: &[u8], partition_count: u64) -> u8 {
    (fnv1a_64(key) % partition_count + 1) as u8
}

fn default_compaction_concurrency() -> usize {
    let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    (cpus / 2).clamp(1, cpus)
}

/// Background monitor: every tick, flush-and-compact each partition that
/// crossed a threshold or sat idle past the flush interval. Distinct
/// partitions flush in parallel (bounded by the compaction limiter); the
/// per-partition guard makes repeat triggers no-ops.
fn flusher_loop(
    rx: Receiver<FlusherCommand>,
    partitions: Arc<RwLock<HashMap<u8, Arc<Partition>>>>,
    config: WalConfig,
    index: Arc<dyn IndexWriter>,
) {
    let events = config.event_listener.clone();
    events.on_event(WalEvent::FlusherStarted);

    let compaction_limiter = Limiter::new(
        config
            .compaction_concurrency
            .unwrap_or_else(default_compaction_concurrency),
    );
    let throughput = config.compaction_throughput.map(ThroughputLimiter::new);

    loop {
        match rx.recv_timeout(FLUSH_CHECK_INTERVAL) {
            Ok(FlusherCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        trigger_auto_flush(
            &partitions,
            &config,
            index.as_ref(),
            &compaction_limiter,
            throughput.as_ref(),
        );
    }

    events.on_event(WalEvent::FlusherStopping);
}

fn trigger_auto_flush(
    partitions: &RwLock<HashMap<u8, Arc<Partition>>>,
    config: &WalConfig,
    index: &dyn IndexWriter,
    compaction_limiter: &Limiter,
    throughput: Option<&ThroughputLimiter>,
) {
    let thresholds = FlushThresholds {
        max_series_size: config.max_series_size,
        ready_series_size: config.ready_series_size,
        compaction_threshold: config.compaction_threshold,
        partition_size_threshold: config.partition_size_threshold,
    };

    let snapshot: Vec<Arc<Partition>> = match partitions.read() {
        Ok(map) => map.values().cloned().collect(),
        Err(_) => return,
    };

    let events = config.event_listener.as_ref();
    thread::scope(|scope| {
        for partition in &snapshot {
            // An idle partition is flushed in full (ready floor of zero);
            // otherwise only series past the ready size are taken.
            let ready_floor = if partition
                .needs_idle_flush(config.flush_interval)
                .unwrap_or(false)
            {
                0
            } else if partition.should_flush(&thresholds).unwrap_or(false) {
                config.ready_series_size
            } else {
                continue;
            };

            scope.spawn(move || {
                let _permit = compaction_limiter.acquire();
                if let Err(e) = partition.flush_and_compact(
                    index,
                    config.max_series_size,
                    ready_floor,
                    throughput,
                ) {
                    events.on_event(WalEvent::FlushFailed {
                        partition: partition.id(),
                        error: e.to_string(),
                    });
                }
            });
        }
    });
}
