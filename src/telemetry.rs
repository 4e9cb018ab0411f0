use std::path::PathBuf;
use std::sync::Arc;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly is not acceptable for
/// production. Callers provide an implementation that forwards these events to
/// `tracing`, `log`, metrics, or custom sinks.
pub trait WalEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: WalEvent);
}

/// Structured events emitted by the WAL.
#[derive(Debug, Clone)]
pub enum WalEvent {
    FlusherStarted,
    FlusherStopping,

    SegmentRotated {
        partition: u8,
        segment_id: u32,
    },

    /// A corrupt or torn block was found at a segment tail; the tail was
    /// zeroed in place and replay continued with the valid prefix.
    CorruptBlockRecovered {
        path: PathBuf,
        zeroed_bytes: u64,
    },

    RecoveryCompleted {
        partition: u8,
        segments: usize,
        entries: usize,
    },

    FlushStarted {
        partition: u8,
        series: usize,
        bytes: u64,
    },
    FlushFailed {
        partition: u8,
        error: String,
    },
    CompactionCompleted {
        partition: u8,
        segments_removed: usize,
    },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl WalEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: WalEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn WalEventListener> {
    Arc::new(NoopEventListener)
}

/// Metrics instrumentation via the `metrics` facade.
///
/// Library-safe: every recording call is a no-op until the embedding process
/// installs a recorder. Exporters are the caller's concern.
pub mod wal_metrics {
    use std::time::Duration;

    use ::metrics::{describe_counter, describe_histogram, Unit};

    // Counters are exposed as `<name>_total` by typical exporters.
    pub const POINTS_WRITTEN: &str = "pointwal_points_written";
    pub const BYTES_WRITTEN: &str = "pointwal_bytes_written";
    pub const POINTS_FLUSHED: &str = "pointwal_points_flushed";
    pub const COMPACTION_BYTES_WRITTEN: &str = "pointwal_compaction_bytes_written";

    pub const FSYNC_DURATION_SECONDS: &str = "pointwal_fsync_duration_seconds";
    pub const FLUSH_DURATION_SECONDS: &str = "pointwal_flush_duration_seconds";
    pub const COMPACTION_DURATION_SECONDS: &str = "pointwal_compaction_duration_seconds";

    #[inline]
    pub fn record_points_written(points: u64, bytes: u64) {
        if points > 0 {
            ::metrics::counter!(POINTS_WRITTEN).increment(points);
            ::metrics::counter!(BYTES_WRITTEN).increment(bytes);
        }
    }

    #[inline]
    pub fn record_fsync(duration: Duration) {
        ::metrics::histogram!(FSYNC_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    #[inline]
    pub fn record_flush(duration: Duration, entries: u64) {
        ::metrics::histogram!(FLUSH_DURATION_SECONDS).record(duration.as_secs_f64());
        if entries > 0 {
            ::metrics::counter!(POINTS_FLUSHED).increment(entries);
        }
    }

    #[inline]
    pub fn record_compaction(duration: Duration, bytes_written: u64) {
        ::metrics::histogram!(COMPACTION_DURATION_SECONDS).record(duration.as_secs_f64());
        if bytes_written > 0 {
            ::metrics::counter!(COMPACTION_BYTES_WRITTEN).increment(bytes_written);
        }
    }

    /// Registers descriptions for all metrics. Safe to call more than once.
    pub fn describe_all() {
        describe_counter!(
            POINTS_WRITTEN,
            Unit::Count,
            "Total number of points accepted by Wal::write_points."
        );
        describe_counter!(
            BYTES_WRITTEN,
            Unit::Bytes,
            "Total uncompressed WAL entry bytes appended to segment files."
        );
        describe_counter!(
            POINTS_FLUSHED,
            Unit::Count,
            "Total number of cache entries handed to the index writer."
        );
        describe_counter!(
            COMPACTION_BYTES_WRITTEN,
            Unit::Bytes,
            "Total bytes written to compaction output files."
        );

        describe_histogram!(
            FSYNC_DURATION_SECONDS,
            Unit::Seconds,
            "Duration of segment fsync calls on the write path."
        );
        describe_histogram!(
            FLUSH_DURATION_SECONDS,
            Unit::Seconds,
            "Time from flush victim selection to index writer acknowledgement."
        );
        describe_histogram!(
            COMPACTION_DURATION_SECONDS,
            Unit::Seconds,
            "Time spent rewriting segment files after a flush."
        );
    }
}
