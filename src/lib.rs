#![doc = r#"
pointwal: Partitioned Write-Ahead Log for Time-Series Points

This crate provides a crash-safe, append-only, compressed on-disk log for
time-series points, with support for:
- Hash-partitioned segment files with per-partition compaction
- An in-memory per-series cache served through forward cursors
- Background flushing of hot series to an injected index writer
- In-place compaction that reclaims space from already-flushed series
- Recovery that repairs torn segment tails in place

A point is an opaque `(key, timestamp, payload)` triple. Writes are fsynced
before they return; on restart the WAL replays its segment files and resumes
exactly where it left off.
"#]

// Declare modules
mod cursor;
mod limiter;
mod partition;
mod segment;

pub mod core;
pub mod encoding;
pub mod error;
pub mod telemetry;
pub mod types;

/// Main entry point: the partitioned write-ahead log.
pub use crate::core::{Wal, WalConfig};
/// Tuning defaults.
pub use crate::core::{
    DEFAULT_COMPACTION_THRESHOLD, DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_SERIES_SIZE,
    DEFAULT_PARTITION_COUNT, DEFAULT_PARTITION_SIZE_THRESHOLD, DEFAULT_READY_SERIES_SIZE,
    DEFAULT_SEGMENT_SIZE,
};
/// Forward iterator over one key's cached values.
pub use crate::cursor::Cursor;
/// Error type for WAL operations.
pub use crate::error::{Result, WalError};
/// Structured event hook for observability.
pub use crate::telemetry::{noop_event_listener, WalEvent, WalEventListener};
/// Input point and the downstream index contract.
pub use crate::types::{IndexWriter, Point, PointsByKey, Timestamp};
