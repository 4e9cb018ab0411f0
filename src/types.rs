use std::collections::HashMap;

use crate::error::Result;

/// Timestamp type (nanoseconds since epoch).
pub type Timestamp = i64;

/// Cache entries grouped by series key, each entry being the encoded
/// `timestamp | data` form produced by [`crate::encoding::encode_cache_entry`].
pub type PointsByKey = HashMap<Vec<u8>, Vec<Vec<u8>>>;

/// A single time-series point as handed to the WAL.
///
/// Keys are opaque byte strings; the WAL only ever compares them for equality
/// and hashes them for partition routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Point {
    pub key: Vec<u8>,
    pub timestamp: Timestamp,
    pub data: Vec<u8>,
}

impl Point {
    pub fn new(key: impl Into<Vec<u8>>, timestamp: Timestamp, data: impl Into<Vec<u8>>) -> Self {
        Point {
            key: key.into(),
            timestamp,
            data: data.into(),
        }
    }
}

/// Downstream index the WAL flushes cached series into.
///
/// The value lists are encoded cache entries sorted ascending by timestamp.
/// Once `write_index` returns `Ok`, the WAL is free to drop those entries and
/// compact them out of its segment files; a failure is treated as fatal by the
/// flush engine (the on-disk log still holds the data, so a restart replays it).
pub trait IndexWriter: Send + Sync {
    fn write_index(&self, points_by_key: PointsByKey) -> Result<()>;
}
