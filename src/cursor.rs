//! Forward cursor over a partition's cached values for one key.

/// Forward iterator over encoded cache entries (`timestamp | data`).
///
/// A cursor is a snapshot: the partition hands it a freshly allocated list
/// under its lock, so concurrent writers never mutate what the cursor reads.
#[derive(Debug, Default)]
pub struct Cursor {
    cache: Vec<Vec<u8>>,
    /// Index of the entry the next `next()` call returns.
    next_index: usize,
}

impl Cursor {
    pub(crate) fn new(cache: Vec<Vec<u8>>) -> Self {
        Cursor {
            cache,
            next_index: 0,
        }
    }

    pub(crate) fn empty() -> Self {
        Cursor::default()
    }

    /// Positions the cursor at the first entry whose 8-byte timestamp prefix
    /// is `>=` `seek` (lexicographically; `seek` may be shorter than 8 bytes)
    /// and returns that entry as `(timestamp bytes, payload)`, or `None` if no
    /// entry is at or after the target.
    pub fn seek(&mut self, seek: &[u8]) -> Option<(&[u8], &[u8])> {
        for (i, entry) in self.cache.iter().enumerate() {
            if &entry[0..8] >= seek {
                self.next_index = i + 1;
                return Some((&entry[0..8], &entry[8..]));
            }
        }
        self.next_index = self.cache.len();
        None
    }

    /// Returns the next `(timestamp bytes, payload)` pair, or `None` once the
    /// cursor is exhausted.
    pub fn next(&mut self) -> Option<(&[u8], &[u8])> {
        let entry = self.cache.get(self.next_index)?;
        self.next_index += 1;
        Some((&entry[0..8], &entry[8..]))
    }
}
