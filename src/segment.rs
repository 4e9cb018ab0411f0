//! Append-only segment files of framed, snappy-compressed entry blocks.
//!
//! A segment is named `NN.SSSSSS.wal` (`NN` = two-digit partition id,
//! `SSSSSS` = six-digit segment id). Files are opened read+write and never in
//! append mode: recovery leaves the file cursor at the last clean block
//! boundary so later appends overwrite any zero-repaired tail in place.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::encoding::{
    decode_wal_entry, encode_block_frame, encode_compaction_marker, COMPACT_SEQUENCE,
};
use crate::error::{Result, WalError};
use crate::telemetry::wal_metrics;
use crate::types::Timestamp;

/// Final extension for segment files; compaction output is `CPT` until the
/// commit rename.
pub(crate) const FILE_EXTENSION: &str = "wal";
pub(crate) const COMPACTION_EXTENSION: &str = "CPT";

/// Chunk size used when probing and zeroing a damaged tail.
const ZERO_CHUNK: usize = 512 * 1024;

pub(crate) fn segment_file_name(partition_id: u8, segment_id: u32) -> String {
    format!("{:02}.{:06}.{}", partition_id, segment_id, FILE_EXTENSION)
}

pub(crate) fn segment_file_path(dir: &Path, partition_id: u8, segment_id: u32) -> PathBuf {
    dir.join(segment_file_name(partition_id, segment_id))
}

pub(crate) fn compaction_file_path(dir: &Path, partition_id: u8) -> PathBuf {
    dir.join(format!("{:02}.{:06}.{}", partition_id, 1, COMPACTION_EXTENSION))
}

/// Parses the segment id out of a `NN.SSSSSS.wal` file name.
pub(crate) fn segment_id_from_path(path: &Path) -> Result<u32> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| WalError::SegmentName(path.to_path_buf()))?;
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 3 {
        return Err(WalError::SegmentName(path.to_path_buf()));
    }
    parts[1]
        .parse::<u32>()
        .map_err(|_| WalError::SegmentName(path.to_path_buf()))
}

/// Lists this partition's segment files in `dir`, sorted ascending by id.
pub(crate) fn list_segment_files(dir: &Path, partition_id: u8) -> Result<Vec<(u32, PathBuf)>> {
    let prefix = format!("{:02}.", partition_id);
    let suffix = format!(".{}", FILE_EXTENSION);

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with(&prefix) && name.ends_with(&suffix) {
            files.push((segment_id_from_path(&path)?, path));
        }
    }
    files.sort_by_key(|(id, _)| *id);
    Ok(files)
}

/// One decoded WAL entry, owned. Produced by the block reader, which copies
/// out of the decompressed block buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WalEntry {
    pub key: Vec<u8>,
    pub timestamp: Timestamp,
    pub data: Vec<u8>,
}

/// Outcome of reading one frame from a segment file.
#[derive(Debug)]
pub(crate) enum BlockRead {
    /// A complete block; entries were decoded.
    Entries(Vec<WalEntry>),
    /// A compaction marker naming the segment file it replaced; skip it.
    CompactionMarker(String),
    /// Clean end of data (true EOF or trailing zero padding).
    EndOfFile,
    /// A torn or corrupt frame was found at the tail. The tail was zeroed in
    /// place, synced, and the cursor rewound to the clean boundary.
    Truncated { zeroed_bytes: u64 },
}

/// An open segment file tracking its logical size (the clean write position).
#[derive(Debug)]
pub(crate) struct SegmentFile {
    file: File,
    path: PathBuf,
    size: u64,
}

impl SegmentFile {
    /// Creates (or reuses) a segment file for writing.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(SegmentFile {
            file,
            path: path.to_path_buf(),
            size: 0,
        })
    }

    /// Creates a compaction output file, discarding any stale leftover from a
    /// previous crashed compaction.
    pub fn create_truncated(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(SegmentFile {
            file,
            path: path.to_path_buf(),
            size: 0,
        })
    }

    /// Opens an existing segment positioned at the start, for replay.
    /// Write access is kept so tail repair can zero corrupt bytes.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(SegmentFile {
            file,
            path: path.to_path_buf(),
            size: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical size: bytes of clean frames written or replayed so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Compresses `raw_entries`, frames it and appends it, fsyncing before
    /// returning. A block is durable only once this returns `Ok`.
    pub fn append_block(&mut self, raw_entries: &[u8]) -> Result<usize> {
        let compressed = snap::raw::Encoder::new()
            .compress_vec(raw_entries)
            .map_err(|e| {
                WalError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })?;
        let frame = encode_block_frame(&compressed);
        self.file.write_all(&frame)?;

        let started = Instant::now();
        self.file.sync_data()?;
        wal_metrics::record_fsync(started.elapsed());

        self.size += frame.len() as u64;
        Ok(frame.len())
    }

    /// Appends a compaction marker naming `source`. Not synced on its own;
    /// callers sync after the block that follows it.
    pub fn append_marker(&mut self, source: &str) -> Result<usize> {
        let frame = encode_compaction_marker(source);
        self.file.write_all(&frame)?;
        self.size += frame.len() as u64;
        Ok(frame.len())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Reads the next frame. See [`BlockRead`] for the four outcomes; after
    /// `EndOfFile` or `Truncated` the cursor sits at the clean boundary and
    /// the file can be handed back to the writer.
    pub fn read_next_block(&mut self) -> Result<BlockRead> {
        let mut length = [0u8; 8];
        let n = read_full(&mut self.file, &mut length)?;
        if n < length.len() {
            self.file.seek(SeekFrom::Current(-(n as i64)))?;
            return Ok(BlockRead::EndOfFile);
        }

        // Compaction markers hide a file name where a block would be; the
        // true length lives in the low six bytes.
        let is_marker = length[0..2] == COMPACT_SEQUENCE;
        if is_marker {
            length[0] = 0;
            length[1] = 0;
        }
        let data_len = u64::from_be_bytes(length);

        // Trailing zeroes from an earlier tail repair read as a zero length.
        if data_len == 0 {
            self.file.seek(SeekFrom::Current(-8))?;
            return Ok(BlockRead::EndOfFile);
        }

        let mut block = Vec::new();
        let read = (&mut self.file).take(data_len).read_to_end(&mut block)? as u64;
        if read < data_len {
            self.file.seek(SeekFrom::Current(-(8 + read as i64)))?;
            let zeroed_bytes = self.zero_rest_of_file()?;
            return Ok(BlockRead::Truncated { zeroed_bytes });
        }

        if is_marker {
            self.size += 8 + read;
            return Ok(BlockRead::CompactionMarker(
                String::from_utf8_lossy(&block).into_owned(),
            ));
        }

        let buf = match snap::raw::Decoder::new().decompress_vec(&block) {
            Ok(buf) => buf,
            Err(_) => {
                self.file.seek(SeekFrom::Current(-(8 + read as i64)))?;
                let zeroed_bytes = self.zero_rest_of_file()?;
                return Ok(BlockRead::Truncated { zeroed_bytes });
            }
        };

        let mut entries = Vec::new();
        let mut offset = 0;
        while offset < buf.len() {
            let Some((consumed, key, timestamp, data)) = decode_wal_entry(&buf[offset..]) else {
                return Err(WalError::InvariantViolation {
                    details: format!("wal entry at block offset {} shorter than declared", offset),
                    path: self.path.clone(),
                });
            };
            entries.push(WalEntry {
                key: key.to_vec(),
                timestamp,
                data: data.to_vec(),
            });
            offset += consumed;
        }

        self.size += 8 + read;
        Ok(BlockRead::Entries(entries))
    }

    /// Zeroes everything from the current position to EOF so the file can be
    /// reused from here. Probes forward in 512 KiB chunks to measure the
    /// damaged span, overwrites it with zeroes, syncs, and rewinds.
    fn zero_rest_of_file(&mut self) -> Result<u64> {
        let mut chunk = vec![0u8; ZERO_CHUNK];
        let mut remaining = 0u64;
        loop {
            let n = self.file.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            remaining += n as u64;
        }
        self.file.seek(SeekFrom::Current(-(remaining as i64)))?;

        let zeroes = vec![0u8; ZERO_CHUNK];
        let mut left = remaining;
        while left > 0 {
            let n = left.min(zeroes.len() as u64) as usize;
            self.file.write_all(&zeroes[..n])?;
            left -= n as u64;
        }
        self.file.sync_data()?;
        self.file.seek(SeekFrom::Current(-(remaining as i64)))?;
        Ok(remaining)
    }
}

fn read_full(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
