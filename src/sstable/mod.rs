//! Sorted String Table (SSTable) Module
//!
//! This module implements the **immutable**, **disk-backed** sorted table
//! files produced by memtable flushes and compaction.  Each table stores its
//! records up front and a keyed offset index at the tail, so a point lookup
//! is one in-memory index probe plus one record read.
//!
//! # On-disk layout
//!
//! ```text
//! [ {u32 key_len, key, u32 val_len, val}* ]   records, sorted by key
//! [ {u32 key_len, key, u64 offset}* ]         tail index, sorted by key
//! [ u32 entry_count ]
//! [ u32 index_len ]                           last 4 bytes of the file
//! ```
//!
//! All integers are little-endian.  `index_len` covers the index entries
//! plus `entry_count`.  A record with `val_len == u32::MAX` is a
//! **tombstone** and carries no value bytes; a record with `val_len == 0`
//! is a legitimate empty value.  The two are never conflated.
//!
//! # Concurrency model
//!
//! - SSTables are **immutable**: once [`TableBuilder::finish`] renames the
//!   temporary file into place, its bytes never change.
//! - Reads go through a shared [`memmap2::Mmap`] and are lock-free; any
//!   number of threads may read the same table concurrently.
//!
//! # Failure handling
//!
//! A table whose tail fails to parse is unreadable as a whole.  [`SSTable::open`]
//! reports this as an error; the LSM layer skips such files with a warning
//! rather than failing engine open, accepting that reads may miss the data
//! they contained.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod builder;

#[cfg(test)]
mod tests;

pub use builder::TableBuilder;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BTreeMap,
    fs::File,
    io,
    path::{Path, PathBuf},
};

use memmap2::Mmap;
use thiserror::Error;
use tracing::trace;

use crate::encoding::{Decode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// File extension for table files.
pub const TABLE_FILE_EXT: &str = "sst";

/// Sentinel `val_len` marking a record as a tombstone.
pub(crate) const TOMBSTONE_VALUE_LEN: u32 = u32::MAX;

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations (open, read, build).
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Structurally invalid file content.
    #[error("Corrupt table: {0}")]
    Corrupt(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Read results
// ------------------------------------------------------------------------------------------------

/// Result of a point lookup against one table.
#[derive(Debug, Clone, PartialEq)]
pub enum TableGetResult {
    /// A live value for the key.
    Value(Vec<u8>),

    /// The key is tombstoned in this table; older tables must not be
    /// consulted.
    Tombstone,

    /// The key does not appear in this table's index.
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// SSTable reader
// ------------------------------------------------------------------------------------------------

/// An open, immutable, memory-mapped sorted table.
pub struct SSTable {
    /// LSM level this table belongs to, parsed from the filename.
    level: u8,

    /// Creation timestamp in milliseconds, parsed from the filename.
    /// Orders tables within a level; the greatest value wins merges.
    created_at: u64,

    /// Path of the table file.
    path: PathBuf,

    /// Read-only mapping of the whole file.
    mmap: Mmap,

    /// Tail index: key → record offset.
    index: BTreeMap<Vec<u8>, u64>,
}

impl std::fmt::Debug for SSTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTable")
            .field("level", &self.level)
            .field("created_at", &self.created_at)
            .field("path", &self.path)
            .field("entries", &self.index.len())
            .finish_non_exhaustive()
    }
}

impl SSTable {
    /// Opens a table file and parses its tail index into memory.
    ///
    /// The level and creation timestamp come from the
    /// `level_<L>_<ms>.sst` filename. Any structural problem — bad name,
    /// short file, out-of-bounds index — yields an error; callers decide
    /// whether to skip or propagate.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SSTableError> {
        let path = path.as_ref().to_path_buf();

        let (level, created_at) = parse_table_name(&path).ok_or_else(|| {
            SSTableError::Corrupt(format!("unrecognized table name: {}", path.display()))
        })?;

        let file = File::open(&path)?;
        // SAFETY: the file is never modified after finish(); the engine
        // deletes tables only after dropping their readers.
        let mmap = unsafe { Mmap::map(&file)? };
        let data: &[u8] = &mmap;

        if data.len() < 2 * U32_SIZE {
            return Err(SSTableError::Corrupt(format!(
                "file too short for a tail index ({} bytes)",
                data.len()
            )));
        }

        let index_len = read_u32_at(data, data.len() - U32_SIZE)? as usize;
        if index_len < U32_SIZE || index_len > data.len() - U32_SIZE {
            return Err(SSTableError::Corrupt(format!(
                "index length {index_len} out of bounds for {}-byte file",
                data.len()
            )));
        }

        let index_start = data.len() - U32_SIZE - index_len;
        let index_region = &data[index_start..data.len() - U32_SIZE];
        let entry_count = read_u32_at(index_region, index_region.len() - U32_SIZE)? as usize;

        let mut index = BTreeMap::new();
        let entries_bytes = &index_region[..index_region.len() - U32_SIZE];
        let mut offset = 0usize;
        for _ in 0..entry_count {
            let (key, n) = Vec::<u8>::decode_from(&entries_bytes[offset..])?;
            offset += n;
            let (record_offset, n) = u64::decode_from(&entries_bytes[offset..])?;
            offset += n;

            if record_offset as usize >= index_start {
                return Err(SSTableError::Corrupt(format!(
                    "record offset {record_offset} points into the tail index"
                )));
            }
            index.insert(key, record_offset);
        }
        if offset != entries_bytes.len() {
            return Err(SSTableError::Corrupt(format!(
                "index region has {} undecoded bytes",
                entries_bytes.len() - offset
            )));
        }

        trace!(
            path = %path.display(),
            level,
            created_at,
            entries = index.len(),
            "SSTable opened"
        );

        Ok(Self {
            level,
            created_at,
            path,
            mmap,
            index,
        })
    }

    /// Looks up one key via the tail index.
    pub fn get(&self, key: &[u8]) -> Result<TableGetResult, SSTableError> {
        let Some(&offset) = self.index.get(key) else {
            return Ok(TableGetResult::NotFound);
        };
        let (stored_key, value) = self.read_record(offset)?;
        if stored_key != key {
            return Err(SSTableError::Corrupt(format!(
                "index points at a record for a different key (offset {offset})"
            )));
        }
        Ok(match value {
            Some(value) => TableGetResult::Value(value),
            None => TableGetResult::Tombstone,
        })
    }

    /// Reads every record in key order. `None` values are tombstones.
    ///
    /// Used by compaction, which folds whole tables into a merge map.
    pub fn read_all(&self) -> Result<Vec<(Vec<u8>, Option<Vec<u8>>)>, SSTableError> {
        let mut records = Vec::with_capacity(self.index.len());
        for &offset in self.index.values() {
            records.push(self.read_record(offset)?);
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }

    /// LSM level of this table.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Creation timestamp (ms) from the filename.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of keys in the tail index.
    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Smallest key in the table.
    pub fn min_key(&self) -> Option<&[u8]> {
        self.index.keys().next().map(|k| k.as_slice())
    }

    /// Largest key in the table.
    pub fn max_key(&self) -> Option<&[u8]> {
        self.index.keys().next_back().map(|k| k.as_slice())
    }

    /// Whether the index contains `key` at all.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    /// Decodes the record starting at `offset`; `None` is a tombstone.
    fn read_record(&self, offset: u64) -> Result<(Vec<u8>, Option<Vec<u8>>), SSTableError> {
        let data: &[u8] = &self.mmap;
        let mut pos = offset as usize;

        let key_len = read_u32_at(data, pos)? as usize;
        pos += U32_SIZE;
        let key = read_slice_at(data, pos, key_len)?.to_vec();
        pos += key_len;

        let val_len = read_u32_at(data, pos)?;
        pos += U32_SIZE;
        if val_len == TOMBSTONE_VALUE_LEN {
            return Ok((key, None));
        }
        let value = read_slice_at(data, pos, val_len as usize)?.to_vec();
        Ok((key, Some(value)))
    }
}

// ------------------------------------------------------------------------------------------------
// File-name helpers
// ------------------------------------------------------------------------------------------------

/// Builds the canonical `level_<L>_<ms>.sst` file name.
pub(crate) fn table_file_name(level: u8, created_at: u64) -> String {
    format!("level_{level}_{created_at}.{TABLE_FILE_EXT}")
}

/// Parses `(level, created_at)` out of a `level_<L>_<ms>.sst` path.
pub(crate) fn parse_table_name(path: &Path) -> Option<(u8, u64)> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(&format!(".{TABLE_FILE_EXT}"))?;
    let rest = stem.strip_prefix("level_")?;
    let (level_str, ts_str) = rest.split_once('_')?;
    Some((level_str.parse().ok()?, ts_str.parse().ok()?))
}

// ------------------------------------------------------------------------------------------------
// Bounds-checked raw reads
// ------------------------------------------------------------------------------------------------

fn read_u32_at(data: &[u8], pos: usize) -> Result<u32, SSTableError> {
    let bytes: [u8; 4] = read_slice_at(data, pos, U32_SIZE)?
        .try_into()
        .map_err(|_| SSTableError::Internal("slice-to-array conversion failed".into()))?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_slice_at(data: &[u8], pos: usize, len: usize) -> Result<&[u8], SSTableError> {
    let end = pos
        .checked_add(len)
        .ok_or_else(|| SSTableError::Corrupt("record extent overflows".into()))?;
    if end > data.len() {
        return Err(SSTableError::Corrupt(format!(
            "read of {len} bytes at {pos} exceeds {}-byte file",
            data.len()
        )));
    }
    Ok(&data[pos..end])
}
